//! End-to-end happy path test.
//!
//! Runs the broker against the simulated resource manager and delivers
//! notifications over HTTP to a mock client callback, verifying:
//!
//! 1. Register is idempotent and rejects a conflicting address
//! 2. A gang reserve pinned to a node is allocated and notified
//! 3. A released allocation is cached and reassigned without negotiation
//! 4. A release that skips the cache cannot be reassigned
//! 5. Unregister succeeds twice
//!
//! ## Running
//!
//! ```bash
//! cargo test -p rmb-e2e --test happy_path
//! ```

use std::sync::Arc;
use std::time::Duration;

use rmb_broker::config::Config;
use rmb_broker::connector::{SimulatedConfig, SimulatedNode, SimulatedResourceManager};
use rmb_broker::dispatcher::HttpNotificationSink;
use rmb_broker::service::{RegisterRequest, UnregisterRequest};
use rmb_broker::{BrokerService, StatusCode};
use rmb_events::{AllocationEvent, Enforcement, Notification, ResourceRequest, ResourceStatus};
use rmb_id::{ClientId, ResourceId};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Start a mock client accepting every notification.
async fn start_callback() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/notifications"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    server
}

/// Wait until the callback has received at least `count` events.
async fn wait_for_events(server: &MockServer, count: usize) -> Vec<AllocationEvent> {
    let max_wait = Duration::from_secs(10);
    let start = std::time::Instant::now();

    loop {
        let events: Vec<AllocationEvent> = server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .flat_map(|request| {
                let notification: Notification = request.body_json().unwrap();
                assert!(notification.is_ordered());
                notification.events
            })
            .collect();
        if events.len() >= count {
            return events;
        }
        if start.elapsed() > max_wait {
            panic!("callback received {} of {count} events", events.len());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn e2e_happy_path_register_reserve_release() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,rmb_broker=debug".into()),
        )
        .with_test_writer()
        .try_init();

    let callback = start_callback().await;
    let host = callback.address().ip().to_string();
    let port = i64::from(callback.address().port());

    let backend = Arc::new(SimulatedResourceManager::new(SimulatedConfig {
        nodes: vec![
            SimulatedNode::new("node-A", 4, 8192),
            SimulatedNode::new("node-B", 4, 8192),
        ],
        auto_grant: true,
    }));
    let sink = Arc::new(HttpNotificationSink::new(Duration::from_secs(5)).unwrap());
    let broker = BrokerService::new(
        &Config::default(),
        backend.clone(),
        sink,
        tokio::runtime::Handle::current(),
    );
    broker.start().await.unwrap();

    // 1. Register twice with the same address, then with a different port.
    let c1 = ClientId::new();
    let first = broker
        .register(RegisterRequest::new(c1, host.clone(), port))
        .await;
    assert!(first.status.is_ok());
    let h1 = first.handle.unwrap();

    let again = broker
        .register(RegisterRequest::new(c1, host.clone(), port))
        .await;
    assert_eq!(again.handle, Some(h1));

    let conflict = broker
        .register(RegisterRequest::new(c1, host.clone(), port + 1))
        .await;
    assert_eq!(conflict.status.code, StatusCode::RequestError);
    assert!(broker.registry().resolve(h1).await.is_some());

    // 2. Gang reserve pinned to node-A.
    let r1 = ResourceRequest::new("default", 1, 1024).at("node-A", Enforcement::Must);
    let r1_id = r1.resource_id;
    broker.reserve(h1, vec![r1], true).await.unwrap();

    let events = wait_for_events(&callback, 1).await;
    let allocated = &events[0];
    assert_eq!(allocated.resource_id, r1_id);
    assert_eq!(allocated.status, ResourceStatus::Allocated);
    assert_eq!(allocated.cpu_vcores(), Some(1));
    assert_eq!(allocated.memory_mb(), Some(1024));
    assert_eq!(allocated.location(), Some("node-A"));
    let rm_id = allocated.rm_resource_id().cloned().unwrap();

    // 3. Release into the cache and reassign to a new request id.
    broker.release(h1, &[r1_id], false).await.unwrap();
    assert!(broker.connector().is_cached(&rm_id).await);

    let r2_id = ResourceId::new();
    assert!(broker.reassign_resource(h1, &rm_id, r2_id).await.unwrap());

    let negotiations = backend.negotiations();
    let r2 = ResourceRequest::new("default", 1, 1024).with_resource_id(r2_id);
    broker.reserve(h1, vec![r2], false).await.unwrap();

    let events = wait_for_events(&callback, 2).await;
    let reassigned = &events[1];
    assert_eq!(reassigned.resource_id, r2_id);
    assert_eq!(reassigned.rm_resource_id(), Some(&rm_id));
    assert!(reassigned.generation > allocated.generation);
    assert_eq!(backend.negotiations(), negotiations);

    // 4. Release without caching.
    broker.release(h1, &[r2_id], true).await.unwrap();
    assert_eq!(broker.connector().cached().await, 0);
    assert!(!broker
        .reassign_resource(h1, &rm_id, ResourceId::new())
        .await
        .unwrap());

    // 5. Unregister is idempotent.
    assert!(broker.unregister(UnregisterRequest::new(h1)).await.status.is_ok());
    assert!(broker.unregister(UnregisterRequest::new(h1)).await.status.is_ok());

    broker.stop().await.unwrap();
    assert_eq!(backend.outstanding_grants().await, 0);
}
