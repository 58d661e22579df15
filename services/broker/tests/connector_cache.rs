//! Integration tests for the caching connector.
//!
//! Drives `CachingConnector` against the simulated resource manager and
//! checks what a listener observes:
//! 1. Grants, rejections and revocations arrive as events
//! 2. Released allocations are cached, reassigned or returned upstream
//! 3. Grants racing with a release are reclaimed instead of leaked

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rmb_broker::cache::CacheConfig;
use rmb_broker::connector::{
    AllocationListener, CachingConnector, ResourceManagerConnector, SimulatedConfig,
    SimulatedNode, SimulatedResourceManager,
};
use rmb_broker::metrics::BrokerMetrics;
use rmb_broker::{BrokerError, StatusCode};
use rmb_events::{
    AllocationEvent, Enforcement, EventError, ResourceRequest, ResourceStatus, RmResourceId,
};
use rmb_id::ResourceId;
use tokio::sync::mpsc;

const QUEUE: &str = "default";

struct ChannelListener {
    tx: mpsc::UnboundedSender<AllocationEvent>,
    stopped: AtomicBool,
}

impl AllocationListener for ChannelListener {
    fn on_events(&self, events: Vec<AllocationEvent>) {
        for event in events {
            let _ = self.tx.send(event);
        }
    }

    fn on_stopped_by_rm(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

struct Harness {
    backend: Arc<SimulatedResourceManager>,
    connector: CachingConnector,
    listener: Arc<ChannelListener>,
    events: mpsc::UnboundedReceiver<AllocationEvent>,
    metrics: Arc<BrokerMetrics>,
}

impl Harness {
    async fn start(backend: SimulatedResourceManager, cache: CacheConfig) -> Self {
        let backend = Arc::new(backend);
        let metrics = Arc::new(BrokerMetrics::new());
        let connector = CachingConnector::new(backend.clone(), cache, Arc::clone(&metrics));
        let (tx, events) = mpsc::unbounded_channel();
        let listener = Arc::new(ChannelListener {
            tx,
            stopped: AtomicBool::new(false),
        });
        connector.set_listener(listener.clone());
        connector.start().await.unwrap();
        connector.register_queue(QUEUE).await.unwrap();

        Self {
            backend,
            connector,
            listener,
            events,
            metrics,
        }
    }

    async fn default() -> Self {
        Self::start(
            SimulatedResourceManager::new(SimulatedConfig::default()),
            CacheConfig::default(),
        )
        .await
    }

    async fn next_event(&mut self) -> AllocationEvent {
        tokio::time::timeout(Duration::from_secs(2), self.events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("listener channel closed")
    }

    /// Reserves one request and waits for its grant.
    async fn allocate(&mut self, request: ResourceRequest) -> RmResourceId {
        let id = request.resource_id;
        self.connector.reserve(vec![request], false).await.unwrap();
        let event = self.next_event().await;
        assert_eq!(event.resource_id, id);
        assert_eq!(event.status, ResourceStatus::Allocated);
        event.rm_resource_id().cloned().unwrap()
    }
}

async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn small() -> ResourceRequest {
    ResourceRequest::new(QUEUE, 1, 1024)
}

#[tokio::test]
async fn test_gang_reserve_delivers_allocation() {
    let mut h = Harness::default().await;
    let request = small().at("node-a", Enforcement::Must);
    let id = request.resource_id;

    h.connector.reserve(vec![request], true).await.unwrap();
    let event = h.next_event().await;

    assert_eq!(event.resource_id, id);
    assert_eq!(event.status, ResourceStatus::Allocated);
    assert_eq!(event.cpu_vcores(), Some(1));
    assert_eq!(event.memory_mb(), Some(1024));
    assert_eq!(event.location(), Some("node-a"));
    assert_eq!(event.generation, 1);
}

#[tokio::test]
async fn test_release_caches_and_reassigns_once() {
    let mut h = Harness::default().await;
    let r1 = small().at("node-a", Enforcement::Must);
    let r1_id = r1.resource_id;
    let rm_id = h.allocate(r1).await;

    h.connector.release(&[r1_id], false).await.unwrap();
    assert_eq!(h.connector.cached().await, 1);
    assert!(h.backend.is_granted(&rm_id).await);

    let r2 = ResourceId::new();
    assert!(h.connector.reassign_resource(&rm_id, r2).await);
    assert!(!h.connector.reassign_resource(&rm_id, ResourceId::new()).await);

    let negotiations = h.backend.negotiations();
    h.connector
        .reserve(vec![small().with_resource_id(r2)], false)
        .await
        .unwrap();
    let event = h.next_event().await;

    assert_eq!(event.resource_id, r2);
    assert_eq!(event.rm_resource_id(), Some(&rm_id));
    assert_eq!(h.backend.negotiations(), negotiations);
}

#[tokio::test]
async fn test_reassign_of_unknown_allocation() {
    let h = Harness::default().await;
    assert!(
        !h.connector
            .reassign_resource(&RmResourceId::new("container_999999"), ResourceId::new())
            .await
    );
}

#[tokio::test]
async fn test_release_without_cache_returns_upstream() {
    let mut h = Harness::default().await;
    let r1 = small();
    let r1_id = r1.resource_id;
    let rm_id = h.allocate(r1).await;

    h.connector.release(&[r1_id], true).await.unwrap();
    assert_eq!(h.connector.cached().await, 0);
    assert!(!h.connector.reassign_resource(&rm_id, ResourceId::new()).await);

    let backend = Arc::clone(&h.backend);
    wait_until(|| {
        let backend = Arc::clone(&backend);
        async move { backend.outstanding_grants().await == 0 }
    })
    .await;
}

#[tokio::test]
async fn test_reserve_served_from_cache() {
    let mut h = Harness::default().await;
    let r1 = small().at("node-b", Enforcement::Must);
    let r1_id = r1.resource_id;
    let rm_id = h.allocate(r1).await;
    h.connector.release(&[r1_id], false).await.unwrap();

    let negotiations = h.backend.negotiations();
    let r2 = small();
    let r2_id = r2.resource_id;
    h.connector.reserve(vec![r2], false).await.unwrap();
    let event = h.next_event().await;

    assert_eq!(event.resource_id, r2_id);
    assert_eq!(event.rm_resource_id(), Some(&rm_id));
    assert_eq!(h.backend.negotiations(), negotiations);
    assert_eq!(h.metrics.snapshot(0).cache_hits, 1);
    assert_eq!(h.connector.cached().await, 0);
}

#[tokio::test]
async fn test_must_request_skips_cache_on_other_node() {
    let mut h = Harness::default().await;
    let r1 = small().at("node-a", Enforcement::Must);
    let r1_id = r1.resource_id;
    let cached_rm = h.allocate(r1).await;
    h.connector.release(&[r1_id], false).await.unwrap();

    let negotiations = h.backend.negotiations();
    let fresh_rm = h.allocate(small().at("node-b", Enforcement::Must)).await;

    assert_ne!(fresh_rm, cached_rm);
    assert_eq!(h.backend.negotiations(), negotiations + 1);
    assert!(h.connector.is_cached(&cached_rm).await);
}

#[tokio::test]
async fn test_gang_bypasses_cache() {
    let mut h = Harness::default().await;
    let r1 = small();
    let r1_id = r1.resource_id;
    let cached_rm = h.allocate(r1).await;
    h.connector.release(&[r1_id], false).await.unwrap();

    let negotiations = h.backend.negotiations();
    h.connector.reserve(vec![small()], true).await.unwrap();
    let event = h.next_event().await;

    assert_ne!(event.rm_resource_id(), Some(&cached_rm));
    assert_eq!(h.backend.negotiations(), negotiations + 1);
    assert_eq!(h.connector.cached().await, 1);
}

#[tokio::test]
async fn test_empty_cache_is_synchronous() {
    let mut h = Harness::default().await;
    let r1 = small();
    let r1_id = r1.resource_id;
    let rm_id = h.allocate(r1).await;
    h.connector.release(&[r1_id], false).await.unwrap();

    assert_eq!(h.connector.empty_cache().await, 1);
    assert_eq!(h.backend.outstanding_grants().await, 0);
    assert!(!h.connector.reassign_resource(&rm_id, ResourceId::new()).await);
    assert_eq!(h.connector.empty_cache().await, 0);
}

#[tokio::test]
async fn test_grant_after_release_is_reclaimed() {
    let mut h = Harness::start(
        SimulatedResourceManager::manual(vec![SimulatedNode::new("node-a", 4, 4096)]),
        CacheConfig::default(),
    )
    .await;

    let r1 = small();
    let r1_id = r1.resource_id;
    h.connector.reserve(vec![r1], false).await.unwrap();
    let backend = Arc::clone(&h.backend);
    wait_until(|| {
        let backend = Arc::clone(&backend);
        async move { backend.waiting_asks().await == 1 }
    })
    .await;

    // Keep the cancel from reaching the backend so the grant wins the race.
    h.backend.set_reachable(false);
    h.connector.release(&[r1_id], false).await.unwrap();
    assert_eq!(h.backend.grant_waiting().await, 1);

    let connector = &h.connector;
    wait_until(|| async move { connector.cached().await == 1 }).await;
    h.backend.set_reachable(true);

    assert!(h.events.try_recv().is_err());
    let rm_id = RmResourceId::new("container_000001");
    assert!(h.backend.is_granted(&rm_id).await);
    assert!(h.connector.reassign_resource(&rm_id, ResourceId::new()).await);
}

#[tokio::test]
async fn test_release_pending_cancels_ask() {
    let mut h = Harness::start(
        SimulatedResourceManager::manual(vec![SimulatedNode::new("node-a", 4, 4096)]),
        CacheConfig::default(),
    )
    .await;

    let r1 = small();
    let r1_id = r1.resource_id;
    h.connector.reserve(vec![r1], false).await.unwrap();
    h.connector.release(&[r1_id], false).await.unwrap();

    let backend = Arc::clone(&h.backend);
    wait_until(|| {
        let backend = Arc::clone(&backend);
        async move { backend.waiting_asks().await == 0 && backend.negotiations() == 1 }
    })
    .await;

    assert_eq!(h.backend.grant_waiting().await, 0);
    assert!(h.events.try_recv().is_err());
}

#[tokio::test]
async fn test_release_hands_allocation_to_pending_request() {
    let mut h = Harness::start(
        SimulatedResourceManager::new(SimulatedConfig {
            nodes: vec![SimulatedNode::new("node-a", 1, 1024)],
            auto_grant: true,
        }),
        CacheConfig::default(),
    )
    .await;

    let r1 = small();
    let r1_id = r1.resource_id;
    let rm_id = h.allocate(r1).await;

    let r2 = small();
    let r2_id = r2.resource_id;
    h.connector.reserve(vec![r2], false).await.unwrap();
    h.connector.release(&[r1_id], false).await.unwrap();

    let event = h.next_event().await;
    assert_eq!(event.resource_id, r2_id);
    assert_eq!(event.rm_resource_id(), Some(&rm_id));
    assert_eq!(h.connector.cached().await, 0);

    let backend = Arc::clone(&h.backend);
    wait_until(|| {
        let backend = Arc::clone(&backend);
        async move { backend.waiting_asks().await == 0 }
    })
    .await;
    assert_eq!(h.backend.outstanding_grants().await, 1);
}

#[tokio::test]
async fn test_preemption_reported_in_order() {
    let mut h = Harness::default().await;
    let r1 = small();
    let r1_id = r1.resource_id;
    h.connector.reserve(vec![r1], false).await.unwrap();
    let allocated = h.next_event().await;
    let rm_id = allocated.rm_resource_id().cloned().unwrap();

    assert!(h.backend.preempt(&rm_id).await);
    let preempted = h.next_event().await;

    assert_eq!(preempted.resource_id, r1_id);
    assert_eq!(preempted.status, ResourceStatus::Preempted);
    assert!(preempted.allocation.is_none());
    assert!(preempted.generation > allocated.generation);
}

#[tokio::test]
async fn test_lost_cached_allocation_is_dropped_silently() {
    let mut h = Harness::default().await;
    let r1 = small();
    let r1_id = r1.resource_id;
    let rm_id = h.allocate(r1).await;
    h.connector.release(&[r1_id], false).await.unwrap();

    assert!(h.backend.lose(&rm_id).await);
    let connector = &h.connector;
    wait_until(|| async move { connector.cached().await == 0 }).await;

    assert!(h.events.try_recv().is_err());
    assert!(!h.connector.reassign_resource(&rm_id, ResourceId::new()).await);
}

#[tokio::test]
async fn test_infeasible_request_rejected() {
    let mut h = Harness::default().await;
    let request = small().at("node-z", Enforcement::Must);
    let id = request.resource_id;

    h.connector.reserve(vec![request], false).await.unwrap();
    let event = h.next_event().await;

    assert_eq!(event.resource_id, id);
    assert_eq!(event.status, ResourceStatus::Rejected);
}

#[tokio::test]
async fn test_malformed_requests_fail_synchronously() {
    let mut h = Harness::default().await;
    let request = small();
    let id = request.resource_id;
    h.allocate(request.clone()).await;

    let err = h.connector.reserve(vec![request], false).await.unwrap_err();
    assert!(matches!(
        err,
        BrokerError::InvalidRequest(EventError::DuplicateResourceId(dup)) if dup == id
    ));
    assert_eq!(err.status_code(), StatusCode::RequestError);

    let err = h
        .connector
        .reserve(vec![ResourceRequest::new(QUEUE, -1, 1024)], false)
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::InvalidRequest(_)));
}

#[tokio::test]
async fn test_unreachable_resource_manager() {
    let h = Harness::default().await;
    h.backend.set_reachable(false);

    let err = h.connector.reserve(vec![small()], false).await.unwrap_err();
    assert!(matches!(err, BrokerError::ResourceManagerUnavailable(_)));
    assert_eq!(err.status_code(), StatusCode::InternalError);

    h.connector.unregister_queue().await.unwrap();
    let err = h.connector.register_queue(QUEUE).await.unwrap_err();
    assert!(matches!(err, BrokerError::ResourceManagerUnavailable(_)));
}

#[tokio::test]
async fn test_stopped_by_resource_manager() {
    let h = Harness::default().await;
    h.backend.request_shutdown().await;

    let listener = Arc::clone(&h.listener);
    wait_until(|| {
        let listener = Arc::clone(&listener);
        async move { listener.stopped.load(Ordering::SeqCst) }
    })
    .await;

    assert!(h.connector.queue().await.is_none());
    let err = h.connector.reserve(vec![small()], false).await.unwrap_err();
    assert!(matches!(err, BrokerError::NotRegistered));
}

#[tokio::test]
async fn test_stop_returns_everything() {
    let mut h = Harness::default().await;
    let r1 = small();
    let r1_id = r1.resource_id;
    h.allocate(r1).await;
    h.allocate(small()).await;
    h.connector.release(&[r1_id], false).await.unwrap();
    assert_eq!(h.backend.outstanding_grants().await, 2);

    h.connector.stop().await.unwrap();
    h.connector.stop().await.unwrap();

    assert_eq!(h.backend.outstanding_grants().await, 0);
    assert_eq!(h.connector.cached().await, 0);
}

#[tokio::test]
async fn test_expired_entries_returned_upstream() {
    let mut h = Harness::start(
        SimulatedResourceManager::new(SimulatedConfig::default()),
        CacheConfig {
            max_age: Duration::from_millis(50),
            eviction_interval: Duration::from_millis(10),
            ..CacheConfig::default()
        },
    )
    .await;
    let r1 = small();
    let r1_id = r1.resource_id;
    let rm_id = h.allocate(r1).await;
    h.connector.release(&[r1_id], false).await.unwrap();

    let backend = Arc::clone(&h.backend);
    wait_until(|| {
        let backend = Arc::clone(&backend);
        async move { backend.outstanding_grants().await == 0 }
    })
    .await;

    assert!(!h.connector.is_cached(&rm_id).await);
    assert_eq!(h.metrics.snapshot(0).cache_evictions, 1);
}

#[tokio::test]
async fn test_capacity_overflow_returns_oldest() {
    let mut h = Harness::start(
        SimulatedResourceManager::new(SimulatedConfig::default()),
        CacheConfig {
            capacity: 1,
            ..CacheConfig::default()
        },
    )
    .await;
    let r1 = small();
    let r2 = ResourceRequest::new(QUEUE, 2, 2048);
    let (r1_id, r2_id) = (r1.resource_id, r2.resource_id);
    let rm1 = h.allocate(r1).await;
    let rm2 = h.allocate(r2).await;

    h.connector.release(&[r1_id, r2_id], false).await.unwrap();

    let backend = Arc::clone(&h.backend);
    wait_until(|| {
        let backend = Arc::clone(&backend);
        async move { backend.outstanding_grants().await == 1 }
    })
    .await;
    assert!(!h.backend.is_granted(&rm1).await);
    assert!(h.connector.is_cached(&rm2).await);
    assert_eq!(h.metrics.snapshot(0).cache_evictions, 1);
}

#[tokio::test]
async fn test_disabled_cache_returns_on_release() {
    let mut h = Harness::start(
        SimulatedResourceManager::new(SimulatedConfig::default()),
        CacheConfig {
            enabled: false,
            ..CacheConfig::default()
        },
    )
    .await;
    let r1 = small();
    let r1_id = r1.resource_id;
    let rm_id = h.allocate(r1).await;

    h.connector.release(&[r1_id], false).await.unwrap();
    assert_eq!(h.connector.cached().await, 0);
    assert!(!h.connector.reassign_resource(&rm_id, ResourceId::new()).await);
}
