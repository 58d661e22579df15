//! Broker service: the `Register`/`Unregister` RPC surface plus the
//! client-facing reserve/release operations, wired over the registry,
//! connector and dispatcher.

use std::future::Future;
use std::sync::Arc;

use rmb_events::{validate_batch, EventError, ResourceRequest, RmResourceId};
use rmb_id::{ClientId, Handle, ResourceId};
use serde::{Deserialize, Serialize};
use tokio::runtime;
use tracing::{error, info, instrument, warn};

use crate::config::Config;
use crate::connector::{CachingConnector, ResourceManager, ResourceManagerConnector};
use crate::dispatcher::{NotificationDispatcher, NotificationSink};
use crate::error::{BrokerError, BrokerResult, StatusCode};
use crate::metrics::{BrokerMetrics, MetricsSnapshot};
use crate::registry::{CallbackAddress, ClientRegistry};

/// Protocol version this broker speaks.
pub const SUPPORTED_VERSION: u32 = 1;

/// Where a client listens for notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackService {
    pub host: String,
    pub port: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub version: u32,
    pub client_id: ClientId,
    pub notification_callback_service: CallbackService,
}

impl RegisterRequest {
    pub fn new(client_id: ClientId, host: impl Into<String>, port: i64) -> Self {
        Self {
            version: SUPPORTED_VERSION,
            client_id,
            notification_callback_service: CallbackService {
                host: host.into(),
                port,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnregisterRequest {
    pub version: u32,
    pub handle: Handle,
}

impl UnregisterRequest {
    pub fn new(handle: Handle) -> Self {
        Self {
            version: SUPPORTED_VERSION,
            handle,
        }
    }
}

/// Status carried in every response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub code: StatusCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Status {
    pub fn ok() -> Self {
        Self {
            code: StatusCode::Ok,
            message: None,
        }
    }

    pub fn from_error(err: &BrokerError) -> Self {
        Self {
            code: err.status_code(),
            message: Some(err.to_string()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<Handle>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnregisterResponse {
    pub status: Status,
}

fn check_version(version: u32) -> BrokerResult<()> {
    if version == SUPPORTED_VERSION {
        Ok(())
    } else {
        Err(BrokerError::UnsupportedVersion(version))
    }
}

/// The broker.
pub struct BrokerService {
    queue: String,
    registry: Arc<ClientRegistry>,
    connector: Arc<CachingConnector>,
    dispatcher: NotificationDispatcher,
    metrics: Arc<BrokerMetrics>,
}

impl BrokerService {
    /// Wires the broker. Notification delivery runs on `notifier`.
    pub fn new(
        config: &Config,
        backend: Arc<dyn ResourceManager>,
        sink: Arc<dyn NotificationSink>,
        notifier: runtime::Handle,
    ) -> Self {
        let metrics = Arc::new(BrokerMetrics::new());
        let registry = Arc::new(ClientRegistry::new());
        let connector = Arc::new(CachingConnector::new(
            backend,
            config.cache.clone(),
            Arc::clone(&metrics),
        ));
        let dispatcher = NotificationDispatcher::new(
            config.dispatcher.clone(),
            Arc::clone(&registry),
            sink,
            Arc::clone(&metrics),
            notifier,
        );
        connector.set_listener(dispatcher.listener());

        Self {
            queue: config.queue.clone(),
            registry,
            connector,
            dispatcher,
            metrics,
        }
    }

    /// Starts delivery and the connector, then registers the configured queue.
    pub async fn start(&self) -> BrokerResult<()> {
        self.dispatcher.start().await;
        self.connector.start().await?;
        self.connector.register_queue(&self.queue).await?;
        info!(queue = %self.queue, "Broker started");
        Ok(())
    }

    /// Starts a broker, runs it until `shutdown` resolves, then stops it.
    /// A failed start is torn down and its error returned.
    pub async fn serve(
        config: &Config,
        backend: Arc<dyn ResourceManager>,
        sink: Arc<dyn NotificationSink>,
        notifier: runtime::Handle,
        shutdown: impl Future<Output = ()>,
    ) -> BrokerResult<()> {
        let broker = Self::new(config, backend, sink, notifier);
        if let Err(err) = broker.start().await {
            error!(error = %err, "Broker failed to start");
            if let Err(stop_err) = broker.stop().await {
                warn!(error = %stop_err, "Cleanup after failed start failed");
            }
            return Err(err);
        }

        shutdown.await;
        info!("Received shutdown signal");
        broker.stop().await
    }

    /// Returns every held allocation upstream and stops routing.
    pub async fn stop(&self) -> BrokerResult<()> {
        self.connector.stop().await?;
        self.dispatcher.stop().await;
        info!("Broker stopped");
        Ok(())
    }

    #[instrument(skip(self, request), fields(client_id = %request.client_id))]
    pub async fn register(&self, request: RegisterRequest) -> RegisterResponse {
        match self.try_register(request).await {
            Ok(handle) => RegisterResponse {
                status: Status::ok(),
                handle: Some(handle),
            },
            Err(err) => {
                warn!(error = %err, "Register failed");
                RegisterResponse {
                    status: Status::from_error(&err),
                    handle: None,
                }
            }
        }
    }

    async fn try_register(&self, request: RegisterRequest) -> BrokerResult<Handle> {
        check_version(request.version)?;
        let callback = request.notification_callback_service;
        let address = CallbackAddress::new(&callback.host, callback.port)?;
        let outcome = self.registry.register(request.client_id, address).await?;
        if let Some(stale) = outcome.replaced {
            self.dispatcher.forget(stale);
        }
        if outcome.created {
            self.dispatcher.watch(outcome.handle).await;
        }
        Ok(outcome.handle)
    }

    /// Always succeeds; an unknown handle or version is only logged.
    #[instrument(skip(self, request), fields(handle = %request.handle))]
    pub async fn unregister(&self, request: UnregisterRequest) -> UnregisterResponse {
        if let Err(err) = check_version(request.version) {
            warn!(error = %err, "Unregister with unexpected version");
        }
        if self.registry.unregister(request.handle).await {
            self.dispatcher.forget(request.handle);
        }
        UnregisterResponse {
            status: Status::ok(),
        }
    }

    /// Reserves on behalf of `handle`; outcomes are delivered to its callback.
    pub async fn reserve(
        &self,
        handle: Handle,
        requests: Vec<ResourceRequest>,
        gang: bool,
    ) -> BrokerResult<()> {
        self.registry.validate_handle(handle).await?;
        validate_batch(&requests)?;

        let ids: Vec<ResourceId> = requests.iter().map(|r| r.resource_id).collect();
        // Bound before reserving: cache hits are emitted during the call.
        self.dispatcher.bind(handle, ids.clone());
        match self.connector.reserve(requests, gang).await {
            Ok(()) => Ok(()),
            Err(err) => {
                // A duplicate id keeps the route of its earlier reserve.
                let unbound = match &err {
                    BrokerError::InvalidRequest(EventError::DuplicateResourceId(duplicate)) => {
                        ids.into_iter().filter(|id| id != duplicate).collect()
                    }
                    _ => ids,
                };
                self.dispatcher.unbind(handle, unbound);
                Err(err)
            }
        }
    }

    pub async fn release(
        &self,
        handle: Handle,
        resource_ids: &[ResourceId],
        do_not_cache: bool,
    ) -> BrokerResult<()> {
        self.registry.validate_handle(handle).await?;
        self.connector.release(resource_ids, do_not_cache).await?;
        self.dispatcher.unbind(handle, resource_ids.to_vec());
        Ok(())
    }

    pub async fn reassign_resource(
        &self,
        handle: Handle,
        rm_resource_id: &RmResourceId,
        new_resource_id: ResourceId,
    ) -> BrokerResult<bool> {
        self.registry.validate_handle(handle).await?;
        Ok(self
            .connector
            .reassign_resource(rm_resource_id, new_resource_id)
            .await)
    }

    pub async fn nodes(&self) -> BrokerResult<Vec<String>> {
        self.connector.get_nodes().await
    }

    pub async fn empty_cache(&self) -> usize {
        self.connector.empty_cache().await
    }

    pub async fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot(self.registry.len().await)
    }

    pub fn connector(&self) -> &Arc<CachingConnector> {
        &self.connector
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }
}
