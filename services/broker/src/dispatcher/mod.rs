//! Notification dispatcher.
//!
//! Delivers connector events to registered clients off the negotiation path:
//!
//! - A router task receives events from the connector listener, maps each
//!   resource to the handle that reserved it and appends the batch to that
//!   handle's queue.
//! - Each non-empty destination queue has one drain task, so batches for a
//!   destination go out strictly in order. Deliveries across destinations
//!   share a bounded pool of worker permits.
//! - Failed deliveries are retried with backoff, then dropped and counted.
//! - Every registered client gets an empty heartbeat notification when no
//!   delivery reached it for a heartbeat interval. A client that misses a
//!   heartbeat through all retries is unregistered.
//!
//! Everything runs on the runtime handle passed at construction, which the
//! binary keeps separate from the request-handling runtime.

mod backoff;
mod sink;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use rmb_events::{AllocationEvent, Notification};
use rmb_id::{Handle, ResourceId};
use tokio::runtime;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::connector::AllocationListener;
use crate::metrics::BrokerMetrics;
use crate::registry::{CallbackAddress, ClientRegistry};

pub use backoff::BackoffPolicy;
pub use sink::{DeliveryError, HttpNotificationSink, NotificationSink, RecordingSink};

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Concurrent deliveries across all destinations.
    pub workers: usize,
    /// Retries after the first failed attempt.
    pub max_retries: u32,
    pub backoff: BackoffPolicy,
    /// Per-destination backlog that triggers a warning.
    pub queue_threshold: usize,
    /// Idle time before a client is sent a heartbeat. Zero disables heartbeats.
    pub heartbeat: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 10,
            max_retries: 5,
            backoff: BackoffPolicy::default(),
            queue_threshold: 10_000,
            heartbeat: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
enum RouterMsg {
    Events(Vec<AllocationEvent>),
    Bind {
        handle: Handle,
        resource_ids: Vec<ResourceId>,
    },
    Unbind {
        handle: Handle,
        resource_ids: Vec<ResourceId>,
    },
    Forget(Handle),
    Shutdown,
}

#[derive(Debug)]
struct DestinationQueue {
    /// Identifies the drain task serving this queue.
    epoch: u64,
    pending: VecDeque<Vec<AllocationEvent>>,
}

struct DispatchInner {
    config: DispatcherConfig,
    registry: Arc<ClientRegistry>,
    sink: Arc<dyn NotificationSink>,
    metrics: Arc<BrokerMetrics>,
    permits: Semaphore,
    queues: Mutex<HashMap<Handle, DestinationQueue>>,
    next_epoch: std::sync::atomic::AtomicU64,
    /// Last successful delivery per handle, heartbeats included.
    last_delivery: Mutex<HashMap<Handle, Instant>>,
    heartbeats: Mutex<HashMap<Handle, JoinHandle<()>>>,
    router_tx: mpsc::UnboundedSender<RouterMsg>,
}

impl DispatchInner {
    async fn enqueue(self: &Arc<Self>, handle: Handle, batch: Vec<AllocationEvent>) {
        let mut queues = self.queues.lock().await;
        if let Some(queue) = queues.get_mut(&handle) {
            queue.pending.push_back(batch);
            let backlog = queue.pending.len();
            if backlog == self.config.queue_threshold + 1 {
                warn!(
                    handle = %handle,
                    backlog,
                    threshold = self.config.queue_threshold,
                    "Notification backlog above threshold"
                );
            }
            return;
        }

        let epoch = self
            .next_epoch
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        queues.insert(
            handle,
            DestinationQueue {
                epoch,
                pending: VecDeque::from([batch]),
            },
        );
        tokio::spawn(Arc::clone(self).drain(handle, epoch));
    }

    async fn drain(self: Arc<Self>, handle: Handle, epoch: u64) {
        loop {
            let batch = {
                let mut queues = self.queues.lock().await;
                let Some(queue) = queues.get_mut(&handle).filter(|q| q.epoch == epoch) else {
                    return;
                };
                match queue.pending.pop_front() {
                    Some(batch) => batch,
                    None => {
                        queues.remove(&handle);
                        return;
                    }
                }
            };
            self.deliver(handle, batch).await;
        }
    }

    async fn deliver(&self, handle: Handle, batch: Vec<AllocationEvent>) {
        let Some((client_id, address)) = self.registry.resolve(handle).await else {
            BrokerMetrics::add(&self.metrics.notifications_unrouted, batch.len() as u64);
            warn!(handle = %handle, events = batch.len(), "No registration for handle, dropping events");
            return;
        };
        let notification = Notification::new(handle, client_id, batch);

        match self.send_with_retries(handle, &address, &notification).await {
            Ok(()) => {
                BrokerMetrics::incr(&self.metrics.notifications_dispatched);
                debug!(
                    handle = %handle,
                    address = %address,
                    events = notification.events.len(),
                    "Notification delivered"
                );
            }
            Err(err) => {
                BrokerMetrics::incr(&self.metrics.notifications_failed);
                warn!(
                    handle = %handle,
                    address = %address,
                    events = notification.events.len(),
                    error = %err,
                    "Notification dropped after retries"
                );
            }
        }
    }

    /// One delivery with retries. Returns the last error once retries run out.
    async fn send_with_retries(
        &self,
        handle: Handle,
        address: &CallbackAddress,
        notification: &Notification,
    ) -> Result<(), DeliveryError> {
        let mut attempt = 0;
        loop {
            let result = {
                let Ok(_permit) = self.permits.acquire().await else {
                    return Err(DeliveryError::Transport("dispatcher closed".to_string()));
                };
                self.sink.deliver(address, notification).await
            };

            match result {
                Ok(()) => {
                    self.last_delivery.lock().await.insert(handle, Instant::now());
                    return Ok(());
                }
                Err(err) if attempt < self.config.max_retries => {
                    let delay = self.config.backoff.delay(attempt);
                    attempt += 1;
                    BrokerMetrics::incr(&self.metrics.notifications_retried);
                    warn!(
                        handle = %handle,
                        address = %address,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Notification delivery failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Heartbeats `handle` whenever it has been idle for the heartbeat
    /// interval, until it is forgotten or evicted.
    async fn heartbeat(self: Arc<Self>, handle: Handle) {
        let interval = self.config.heartbeat;
        let mut delay = interval;
        loop {
            tokio::time::sleep(delay).await;

            let idle = self
                .last_delivery
                .lock()
                .await
                .get(&handle)
                .map(Instant::elapsed);
            if let Some(idle) = idle.filter(|idle| *idle < interval) {
                debug!(handle = %handle, "Client called recently, skipping heartbeat");
                delay = interval - idle;
                continue;
            }

            let Some((client_id, address)) = self.registry.resolve(handle).await else {
                debug!(handle = %handle, "Handle no longer registered, stopping heartbeats");
                break;
            };
            let heartbeat = Notification::heartbeat(handle, client_id);
            match self.send_with_retries(handle, &address, &heartbeat).await {
                Ok(()) => {
                    debug!(handle = %handle, address = %address, "Heartbeat delivered");
                    delay = interval;
                }
                Err(err) => {
                    warn!(
                        handle = %handle,
                        address = %address,
                        error = %err,
                        "Heartbeat failed after retries, evicting client"
                    );
                    if self.registry.unregister(handle).await {
                        BrokerMetrics::incr(&self.metrics.clients_evicted);
                    }
                    self.heartbeats.lock().await.remove(&handle);
                    let _ = self.router_tx.send(RouterMsg::Forget(handle));
                    return;
                }
            }
        }
        self.heartbeats.lock().await.remove(&handle);
    }

    async fn forget(&self, handle: Handle) {
        if let Some(task) = self.heartbeats.lock().await.remove(&handle) {
            task.abort();
        }
        self.last_delivery.lock().await.remove(&handle);
        if let Some(queue) = self.queues.lock().await.remove(&handle) {
            let dropped: usize = queue.pending.iter().map(Vec::len).sum();
            if dropped > 0 {
                BrokerMetrics::add(&self.metrics.notifications_unrouted, dropped as u64);
                debug!(handle = %handle, dropped, "Dropped queued notifications for handle");
            }
        }
    }
}

async fn route(inner: Arc<DispatchInner>, mut rx: mpsc::UnboundedReceiver<RouterMsg>) {
    let mut routes: HashMap<ResourceId, Handle> = HashMap::new();

    while let Some(msg) = rx.recv().await {
        match msg {
            RouterMsg::Events(events) => {
                let mut groups: Vec<(Handle, Vec<AllocationEvent>)> = Vec::new();
                for event in events {
                    let Some(handle) = routes.get(&event.resource_id).copied() else {
                        BrokerMetrics::incr(&inner.metrics.notifications_unrouted);
                        debug!(resource_id = %event.resource_id, "No route for event, dropping");
                        continue;
                    };
                    if event.status.is_terminal() {
                        routes.remove(&event.resource_id);
                    }
                    match groups.iter_mut().find(|(h, _)| *h == handle) {
                        Some((_, batch)) => batch.push(event),
                        None => groups.push((handle, vec![event])),
                    }
                }
                for (handle, batch) in groups {
                    inner.enqueue(handle, batch).await;
                }
            }
            RouterMsg::Bind {
                handle,
                resource_ids,
            } => {
                // An id already routed keeps its owner.
                for id in resource_ids {
                    routes.entry(id).or_insert(handle);
                }
            }
            RouterMsg::Unbind {
                handle,
                resource_ids,
            } => {
                for id in &resource_ids {
                    if routes.get(id) == Some(&handle) {
                        routes.remove(id);
                    }
                }
            }
            RouterMsg::Forget(handle) => {
                routes.retain(|_, h| *h != handle);
                inner.forget(handle).await;
            }
            RouterMsg::Shutdown => break,
        }
    }

    debug!("Notification router stopped");
}

/// Connector listener feeding the router.
struct DispatchListener {
    tx: mpsc::UnboundedSender<RouterMsg>,
}

impl AllocationListener for DispatchListener {
    fn on_events(&self, events: Vec<AllocationEvent>) {
        if self.tx.send(RouterMsg::Events(events)).is_err() {
            warn!("Notification router stopped, events dropped");
        }
    }

    fn on_stopped_by_rm(&self) {
        warn!("Resource manager stopped the broker, queued notifications still delivered");
    }
}

/// Routes connector events to registered clients.
pub struct NotificationDispatcher {
    inner: Arc<DispatchInner>,
    runtime: runtime::Handle,
    tx: mpsc::UnboundedSender<RouterMsg>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<RouterMsg>>>,
    router: Mutex<Option<JoinHandle<()>>>,
}

impl NotificationDispatcher {
    pub fn new(
        config: DispatcherConfig,
        registry: Arc<ClientRegistry>,
        sink: Arc<dyn NotificationSink>,
        metrics: Arc<BrokerMetrics>,
        runtime: runtime::Handle,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let workers = config.workers.max(1);
        Self {
            inner: Arc::new(DispatchInner {
                config,
                registry,
                sink,
                metrics,
                permits: Semaphore::new(workers),
                queues: Mutex::new(HashMap::new()),
                next_epoch: std::sync::atomic::AtomicU64::new(0),
                last_delivery: Mutex::new(HashMap::new()),
                heartbeats: Mutex::new(HashMap::new()),
                router_tx: tx.clone(),
            }),
            runtime,
            tx,
            rx: Mutex::new(Some(rx)),
            router: Mutex::new(None),
        }
    }

    /// Listener to install on the connector.
    pub fn listener(&self) -> Arc<dyn AllocationListener> {
        Arc::new(DispatchListener {
            tx: self.tx.clone(),
        })
    }

    /// Spawns the router. Idempotent.
    pub async fn start(&self) {
        let Some(rx) = self.rx.lock().await.take() else {
            return;
        };
        let handle = self.runtime.spawn(route(Arc::clone(&self.inner), rx));
        *self.router.lock().await = Some(handle);
        info!(
            workers = self.inner.config.workers,
            max_retries = self.inner.config.max_retries,
            "Notification dispatcher started"
        );
    }

    /// Starts heartbeats for a newly registered `handle`.
    pub async fn watch(&self, handle: Handle) {
        if self.inner.config.heartbeat.is_zero() {
            return;
        }
        let mut heartbeats = self.inner.heartbeats.lock().await;
        if heartbeats.contains_key(&handle) {
            return;
        }
        let task = self.runtime.spawn(Arc::clone(&self.inner).heartbeat(handle));
        heartbeats.insert(handle, task);
    }

    /// Stops routing and heartbeats. Deliveries already queued keep running
    /// on the dispatcher runtime until it shuts down.
    pub async fn stop(&self) {
        for (_, task) in self.inner.heartbeats.lock().await.drain() {
            task.abort();
        }
        let Some(router) = self.router.lock().await.take() else {
            return;
        };
        let _ = self.tx.send(RouterMsg::Shutdown);
        if let Err(err) = router.await {
            warn!(error = %err, "Notification router failed");
        }
        info!("Notification dispatcher stopped");
    }

    /// Routes future events for `resource_ids` to `handle`, unless an id is
    /// already routed elsewhere.
    pub fn bind(&self, handle: Handle, resource_ids: Vec<ResourceId>) {
        self.send(RouterMsg::Bind {
            handle,
            resource_ids,
        });
    }

    /// Drops routes from `resource_ids` to `handle`.
    pub fn unbind(&self, handle: Handle, resource_ids: Vec<ResourceId>) {
        self.send(RouterMsg::Unbind {
            handle,
            resource_ids,
        });
    }

    /// Drops routes and queued notifications for `handle`.
    pub fn forget(&self, handle: Handle) {
        self.send(RouterMsg::Forget(handle));
    }

    fn send(&self, msg: RouterMsg) {
        if self.tx.send(msg).is_err() {
            debug!("Notification router stopped, message dropped");
        }
    }

    /// Batches waiting across all destinations.
    pub async fn backlog(&self) -> usize {
        self.inner
            .queues
            .lock()
            .await
            .values()
            .map(|q| q.pending.len())
            .sum()
    }
}
