//! Connector that fronts a `ResourceManager` with a reuse cache.
//!
//! Caller-facing operations (`reserve`, `release`, `reassign_resource`) only
//! update local state under one lock and queue work for the negotiation
//! task; they never wait on the resource manager. The negotiation task owns
//! every backend call made on behalf of requests and consumes backend
//! outcomes. Events are emitted with the state lock held, so generation
//! numbers follow emission order.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use rmb_events::{
    validate_batch, Allocation, AllocationEvent, Enforcement, EventError, ResourceRequest,
    ResourceStatus, RmResourceId,
};
use rmb_id::ResourceId;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use super::backend::{ResourceManager, RmOutcome};
use super::{AllocationListener, ResourceManagerConnector};
use crate::cache::{CacheConfig, CacheEntry, ResourceCache};
use crate::error::{BrokerError, BrokerResult};
use crate::metrics::BrokerMetrics;

#[derive(Debug)]
enum Phase {
    Pending,
    Allocated(Allocation),
}

#[derive(Debug)]
struct Tracked {
    request: ResourceRequest,
    gang: bool,
    phase: Phase,
}

impl Tracked {
    fn is_pending(&self) -> bool {
        matches!(self.phase, Phase::Pending)
    }
}

/// Work for the negotiation task.
#[derive(Debug)]
enum Command {
    Negotiate {
        requests: Vec<ResourceRequest>,
        gang: bool,
    },
    Cancel(Vec<ResourceId>),
    Return(Vec<RmResourceId>),
}

#[derive(Debug, Default)]
struct ConnectorState {
    started: bool,
    stopped: bool,
    queue: Option<String>,
    generation: u64,
    requests: HashMap<ResourceId, Tracked>,
    /// Allocations reassigned from the cache, waiting for their `reserve`.
    prebound: HashMap<ResourceId, Allocation>,
    bindings: HashMap<RmResourceId, ResourceId>,
    /// Released while pending; the value is the `do_not_cache` flag to apply
    /// if a grant still arrives.
    released: HashMap<ResourceId, bool>,
}

impl ConnectorState {
    fn running(&self) -> bool {
        self.started && !self.stopped
    }

    fn is_tracked(&self, id: &ResourceId) -> bool {
        self.requests.contains_key(id)
            || self.prebound.contains_key(id)
            || self.released.contains_key(id)
    }
}

/// Side effects collected under the lock and applied together.
#[derive(Debug, Default)]
struct Effects {
    events: Vec<AllocationEvent>,
    cancels: Vec<ResourceId>,
    returns: Vec<RmResourceId>,
}

struct Shared {
    backend: Arc<dyn ResourceManager>,
    cache: ResourceCache,
    metrics: Arc<BrokerMetrics>,
    listener: OnceLock<Arc<dyn AllocationListener>>,
    state: Mutex<ConnectorState>,
    commands: mpsc::UnboundedSender<Command>,
}

impl Shared {
    fn emit(&self, state: &mut ConnectorState, events: Vec<AllocationEvent>) {
        if events.is_empty() {
            return;
        }
        let events = events
            .into_iter()
            .map(|event| {
                state.generation += 1;
                event.with_generation(state.generation)
            })
            .collect();
        if let Some(listener) = self.listener.get() {
            listener.on_events(events);
        }
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            warn!("Negotiation task gone, command dropped");
        }
    }

    fn apply(&self, state: &mut ConnectorState, effects: Effects) {
        self.emit(state, effects.events);
        if !effects.cancels.is_empty() {
            self.send(Command::Cancel(effects.cancels));
        }
        if !effects.returns.is_empty() {
            self.send(Command::Return(effects.returns));
        }
    }

    /// Takes back a granted allocation: hands it to a matching pending
    /// request, caches it, or returns it upstream.
    async fn reclaim(
        &self,
        state: &mut ConnectorState,
        allocation: Allocation,
        do_not_cache: bool,
        effects: &mut Effects,
    ) {
        if do_not_cache || !self.cache.config().enabled || state.queue.is_none() {
            effects.returns.push(allocation.rm_resource_id);
            return;
        }

        if let Some(id) = find_handover(state, &allocation) {
            debug!(
                resource_id = %id,
                rm_resource_id = %allocation.rm_resource_id,
                "Released allocation handed to pending request"
            );
            if let Some(tracked) = state.requests.get_mut(&id) {
                tracked.phase = Phase::Allocated(allocation.clone());
            }
            state.bindings.insert(allocation.rm_resource_id.clone(), id);
            effects.cancels.push(id);
            effects.events.push(AllocationEvent::allocated(id, allocation));
            return;
        }

        let evicted = self
            .cache
            .insert(CacheEntry::from_allocation(allocation))
            .await;
        BrokerMetrics::incr(&self.metrics.cache_inserts);
        BrokerMetrics::add(&self.metrics.cache_evictions, evicted.len() as u64);
        effects
            .returns
            .extend(evicted.into_iter().map(|e| e.rm_resource_id));
    }

    async fn handle_command(&self, command: Command) {
        match command {
            Command::Negotiate { requests, gang } => {
                let ids: Vec<ResourceId> = requests.iter().map(|r| r.resource_id).collect();
                let Err(err) = self.backend.request(requests, gang).await else {
                    return;
                };
                warn!(error = %err, count = ids.len(), "Negotiation failed, rejecting requests");

                let mut guard = self.state.lock().await;
                let state = &mut *guard;
                let mut events = Vec::new();
                for id in ids {
                    if state.released.remove(&id).is_some() {
                        continue;
                    }
                    if state.requests.get(&id).is_some_and(Tracked::is_pending) {
                        state.requests.remove(&id);
                        events.push(AllocationEvent::status_change(id, ResourceStatus::Rejected));
                    }
                }
                self.emit(state, events);
            }
            Command::Cancel(ids) => match self.backend.cancel(&ids).await {
                Ok(cancelled) => {
                    let mut state = self.state.lock().await;
                    for id in cancelled {
                        state.released.remove(&id);
                    }
                }
                Err(err) => warn!(error = %err, count = ids.len(), "Cancel failed"),
            },
            Command::Return(rm_resource_ids) => {
                for rm_resource_id in rm_resource_ids {
                    match self.backend.release(&rm_resource_id).await {
                        Ok(()) => debug!(rm_resource_id = %rm_resource_id, "Allocation returned"),
                        Err(err) => warn!(
                            rm_resource_id = %rm_resource_id,
                            error = %err,
                            "Failed to return allocation"
                        ),
                    }
                }
            }
        }
    }

    async fn handle_outcome(&self, outcome: RmOutcome) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let mut effects = Effects::default();

        match outcome {
            RmOutcome::Allocated {
                resource_id,
                allocation,
            } => {
                if let Some(do_not_cache) = state.released.remove(&resource_id) {
                    debug!(
                        resource_id = %resource_id,
                        rm_resource_id = %allocation.rm_resource_id,
                        "Grant arrived after release, reclaiming"
                    );
                    self.reclaim(state, allocation, do_not_cache, &mut effects)
                        .await;
                } else if state
                    .requests
                    .get(&resource_id)
                    .is_some_and(Tracked::is_pending)
                {
                    if let Some(tracked) = state.requests.get_mut(&resource_id) {
                        tracked.phase = Phase::Allocated(allocation.clone());
                    }
                    state
                        .bindings
                        .insert(allocation.rm_resource_id.clone(), resource_id);
                    effects
                        .events
                        .push(AllocationEvent::allocated(resource_id, allocation));
                } else {
                    warn!(
                        resource_id = %resource_id,
                        rm_resource_id = %allocation.rm_resource_id,
                        "Grant for resource that is not pending, reclaiming"
                    );
                    self.reclaim(state, allocation, false, &mut effects).await;
                }
            }
            RmOutcome::Rejected {
                resource_id,
                reason,
            } => {
                if state.released.remove(&resource_id).is_some() {
                    debug!(resource_id = %resource_id, "Released request rejected");
                } else if state
                    .requests
                    .get(&resource_id)
                    .is_some_and(Tracked::is_pending)
                {
                    state.requests.remove(&resource_id);
                    warn!(resource_id = %resource_id, reason = %reason, "Request rejected");
                    effects.events.push(AllocationEvent::status_change(
                        resource_id,
                        ResourceStatus::Rejected,
                    ));
                }
            }
            RmOutcome::Lost { rm_resource_id } => {
                self.revoked(state, rm_resource_id, ResourceStatus::Lost, &mut effects)
                    .await;
            }
            RmOutcome::Preempted { rm_resource_id } => {
                self.revoked(state, rm_resource_id, ResourceStatus::Preempted, &mut effects)
                    .await;
            }
            RmOutcome::ShutdownRequested => {
                warn!(
                    backend = self.backend.name(),
                    "Resource manager terminated the registration"
                );
                state.queue = None;
                state.requests.clear();
                state.prebound.clear();
                state.bindings.clear();
                state.released.clear();
                let dropped = self.cache.drain().await.len();
                if dropped > 0 {
                    debug!(count = dropped, "Dropped cache entries after termination");
                }
                if let Some(listener) = self.listener.get() {
                    listener.on_stopped_by_rm();
                }
            }
        }

        self.apply(state, effects);
    }

    async fn revoked(
        &self,
        state: &mut ConnectorState,
        rm_resource_id: RmResourceId,
        status: ResourceStatus,
        effects: &mut Effects,
    ) {
        match state.bindings.remove(&rm_resource_id) {
            Some(id) => {
                state.requests.remove(&id);
                state.prebound.remove(&id);
                info!(
                    resource_id = %id,
                    rm_resource_id = %rm_resource_id,
                    status = %status,
                    "Allocation revoked"
                );
                effects.events.push(AllocationEvent::status_change(id, status));
            }
            None => {
                if self.cache.take(&rm_resource_id).await.is_some() {
                    debug!(rm_resource_id = %rm_resource_id, status = %status, "Cached allocation revoked");
                } else {
                    debug!(rm_resource_id = %rm_resource_id, "Revocation for unknown allocation ignored");
                }
            }
        }
    }

    /// Returns everything held upstream and detaches from the queue.
    async fn release_everything(&self, state: &mut ConnectorState) {
        let mut pending = Vec::new();
        let mut returns = Vec::new();
        for (id, tracked) in state.requests.drain() {
            match tracked.phase {
                Phase::Pending => pending.push(id),
                Phase::Allocated(allocation) => returns.push(allocation.rm_resource_id),
            }
        }
        pending.extend(state.released.drain().map(|(id, _)| id));
        returns.extend(state.prebound.drain().map(|(_, a)| a.rm_resource_id));
        returns.extend(self.cache.drain().await.into_iter().map(|e| e.rm_resource_id));
        state.bindings.clear();

        if !pending.is_empty() {
            if let Err(err) = self.backend.cancel(&pending).await {
                warn!(error = %err, "Failed to cancel pending asks");
            }
        }
        for rm_resource_id in &returns {
            if let Err(err) = self.backend.release(rm_resource_id).await {
                warn!(rm_resource_id = %rm_resource_id, error = %err, "Failed to return allocation");
            }
        }
        if state.queue.take().is_some() {
            if let Err(err) = self.backend.unregister().await {
                warn!(error = %err, "Failed to unregister from resource manager");
            }
        }

        info!(
            returned = returns.len(),
            cancelled = pending.len(),
            "Released all held resources"
        );
    }
}

/// A pending non-gang request the allocation can satisfy, preferring one
/// that asked for the allocation's node.
fn find_handover(state: &ConnectorState, allocation: &Allocation) -> Option<ResourceId> {
    let mut fallback = None;
    for (id, tracked) in &state.requests {
        let request = &tracked.request;
        if tracked.gang
            || !tracked.is_pending()
            || request.cpu_vcores != allocation.cpu_vcores
            || request.memory_mb != allocation.memory_mb
        {
            continue;
        }
        if request.location.as_deref() == Some(allocation.location.as_str()) {
            return Some(*id);
        }
        if request.enforcement == Enforcement::Preferred && fallback.is_none() {
            fallback = Some(*id);
        }
    }
    fallback
}

async fn negotiation_loop(
    shared: Arc<Shared>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut outcomes: mpsc::UnboundedReceiver<RmOutcome>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!("Negotiation task started");
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            Some(command) = commands.recv() => shared.handle_command(command).await,
            Some(outcome) = outcomes.recv() => shared.handle_outcome(outcome).await,
            else => break,
        }
    }
    // Returns queued before shutdown still go upstream.
    while let Ok(command) = commands.try_recv() {
        if matches!(command, Command::Return(_)) {
            shared.handle_command(command).await;
        }
    }
    debug!("Negotiation task stopped");
}

async fn expiry_loop(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let period = shared
        .cache
        .config()
        .eviction_interval
        .max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let expired = shared.cache.expire().await;
                if expired.is_empty() {
                    continue;
                }
                debug!(count = expired.len(), "Returning expired cache entries");
                BrokerMetrics::add(&shared.metrics.cache_evictions, expired.len() as u64);
                shared.send(Command::Return(
                    expired.into_iter().map(|e| e.rm_resource_id).collect(),
                ));
            }
        }
    }
}

/// `ResourceManagerConnector` with a per-connector `ResourceCache`.
pub struct CachingConnector {
    shared: Arc<Shared>,
    command_rx: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CachingConnector {
    pub fn new(
        backend: Arc<dyn ResourceManager>,
        cache: CacheConfig,
        metrics: Arc<BrokerMetrics>,
    ) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                backend,
                cache: ResourceCache::new(cache),
                metrics,
                listener: OnceLock::new(),
                state: Mutex::new(ConnectorState::default()),
                commands,
            }),
            command_rx: Mutex::new(Some(command_rx)),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Entries currently cached.
    pub async fn cached(&self) -> usize {
        self.shared.cache.len().await
    }

    pub async fn is_cached(&self, rm_resource_id: &RmResourceId) -> bool {
        self.shared.cache.contains(rm_resource_id).await
    }

    /// Queue the connector is attached to, if any.
    pub async fn queue(&self) -> Option<String> {
        self.shared.state.lock().await.queue.clone()
    }
}

#[async_trait]
impl ResourceManagerConnector for CachingConnector {
    fn set_listener(&self, listener: Arc<dyn AllocationListener>) {
        if self.shared.listener.set(listener).is_err() {
            warn!("Allocation listener already set, ignoring");
        }
    }

    async fn start(&self) -> BrokerResult<()> {
        let mut state = self.shared.state.lock().await;
        if state.stopped {
            return Err(BrokerError::NotStarted);
        }
        if state.started {
            return Ok(());
        }
        if self.shared.listener.get().is_none() {
            return Err(BrokerError::ListenerNotSet);
        }
        let commands = self
            .command_rx
            .lock()
            .await
            .take()
            .ok_or(BrokerError::NotStarted)?;

        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        self.shared.backend.start(outcome_tx).await?;

        let mut tasks = self.tasks.lock().await;
        tasks.push(tokio::spawn(negotiation_loop(
            Arc::clone(&self.shared),
            commands,
            outcome_rx,
            self.shutdown_tx.subscribe(),
        )));
        if self.shared.cache.config().enabled {
            tasks.push(tokio::spawn(expiry_loop(
                Arc::clone(&self.shared),
                self.shutdown_tx.subscribe(),
            )));
        }

        state.started = true;
        info!(backend = self.shared.backend.name(), "Connector started");
        Ok(())
    }

    async fn stop(&self) -> BrokerResult<()> {
        {
            let mut state = self.shared.state.lock().await;
            if !state.running() {
                return Ok(());
            }
            state.stopped = true;
        }

        let _ = self.shutdown_tx.send(true);
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "Connector task failed");
            }
        }

        let mut state = self.shared.state.lock().await;
        self.shared.release_everything(&mut state).await;
        self.shared.backend.stop().await;
        info!("Connector stopped");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn register_queue(&self, queue: &str) -> BrokerResult<()> {
        let mut state = self.shared.state.lock().await;
        if !state.running() {
            return Err(BrokerError::NotStarted);
        }
        match state.queue.as_deref() {
            Some(current) if current == queue => return Ok(()),
            Some(current) => {
                return Err(BrokerError::validation(format!(
                    "already registered to queue '{}'",
                    current
                )))
            }
            None => {}
        }

        self.shared.backend.register(queue).await?;
        state.queue = Some(queue.to_string());
        info!("Registered to queue");
        Ok(())
    }

    async fn unregister_queue(&self) -> BrokerResult<()> {
        let mut state = self.shared.state.lock().await;
        if state.queue.is_none() {
            debug!("Unregister without a registered queue ignored");
            return Ok(());
        }
        self.shared.release_everything(&mut state).await;
        info!("Queue unregistered");
        Ok(())
    }

    async fn get_nodes(&self) -> BrokerResult<Vec<String>> {
        Ok(self.shared.backend.nodes().await?)
    }

    #[instrument(skip(self, requests), fields(count = requests.len()))]
    async fn reserve(&self, requests: Vec<ResourceRequest>, gang: bool) -> BrokerResult<()> {
        let shared = &self.shared;
        let mut guard = shared.state.lock().await;
        let state = &mut *guard;

        if !state.running() {
            return Err(BrokerError::NotStarted);
        }
        let queue = state.queue.clone().ok_or(BrokerError::NotRegistered)?;
        shared.backend.health()?;
        validate_batch(&requests)?;
        for request in &requests {
            if request.queue != queue {
                return Err(BrokerError::validation(format!(
                    "request queue '{}' does not match registered queue '{}'",
                    request.queue, queue
                )));
            }
            if state.is_tracked(&request.resource_id)
                && !state.prebound.contains_key(&request.resource_id)
            {
                return Err(EventError::DuplicateResourceId(request.resource_id).into());
            }
        }

        let use_cache = !gang && shared.cache.config().enabled;
        let mut effects = Effects::default();
        let mut negotiate = Vec::new();

        for request in requests {
            let id = request.resource_id;

            if let Some(allocation) = state.prebound.remove(&id) {
                debug!(resource_id = %id, "Reserve satisfied by reassigned allocation");
                effects
                    .events
                    .push(AllocationEvent::allocated(id, allocation.clone()));
                state.requests.insert(
                    id,
                    Tracked {
                        request,
                        gang,
                        phase: Phase::Allocated(allocation),
                    },
                );
                continue;
            }

            if use_cache {
                if let Some(entry) = shared.cache.take_matching(&request).await {
                    BrokerMetrics::incr(&shared.metrics.cache_hits);
                    let allocation = entry.into_allocation();
                    debug!(
                        resource_id = %id,
                        rm_resource_id = %allocation.rm_resource_id,
                        "Reserve satisfied from cache"
                    );
                    state
                        .bindings
                        .insert(allocation.rm_resource_id.clone(), id);
                    effects
                        .events
                        .push(AllocationEvent::allocated(id, allocation.clone()));
                    state.requests.insert(
                        id,
                        Tracked {
                            request,
                            gang,
                            phase: Phase::Allocated(allocation),
                        },
                    );
                    continue;
                }
                BrokerMetrics::incr(&shared.metrics.cache_misses);
            }

            negotiate.push(request.clone());
            state.requests.insert(
                id,
                Tracked {
                    request,
                    gang,
                    phase: Phase::Pending,
                },
            );
        }

        shared.apply(state, effects);
        if !negotiate.is_empty() {
            debug!(count = negotiate.len(), gang, "Queued for negotiation");
            shared.send(Command::Negotiate {
                requests: negotiate,
                gang,
            });
        }
        Ok(())
    }

    #[instrument(skip(self, resource_ids), fields(count = resource_ids.len()))]
    async fn release(&self, resource_ids: &[ResourceId], do_not_cache: bool) -> BrokerResult<()> {
        let shared = &self.shared;
        let mut guard = shared.state.lock().await;
        let state = &mut *guard;
        if !state.running() {
            return Err(BrokerError::NotStarted);
        }

        let mut effects = Effects::default();
        for id in resource_ids {
            let allocation = match state.requests.remove(id) {
                Some(Tracked {
                    phase: Phase::Pending,
                    ..
                }) => {
                    state.released.insert(*id, do_not_cache);
                    effects.cancels.push(*id);
                    continue;
                }
                Some(Tracked {
                    phase: Phase::Allocated(allocation),
                    ..
                }) => allocation,
                None => match state.prebound.remove(id) {
                    Some(allocation) => allocation,
                    None => {
                        debug!(resource_id = %id, "Release for unknown resource ignored");
                        continue;
                    }
                },
            };
            state.bindings.remove(&allocation.rm_resource_id);
            shared
                .reclaim(state, allocation, do_not_cache, &mut effects)
                .await;
        }

        shared.apply(state, effects);
        Ok(())
    }

    async fn reassign_resource(
        &self,
        rm_resource_id: &RmResourceId,
        new_resource_id: ResourceId,
    ) -> bool {
        let shared = &self.shared;
        let mut guard = shared.state.lock().await;
        let state = &mut *guard;
        if !state.running() || state.is_tracked(&new_resource_id) {
            return false;
        }

        match shared.cache.take(rm_resource_id).await {
            Some(entry) => {
                BrokerMetrics::incr(&shared.metrics.cache_hits);
                state
                    .bindings
                    .insert(rm_resource_id.clone(), new_resource_id);
                state
                    .prebound
                    .insert(new_resource_id, entry.into_allocation());
                info!(
                    rm_resource_id = %rm_resource_id,
                    resource_id = %new_resource_id,
                    "Cached allocation reassigned"
                );
                true
            }
            None => {
                debug!(rm_resource_id = %rm_resource_id, "Reassign found no cached allocation");
                false
            }
        }
    }

    async fn empty_cache(&self) -> usize {
        let entries = self.shared.cache.drain().await;
        let count = entries.len();
        for entry in entries {
            if let Err(err) = self.shared.backend.release(&entry.rm_resource_id).await {
                warn!(
                    rm_resource_id = %entry.rm_resource_id,
                    error = %err,
                    "Failed to return cached allocation"
                );
            }
        }
        if count > 0 {
            info!(count, "Cache emptied");
        }
        count
    }
}
