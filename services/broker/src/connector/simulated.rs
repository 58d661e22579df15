//! In-memory resource manager.
//!
//! Models a cluster as a fixed set of nodes with vcore/memory capacity. Asks
//! that fit are granted immediately (or on `grant_waiting` in manual mode),
//! asks that can never fit are rejected, and everything else waits until
//! capacity is released. Used by the `simulated` backend and by tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use rmb_events::{Allocation, Enforcement, ResourceRequest, RmData, RmResourceId};
use rmb_id::ResourceId;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use super::backend::{BackendError, ResourceManager, RmOutcome};

/// One simulated node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedNode {
    pub name: String,
    pub cpu_vcores: i32,
    pub memory_mb: i32,
}

impl SimulatedNode {
    pub fn new(name: impl Into<String>, cpu_vcores: i32, memory_mb: i32) -> Self {
        Self {
            name: name.into(),
            cpu_vcores,
            memory_mb,
        }
    }
}

/// Simulated cluster configuration.
#[derive(Debug, Clone)]
pub struct SimulatedConfig {
    pub nodes: Vec<SimulatedNode>,
    /// Grant fitting asks as soon as they arrive. When false, asks wait for
    /// an explicit `grant_waiting`.
    pub auto_grant: bool,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            nodes: vec![
                SimulatedNode::new("node-a", 8, 16384),
                SimulatedNode::new("node-b", 8, 16384),
            ],
            auto_grant: true,
        }
    }
}

#[derive(Debug)]
struct NodeState {
    node: SimulatedNode,
    cpu_free: i32,
    memory_free: i32,
}

impl NodeState {
    fn fits_now(&self, ask: &ResourceRequest) -> bool {
        self.cpu_free >= ask.cpu_vcores && self.memory_free >= ask.memory_mb
    }

    fn fits_ever(&self, ask: &ResourceRequest) -> bool {
        self.node.cpu_vcores >= ask.cpu_vcores && self.node.memory_mb >= ask.memory_mb
    }
}

#[derive(Debug)]
struct Batch {
    asks: Vec<ResourceRequest>,
    gang: bool,
}

#[derive(Debug)]
struct Grant {
    node: usize,
    cpu_vcores: i32,
    memory_mb: i32,
}

#[derive(Debug)]
struct SimState {
    outcomes: Option<mpsc::UnboundedSender<RmOutcome>>,
    queue: Option<String>,
    nodes: Vec<NodeState>,
    waiting: VecDeque<Batch>,
    grants: HashMap<RmResourceId, Grant>,
    next_container: u64,
}

impl SimState {
    fn send(&self, outcome: RmOutcome) {
        if let Some(tx) = &self.outcomes {
            if tx.send(outcome).is_err() {
                debug!("Outcome receiver dropped");
            }
        }
    }

    fn node_index(&self, name: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.node.name == name)
    }

    /// Node to place `ask` on given `free` capacity, honoring enforcement.
    fn place(&self, ask: &ResourceRequest, free: &[(i32, i32)]) -> Option<usize> {
        let requested = ask.location.as_deref().and_then(|l| self.node_index(l));
        let fits = |i: &usize| free[*i].0 >= ask.cpu_vcores && free[*i].1 >= ask.memory_mb;
        match ask.enforcement {
            Enforcement::Must => requested.filter(fits),
            Enforcement::Preferred => requested
                .into_iter()
                .chain(0..self.nodes.len())
                .find(fits),
        }
    }

    /// Reason `ask` can never be granted, if any.
    fn infeasible(&self, ask: &ResourceRequest) -> Option<String> {
        match (ask.enforcement, ask.location.as_deref()) {
            (Enforcement::Must, Some(location)) => match self.node_index(location) {
                None => Some(format!("unknown node '{}'", location)),
                Some(i) if !self.nodes[i].fits_ever(ask) => {
                    Some(format!("ask exceeds capacity of node '{}'", location))
                }
                Some(_) => None,
            },
            _ if self.nodes.iter().any(|n| n.fits_ever(ask)) => None,
            _ => Some("ask exceeds capacity of every node".to_string()),
        }
    }

    fn grant(&mut self, ask: &ResourceRequest, node: usize) {
        self.next_container += 1;
        let rm_resource_id = RmResourceId::new(format!("container_{:06}", self.next_container));

        let state = &mut self.nodes[node];
        state.cpu_free -= ask.cpu_vcores;
        state.memory_free -= ask.memory_mb;
        let location = state.node.name.clone();

        let mut rm_data = RmData::new();
        if let Some(queue) = &self.queue {
            rm_data.insert("queue".to_string(), serde_json::Value::from(queue.as_str()));
        }

        self.grants.insert(
            rm_resource_id.clone(),
            Grant {
                node,
                cpu_vcores: ask.cpu_vcores,
                memory_mb: ask.memory_mb,
            },
        );

        debug!(
            resource_id = %ask.resource_id,
            rm_resource_id = %rm_resource_id,
            location = %location,
            "Simulated grant"
        );

        self.send(RmOutcome::Allocated {
            resource_id: ask.resource_id,
            allocation: Allocation {
                rm_resource_id,
                rm_data,
                location,
                cpu_vcores: ask.cpu_vcores,
                memory_mb: ask.memory_mb,
            },
        });
    }

    /// Grants every waiting ask that fits. Gang batches are placed whole or
    /// not at all; a batch that does not fit does not block later batches.
    fn grant_waiting(&mut self) -> usize {
        let mut granted = 0;
        let mut still_waiting = VecDeque::new();

        while let Some(mut batch) = self.waiting.pop_front() {
            if batch.gang {
                let mut free: Vec<(i32, i32)> =
                    self.nodes.iter().map(|n| (n.cpu_free, n.memory_free)).collect();
                let mut placement = Vec::with_capacity(batch.asks.len());
                for ask in &batch.asks {
                    match self.place(ask, &free) {
                        Some(i) => {
                            free[i].0 -= ask.cpu_vcores;
                            free[i].1 -= ask.memory_mb;
                            placement.push(i);
                        }
                        None => break,
                    }
                }
                if placement.len() == batch.asks.len() {
                    for (ask, node) in batch.asks.iter().zip(placement) {
                        self.grant(ask, node);
                        granted += 1;
                    }
                } else {
                    still_waiting.push_back(batch);
                }
            } else {
                let mut remaining = Vec::new();
                for ask in batch.asks.drain(..) {
                    let free: Vec<(i32, i32)> =
                        self.nodes.iter().map(|n| (n.cpu_free, n.memory_free)).collect();
                    match self.place(&ask, &free) {
                        Some(node) => {
                            self.grant(&ask, node);
                            granted += 1;
                        }
                        None => remaining.push(ask),
                    }
                }
                if !remaining.is_empty() {
                    batch.asks = remaining;
                    still_waiting.push_back(batch);
                }
            }
        }

        self.waiting = still_waiting;
        granted
    }

    fn free_grant(&mut self, rm_resource_id: &RmResourceId) -> bool {
        match self.grants.remove(rm_resource_id) {
            Some(grant) => {
                let node = &mut self.nodes[grant.node];
                node.cpu_free += grant.cpu_vcores;
                node.memory_free += grant.memory_mb;
                true
            }
            None => false,
        }
    }
}

/// Resource manager backed by an in-memory cluster model.
pub struct SimulatedResourceManager {
    auto_grant: bool,
    reachable: AtomicBool,
    negotiations: AtomicU64,
    state: Mutex<SimState>,
}

impl SimulatedResourceManager {
    pub fn new(config: SimulatedConfig) -> Self {
        let nodes = config
            .nodes
            .into_iter()
            .map(|node| NodeState {
                cpu_free: node.cpu_vcores,
                memory_free: node.memory_mb,
                node,
            })
            .collect();

        Self {
            auto_grant: config.auto_grant,
            reachable: AtomicBool::new(true),
            negotiations: AtomicU64::new(0),
            state: Mutex::new(SimState {
                outcomes: None,
                queue: None,
                nodes,
                waiting: VecDeque::new(),
                grants: HashMap::new(),
                next_container: 0,
            }),
        }
    }

    /// A cluster that only grants on `grant_waiting`.
    pub fn manual(nodes: Vec<SimulatedNode>) -> Self {
        Self::new(SimulatedConfig {
            nodes,
            auto_grant: false,
        })
    }

    fn check_reachable(&self) -> Result<(), BackendError> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BackendError::Unreachable(
                "simulated resource manager offline".to_string(),
            ))
        }
    }

    /// Grants every waiting ask that currently fits.
    pub async fn grant_waiting(&self) -> usize {
        self.state.lock().await.grant_waiting()
    }

    /// Revokes a grant and reports it preempted.
    pub async fn preempt(&self, rm_resource_id: &RmResourceId) -> bool {
        self.revoke(rm_resource_id, true).await
    }

    /// Revokes a grant and reports it lost.
    pub async fn lose(&self, rm_resource_id: &RmResourceId) -> bool {
        self.revoke(rm_resource_id, false).await
    }

    async fn revoke(&self, rm_resource_id: &RmResourceId, preempted: bool) -> bool {
        let mut state = self.state.lock().await;
        if !state.free_grant(rm_resource_id) {
            return false;
        }
        let rm_resource_id = rm_resource_id.clone();
        state.send(if preempted {
            RmOutcome::Preempted { rm_resource_id }
        } else {
            RmOutcome::Lost { rm_resource_id }
        });
        true
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Number of `request` calls accepted so far.
    pub fn negotiations(&self) -> u64 {
        self.negotiations.load(Ordering::SeqCst)
    }

    /// Grants not yet released.
    pub async fn outstanding_grants(&self) -> usize {
        self.state.lock().await.grants.len()
    }

    pub async fn is_granted(&self, rm_resource_id: &RmResourceId) -> bool {
        self.state.lock().await.grants.contains_key(rm_resource_id)
    }

    /// Asks waiting for capacity.
    pub async fn waiting_asks(&self) -> usize {
        self.state
            .lock()
            .await
            .waiting
            .iter()
            .map(|b| b.asks.len())
            .sum()
    }

    /// Simulates the resource manager terminating this broker.
    pub async fn request_shutdown(&self) {
        let mut state = self.state.lock().await;
        state.queue = None;
        state.send(RmOutcome::ShutdownRequested);
    }
}

#[async_trait]
impl ResourceManager for SimulatedResourceManager {
    fn name(&self) -> &'static str {
        "simulated"
    }

    async fn start(&self, outcomes: mpsc::UnboundedSender<RmOutcome>) -> Result<(), BackendError> {
        let mut state = self.state.lock().await;
        state.outcomes = Some(outcomes);
        info!(nodes = state.nodes.len(), "Simulated resource manager started");
        Ok(())
    }

    async fn stop(&self) {
        let mut state = self.state.lock().await;
        state.outcomes = None;
        info!("Simulated resource manager stopped");
    }

    async fn register(&self, queue: &str) -> Result<(), BackendError> {
        self.check_reachable()?;
        let mut state = self.state.lock().await;
        state.queue = Some(queue.to_string());
        info!(queue = %queue, "Registered with simulated resource manager");
        Ok(())
    }

    async fn unregister(&self) -> Result<(), BackendError> {
        let mut state = self.state.lock().await;
        state.queue = None;
        state.waiting.clear();
        let grants: Vec<RmResourceId> = state.grants.keys().cloned().collect();
        for rm_resource_id in &grants {
            state.free_grant(rm_resource_id);
        }
        if !grants.is_empty() {
            debug!(count = grants.len(), "Dropped grants on unregister");
        }
        Ok(())
    }

    async fn nodes(&self) -> Result<Vec<String>, BackendError> {
        self.check_reachable()?;
        let state = self.state.lock().await;
        Ok(state.nodes.iter().map(|n| n.node.name.clone()).collect())
    }

    async fn request(&self, asks: Vec<ResourceRequest>, gang: bool) -> Result<(), BackendError> {
        self.check_reachable()?;
        let mut state = self.state.lock().await;
        if state.queue.is_none() {
            return Err(BackendError::NotRegistered);
        }
        self.negotiations.fetch_add(1, Ordering::SeqCst);

        let mut accepted = Vec::with_capacity(asks.len());
        let mut rejected = Vec::new();
        for ask in asks {
            match state.infeasible(&ask) {
                Some(reason) => rejected.push((ask, reason)),
                None => accepted.push(ask),
            }
        }

        if gang && !rejected.is_empty() {
            let reason = format!("gang member infeasible: {}", rejected[0].1);
            for ask in accepted.drain(..) {
                rejected.push((ask, reason.clone()));
            }
        }

        for (ask, reason) in rejected {
            warn!(resource_id = %ask.resource_id, reason = %reason, "Simulated ask rejected");
            state.send(RmOutcome::Rejected {
                resource_id: ask.resource_id,
                reason,
            });
        }

        if !accepted.is_empty() {
            state.waiting.push_back(Batch {
                asks: accepted,
                gang,
            });
        }

        if self.auto_grant {
            state.grant_waiting();
        }
        Ok(())
    }

    async fn cancel(&self, ids: &[ResourceId]) -> Result<Vec<ResourceId>, BackendError> {
        self.check_reachable()?;
        let wanted: HashSet<&ResourceId> = ids.iter().collect();
        let mut state = self.state.lock().await;

        let mut cancelled = Vec::new();
        for batch in state.waiting.iter_mut() {
            batch.asks.retain(|ask| {
                if wanted.contains(&ask.resource_id) {
                    cancelled.push(ask.resource_id);
                    false
                } else {
                    true
                }
            });
        }
        state.waiting.retain(|b| !b.asks.is_empty());
        Ok(cancelled)
    }

    async fn release(&self, rm_resource_id: &RmResourceId) -> Result<(), BackendError> {
        self.check_reachable()?;
        let mut state = self.state.lock().await;
        if !state.free_grant(rm_resource_id) {
            debug!(rm_resource_id = %rm_resource_id, "Release of unknown grant ignored");
            return Ok(());
        }
        if self.auto_grant {
            state.grant_waiting();
        }
        Ok(())
    }

    fn health(&self) -> Result<(), BackendError> {
        self.check_reachable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn started(
        rm: &SimulatedResourceManager,
    ) -> mpsc::UnboundedReceiver<RmOutcome> {
        let (tx, rx) = mpsc::unbounded_channel();
        rm.start(tx).await.unwrap();
        rm.register("default").await.unwrap();
        rx
    }

    fn one_node() -> Vec<SimulatedNode> {
        vec![SimulatedNode::new("node-a", 4, 4096)]
    }

    #[tokio::test]
    async fn test_grants_on_requested_node() {
        let rm = SimulatedResourceManager::new(SimulatedConfig::default());
        let mut rx = started(&rm).await;

        let ask = ResourceRequest::new("default", 1, 1024).at("node-b", Enforcement::Must);
        rm.request(vec![ask.clone()], false).await.unwrap();

        match rx.recv().await.unwrap() {
            RmOutcome::Allocated {
                resource_id,
                allocation,
            } => {
                assert_eq!(resource_id, ask.resource_id);
                assert_eq!(allocation.location, "node-b");
                assert_eq!(allocation.cpu_vcores, 1);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(rm.negotiations(), 1);
    }

    #[tokio::test]
    async fn test_unknown_must_node_rejected() {
        let rm = SimulatedResourceManager::new(SimulatedConfig::default());
        let mut rx = started(&rm).await;

        let ask = ResourceRequest::new("default", 1, 1024).at("node-z", Enforcement::Must);
        rm.request(vec![ask], false).await.unwrap();
        assert!(matches!(rx.recv().await, Some(RmOutcome::Rejected { .. })));
    }

    #[tokio::test]
    async fn test_gang_waits_until_whole_batch_fits() {
        let rm = SimulatedResourceManager::new(SimulatedConfig {
            nodes: one_node(),
            auto_grant: true,
        });
        let mut rx = started(&rm).await;

        let first = ResourceRequest::new("default", 3, 1024);
        rm.request(vec![first], false).await.unwrap();
        let granted = match rx.recv().await {
            Some(RmOutcome::Allocated { allocation, .. }) => allocation.rm_resource_id,
            other => panic!("unexpected outcome: {:?}", other),
        };

        let gang = vec![
            ResourceRequest::new("default", 2, 1024),
            ResourceRequest::new("default", 2, 1024),
        ];
        rm.request(gang, true).await.unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(rm.waiting_asks().await, 2);

        rm.release(&granted).await.unwrap();
        assert!(matches!(rx.recv().await, Some(RmOutcome::Allocated { .. })));
        assert!(matches!(rx.recv().await, Some(RmOutcome::Allocated { .. })));
        assert_eq!(rm.waiting_asks().await, 0);
    }

    #[tokio::test]
    async fn test_gang_rejected_as_a_whole() {
        let rm = SimulatedResourceManager::new(SimulatedConfig::default());
        let mut rx = started(&rm).await;

        let gang = vec![
            ResourceRequest::new("default", 1, 1024),
            ResourceRequest::new("default", 64, 1024),
        ];
        rm.request(gang, true).await.unwrap();
        assert!(matches!(rx.recv().await, Some(RmOutcome::Rejected { .. })));
        assert!(matches!(rx.recv().await, Some(RmOutcome::Rejected { .. })));
        assert_eq!(rm.outstanding_grants().await, 0);
    }

    #[tokio::test]
    async fn test_cancel_waiting_ask() {
        let rm = SimulatedResourceManager::manual(one_node());
        let _rx = started(&rm).await;

        let ask = ResourceRequest::new("default", 1, 512);
        rm.request(vec![ask.clone()], false).await.unwrap();
        let cancelled = rm.cancel(&[ask.resource_id]).await.unwrap();

        assert_eq!(cancelled, vec![ask.resource_id]);
        assert_eq!(rm.grant_waiting().await, 0);
    }

    #[tokio::test]
    async fn test_unreachable() {
        let rm = SimulatedResourceManager::new(SimulatedConfig::default());
        rm.set_reachable(false);
        assert!(matches!(
            rm.register("default").await,
            Err(BackendError::Unreachable(_))
        ));
        assert!(rm.health().is_err());
    }

    #[tokio::test]
    async fn test_request_requires_queue() {
        let rm = SimulatedResourceManager::new(SimulatedConfig::default());
        let ask = ResourceRequest::new("default", 1, 512);
        assert!(matches!(
            rm.request(vec![ask], false).await,
            Err(BackendError::NotRegistered)
        ));
    }

    #[tokio::test]
    async fn test_preempt_frees_capacity() {
        let rm = SimulatedResourceManager::new(SimulatedConfig {
            nodes: one_node(),
            auto_grant: true,
        });
        let mut rx = started(&rm).await;

        rm.request(vec![ResourceRequest::new("default", 4, 4096)], false)
            .await
            .unwrap();
        let rm_id = match rx.recv().await {
            Some(RmOutcome::Allocated { allocation, .. }) => allocation.rm_resource_id,
            other => panic!("unexpected outcome: {:?}", other),
        };

        assert!(rm.preempt(&rm_id).await);
        assert_eq!(
            rx.recv().await,
            Some(RmOutcome::Preempted {
                rm_resource_id: rm_id.clone()
            })
        );
        assert!(!rm.preempt(&rm_id).await);
        assert_eq!(rm.outstanding_grants().await, 0);
    }
}
