//! External resource-manager capability.
//!
//! The broker consumes the cluster scheduler through `ResourceManager`. Calls
//! are fire-and-forget: grants, rejections and revocations come back later as
//! `RmOutcome`s on the channel handed to `start`.

use std::sync::Arc;

use async_trait::async_trait;
use rmb_events::{Allocation, ResourceRequest, RmResourceId};
use rmb_id::ResourceId;
use thiserror::Error;
use tokio::sync::mpsc;

use super::simulated::{SimulatedConfig, SimulatedResourceManager};

/// Errors reported by a resource-manager backend.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("resource manager unreachable: {0}")]
    Unreachable(String),

    #[error("not registered to a queue")]
    NotRegistered,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Asynchronous outcome of earlier backend calls.
#[derive(Debug, Clone, PartialEq)]
pub enum RmOutcome {
    /// An ask was granted.
    Allocated {
        resource_id: ResourceId,
        allocation: Allocation,
    },
    /// An ask can never be satisfied.
    Rejected {
        resource_id: ResourceId,
        reason: String,
    },
    /// A granted allocation disappeared (node failure).
    Lost { rm_resource_id: RmResourceId },
    /// A granted allocation was taken back by the scheduler.
    Preempted { rm_resource_id: RmResourceId },
    /// The resource manager terminated this broker's registration.
    ShutdownRequested,
}

/// Capability set of an external cluster resource manager.
#[async_trait]
pub trait ResourceManager: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Begins reporting outcomes on `outcomes`.
    async fn start(&self, outcomes: mpsc::UnboundedSender<RmOutcome>) -> Result<(), BackendError>;

    async fn stop(&self);

    async fn register(&self, queue: &str) -> Result<(), BackendError>;

    /// Detaches from the queue. Outstanding asks and grants are dropped.
    async fn unregister(&self) -> Result<(), BackendError>;

    async fn nodes(&self) -> Result<Vec<String>, BackendError>;

    /// Submits asks. With `gang` the batch is granted all-or-nothing.
    async fn request(&self, asks: Vec<ResourceRequest>, gang: bool) -> Result<(), BackendError>;

    /// Withdraws asks. Returns the ids that were still outstanding; any other
    /// id may already have a grant in flight.
    async fn cancel(&self, ids: &[ResourceId]) -> Result<Vec<ResourceId>, BackendError>;

    /// Returns a granted allocation.
    async fn release(&self, rm_resource_id: &RmResourceId) -> Result<(), BackendError>;

    /// Cheap reachability check usable from synchronous paths.
    fn health(&self) -> Result<(), BackendError>;
}

/// Backend variant selected by configuration.
#[derive(Debug, Clone)]
pub enum BackendKind {
    Simulated(SimulatedConfig),
}

impl BackendKind {
    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::Simulated(_) => "simulated",
        }
    }
}

/// Builds the configured backend.
pub fn build_backend(kind: &BackendKind) -> Arc<dyn ResourceManager> {
    match kind {
        BackendKind::Simulated(config) => Arc::new(SimulatedResourceManager::new(config.clone())),
    }
}
