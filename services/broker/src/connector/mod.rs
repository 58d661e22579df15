//! Resource-manager connector.
//!
//! A connector attaches the broker to one queue of an external resource
//! manager. Callers submit and release `ResourceRequest`s; outcomes are
//! never returned synchronously but reported later through an
//! `AllocationListener`.
//!
//! ## Per-request lifecycle
//!
//! ```text
//! PENDING -> ALLOCATED -> released -> CACHED -> REASSIGNED | EXPIRED
//! PENDING -> REJECTED
//! ALLOCATED -> LOST | PREEMPTED
//! ```
//!
//! A grant that arrives after its request was released is reclaimed (cached
//! or returned upstream), never reported as a fresh allocation.

mod backend;
mod caching;
mod simulated;

use std::sync::Arc;

use async_trait::async_trait;
use rmb_events::{AllocationEvent, ResourceRequest, RmResourceId};
use rmb_id::ResourceId;

use crate::error::BrokerResult;

pub use backend::{build_backend, BackendError, BackendKind, ResourceManager, RmOutcome};
pub use caching::CachingConnector;
pub use simulated::{SimulatedConfig, SimulatedNode, SimulatedResourceManager};

/// Sink for connector outcomes.
///
/// Called with the connector's internal lock held: implementations must
/// hand events off and return without blocking.
pub trait AllocationListener: Send + Sync {
    fn on_events(&self, events: Vec<AllocationEvent>);

    /// The resource manager terminated this broker's registration.
    fn on_stopped_by_rm(&self) {}
}

/// Pluggable adapter over an external resource manager.
#[async_trait]
pub trait ResourceManagerConnector: Send + Sync {
    /// Installs the outcome sink. Must be called before `start`.
    fn set_listener(&self, listener: Arc<dyn AllocationListener>);

    async fn start(&self) -> BrokerResult<()>;

    /// Stops the connector and returns every held allocation upstream.
    /// Idempotent.
    async fn stop(&self) -> BrokerResult<()>;

    /// Attaches to `queue`. Must precede `reserve`.
    async fn register_queue(&self, queue: &str) -> BrokerResult<()>;

    /// Detaches from the queue. Safe to call repeatedly or before `register_queue`.
    async fn unregister_queue(&self) -> BrokerResult<()>;

    /// Snapshot of cluster node names.
    async fn get_nodes(&self) -> BrokerResult<Vec<String>>;

    /// Submits requests. Fails synchronously only for malformed input, when
    /// not registered, or when the resource manager is unreachable.
    async fn reserve(&self, requests: Vec<ResourceRequest>, gang: bool) -> BrokerResult<()>;

    /// Cancels pending requests and reclaims granted ones.
    async fn release(&self, resource_ids: &[ResourceId], do_not_cache: bool) -> BrokerResult<()>;

    /// Binds a cached allocation to `new_resource_id`. Returns false if no
    /// unconsumed cache entry exists for `rm_resource_id`.
    async fn reassign_resource(
        &self,
        rm_resource_id: &RmResourceId,
        new_resource_id: ResourceId,
    ) -> bool;

    /// Returns every cached allocation upstream before returning. Yields the
    /// number of entries flushed.
    async fn empty_cache(&self) -> usize;
}
