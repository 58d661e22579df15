//! Error types for request and event handling.

use rmb_id::ResourceId;
use thiserror::Error;

/// Errors that can occur when validating requests or handling events.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventError {
    /// A resource request is malformed.
    #[error("invalid request {resource_id}: {reason}")]
    InvalidRequest {
        resource_id: ResourceId,
        reason: String,
    },

    /// The same resource id appears more than once in a submission.
    #[error("duplicate resource id {0}")]
    DuplicateResourceId(ResourceId),
}
