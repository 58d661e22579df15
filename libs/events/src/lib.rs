//! # rmb-events
//!
//! Request and event types exchanged between the broker, its resource-manager
//! connectors and notified clients.
//!
//! ## Design Principles
//!
//! - Events are immutable descriptions of what happened to one logical resource
//! - Allocation events carry the granted shape and the external handle;
//!   status-change events carry only the resource id and the new status
//! - Every event carries a generation number so per-resource order can be checked
//!
//! ## Types
//!
//! - `ResourceRequest`: one ask for CPU/memory on a node, validated before submission
//! - `AllocationEvent`: outcome reported by a connector
//! - `Notification`: a batch of events addressed to one registered client

mod envelope;
mod error;
mod types;

pub use envelope::*;
pub use error::EventError;
pub use types::*;
