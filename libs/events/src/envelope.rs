//! Notification envelope - the batch pushed to a registered client.

use chrono::{DateTime, Utc};
use rmb_id::{ClientId, Handle};
use serde::{Deserialize, Serialize};

use crate::AllocationEvent;

/// A batch of allocation events addressed to one registered client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Registration the batch is delivered for.
    pub handle: Handle,

    /// Client owning the registration.
    pub client_id: ClientId,

    /// When the batch was assembled.
    pub created_at: DateTime<Utc>,

    /// Events in generation order.
    pub events: Vec<AllocationEvent>,
}

impl Notification {
    pub fn new(handle: Handle, client_id: ClientId, events: Vec<AllocationEvent>) -> Self {
        Self {
            handle,
            client_id,
            created_at: Utc::now(),
            events,
        }
    }

    /// An empty batch sent to check the client is still reachable.
    pub fn heartbeat(handle: Handle, client_id: ClientId) -> Self {
        Self::new(handle, client_id, Vec::new())
    }

    pub fn is_heartbeat(&self) -> bool {
        self.events.is_empty()
    }

    /// Returns true if events are in non-decreasing generation order.
    pub fn is_ordered(&self) -> bool {
        self.events
            .windows(2)
            .all(|w| w[0].generation <= w[1].generation)
    }
}
