//! Resource request and allocation event definitions.

use std::collections::{BTreeMap, HashSet};

use rmb_id::ResourceId;
use serde::{Deserialize, Serialize};

use crate::EventError;

// =============================================================================
// Requests
// =============================================================================

/// How strictly the requested location must be honored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Enforcement {
    /// Only the requested node is acceptable.
    Must,
    /// The requested node is preferred; any node is acceptable.
    #[default]
    Preferred,
}

impl std::fmt::Display for Enforcement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Enforcement::Must => write!(f, "must"),
            Enforcement::Preferred => write!(f, "preferred"),
        }
    }
}

/// A request for CPU and memory on a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    /// Logical id, unique among outstanding requests of one connector.
    pub resource_id: ResourceId,

    /// Requested node, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,

    /// Virtual cores requested.
    pub cpu_vcores: i32,

    /// Memory requested in MB.
    pub memory_mb: i32,

    /// Whether the location is mandatory.
    pub enforcement: Enforcement,

    /// Scheduling partition the request is charged to.
    pub queue: String,
}

impl ResourceRequest {
    /// Creates a request with a fresh resource id and preferred enforcement.
    pub fn new(queue: impl Into<String>, cpu_vcores: i32, memory_mb: i32) -> Self {
        Self {
            resource_id: ResourceId::new(),
            location: None,
            cpu_vcores,
            memory_mb,
            enforcement: Enforcement::Preferred,
            queue: queue.into(),
        }
    }

    /// Sets the resource id.
    pub fn with_resource_id(mut self, resource_id: ResourceId) -> Self {
        self.resource_id = resource_id;
        self
    }

    /// Sets the location and its enforcement.
    pub fn at(mut self, location: impl Into<String>, enforcement: Enforcement) -> Self {
        self.location = Some(location.into());
        self.enforcement = enforcement;
        self
    }

    /// Checks the request is well formed.
    pub fn validate(&self) -> Result<(), EventError> {
        let invalid = |reason: &str| EventError::InvalidRequest {
            resource_id: self.resource_id,
            reason: reason.to_string(),
        };

        if self.cpu_vcores < 0 {
            return Err(invalid("cpu_vcores cannot be negative"));
        }
        if self.memory_mb < 0 {
            return Err(invalid("memory_mb cannot be negative"));
        }
        if self.cpu_vcores == 0 && self.memory_mb == 0 {
            return Err(invalid("request must ask for cpu or memory"));
        }
        if self.queue.is_empty() {
            return Err(invalid("queue cannot be empty"));
        }
        match &self.location {
            Some(location) if location.is_empty() => {
                return Err(invalid("location cannot be empty"));
            }
            None if self.enforcement == Enforcement::Must => {
                return Err(invalid("must enforcement requires a location"));
            }
            _ => {}
        }
        Ok(())
    }
}

/// Validates a batch of requests: each must be well formed and ids must not repeat.
pub fn validate_batch(requests: &[ResourceRequest]) -> Result<(), EventError> {
    let mut seen = HashSet::with_capacity(requests.len());
    for request in requests {
        request.validate()?;
        if !seen.insert(request.resource_id) {
            return Err(EventError::DuplicateResourceId(request.resource_id));
        }
    }
    Ok(())
}

// =============================================================================
// Events
// =============================================================================

/// Opaque handle the external resource manager uses for a granted allocation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RmResourceId(String);

impl RmResourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RmResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Backend-specific payload attached to a grant.
pub type RmData = BTreeMap<String, serde_json::Value>;

/// Lifecycle status of a logical resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    Pending,
    Allocated,
    Lost,
    Preempted,
    Rejected,
}

impl ResourceStatus {
    /// Returns true if no further event follows this status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ResourceStatus::Lost | ResourceStatus::Preempted | ResourceStatus::Rejected
        )
    }
}

impl std::fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResourceStatus::Pending => "pending",
            ResourceStatus::Allocated => "allocated",
            ResourceStatus::Lost => "lost",
            ResourceStatus::Preempted => "preempted",
            ResourceStatus::Rejected => "rejected",
        };
        write!(f, "{}", s)
    }
}

/// What the external resource manager granted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub rm_resource_id: RmResourceId,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub rm_data: RmData,
    pub location: String,
    pub cpu_vcores: i32,
    pub memory_mb: i32,
}

/// Outcome reported for one logical resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationEvent {
    pub resource_id: ResourceId,
    pub status: ResourceStatus,

    /// Present only when `status` is `Allocated`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allocation: Option<Allocation>,

    /// Monotonic per-connector emission counter.
    #[serde(default)]
    pub generation: u64,
}

impl AllocationEvent {
    /// An allocation event.
    pub fn allocated(resource_id: ResourceId, allocation: Allocation) -> Self {
        Self {
            resource_id,
            status: ResourceStatus::Allocated,
            allocation: Some(allocation),
            generation: 0,
        }
    }

    /// A pure status change. Use `allocated` for grants.
    pub fn status_change(resource_id: ResourceId, status: ResourceStatus) -> Self {
        debug_assert!(status != ResourceStatus::Allocated);
        Self {
            resource_id,
            status,
            allocation: None,
            generation: 0,
        }
    }

    pub fn with_generation(mut self, generation: u64) -> Self {
        self.generation = generation;
        self
    }

    pub fn is_allocation(&self) -> bool {
        self.allocation.is_some()
    }

    pub fn rm_resource_id(&self) -> Option<&RmResourceId> {
        self.allocation.as_ref().map(|a| &a.rm_resource_id)
    }

    pub fn location(&self) -> Option<&str> {
        self.allocation.as_ref().map(|a| a.location.as_str())
    }

    pub fn cpu_vcores(&self) -> Option<i32> {
        self.allocation.as_ref().map(|a| a.cpu_vcores)
    }

    pub fn memory_mb(&self) -> Option<i32> {
        self.allocation.as_ref().map(|a| a.memory_mb)
    }
}

impl std::fmt::Display for AllocationEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.allocation {
            Some(a) => write!(
                f,
                "event[{} {} cpu={} mem={} location={}]",
                self.resource_id, self.status, a.cpu_vcores, a.memory_mb, a.location
            ),
            None => write!(f, "event[{} {}]", self.resource_id, self.status),
        }
    }
}
