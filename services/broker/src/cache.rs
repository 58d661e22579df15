//! Cache of released allocations awaiting reuse.
//!
//! Entries are indexed three ways:
//! - by the external `RmResourceId`, for `reassign_resource`
//! - by shape (cpu, memory), for matching new requests without negotiation
//! - by insertion order, for least-recently-inserted eviction and expiry
//!
//! The cache never talks to the resource manager itself. Operations that
//! remove entries without handing them to a caller (capacity overflow,
//! expiry, drain) return them so the connector can give them back upstream.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use rmb_events::{Allocation, Enforcement, ResourceRequest, RmData, RmResourceId};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Configuration for the resource cache.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Whether released allocations are cached at all.
    pub enabled: bool,
    /// Entries older than this are returned upstream.
    pub max_age: Duration,
    /// Maximum number of entries; the oldest insertion is evicted on overflow.
    pub capacity: usize,
    /// How often the expiry scan runs.
    pub eviction_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_age: Duration::from_secs(30),
            capacity: 1024,
            eviction_interval: Duration::from_secs(5),
        }
    }
}

/// Allocation shape used to match requests against cached entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Shape {
    pub cpu_vcores: i32,
    pub memory_mb: i32,
}

impl From<&ResourceRequest> for Shape {
    fn from(request: &ResourceRequest) -> Self {
        Self {
            cpu_vcores: request.cpu_vcores,
            memory_mb: request.memory_mb,
        }
    }
}

/// A released allocation held for reuse.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub rm_resource_id: RmResourceId,
    pub rm_data: RmData,
    pub location: String,
    pub cpu_vcores: i32,
    pub memory_mb: i32,
    pub inserted_at: Instant,
}

impl CacheEntry {
    pub fn from_allocation(allocation: Allocation) -> Self {
        Self {
            rm_resource_id: allocation.rm_resource_id,
            rm_data: allocation.rm_data,
            location: allocation.location,
            cpu_vcores: allocation.cpu_vcores,
            memory_mb: allocation.memory_mb,
            inserted_at: Instant::now(),
        }
    }

    pub fn shape(&self) -> Shape {
        Shape {
            cpu_vcores: self.cpu_vcores,
            memory_mb: self.memory_mb,
        }
    }

    pub fn into_allocation(self) -> Allocation {
        Allocation {
            rm_resource_id: self.rm_resource_id,
            rm_data: self.rm_data,
            location: self.location,
            cpu_vcores: self.cpu_vcores,
            memory_mb: self.memory_mb,
        }
    }
}

#[derive(Debug, Default)]
struct CacheInner {
    next_seq: u64,
    entries: HashMap<RmResourceId, (u64, CacheEntry)>,
    by_insertion: BTreeMap<u64, RmResourceId>,
    by_shape: HashMap<Shape, BTreeMap<u64, RmResourceId>>,
}

impl CacheInner {
    fn remove(&mut self, rm_resource_id: &RmResourceId) -> Option<CacheEntry> {
        let (seq, entry) = self.entries.remove(rm_resource_id)?;
        self.by_insertion.remove(&seq);
        let shape = entry.shape();
        if let Some(bucket) = self.by_shape.get_mut(&shape) {
            bucket.remove(&seq);
            if bucket.is_empty() {
                self.by_shape.remove(&shape);
            }
        }
        Some(entry)
    }

    fn oldest(&self) -> Option<RmResourceId> {
        self.by_insertion.values().next().cloned()
    }
}

/// Bounded store of released allocations for one connector.
#[derive(Debug)]
pub struct ResourceCache {
    config: CacheConfig,
    inner: Mutex<CacheInner>,
}

impl ResourceCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Adds an entry. Returns entries pushed out by the capacity bound.
    pub async fn insert(&self, entry: CacheEntry) -> Vec<CacheEntry> {
        if self.config.capacity == 0 {
            return vec![entry];
        }

        let mut inner = self.inner.lock().await;
        let mut evicted = Vec::new();
        // Re-inserting an id refreshes it.
        inner.remove(&entry.rm_resource_id);

        let seq = inner.next_seq;
        inner.next_seq += 1;
        let rm_resource_id = entry.rm_resource_id.clone();
        inner
            .by_shape
            .entry(entry.shape())
            .or_default()
            .insert(seq, rm_resource_id.clone());
        inner.by_insertion.insert(seq, rm_resource_id.clone());
        inner.entries.insert(rm_resource_id, (seq, entry));

        while inner.entries.len() > self.config.capacity {
            let Some(oldest) = inner.oldest() else { break };
            if let Some(entry) = inner.remove(&oldest) {
                debug!(rm_resource_id = %entry.rm_resource_id, "Cache full, evicting oldest entry");
                evicted.push(entry);
            }
        }

        evicted
    }

    /// Consumes the entry for `rm_resource_id`, if cached.
    pub async fn take(&self, rm_resource_id: &RmResourceId) -> Option<CacheEntry> {
        self.inner.lock().await.remove(rm_resource_id)
    }

    /// Consumes the oldest entry able to satisfy `request`.
    ///
    /// Shapes must match exactly. `Must` requests only accept their location;
    /// `Preferred` requests take their location if cached, otherwise any.
    pub async fn take_matching(&self, request: &ResourceRequest) -> Option<CacheEntry> {
        let mut inner = self.inner.lock().await;
        let bucket = inner.by_shape.get(&Shape::from(request))?;

        let same_location = request.location.as_deref().and_then(|location| {
            bucket
                .values()
                .find(|id| inner.entries[*id].1.location == location)
                .cloned()
        });

        let chosen = match (same_location, request.enforcement) {
            (Some(id), _) => id,
            (None, Enforcement::Must) => return None,
            (None, Enforcement::Preferred) => bucket.values().next()?.clone(),
        };

        inner.remove(&chosen)
    }

    /// Removes and returns entries at least `max_age` old.
    pub async fn expire(&self) -> Vec<CacheEntry> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        let mut expired = Vec::new();

        // Insertion order is age order.
        while let Some(oldest) = inner.oldest() {
            let (_, entry) = &inner.entries[&oldest];
            if now.duration_since(entry.inserted_at) < self.config.max_age {
                break;
            }
            if let Some(entry) = inner.remove(&oldest) {
                expired.push(entry);
            }
        }

        expired
    }

    /// Removes and returns every entry.
    pub async fn drain(&self) -> Vec<CacheEntry> {
        let mut inner = self.inner.lock().await;
        let mut order = std::mem::take(&mut inner.by_insertion);
        let mut entries = std::mem::take(&mut inner.entries);
        inner.by_shape.clear();
        order
            .values_mut()
            .filter_map(|id| entries.remove(id).map(|(_, e)| e))
            .collect()
    }

    pub async fn contains(&self, rm_resource_id: &RmResourceId) -> bool {
        self.inner.lock().await.entries.contains_key(rm_resource_id)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
