//! Cache tiers.
//!
//! A tier is one layer of the lookup chain. The store talks to every tier
//! through [`CacheTier`]; the in-process implementations here cover the memory
//! tier and stand in for the shared and edge tiers when no remote backend is
//! wired in.

use std::fmt;
use std::sync::RwLock;

use async_trait::async_trait;
use dashmap::DashMap;
use lru::LruCache;
use metrics::counter;
use tracing::trace;

use super::config::CacheConfig;
use super::entry::CacheEntry;
use super::error::CacheResult;
use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::tier";
const METRIC_EVICT_TOTAL: &str = "canopy_cache_evict_total";

/// Position of a tier in the lookup chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TierKind {
    /// L1: in-process memory.
    Memory,
    /// L2: shared/distributed store.
    Shared,
    /// L3: edge/CDN store; written in the background.
    Edge,
}

impl TierKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TierKind::Memory => "l1",
            TierKind::Shared => "l2",
            TierKind::Edge => "l3",
        }
    }
}

impl fmt::Display for TierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One storage layer.
///
/// Tiers store entries verbatim and never judge freshness; expiry is decided
/// by the store against its clock.
#[async_trait]
pub trait CacheTier: Send + Sync {
    fn kind(&self) -> TierKind;

    async fn get(&self, key: &str) -> CacheResult<Option<CacheEntry>>;

    async fn put(&self, entry: CacheEntry) -> CacheResult<()>;

    /// Returns whether an entry was present.
    async fn remove(&self, key: &str) -> CacheResult<bool>;

    /// Every stored key, for tiers able to enumerate them.
    async fn keys(&self) -> CacheResult<Option<Vec<String>>> {
        Ok(None)
    }

    async fn clear(&self) -> CacheResult<()>;

    async fn len(&self) -> CacheResult<usize>;
}

/// L1 memory tier with LRU eviction.
pub struct MemoryTier {
    entries: RwLock<LruCache<String, CacheEntry>>,
}

impl MemoryTier {
    pub fn new(config: &CacheConfig) -> Self {
        Self::with_capacity(config.l1_capacity_non_zero())
    }

    pub fn with_capacity(capacity: std::num::NonZeroUsize) -> Self {
        Self {
            entries: RwLock::new(LruCache::new(capacity)),
        }
    }
}

#[async_trait]
impl CacheTier for MemoryTier {
    fn kind(&self) -> TierKind {
        TierKind::Memory
    }

    async fn get(&self, key: &str) -> CacheResult<Option<CacheEntry>> {
        Ok(rw_write(&self.entries, SOURCE, "memory.get").get(key).cloned())
    }

    async fn put(&self, entry: CacheEntry) -> CacheResult<()> {
        let key = entry.key.clone();
        let evicted = rw_write(&self.entries, SOURCE, "memory.put").push(key.clone(), entry);
        // push also hands back the previous value on replacement
        if let Some((evicted_key, _)) = evicted
            && evicted_key != key
        {
            trace!(cache = "l1", key = %evicted_key, "evicted by capacity");
            counter!(METRIC_EVICT_TOTAL, "tier" => TierKind::Memory.as_str()).increment(1);
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> CacheResult<bool> {
        Ok(rw_write(&self.entries, SOURCE, "memory.remove")
            .pop(key)
            .is_some())
    }

    async fn keys(&self) -> CacheResult<Option<Vec<String>>> {
        let entries = rw_read(&self.entries, SOURCE, "memory.keys");
        Ok(Some(entries.iter().map(|(key, _)| key.clone()).collect()))
    }

    async fn clear(&self) -> CacheResult<()> {
        rw_write(&self.entries, SOURCE, "memory.clear").clear();
        Ok(())
    }

    async fn len(&self) -> CacheResult<usize> {
        Ok(rw_read(&self.entries, SOURCE, "memory.len").len())
    }
}

/// Unbounded keyed map playing the shared or edge tier inside one process.
pub struct SharedTier {
    kind: TierKind,
    entries: DashMap<String, CacheEntry>,
}

impl SharedTier {
    pub fn new(kind: TierKind) -> Self {
        Self {
            kind,
            entries: DashMap::new(),
        }
    }
}

#[async_trait]
impl CacheTier for SharedTier {
    fn kind(&self) -> TierKind {
        self.kind
    }

    async fn get(&self, key: &str) -> CacheResult<Option<CacheEntry>> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    async fn put(&self, entry: CacheEntry) -> CacheResult<()> {
        self.entries.insert(entry.key.clone(), entry);
        Ok(())
    }

    async fn remove(&self, key: &str) -> CacheResult<bool> {
        Ok(self.entries.remove(key).is_some())
    }

    async fn keys(&self) -> CacheResult<Option<Vec<String>>> {
        Ok(Some(
            self.entries.iter().map(|entry| entry.key().clone()).collect(),
        ))
    }

    async fn clear(&self) -> CacheResult<()> {
        self.entries.clear();
        Ok(())
    }

    async fn len(&self) -> CacheResult<usize> {
        Ok(self.entries.len())
    }
}
