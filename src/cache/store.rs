//! Tiered cache store.
//!
//! Reads walk L1 -> L2 -> L3 and promote hits upward. Writes land in L1 and L2
//! before returning; L3 is populated by a background task. Every write for a
//! key is serialized through a striped lock and stamped with a generation from
//! the tag index, so late background work never overwrites or deletes a newer
//! value.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use metrics::counter;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use super::clock::{SharedClock, system_clock};
use super::config::{CacheConfig, Environment};
use super::entry::CacheEntry;
use super::error::{CacheError, CacheResult};
use super::flight::{KeyLocks, SingleFlight};
use super::keys::{KeyPattern, validate_key};
use super::lock::mutex_lock;
use super::registry::TagIndex;
use super::tier::{CacheTier, MemoryTier, SharedTier, TierKind};

const SOURCE: &str = "cache::store";

const METRIC_HIT_TOTAL: &str = "canopy_cache_hit_total";
const METRIC_MISS_TOTAL: &str = "canopy_cache_miss_total";
const METRIC_PROMOTE_TOTAL: &str = "canopy_cache_promote_total";
const METRIC_LOAD_TOTAL: &str = "canopy_cache_load_total";
const METRIC_INVALIDATED_TOTAL: &str = "canopy_cache_invalidated_total";
const METRIC_TIER_ERROR_TOTAL: &str = "canopy_cache_tier_error_total";
const METRIC_EVICT_TOTAL: &str = "canopy_cache_evict_total";

/// The tier chain a store reads through, fastest first.
pub struct Tiers {
    pub l1: Arc<dyn CacheTier>,
    pub l2: Option<Arc<dyn CacheTier>>,
    pub l3: Option<Arc<dyn CacheTier>>,
}

impl Tiers {
    /// All tiers held in this process.
    pub fn in_process(config: &CacheConfig) -> Self {
        Self {
            l1: Arc::new(MemoryTier::new(config)),
            l2: config
                .enable_l2
                .then(|| Arc::new(SharedTier::new(TierKind::Shared)) as Arc<dyn CacheTier>),
            l3: config
                .enable_l3
                .then(|| Arc::new(SharedTier::new(TierKind::Edge)) as Arc<dyn CacheTier>),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub l1_entries: usize,
    pub tracked_keys: usize,
    pub tracked_tags: usize,
    pub loads_in_flight: usize,
}

pub struct CacheStore {
    l1: Arc<dyn CacheTier>,
    l2: Option<Arc<dyn CacheTier>>,
    l3: Option<Arc<dyn CacheTier>>,
    index: Arc<TagIndex>,
    locks: Arc<KeyLocks>,
    flights: SingleFlight,
    clock: SharedClock,
    environment: Environment,
    tier_timeout: Duration,
    max_key_len: usize,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl CacheStore {
    pub fn new(config: &CacheConfig) -> Self {
        Self::with_clock(config, system_clock())
    }

    pub fn with_clock(config: &CacheConfig, clock: SharedClock) -> Self {
        Self::from_tiers(config, Tiers::in_process(config), clock)
    }

    pub fn from_tiers(config: &CacheConfig, tiers: Tiers, clock: SharedClock) -> Self {
        Self {
            l1: tiers.l1,
            l2: tiers.l2,
            l3: tiers.l3,
            index: Arc::new(TagIndex::new()),
            locks: Arc::new(KeyLocks::new(config.lock_stripes_non_zero())),
            flights: SingleFlight::new(),
            clock,
            environment: config.environment,
            tier_timeout: config.tier_timeout(),
            max_key_len: config.max_key_len,
            background: Mutex::new(Vec::new()),
        }
    }

    pub fn tag_index(&self) -> &Arc<TagIndex> {
        &self.index
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn environment(&self) -> Environment {
        self.environment
    }

    pub fn max_key_len(&self) -> usize {
        self.max_key_len
    }

    fn chain(&self) -> Vec<&Arc<dyn CacheTier>> {
        std::iter::once(&self.l1)
            .chain(self.l2.iter())
            .chain(self.l3.iter())
            .collect()
    }

    /// Value for `key` if any tier holds a servable (fresh or stale) entry.
    pub async fn get(&self, key: &str) -> CacheResult<Option<Bytes>> {
        Ok(self.lookup(key).await?.map(|entry| entry.value))
    }

    /// Full entry for `key`, so callers can judge freshness themselves.
    ///
    /// A failed or timed-out tier is treated as a miss for that tier. Expired
    /// entries are evicted on sight.
    #[instrument(skip(self))]
    pub async fn lookup(&self, key: &str) -> CacheResult<Option<CacheEntry>> {
        validate_key(key, self.max_key_len)?;

        let chain = self.chain();
        let now = self.clock.now();

        for (depth, tier) in chain.iter().enumerate() {
            let kind = tier.kind();
            let Ok(Some(entry)) = bounded(kind, "get", self.tier_timeout, tier.get(key)).await
            else {
                continue;
            };

            if !entry.freshness(now).is_servable() {
                self.evict_expired(Arc::as_ref(tier), &entry).await;
                continue;
            }

            counter!(METRIC_HIT_TOTAL, "tier" => kind.as_str()).increment(1);
            if depth == 0 {
                return Ok(Some(entry));
            }
            let promoted = self.promote(&chain[..depth], Arc::as_ref(tier), entry).await;
            return Ok(Some(promoted));
        }

        counter!(METRIC_MISS_TOTAL).increment(1);
        Ok(None)
    }

    async fn promote(
        &self,
        upper: &[&Arc<dyn CacheTier>],
        source: &dyn CacheTier,
        mut entry: CacheEntry,
    ) -> CacheEntry {
        let _guard = self.locks.lock(&entry.key).await;

        match self.index.generation(&entry.key) {
            Some(current) if current == entry.generation => {}
            // a newer local write already owns the upper tiers
            Some(_) => return entry,
            None => {
                // written elsewhere, or deleted since we read it
                match bounded(source.kind(), "get", self.tier_timeout, source.get(&entry.key)).await {
                    Ok(Some(current)) if current.generation == entry.generation => {}
                    _ => return entry,
                }
                entry.generation = self.index.associate(&entry.key, entry.tags.iter().cloned());
            }
        }

        for tier in upper {
            let kind = tier.kind();
            if bounded(kind, "put", self.tier_timeout, tier.put(entry.clone()))
                .await
                .is_ok()
            {
                counter!(METRIC_PROMOTE_TOTAL, "tier" => kind.as_str()).increment(1);
            }
        }
        entry
    }

    async fn evict_expired(&self, tier: &dyn CacheTier, expired: &CacheEntry) {
        let _guard = self.locks.lock(&expired.key).await;
        let kind = tier.kind();

        match bounded(kind, "get", self.tier_timeout, tier.get(&expired.key)).await {
            Ok(Some(current)) if current.generation == expired.generation => {}
            _ => return,
        }
        if bounded(kind, "remove", self.tier_timeout, tier.remove(&expired.key))
            .await
            .is_ok()
        {
            debug!(cache = kind.as_str(), key = %expired.key, "evicted expired entry");
            counter!(METRIC_EVICT_TOTAL, "tier" => kind.as_str()).increment(1);
        }
        self.index.remove_key_if(&expired.key, expired.generation);
    }

    /// Cache `value` under `key` in every tier.
    ///
    /// A TTL of zero caches nothing; a negative TTL is rejected. L1 and L2 are
    /// written before returning, L3 in the background.
    #[instrument(skip(self, value, tags))]
    pub async fn set<I, S>(&self, key: &str, value: Bytes, ttl_secs: i64, tags: I) -> CacheResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ttl_secs = checked_ttl(ttl_secs)?;
        self.insert(key, value, ttl_secs, 0, tags).await
    }

    /// [`set`](Self::set) with a stale-while-revalidate window.
    pub async fn insert<I, S>(
        &self,
        key: &str,
        value: Bytes,
        ttl_secs: u64,
        stale_window_secs: u64,
        tags: I,
    ) -> CacheResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        validate_key(key, self.max_key_len)?;
        if ttl_secs == 0 {
            return Ok(());
        }
        let tags = tags.into_iter().map(Into::into).collect();
        self.write(key, value, ttl_secs, stale_window_secs, tags).await
    }

    async fn write(
        &self,
        key: &str,
        value: Bytes,
        ttl_secs: u64,
        stale_window_secs: u64,
        tags: BTreeSet<String>,
    ) -> CacheResult<()> {
        let _guard = self.locks.lock(key).await;

        let generation = self.index.associate(key, tags.iter().cloned());
        let entry = CacheEntry {
            key: key.to_string(),
            value,
            tags,
            created_at: self.clock.now(),
            ttl_secs,
            stale_window_secs,
            generation,
        };

        let memory = bounded(
            TierKind::Memory,
            "put",
            self.tier_timeout,
            self.l1.put(entry.clone()),
        )
        .await;
        let shared = match &self.l2 {
            Some(l2) => bounded(l2.kind(), "put", self.tier_timeout, l2.put(entry.clone())).await,
            None => Ok(()),
        };
        self.spawn_edge_write(entry);

        memory.and(shared)
    }

    fn spawn_edge_write(&self, entry: CacheEntry) {
        let Some(l3) = self.l3.clone() else {
            return;
        };
        let index = Arc::clone(&self.index);
        let locks = Arc::clone(&self.locks);
        let limit = self.tier_timeout;

        let task = tokio::spawn(async move {
            let _guard = locks.lock(&entry.key).await;
            if index.generation(&entry.key) != Some(entry.generation) {
                debug!(cache = "l3", key = %entry.key, "skipping superseded edge write");
                return;
            }
            let kind = l3.kind();
            // failures are already logged and counted by `bounded`
            let _ = bounded(kind, "put", limit, l3.put(entry)).await;
        });
        self.track(task);
    }

    fn track(&self, task: JoinHandle<()>) {
        let mut background = mutex_lock(&self.background, SOURCE, "track");
        background.retain(|task| !task.is_finished());
        background.push(task);
    }

    /// Wait for every background tier write issued so far.
    pub async fn flush_background(&self) {
        let pending = std::mem::take(&mut *mutex_lock(&self.background, SOURCE, "flush"));
        for task in pending {
            if let Err(err) = task.await {
                warn!(error = %err, "background cache write aborted");
            }
        }
    }

    /// Return the cached value, or run `loader` once for all concurrent callers
    /// and cache its result.
    ///
    /// Loader errors reach every waiting caller and are never cached. A failure
    /// to cache a loaded value is logged; the value is still returned.
    #[instrument(skip(self, tags, loader))]
    pub async fn get_or_load<I, S, F, Fut>(
        &self,
        key: &str,
        ttl_secs: i64,
        tags: I,
        loader: F,
    ) -> CacheResult<Bytes>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = CacheResult<Bytes>>,
    {
        let ttl_secs = checked_ttl(ttl_secs)?;
        if let Some(value) = self.get(key).await? {
            return Ok(value);
        }
        let tags: BTreeSet<String> = tags.into_iter().map(Into::into).collect();

        self.flights
            .run(key, || self.load_through(key, ttl_secs, tags, loader))
            .await
    }

    async fn load_through<F, Fut>(
        &self,
        key: &str,
        ttl_secs: u64,
        tags: BTreeSet<String>,
        loader: F,
    ) -> CacheResult<Bytes>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CacheResult<Bytes>>,
    {
        // the previous flight may have landed between our miss and joining
        if let Some(entry) = self.lookup(key).await? {
            return Ok(entry.value);
        }

        let loaded = loader().await;
        let outcome = match &loaded {
            Ok(_) => "loaded",
            Err(CacheError::NotFound) => "not_found",
            Err(_) => "error",
        };
        counter!(METRIC_LOAD_TOTAL, "outcome" => outcome).increment(1);
        let value = loaded?;

        if ttl_secs > 0
            && let Err(err) = self.write(key, value.clone(), ttl_secs, 0, tags).await
        {
            warn!(key, error = %err, "failed to cache loaded value");
        }
        Ok(value)
    }

    /// Remove `key` from every tier and from the tag index.
    ///
    /// Every tier is attempted; the first tier failure is returned afterwards.
    #[instrument(skip(self))]
    pub async fn delete(&self, key: &str) -> CacheResult<bool> {
        validate_key(key, self.max_key_len)?;
        let _guard = self.locks.lock(key).await;

        let (removed, failure) = self.purge_locked(key).await;
        if removed {
            counter!(METRIC_INVALIDATED_TOTAL, "source" => "key").increment(1);
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(removed),
        }
    }

    /// Caller must hold the key lock.
    async fn purge_locked(&self, key: &str) -> (bool, Option<CacheError>) {
        let mut removed = self.index.remove_key(key);
        let mut failure = None;
        for tier in self.chain() {
            match bounded(tier.kind(), "remove", self.tier_timeout, tier.remove(key)).await {
                Ok(hit) => removed |= hit,
                Err(err) => {
                    failure.get_or_insert(err);
                }
            }
        }
        (removed, failure)
    }

    /// Delete every key carrying `tag` at call time; returns how many were purged.
    ///
    /// Keys rewritten after the snapshot was taken are left alone.
    #[instrument(skip(self))]
    pub async fn delete_by_tag(&self, tag: &str) -> CacheResult<usize> {
        if tag.trim().is_empty() {
            return Err(CacheError::invalid_argument("tag must not be empty"));
        }
        let snapshot = self.index.snapshot_tag(tag);
        let purged = self
            .purge_snapshot(snapshot.into_iter().map(|(key, generation)| (key, Some(generation))))
            .await;

        counter!(METRIC_INVALIDATED_TOTAL, "source" => "tag").increment(purged as u64);
        debug!(tag, purged, "invalidated by tag");
        Ok(purged)
    }

    /// Delete keys matching a glob (or, without metacharacters, a prefix).
    ///
    /// Candidates are the tag index's keys plus whatever the shared tier can list.
    #[instrument(skip(self))]
    pub async fn delete_by_pattern(&self, pattern: &str) -> CacheResult<usize> {
        let matcher = KeyPattern::parse(pattern)?;

        let mut candidates: BTreeMap<String, Option<u64>> = self
            .index
            .snapshot_keys()
            .into_iter()
            .filter(|(key, _)| matcher.matches(key))
            .map(|(key, generation)| (key, Some(generation)))
            .collect();

        if let Some(l2) = &self.l2
            && let Ok(Some(listed)) = bounded(l2.kind(), "keys", self.tier_timeout, l2.keys()).await
        {
            for key in listed.into_iter().filter(|key| matcher.matches(key)) {
                candidates.entry(key).or_insert(None);
            }
        }

        let purged = self.purge_snapshot(candidates).await;
        counter!(METRIC_INVALIDATED_TOTAL, "source" => "pattern").increment(purged as u64);
        debug!(pattern, purged, "invalidated by pattern");
        Ok(purged)
    }

    /// Delete each snapshotted key unless it was rewritten since.
    ///
    /// Tier failures are logged per key and do not stop the sweep.
    async fn purge_snapshot<I>(&self, snapshot: I) -> usize
    where
        I: IntoIterator<Item = (String, Option<u64>)>,
    {
        let mut purged = 0;
        for (key, seen) in snapshot {
            let _guard = self.locks.lock(&key).await;
            if self.index.generation(&key) != seen {
                continue;
            }
            let (removed, failure) = self.purge_locked(&key).await;
            if let Some(err) = failure {
                warn!(key = %key, error = %err, "purge left a tier untouched");
            }
            if removed {
                purged += 1;
            }
        }
        purged
    }

    /// Drop everything. Refused in production-like environments.
    #[instrument(skip(self))]
    pub async fn clear(&self) -> CacheResult<()> {
        if self.environment.is_production_like() {
            warn!(
                environment = self.environment.as_str(),
                "refusing to clear cache"
            );
            return Err(CacheError::Forbidden(format!(
                "clear is disabled in {}",
                self.environment.as_str()
            )));
        }

        self.index.clear();
        let mut failure = None;
        for tier in self.chain() {
            if let Err(err) = bounded(tier.kind(), "clear", self.tier_timeout, tier.clear()).await {
                failure.get_or_insert(err);
            }
        }
        counter!(METRIC_INVALIDATED_TOTAL, "source" => "clear").increment(1);
        failure.map_or(Ok(()), Err)
    }

    /// Purge every entry no tier can still serve; returns how many were purged.
    ///
    /// Covers tracked keys plus whatever the lower tiers can list. A key is kept
    /// when any tier fails to answer, and keys rewritten during the sweep are
    /// left alone.
    #[instrument(skip(self))]
    pub async fn sweep_expired(&self) -> usize {
        let mut candidates: BTreeMap<String, Option<u64>> = BTreeMap::new();
        for (key, generation) in self.index.snapshot_keys() {
            if !self.servable_somewhere(&key).await {
                candidates.insert(key, Some(generation));
            }
        }

        for tier in self.l2.iter().chain(self.l3.iter()) {
            let Ok(Some(listed)) = bounded(tier.kind(), "keys", self.tier_timeout, tier.keys()).await
            else {
                continue;
            };
            for key in listed {
                if candidates.contains_key(&key) || self.index.contains_key(&key) {
                    continue;
                }
                if !self.servable_somewhere(&key).await {
                    candidates.insert(key, None);
                }
            }
        }

        let purged = self.purge_snapshot(candidates).await;
        if purged > 0 {
            counter!(METRIC_EVICT_TOTAL, "tier" => "sweep").increment(purged as u64);
        }
        debug!(purged, "expired entries swept");
        purged
    }

    async fn servable_somewhere(&self, key: &str) -> bool {
        let now = self.clock.now();
        for tier in self.chain() {
            match bounded(tier.kind(), "get", self.tier_timeout, tier.get(key)).await {
                Ok(Some(entry)) if entry.freshness(now).is_servable() => return true,
                Ok(_) => {}
                Err(_) => return true,
            }
        }
        false
    }

    /// Number of keys tracked by the tag index.
    pub fn len(&self) -> usize {
        self.index.key_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn stats(&self) -> StoreStats {
        StoreStats {
            l1_entries: self.l1.len().await.unwrap_or(0),
            tracked_keys: self.index.key_count(),
            tracked_tags: self.index.tag_count(),
            loads_in_flight: self.flights.in_flight(),
        }
    }
}

fn checked_ttl(ttl_secs: i64) -> CacheResult<u64> {
    u64::try_from(ttl_secs).map_err(|_| {
        CacheError::invalid_argument(format!("ttl must not be negative, got {ttl_secs}"))
    })
}

/// Run one tier operation under the tier deadline, counting and logging failures.
async fn bounded<T>(
    tier: TierKind,
    op: &'static str,
    limit: Duration,
    operation: impl Future<Output = CacheResult<T>>,
) -> CacheResult<T> {
    let outcome = match tokio::time::timeout(limit, operation).await {
        Ok(result) => result,
        Err(_) => Err(CacheError::timeout(format!("{tier}.{op}"), limit)),
    };
    if let Err(err) = &outcome {
        counter!(METRIC_TIER_ERROR_TOTAL, "tier" => tier.as_str()).increment(1);
        warn!(cache = tier.as_str(), op, error = %err, "cache tier operation failed");
    }
    outcome
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::cache::clock::{Clock, ManualClock};

    struct Fixture {
        store: Arc<CacheStore>,
        clock: ManualClock,
        l1: Arc<MemoryTier>,
        l2: Arc<SharedTier>,
        l3: Arc<SharedTier>,
    }

    fn fixture_with(config: CacheConfig) -> Fixture {
        let clock = ManualClock::at_epoch();
        let l1 = Arc::new(MemoryTier::new(&config));
        let l2 = Arc::new(SharedTier::new(TierKind::Shared));
        let l3 = Arc::new(SharedTier::new(TierKind::Edge));
        let tiers = Tiers {
            l1: l1.clone(),
            l2: Some(l2.clone()),
            l3: Some(l3.clone()),
        };
        let store = CacheStore::from_tiers(&config, tiers, Arc::new(clock.clone()));
        Fixture {
            store: Arc::new(store),
            clock,
            l1,
            l2,
            l3,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(CacheConfig::default())
    }

    #[tokio::test]
    async fn set_then_get_hits_every_tier() {
        let fx = fixture();

        fx.store
            .set("area:NW3", Bytes::from_static(b"nw3"), 60, ["area", "area:NW3"])
            .await
            .unwrap();
        fx.store.flush_background().await;

        assert_eq!(
            fx.store.get("area:NW3").await.unwrap(),
            Some(Bytes::from_static(b"nw3"))
        );
        assert!(fx.l1.get("area:NW3").await.unwrap().is_some());
        assert!(fx.l2.get("area:NW3").await.unwrap().is_some());
        assert!(fx.l3.get("area:NW3").await.unwrap().is_some());
        assert!(fx.store.tag_index().keys_for_tag("area:NW3").contains("area:NW3"));
    }

    #[tokio::test]
    async fn zero_ttl_is_a_no_op_and_negative_is_rejected() {
        let fx = fixture();

        fx.store
            .set("k", Bytes::from_static(b"v"), 0, ["t"])
            .await
            .unwrap();
        assert_eq!(fx.store.get("k").await.unwrap(), None);
        assert!(fx.store.is_empty());

        let err = fx
            .store
            .set("k", Bytes::from_static(b"v"), -1, ["t"])
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn malformed_keys_are_rejected() {
        let fx = fixture();
        let err = fx.store.get("has space").await.unwrap_err();
        assert!(matches!(err, CacheError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn shared_hit_is_promoted_into_memory() {
        let fx = fixture();
        fx.store
            .set("property:1", Bytes::from_static(b"p1"), 60, ["property:1"])
            .await
            .unwrap();
        fx.l1.clear().await.unwrap();

        let entry = fx.store.lookup("property:1").await.unwrap().unwrap();
        assert_eq!(entry.value, Bytes::from_static(b"p1"));

        let promoted = fx.l1.get("property:1").await.unwrap().unwrap();
        // promotion keeps the original age, hence the remaining TTL
        assert_eq!(promoted.created_at, entry.created_at);
    }

    #[tokio::test]
    async fn edge_hit_is_promoted_into_upper_tiers() {
        let fx = fixture();
        fx.store
            .set("search:nw3", Bytes::from_static(b"s"), 60, ["search"])
            .await
            .unwrap();
        fx.store.flush_background().await;
        fx.l1.clear().await.unwrap();
        fx.l2.clear().await.unwrap();

        assert!(fx.store.get("search:nw3").await.unwrap().is_some());
        assert!(fx.l1.get("search:nw3").await.unwrap().is_some());
        assert!(fx.l2.get("search:nw3").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn expired_entries_are_misses_and_evicted() {
        let fx = fixture();
        fx.store
            .set("k", Bytes::from_static(b"v"), 10, ["t"])
            .await
            .unwrap();
        fx.store.flush_background().await;

        fx.clock.advance(Duration::from_secs(10));

        assert_eq!(fx.store.get("k").await.unwrap(), None);
        assert!(fx.l1.get("k").await.unwrap().is_none());
        assert!(fx.l2.get("k").await.unwrap().is_none());
        assert!(fx.l3.get("k").await.unwrap().is_none());
        assert!(fx.store.tag_index().keys_for_tag("t").is_empty());
    }

    #[tokio::test]
    async fn stale_entries_are_still_served() {
        let fx = fixture();
        fx.store
            .insert("edge:k", Bytes::from_static(b"v"), 10, 30, ["edge"])
            .await
            .unwrap();

        fx.clock.advance(Duration::from_secs(15));
        let entry = fx.store.lookup("edge:k").await.unwrap().unwrap();
        assert_eq!(
            entry.freshness(fx.clock.now()),
            crate::cache::entry::Freshness::Stale
        );
    }

    #[tokio::test]
    async fn retagging_moves_key_between_tags() {
        let fx = fixture();
        fx.store
            .set("property:9", Bytes::from_static(b"a"), 60, ["area:NW3", "search"])
            .await
            .unwrap();
        fx.store
            .set("property:9", Bytes::from_static(b"b"), 60, ["area:NW6", "search"])
            .await
            .unwrap();

        let index = fx.store.tag_index();
        assert!(index.keys_for_tag("area:NW3").is_empty());
        assert!(index.keys_for_tag("area:NW6").contains("property:9"));
        assert!(index.keys_for_tag("search").contains("property:9"));
    }

    #[tokio::test]
    async fn delete_removes_from_all_tiers_and_index() {
        let fx = fixture();
        fx.store
            .set("k", Bytes::from_static(b"v"), 60, ["t1", "t2"])
            .await
            .unwrap();
        fx.store.flush_background().await;

        assert!(fx.store.delete("k").await.unwrap());
        assert!(!fx.store.delete("k").await.unwrap());

        assert_eq!(fx.store.get("k").await.unwrap(), None);
        assert!(fx.l3.get("k").await.unwrap().is_none());
        assert_eq!(fx.store.tag_index().tag_count(), 0);
    }

    #[tokio::test]
    async fn delete_by_tag_is_idempotent() {
        let fx = fixture();
        for id in 1..=3 {
            fx.store
                .set(
                    &format!("property:{id}"),
                    Bytes::from(format!("p{id}")),
                    60,
                    ["search".to_string(), format!("property:{id}")],
                )
                .await
                .unwrap();
        }
        fx.store
            .set("agent:1", Bytes::from_static(b"a"), 60, ["agent:1"])
            .await
            .unwrap();
        fx.store.flush_background().await;

        assert_eq!(fx.store.delete_by_tag("search").await.unwrap(), 3);
        assert_eq!(fx.store.delete_by_tag("search").await.unwrap(), 0);

        for id in 1..=3 {
            assert_eq!(fx.store.get(&format!("property:{id}")).await.unwrap(), None);
        }
        assert!(fx.store.get("agent:1").await.unwrap().is_some());
        assert_eq!(fx.store.tag_index().keys_for_tag("search").len(), 0);
    }

    #[tokio::test]
    async fn late_edge_write_never_resurrects_deleted_key() {
        let fx = fixture();
        fx.store
            .set("k", Bytes::from_static(b"v"), 60, ["t"])
            .await
            .unwrap();
        fx.store.delete("k").await.unwrap();
        fx.store.flush_background().await;

        assert!(fx.l3.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn edge_tier_ends_with_the_last_write() {
        let fx = fixture();
        for round in 0..5 {
            fx.store
                .set("k", Bytes::from(format!("v{round}")), 60, ["t"])
                .await
                .unwrap();
        }
        fx.store.flush_background().await;

        let edge = fx.l3.get("k").await.unwrap().unwrap();
        assert_eq!(edge.value, Bytes::from_static(b"v4"));
    }

    #[tokio::test]
    async fn delete_by_pattern_matches_index_and_shared_listing() {
        let fx = fixture();
        for key in ["area:NW3", "area:NW6", "postcode:NW36AB"] {
            fx.store
                .set(key, Bytes::from_static(b"x"), 60, ["geo"])
                .await
                .unwrap();
        }
        // written by another process: only the shared tier knows it
        let mut foreign = fx.l2.get("area:NW3").await.unwrap().unwrap();
        foreign.key = "area:SW1".to_string();
        fx.l2.put(foreign).await.unwrap();

        assert_eq!(fx.store.delete_by_pattern("area:").await.unwrap(), 3);
        assert!(fx.l2.get("area:SW1").await.unwrap().is_none());
        assert!(fx.store.get("postcode:NW36AB").await.unwrap().is_some());

        assert_eq!(fx.store.delete_by_pattern("post*:NW3?AB").await.unwrap(), 1);
        assert!(fx.store.delete_by_pattern("area:[").await.is_err());
    }

    #[tokio::test]
    async fn clear_is_forbidden_in_production() {
        let fx = fixture_with(CacheConfig {
            environment: Environment::Production,
            ..Default::default()
        });
        fx.store
            .set("k", Bytes::from_static(b"v"), 60, ["t"])
            .await
            .unwrap();

        let err = fx.store.clear().await.unwrap_err();
        assert!(matches!(err, CacheError::Forbidden(_)));
        assert!(fx.store.get("k").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn clear_empties_everything_in_development() {
        let fx = fixture();
        fx.store
            .set("k", Bytes::from_static(b"v"), 60, ["t"])
            .await
            .unwrap();
        fx.store.flush_background().await;

        fx.store.clear().await.unwrap();
        assert!(fx.store.is_empty());
        assert_eq!(fx.store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn get_or_load_runs_loader_once() {
        let fx = fixture();
        let calls = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let store = Arc::clone(&fx.store);
                let calls = Arc::clone(&calls);
                tokio::spawn(async move {
                    store
                        .get_or_load("area:NW3", 60, ["area:NW3"], || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(30)).await;
                            Ok(Bytes::from_static(b"loaded"))
                        })
                        .await
                })
            })
            .collect();

        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), Bytes::from_static(b"loaded"));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(fx.store.tag_index().keys_for_tag("area:NW3").contains("area:NW3"));
    }

    #[tokio::test]
    async fn get_or_load_shares_loader_errors() {
        let fx = fixture();

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&fx.store);
                tokio::spawn(async move {
                    store
                        .get_or_load("k", 60, Vec::<String>::new(), || async {
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Err(CacheError::NotFound)
                        })
                        .await
                })
            })
            .collect();

        for task in tasks {
            assert_eq!(task.await.unwrap(), Err(CacheError::NotFound));
        }
        assert_eq!(fx.store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn get_or_load_with_zero_ttl_does_not_cache() {
        let fx = fixture();
        let value = fx
            .store
            .get_or_load("k", 0, ["t"], || async { Ok(Bytes::from_static(b"v")) })
            .await
            .unwrap();

        assert_eq!(value, Bytes::from_static(b"v"));
        assert_eq!(fx.store.get("k").await.unwrap(), None);
    }

    /// A tier whose every operation hangs.
    struct StalledTier;

    #[async_trait]
    impl CacheTier for StalledTier {
        fn kind(&self) -> TierKind {
            TierKind::Memory
        }

        async fn get(&self, _key: &str) -> CacheResult<Option<CacheEntry>> {
            std::future::pending().await
        }

        async fn put(&self, _entry: CacheEntry) -> CacheResult<()> {
            std::future::pending().await
        }

        async fn remove(&self, _key: &str) -> CacheResult<bool> {
            std::future::pending().await
        }

        async fn clear(&self) -> CacheResult<()> {
            std::future::pending().await
        }

        async fn len(&self) -> CacheResult<usize> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn stalled_tier_times_out_and_reads_fall_through() {
        let config = CacheConfig {
            tier_timeout_ms: 20,
            enable_l3: false,
            ..Default::default()
        };
        let l2 = Arc::new(SharedTier::new(TierKind::Shared));
        let tiers = Tiers {
            l1: Arc::new(StalledTier),
            l2: Some(l2.clone()),
            l3: None,
        };
        let store = CacheStore::from_tiers(&config, tiers, system_clock());

        let err = store
            .set("k", Bytes::from_static(b"v"), 60, ["t"])
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Timeout { .. }));
        assert!(l2.get("k").await.unwrap().is_some());

        assert_eq!(store.get("k").await.unwrap(), Some(Bytes::from_static(b"v")));
    }

    #[tokio::test]
    async fn sweep_purges_entries_nobody_reads_again() {
        let fx = fixture();
        for n in 0..100 {
            fx.store
                .set(&format!("search:{n}"), Bytes::from_static(b"[]"), 1, ["search"])
                .await
                .unwrap();
        }
        fx.store
            .set("area:NW3", Bytes::from_static(b"{}"), 86_400, ["area"])
            .await
            .unwrap();
        fx.store.flush_background().await;

        // written by another node; never tracked here
        fx.l2
            .put(CacheEntry {
                key: "foreign:1".to_string(),
                value: Bytes::from_static(b"x"),
                tags: BTreeSet::from(["search".to_string()]),
                created_at: fx.store.clock().now(),
                ttl_secs: 1,
                stale_window_secs: 0,
                generation: 0,
            })
            .await
            .unwrap();

        fx.clock.advance(Duration::from_secs(3600));
        assert_eq!(fx.store.sweep_expired().await, 101);

        assert_eq!(fx.store.len(), 1);
        assert!(fx.store.tag_index().keys_for_tag("search").is_empty());
        assert_eq!(fx.l2.len().await.unwrap(), 1);
        assert_eq!(fx.l3.len().await.unwrap(), 1);
        assert!(fx.store.get("area:NW3").await.unwrap().is_some());

        assert_eq!(fx.store.sweep_expired().await, 0);
    }

    #[tokio::test]
    async fn sweep_keeps_stale_but_servable_entries() {
        let fx = fixture();
        fx.store
            .insert("listing:1", Bytes::from_static(b"v"), 10, 60, ["listing"])
            .await
            .unwrap();

        fx.clock.advance(Duration::from_secs(30));
        assert_eq!(fx.store.sweep_expired().await, 0);
        assert_eq!(fx.store.len(), 1);
    }

    /// Shared tier whose first `remove` waits until released.
    struct GatedTier {
        inner: SharedTier,
        armed: std::sync::atomic::AtomicBool,
        held: Mutex<Option<String>>,
        entered: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    impl GatedTier {
        fn new() -> Self {
            Self {
                inner: SharedTier::new(TierKind::Shared),
                armed: std::sync::atomic::AtomicBool::new(true),
                held: Mutex::new(None),
                entered: tokio::sync::Notify::new(),
                release: tokio::sync::Notify::new(),
            }
        }
    }

    #[async_trait]
    impl CacheTier for GatedTier {
        fn kind(&self) -> TierKind {
            TierKind::Shared
        }

        async fn get(&self, key: &str) -> CacheResult<Option<CacheEntry>> {
            self.inner.get(key).await
        }

        async fn put(&self, entry: CacheEntry) -> CacheResult<()> {
            self.inner.put(entry).await
        }

        async fn remove(&self, key: &str) -> CacheResult<bool> {
            if self.armed.swap(false, Ordering::SeqCst) {
                *self.held.lock().unwrap() = Some(key.to_string());
                self.entered.notify_one();
                self.release.notified().await;
            }
            self.inner.remove(key).await
        }

        async fn clear(&self) -> CacheResult<()> {
            self.inner.clear().await
        }

        async fn len(&self) -> CacheResult<usize> {
            self.inner.len().await
        }
    }

    #[tokio::test]
    async fn writes_racing_delete_by_tag_win() {
        let config = CacheConfig {
            enable_l3: false,
            ..Default::default()
        };
        let gate = Arc::new(GatedTier::new());
        let tiers = Tiers {
            l1: Arc::new(MemoryTier::new(&config)),
            l2: Some(gate.clone()),
            l3: None,
        };
        let store = CacheStore::from_tiers(&config, tiers, system_clock());
        for key in ["listing:1", "listing:2"] {
            store
                .set(key, Bytes::from_static(b"old"), 60, ["search"])
                .await
                .unwrap();
        }

        let sweep = store.delete_by_tag("search");
        let writer = async {
            gate.entered.notified().await;
            let held = gate.held.lock().unwrap().clone().unwrap();
            let other = if held == "listing:1" { "listing:2" } else { "listing:1" };

            // `other` is still in the snapshot but has not been swept yet
            let (rewritten, ()) = tokio::join!(
                store.set(other, Bytes::from_static(b"new"), 60, ["search"]),
                async { gate.release.notify_one() },
            );
            rewritten.unwrap();
            // waits for the sweep to finish with `held`, then lands after it
            store
                .set(&held, Bytes::from_static(b"new"), 60, ["search"])
                .await
                .unwrap();
        };
        let (purged, ()) = tokio::join!(sweep, writer);

        assert_eq!(purged.unwrap(), 1);
        for key in ["listing:1", "listing:2"] {
            assert_eq!(store.get(key).await.unwrap(), Some(Bytes::from_static(b"new")));
            assert!(store.tag_index().keys_for_tag("search").contains(key));
        }
    }
}
