//! Canopy cache engine
//!
//! A single logical cache over ordered tiers:
//!
//! - **L1 (memory)**: bounded in-process LRU
//! - **L2 (shared)**: the store every node sees; lists its keys for pattern purges
//! - **L3 (edge)**: written in the background, fronted by [`EdgeCacheCoordinator`]
//!
//! Around the [`CacheStore`] sit the [`TagIndex`] (tag -> keys), the
//! [`InvalidationDispatcher`] (domain intents -> purges) and the [`CacheWarmer`]
//! (prioritized pre-population).
//!
//! ## Configuration
//!
//! Controlled via the `[cache]` section of `canopy.toml`:
//!
//! ```toml
//! [cache]
//! environment = "production"
//! l1_capacity = 10000
//! tier_timeout_ms = 250
//!
//! [cache.edge]
//! ttl_secs = 60
//! stale_window_secs = 300
//!
//! [[cache.edge.regions]]
//! id = "uk-south"
//! origin_url = "https://origin.uk.example/"
//! priority = 1
//! # ... see config.rs for all options
//! ```

use std::sync::Arc;

mod clock;
mod config;
mod dispatcher;
pub mod edge;
mod entry;
mod error;
mod events;
mod flight;
mod intents;
mod keys;
mod lock;
mod manifest;
mod planner;
mod registry;
mod rules;
mod store;
mod tier;
mod warmer;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock, system_clock};
pub use config::{CacheConfig, EdgeConfig, Environment, RegionConfig};
pub use dispatcher::InvalidationDispatcher;
pub use edge::{CacheStatus, EdgeCacheCoordinator, EdgeRequest, EdgeResponse};
pub use entry::{CacheEntry, Freshness};
pub use error::{CacheError, CacheResult};
pub use events::{Epoch, IntentQueue, QueuedInvalidation};
pub use intents::{
    InvalidationIntent, area_tag, authority_tags, hourly_tag, postcode_tag, user_tag,
};
pub use keys::{EdgeKeyPolicy, KeyPattern, edge_cache_key, hash_value, validate_key};
pub use manifest::ManifestSource;
pub use planner::InvalidationPlan;
pub use registry::TagIndex;
pub use rules::{EntityRules, TagTemplate};
pub use store::{CacheStore, StoreStats, Tiers};
pub use tier::{CacheTier, MemoryTier, SharedTier, TierKind};
pub use warmer::{
    CacheWarmer, WarmFailure, WarmItem, WarmOutcome, WarmSource, WarmState, WarmStats,
    WarmingRun, WarmingStrategy,
};

use edge::{EdgePolicy, HttpOriginClient, OriginClient, RegionSet};
use tracing::info;

/// The engine's components wired over one store.
#[derive(Clone)]
pub struct CacheServices {
    pub store: Arc<CacheStore>,
    pub dispatcher: Arc<InvalidationDispatcher>,
    pub warmer: Arc<CacheWarmer>,
    pub edge: EdgeCacheCoordinator,
}

impl CacheServices {
    /// Build with the system clock and the HTTP origin client.
    pub fn new(config: &CacheConfig) -> CacheResult<Self> {
        let origin: Arc<dyn OriginClient> = Arc::new(HttpOriginClient::new()?);
        Self::with_parts(config, system_clock(), origin)
    }

    pub fn with_parts(
        config: &CacheConfig,
        clock: SharedClock,
        origin: Arc<dyn OriginClient>,
    ) -> CacheResult<Self> {
        let rules = EntityRules::with_overrides(&config.entity_rules)?;
        let regions = Arc::new(RegionSet::from_config(&config.edge.regions)?);

        let store = Arc::new(CacheStore::with_clock(config, clock));
        let dispatcher = Arc::new(InvalidationDispatcher::new(
            Arc::clone(&store),
            rules,
            config,
        ));
        let warmer = Arc::new(CacheWarmer::new(Arc::clone(&store)));
        let edge = EdgeCacheCoordinator::new(
            Arc::clone(&store),
            regions,
            origin,
            EdgePolicy::from_config(&config.edge),
        );

        info!(
            environment = config.environment.as_str(),
            l2 = config.enable_l2,
            l3 = config.enable_l3,
            regions = edge.regions().len(),
            "Cache services initialized"
        );

        Ok(Self {
            store,
            dispatcher,
            warmer,
            edge,
        })
    }
}
