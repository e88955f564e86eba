//! Cache configuration.
//!
//! Controls the tier topology, timeouts, invalidation batching, warming cadence
//! and the edge tier via the `[cache]` section of `canopy.toml`.

use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::time::Duration;

use serde::Deserialize;

// Default values for cache configuration
const DEFAULT_L1_CAPACITY: usize = 10_000;
const DEFAULT_TIER_TIMEOUT_MS: u64 = 250;
const DEFAULT_TTL_SECS: u64 = 300;
const DEFAULT_LOCK_STRIPES: usize = 64;
const DEFAULT_MAX_KEY_LEN: usize = 512;
const DEFAULT_CONSUME_BATCH_LIMIT: usize = 100;
const DEFAULT_AUTO_CONSUME_INTERVAL_MS: u64 = 5000;
const DEFAULT_WARM_INTERVAL_SECS: u64 = 900;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;
const DEFAULT_EDGE_TTL_SECS: u64 = 60;
const DEFAULT_EDGE_STALE_WINDOW_SECS: u64 = 300;
const DEFAULT_EDGE_ORIGIN_TIMEOUT_MS: u64 = 2000;
const DEFAULT_EDGE_MAX_KEY_LEN: usize = 256;

/// Deployment environment; decides which destructive operations are allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Staging,
    Production,
}

impl Environment {
    /// Staging mirrors production data, so it is treated the same way.
    pub fn is_production_like(self) -> bool {
        matches!(self, Environment::Staging | Environment::Production)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Staging => "staging",
            Environment::Production => "production",
        }
    }
}

impl std::str::FromStr for Environment {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Environment::Development),
            "staging" => Ok(Environment::Staging),
            "production" | "prod" => Ok(Environment::Production),
            other => Err(format!("unknown environment `{other}`")),
        }
    }
}

/// Cache configuration from `canopy.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub environment: Environment,
    /// Maximum entries held by the in-process L1 tier.
    pub l1_capacity: usize,
    /// Enable the shared (L2) tier.
    pub enable_l2: bool,
    /// Enable the edge (L3) tier.
    pub enable_l3: bool,
    /// Deadline for a single tier operation.
    pub tier_timeout_ms: u64,
    /// TTL used by callers that do not pick their own.
    pub default_ttl_secs: u64,
    /// Number of striped per-key write locks.
    pub lock_stripes: usize,
    /// Longest accepted cache key in bytes.
    pub max_key_len: usize,
    /// Maximum queued invalidations merged into one consumption.
    pub consume_batch_limit: usize,
    /// Auto-consume interval (ms) for deferred invalidations.
    pub auto_consume_interval_ms: u64,
    /// Period between scheduled warming cycles.
    pub warm_interval_secs: u64,
    /// Period between expired-entry sweeps.
    pub sweep_interval_secs: u64,
    /// Run one warming cycle as soon as the service starts.
    pub warm_on_startup: bool,
    /// Entity type -> tag templates; rows here replace the built-in row of the same name.
    pub entity_rules: BTreeMap<String, Vec<String>>,
    pub edge: EdgeConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            environment: Environment::default(),
            l1_capacity: DEFAULT_L1_CAPACITY,
            enable_l2: true,
            enable_l3: true,
            tier_timeout_ms: DEFAULT_TIER_TIMEOUT_MS,
            default_ttl_secs: DEFAULT_TTL_SECS,
            lock_stripes: DEFAULT_LOCK_STRIPES,
            max_key_len: DEFAULT_MAX_KEY_LEN,
            consume_batch_limit: DEFAULT_CONSUME_BATCH_LIMIT,
            auto_consume_interval_ms: DEFAULT_AUTO_CONSUME_INTERVAL_MS,
            warm_interval_secs: DEFAULT_WARM_INTERVAL_SECS,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            warm_on_startup: true,
            entity_rules: BTreeMap::new(),
            edge: EdgeConfig::default(),
        }
    }
}

impl CacheConfig {
    /// Returns the L1 capacity as NonZeroUsize, clamping to 1 if zero.
    pub fn l1_capacity_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.l1_capacity).unwrap_or(NonZeroUsize::MIN)
    }

    pub fn tier_timeout(&self) -> Duration {
        Duration::from_millis(self.tier_timeout_ms.max(1))
    }

    pub fn lock_stripes_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.lock_stripes).unwrap_or(NonZeroUsize::MIN)
    }

    pub fn auto_consume_interval(&self) -> Duration {
        Duration::from_millis(self.auto_consume_interval_ms.max(1))
    }

    pub fn warm_interval(&self) -> Duration {
        Duration::from_secs(self.warm_interval_secs.max(1))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// Edge tier policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EdgeConfig {
    pub ttl_secs: u64,
    pub stale_window_secs: u64,
    pub origin_timeout_ms: u64,
    /// Normalized keys longer than this are replaced by a digest.
    pub max_key_len: usize,
    /// Query parameters that never vary the response (exact names, or prefixes ending in `*`).
    pub ignored_query_params: Vec<String>,
    pub regions: Vec<RegionConfig>,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            ttl_secs: DEFAULT_EDGE_TTL_SECS,
            stale_window_secs: DEFAULT_EDGE_STALE_WINDOW_SECS,
            origin_timeout_ms: DEFAULT_EDGE_ORIGIN_TIMEOUT_MS,
            max_key_len: DEFAULT_EDGE_MAX_KEY_LEN,
            ignored_query_params: vec![
                "utm_*".to_string(),
                "fbclid".to_string(),
                "gclid".to_string(),
            ],
            regions: Vec::new(),
        }
    }
}

impl EdgeConfig {
    pub fn origin_timeout(&self) -> Duration {
        Duration::from_millis(self.origin_timeout_ms.max(1))
    }
}

/// Static description of an origin region; health starts as configured and is
/// then driven by the external health checker.
#[derive(Debug, Clone, Deserialize)]
pub struct RegionConfig {
    pub id: String,
    pub origin_url: String,
    pub priority: u32,
    #[serde(default = "default_healthy")]
    pub healthy: bool,
}

fn default_healthy() -> bool {
    true
}
