//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{path::PathBuf, str::FromStr};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::{self, CacheConfig, EntityRules};

mod cli;

pub use cli::{CliArgs, Command, LoggingOverrides, ServeArgs, ServeOverrides, WarmArgs};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "canopy";
const ENV_PREFIX: &str = "CANOPY";
const DEFAULT_MANIFEST_PRIORITY: i32 = 100;
const DEFAULT_MANIFEST_TTL_SECS: i64 = 3600;
/// Hashed edge keys (`edge:sha256:` plus 64 hex digits) must fit under the store limit.
const MIN_MAX_KEY_LEN: usize = 76;

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub cache: CacheConfig,
    pub warm: WarmSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

/// The manifest warming strategy; absent when no manifest is configured.
#[derive(Debug, Clone)]
pub struct WarmSettings {
    pub manifest: Option<PathBuf>,
    pub manifest_priority: i32,
    pub manifest_ttl_secs: i64,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides)?,
        Some(Command::Warm(args)) => raw.apply_warm_overrides(args),
        None => raw.apply_serve_overrides(&ServeOverrides::default())?,
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    cache: CacheConfig,
    warm: RawWarmSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) -> Result<(), LoadError> {
        self.apply_logging_overrides(&overrides.logging);

        if let Some(environment) = overrides.cache_environment.as_deref() {
            self.cache.environment = cache::Environment::from_str(environment)
                .map_err(|reason| LoadError::invalid("cache.environment", reason))?;
        }
        if let Some(capacity) = overrides.cache_l1_capacity {
            self.cache.l1_capacity = capacity;
        }
        if let Some(timeout) = overrides.cache_tier_timeout_ms {
            self.cache.tier_timeout_ms = timeout;
        }
        if let Some(interval) = overrides.cache_auto_consume_interval_ms {
            self.cache.auto_consume_interval_ms = interval;
        }
        if let Some(limit) = overrides.cache_consume_batch_limit {
            self.cache.consume_batch_limit = limit;
        }
        if let Some(interval) = overrides.cache_warm_interval_seconds {
            self.cache.warm_interval_secs = interval;
        }
        if let Some(interval) = overrides.cache_sweep_interval_seconds {
            self.cache.sweep_interval_secs = interval;
        }
        if let Some(enabled) = overrides.cache_warm_on_startup {
            self.cache.warm_on_startup = enabled;
        }
        if let Some(path) = overrides.manifest.as_ref() {
            self.warm.manifest = Some(path.clone());
        }
        Ok(())
    }

    fn apply_warm_overrides(&mut self, args: &WarmArgs) {
        self.apply_logging_overrides(&args.logging);
        if let Some(path) = args.manifest.as_ref() {
            self.warm.manifest = Some(path.clone());
        }
    }

    fn apply_logging_overrides(&mut self, overrides: &LoggingOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            cache,
            warm,
        } = raw;

        let logging = build_logging_settings(logging)?;
        let cache = build_cache_settings(cache)?;
        let warm = build_warm_settings(warm)?;

        Ok(Self {
            logging,
            cache,
            warm,
        })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_cache_settings(cache: CacheConfig) -> Result<CacheConfig, LoadError> {
    non_zero(cache.l1_capacity as u64, "cache.l1_capacity")?;
    non_zero(cache.tier_timeout_ms, "cache.tier_timeout_ms")?;
    non_zero(cache.lock_stripes as u64, "cache.lock_stripes")?;
    non_zero(cache.consume_batch_limit as u64, "cache.consume_batch_limit")?;
    non_zero(cache.auto_consume_interval_ms, "cache.auto_consume_interval_ms")?;
    non_zero(cache.warm_interval_secs, "cache.warm_interval_secs")?;
    non_zero(cache.sweep_interval_secs, "cache.sweep_interval_secs")?;
    non_zero(cache.edge.origin_timeout_ms, "cache.edge.origin_timeout_ms")?;

    if cache.max_key_len < MIN_MAX_KEY_LEN {
        return Err(LoadError::invalid(
            "cache.max_key_len",
            format!("must be at least {MIN_MAX_KEY_LEN}"),
        ));
    }
    if cache.edge.max_key_len > cache.max_key_len {
        return Err(LoadError::invalid(
            "cache.edge.max_key_len",
            "must not exceed cache.max_key_len",
        ));
    }

    EntityRules::with_overrides(&cache.entity_rules)
        .map_err(|err| LoadError::invalid("cache.entity_rules", err.to_string()))?;
    cache::edge::RegionSet::from_config(&cache.edge.regions)
        .map_err(|err| LoadError::invalid("cache.edge.regions", err.to_string()))?;

    Ok(cache)
}

fn build_warm_settings(warm: RawWarmSettings) -> Result<WarmSettings, LoadError> {
    let manifest = warm.manifest.filter(|path| !path.as_os_str().is_empty());

    let manifest_ttl_secs = warm.manifest_ttl_secs.unwrap_or(DEFAULT_MANIFEST_TTL_SECS);
    if manifest_ttl_secs <= 0 {
        return Err(LoadError::invalid(
            "warm.manifest_ttl_secs",
            "must be greater than zero",
        ));
    }

    Ok(WarmSettings {
        manifest,
        manifest_priority: warm.manifest_priority.unwrap_or(DEFAULT_MANIFEST_PRIORITY),
        manifest_ttl_secs,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawWarmSettings {
    manifest: Option<PathBuf>,
    manifest_priority: Option<i32>,
    manifest_ttl_secs: Option<i64>,
}

fn non_zero(value: u64, key: &'static str) -> Result<(), LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(())
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}
