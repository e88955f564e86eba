use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};

/// Command-line arguments for the Canopy binary.
#[derive(Debug, Parser)]
#[command(name = "canopy", version, about = "Canopy layered cache engine")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "CANOPY_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the cache engine: warming loop and invalidation consumption.
    Serve(Box<ServeArgs>),
    /// Run one warming cycle and print its statistics as JSON.
    Warm(WarmArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct LoggingOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub logging: LoggingOverrides,

    /// Override the deployment environment (development|staging|production).
    #[arg(long = "cache-environment", value_name = "ENV")]
    pub cache_environment: Option<String>,

    /// Override the L1 entry capacity.
    #[arg(long = "cache-l1-capacity", value_name = "COUNT")]
    pub cache_l1_capacity: Option<usize>,

    /// Override the per-tier operation deadline in milliseconds.
    #[arg(long = "cache-tier-timeout-ms", value_name = "MS")]
    pub cache_tier_timeout_ms: Option<u64>,

    /// Override the invalidation auto-consume interval in milliseconds.
    #[arg(long = "cache-auto-consume-interval-ms", value_name = "MS")]
    pub cache_auto_consume_interval_ms: Option<u64>,

    /// Override the invalidation consume batch limit.
    #[arg(long = "cache-consume-batch-limit", value_name = "COUNT")]
    pub cache_consume_batch_limit: Option<usize>,

    /// Override the period between warming cycles.
    #[arg(long = "cache-warm-interval-seconds", value_name = "SECONDS")]
    pub cache_warm_interval_seconds: Option<u64>,

    /// Override the period between expired-entry sweeps.
    #[arg(long = "cache-sweep-interval-seconds", value_name = "SECONDS")]
    pub cache_sweep_interval_seconds: Option<u64>,

    /// Toggle the warming cycle at startup.
    #[arg(
        long = "cache-warm-on-startup",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub cache_warm_on_startup: Option<bool>,

    /// Override the warm manifest file.
    #[arg(long = "manifest", value_name = "PATH", value_hint = ValueHint::FilePath)]
    pub manifest: Option<PathBuf>,
}

#[derive(Debug, Args, Clone)]
pub struct WarmArgs {
    #[command(flatten)]
    pub logging: LoggingOverrides,

    /// Manifest to warm from; defaults to `warm.manifest` from the configuration.
    #[arg(long = "manifest", value_name = "PATH", value_hint = ValueHint::FilePath)]
    pub manifest: Option<PathBuf>,
}
