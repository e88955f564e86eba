use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

/// Register descriptions for every metric the engine emits. Idempotent.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "canopy_cache_hit_total",
            Unit::Count,
            "Total number of cache hits, labelled by the tier that answered."
        );
        describe_counter!(
            "canopy_cache_miss_total",
            Unit::Count,
            "Total number of lookups no tier could answer."
        );
        describe_counter!(
            "canopy_cache_promote_total",
            Unit::Count,
            "Total number of entries copied into faster tiers after a lower-tier hit."
        );
        describe_counter!(
            "canopy_cache_load_total",
            Unit::Count,
            "Total number of loader invocations, labelled by outcome."
        );
        describe_counter!(
            "canopy_cache_invalidated_total",
            Unit::Count,
            "Total number of entries purged, labelled by invalidation source."
        );
        describe_counter!(
            "canopy_cache_tier_error_total",
            Unit::Count,
            "Total number of failed or timed out tier operations."
        );
        describe_counter!(
            "canopy_cache_evict_total",
            Unit::Count,
            "Total number of entries evicted for capacity or expiry."
        );
        describe_gauge!(
            "canopy_invalidation_pending",
            Unit::Count,
            "Current number of deferred invalidations waiting to be consumed."
        );
        describe_histogram!(
            "canopy_invalidation_consume_ms",
            Unit::Milliseconds,
            "Deferred invalidation consumption latency in milliseconds."
        );
        describe_histogram!(
            "canopy_warm_run_ms",
            Unit::Milliseconds,
            "Full warming cycle latency in milliseconds."
        );
        describe_counter!(
            "canopy_warm_keys_total",
            Unit::Count,
            "Total number of keys written by warming, labelled by strategy."
        );
        describe_counter!(
            "canopy_edge_request_total",
            Unit::Count,
            "Total number of edge requests, labelled by cache status."
        );
        describe_counter!(
            "canopy_edge_revalidate_total",
            Unit::Count,
            "Total number of background revalidations, labelled by outcome."
        );
        describe_counter!(
            "canopy_edge_failover_total",
            Unit::Count,
            "Total number of origin retries against a lower-priority region."
        );
        describe_histogram!(
            "canopy_edge_origin_ms",
            Unit::Milliseconds,
            "Origin fetch latency in milliseconds, labelled by region."
        );
    });
}
