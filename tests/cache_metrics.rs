use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use canopy::cache::edge::{OriginClient, OriginResponse, Region};
use canopy::cache::{
    CacheConfig, CacheEntry, CacheError, CacheResult, CacheServices, CacheStatus, CacheStore,
    CacheTier, EdgeRequest, InvalidationIntent, ManualClock, MemoryTier, RegionConfig,
    SharedClock, SharedTier, TierKind, Tiers, WarmItem, WarmingStrategy, system_clock,
};
use canopy::infra::telemetry;
use metrics_util::debugging::DebuggingRecorder;
use reqwest::{Method, StatusCode};

/// A shared tier that refuses every operation.
struct OfflineTier;

#[async_trait]
impl CacheTier for OfflineTier {
    fn kind(&self) -> TierKind {
        TierKind::Shared
    }

    async fn get(&self, _key: &str) -> CacheResult<Option<CacheEntry>> {
        Err(CacheError::tier("shared", "connection reset"))
    }

    async fn put(&self, _entry: CacheEntry) -> CacheResult<()> {
        Err(CacheError::tier("shared", "connection reset"))
    }

    async fn remove(&self, _key: &str) -> CacheResult<bool> {
        Err(CacheError::tier("shared", "connection reset"))
    }

    async fn clear(&self) -> CacheResult<()> {
        Err(CacheError::tier("shared", "connection reset"))
    }

    async fn len(&self) -> CacheResult<usize> {
        Err(CacheError::tier("shared", "connection reset"))
    }
}

/// Region "a" answers 503, everything else 200.
struct FlakyOrigin;

#[async_trait]
impl OriginClient for FlakyOrigin {
    async fn fetch(&self, region: &Region, _request: &EdgeRequest) -> CacheResult<OriginResponse> {
        if region.id == "a" {
            return Ok(OriginResponse::new(StatusCode::SERVICE_UNAVAILABLE, ""));
        }
        Ok(OriginResponse::new(StatusCode::OK, "listing"))
    }
}

#[tokio::test]
async fn cache_paths_emit_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");
    telemetry::describe_metrics();

    // Store hit/miss/promote/evict/load/invalidate
    let config = CacheConfig {
        l1_capacity: 1,
        ..Default::default()
    };
    let tiers = Tiers {
        l1: Arc::new(MemoryTier::new(&config)),
        l2: Some(Arc::new(SharedTier::new(TierKind::Shared))),
        l3: None,
    };
    let store = CacheStore::from_tiers(&config, tiers, system_clock());

    assert_eq!(store.get("area:NW3").await.expect("get"), None);
    store
        .set("area:NW3", Bytes::from_static(b"{}"), 60, ["area"])
        .await
        .expect("set");
    store
        .set("area:SE1", Bytes::from_static(b"{}"), 60, ["area"])
        .await
        .expect("set");
    assert!(store.get("area:NW3").await.expect("get").is_some());
    store
        .get_or_load("agent:7", 60, ["agent"], || async {
            Ok(Bytes::from_static(b"agent"))
        })
        .await
        .expect("load");
    store.delete_by_tag("area").await.expect("delete");

    // Tier failures
    let offline = CacheStore::from_tiers(
        &CacheConfig::default(),
        Tiers {
            l1: Arc::new(MemoryTier::new(&CacheConfig::default())),
            l2: Some(Arc::new(OfflineTier)),
            l3: None,
        },
        system_clock(),
    );
    assert_eq!(offline.get("missing").await.expect("get"), None);

    // Dispatcher queue and consumption, warmer runs, edge requests
    let mut config = CacheConfig::default();
    config.edge.ttl_secs = 10;
    config.edge.stale_window_secs = 60;
    config.edge.regions = ["a", "b"]
        .into_iter()
        .enumerate()
        .map(|(priority, id)| RegionConfig {
            id: id.to_string(),
            origin_url: format!("https://{id}.origin.example/"),
            priority: priority as u32,
            healthy: true,
        })
        .collect();
    let clock = Arc::new(ManualClock::at_epoch());
    let shared: SharedClock = clock.clone();
    let services =
        CacheServices::with_parts(&config, shared, Arc::new(FlakyOrigin)).expect("services");

    services
        .dispatcher
        .enqueue(InvalidationIntent::InvalidateByTag {
            tag: "area".to_string(),
        })
        .expect("enqueue");
    services.dispatcher.consume().await.expect("consume");

    services.warmer.register(WarmingStrategy::new("areas", 1, 300, || async {
        Ok(vec![WarmItem::new("area:NW3", "hampstead", ["area"])])
    }));
    let _ = services.warmer.warm_all().await;

    let request = EdgeRequest::new(Method::GET, "/search?area=NW3");
    let first = services.edge.fetch(request.clone()).await.expect("fetch");
    assert_eq!(first.cache_status, CacheStatus::Miss);

    clock.advance(Duration::from_secs(30));
    let stale = services.edge.fetch(request).await.expect("fetch");
    assert_eq!(stale.cache_status, CacheStatus::Stale);
    for _ in 0..100 {
        if services.edge.revalidations_in_flight() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let names: HashSet<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    let expected = [
        "canopy_cache_hit_total",
        "canopy_cache_miss_total",
        "canopy_cache_promote_total",
        "canopy_cache_evict_total",
        "canopy_cache_load_total",
        "canopy_cache_invalidated_total",
        "canopy_cache_tier_error_total",
        "canopy_invalidation_pending",
        "canopy_invalidation_consume_ms",
        "canopy_warm_run_ms",
        "canopy_warm_keys_total",
        "canopy_edge_request_total",
        "canopy_edge_failover_total",
        "canopy_edge_origin_ms",
        "canopy_edge_revalidate_total",
    ];

    for metric in expected {
        assert!(names.contains(metric), "missing metric: {metric}");
    }
}
