//! End-to-end consistency properties of the cache engine, exercised through
//! the public API only.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use canopy::cache::edge::{OriginClient, OriginResponse, Region};
use canopy::cache::{
    CacheConfig, CacheError, CacheResult, CacheServices, CacheStatus, CacheStore, CacheTier,
    EdgeRequest, Environment, InvalidationIntent, ManualClock, MemoryTier, RegionConfig,
    SharedClock, SharedTier, TierKind, Tiers, WarmItem, WarmOutcome, WarmingStrategy,
    system_clock,
};
use futures::future::join_all;
use reqwest::{Method, StatusCode};
use tokio::sync::Notify;

struct TierHandles {
    l1: Arc<MemoryTier>,
    l2: Arc<SharedTier>,
    l3: Arc<SharedTier>,
}

fn store_with_handles(config: &CacheConfig) -> (CacheStore, TierHandles) {
    let handles = TierHandles {
        l1: Arc::new(MemoryTier::new(config)),
        l2: Arc::new(SharedTier::new(TierKind::Shared)),
        l3: Arc::new(SharedTier::new(TierKind::Edge)),
    };
    let tiers = Tiers {
        l1: handles.l1.clone(),
        l2: Some(handles.l2.clone()),
        l3: Some(handles.l3.clone()),
    };
    (CacheStore::from_tiers(config, tiers, system_clock()), handles)
}

#[tokio::test]
async fn set_replaces_tag_associations() {
    let store = CacheStore::new(&CacheConfig::default());

    store
        .set("property:42", Bytes::from_static(b"v1"), 60, ["area:NW3", "search"])
        .await
        .expect("set");
    store
        .set("property:42", Bytes::from_static(b"v2"), 60, ["area:NW6", "search"])
        .await
        .expect("set");

    let index = store.tag_index();
    assert!(index.keys_for_tag("area:NW6").contains("property:42"));
    assert!(index.keys_for_tag("search").contains("property:42"));
    assert!(!index.keys_for_tag("area:NW3").contains("property:42"));
}

#[tokio::test]
async fn delete_by_tag_purges_every_tier_and_is_idempotent() {
    let config = CacheConfig::default();
    let (store, tiers) = store_with_handles(&config);

    for key in ["area:NW3", "property:1", "property:2"] {
        store
            .set(key, Bytes::from_static(b"{}"), 3600, ["area:NW3"])
            .await
            .expect("set");
    }
    store
        .set("area:SE1", Bytes::from_static(b"{}"), 3600, ["area:SE1"])
        .await
        .expect("set");
    store.flush_background().await;
    assert!(tiers.l3.get("property:1").await.expect("l3 get").is_some());

    let tagged: HashSet<String> = store.tag_index().keys_for_tag("area:NW3");
    assert_eq!(store.delete_by_tag("area:NW3").await.expect("delete"), 3);

    for key in &tagged {
        assert_eq!(store.get(key).await.expect("get"), None);
        assert!(tiers.l1.get(key).await.expect("l1 get").is_none());
        assert!(tiers.l2.get(key).await.expect("l2 get").is_none());
        assert!(tiers.l3.get(key).await.expect("l3 get").is_none());
    }
    assert!(store.get("area:SE1").await.expect("get").is_some());

    assert_eq!(store.delete_by_tag("area:NW3").await.expect("second delete"), 0);
}

#[tokio::test]
async fn concurrent_loads_share_one_loader_call() {
    let store = CacheStore::new(&CacheConfig::default());
    let calls = Arc::new(AtomicUsize::new(0));

    let loads = (0..16).map(|_| {
        let calls = Arc::clone(&calls);
        let store = &store;
        async move {
            store
                .get_or_load("search:nw3", 300, ["search"], move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok(Bytes::from_static(b"[42]"))
                })
                .await
        }
    });
    let results = join_all(loads).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    for result in results {
        assert_eq!(result.expect("load"), Bytes::from_static(b"[42]"));
    }
    assert!(store.tag_index().keys_for_tag("search").contains("search:nw3"));
}

#[tokio::test]
async fn loader_failures_reach_every_waiter_and_are_not_cached() {
    let store = CacheStore::new(&CacheConfig::default());

    let loads = (0..4).map(|_| {
        store.get_or_load("agent:9", 300, ["agent:9"], || async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Err::<Bytes, _>(CacheError::Loader("database offline".to_string()))
        })
    });
    for result in join_all(loads).await {
        assert_eq!(
            result.unwrap_err(),
            CacheError::Loader("database offline".to_string())
        );
    }

    let value = store
        .get_or_load("agent:9", 300, ["agent:9"], || async {
            Ok(Bytes::from_static(b"agent"))
        })
        .await
        .expect("second load");
    assert_eq!(value, Bytes::from_static(b"agent"));
}

#[tokio::test]
async fn ttl_edge_cases() {
    let store = CacheStore::new(&CacheConfig::default());

    store
        .set("k", Bytes::from_static(b"v"), 0, ["t"])
        .await
        .expect("zero ttl is a no-op");
    assert_eq!(store.get("k").await.expect("get"), None);

    let err = store
        .set("k", Bytes::from_static(b"v"), -1, ["t"])
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::InvalidArgument(_)));
}

#[tokio::test]
async fn clear_is_forbidden_in_production() {
    let config = CacheConfig {
        environment: Environment::Production,
        ..Default::default()
    };
    let store = CacheStore::new(&config);
    store
        .set("area:NW3", Bytes::from_static(b"{}"), 60, ["area"])
        .await
        .expect("set");

    let err = store.clear().await.unwrap_err();
    assert!(matches!(err, CacheError::Forbidden(_)));
    assert!(store.get("area:NW3").await.expect("get").is_some());
}

#[tokio::test]
async fn geography_invalidation_purges_the_area() {
    let services = CacheServices::new(&CacheConfig::default()).expect("services");

    services
        .store
        .set(
            "area:NW3",
            Bytes::from_static(b"{\"name\":\"Hampstead\"}"),
            86_400,
            ["area", "area:NW3"],
        )
        .await
        .expect("set");

    let intent =
        InvalidationIntent::from_json(r#"{"intent": "invalidate-by-geography", "area": "NW3"}"#)
            .expect("intent");
    services
        .dispatcher
        .invalidate(intent)
        .await
        .expect("invalidate");

    assert_eq!(services.store.get("area:NW3").await.expect("get"), None);
}

#[tokio::test]
async fn second_warm_all_reports_already_in_progress() {
    let services = CacheServices::new(&CacheConfig::default()).expect("services");
    let release = Arc::new(Notify::new());
    let entered = Arc::new(Notify::new());

    let (gate, signal) = (Arc::clone(&release), Arc::clone(&entered));
    services.warmer.register(WarmingStrategy::new(
        "slow",
        1,
        300,
        move || {
            let (gate, signal) = (Arc::clone(&gate), Arc::clone(&signal));
            async move {
                signal.notify_one();
                gate.notified().await;
                Ok(vec![WarmItem::new("slow:1", "a", ["slow"])])
            }
        },
    ));
    services.warmer.register(WarmingStrategy::new(
        "fast",
        2,
        300,
        || async { Ok(vec![WarmItem::new("fast:1", "b", Vec::<String>::new())]) },
    ));

    let first = services.warmer.warm_all();
    let second = async {
        entered.notified().await;
        let outcome = services.warmer.warm_all().await;
        let running = services.warmer.is_running();
        let fast = services.store.get("fast:1").await.expect("get");
        release.notify_one();
        (outcome, running, fast)
    };
    let (first, (second, running, fast_during_run)) = tokio::join!(first, second);

    assert_eq!(second, WarmOutcome::AlreadyInProgress);
    assert!(running);
    assert_eq!(fast_during_run, None);

    let stats = first.stats().expect("completed");
    assert_eq!(stats.keys_written, 2);
    assert!(!services.warmer.is_running());
}

#[tokio::test]
async fn failed_strategies_do_not_abort_the_cycle() {
    let services = CacheServices::new(&CacheConfig::default()).expect("services");
    services.warmer.register(WarmingStrategy::new("broken", 1, 300, || async {
        Err::<Vec<WarmItem>, _>(CacheError::Loader("feed unavailable".to_string()))
    }));
    services.warmer.register(WarmingStrategy::new("areas", 2, 300, || async {
        Ok(vec![WarmItem::new("area:NW3", "hampstead", ["area"])])
    }));

    let outcome = services.warmer.warm_all().await;
    let stats = outcome.stats().expect("completed");
    assert!(stats.is_partial_failure());
    assert_eq!(stats.failures[0].strategy, "broken");
    assert_eq!(stats.strategies_completed, 1);
    assert!(services.store.get("area:NW3").await.expect("get").is_some());
    assert_eq!(services.warmer.last_stats().as_ref(), Some(stats));
}

/// Origin that records which region served each call; `failing` regions answer 503.
struct RecordingOrigin {
    calls: std::sync::Mutex<Vec<String>>,
    failing: HashSet<&'static str>,
}

#[async_trait]
impl OriginClient for RecordingOrigin {
    async fn fetch(&self, region: &Region, request: &EdgeRequest) -> CacheResult<OriginResponse> {
        self.calls.lock().unwrap().push(region.id.clone());
        if self.failing.contains(region.id.as_str()) {
            return Ok(OriginResponse::new(StatusCode::BAD_GATEWAY, ""));
        }
        Ok(OriginResponse::new(
            StatusCode::OK,
            format!("{} from {}", request.path, region.id),
        ))
    }
}

fn edge_services(failing: &[&'static str]) -> (CacheServices, Arc<RecordingOrigin>) {
    let mut config = CacheConfig::default();
    config.edge.regions = [("A", 1, false), ("B", 2, true), ("C", 3, true)]
        .into_iter()
        .map(|(id, priority, healthy)| RegionConfig {
            id: id.to_string(),
            origin_url: format!("https://{}.origin.example/", id.to_ascii_lowercase()),
            priority,
            healthy,
        })
        .collect();

    let origin = Arc::new(RecordingOrigin {
        calls: std::sync::Mutex::new(Vec::new()),
        failing: failing.iter().copied().collect(),
    });
    let clock: SharedClock = Arc::new(ManualClock::at_epoch());
    let services = CacheServices::with_parts(&config, clock, origin.clone()).expect("services");
    (services, origin)
}

#[tokio::test]
async fn edge_selects_the_first_healthy_region() {
    let (services, origin) = edge_services(&[]);
    let response = services
        .edge
        .fetch(EdgeRequest::new(Method::GET, "/area/nw3"))
        .await
        .expect("fetch");
    assert_eq!(response.region.as_deref(), Some("B"));
    assert_eq!(response.cache_status, CacheStatus::Miss);
    assert_eq!(*origin.calls.lock().unwrap(), ["B"]);
}

#[tokio::test]
async fn edge_fails_over_then_reports_upstream_unavailable() {
    let (services, origin) = edge_services(&["B"]);
    let response = services
        .edge
        .fetch(EdgeRequest::new(Method::GET, "/area/nw3"))
        .await
        .expect("fetch");
    assert_eq!(response.region.as_deref(), Some("C"));
    assert_eq!(*origin.calls.lock().unwrap(), ["B", "C"]);

    let (services, origin) = edge_services(&["B", "C"]);
    let err = services
        .edge
        .fetch(EdgeRequest::new(Method::GET, "/area/nw3"))
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::UpstreamUnavailable(_)));
    assert_eq!(*origin.calls.lock().unwrap(), ["B", "C"]);
}
