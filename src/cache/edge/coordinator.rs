//! Edge read path: stale-while-revalidate over the cache store plus origin
//! failover across regions.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use dashmap::DashSet;
use metrics::{counter, histogram};
use reqwest::StatusCode;
use reqwest::header::{CONTENT_TYPE, HeaderMap};
use serde::Serialize;
use tracing::{debug, instrument, warn};

use super::origin::{OriginClient, OriginResponse, is_retryable};
use super::region::RegionSet;
use super::request::EdgeRequest;
use crate::cache::config::EdgeConfig;
use crate::cache::entry::Freshness;
use crate::cache::error::{CacheError, CacheResult};
use crate::cache::keys::{EdgeKeyPolicy, edge_cache_key};
use crate::cache::store::CacheStore;

const METRIC_EDGE_REQUEST: &str = "canopy_edge_request_total";
const METRIC_EDGE_REVALIDATE: &str = "canopy_edge_revalidate_total";
const METRIC_EDGE_FAILOVER: &str = "canopy_edge_failover_total";
const METRIC_EDGE_ORIGIN_MS: &str = "canopy_edge_origin_ms";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStatus {
    Hit,
    Stale,
    Miss,
    /// Not cacheable; served straight from the origin.
    Bypass,
}

impl CacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheStatus::Hit => "hit",
            CacheStatus::Stale => "stale",
            CacheStatus::Miss => "miss",
            CacheStatus::Bypass => "bypass",
        }
    }
}

#[derive(Debug, Clone)]
pub struct EdgeResponse {
    pub status: StatusCode,
    pub content_type: Option<String>,
    /// Origin headers, less hop-by-hop ones and `set-cookie`.
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub cache_status: CacheStatus,
    /// Region that produced the body; `None` when served from cache.
    pub region: Option<String>,
}

/// Edge lifetimes and key shaping.
#[derive(Debug, Clone)]
pub struct EdgePolicy {
    pub keys: EdgeKeyPolicy,
    pub ttl_secs: u64,
    pub stale_window_secs: u64,
    pub origin_timeout: Duration,
}

impl EdgePolicy {
    pub fn from_config(config: &EdgeConfig) -> Self {
        Self {
            keys: EdgeKeyPolicy {
                max_len: config.max_key_len,
                ignored_query_params: config.ignored_query_params.clone(),
            },
            ttl_secs: config.ttl_secs,
            stale_window_secs: config.stale_window_secs,
            origin_timeout: config.origin_timeout(),
        }
    }
}

#[derive(Clone)]
pub struct EdgeCacheCoordinator {
    store: Arc<CacheStore>,
    regions: Arc<RegionSet>,
    origin: Arc<dyn OriginClient>,
    policy: Arc<EdgePolicy>,
    revalidating: Arc<DashSet<String>>,
}

impl EdgeCacheCoordinator {
    pub fn new(
        store: Arc<CacheStore>,
        regions: Arc<RegionSet>,
        origin: Arc<dyn OriginClient>,
        policy: EdgePolicy,
    ) -> Self {
        Self {
            store,
            regions,
            origin,
            policy: Arc::new(policy),
            revalidating: Arc::new(DashSet::new()),
        }
    }

    /// Region table; the health checker writes through this handle.
    pub fn regions(&self) -> &Arc<RegionSet> {
        &self.regions
    }

    pub fn cache_key(&self, request: &EdgeRequest) -> String {
        edge_cache_key(request, &self.policy.keys)
    }

    /// Keys with a background revalidation currently running.
    pub fn revalidations_in_flight(&self) -> usize {
        self.revalidating.len()
    }

    /// Serve `request` from the edge cache or the origin.
    ///
    /// Fresh entries are served as is. Stale ones are served while a single
    /// background revalidation refreshes them. Anything else goes to the
    /// origin, failing over across healthy regions; when every region fails
    /// the result is [`CacheError::UpstreamUnavailable`].
    #[instrument(skip(self, request), fields(method = %request.method, path = %request.path))]
    pub async fn fetch(&self, request: EdgeRequest) -> CacheResult<EdgeResponse> {
        let result = self.serve(request).await;
        let status = match &result {
            Ok(response) => response.cache_status.as_str(),
            Err(_) => "error",
        };
        counter!(METRIC_EDGE_REQUEST, "status" => status).increment(1);
        result
    }

    async fn serve(&self, request: EdgeRequest) -> CacheResult<EdgeResponse> {
        if !request.is_cacheable() {
            let (region, response) = self.fetch_origin(&request).await?;
            return Ok(respond(response, CacheStatus::Bypass, Some(region)));
        }

        let key = self.cache_key(&request);
        match self.store.lookup(&key).await {
            Ok(Some(entry)) => match CachedResponse::decode(entry.value.clone()) {
                Some(cached) => match entry.freshness(self.store.clock().now()) {
                    Freshness::Fresh => return Ok(cached.into_response(CacheStatus::Hit)),
                    Freshness::Stale => {
                        self.schedule_revalidation(key, request);
                        return Ok(cached.into_response(CacheStatus::Stale));
                    }
                    Freshness::Expired => {}
                },
                None => warn!(key = %key, "undecodable edge entry ignored"),
            },
            Ok(None) => {}
            // the cache is an optimisation; the origin still answers
            Err(err) => warn!(key = %key, error = %err, "edge lookup failed"),
        }

        let (region, response) = self.fetch_origin(&request).await?;
        self.store_response(&key, &response).await;
        Ok(respond(response, CacheStatus::Miss, Some(region)))
    }

    fn schedule_revalidation(&self, key: String, request: EdgeRequest) {
        if !self.revalidating.insert(key.clone()) {
            debug!(key = %key, "revalidation already in flight");
            counter!(METRIC_EDGE_REVALIDATE, "outcome" => "deduplicated").increment(1);
            return;
        }

        let this = self.clone();
        tokio::spawn(async move {
            let _guard = RevalidationGuard {
                set: Arc::clone(&this.revalidating),
                key: key.clone(),
            };
            match this.fetch_origin(&request).await {
                Ok((region, response)) => {
                    this.store_response(&key, &response).await;
                    debug!(key = %key, region = %region, status = %response.status, "edge entry revalidated");
                    counter!(METRIC_EDGE_REVALIDATE, "outcome" => "refreshed").increment(1);
                }
                Err(err) => {
                    warn!(key = %key, error = %err, "edge revalidation failed");
                    counter!(METRIC_EDGE_REVALIDATE, "outcome" => "failed").increment(1);
                }
            }
        });
    }

    /// Try healthy regions in priority order. Returns the serving region's id.
    async fn fetch_origin(&self, request: &EdgeRequest) -> CacheResult<(String, OriginResponse)> {
        let regions = self.regions.healthy();
        if regions.is_empty() {
            return Err(CacheError::upstream("no healthy origin region"));
        }

        let limit = request.timeout.unwrap_or(self.policy.origin_timeout);
        let mut last_failure = String::new();

        for (attempt, region) in regions.iter().enumerate() {
            if attempt > 0 {
                counter!(METRIC_EDGE_FAILOVER).increment(1);
            }

            let started_at = Instant::now();
            let outcome = tokio::time::timeout(limit, self.origin.fetch(region, request)).await;
            histogram!(METRIC_EDGE_ORIGIN_MS, "region" => region.id.clone())
                .record(started_at.elapsed().as_secs_f64() * 1000.0);

            last_failure = match outcome {
                Ok(Ok(response)) if !is_retryable(response.status) => {
                    return Ok((region.id.clone(), response));
                }
                Ok(Ok(response)) => format!("{} answered {}", region.id, response.status),
                Ok(Err(err)) => err.to_string(),
                Err(_) => CacheError::timeout(format!("origin fetch from {}", region.id), limit)
                    .to_string(),
            };
            warn!(region = %region.id, attempt, reason = %last_failure, "origin fetch failed");
        }

        Err(CacheError::upstream(format!(
            "all {} healthy regions failed, last: {last_failure}",
            regions.len()
        )))
    }

    /// Cache a successful, storable origin response. Failures are logged only.
    async fn store_response(&self, key: &str, response: &OriginResponse) {
        if !response.status.is_success() {
            return;
        }
        let directives = response.directives();
        if !directives.is_storable() {
            debug!(key, "origin marked response uncacheable");
            return;
        }

        let ttl_secs = directives.max_age.unwrap_or(self.policy.ttl_secs);
        let stale_window_secs = directives
            .stale_while_revalidate
            .unwrap_or(self.policy.stale_window_secs);
        let value = CachedResponse {
            status: response.status,
            headers: stored_headers(&response.headers),
            body: response.body.clone(),
        }
        .encode();

        if let Err(err) = self
            .store
            .insert(key, value, ttl_secs, stale_window_secs, response.cache_tags())
            .await
        {
            warn!(key, error = %err, "failed to store edge response");
        }
    }
}

fn respond(response: OriginResponse, cache_status: CacheStatus, region: Option<String>) -> EdgeResponse {
    EdgeResponse {
        status: response.status,
        content_type: response.content_type().map(str::to_string),
        headers: stored_headers(&response.headers),
        body: response.body,
        cache_status,
        region,
    }
}

struct RevalidationGuard {
    set: Arc<DashSet<String>>,
    key: String,
}

impl Drop for RevalidationGuard {
    fn drop(&mut self) {
        self.set.remove(&self.key);
    }
}

/// Origin headers a shared cache must not replay.
const UNSTORED_HEADERS: [&str; 10] = [
    "connection",
    "content-length",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "set-cookie",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Origin headers worth keeping with the body, in origin order.
fn stored_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|(name, _)| !UNSTORED_HEADERS.contains(&name.as_str()))
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.to_string(), value.to_string()))
        })
        .collect()
}

/// Wire form of a cached edge response:
/// `status: u16 | header count: u16 | (name len: u16 | name | value len: u16 | value)* | body`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct CachedResponse {
    status: StatusCode,
    headers: Vec<(String, String)>,
    body: Bytes,
}

impl CachedResponse {
    fn encode(&self) -> Bytes {
        let fits = |text: &str| text.len() <= usize::from(u16::MAX);
        let headers: Vec<&(String, String)> = self
            .headers
            .iter()
            .filter(|(name, value)| fits(name) && fits(value))
            .take(usize::from(u16::MAX))
            .collect();
        let headers_len: usize = headers
            .iter()
            .map(|(name, value)| 4 + name.len() + value.len())
            .sum();

        let mut buf = BytesMut::with_capacity(4 + headers_len + self.body.len());
        buf.put_u16(self.status.as_u16());
        buf.put_u16(u16::try_from(headers.len()).unwrap_or(0));
        for (name, value) in headers {
            put_text(&mut buf, name);
            put_text(&mut buf, value);
        }
        buf.put_slice(&self.body);
        buf.freeze()
    }

    fn decode(mut raw: Bytes) -> Option<Self> {
        if raw.remaining() < 4 {
            return None;
        }
        let status = StatusCode::from_u16(raw.get_u16()).ok()?;
        let count = usize::from(raw.get_u16());
        let mut headers = Vec::with_capacity(count);
        for _ in 0..count {
            let name = take_text(&mut raw)?;
            let value = take_text(&mut raw)?;
            headers.push((name, value));
        }
        Some(Self {
            status,
            headers,
            body: raw,
        })
    }

    fn content_type(&self) -> Option<&str> {
        self.headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(CONTENT_TYPE.as_str()))
            .map(|(_, value)| value.as_str())
    }

    fn into_response(self, cache_status: CacheStatus) -> EdgeResponse {
        EdgeResponse {
            status: self.status,
            content_type: self.content_type().map(str::to_string),
            headers: self.headers,
            body: self.body,
            cache_status,
            region: None,
        }
    }
}

fn put_text(buf: &mut BytesMut, text: &str) {
    buf.put_u16(u16::try_from(text.len()).unwrap_or(0));
    buf.put_slice(text.as_bytes());
}

fn take_text(raw: &mut Bytes) -> Option<String> {
    if raw.remaining() < 2 {
        return None;
    }
    let len = usize::from(raw.get_u16());
    if raw.remaining() < len {
        return None;
    }
    String::from_utf8(raw.split_to(len).to_vec()).ok()
}
