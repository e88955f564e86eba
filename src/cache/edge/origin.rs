//! Origin fetching and response cacheability.

use std::collections::BTreeSet;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{CACHE_CONTROL, CONTENT_TYPE, HeaderMap};
use reqwest::{Client, StatusCode};

use super::region::Region;
use super::request::EdgeRequest;
use crate::cache::error::{CacheError, CacheResult};

/// Response header listing invalidation tags for the cached copy.
pub const CACHE_TAG_HEADER: &str = "cache-tag";
/// Tag attached to every edge entry so the whole edge can be purged at once.
pub const EDGE_TAG: &str = "edge";

#[derive(Debug, Clone)]
pub struct OriginResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl OriginResponse {
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
    }

    pub fn directives(&self) -> CacheDirectives {
        CacheDirectives::parse(
            self.headers
                .get_all(CACHE_CONTROL)
                .iter()
                .filter_map(|value| value.to_str().ok()),
        )
    }

    /// `Cache-Tag` values (comma or space separated) plus [`EDGE_TAG`].
    pub fn cache_tags(&self) -> BTreeSet<String> {
        let mut tags: BTreeSet<String> = self
            .headers
            .get_all(CACHE_TAG_HEADER)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split([',', ' ']))
            .map(str::trim)
            .filter(|tag| !tag.is_empty())
            .map(str::to_string)
            .collect();
        tags.insert(EDGE_TAG.to_string());
        tags
    }
}

/// The origin's caching instructions, as far as the edge honours them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheDirectives {
    pub no_store: bool,
    pub private: bool,
    /// `s-maxage` when present, otherwise `max-age`.
    pub max_age: Option<u64>,
    pub stale_while_revalidate: Option<u64>,
}

impl CacheDirectives {
    pub fn parse<'a>(values: impl IntoIterator<Item = &'a str>) -> Self {
        let mut directives = Self::default();
        let mut max_age = None;
        let mut shared_max_age = None;

        for directive in values.into_iter().flat_map(|value| value.split(',')) {
            let (name, argument) = match directive.split_once('=') {
                Some((name, argument)) => (name.trim(), Some(argument.trim().trim_matches('"'))),
                None => (directive.trim(), None),
            };
            let seconds = argument.and_then(|value| value.parse::<u64>().ok());
            match name.to_ascii_lowercase().as_str() {
                "no-store" => directives.no_store = true,
                "private" => directives.private = true,
                "max-age" => max_age = seconds.or(max_age),
                "s-maxage" => shared_max_age = seconds.or(shared_max_age),
                "stale-while-revalidate" => directives.stale_while_revalidate = seconds,
                _ => {}
            }
        }

        directives.max_age = shared_max_age.or(max_age);
        directives
    }

    pub fn is_storable(&self) -> bool {
        !self.no_store && !self.private
    }
}

/// Statuses worth retrying against another region.
pub fn is_retryable(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
}

#[async_trait]
pub trait OriginClient: Send + Sync {
    /// Fetch `request` from `region`. Transport failures are errors; any HTTP
    /// status, including 5xx, is a response.
    async fn fetch(&self, region: &Region, request: &EdgeRequest) -> CacheResult<OriginResponse>;
}

/// [`OriginClient`] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpOriginClient {
    client: Client,
}

impl HttpOriginClient {
    pub fn new() -> CacheResult<Self> {
        let client = Client::builder()
            .user_agent(Self::user_agent())
            .build()
            .map_err(|err| CacheError::upstream(format!("failed to build http client: {err}")))?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    pub fn user_agent() -> &'static str {
        concat!("canopy-edge/", env!("CARGO_PKG_VERSION"))
    }

    fn url(region: &Region, request: &EdgeRequest) -> CacheResult<url::Url> {
        let mut url = region
            .origin_url
            .join(request.path.trim_start_matches('/'))
            .map_err(|err| CacheError::invalid_argument(format!("bad origin path: {err}")))?;
        url.set_query(None);
        if !request.query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (name, value) in &request.query {
                pairs.append_pair(name, value);
            }
        }
        Ok(url)
    }
}

#[async_trait]
impl OriginClient for HttpOriginClient {
    async fn fetch(&self, region: &Region, request: &EdgeRequest) -> CacheResult<OriginResponse> {
        let url = Self::url(region, request)?;
        let mut builder = self.client.request(request.method.clone(), url);
        if let Some(language) = &request.language {
            builder = builder.header(reqwest::header::ACCEPT_LANGUAGE, language.as_str());
        }

        let response = builder
            .send()
            .await
            .map_err(|err| CacheError::upstream(format!("{}: {err}", region.id)))?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|err| CacheError::upstream(format!("{}: {err}", region.id)))?;

        Ok(OriginResponse {
            status,
            headers,
            body,
        })
    }
}
