use std::time::Duration;

use reqwest::Method;
use reqwest::header::{ACCEPT_LANGUAGE, AUTHORIZATION, COOKIE, HeaderMap, USER_AGENT};
use serde::Serialize;

/// Cookie names that mark a signed-in visitor. Only presence is recorded.
const SESSION_COOKIE_PREFIXES: &[&str] = &["session", "sid"];

/// Coarse device bucket; one of the three edge variance dimensions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    #[default]
    Desktop,
    Mobile,
    Tablet,
    Bot,
}

impl DeviceClass {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceClass::Desktop => "desktop",
            DeviceClass::Mobile => "mobile",
            DeviceClass::Tablet => "tablet",
            DeviceClass::Bot => "bot",
        }
    }

    pub fn from_user_agent(user_agent: &str) -> Self {
        let ua = user_agent.to_ascii_lowercase();
        let has = |needle: &str| ua.contains(needle);

        if has("bot") || has("crawler") || has("spider") || has("slurp") {
            DeviceClass::Bot
        } else if has("ipad") || has("tablet") || (has("android") && !has("mobile")) {
            DeviceClass::Tablet
        } else if has("mobi") || has("iphone") || has("android") {
            DeviceClass::Mobile
        } else {
            DeviceClass::Desktop
        }
    }
}

/// An inbound request as the edge sees it.
///
/// Credentials are reduced to `authenticated` on construction and never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub language: Option<String>,
    pub device: DeviceClass,
    pub authenticated: bool,
    /// Per-request origin deadline; falls back to the configured one.
    pub timeout: Option<Duration>,
}

impl EdgeRequest {
    pub fn new(method: Method, path_and_query: &str) -> Self {
        let (path, query) = match path_and_query.split_once('?') {
            Some((path, query)) => (path, query),
            None => (path_and_query, ""),
        };
        let query = url::form_urlencoded::parse(query.as_bytes())
            .map(|(name, value)| (name.into_owned(), value.into_owned()))
            .collect();

        Self {
            method,
            path: if path.is_empty() { "/".to_string() } else { path.to_string() },
            query,
            language: None,
            device: DeviceClass::default(),
            authenticated: false,
            timeout: None,
        }
    }

    /// Build from request headers: `Accept-Language`, `User-Agent`,
    /// `Authorization` and session cookies.
    pub fn from_headers(method: Method, path_and_query: &str, headers: &HeaderMap) -> Self {
        let header = |name| headers.get(name).and_then(|value| value.to_str().ok());

        let language = header(ACCEPT_LANGUAGE).and_then(primary_language);
        let device = header(USER_AGENT)
            .map(DeviceClass::from_user_agent)
            .unwrap_or_default();
        let authenticated = headers.contains_key(AUTHORIZATION)
            || headers
                .get_all(COOKIE)
                .iter()
                .filter_map(|value| value.to_str().ok())
                .any(has_session_cookie);

        Self {
            language,
            device,
            authenticated,
            ..Self::new(method, path_and_query)
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = primary_language(&language.into());
        self
    }

    pub fn with_device(mut self, device: DeviceClass) -> Self {
        self.device = device;
        self
    }

    pub fn with_authenticated(mut self, authenticated: bool) -> Self {
        self.authenticated = authenticated;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Only safe, idempotent reads are cached.
    pub fn is_cacheable(&self) -> bool {
        self.method == Method::GET || self.method == Method::HEAD
    }

    /// The query string forwarded to the origin, in the order received.
    pub fn encoded_query(&self) -> Option<String> {
        if self.query.is_empty() {
            return None;
        }
        Some(
            url::form_urlencoded::Serializer::new(String::new())
                .extend_pairs(self.query.iter())
                .finish(),
        )
    }
}

/// `fr-CA;q=0.9, en;q=0.8` -> `fr`.
fn primary_language(raw: &str) -> Option<String> {
    let first = raw.split(',').next()?.split(';').next()?.trim();
    let primary = first.split(['-', '_']).next()?.trim().to_ascii_lowercase();
    if primary.is_empty() || primary == "*" || !primary.chars().all(|c| c.is_ascii_alphabetic()) {
        return None;
    }
    Some(primary)
}

fn has_session_cookie(cookie_header: &str) -> bool {
    cookie_header
        .split(';')
        .filter_map(|pair| pair.split_once('=').map(|(name, _)| name.trim()))
        .any(|name| {
            let name = name.to_ascii_lowercase();
            SESSION_COOKIE_PREFIXES
                .iter()
                .any(|prefix| name.starts_with(prefix))
        })
}
