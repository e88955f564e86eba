//! Cache key rules.
//!
//! Store keys are validated here, and every edge key is produced by
//! [`edge_cache_key`]; nothing else concatenates edge keys by hand.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use globset::{Glob, GlobMatcher};
use sha2::{Digest, Sha256};

use super::edge::EdgeRequest;
use super::error::{CacheError, CacheResult};

const EDGE_KEY_PREFIX: &str = "edge:";

/// Reject keys that no tier can store faithfully.
pub fn validate_key(key: &str, max_len: usize) -> CacheResult<()> {
    if key.is_empty() {
        return Err(CacheError::invalid_argument("cache key must not be empty"));
    }
    if key.len() > max_len {
        return Err(CacheError::invalid_argument(format!(
            "cache key is {} bytes, limit is {max_len}",
            key.len()
        )));
    }
    if key.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(CacheError::invalid_argument(format!(
            "cache key `{}` contains whitespace or control characters",
            key.escape_debug()
        )));
    }
    Ok(())
}

/// Key selector used by pattern invalidation.
///
/// Patterns containing glob metacharacters are compiled as globs; anything else
/// is a plain prefix.
#[derive(Debug, Clone)]
pub enum KeyPattern {
    Prefix(String),
    Glob(GlobMatcher),
}

impl KeyPattern {
    pub fn parse(pattern: &str) -> CacheResult<Self> {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            return Err(CacheError::invalid_argument("pattern must not be empty"));
        }
        if !pattern.contains(['*', '?', '[', '{']) {
            return Ok(Self::Prefix(pattern.to_string()));
        }
        let glob = Glob::new(pattern)
            .map_err(|err| CacheError::invalid_argument(format!("invalid pattern `{pattern}`: {err}")))?;
        Ok(Self::Glob(glob.compile_matcher()))
    }

    pub fn matches(&self, key: &str) -> bool {
        match self {
            Self::Prefix(prefix) => key.starts_with(prefix.as_str()),
            Self::Glob(matcher) => matcher.is_match(key),
        }
    }
}

/// Compute a hash for any hashable value.
pub fn hash_value<T: Hash + ?Sized>(value: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

/// Inputs that shape edge keys besides the request itself.
#[derive(Debug, Clone)]
pub struct EdgeKeyPolicy {
    pub max_len: usize,
    pub ignored_query_params: Vec<String>,
}

impl EdgeKeyPolicy {
    fn ignores(&self, name: &str) -> bool {
        self.ignored_query_params.iter().any(|rule| match rule.strip_suffix('*') {
            Some(prefix) => name.starts_with(prefix),
            None => rule == name,
        })
    }
}

/// Canonical edge key for a request.
///
/// The key covers the method, the path, the query parameters sorted by name then
/// value (minus ignored ones) and exactly three variance dimensions: language,
/// device class and whether the caller is authenticated. Credentials never
/// reach the key.
pub fn edge_cache_key(request: &EdgeRequest, policy: &EdgeKeyPolicy) -> String {
    let mut params: Vec<(&str, &str)> = request
        .query
        .iter()
        .filter(|(name, _)| !policy.ignores(name))
        .map(|(name, value)| (name.as_str(), value.as_str()))
        .collect();
    params.sort_unstable();

    let query = url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(params)
        .finish();

    let path = normalize_path(&request.path);
    let language = request.language.as_deref().unwrap_or("*");
    let device = request.device.as_str();
    let auth = if request.authenticated { "1" } else { "0" };

    let key = format!(
        "{EDGE_KEY_PREFIX}{method}:{path}?{query}|lang={language}|dev={device}|auth={auth}",
        method = request.method.as_str(),
    );

    if key.len() <= policy.max_len && !key.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return key;
    }

    let digest = Sha256::digest(key.as_bytes());
    format!("{EDGE_KEY_PREFIX}sha256:{}", hex::encode(digest))
}

fn normalize_path(path: &str) -> String {
    let trimmed = path.trim();
    let mut normalized = String::with_capacity(trimmed.len() + 1);
    if !trimmed.starts_with('/') {
        normalized.push('/');
    }
    let mut previous_slash = false;
    for c in trimmed.chars() {
        if c == '/' && previous_slash {
            continue;
        }
        previous_slash = c == '/';
        normalized.push(c);
    }
    if normalized.len() > 1 && normalized.ends_with('/') {
        normalized.pop();
    }
    normalized
}
