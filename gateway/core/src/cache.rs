use crate::Error;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, time::Duration};

/// Methods whose responses may be cached.
pub static CACHEABLE_METHODS: [Method; 2] = [Method::GET, Method::HEAD];

/// A backing key-value store for cached responses.
///
/// Implementations only need per-key atomicity: a reader either observes a complete value or
/// nothing.
#[async_trait::async_trait]
pub trait CacheStore: Send + Sync + 'static {
    /// Returns the value stored under `key`, or `None` if it is absent or expired.
    async fn get(&self, key: &str) -> anyhow::Result<Option<Bytes>>;

    /// Stores `value` under `key` for `ttl`, associating it with each of `tags`.
    async fn set(&self, key: &str, value: Bytes, ttl: Duration, tags: &[String])
        -> anyhow::Result<()>;

    /// Removes the given keys, returning the number of keys that existed.
    async fn delete(&self, keys: &[String]) -> anyhow::Result<usize>;

    /// Removes every key associated with any of `tags`, returning the number of keys removed.
    async fn delete_by_tags(&self, tags: &[String]) -> anyhow::Result<usize>;
}

/// The fingerprint addressing a cached response.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    service: String,
    method: Method,
    path: String,
}

/// A stored backend response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub status: u16,
    pub headers: BTreeMap<String, Vec<String>>,
    pub body: Bytes,
}

/// Identifies cached responses of a service by its service-relative path.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachePath {
    pub service: String,
    pub path: String,
}

/// A request to remove cached responses, either by path or by tag.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheInvalidation {
    #[serde(default)]
    pub paths: Vec<CachePath>,
    #[serde(default)]
    pub tags: Vec<String>,
}

// === impl CacheKey ===

impl CacheKey {
    /// Builds a key from a service-relative path, which may include a query string.
    pub fn new(service: impl ToString, method: Method, path_and_query: &str) -> Self {
        Self {
            service: service.to_string(),
            method,
            path: normalize_path(path_and_query),
        }
    }

    /// Returns the keys of every cacheable method for the given path.
    pub fn for_path(path: &CachePath) -> impl Iterator<Item = Self> + '_ {
        CACHEABLE_METHODS
            .iter()
            .map(move |m| Self::new(&path.service, m.clone(), &path.path))
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cache::{}::{}::{}", self.service, self.method, self.path)
    }
}

/// Ensures a leading slash and orders query parameters so that equivalent requests share a key.
fn normalize_path(path_and_query: &str) -> String {
    let (path, query) = match path_and_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_and_query, None),
    };

    let mut normalized = String::with_capacity(path_and_query.len() + 1);
    if !path.starts_with('/') {
        normalized.push('/');
    }
    normalized.push_str(path);

    if let Some(query) = query {
        let mut pairs = query.split('&').filter(|p| !p.is_empty()).collect::<Vec<_>>();
        if !pairs.is_empty() {
            pairs.sort_unstable();
            normalized.push('?');
            normalized.push_str(&pairs.join("&"));
        }
    }

    normalized
}

// === impl CacheEntry ===

impl CacheEntry {
    pub fn new(status: StatusCode, headers: &HeaderMap, body: Bytes) -> Self {
        let mut map = BTreeMap::<String, Vec<String>>::new();
        for (name, value) in headers {
            // Values that aren't visible ASCII can't round-trip through the store.
            if let Ok(v) = value.to_str() {
                map.entry(name.as_str().to_string())
                    .or_default()
                    .push(v.to_string());
            }
        }
        Self {
            status: status.as_u16(),
            headers: map,
            body,
        }
    }

    pub fn status(&self) -> StatusCode {
        StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK)
    }

    pub fn header_map(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, values) in &self.headers {
            let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
                continue;
            };
            for value in values {
                if let Ok(value) = HeaderValue::from_str(value) {
                    headers.append(name.clone(), value);
                }
            }
        }
        headers
    }

    pub fn encode(&self) -> Result<Bytes, Error> {
        Ok(serde_json::to_vec(self)?.into())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

// === impl CachePath ===

impl fmt::Display for CachePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.service, self.path)
    }
}

// === impl CacheInvalidation ===

impl CacheInvalidation {
    /// Accepts the request only when exactly one of paths or tags is populated.
    pub fn validate(&self) -> Result<(), Error> {
        match (self.paths.is_empty(), self.tags.is_empty()) {
            (false, true) | (true, false) => Ok(()),
            _ => Err(Error::InvalidDeleteCache),
        }
    }
}
