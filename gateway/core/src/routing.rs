use crate::ResourceId;
pub use http::{Method, Uri};
use std::time::Duration;

pub const DEFAULT_HEALTH_PATH: &str = "/health";

/// A backend service bound to a set of request predicates, as mirrored from the cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoutingRule {
    pub id: ResourceId,

    /// The resource version the rule was built from, when known.
    pub resource_version: Option<String>,

    pub matches: RuleMatch,
    pub backend: Backend,

    /// When unset, responses for this rule are never cached.
    pub cache: Option<CachePolicy>,

    /// Locally cached health of the backend. This flag is derived state owned by the gateway's
    /// health checks and is never written back to the cluster.
    pub healthy: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RuleMatch {
    pub method: Option<Method>,
    pub host: Option<String>,
    pub path: Option<PathMatch>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PathMatch {
    Exact(String),
    Prefix(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Backend {
    pub name: String,
    pub url: Uri,
    pub health_path: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CachePolicy {
    /// Overrides the gateway's default TTL.
    pub ttl: Option<Duration>,
    pub statuses: Vec<u16>,
    pub tags: Vec<String>,
}

// === impl RoutingRule ===

impl RoutingRule {
    /// Returns the key under which this rule's responses are cached.
    pub fn service_key(&self) -> &str {
        &self.backend.name
    }

    /// Returns the path to request from the backend: a matched prefix is stripped, anything else
    /// is forwarded unchanged.
    pub fn upstream_path<'p>(&self, path: &'p str) -> &'p str {
        match &self.matches.path {
            Some(PathMatch::Prefix(prefix)) if prefix != "/" => {
                match path.strip_prefix(prefix.as_str()) {
                    Some("") => "/",
                    Some(rest) if rest.starts_with('/') => rest,
                    _ => path,
                }
            }
            _ => path,
        }
    }

    /// Builds the backend URI for the given service-relative path and optional query.
    pub fn upstream_uri(&self, path: &str, query: Option<&str>) -> Result<Uri, http::Error> {
        let base = self.backend.url.path().trim_end_matches('/');
        let path_and_query = match query {
            Some(q) => format!("{base}{path}?{q}"),
            None => format!("{base}{path}"),
        };
        let mut parts = self.backend.url.clone().into_parts();
        parts.path_and_query = Some(path_and_query.parse()?);
        Ok(Uri::from_parts(parts)?)
    }

    /// Returns the URI probed to determine the backend's health.
    pub fn health_uri(&self) -> Result<Uri, http::Error> {
        self.upstream_uri(&self.backend.health_path, None)
    }
}

// === impl RuleMatch ===

impl RuleMatch {
    /// Tests a request against every predicate present on the rule.
    pub fn matches(&self, method: &Method, host: Option<&str>, path: &str) -> bool {
        if let Some(m) = &self.method {
            if m != method {
                return false;
            }
        }

        if let Some(expected) = &self.host {
            let Some(host) = host else {
                return false;
            };
            if !strip_port(host).eq_ignore_ascii_case(strip_port(expected)) {
                return false;
            }
        }

        match &self.path {
            None => true,
            Some(PathMatch::Exact(p)) => p == path,
            Some(PathMatch::Prefix(p)) => path.starts_with(p.as_str()),
        }
    }
}

fn strip_port(host: &str) -> &str {
    // Bracketed IPv6 literals carry colons of their own.
    if let Some(end) = host.rfind(']') {
        return &host[..=end];
    }
    match host.rsplit_once(':') {
        Some((h, port)) if port.bytes().all(|b| b.is_ascii_digit()) => h,
        _ => host,
    }
}

// === impl CachePolicy ===

impl CachePolicy {
    pub const DEFAULT_STATUSES: [u16; 1] = [200];

    pub fn is_cacheable_status(&self, status: u16) -> bool {
        if self.statuses.is_empty() {
            return Self::DEFAULT_STATUSES.contains(&status);
        }
        self.statuses.contains(&status)
    }
}
