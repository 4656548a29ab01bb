use crate::{CachePath, ResourceId};

/// Conditions surfaced by the gateway's control plane and cache.
///
/// Several variants describe expected outcomes rather than failures (a cache miss, a request for a
/// path no rule serves). Callers branch on them explicitly; only the HTTP boundary turns them into
/// status codes.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid cache deletion: exactly one of paths or tags must be provided")]
    InvalidDeleteCache,

    #[error("Cache path not found: {0}")]
    CachePathNotFound(CachePath),

    #[error("Cache not found")]
    CacheNotFound,

    #[error("ingress not found")]
    RoutingRuleNotFound,

    /// The rule was read before a write lock was taken and has since been deleted.
    #[error("ingress {0} no longer exists")]
    RoutingRuleGone(ResourceId),

    /// The rule was replaced by a newer version of the resource after the caller read it.
    #[error("ingress {0} has been replaced by a newer version")]
    RoutingRuleStale(ResourceId),

    #[error("cache store error: {0}")]
    Store(#[source] anyhow::Error),

    #[error("invalid cache entry: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl Error {
    /// Indicates whether this condition belongs to the invalid-deletion family.
    pub fn is_invalid_delete(&self) -> bool {
        matches!(self, Self::InvalidDeleteCache | Self::CachePathNotFound(_))
    }

    /// Indicates whether this condition means that a requested resource does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::CacheNotFound | Self::RoutingRuleNotFound)
    }
}
