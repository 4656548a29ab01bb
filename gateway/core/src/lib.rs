#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod cache;
mod error;
pub mod lease;
pub mod routing;


pub use self::{
    cache::{CacheEntry, CacheInvalidation, CacheKey, CachePath, CacheStore},
    error::Error,
    lease::LeaseLock,
    routing::{Backend, CachePolicy, PathMatch, RoutingRule, RuleMatch},
};
use std::fmt;

/// Identifies a namespaced cluster resource.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ResourceId {
    pub namespace: String,
    pub name: String,
}

// === impl ResourceId ===

impl ResourceId {
    pub fn new(namespace: impl ToString, name: impl ToString) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}
