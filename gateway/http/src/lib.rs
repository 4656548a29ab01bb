//! The gateway's HTTP surface.
//!
//! Every request is either handled by the administrative API or run through an immutable chain of
//! interceptors, built once at startup:
//!
//! ```text
//! match-route -> [cache-read] -> proxy-forward -> [cache-write]
//! ```
//!
//! The cache interceptors are only present when caching is enabled. Interceptors return errors
//! rather than writing error responses; [`error_response`] is the single place where errors
//! become status codes.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod admin;
mod chain;
mod error;
pub mod interceptor;
mod server;
mod upstream;


pub use self::{
    chain::{Chain, Exchange, Flow, Interceptor},
    error::error_response,
    server::{serve, Gateway},
    upstream::{HttpUpstream, Upstream},
};

/// The default limit on buffered request and response bodies.
pub const DEFAULT_MAX_BODY_SIZE: usize = 10 * 1024 * 1024;
