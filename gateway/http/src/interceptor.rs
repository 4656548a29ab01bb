use crate::{Exchange, Flow, Interceptor, Upstream};
use anyhow::Result;
use bytes::Bytes;
use gateway_cache::{self as cache, request_key};
use gateway_core::{CacheEntry, CacheStore, Error};
use gateway_k8s_index as index;
use http::{header, HeaderMap, HeaderName, Method, Request, Response, StatusCode};
use std::time::Duration;
use tokio::time;
use tracing::{debug, warn};

/// Headers that only apply to a single connection and must not be forwarded.
const HOP_BY_HOP: [&str; 7] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Resolves the healthy rule that serves the request.
#[derive(Clone, Debug)]
pub struct MatchRoute {
    index: index::Controller,
}

/// Serves cacheable requests from the cache, ending the chain on a hit.
pub struct CacheRead<S> {
    cache: cache::Controller<S>,
}

/// Forwards the request to the backend of the resolved rule.
pub struct ProxyForward<U> {
    upstream: U,
    timeout: Duration,
}

/// Queues cacheable backend responses to be cached.
pub struct CacheWrite<S> {
    cache: cache::Controller<S>,
}

// === impl MatchRoute ===

impl MatchRoute {
    pub fn new(index: index::Controller) -> Self {
        Self { index }
    }
}

#[async_trait::async_trait]
impl Interceptor for MatchRoute {
    async fn intercept(&self, exchange: &mut Exchange) -> Result<Flow> {
        let found = {
            let method = &exchange.request.method;
            let path = exchange.request.uri.path();
            let host = exchange.host();
            self.index
                .find(|rule| rule.healthy && rule.matches.matches(method, host, path))
        };

        match found {
            Ok(rule) => {
                debug!(%rule.id, "Matched ingress");
                exchange.rule = Some(rule);
            }
            // Proxying fails with a not-found error when no rule was resolved.
            Err(Error::RoutingRuleNotFound) => {
                debug!(path = exchange.request.uri.path(), "No matching ingress")
            }
            Err(error) => return Err(error.into()),
        }
        Ok(Flow::Continue)
    }
}

// === impl CacheRead ===

impl<S: CacheStore> CacheRead<S> {
    pub fn new(cache: cache::Controller<S>) -> Self {
        Self { cache }
    }
}

#[async_trait::async_trait]
impl<S: CacheStore> Interceptor for CacheRead<S> {
    async fn intercept(&self, exchange: &mut Exchange) -> Result<Flow> {
        let Some(rule) = &exchange.rule else {
            return Ok(Flow::Continue);
        };
        if !self.cache.is_cacheable_request(&exchange.request, rule) {
            return Ok(Flow::Continue);
        }

        let key = request_key(&exchange.request, rule);
        match self.cache.get_cache(&key).await {
            Ok(entry) => {
                debug!(%key, "Serving cached response");
                exchange.response = Some(cached_response(entry, &exchange.request.method));
                Ok(Flow::Break)
            }
            Err(Error::CacheNotFound) => {
                debug!(%key, "Cache miss");
                Ok(Flow::Continue)
            }
            Err(error) => {
                warn!(%key, %error, "Failed to read cache");
                Ok(Flow::Continue)
            }
        }
    }
}

fn cached_response(entry: CacheEntry, method: &Method) -> Response<Bytes> {
    let mut rsp = Response::new(Bytes::new());
    *rsp.status_mut() = entry.status();
    *rsp.headers_mut() = entry.header_map();
    if *method != Method::HEAD {
        *rsp.body_mut() = entry.body;
    }
    rsp
}

// === impl ProxyForward ===

impl<U: Upstream> ProxyForward<U> {
    pub fn new(upstream: U, timeout: Duration) -> Self {
        Self { upstream, timeout }
    }
}

#[async_trait::async_trait]
impl<U: Upstream> Interceptor for ProxyForward<U> {
    async fn intercept(&self, exchange: &mut Exchange) -> Result<Flow> {
        let Some(rule) = &exchange.rule else {
            return Err(Error::RoutingRuleNotFound.into());
        };

        let uri = rule.upstream_uri(
            rule.upstream_path(exchange.request.uri.path()),
            exchange.request.uri.query(),
        )?;
        let mut req = Request::new(exchange.body.clone());
        *req.method_mut() = exchange.request.method.clone();
        *req.uri_mut() = uri;
        *req.headers_mut() = exchange.request.headers.clone();
        strip_hop_by_hop(req.headers_mut());
        // The client derives the host from the backend's URI.
        req.headers_mut().remove(header::HOST);

        debug!(uri = %req.uri(), "Forwarding request");
        let rsp = match time::timeout(self.timeout, self.upstream.send(req)).await {
            Ok(Ok(mut rsp)) => {
                strip_hop_by_hop(rsp.headers_mut());
                rsp
            }
            Ok(Err(error)) => {
                warn!(service = %rule.backend.name, %error, "Backend request failed");
                status_response(StatusCode::BAD_GATEWAY)
            }
            Err(_) => {
                warn!(
                    service = %rule.backend.name,
                    timeout = ?self.timeout,
                    "Backend request timed out"
                );
                status_response(StatusCode::GATEWAY_TIMEOUT)
            }
        };
        exchange.response = Some(rsp);
        Ok(Flow::Continue)
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    // Connection options name further headers that only apply to this hop.
    let named = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect::<Vec<_>>();
    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

fn status_response(status: StatusCode) -> Response<Bytes> {
    let mut rsp = Response::new(Bytes::from_static(
        status.canonical_reason().unwrap_or_default().as_bytes(),
    ));
    *rsp.status_mut() = status;
    rsp
}

// === impl CacheWrite ===

impl<S: CacheStore> CacheWrite<S> {
    pub fn new(cache: cache::Controller<S>) -> Self {
        Self { cache }
    }
}

#[async_trait::async_trait]
impl<S: CacheStore> Interceptor for CacheWrite<S> {
    async fn intercept(&self, exchange: &mut Exchange) -> Result<Flow> {
        let (Some(rule), Some(rsp)) = (&exchange.rule, &exchange.response) else {
            return Ok(Flow::Continue);
        };
        if !self.cache.is_cacheable_request(&exchange.request, rule)
            || !self
                .cache
                .is_cacheable_response(rule, rsp.status(), rsp.headers())
        {
            return Ok(Flow::Continue);
        }

        let key = request_key(&exchange.request, rule);
        let entry = CacheEntry::new(rsp.status(), rsp.headers(), rsp.body().clone());
        let tags = rule
            .cache
            .as_ref()
            .map(|policy| policy.tags.clone())
            .unwrap_or_default();
        self.cache.set_cache(key, entry, self.cache.ttl(rule), tags);
        Ok(Flow::Continue)
    }
}
