use crate::{
    interceptor::{CacheRead, CacheWrite, MatchRoute, ProxyForward},
    Upstream,
};
use anyhow::{anyhow, Result};
use bytes::Bytes;
use gateway_cache as cache;
use gateway_core::{CacheStore, RoutingRule};
use gateway_k8s_index as index;
use http::{header, request, Request, Response};
use std::{sync::Arc, time::Duration};

/// A unit of request handling.
#[async_trait::async_trait]
pub trait Interceptor: Send + Sync + 'static {
    async fn intercept(&self, exchange: &mut Exchange) -> Result<Flow>;
}

/// Tells the chain whether to run the remaining interceptors.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Break,
}

/// Request-scoped state shared by the interceptors of a chain.
#[derive(Debug)]
pub struct Exchange {
    pub request: request::Parts,
    pub body: Bytes,

    /// The rule resolved for the request. `None` when no rule matched.
    pub rule: Option<RoutingRule>,

    pub response: Option<Response<Bytes>>,
}

/// An ordered, immutable sequence of interceptors.
#[derive(Clone)]
pub struct Chain {
    interceptors: Arc<[Arc<dyn Interceptor>]>,
}

// === impl Exchange ===

impl Exchange {
    pub fn new(req: Request<Bytes>) -> Self {
        let (request, body) = req.into_parts();
        Self {
            request,
            body,
            rule: None,
            response: None,
        }
    }

    /// Returns the request's authority, preferring the `host` header.
    pub fn host(&self) -> Option<&str> {
        self.request
            .headers
            .get(header::HOST)
            .and_then(|h| h.to_str().ok())
            .or_else(|| self.request.uri.host())
    }
}

// === impl Chain ===

impl Chain {
    pub fn new(interceptors: Vec<Arc<dyn Interceptor>>) -> Self {
        Self {
            interceptors: interceptors.into(),
        }
    }

    /// Builds the gateway's chain. The cache interceptors are only included when a cache is
    /// provided.
    pub fn build<S, U>(
        index: index::Controller,
        cache: Option<cache::Controller<S>>,
        upstream: U,
        timeout: Duration,
    ) -> Self
    where
        S: CacheStore,
        U: Upstream,
    {
        let mut interceptors: Vec<Arc<dyn Interceptor>> = vec![Arc::new(MatchRoute::new(index))];
        if let Some(cache) = cache.clone() {
            interceptors.push(Arc::new(CacheRead::new(cache)));
        }
        interceptors.push(Arc::new(ProxyForward::new(upstream, timeout)));
        if let Some(cache) = cache {
            interceptors.push(Arc::new(CacheWrite::new(cache)));
        }
        Self::new(interceptors)
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    /// Runs the interceptors in order until one breaks the chain, and returns the response that
    /// was produced.
    pub async fn handle(&self, mut exchange: Exchange) -> Result<Response<Bytes>> {
        for interceptor in self.interceptors.iter() {
            if interceptor.intercept(&mut exchange).await? == Flow::Break {
                break;
            }
        }
        exchange
            .response
            .ok_or_else(|| anyhow!("no interceptor produced a response"))
    }
}

impl std::fmt::Debug for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chain")
            .field("interceptors", &self.interceptors.len())
            .finish()
    }
}
