//! Response caching for the gateway.
//!
//! Reads and invalidations go straight to the backing store. Writes never block the request
//! path: they are handed to a bounded queue drained by a fixed pool of workers, and a write that
//! doesn't fit in the queue is dropped.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod store;

#[cfg(test)]
mod tests;

pub use self::store::MemoryStore;
use gateway_core::{
    cache::CACHEABLE_METHODS, CacheEntry, CacheInvalidation, CacheKey, CacheStore, Error,
    RoutingRule,
};
use http::{header, request, HeaderMap, StatusCode};
use std::{sync::Arc, time::Duration};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info_span, warn, Instrument};

#[derive(Clone, Debug)]
pub struct Options {
    pub num_workers: usize,
    pub buffer_size: usize,
    pub default_ttl: Duration,
}

pub struct Controller<S> {
    inner: Arc<Inner<S>>,
}

struct Inner<S> {
    options: Options,
    store: S,
    jobs_tx: mpsc::Sender<Job>,
    jobs_rx: Arc<Mutex<mpsc::Receiver<Job>>>,
}

/// A pending store write, owned by whichever worker dequeues it.
#[derive(Debug)]
struct Job {
    key: CacheKey,
    entry: CacheEntry,
    ttl: Duration,
    tags: Vec<String>,
}

/// Builds the cache key for a request routed by `rule`.
///
/// The path is relative to the rule's backend so that it lines up with the paths used to
/// invalidate entries.
pub fn request_key(req: &request::Parts, rule: &RoutingRule) -> CacheKey {
    let path = rule.upstream_path(req.uri.path());
    let path = match req.uri.query() {
        Some(q) => format!("{path}?{q}"),
        None => path.to_string(),
    };
    CacheKey::new(rule.service_key(), req.method.clone(), &path)
}

// === impl Controller ===

impl<S> Clone for Controller<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: CacheStore> Controller<S> {
    pub fn new(options: Options, store: S) -> Self {
        let (jobs_tx, jobs_rx) = mpsc::channel(options.buffer_size.max(1));
        Self {
            inner: Arc::new(Inner {
                options,
                store,
                jobs_tx,
                jobs_rx: Arc::new(Mutex::new(jobs_rx)),
            }),
        }
    }

    /// Spawns the write workers. Each worker runs until shutdown is signaled, finishing the write
    /// it is processing; queued writes are discarded.
    pub fn start(&self, shutdown: drain::Watch) {
        for worker in 0..self.inner.options.num_workers {
            tokio::spawn(
                self.clone()
                    .work(shutdown.clone())
                    .instrument(info_span!("cache_worker", worker)),
            );
        }
    }

    async fn work(self, shutdown: drain::Watch) {
        tokio::pin! {
            let shutdown = shutdown.signaled();
        }

        loop {
            let job = tokio::select! {
                biased;
                _ = &mut shutdown => {
                    debug!("Shutting down");
                    return;
                }
                job = async { self.inner.jobs_rx.lock().await.recv().await } => match job {
                    Some(job) => job,
                    None => return,
                },
            };
            self.write(job).await;
        }
    }

    async fn write(&self, Job { key, entry, ttl, tags }: Job) {
        let value = match entry.encode() {
            Ok(value) => value,
            Err(error) => {
                warn!(%key, %error, "Failed to encode cache entry");
                return;
            }
        };
        match self.inner.store.set(&key.to_string(), value, ttl, &tags).await {
            Ok(()) => debug!(%key, ?ttl, "Cached response"),
            Err(error) => warn!(%key, %error, "Failed to cache response"),
        }
    }

    /// Indicates whether a request routed by `rule` may be served from, and written to, the cache.
    pub fn is_cacheable_request(&self, req: &request::Parts, rule: &RoutingRule) -> bool {
        CACHEABLE_METHODS.contains(&req.method)
            && rule.cache.is_some()
            && !has_cache_directive(&req.headers, &["no-cache", "no-store"])
    }

    /// Indicates whether a backend response to a cacheable request may be stored.
    pub fn is_cacheable_response(
        &self,
        rule: &RoutingRule,
        status: StatusCode,
        headers: &HeaderMap,
    ) -> bool {
        let Some(policy) = &rule.cache else {
            return false;
        };
        policy.is_cacheable_status(status.as_u16())
            && !has_cache_directive(headers, &["no-store", "private"])
    }

    /// Returns the TTL for responses routed by `rule`.
    pub fn ttl(&self, rule: &RoutingRule) -> Duration {
        rule.cache
            .as_ref()
            .and_then(|c| c.ttl)
            .unwrap_or(self.inner.options.default_ttl)
    }

    /// Reads a cached response.
    ///
    /// [`Error::CacheNotFound`] is expected for entries that were never written, have expired, or
    /// are still queued for writing.
    pub async fn get_cache(&self, key: &CacheKey) -> Result<CacheEntry, Error> {
        let bytes = self
            .inner
            .store
            .get(&key.to_string())
            .await
            .map_err(Error::Store)?
            .ok_or(Error::CacheNotFound)?;
        CacheEntry::decode(&bytes)
    }

    /// Queues a response to be cached. Never waits: if the queue is full the write is dropped.
    pub fn set_cache(&self, key: CacheKey, entry: CacheEntry, ttl: Duration, tags: Vec<String>) {
        let job = Job {
            key,
            entry,
            ttl,
            tags,
        };
        match self.inner.jobs_tx.try_send(job) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(job)) => {
                warn!(key = %job.key, "Cache write queue is full; dropping write");
            }
            Err(mpsc::error::TrySendError::Closed(job)) => {
                warn!(key = %job.key, "Cache write queue is closed; dropping write");
            }
        }
    }

    /// Removes cached responses, either for explicit paths or for tags.
    ///
    /// The request is validated before the store is touched. Paths are processed in order and
    /// the first path without any cached response fails with [`Error::CachePathNotFound`];
    /// earlier paths remain deleted. A tag invalidation that removes nothing fails with
    /// [`Error::CacheNotFound`].
    pub async fn invalidate(&self, invalidation: &CacheInvalidation) -> Result<(), Error> {
        invalidation.validate()?;
        let store = &self.inner.store;

        if !invalidation.paths.is_empty() {
            for path in &invalidation.paths {
                let keys = CacheKey::for_path(path)
                    .map(|k| k.to_string())
                    .collect::<Vec<_>>();
                let deleted = store.delete(&keys).await.map_err(Error::Store)?;
                if deleted == 0 {
                    return Err(Error::CachePathNotFound(path.clone()));
                }
                debug!(%path, deleted, "Invalidated cache path");
            }
            return Ok(());
        }

        let deleted = store
            .delete_by_tags(&invalidation.tags)
            .await
            .map_err(Error::Store)?;
        if deleted == 0 {
            return Err(Error::CacheNotFound);
        }
        debug!(tags = ?invalidation.tags, deleted, "Invalidated cache tags");
        Ok(())
    }
}

fn has_cache_directive(headers: &HeaderMap, directives: &[&str]) -> bool {
    headers
        .get_all(header::CACHE_CONTROL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|d| {
            let d = d.trim();
            directives.iter().any(|want| d.eq_ignore_ascii_case(want))
        })
}
