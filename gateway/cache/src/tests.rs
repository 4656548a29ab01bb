use super::*;
use bytes::Bytes;
use gateway_core::{Backend, CachePath, CachePolicy, PathMatch, ResourceId, RuleMatch};
use http::{HeaderValue, Method, Request};
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicUsize, Ordering};

fn mk_rule(cache: Option<CachePolicy>) -> RoutingRule {
    RoutingRule {
        id: ResourceId::new("ns-0", "catalog"),
        resource_version: Some("1".to_string()),
        matches: RuleMatch {
            path: Some(PathMatch::Prefix("/catalog".to_string())),
            ..Default::default()
        },
        backend: Backend {
            name: "catalog".to_string(),
            url: "http://catalog.ns-0.svc:8080".parse().unwrap(),
            health_path: "/health".to_string(),
        },
        cache,
        healthy: true,
    }
}

fn policy(tags: &[&str]) -> CachePolicy {
    CachePolicy {
        ttl: None,
        statuses: vec![],
        tags: tags.iter().map(|t| t.to_string()).collect(),
    }
}

fn options(num_workers: usize, buffer_size: usize) -> Options {
    Options {
        num_workers,
        buffer_size,
        default_ttl: Duration::from_secs(60),
    }
}

fn parts(method: Method, uri: &str) -> request::Parts {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(())
        .unwrap()
        .into_parts()
        .0
}

fn entry(body: &'static str) -> CacheEntry {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    CacheEntry::new(StatusCode::OK, &headers, Bytes::from_static(body.as_bytes()))
}

/// Records how often the store is used.
#[derive(Clone, Default)]
struct CountingStore {
    inner: Arc<MemoryStore>,
    calls: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl CacheStore for CountingStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Bytes>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.get(key).await
    }

    async fn set(
        &self,
        key: &str,
        value: Bytes,
        ttl: Duration,
        tags: &[String],
    ) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.set(key, value, ttl, tags).await
    }

    async fn delete(&self, keys: &[String]) -> anyhow::Result<usize> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.delete(keys).await
    }

    async fn delete_by_tags(&self, tags: &[String]) -> anyhow::Result<usize> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.delete_by_tags(tags).await
    }
}

async fn wait_for_entry<S: CacheStore>(ctrl: &Controller<S>, key: &CacheKey) -> CacheEntry {
    tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            match ctrl.get_cache(key).await {
                Ok(entry) => return entry,
                Err(Error::CacheNotFound) => tokio::task::yield_now().await,
                Err(error) => panic!("unexpected error: {error}"),
            }
        }
    })
    .await
    .expect("queued write must be stored")
}

#[test]
fn request_keys_are_relative_to_the_backend() {
    let rule = mk_rule(Some(policy(&[])));
    let key = request_key(&parts(Method::GET, "/catalog/products?b=2&a=1"), &rule);
    assert_eq!(key.to_string(), "cache::catalog::GET::/products?a=1&b=2");

    let key = request_key(&parts(Method::HEAD, "/catalog"), &rule);
    assert_eq!(key.to_string(), "cache::catalog::HEAD::/");
}

#[tokio::test]
async fn cacheable_requests() {
    let ctrl = Controller::new(options(0, 1), MemoryStore::default());
    let cached = mk_rule(Some(policy(&[])));

    assert!(ctrl.is_cacheable_request(&parts(Method::GET, "/catalog/a"), &cached));
    assert!(ctrl.is_cacheable_request(&parts(Method::HEAD, "/catalog/a"), &cached));
    assert!(!ctrl.is_cacheable_request(&parts(Method::POST, "/catalog/a"), &cached));
    assert!(!ctrl.is_cacheable_request(&parts(Method::GET, "/catalog/a"), &mk_rule(None)));

    for directive in ["no-cache", "max-age=0, No-Store"] {
        let mut req = parts(Method::GET, "/catalog/a");
        req.headers.insert(
            header::CACHE_CONTROL,
            HeaderValue::from_str(directive).unwrap(),
        );
        assert!(!ctrl.is_cacheable_request(&req, &cached), "{directive}");
    }
}

#[tokio::test]
async fn cacheable_responses() {
    let ctrl = Controller::new(options(0, 1), MemoryStore::default());
    let rule = mk_rule(Some(policy(&[])));
    let empty = HeaderMap::new();

    assert!(ctrl.is_cacheable_response(&rule, StatusCode::OK, &empty));
    assert!(!ctrl.is_cacheable_response(&rule, StatusCode::NOT_FOUND, &empty));
    assert!(!ctrl.is_cacheable_response(&mk_rule(None), StatusCode::OK, &empty));

    let mut statuses = policy(&[]);
    statuses.statuses = vec![200, 404];
    let rule404 = mk_rule(Some(statuses));
    assert!(ctrl.is_cacheable_response(&rule404, StatusCode::NOT_FOUND, &empty));

    let mut private = HeaderMap::new();
    private.insert(header::CACHE_CONTROL, HeaderValue::from_static("private"));
    assert!(!ctrl.is_cacheable_response(&rule, StatusCode::OK, &private));
}

#[tokio::test]
async fn ttl_falls_back_to_default() {
    let ctrl = Controller::new(options(0, 1), MemoryStore::default());
    assert_eq!(ctrl.ttl(&mk_rule(Some(policy(&[])))), Duration::from_secs(60));

    let mut short = policy(&[]);
    short.ttl = Some(Duration::from_secs(5));
    assert_eq!(ctrl.ttl(&mk_rule(Some(short))), Duration::from_secs(5));
}

#[tokio::test]
async fn queued_writes_become_readable() {
    let ctrl = Controller::new(options(2, 8), MemoryStore::default());
    let key = CacheKey::new("catalog", Method::GET, "/products");

    ctrl.set_cache(key.clone(), entry("hello"), Duration::from_secs(60), vec![]);
    assert!(
        matches!(ctrl.get_cache(&key).await, Err(Error::CacheNotFound)),
        "nothing is stored until a worker runs"
    );

    let (_signal, shutdown) = drain::channel();
    ctrl.start(shutdown);
    let stored = wait_for_entry(&ctrl, &key).await;
    assert_eq!(stored, entry("hello"));
    assert_eq!(stored.header_map()[header::CONTENT_TYPE], "text/plain");
}

#[tokio::test]
async fn full_queue_drops_writes() {
    let ctrl = Controller::new(options(1, 1), MemoryStore::default());
    let first = CacheKey::new("catalog", Method::GET, "/first");
    let second = CacheKey::new("catalog", Method::GET, "/second");

    // Without running workers the second write doesn't fit and must not block the caller.
    ctrl.set_cache(first.clone(), entry("1"), Duration::from_secs(60), vec![]);
    ctrl.set_cache(second.clone(), entry("2"), Duration::from_secs(60), vec![]);

    let (_signal, shutdown) = drain::channel();
    ctrl.start(shutdown);
    wait_for_entry(&ctrl, &first).await;
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert!(matches!(
        ctrl.get_cache(&second).await,
        Err(Error::CacheNotFound)
    ));
}

#[tokio::test]
async fn workers_stop_on_shutdown() {
    let ctrl = Controller::new(options(2, 8), MemoryStore::default());
    let (signal, shutdown) = drain::channel();
    ctrl.start(shutdown);

    tokio::time::timeout(Duration::from_secs(1), signal.drain())
        .await
        .expect("workers must release the drain watch");

    let key = CacheKey::new("catalog", Method::GET, "/late");
    ctrl.set_cache(key.clone(), entry("late"), Duration::from_secs(60), vec![]);
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert!(matches!(ctrl.get_cache(&key).await, Err(Error::CacheNotFound)));
}

#[tokio::test]
async fn invalid_invalidations_never_reach_the_store() {
    let store = CountingStore::default();
    let ctrl = Controller::new(options(0, 1), store.clone());

    let both = CacheInvalidation {
        paths: vec![CachePath {
            service: "catalog".to_string(),
            path: "/products".to_string(),
        }],
        tags: vec!["catalog".to_string()],
    };
    for invalidation in [CacheInvalidation::default(), both] {
        assert!(matches!(
            ctrl.invalidate(&invalidation).await,
            Err(Error::InvalidDeleteCache)
        ));
    }
    assert_eq!(store.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn invalidates_paths_in_order() {
    let store = CountingStore::default();
    let ctrl = Controller::new(options(0, 1), store.clone());
    for (method, path) in [(Method::GET, "/a"), (Method::HEAD, "/b")] {
        let key = CacheKey::new("catalog", method, path);
        store
            .set(&key.to_string(), Bytes::new(), Duration::from_secs(60), &[])
            .await
            .unwrap();
    }

    let path = |p: &str| CachePath {
        service: "catalog".to_string(),
        path: p.to_string(),
    };
    let invalidation = CacheInvalidation {
        paths: vec![path("/a"), path("/missing"), path("/b")],
        tags: vec![],
    };
    let err = ctrl.invalidate(&invalidation).await.unwrap_err();
    assert_eq!(err.to_string(), "Cache path not found: catalog/missing");
    assert!(err.is_invalid_delete());

    // The first path was removed; the one after the failure was not.
    assert_eq!(store.inner.len(), 1);

    let invalidation = CacheInvalidation {
        paths: vec![path("b")],
        tags: vec![],
    };
    ctrl.invalidate(&invalidation).await.unwrap();
    assert!(store.inner.is_empty());
}

#[tokio::test]
async fn invalidates_tags() {
    let store = MemoryStore::default();
    for (key, tags) in [
        ("k1", vec!["a".to_string()]),
        ("k2", vec!["a".to_string(), "b".to_string()]),
    ] {
        store
            .set(key, Bytes::new(), Duration::from_secs(60), &tags)
            .await
            .unwrap();
    }
    let ctrl = Controller::new(options(0, 1), store);

    let by_tag = |tag: &str| CacheInvalidation {
        paths: vec![],
        tags: vec![tag.to_string()],
    };
    assert!(matches!(
        ctrl.invalidate(&by_tag("c")).await,
        Err(Error::CacheNotFound)
    ));
    ctrl.invalidate(&by_tag("b")).await.unwrap();
    ctrl.invalidate(&by_tag("a")).await.unwrap();
    assert!(matches!(
        ctrl.invalidate(&by_tag("a")).await,
        Err(Error::CacheNotFound)
    ));
}

#[tokio::test(start_paused = true)]
async fn memory_store_expires_entries() {
    let store = MemoryStore::default();
    store
        .set("k", Bytes::from_static(b"v"), Duration::from_secs(10), &["t".to_string()])
        .await
        .unwrap();
    assert_eq!(store.get("k").await.unwrap(), Some(Bytes::from_static(b"v")));

    tokio::time::advance(Duration::from_secs(11)).await;
    assert_eq!(store.get("k").await.unwrap(), None);
    assert_eq!(store.delete_by_tags(&["t".to_string()]).await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn memory_store_purges_expired_entries_on_write() {
    let store = MemoryStore::default();
    for i in 0..1000 {
        let key = format!("k{i}");
        store
            .set(&key, Bytes::new(), Duration::from_secs(1), &["t".to_string()])
            .await
            .unwrap();
    }
    assert_eq!(store.held(), 1000);

    // Nothing is read back, so only writes can reclaim the expired entries.
    tokio::time::advance(Duration::from_secs(3600)).await;
    assert_eq!(store.held(), 1000);
    assert_eq!(store.len(), 0);

    store
        .set("fresh", Bytes::new(), Duration::from_secs(60), &[])
        .await
        .unwrap();
    assert_eq!(store.held(), 1);
    assert_eq!(store.delete_by_tags(&["t".to_string()]).await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn memory_store_clamps_huge_ttls() {
    let store = MemoryStore::default();
    store
        .set("k", Bytes::from_static(b"v"), Duration::MAX, &[])
        .await
        .unwrap();
    tokio::time::advance(Duration::from_secs(30 * 24 * 60 * 60)).await;
    assert_eq!(store.get("k").await.unwrap(), Some(Bytes::from_static(b"v")));
}

#[tokio::test]
async fn memory_store_replaces_tags() {
    let store = MemoryStore::default();
    let ttl = Duration::from_secs(60);
    store.set("k", Bytes::new(), ttl, &["old".to_string()]).await.unwrap();
    store.set("k", Bytes::new(), ttl, &["new".to_string()]).await.unwrap();

    assert_eq!(store.delete_by_tags(&["old".to_string()]).await.unwrap(), 0);
    assert_eq!(store.delete_by_tags(&["new".to_string()]).await.unwrap(), 1);
    assert_eq!(store.delete(&["k".to_string()]).await.unwrap(), 0);
}
