use crate::Gateway;
use anyhow::Result;
use bytes::Bytes;
use gateway_core::{CacheInvalidation, CacheStore, Error, PathMatch, RoutingRule};
use http::{header, HeaderValue, Response, StatusCode};
use serde_json::json;
use tracing::{debug, info};

impl<S: CacheStore> Gateway<S> {
    /// Handles `DELETE /api/cache`.
    pub(crate) async fn delete_cache(&self, body: &[u8]) -> Result<Response<Bytes>> {
        let invalidation = serde_json::from_slice::<CacheInvalidation>(body).map_err(|error| {
            debug!(%error, "Malformed cache invalidation");
            Error::InvalidDeleteCache
        })?;

        match self.cache() {
            Some(cache) => cache.invalidate(&invalidation).await?,
            // Nothing is ever cached when caching is disabled.
            None => {
                invalidation.validate()?;
                return Err(Error::CacheNotFound.into());
            }
        }
        info!(paths = invalidation.paths.len(), tags = ?invalidation.tags, "Invalidated cache");
        Ok(text(StatusCode::OK, "ok"))
    }

    /// Handles `GET /api/ingresses`.
    pub(crate) fn list_ingresses(&self) -> Result<Response<Bytes>> {
        let rules = self.index().list();
        let body = serde_json::to_vec(&rules.iter().map(rule_json).collect::<Vec<_>>())?;
        let mut rsp = Response::new(Bytes::from(body));
        rsp.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        Ok(rsp)
    }
}

pub(crate) fn text(status: StatusCode, body: &'static str) -> Response<Bytes> {
    let mut rsp = Response::new(Bytes::from_static(body.as_bytes()));
    *rsp.status_mut() = status;
    rsp
}

fn rule_json(rule: &RoutingRule) -> serde_json::Value {
    let (path, path_prefix) = match &rule.matches.path {
        Some(PathMatch::Exact(p)) => (Some(p), None),
        Some(PathMatch::Prefix(p)) => (None, Some(p)),
        None => (None, None),
    };
    json!({
        "namespace": rule.id.namespace,
        "name": rule.id.name,
        "match": {
            "method": rule.matches.method.as_ref().map(|m| m.as_str()),
            "host": rule.matches.host,
            "path": path,
            "pathPrefix": path_prefix,
        },
        "service": {
            "name": rule.backend.name,
            "url": rule.backend.url.to_string(),
            "healthPath": rule.backend.health_path,
        },
        "cache": rule.cache.as_ref().map(|c| json!({
            "ttl": c.ttl.map(|ttl| ttl.as_secs_f64()),
            "statuses": c.statuses,
            "tags": c.tags,
        })),
        "isServiceHealthy": rule.healthy,
    })
}
