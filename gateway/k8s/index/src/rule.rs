use anyhow::{bail, Context, Result};
use gateway_core::{
    routing::{Method, Uri, DEFAULT_HEALTH_PATH},
    Backend, CachePolicy, PathMatch, ResourceId, RoutingRule, RuleMatch,
};
use gateway_k8s_api::{ingress, IngressHTTP, ResourceExt};

/// Converts an `IngressHTTP` resource into a routing rule.
///
/// `healthy` carries the locally cached health of a previous version of the same rule; new rules
/// take their initial health from the resource's status.
pub(crate) fn make_rule(resource: IngressHTTP, healthy: Option<bool>) -> Result<RoutingRule> {
    let namespace = resource
        .namespace()
        .context("IngressHTTP must have a namespace")?;
    let name = resource.name_unchecked();
    let resource_version = resource.resource_version();

    let IngressHTTP { spec, status, .. } = resource;
    let matches = make_match(spec.r#match)?;
    let backend = make_backend(spec.service)?;
    let cache = spec.cache.map(make_cache_policy);

    let healthy = healthy
        .or_else(|| status.and_then(|s| s.is_service_healthy))
        .unwrap_or(true);

    Ok(RoutingRule {
        id: ResourceId::new(namespace, name),
        resource_version,
        matches,
        backend,
        cache,
        healthy,
    })
}

fn make_match(m: ingress::Match) -> Result<RuleMatch> {
    let method = m
        .method
        .map(|m| {
            Method::from_bytes(m.to_ascii_uppercase().as_bytes())
                .with_context(|| format!("invalid method {m:?}"))
        })
        .transpose()?;

    let path = match (m.path, m.path_prefix) {
        (Some(_), Some(_)) => bail!("path and pathPrefix are mutually exclusive"),
        (Some(path), None) => Some(PathMatch::Exact(path)),
        (None, Some(prefix)) => Some(PathMatch::Prefix(prefix)),
        (None, None) => None,
    };

    Ok(RuleMatch {
        method,
        host: m.host.filter(|h| !h.is_empty()),
        path,
    })
}

fn make_backend(svc: ingress::Service) -> Result<Backend> {
    let url = svc
        .url
        .parse::<Uri>()
        .with_context(|| format!("invalid service url {:?}", svc.url))?;
    if url.scheme().is_none() || url.authority().is_none() {
        bail!("service url {:?} must be absolute", svc.url);
    }

    let health_path = match svc.health_path {
        Some(p) if p.starts_with('/') => p,
        Some(p) if !p.is_empty() => format!("/{p}"),
        _ => DEFAULT_HEALTH_PATH.to_string(),
    };

    Ok(Backend {
        name: svc.name,
        url,
        health_path,
    })
}

fn make_cache_policy(cache: ingress::Cache) -> CachePolicy {
    CachePolicy {
        ttl: cache.ttl.map(Into::into),
        statuses: cache.statuses,
        tags: cache.tags,
    }
}
