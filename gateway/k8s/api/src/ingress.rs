use crate::K8sDuration;
use kube::CustomResource;
use serde::{Deserialize, Serialize};

/// Routes matching HTTP requests to a backend service, optionally caching its responses.
#[derive(Clone, Debug, PartialEq, CustomResource, Deserialize, Serialize)]
#[kube(
    group = "gateway.dev",
    version = "v1alpha1",
    kind = "IngressHTTP",
    plural = "ingresshttps",
    shortname = "ing-http",
    status = "IngressHTTPStatus",
    schema = "disabled",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct IngressHTTPSpec {
    #[serde(default)]
    pub r#match: Match,
    pub service: Service,
    pub cache: Option<Cache>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Match {
    pub method: Option<String>,
    pub host: Option<String>,
    pub path: Option<String>,
    pub path_prefix: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub name: String,
    pub url: String,
    pub health_path: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Cache {
    pub ttl: Option<K8sDuration>,
    #[serde(default)]
    pub statuses: Vec<u16>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngressHTTPStatus {
    pub is_service_healthy: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    #[test]
    fn deserializes_resource() {
        let ingress: IngressHTTP = serde_json::from_value(serde_json::json!({
            "apiVersion": "gateway.dev/v1alpha1",
            "kind": "IngressHTTP",
            "metadata": { "name": "catalog", "namespace": "ns-0" },
            "spec": {
                "match": { "host": "api.example.com", "pathPrefix": "/catalog" },
                "service": { "name": "catalog", "url": "http://catalog:8080" },
                "cache": { "ttl": "1m30s", "statuses": [200, 404], "tags": ["catalog"] }
            },
            "status": { "isServiceHealthy": false }
        }))
        .unwrap();

        assert_eq!(
            ingress.spec.r#match,
            Match {
                host: Some("api.example.com".to_string()),
                path_prefix: Some("/catalog".to_string()),
                ..Default::default()
            }
        );
        assert_eq!(ingress.spec.service.health_path, None);
        let cache = ingress.spec.cache.unwrap();
        assert_eq!(
            cache.ttl.map(Duration::from),
            Some(Duration::from_secs(90))
        );
        assert_eq!(cache.statuses, vec![200, 404]);
        assert_eq!(
            ingress.status,
            Some(IngressHTTPStatus {
                is_service_healthy: Some(false)
            })
        );
    }

    #[test]
    fn match_defaults_to_everything() {
        let spec: IngressHTTPSpec = serde_json::from_value(serde_json::json!({
            "service": { "name": "catalog", "url": "http://catalog:8080" }
        }))
        .unwrap();
        assert_eq!(spec.r#match, Match::default());
        assert_eq!(spec.cache, None);
    }
}
