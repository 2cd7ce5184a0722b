//! Discovery Adapter (C2, spec §4.2).

use std::collections::HashMap;

use kube::api::{Api, DynamicObject};
use kube::discovery::ApiResource as KubeApiResource;
use kube::discovery::Discovery as KubeDiscovery;
use kube::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::errors::{ErrorKind, Result};
use crate::types::{GroupVersionKind, Scope};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResourceInfo {
    pub kind: String,
    pub plural: String,
    pub namespaced: bool,
    #[serde(default)]
    pub categories: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupVersionResources {
    pub group_version: String,
    pub resources: Vec<ApiResourceInfo>,
}

/// Adapter over a live cluster's discovery surface (spec §4.2 contract).
pub struct DiscoveryAdapter {
    client: Client,
    base_url: Url,
}

impl DiscoveryAdapter {
    pub fn new(client: Client, base_url: Url) -> Self {
        Self { client, base_url }
    }

    /// `PreferredResources() -> [{GroupVersion, [APIResource]}]`.
    pub async fn preferred_resources(&self) -> Result<Vec<GroupVersionResources>> {
        let discovery = KubeDiscovery::new(self.client.clone())
            .run()
            .await
            .map_err(|e| ErrorKind::DiscoveryFailed(format!("GetServerPreferred: {e}")).into_gateway())?;

        let mut out = Vec::new();
        for group in discovery.groups() {
            let version = group.preferred_version_or_latest().to_string();
            let group_version = if group.name().is_empty() {
                version.clone()
            } else {
                format!("{}/{}", group.name(), version)
            };
            let resources: Vec<ApiResourceInfo> = group
                .versioned_resources(&version)
                .into_iter()
                .map(|(api_resource, capabilities)| ApiResourceInfo {
                    kind: api_resource.kind.clone(),
                    plural: api_resource.plural.clone(),
                    namespaced: capabilities.scope == kube::discovery::Scope::Namespaced,
                    categories: Vec::new(),
                })
                .collect();
            out.push(GroupVersionResources {
                group_version,
                resources,
            });
        }
        Ok(out)
    }

    /// `OpenAPIV3Paths() -> map[path]document`. The Kubernetes API server
    /// exposes an index at `/openapi/v3` mapping relative paths to a
    /// `serverRelativeURL`; each of those paths serves the OpenAPI v3
    /// document for one API group/version.
    pub async fn openapi_v3_paths(&self) -> Result<Vec<String>> {
        let index: Value = self
            .get_json("/openapi/v3")
            .await
            .map_err(|e| ErrorKind::DiscoveryFailed(format!("fetching /openapi/v3 index: {e}")).into_gateway())?;
        let paths = index
            .get("paths")
            .and_then(Value::as_object)
            .map(|obj| obj.keys().cloned().collect())
            .unwrap_or_default();
        Ok(paths)
    }

    /// Fetches and JSON-decodes the OpenAPI v3 document for one discovery
    /// path (spec §4.3 step 1, "Fetch-and-filter").
    pub async fn fetch_schema_for_path(&self, path: &str) -> Result<Value> {
        let full_path = format!("/openapi/v3/{}", path.trim_start_matches('/'));
        self.get_json(&full_path)
            .await
            .map_err(|e| ErrorKind::DiscoveryFailed(format!("UnmarshalSchemaForPath {path}: {e}")).into_gateway())
    }

    /// `RESTMapping(GVK) -> Scope`.
    pub async fn rest_mapping(&self, gvk: &GroupVersionKind) -> Result<Scope> {
        let discovery = KubeDiscovery::new(self.client.clone())
            .run()
            .await
            .map_err(|e| ErrorKind::DiscoveryFailed(format!("GetServerPreferred: {e}")).into_gateway())?;
        for group in discovery.groups() {
            if group.name() != gvk.group {
                continue;
            }
            for (api_resource, capabilities) in group.versioned_resources(&gvk.version) {
                if api_resource.kind == gvk.kind {
                    return Ok(if capabilities.scope == kube::discovery::Scope::Namespaced {
                        Scope::Namespaced
                    } else {
                        Scope::Cluster
                    });
                }
            }
        }
        Err(ErrorKind::DiscoveryFailed(format!("GVKNotPreferred: {gvk:?}")).into_gateway())
    }

    /// Lists every served version of every `CustomResourceDefinition` and
    /// returns its `spec.names.categories` keyed by GVK (spec §4.3 step 3a).
    /// This is the only real caller of that step: `preferred_resources()`
    /// (step 3b) never carries categories, since discovery's own resource
    /// list doesn't expose `spec.names.categories`.
    pub async fn crd_categories(&self) -> Result<Vec<(GroupVersionKind, Vec<String>)>> {
        let resource = KubeApiResource {
            group: "apiextensions.k8s.io".to_string(),
            version: "v1".to_string(),
            api_version: "apiextensions.k8s.io/v1".to_string(),
            kind: "CustomResourceDefinition".to_string(),
            plural: "customresourcedefinitions".to_string(),
            namespaced: false,
            verbs: vec![],
            shortnames: vec![],
            subresources: vec![],
        };
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &resource);
        let list = api
            .list(&Default::default())
            .await
            .map_err(|e| ErrorKind::DiscoveryFailed(format!("listing CustomResourceDefinitions: {e}")).into_gateway())?;

        let mut out = Vec::new();
        for crd in list.items {
            let Some(spec) = crd.data.get("spec") else { continue };
            let group = spec.get("group").and_then(Value::as_str).unwrap_or_default().to_string();
            let names = spec.get("names");
            let kind = names.and_then(|n| n.get("kind")).and_then(Value::as_str).unwrap_or_default().to_string();
            let categories: Vec<String> = names
                .and_then(|n| n.get("categories"))
                .and_then(Value::as_array)
                .map(|arr| arr.iter().filter_map(Value::as_str).map(str::to_string).collect())
                .unwrap_or_default();
            if kind.is_empty() || categories.is_empty() {
                continue;
            }
            let versions = spec.get("versions").and_then(Value::as_array).cloned().unwrap_or_default();
            for version_entry in versions {
                let served = version_entry.get("served").and_then(Value::as_bool).unwrap_or(false);
                let Some(version) = version_entry.get("name").and_then(Value::as_str) else {
                    continue;
                };
                if !served {
                    continue;
                }
                out.push((GroupVersionKind::new(group.clone(), version.to_string(), kind.clone()), categories.clone()));
            }
        }
        Ok(out)
    }

    async fn get_json(&self, path: &str) -> Result<Value> {
        let url = combine_base_url_and_path(&self.base_url, path)?;
        let req = http::Request::get(url.as_str())
            .body(Vec::new())
            .map_err(|e| ErrorKind::InvalidUrl(e.to_string()).into_gateway())?;
        let value: Value = self.client.request(req).await?;
        Ok(value)
    }
}

/// Pure function (spec §4.2): `B.scheme`/`B.host` + `P.path` (prefixed with
/// `/` if relative); an empty `P` yields `B + "/"`.
pub fn combine_base_url_and_path(base: &Url, path: &str) -> Result<Url> {
    let mut result = base.clone();
    result.set_query(None);
    result.set_fragment(None);

    let path_str = if path.is_empty() {
        "/".to_string()
    } else if let Ok(parsed) = Url::parse(path) {
        let p = parsed.path();
        if p.starts_with('/') {
            p.to_string()
        } else {
            format!("/{p}")
        }
    } else if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    };
    result.set_path(&path_str);
    Ok(result)
}

pub fn combine_base_url_and_path_str(base: &str, path: &str) -> Result<Url> {
    let base_url = Url::parse(base).map_err(|e| ErrorKind::InvalidUrl(e.to_string()).into_gateway())?;
    combine_base_url_and_path(&base_url, path)
}

/// Substitutes `/clusters/{clusterName}` (or a KCP virtual-workspace prefix)
/// into a configured base URL, per spec §4.2.
pub fn cluster_scoped_base_url(base: &Url, clusters_segment_prefix: &str, cluster_name: &str) -> Result<Url> {
    let mut url = base.clone();
    let path = format!(
        "{}/{}",
        clusters_segment_prefix.trim_end_matches('/'),
        cluster_name
    );
    url.set_path(&path);
    Ok(url)
}

pub type OpenApiV3Paths = HashMap<String, Value>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_path_yields_base_plus_slash() {
        let base = Url::parse("https://api.example.com:6443").unwrap();
        let combined = combine_base_url_and_path(&base, "").unwrap();
        assert_eq!(combined.as_str(), "https://api.example.com:6443/");
    }

    #[test]
    fn relative_path_is_prefixed_with_slash() {
        let base = Url::parse("https://api.example.com").unwrap();
        let combined = combine_base_url_and_path(&base, "apis/apps/v1").unwrap();
        assert_eq!(combined.path(), "/apis/apps/v1");
        assert_eq!(combined.host_str(), Some("api.example.com"));
    }

    #[test]
    fn absolute_path_keeps_base_scheme_and_host() {
        let base = Url::parse("https://api.example.com").unwrap();
        let combined = combine_base_url_and_path(&base, "https://other.host/apis/apps/v1").unwrap();
        assert_eq!(combined.scheme(), "https");
        assert_eq!(combined.host_str(), Some("api.example.com"));
        assert_eq!(combined.path(), "/apis/apps/v1");
    }

    #[test]
    fn bad_base_url_is_rejected() {
        assert!(combine_base_url_and_path_str("not a url", "").is_err());
    }

    #[test]
    fn cluster_scoped_url_substitutes_segment() {
        let base = Url::parse("https://gateway.example.com").unwrap();
        let url = cluster_scoped_base_url(&base, "/clusters", "root:orgs:acme").unwrap();
        assert_eq!(url.path(), "/clusters/root:orgs:acme");
    }
}
