//! Reconciler (C4): per-cluster, keeps the catalog entry equal to
//! `C3(C2(cluster))`. One reconcile pass is a pure async function over the
//! C1/C2/C3/C5 collaborators so it's testable against an in-memory catalog
//! without a live cluster.

use gateway_core::catalog::CatalogStore;
use gateway_core::discovery::DiscoveryAdapter;
use gateway_core::errors::Result;
use gateway_core::kube_bootstrap::client_for_access;
use gateway_core::schema_builder::SchemaBuilder;
use gateway_core::types::ClusterAccess;
use tracing::{info, warn};
use url::Url;

/// Resolves the catalog key for a cluster. Standard (non-KCP) mode has no
/// `path`, so the fixed key `"kubernetes"` is used; KCP mode carries the
/// logical cluster path directly on `ClusterAccess.path` rather than
/// requiring a separate `LogicalCluster` annotation lookup, since the access
/// store already produced that value when it resolved the cluster.
pub fn catalog_key_for(cluster_name: &str, access: &ClusterAccess) -> String {
    match &access.path {
        Some(path) if !path.is_empty() => path.clone(),
        _ if cluster_name == "root" => "root".to_string(),
        _ => access.path.clone().unwrap_or_else(|| "kubernetes".to_string()),
    }
}

/// One reconcile pass (spec §4.4 steps 1-5, minus deletion which the caller
/// handles directly against the catalog). Returns `Ok(())` whether or not a
/// publish happened; the no-op case is not distinguished to the caller.
pub async fn reconcile(key: &str, access: &ClusterAccess, allow_insecure: bool, catalog: &dyn CatalogStore) -> Result<()> {
    let client = client_for_access(access, allow_insecure).await?;
    let base_url = Url::parse(&access.host).map_err(|e| gateway_core::errors::ErrorKind::InvalidUrl(e.to_string()).into_gateway())?;
    let adapter = DiscoveryAdapter::new(client, base_url);

    let resources = adapter.preferred_resources().await?;
    let preferred: Vec<String> = resources.iter().map(|r| r.group_version.clone()).collect();

    let mut builder = SchemaBuilder::new(preferred);
    for path in adapter.openapi_v3_paths().await? {
        if !builder.is_path_preferred(&path) {
            continue;
        }
        match adapter.fetch_schema_for_path(&path).await {
            Ok(document) => {
                if let Err(e) = builder.ingest_document(&path, &document) {
                    warn!("{key}: failed to ingest schema for {path}: {e}");
                }
            }
            Err(e) => warn!("{key}: failed to fetch schema for {path}: {e}"),
        }
    }

    builder.annotate_scope(|gvk| adapter.rest_mapping(&gvk)).await;
    match adapter.crd_categories().await {
        Ok(crd_categories) => {
            for (gvk, categories) in &crd_categories {
                builder.annotate_categories_for_crd(gvk, categories);
            }
        }
        Err(e) => warn!("{key}: failed to list CustomResourceDefinitions for category annotation: {e}"),
    }
    builder.annotate_categories_from_resource_list(&resources);
    builder.annotate_plural_from_resource_list(&resources);

    let document = builder.build(access.clone());
    let bytes = serde_json::to_vec(&document)?;

    let unchanged = matches!(catalog.get(key).await, Ok(previous) if previous == bytes);
    if unchanged {
        info!("{key}: schema unchanged, skipping publish");
        return Ok(());
    }
    catalog.put(key, bytes).await?;
    info!("{key}: schema published");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_core::catalog::GrpcCatalogServer;
    use gateway_core::types::AuthSpec;

    #[test]
    fn catalog_key_falls_back_to_kubernetes_without_path() {
        let access = ClusterAccess {
            path: None,
            host: "https://api.example.com".to_string(),
            ca: None,
            auth: None,
        };
        assert_eq!(catalog_key_for("c1", &access), "kubernetes");
    }

    #[test]
    fn catalog_key_uses_logical_path_when_present() {
        let access = ClusterAccess {
            path: Some("root:orgs:acme".to_string()),
            host: "https://api.example.com".to_string(),
            ca: None,
            auth: None,
        };
        assert_eq!(catalog_key_for("acme", &access), "root:orgs:acme");
    }

    #[tokio::test]
    async fn reconcile_publishes_nothing_for_unreachable_cluster() {
        let access = ClusterAccess {
            path: None,
            host: "https://unreachable.invalid:6443".to_string(),
            ca: None,
            auth: Some(AuthSpec::Token {
                data: "dG9r".to_string(),
            }),
        };
        let catalog = GrpcCatalogServer::new();
        let result = reconcile("kubernetes", &access, true, &catalog).await;
        assert!(result.is_err());
    }
}
