//! Cluster Registry (C6, spec §4.6): the gateway's live view of every cluster
//! currently published to the catalog. Subscribes to catalog events and keeps
//! a ready-to-serve [`Cluster`] (parsed document, indexed [`SchemaSet`], and
//! built GraphQL [`Schema`]) per cluster name.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_graphql::dynamic::Schema;
use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::catalog::{CatalogEvent, CatalogEventKind};
use crate::errors::Result;
use crate::schema_set::SchemaSet;
use crate::type_generator;
use crate::types::{ClusterAccess, SchemaDocument};

/// One cluster's ready-to-serve state. Rebuilt wholesale on every
/// `Created`/`Updated` catalog event and swapped in atomically; there is no
/// incremental update (spec §4.6 "On a publish event").
pub struct Cluster {
    pub name: String,
    pub access: ClusterAccess,
    pub schema_set: SchemaSet,
    pub gql_schema: Schema,
    pub last_loaded_at: DateTime<Utc>,
}

/// Live map of cluster name to [`Cluster`], fed by the catalog subscriber.
/// Reads (HTTP request routing) and writes (catalog event application) both
/// go through a single `RwLock`; writes are rare (one per publish) and reads
/// are frequent, which is exactly what `RwLock` favors over a mutex.
#[derive(Clone, Default)]
pub struct ClusterRegistry {
    clusters: Arc<RwLock<HashMap<String, Arc<Cluster>>>>,
}

impl ClusterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one catalog event, dispatching to the matching handler.
    pub fn apply(&self, event: CatalogEvent) {
        match event.kind {
            CatalogEventKind::Created | CatalogEventKind::Updated => {
                let Some(bytes) = event.bytes else {
                    warn!("catalog event for {} carried no bytes; ignoring", event.key);
                    return;
                };
                self.on_created_or_updated(&event.key, &bytes);
            }
            CatalogEventKind::Removed => self.on_removed(&event.key),
        }
    }

    /// Parses and rebuilds a cluster's schema and GraphQL schema from the
    /// catalog value. Failure is best-effort (spec §4.6): the previous,
    /// still-serving entry (if any) is left in place, and the failure is
    /// only logged.
    pub fn on_created_or_updated(&self, name: &str, bytes: &[u8]) {
        match build_cluster(name, bytes) {
            Ok(cluster) => {
                self.clusters.write().unwrap().insert(name.to_string(), Arc::new(cluster));
                info!("cluster {name} loaded");
            }
            Err(e) => {
                error!("cluster {name} failed to load, keeping previous entry if any: {e}");
            }
        }
    }

    pub fn on_removed(&self, name: &str) {
        self.clusters.write().unwrap().remove(name);
        info!("cluster {name} removed");
    }

    pub fn route(&self, name: &str) -> Option<Arc<Cluster>> {
        self.clusters.read().unwrap().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.clusters.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.clusters.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn build_cluster(name: &str, bytes: &[u8]) -> Result<Cluster> {
    let document: SchemaDocument = serde_json::from_slice(bytes)?;
    let schema_set = SchemaSet::from_document(&document);
    let gql_schema = type_generator::build_schema(&schema_set)?;
    Ok(Cluster {
        name: name.to_string(),
        access: document.cluster_metadata,
        schema_set,
        gql_schema,
        last_loaded_at: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AuthSpec;

    fn sample_document_bytes() -> Vec<u8> {
        let document = SchemaDocument {
            components: crate::types::Components {
                schemas: serde_json::from_value(serde_json::json!({
                    "core.example.io.v1.Widget": {
                        "x-kubernetes-group-version-kind": [{"group": "example.io", "version": "v1", "kind": "Widget"}],
                        "x-scope": "Namespaced",
                        "x-gateway-plural": "widgets",
                        "properties": { "spec": { "properties": { "replicas": {"type": "integer"} } } }
                    }
                }))
                .unwrap(),
            },
            cluster_metadata: ClusterAccess {
                path: None,
                host: "https://api.example.com".to_string(),
                ca: None,
                auth: Some(AuthSpec::Token { data: "dG9r".to_string() }),
            },
        };
        serde_json::to_vec(&document).unwrap()
    }

    #[test]
    fn created_event_populates_registry() {
        let registry = ClusterRegistry::new();
        registry.apply(CatalogEvent {
            kind: CatalogEventKind::Created,
            key: "kubernetes".to_string(),
            bytes: Some(sample_document_bytes()),
        });
        assert_eq!(registry.names(), vec!["kubernetes".to_string()]);
        assert!(registry.route("kubernetes").is_some());
    }

    #[test]
    fn removed_event_clears_registry() {
        let registry = ClusterRegistry::new();
        registry.apply(CatalogEvent {
            kind: CatalogEventKind::Created,
            key: "kubernetes".to_string(),
            bytes: Some(sample_document_bytes()),
        });
        registry.apply(CatalogEvent {
            kind: CatalogEventKind::Removed,
            key: "kubernetes".to_string(),
            bytes: None,
        });
        assert!(registry.is_empty());
    }

    #[test]
    fn malformed_update_keeps_previous_entry() {
        let registry = ClusterRegistry::new();
        registry.apply(CatalogEvent {
            kind: CatalogEventKind::Created,
            key: "kubernetes".to_string(),
            bytes: Some(sample_document_bytes()),
        });
        registry.apply(CatalogEvent {
            kind: CatalogEventKind::Updated,
            key: "kubernetes".to_string(),
            bytes: Some(b"not json".to_vec()),
        });
        assert!(registry.route("kubernetes").is_some());
    }
}
