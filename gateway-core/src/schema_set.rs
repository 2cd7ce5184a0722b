//! In-memory runtime view of a stored schema document (spec §3 "SchemaSet").

use std::collections::HashMap;

use crate::types::{entry_gvk, GroupVersionKind, SchemaDocument};

/// Index over one cluster's schema document: by schema key, by lowercased
/// `Kind`, and by exact GVK. Only GVK-bearing entries (top-level kinds)
/// participate in kind/GVK lookup; sub-schemas reachable only via `$ref`
/// live in `by_key` alone (spec §3 invariant).
#[derive(Debug, Clone, Default)]
pub struct SchemaSet {
    by_key: HashMap<String, serde_json::Value>,
    by_kind: HashMap<String, Vec<String>>,
    by_gvk: HashMap<GroupVersionKind, String>,
}

impl SchemaSet {
    pub fn from_document(document: &SchemaDocument) -> Self {
        let mut set = Self::default();
        for (key, entry) in &document.components.schemas {
            set.by_key.insert(key.clone(), entry.clone());
            if let Some(gvk) = entry_gvk(entry) {
                set.by_kind
                    .entry(gvk.kind.to_ascii_lowercase())
                    .or_default()
                    .push(key.clone());
                set.by_gvk.insert(gvk, key.clone());
            }
        }
        set
    }

    pub fn get_by_key(&self, key: &str) -> Option<&serde_json::Value> {
        self.by_key.get(key)
    }

    /// Spec §9 open question: `FindByKind` lowercases its input and returns
    /// all matches across groups; the caller disambiguates by group.
    pub fn find_by_kind(&self, kind: &str) -> Vec<(&str, &serde_json::Value)> {
        self.by_kind
            .get(&kind.to_ascii_lowercase())
            .into_iter()
            .flatten()
            .filter_map(|key| self.by_key.get(key.as_str()).map(|entry| (key.as_str(), entry)))
            .collect()
    }

    pub fn get_by_gvk(&self, gvk: &GroupVersionKind) -> Option<(&str, &serde_json::Value)> {
        let key = self.by_gvk.get(gvk)?;
        self.by_key.get(key.as_str()).map(|entry| (key.as_str(), entry))
    }

    /// Every top-level (GVK-bearing) entry, in stable key order.
    pub fn top_level_entries(&self) -> Vec<(&GroupVersionKind, &str, &serde_json::Value)> {
        let mut out: Vec<_> = self
            .by_gvk
            .iter()
            .map(|(gvk, key)| (gvk, key.as_str(), self.by_key.get(key.as_str()).unwrap()))
            .collect();
        out.sort_by(|a, b| a.1.cmp(b.1));
        out
    }

    pub fn is_empty(&self) -> bool {
        self.by_gvk.is_empty()
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AuthSpec, ClusterAccess, Components};

    fn doc(schemas: serde_json::Value) -> SchemaDocument {
        SchemaDocument {
            components: Components {
                schemas: serde_json::from_value(schemas).unwrap(),
            },
            cluster_metadata: ClusterAccess {
                path: None,
                host: "https://api.example.com".to_string(),
                ca: None,
                auth: Some(AuthSpec::Token {
                    data: "dG9r".to_string(),
                }),
            },
        }
    }

    #[test]
    fn indexes_top_level_entries_by_key_kind_and_gvk() {
        let set = SchemaSet::from_document(&doc(serde_json::json!({
            "core.example.io.v1.Widget": {
                "x-kubernetes-group-version-kind": [{"group": "example.io", "version": "v1", "kind": "Widget"}]
            },
            "core.example.io.v1.WidgetSpec": {
                "type": "object"
            }
        })));
        assert_eq!(set.len(), 2);
        assert!(set.get_by_key("core.example.io.v1.WidgetSpec").is_some());
        assert_eq!(set.find_by_kind("widget").len(), 1);
        assert_eq!(set.find_by_kind("Widget").len(), 1);
        let gvk = GroupVersionKind::new("example.io", "v1", "Widget");
        assert!(set.get_by_gvk(&gvk).is_some());
        assert_eq!(set.top_level_entries().len(), 1);
    }

    #[test]
    fn entries_with_non_singleton_gvk_are_not_indexed() {
        let set = SchemaSet::from_document(&doc(serde_json::json!({
            "x": {
                "x-kubernetes-group-version-kind": [
                    {"group": "a", "version": "v1", "kind": "A"},
                    {"group": "b", "version": "v1", "kind": "B"}
                ]
            }
        })));
        assert!(set.top_level_entries().is_empty());
        assert!(set.get_by_key("x").is_some());
    }

    #[test]
    fn kind_collision_across_groups_returns_both() {
        let set = SchemaSet::from_document(&doc(serde_json::json!({
            "a.v1.Thing": {
                "x-kubernetes-group-version-kind": [{"group": "a", "version": "v1", "kind": "Thing"}]
            },
            "b.v1.Thing": {
                "x-kubernetes-group-version-kind": [{"group": "b", "version": "v1", "kind": "Thing"}]
            }
        })));
        assert_eq!(set.find_by_kind("thing").len(), 2);
    }
}
