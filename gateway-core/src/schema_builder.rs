//! Schema Builder (C3, spec §4.3).

use std::collections::HashSet;

use serde_json::Value;
use tracing::warn;

use crate::discovery::GroupVersionResources;
use crate::errors::{ErrorKind, Result};
use crate::types::{
    entry_gvk, ClusterAccess, Components, GroupVersionKind, Scope, SchemaDocument, SchemaMap, EXT_CATEGORIES,
    EXT_PLURAL, EXT_SCOPE,
};

/// Accumulates merged, annotated schema entries for one cluster across a
/// reconciliation pass, then converts and envelopes them (spec §4.3 steps 4-5).
#[derive(Debug, Default)]
pub struct SchemaBuilder {
    preferred_group_versions: HashSet<String>,
    schemas: SchemaMap,
}

impl SchemaBuilder {
    pub fn new(preferred_group_versions: impl IntoIterator<Item = String>) -> Self {
        Self {
            preferred_group_versions: preferred_group_versions.into_iter().collect(),
            schemas: SchemaMap::new(),
        }
    }

    /// Step 1 (filter half): an OpenAPI discovery path is kept only if the
    /// suffix after its first `/` names a preferred group/version. Paths
    /// with no `/` at all (there shouldn't be any in practice) are dropped.
    pub fn is_path_preferred(&self, path: &str) -> bool {
        match path.split_once('/') {
            Some((_, suffix)) => self.preferred_group_versions.contains(suffix),
            None => false,
        }
    }

    /// Step 1 (fetch half): merge one path's `components.schemas` into the
    /// builder. Later calls win on key collision.
    pub fn ingest_document(&mut self, path: &str, document: &Value) -> Result<()> {
        let schemas = document
            .get("components")
            .and_then(|c| c.get("schemas"))
            .and_then(Value::as_object)
            .ok_or_else(|| {
                ErrorKind::SchemaBuildFailed(format!("{path}: document missing components.schemas")).into_gateway()
            })?;
        for (key, entry) in schemas {
            self.schemas.insert(key.clone(), entry.clone());
        }
        Ok(())
    }

    /// Step 2: annotate `x-scope` for every GVK-bearing entry, via a
    /// caller-supplied REST mapping lookup. Per-entry failures are logged and
    /// skipped — they don't fail the whole pass.
    pub async fn annotate_scope<F, Fut>(&mut self, mut rest_mapping: F)
    where
        F: FnMut(GroupVersionKind) -> Fut,
        Fut: std::future::Future<Output = Result<Scope>>,
    {
        let keys: Vec<String> = self.schemas.keys().cloned().collect();
        for key in keys {
            let Some(gvk) = self.schemas.get(&key).and_then(entry_gvk) else {
                continue;
            };
            match rest_mapping(gvk.clone()).await {
                Ok(scope) => {
                    if let Some(Value::Object(obj)) = self.schemas.get_mut(&key) {
                        let label = match scope {
                            Scope::Namespaced => "Namespaced",
                            Scope::Cluster => "Cluster",
                        };
                        obj.insert(EXT_SCOPE.to_string(), Value::String(label.to_string()));
                    }
                }
                Err(err) => warn!("GVKNotPreferred for {key} ({gvk:?}): {err}"),
            }
        }
    }

    /// Step 3a: annotate `x-categories` for one GVK from a CRD's
    /// `spec.names.categories`.
    pub fn annotate_categories_for_crd(&mut self, gvk: &GroupVersionKind, categories: &[String]) {
        if categories.is_empty() {
            return;
        }
        let key = gvk.schema_key();
        if let Some(Value::Object(obj)) = self.schemas.get_mut(&key) {
            obj.insert(
                EXT_CATEGORIES.to_string(),
                Value::Array(categories.iter().cloned().map(Value::String).collect()),
            );
        }
    }

    /// Step 3b: annotate `x-categories` by walking the preferred resource
    /// list, matching by GVK.
    pub fn annotate_categories_from_resource_list(&mut self, resources: &[GroupVersionResources]) {
        for group_resources in resources {
            let (group, version) = split_group_version(&group_resources.group_version);
            for resource in &group_resources.resources {
                if resource.categories.is_empty() {
                    continue;
                }
                let gvk = GroupVersionKind::new(group.clone(), version.clone(), resource.kind.clone());
                self.annotate_categories_for_crd(&gvk, &resource.categories);
            }
        }
    }

    /// Stamps `x-gateway-plural` for every matched GVK entry, by walking the
    /// preferred resource list the same way step 3b does for categories.
    /// Kept separate from categories since every GVK-bearing entry needs a
    /// plural (C7 needs it to name `list<Plural>`/`subscribeList<Plural>`
    /// fields) while categories are often absent.
    pub fn annotate_plural_from_resource_list(&mut self, resources: &[GroupVersionResources]) {
        for group_resources in resources {
            let (group, version) = split_group_version(&group_resources.group_version);
            for resource in &group_resources.resources {
                let gvk = GroupVersionKind::new(group.clone(), version.clone(), resource.kind.clone());
                let key = gvk.schema_key();
                if let Some(Value::Object(obj)) = self.schemas.get_mut(&key) {
                    obj.insert(EXT_PLURAL.to_string(), Value::String(resource.plural.clone()));
                }
            }
        }
    }

    /// Steps 4-5: convert the accumulated entries to v2 shape and envelope
    /// them with the cluster's connection metadata.
    pub fn build(self, cluster_metadata: ClusterAccess) -> SchemaDocument {
        let envelope = serde_json::json!({
            "components": { "schemas": Value::Object(self.schemas.into_iter().collect()) }
        });
        let converted = convert(&envelope);
        let schemas: SchemaMap = converted
            .get("definitions")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .collect();
        SchemaDocument {
            components: Components { schemas },
            cluster_metadata,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}

fn split_group_version(group_version: &str) -> (String, String) {
    match group_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), group_version.to_string()),
    }
}

/// v3 -> v2 shape conversion (spec §4.3 step 4). Idempotent: running it twice
/// produces the same bytes (spec §8).
///
/// Accepts either an OpenAPI-v3-shaped document (`components.schemas`) or an
/// already-converted one (`definitions`), so `convert(convert(x)) == convert(x)`
/// holds without a special case.
pub fn convert(document: &Value) -> Value {
    let schemas = document
        .get("components")
        .and_then(|c| c.get("schemas"))
        .and_then(Value::as_object)
        .or_else(|| document.get("definitions").and_then(Value::as_object))
        .cloned()
        .unwrap_or_default();

    let converted: serde_json::Map<String, Value> = schemas
        .into_iter()
        .map(|(key, entry)| (key, convert_entry(&entry)))
        .collect();

    serde_json::json!({ "definitions": Value::Object(converted) })
}

fn convert_entry(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (key, val) in map {
                if key == "default" && is_empty_object(val) {
                    continue;
                }
                if key == "allOf" {
                    if let Some(collapsed) = collapse_single_ref_all_of(val) {
                        out.insert("$ref".to_string(), Value::String(collapsed));
                        continue;
                    }
                    out.insert(key.clone(), convert_entry(val));
                    continue;
                }
                if key == "$ref" {
                    if let Value::String(r) = val {
                        out.insert(key.clone(), Value::String(rewrite_ref(r)));
                        continue;
                    }
                }
                out.insert(key.clone(), convert_entry(val));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(convert_entry).collect()),
        other => other.clone(),
    }
}

fn is_empty_object(value: &Value) -> bool {
    matches!(value, Value::Object(obj) if obj.is_empty())
}

/// `allOf: [{ "$ref": R }]` of length exactly 1 collapses to `$ref: R`.
fn collapse_single_ref_all_of(value: &Value) -> Option<String> {
    let arr = value.as_array()?;
    if arr.len() != 1 {
        return None;
    }
    let entry = arr.first()?.as_object()?;
    if entry.len() != 1 {
        return None;
    }
    let r = entry.get("$ref")?.as_str()?;
    Some(rewrite_ref(r))
}

fn rewrite_ref(r: &str) -> String {
    r.replacen("#/components/schemas/", "#/definitions/", 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AuthSpec;

    fn access() -> ClusterAccess {
        ClusterAccess {
            path: None,
            host: "https://api.example.com".to_string(),
            ca: None,
            auth: Some(AuthSpec::Token {
                data: "dG9r".to_string(),
            }),
        }
    }

    #[test]
    fn path_filter_matches_suffix_after_first_slash() {
        let builder = SchemaBuilder::new(["apps/v1".to_string(), "v1".to_string()]);
        assert!(builder.is_path_preferred("apis/apps/v1"));
        assert!(builder.is_path_preferred("api/v1"));
        assert!(!builder.is_path_preferred("apis/batch/v1"));
        assert!(!builder.is_path_preferred("openapi"));
    }

    #[test]
    fn conversion_is_idempotent_and_matches_spec_example() {
        let input = serde_json::json!({
            "components": {
                "schemas": {
                    "X": {
                        "default": {},
                        "allOf": [{ "$ref": "#/components/schemas/Y" }]
                    }
                }
            }
        });
        let once = convert(&input);
        assert_eq!(
            once,
            serde_json::json!({ "definitions": { "X": { "$ref": "#/definitions/Y" } } })
        );
        let twice = convert(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn conversion_preserves_other_keys_and_recurses() {
        let input = serde_json::json!({
            "components": {
                "schemas": {
                    "X": {
                        "type": "object",
                        "properties": {
                            "nested": { "allOf": [{ "$ref": "#/components/schemas/Z" }] }
                        }
                    }
                }
            }
        });
        let out = convert(&input);
        assert_eq!(
            out["definitions"]["X"]["properties"]["nested"]["$ref"],
            "#/definitions/Z"
        );
        assert_eq!(out["definitions"]["X"]["type"], "object");
    }

    #[test]
    fn multi_entry_all_of_is_left_untouched() {
        let input = serde_json::json!({
            "components": {
                "schemas": {
                    "X": {
                        "allOf": [{ "$ref": "#/components/schemas/A" }, { "$ref": "#/components/schemas/B" }]
                    }
                }
            }
        });
        let out = convert(&input);
        assert!(out["definitions"]["X"]["allOf"].is_array());
        assert_eq!(out["definitions"]["X"]["allOf"][0]["$ref"], "#/definitions/A");
    }

    #[test]
    fn build_produces_empty_document_for_empty_builder() {
        let builder = SchemaBuilder::new(Vec::<String>::new());
        assert!(builder.is_empty());
        let doc = builder.build(access());
        assert!(doc.components.schemas.is_empty());
    }

    #[test]
    fn category_annotation_from_resource_list_matches_by_gvk() {
        let mut builder = SchemaBuilder::new(["example.io/v1".to_string()]);
        builder
            .ingest_document(
                "apis/example.io/v1",
                &serde_json::json!({
                    "components": {
                        "schemas": {
                            "io.example.v1.Widget": {
                                "x-kubernetes-group-version-kind": [
                                    { "group": "example.io", "version": "v1", "kind": "Widget" }
                                ]
                            }
                        }
                    }
                }),
            )
            .unwrap();
        builder.annotate_categories_from_resource_list(&[GroupVersionResources {
            group_version: "example.io/v1".to_string(),
            resources: vec![crate::discovery::ApiResourceInfo {
                kind: "Widget".to_string(),
                plural: "widgets".to_string(),
                namespaced: true,
                categories: vec!["all".to_string()],
            }],
        }]);
        let doc = builder.build(access());
        let entry = &doc.components.schemas["io.example.v1.Widget"];
        assert_eq!(entry["x-categories"][0], "all");
    }

    #[test]
    fn key_format_uses_reversed_group() {
        let gvk = GroupVersionKind::new("io.openmfp.core", "v1alpha1", "Account");
        assert_eq!(gvk.schema_key(), "core.openmfp.io.v1alpha1.Account");
    }

    #[test]
    fn plural_annotation_from_resource_list_matches_by_gvk() {
        let mut builder = SchemaBuilder::new(["example.io/v1".to_string()]);
        builder
            .ingest_document(
                "apis/example.io/v1",
                &serde_json::json!({
                    "components": {
                        "schemas": {
                            "io.example.v1.Widget": {
                                "x-kubernetes-group-version-kind": [
                                    { "group": "example.io", "version": "v1", "kind": "Widget" }
                                ]
                            }
                        }
                    }
                }),
            )
            .unwrap();
        builder.annotate_plural_from_resource_list(&[GroupVersionResources {
            group_version: "example.io/v1".to_string(),
            resources: vec![crate::discovery::ApiResourceInfo {
                kind: "Widget".to_string(),
                plural: "widgets".to_string(),
                namespaced: true,
                categories: vec![],
            }],
        }]);
        let doc = builder.build(access());
        let entry = &doc.components.schemas["io.example.v1.Widget"];
        assert_eq!(entry["x-gateway-plural"], "widgets");
    }

    #[test]
    fn key_format_core_group_has_no_leading_dot() {
        let gvk = GroupVersionKind::new("", "v1", "Pod");
        assert_eq!(gvk.schema_key(), "v1.Pod");
    }
}
