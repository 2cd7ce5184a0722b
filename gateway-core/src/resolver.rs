//! Resolver Engine (C8, spec §4.8): executes GraphQL operations against a
//! target cluster, authorizing every verb via a SubjectAccessReview first.

use std::collections::HashMap;

use futures::{Stream, StreamExt};
use k8s_openapi::api::authorization::v1::{ResourceAttributes, SubjectAccessReview, SubjectAccessReviewSpec};
use kube::api::{Api, DynamicObject, ListParams, Patch, PostParams, WatchEvent, WatchParams};
use kube::discovery::ApiResource;
use kube::Client;
use serde_json::Value;

use crate::errors::{ErrorKind, Result};
use crate::types::Scope;

/// Authentication/authorization context carried on the HTTP request (spec
/// §4.8 "Authentication context"). `user` is the configured JWT claim (or the
/// raw token subject when impersonation is off and the claim can't be read);
/// `token` is the bearer token to forward verbatim when not impersonating.
#[derive(Debug, Clone)]
pub struct RequestAuth {
    pub user: String,
    pub token: String,
    pub groups: Vec<String>,
    pub impersonate: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    List,
    Get,
    Create,
    Update,
    Delete,
    Patch,
    Watch,
}

impl Verb {
    fn as_k8s_verb(self) -> &'static str {
        match self {
            Verb::List => "list",
            Verb::Get => "get",
            Verb::Create => "create",
            Verb::Update => "update",
            Verb::Delete => "delete",
            Verb::Patch => "patch",
            Verb::Watch => "watch",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchKind {
    JsonPatch,
    MergePatch,
    StrategicMergePatch,
}

impl PatchKind {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "json-patch" => Ok(Self::JsonPatch),
            "merge-patch" => Ok(Self::MergePatch),
            "strategic-merge-patch" => Ok(Self::StrategicMergePatch),
            other => Err(ErrorKind::InvalidInput(format!("unknown patch type {other}")).into_gateway()),
        }
    }
}

/// Executes verbs against one cluster on behalf of one request's caller.
/// Holds the already-built, request-scoped `kube::Client` (bearer-forwarded
/// or impersonating, per spec §4.8); one is constructed per HTTP request by
/// the caller ([`crate::kube_bootstrap`] + impersonation headers), not owned
/// here, so a single `ResolverEngine` has no long-lived per-caller state.
#[derive(Clone)]
pub struct ResolverEngine {
    client: Client,
}

impl ResolverEngine {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, resource: &ApiResource, scope: Scope, namespace: Option<&str>) -> Api<DynamicObject> {
        match (scope, namespace) {
            (Scope::Namespaced, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, resource),
            _ => Api::all_with(self.client.clone(), resource),
        }
    }

    /// Spec §4.8 "Authorization": issues a SubjectAccessReview for the verb
    /// before any cluster call. `allowed == false` surfaces as
    /// [`ErrorKind::AccessDenied`]; the cluster call must not be issued.
    pub async fn authorize(
        &self,
        verb: Verb,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: Option<&str>,
        auth: &RequestAuth,
    ) -> Result<()> {
        let sar = SubjectAccessReview {
            spec: SubjectAccessReviewSpec {
                resource_attributes: Some(ResourceAttributes {
                    group: Some(resource.group.clone()),
                    version: Some(resource.version.clone()),
                    resource: Some(resource.plural.clone()),
                    namespace: namespace.map(str::to_string),
                    name: name.map(str::to_string),
                    verb: Some(verb.as_k8s_verb().to_string()),
                    ..Default::default()
                }),
                user: Some(auth.user.clone()),
                groups: Some(auth.groups.clone()),
                ..Default::default()
            },
            ..Default::default()
        };
        let api: Api<SubjectAccessReview> = Api::all(self.client.clone());
        let response = api.create(&PostParams::default(), &sar).await?;
        let allowed = response.status.map(|s| s.allowed).unwrap_or(false);
        if !allowed {
            return Err(ErrorKind::AccessDenied.into_gateway());
        }
        Ok(())
    }

    /// **list**: results sorted lexicographically by `metadata.name` (spec
    /// §4.8, §8 invariant); the underlying cache/list call is unordered.
    pub async fn list(
        &self,
        resource: &ApiResource,
        scope: Scope,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<Value>> {
        let mut lp = ListParams::default();
        if let Some(selector) = label_selector {
            lp = lp.labels(selector);
        }
        let api = self.api(resource, scope, namespace);
        let list = api.list(&lp).await?;
        let mut items: Vec<Value> = list
            .items
            .into_iter()
            .map(|obj| serde_json::to_value(obj).unwrap_or(Value::Null))
            .collect();
        items.sort_by(|a, b| name_of(a).cmp(name_of(b)));
        Ok(items)
    }

    /// **get**: a missing object is a normal error, not a 5xx (spec §4.8).
    pub async fn get(&self, resource: &ApiResource, scope: Scope, namespace: Option<&str>, name: &str) -> Result<Value> {
        let api = self.api(resource, scope, namespace);
        let obj = api.get(name).await.map_err(|e| {
            if matches!(&e, kube::Error::Api(resp) if resp.code == 404) {
                ErrorKind::NotFound(name.to_string()).into_gateway()
            } else {
                e.into()
            }
        })?;
        Ok(serde_json::to_value(obj).unwrap_or(Value::Null))
    }

    /// **create**: exactly one of `metadata.name`/`metadata.generateName`
    /// must be set (spec §4.8); the `spec` input is placed at `.spec` of an
    /// unstructured object tagged with the resource's GVK.
    pub async fn create(
        &self,
        resource: &ApiResource,
        scope: Scope,
        namespace: Option<&str>,
        metadata: Value,
        spec: Value,
    ) -> Result<Value> {
        let has_name = metadata.get("name").and_then(Value::as_str).is_some_and(|s| !s.is_empty());
        let has_generate_name = metadata
            .get("generateName")
            .and_then(Value::as_str)
            .is_some_and(|s| !s.is_empty());
        if has_name == has_generate_name {
            return Err(ErrorKind::InvalidInput(
                "exactly one of metadata.name or metadata.generateName must be set".to_string(),
            )
            .into_gateway());
        }
        let mut object = serde_json::json!({
            "apiVersion": resource.api_version,
            "kind": resource.kind,
            "metadata": metadata,
            "spec": spec,
        });
        let dynamic_object: DynamicObject = serde_json::from_value(object.take())?;
        let api = self.api(resource, scope, namespace);
        let created = api.create(&PostParams::default(), &dynamic_object).await?;
        Ok(serde_json::to_value(created).unwrap_or(Value::Null))
    }

    /// **update**: read-then-write, full object (spec §4.8). Conflicts
    /// surface through `kube::Error` and are not special-cased here; the
    /// caller maps them to `Conflict` at the GraphQL boundary.
    pub async fn update(
        &self,
        resource: &ApiResource,
        scope: Scope,
        namespace: Option<&str>,
        name: &str,
        metadata: Value,
        spec: Value,
    ) -> Result<Value> {
        let api = self.api(resource, scope, namespace);
        let mut current: Value = serde_json::to_value(api.get(name).await?).unwrap_or(Value::Null);
        if let Value::Object(ref mut obj) = current {
            obj.insert("spec".to_string(), spec);
            if let Value::Object(meta) = metadata {
                let entry = obj.entry("metadata").or_insert_with(|| Value::Object(Default::default()));
                if let Value::Object(existing) = entry {
                    for (k, v) in meta {
                        existing.insert(k, v);
                    }
                }
            }
        }
        let dynamic_object: DynamicObject = serde_json::from_value(current)?;
        let updated = api.replace(name, &PostParams::default(), &dynamic_object).await?;
        Ok(serde_json::to_value(updated).unwrap_or(Value::Null))
    }

    /// **delete**: `true` on success; a missing object is `false` with
    /// `NotFound` (spec §4.8).
    pub async fn delete(&self, resource: &ApiResource, scope: Scope, namespace: Option<&str>, name: &str) -> Result<bool> {
        let api = self.api(resource, scope, namespace);
        match api.delete(name, &Default::default()).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(resp)) if resp.code == 404 => {
                Err(ErrorKind::NotFound(name.to_string()).into_gateway())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// **patch**: exactly one of `json-patch`/`merge-patch`/`strategic-merge-patch`;
    /// `payload` is the raw patch bytes (spec §4.8).
    pub async fn patch(
        &self,
        resource: &ApiResource,
        scope: Scope,
        namespace: Option<&str>,
        name: &str,
        kind: PatchKind,
        payload: &[u8],
    ) -> Result<Value> {
        let api = self.api(resource, scope, namespace);
        let patch: Patch<Value> = match kind {
            PatchKind::JsonPatch => {
                let ops: json_patch::Patch = serde_json::from_slice(payload)?;
                Patch::Json(ops)
            }
            PatchKind::MergePatch => Patch::Merge(serde_json::from_slice::<Value>(payload)?),
            PatchKind::StrategicMergePatch => Patch::Strategic(serde_json::from_slice::<Value>(payload)?),
        };
        let patched = api.patch(name, &Default::default(), &patch).await?;
        Ok(serde_json::to_value(patched).unwrap_or(Value::Null))
    }

    /// Establishes a raw watch for a single object (spec §4.8
    /// "Subscriptions"). Bookmark events are filtered upstream of emission by
    /// the caller (the spec treats `Bookmark` as silently-ignored, not
    /// `Removed`-from-set nor an emission trigger).
    pub fn watch_single(
        &self,
        resource: &ApiResource,
        scope: Scope,
        namespace: Option<&str>,
        name: &str,
    ) -> impl Stream<Item = Result<WatchEvent<DynamicObject>>> {
        let api = self.api(resource, scope, namespace);
        let field_selector = format!("metadata.name={name}");
        let wp = WatchParams::default().fields(&field_selector);
        async_stream_watch(api, wp)
    }

    pub fn watch_list(
        &self,
        resource: &ApiResource,
        scope: Scope,
        namespace: Option<&str>,
    ) -> impl Stream<Item = Result<WatchEvent<DynamicObject>>> {
        let api = self.api(resource, scope, namespace);
        async_stream_watch(api, WatchParams::default())
    }
}

fn async_stream_watch(
    api: Api<DynamicObject>,
    wp: WatchParams,
) -> impl Stream<Item = Result<WatchEvent<DynamicObject>>> {
    futures::stream::once(async move { api.watch(&wp, "0").await })
        .flat_map(|res| match res {
            Ok(stream) => stream.map(|ev| ev.map_err(Into::into)).left_stream(),
            Err(e) => futures::stream::once(async move { Err(e.into()) }).right_stream(),
        })
}

fn name_of(value: &Value) -> &str {
    value
        .get("metadata")
        .and_then(|m| m.get("name"))
        .and_then(Value::as_str)
        .unwrap_or("")
}

/// Maintains a live set for `subscribeList<Plural>` (spec §4.8): Added
/// appends, Modified replaces, Deleted removes; emission is the entire set.
#[derive(Debug, Default)]
pub struct LiveSet {
    by_name: HashMap<String, Value>,
}

impl LiveSet {
    pub fn apply(&mut self, event: &WatchEvent<DynamicObject>) -> Option<Vec<Value>> {
        match event {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) => {
                let name = obj.metadata.name.clone()?;
                let value = serde_json::to_value(obj.clone()).ok()?;
                self.by_name.insert(name, value);
                Some(self.snapshot())
            }
            WatchEvent::Deleted(obj) => {
                let name = obj.metadata.name.clone()?;
                self.by_name.remove(&name);
                Some(self.snapshot())
            }
            WatchEvent::Bookmark(_) => None,
            WatchEvent::Error(_) => None,
        }
    }

    fn snapshot(&self) -> Vec<Value> {
        let mut items: Vec<Value> = self.by_name.values().cloned().collect();
        items.sort_by(|a, b| name_of(a).cmp(name_of(b)));
        items
    }
}

/// Field-change filter for `emitOnlyFieldChanges=true` (spec §4.8): compares
/// only the selected nested dot-paths between the old and new object by deep
/// equality; emits only if any selected path differs. An empty `old` (first
/// observation) always emits.
pub fn selected_fields_changed(old: Option<&Value>, new: &Value, selected_paths: &[Vec<String>]) -> bool {
    let Some(old) = old else { return true };
    if selected_paths.is_empty() {
        return old != new;
    }
    selected_paths.iter().any(|path| value_at_path(old, path) != value_at_path(new, path))
}

fn value_at_path<'a>(value: &'a Value, path: &[String]) -> Option<&'a Value> {
    let mut current = value;
    for segment in path {
        current = current.get(segment)?;
    }
    Some(current)
}

/// Converts a single watch `Added`/`Modified`/`Deleted` event into the
/// object it should emit for `subscribe<Kind>` (singleton subscriptions
/// don't maintain a set; a `Deleted` event still emits the final state once).
pub fn single_subscription_payload(event: &WatchEvent<DynamicObject>) -> Option<Value> {
    match event {
        WatchEvent::Added(obj) | WatchEvent::Modified(obj) | WatchEvent::Deleted(obj) => {
            serde_json::to_value(obj).ok()
        }
        WatchEvent::Bookmark(_) | WatchEvent::Error(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selected_fields_changed_detects_diff_only_in_selected_path() {
        let old = serde_json::json!({"status": {"phase": "Pending"}, "spec": {"replicas": 1}});
        let new_same_spec = serde_json::json!({"status": {"phase": "Running"}, "spec": {"replicas": 1}});
        let new_changed_spec = serde_json::json!({"status": {"phase": "Running"}, "spec": {"replicas": 2}});
        let path = vec![vec!["spec".to_string(), "replicas".to_string()]];

        assert!(!selected_fields_changed(Some(&old), &new_same_spec, &path));
        assert!(selected_fields_changed(Some(&old), &new_changed_spec, &path));
    }

    #[test]
    fn selected_fields_changed_always_true_without_prior_state() {
        let new = serde_json::json!({"spec": {"replicas": 1}});
        assert!(selected_fields_changed(None, &new, &[vec!["spec".to_string()]]));
    }

    #[test]
    fn live_set_tracks_added_modified_deleted() {
        use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

        fn obj(name: &str) -> DynamicObject {
            DynamicObject {
                types: None,
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    ..Default::default()
                },
                data: Value::Null,
            }
        }

        let mut set = LiveSet::default();
        let snapshot = set.apply(&WatchEvent::Added(obj("a"))).unwrap();
        assert_eq!(snapshot.len(), 1);
        let snapshot = set.apply(&WatchEvent::Added(obj("b"))).unwrap();
        assert_eq!(snapshot.len(), 2);
        let snapshot = set.apply(&WatchEvent::Deleted(obj("a"))).unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(name_of(&snapshot[0]), "b");
    }

    #[test]
    fn patch_kind_parses_the_three_documented_types() {
        assert_eq!(PatchKind::parse("json-patch").unwrap(), PatchKind::JsonPatch);
        assert_eq!(PatchKind::parse("merge-patch").unwrap(), PatchKind::MergePatch);
        assert_eq!(
            PatchKind::parse("strategic-merge-patch").unwrap(),
            PatchKind::StrategicMergePatch
        );
        assert!(PatchKind::parse("bogus").is_err());
    }
}
