//! GraphQL Type Generator (C7, spec §4.7). Turns a [`SchemaSet`] into a
//! dynamic `async-graphql` schema: one object/input type pair per GVK-bearing
//! entry, plus list/get/create/update/delete/patch/subscribe fields.
//!
//! Grounded on the dynamic-schema pattern in
//! `other_examples/a6bd2f35_p2panda-aquadoggo__...dynamic_graphql-schema.rs`
//! (the only schema-from-runtime-data GraphQL builder in the retrieval pack):
//! `Schema::build`, `Object`/`InputObject`, `Field`/`FieldFuture`, `TypeRef`.

use std::collections::HashSet;
use std::sync::Arc;

use async_graphql::dynamic::{
    Enum, Field, FieldFuture, FieldValue, InputObject, InputValue, Object, Scalar, Schema, SchemaBuilder,
    Subscription, SubscriptionField, SubscriptionFieldFuture, TypeRef,
};
use async_graphql::{SelectionField, Value as GqlValue};
use futures::StreamExt;
use kube::discovery::ApiResource as KubeApiResource;
use serde_json::Value;
use tracing::warn;

use crate::errors::{ErrorKind, Result};
use crate::resolver::{selected_fields_changed, single_subscription_payload, LiveSet, PatchKind, RequestAuth, ResolverEngine, Verb};
use crate::schema_set::SchemaSet;
use crate::types::{entry_categories, entry_gvk, entry_plural, entry_scope, GroupVersionKind, Scope};

const METADATA_TYPE: &str = "Metadata";
const METADATA_INPUT_TYPE: &str = "MetadataInput";
const STRING_MAP_SCALAR: &str = "StringMap";
const PATCH_TYPE_ENUM: &str = "PatchType";

/// Static per-kind facts the generator needs beyond the schema tree itself:
/// the REST resource (for cluster calls) and scope (for argument shape).
#[derive(Debug, Clone)]
struct ResourceFacts {
    gvk: GroupVersionKind,
    api_resource: KubeApiResource,
    scope: Scope,
}

/// Builds the dynamic GraphQL schema for one cluster's [`SchemaSet`]. The
/// returned `Schema` is stateless beyond the generated types/resolvers; the
/// per-request [`ResolverEngine`] and [`RequestAuth`] are injected as
/// execution-time `Request` data by the HTTP layer (C9), not baked in here,
/// since they vary with the caller's identity and impersonation settings.
pub fn build_schema(schema_set: &SchemaSet) -> Result<Schema> {
    let mut objects: Vec<Object> = Vec::new();
    let mut inputs: Vec<InputObject> = Vec::new();
    let mut scalars: Vec<Scalar> = Vec::new();
    let mut enums: Vec<Enum> = Vec::new();
    let mut visited: HashSet<String> = HashSet::new();

    scalars.push(Scalar::new(STRING_MAP_SCALAR));
    enums.push(
        Enum::new(PATCH_TYPE_ENUM)
            .item("JSON_PATCH")
            .item("MERGE_PATCH")
            .item("STRATEGIC_MERGE_PATCH"),
    );
    objects.push(metadata_object());
    inputs.push(metadata_input());

    let mut query = Object::new("Query");
    let mut mutation = Object::new("Mutation");
    let mut subscription = Subscription::new("Subscription");

    for (gvk, key, entry) in schema_set.top_level_entries() {
        let scope = entry_scope(entry).unwrap_or_else(|| {
            warn!("schema entry {key} has a GVK but no x-scope; defaulting to Namespaced");
            Scope::Namespaced
        });
        (query, mutation, subscription) =
            generate_kind(gvk, key, entry, scope, schema_set, &mut objects, &mut inputs, &mut visited, query, mutation, subscription);
    }

    let mut builder: SchemaBuilder = Schema::build("Query", Some("Mutation"), Some("Subscription"));
    builder = builder.register(query).register(mutation).register(subscription);
    for object in objects {
        builder = builder.register(object);
    }
    for input in inputs {
        builder = builder.register(input);
    }
    for scalar in scalars {
        builder = builder.register(scalar);
    }
    for e in enums {
        builder = builder.register(e);
    }
    builder
        .finish()
        .map_err(|e| ErrorKind::SchemaBuildFailed(format!("assembling GraphQL schema: {e}")).into_gateway())
}

#[allow(clippy::too_many_arguments)]
fn generate_kind(
    gvk: &GroupVersionKind,
    key: &str,
    entry: &Value,
    scope: Scope,
    schema_set: &SchemaSet,
    objects: &mut Vec<Object>,
    inputs: &mut Vec<InputObject>,
    visited: &mut HashSet<String>,
    query: Object,
    mutation: Object,
    subscription: Subscription,
) -> (Object, Object, Subscription) {
    let kind = gvk.kind.clone();
    let plural = entry_plural(entry).unwrap_or_else(|| default_plural(&kind));
    let api_version = gvk.group_version();
    let api_resource = KubeApiResource {
        group: gvk.group.clone(),
        version: gvk.version.clone(),
        api_version,
        kind: kind.clone(),
        plural: plural.clone(),
        namespaced: scope == Scope::Namespaced,
        verbs: vec![],
        shortnames: vec![],
        subresources: vec![],
    };
    let facts = ResourceFacts {
        gvk: gvk.clone(),
        api_resource,
        scope,
    };

    let Some(spec_properties) = entry
        .get("properties")
        .and_then(|p| p.get("spec"))
        .and_then(|s| s.get("properties"))
        .and_then(Value::as_object)
    else {
        warn!("schema entry {key} ({kind}) has no spec.properties; skipping type generation for it");
        return (query, mutation, subscription);
    };
    let required = entry
        .get("properties")
        .and_then(|p| p.get("spec"))
        .and_then(|s| s.get("required"))
        .and_then(Value::as_array)
        .map(|arr| arr.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_else(HashSet::new);

    let spec_type_name = format!("{kind}Spec");
    let spec_input_name = format!("{spec_type_name}Input");
    let has_spec = resolve_object_type(&spec_type_name, spec_properties, &required, schema_set, objects, visited);
    resolve_input_type(&spec_input_name, spec_properties, &required, schema_set, inputs, visited);

    let kind_object = build_kind_object(&kind, has_spec.then_some(spec_type_name.as_str()), &entry_categories(entry));
    objects.push(kind_object);

    let query = add_query_fields(query, &facts, &plural);
    let mutation = add_mutation_fields(mutation, &facts, has_spec.then_some(spec_input_name.as_str()));
    let subscription = add_subscription_fields(subscription, &facts, &plural);
    (query, mutation, subscription)
}

fn build_kind_object(kind: &str, spec_type: Option<&str>, categories: &[String]) -> Object {
    let mut object = Object::new(kind).field(Field::new(
        "metadata",
        TypeRef::named_nn(METADATA_TYPE),
        move |ctx| {
            FieldFuture::new(async move {
                let parent = downcast_json(&ctx)?;
                Ok(Some(FieldValue::owned_any(parent.clone())))
            })
        },
    ));
    if let Some(spec_type) = spec_type {
        let spec_type_owned = spec_type.to_string();
        object = object.field(Field::new("spec", TypeRef::named(spec_type_owned), move |ctx| {
            FieldFuture::new(async move {
                let parent = downcast_json(&ctx)?;
                let spec = parent.get("spec").cloned().unwrap_or(Value::Null);
                Ok(Some(FieldValue::owned_any(spec)))
            })
        }));
    }
    if !categories.is_empty() {
        object = object.description(format!("categories: {}", categories.join(", ")));
    }
    object
}

fn metadata_object() -> Object {
    Object::new(METADATA_TYPE)
        .field(Field::new("name", TypeRef::named(TypeRef::STRING), |ctx| {
            FieldFuture::new(async move { string_field(&ctx, "name") })
        }))
        .field(Field::new("namespace", TypeRef::named(TypeRef::STRING), |ctx| {
            FieldFuture::new(async move { string_field(&ctx, "namespace") })
        }))
        .field(Field::new("labels", TypeRef::named(STRING_MAP_SCALAR), |ctx| {
            FieldFuture::new(async move { string_map_field(&ctx, "labels") })
        }))
        .field(Field::new("annotations", TypeRef::named(STRING_MAP_SCALAR), |ctx| {
            FieldFuture::new(async move { string_map_field(&ctx, "annotations") })
        }))
}

fn metadata_input() -> InputObject {
    InputObject::new(METADATA_INPUT_TYPE)
        .field(InputValue::new("name", TypeRef::named(TypeRef::STRING)))
        .field(InputValue::new("generateName", TypeRef::named(TypeRef::STRING)))
        .field(InputValue::new("namespace", TypeRef::named(TypeRef::STRING)))
        .field(InputValue::new("labels", TypeRef::named(STRING_MAP_SCALAR)))
        .field(InputValue::new("annotations", TypeRef::named(STRING_MAP_SCALAR)))
}

fn string_field(ctx: &async_graphql::dynamic::ResolverContext<'_>, key: &str) -> async_graphql::Result<Option<FieldValue<'static>>> {
    let parent = downcast_json(ctx)?;
    let value = parent.get("metadata").and_then(|m| m.get(key)).and_then(Value::as_str);
    Ok(value.map(|s| FieldValue::value(GqlValue::String(s.to_string()))))
}

fn string_map_field(ctx: &async_graphql::dynamic::ResolverContext<'_>, key: &str) -> async_graphql::Result<Option<FieldValue<'static>>> {
    let parent = downcast_json(ctx)?;
    let value = parent.get("metadata").and_then(|m| m.get(key)).cloned().unwrap_or(Value::Null);
    if value.is_null() {
        return Ok(None);
    }
    Ok(Some(FieldValue::owned_any(value)))
}

fn downcast_json<'a>(ctx: &'a async_graphql::dynamic::ResolverContext<'_>) -> async_graphql::Result<&'a Value> {
    ctx.parent_value
        .try_downcast_ref::<Value>()
        .map_err(|_| async_graphql::Error::new("internal: expected JSON value as parent"))
}

/// Recursively builds (and registers into `objects`) an output object type
/// from a JSON-Schema `properties` map. Returns `false` (and registers
/// nothing) if every field was elided, per spec §4.7 "sub-types with empty
/// field maps are elided".
fn resolve_object_type(
    type_name: &str,
    properties: &serde_json::Map<String, Value>,
    required: &HashSet<String>,
    schema_set: &SchemaSet,
    objects: &mut Vec<Object>,
    visited: &mut HashSet<String>,
) -> bool {
    if visited.contains(type_name) {
        return true;
    }
    visited.insert(type_name.to_string());

    let mut object = Object::new(type_name);
    let mut any_field = false;
    for (key, prop) in properties {
        if let Some((type_ref, kind)) = resolve_field_type(type_name, key, prop, schema_set, objects, visited, required.contains(key)) {
            object = object.field(build_output_field(key, type_ref, kind));
            any_field = true;
        }
    }
    if !any_field {
        return false;
    }
    objects.push(object);
    true
}

fn resolve_input_type(
    type_name: &str,
    properties: &serde_json::Map<String, Value>,
    required: &HashSet<String>,
    schema_set: &SchemaSet,
    inputs: &mut Vec<InputObject>,
    visited: &mut HashSet<String>,
) -> bool {
    let marker = format!("{type_name}#input");
    if visited.contains(&marker) {
        return true;
    }
    visited.insert(marker);

    let mut input = InputObject::new(type_name);
    let mut any_field = false;
    for (key, prop) in properties {
        if let Some(type_ref) = resolve_input_field_type(type_name, key, prop, required.contains(key), schema_set, inputs, visited) {
            input = input.field(InputValue::new(sanitize_field_name(key), type_ref));
            any_field = true;
        }
    }
    if !any_field {
        return false;
    }
    inputs.push(input);
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldKind {
    Scalar,
    ScalarList,
    Object,
    ObjectList,
}

fn resolve_field_type(
    parent_name: &str,
    key: &str,
    prop: &Value,
    schema_set: &SchemaSet,
    objects: &mut Vec<Object>,
    visited: &mut HashSet<String>,
    required: bool,
) -> Option<(TypeRef, FieldKind)> {
    let prop = resolve_ref(prop, schema_set);
    match prop.get("type").and_then(Value::as_str) {
        Some("string") => Some((named(TypeRef::STRING, required), FieldKind::Scalar)),
        Some("boolean") => Some((named(TypeRef::BOOLEAN, required), FieldKind::Scalar)),
        Some("integer") => Some((named(TypeRef::INT, required), FieldKind::Scalar)),
        Some("number") => Some((named(TypeRef::FLOAT, required), FieldKind::Scalar)),
        Some("array") => {
            let items = prop.get("items")?;
            let items = resolve_ref(items, schema_set);
            match items.get("type").and_then(Value::as_str) {
                Some("object") => {
                    let item_properties = items.get("properties").and_then(Value::as_object)?;
                    let item_type_name = format!("{parent_name}{}Item", capitalize(key));
                    let built = resolve_object_type(&item_type_name, item_properties, &HashSet::new(), schema_set, objects, visited);
                    if !built {
                        return None;
                    }
                    Some((TypeRef::named_list(item_type_name), FieldKind::ObjectList))
                }
                Some("string") => Some((TypeRef::named_list(TypeRef::STRING), FieldKind::ScalarList)),
                Some("boolean") => Some((TypeRef::named_list(TypeRef::BOOLEAN), FieldKind::ScalarList)),
                Some("integer") => Some((TypeRef::named_list(TypeRef::INT), FieldKind::ScalarList)),
                Some("number") => Some((TypeRef::named_list(TypeRef::FLOAT), FieldKind::ScalarList)),
                _ => None,
            }
        }
        Some("object") | None => {
            let properties = prop.get("properties").and_then(Value::as_object)?;
            let nested_name = format!("{parent_name}{}", capitalize(key));
            let built = resolve_object_type(&nested_name, properties, &HashSet::new(), schema_set, objects, visited);
            if !built {
                return None;
            }
            Some((named(&nested_name, required), FieldKind::Object))
        }
        _ => None,
    }
}

fn resolve_input_field_type(
    parent_name: &str,
    key: &str,
    prop: &Value,
    required: bool,
    schema_set: &SchemaSet,
    inputs: &mut Vec<InputObject>,
    visited: &mut HashSet<String>,
) -> Option<TypeRef> {
    let prop = resolve_ref(prop, schema_set);
    match prop.get("type").and_then(Value::as_str) {
        Some("string") => Some(named(TypeRef::STRING, required)),
        Some("boolean") => Some(named(TypeRef::BOOLEAN, required)),
        Some("integer") => Some(named(TypeRef::INT, required)),
        Some("number") => Some(named(TypeRef::FLOAT, required)),
        Some("array") => {
            let items = prop.get("items")?;
            let items = resolve_ref(items, schema_set);
            match items.get("type").and_then(Value::as_str) {
                Some("object") => {
                    let item_properties = items.get("properties").and_then(Value::as_object)?;
                    let item_type_name = format!("{parent_name}{}ItemInput", capitalize(key));
                    let built = resolve_input_type(&item_type_name, item_properties, &HashSet::new(), schema_set, inputs, visited);
                    if !built {
                        return None;
                    }
                    Some(TypeRef::named_list(item_type_name))
                }
                Some("string") => Some(TypeRef::named_list(TypeRef::STRING)),
                Some("boolean") => Some(TypeRef::named_list(TypeRef::BOOLEAN)),
                Some("integer") => Some(TypeRef::named_list(TypeRef::INT)),
                Some("number") => Some(TypeRef::named_list(TypeRef::FLOAT)),
                _ => None,
            }
        }
        Some("object") | None => {
            let properties = prop.get("properties").and_then(Value::as_object)?;
            let nested_name = format!("{parent_name}{}Input", capitalize(key));
            let built = resolve_input_type(&nested_name, properties, &HashSet::new(), schema_set, inputs, visited);
            if !built {
                return None;
            }
            Some(named(&nested_name, required))
        }
        _ => None,
    }
}

fn resolve_ref<'a>(prop: &'a Value, schema_set: &'a SchemaSet) -> std::borrow::Cow<'a, Value> {
    let Some(r) = prop.get("$ref").and_then(Value::as_str) else {
        return std::borrow::Cow::Borrowed(prop);
    };
    let key = r.trim_start_matches("#/definitions/");
    match schema_set.get_by_key(key) {
        Some(target) => std::borrow::Cow::Borrowed(target),
        None => std::borrow::Cow::Borrowed(prop),
    }
}

fn build_output_field(key: &str, type_ref: TypeRef, kind: FieldKind) -> Field {
    let field_name = sanitize_field_name(key);
    let key_owned = key.to_string();
    Field::new(field_name, type_ref, move |ctx| {
        let key = key_owned.clone();
        FieldFuture::new(async move {
            let parent = downcast_json(&ctx)?;
            let Some(value) = parent.get(&key) else {
                return Ok(None);
            };
            if value.is_null() {
                return Ok(None);
            }
            match kind {
                FieldKind::Scalar => Ok(Some(FieldValue::value(
                    GqlValue::from_json(value.clone()).unwrap_or(GqlValue::Null),
                ))),
                FieldKind::ScalarList => {
                    let items = value.as_array().cloned().unwrap_or_default();
                    Ok(Some(FieldValue::list(
                        items.into_iter().map(|v| FieldValue::value(GqlValue::from_json(v).unwrap_or(GqlValue::Null))),
                    )))
                }
                FieldKind::Object => Ok(Some(FieldValue::owned_any(value.clone()))),
                FieldKind::ObjectList => {
                    let items = value.as_array().cloned().unwrap_or_default();
                    Ok(Some(FieldValue::list(items.into_iter().map(FieldValue::owned_any))))
                }
            }
        })
    })
}

fn named(type_name: impl Into<String>, required: bool) -> TypeRef {
    if required {
        TypeRef::named_nn(type_name)
    } else {
        TypeRef::named(type_name)
    }
}

fn sanitize_field_name(key: &str) -> String {
    let cleaned: String = key.chars().filter(|c| c.is_ascii_alphanumeric() || *c == '_').collect();
    if cleaned.is_empty() {
        "field".to_string()
    } else if cleaned.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        format!("_{cleaned}")
    } else {
        cleaned
    }
}

fn capitalize(s: &str) -> String {
    let sanitized = sanitize_field_name(s);
    let mut chars = sanitized.chars();
    match chars.next() {
        Some(c) => c.to_ascii_uppercase().to_string() + chars.as_str(),
        None => sanitized,
    }
}

fn default_plural(kind: &str) -> String {
    format!("{}s", kind.to_ascii_lowercase())
}

/// Dot-paths of every leaf field under the current subscription field's
/// selection set, used to scope `emitOnlyFieldChanges` diffing to what the
/// caller actually selected instead of the whole object (spec §4.8, §8
/// scenario 4).
fn selected_leaf_paths(field: SelectionField<'_>) -> Vec<Vec<String>> {
    let mut paths = Vec::new();
    collect_leaf_paths(field, Vec::new(), &mut paths);
    paths
}

fn collect_leaf_paths(field: SelectionField<'_>, prefix: Vec<String>, out: &mut Vec<Vec<String>>) {
    let mut children = field.selection_set().peekable();
    if children.peek().is_none() {
        if !prefix.is_empty() {
            out.push(prefix);
        }
        return;
    }
    for child in children {
        let mut next = prefix.clone();
        next.push(child.name().to_string());
        collect_leaf_paths(child, next, out);
    }
}

fn add_query_fields(query: Object, facts: &ResourceFacts, plural: &str) -> Object {
    let list_name = format!("list{}", capitalize(plural));
    let get_name = format!("get{}", facts.gvk.kind);
    let namespaced = facts.scope == Scope::Namespaced;

    let list_facts = facts.clone();
    let list_field = Field::new(list_name, TypeRef::named_nn_list_nn(facts.gvk.kind.clone()), move |ctx| {
        let facts = list_facts.clone();
        FieldFuture::new(async move {
            let engine = ctx.data::<Arc<ResolverEngine>>()?;
            let auth = ctx.data::<RequestAuth>()?;
            let namespace = ctx.args.try_get("namespace").ok().and_then(|v| v.string().ok().map(str::to_string));
            let label_selector = ctx
                .args
                .try_get("labelselector")
                .ok()
                .and_then(|v| v.string().ok().map(str::to_string));
            engine
                .authorize(Verb::List, &facts.api_resource, namespace.as_deref(), None, auth)
                .await?;
            let items = engine
                .list(&facts.api_resource, facts.scope, namespace.as_deref(), label_selector.as_deref())
                .await?;
            Ok(Some(FieldValue::list(items.into_iter().map(FieldValue::owned_any))))
        })
    })
    .argument(InputValue::new("namespace", TypeRef::named(TypeRef::STRING)))
    .argument(InputValue::new("labelselector", TypeRef::named(TypeRef::STRING)));
    let query = query.field(list_field);

    let get_facts = facts.clone();
    let mut get_field = Field::new(get_name, TypeRef::named(facts.gvk.kind.clone()), move |ctx| {
        let facts = get_facts.clone();
        FieldFuture::new(async move {
            let engine = ctx.data::<Arc<ResolverEngine>>()?;
            let auth = ctx.data::<RequestAuth>()?;
            let name = ctx.args.try_get("name")?.string()?.to_string();
            let namespace = ctx.args.try_get("namespace").ok().and_then(|v| v.string().ok().map(str::to_string));
            engine
                .authorize(Verb::Get, &facts.api_resource, namespace.as_deref(), Some(&name), auth)
                .await?;
            let item = engine.get(&facts.api_resource, facts.scope, namespace.as_deref(), &name).await?;
            Ok(Some(FieldValue::owned_any(item)))
        })
    })
    .argument(InputValue::new("name", TypeRef::named_nn(TypeRef::STRING)));
    if namespaced {
        get_field = get_field.argument(InputValue::new("namespace", TypeRef::named_nn(TypeRef::STRING)));
    }
    query.field(get_field)
}

fn add_mutation_fields(mutation: Object, facts: &ResourceFacts, spec_input_type: Option<&str>) -> Object {
    let kind = &facts.gvk.kind;
    let namespaced = facts.scope == Scope::Namespaced;

    let create_facts = facts.clone();
    let spec_input_owned = spec_input_type.map(str::to_string);
    let mut create_field = Field::new(format!("create{kind}"), TypeRef::named(kind.clone()), move |ctx| {
        let facts = create_facts.clone();
        FieldFuture::new(async move {
            let engine = ctx.data::<Arc<ResolverEngine>>()?;
            let auth = ctx.data::<RequestAuth>()?;
            let metadata = ctx.args.try_get("metadata")?.deserialize::<Value>()?;
            let spec = ctx
                .args
                .try_get("spec")
                .ok()
                .and_then(|v| v.deserialize::<Value>().ok())
                .unwrap_or(Value::Object(Default::default()));
            let namespace = metadata.get("namespace").and_then(Value::as_str).map(str::to_string);
            engine
                .authorize(Verb::Create, &facts.api_resource, namespace.as_deref(), None, auth)
                .await?;
            let created = engine
                .create(&facts.api_resource, facts.scope, namespace.as_deref(), metadata, spec)
                .await?;
            Ok(Some(FieldValue::owned_any(created)))
        })
    })
    .argument(InputValue::new("metadata", TypeRef::named_nn(METADATA_INPUT_TYPE)));
    if let Some(spec_input) = &spec_input_owned {
        create_field = create_field.argument(InputValue::new("spec", TypeRef::named(spec_input.clone())));
    }
    let mutation = mutation.field(create_field);

    let update_facts = facts.clone();
    let spec_input_owned2 = spec_input_owned.clone();
    let mut update_field = Field::new(format!("update{kind}"), TypeRef::named(kind.clone()), move |ctx| {
        let facts = update_facts.clone();
        FieldFuture::new(async move {
            let engine = ctx.data::<Arc<ResolverEngine>>()?;
            let auth = ctx.data::<RequestAuth>()?;
            let name = ctx.args.try_get("name")?.string()?.to_string();
            let namespace = ctx.args.try_get("namespace").ok().and_then(|v| v.string().ok().map(str::to_string));
            let metadata = ctx.args.try_get("metadata")?.deserialize::<Value>()?;
            let spec = ctx
                .args
                .try_get("spec")
                .ok()
                .and_then(|v| v.deserialize::<Value>().ok())
                .unwrap_or(Value::Object(Default::default()));
            engine
                .authorize(Verb::Update, &facts.api_resource, namespace.as_deref(), Some(&name), auth)
                .await?;
            let updated = engine
                .update(&facts.api_resource, facts.scope, namespace.as_deref(), &name, metadata, spec)
                .await?;
            Ok(Some(FieldValue::owned_any(updated)))
        })
    })
    .argument(InputValue::new("name", TypeRef::named_nn(TypeRef::STRING)))
    .argument(InputValue::new("metadata", TypeRef::named_nn(METADATA_INPUT_TYPE)));
    if namespaced {
        update_field = update_field.argument(InputValue::new("namespace", TypeRef::named_nn(TypeRef::STRING)));
    }
    if let Some(spec_input) = &spec_input_owned2 {
        update_field = update_field.argument(InputValue::new("spec", TypeRef::named_nn(spec_input.clone())));
    }
    let mutation = mutation.field(update_field);

    let delete_facts = facts.clone();
    let mut delete_field = Field::new(format!("delete{kind}"), TypeRef::named_nn(TypeRef::BOOLEAN), move |ctx| {
        let facts = delete_facts.clone();
        FieldFuture::new(async move {
            let engine = ctx.data::<Arc<ResolverEngine>>()?;
            let auth = ctx.data::<RequestAuth>()?;
            let name = ctx.args.try_get("name")?.string()?.to_string();
            let namespace = ctx.args.try_get("namespace").ok().and_then(|v| v.string().ok().map(str::to_string));
            engine
                .authorize(Verb::Delete, &facts.api_resource, namespace.as_deref(), Some(&name), auth)
                .await?;
            let ok = engine.delete(&facts.api_resource, facts.scope, namespace.as_deref(), &name).await?;
            Ok(Some(FieldValue::value(GqlValue::Boolean(ok))))
        })
    })
    .argument(InputValue::new("name", TypeRef::named_nn(TypeRef::STRING)));
    if namespaced {
        delete_field = delete_field.argument(InputValue::new("namespace", TypeRef::named_nn(TypeRef::STRING)));
    }
    let mutation = mutation.field(delete_field);

    let patch_facts = facts.clone();
    let mut patch_field = Field::new(format!("patch{kind}"), TypeRef::named(kind.clone()), move |ctx| {
        let facts = patch_facts.clone();
        FieldFuture::new(async move {
            let engine = ctx.data::<Arc<ResolverEngine>>()?;
            let auth = ctx.data::<RequestAuth>()?;
            let name = ctx.args.try_get("name")?.string()?.to_string();
            let namespace = ctx.args.try_get("namespace").ok().and_then(|v| v.string().ok().map(str::to_string));
            let patch_type = ctx.args.try_get("type")?.enum_name()?.to_string();
            let payload = ctx.args.try_get("payload")?.string()?.to_string();
            let kind = match patch_type.as_str() {
                "JSON_PATCH" => PatchKind::JsonPatch,
                "MERGE_PATCH" => PatchKind::MergePatch,
                "STRATEGIC_MERGE_PATCH" => PatchKind::StrategicMergePatch,
                other => {
                    return Err(async_graphql::Error::new(format!("unknown patch type {other}")));
                }
            };
            engine
                .authorize(Verb::Patch, &facts.api_resource, namespace.as_deref(), Some(&name), auth)
                .await?;
            let patched = engine
                .patch(&facts.api_resource, facts.scope, namespace.as_deref(), &name, kind, payload.as_bytes())
                .await?;
            Ok(Some(FieldValue::owned_any(patched)))
        })
    })
    .argument(InputValue::new("name", TypeRef::named_nn(TypeRef::STRING)))
    .argument(InputValue::new("type", TypeRef::named_nn(PATCH_TYPE_ENUM)))
    .argument(InputValue::new("payload", TypeRef::named_nn(TypeRef::STRING)));
    if namespaced {
        patch_field = patch_field.argument(InputValue::new("namespace", TypeRef::named_nn(TypeRef::STRING)));
    }
    mutation.field(patch_field)
}

fn add_subscription_fields(subscription: Subscription, facts: &ResourceFacts, plural: &str) -> Subscription {
    let kind = &facts.gvk.kind;
    let namespaced = facts.scope == Scope::Namespaced;

    let single_facts = facts.clone();
    let mut single_field = SubscriptionField::new(format!("subscribe{kind}"), TypeRef::named(kind.clone()), move |ctx| {
        let facts = single_facts.clone();
        SubscriptionFieldFuture::new(async move {
            let engine = ctx.data::<Arc<ResolverEngine>>()?.clone();
            let auth = ctx.data::<RequestAuth>()?;
            let name = ctx.args.try_get("name")?.string()?.to_string();
            let namespace = ctx.args.try_get("namespace").ok().and_then(|v| v.string().ok().map(str::to_string));
            let emit_only_changes = ctx
                .args
                .try_get("emitOnlyFieldChanges")
                .ok()
                .and_then(|v| v.boolean().ok())
                .unwrap_or(false);
            let selected_paths = selected_leaf_paths(ctx.field());
            engine
                .authorize(Verb::Watch, &facts.api_resource, namespace.as_deref(), Some(&name), auth)
                .await?;
            let stream = engine.watch_single(&facts.api_resource, facts.scope, namespace.as_deref(), &name);
            let mut previous: Option<Value> = None;
            let mapped = stream.filter_map(move |event| {
                let emit_only_changes = emit_only_changes;
                let prev = previous.clone();
                let result = event.ok().and_then(|ev| single_subscription_payload(&ev));
                let selected_paths = selected_paths.clone();
                async move {
                    let value = result?;
                    if emit_only_changes && !selected_fields_changed(prev.as_ref(), &value, &selected_paths) {
                        return None;
                    }
                    Some(Ok(FieldValue::owned_any(value)))
                }
            });
            Ok(mapped)
        })
    })
    .argument(InputValue::new("name", TypeRef::named_nn(TypeRef::STRING)))
    .argument(InputValue::new("emitOnlyFieldChanges", TypeRef::named(TypeRef::BOOLEAN)));
    if namespaced {
        single_field = single_field.argument(InputValue::new("namespace", TypeRef::named_nn(TypeRef::STRING)));
    }
    let subscription = subscription.field(single_field);

    let list_facts = facts.clone();
    let mut list_field = SubscriptionField::new(
        format!("subscribeList{}", capitalize(plural)),
        TypeRef::named_nn_list_nn(kind.clone()),
        move |ctx| {
            let facts = list_facts.clone();
            SubscriptionFieldFuture::new(async move {
                let engine = ctx.data::<Arc<ResolverEngine>>()?.clone();
                let auth = ctx.data::<RequestAuth>()?;
                let namespace = ctx.args.try_get("namespace").ok().and_then(|v| v.string().ok().map(str::to_string));
                engine
                    .authorize(Verb::Watch, &facts.api_resource, namespace.as_deref(), None, auth)
                    .await?;
                let stream = engine.watch_list(&facts.api_resource, facts.scope, namespace.as_deref());
                let mut live_set = LiveSet::default();
                let mapped = stream.filter_map(move |event| {
                    let snapshot = event.ok().and_then(|ev| live_set.apply(&ev));
                    async move { snapshot.map(|items| Ok(FieldValue::list(items.into_iter().map(FieldValue::owned_any)))) }
                });
                Ok(mapped)
            })
        },
    )
    .argument(InputValue::new("emitOnlyFieldChanges", TypeRef::named(TypeRef::BOOLEAN)));
    if namespaced {
        list_field = list_field.argument(InputValue::new("namespace", TypeRef::named(TypeRef::STRING)));
    }
    subscription.field(list_field)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AuthSpec, ClusterAccess, Components, SchemaDocument};

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
    fn sanitize_strips_forbidden_characters() {
        assert_eq!(sanitize_field_name("my-field"), "myfield");
        assert_eq!(sanitize_field_name("9lives"), "_9lives");
    }

    #[test]
    fn empty_schema_set_builds_without_error() {
        let set = SchemaSet::from_document(&doc(serde_json::json!({})));
        let schema = build_schema(&set);
        assert!(schema.is_ok());
    }

    #[test]
    fn single_kind_with_spec_builds_schema() {
        let set = SchemaSet::from_document(&doc(serde_json::json!({
            "core.example.io.v1.Widget": {
                "x-kubernetes-group-version-kind": [{"group": "example.io", "version": "v1", "kind": "Widget"}],
                "x-scope": "Namespaced",
                "x-gateway-plural": "widgets",
                "properties": {
                    "spec": {
                        "properties": {
                            "replicas": {"type": "integer"},
                            "name": {"type": "string"}
                        },
                        "required": ["replicas"]
                    }
                }
            }
        })));
        let schema = build_schema(&set).expect("schema should build");
        let sdl = schema.sdl();
        assert!(sdl.contains("listWidgets"));
        assert!(sdl.contains("getWidget"));
        assert!(sdl.contains("createWidget"));
        assert!(sdl.contains("subscribeWidget"));
    }

    #[test]
    fn kind_with_empty_spec_elides_spec_field() {
        let set = SchemaSet::from_document(&doc(serde_json::json!({
            "core.example.io.v1.Empty": {
                "x-kubernetes-group-version-kind": [{"group": "example.io", "version": "v1", "kind": "Empty"}],
                "x-scope": "Cluster",
                "properties": { "spec": { "properties": {} } }
            }
        })));
        let schema = build_schema(&set).expect("schema should build even with an elided spec");
        assert!(schema.sdl().contains("getEmpty"));
    }
}
