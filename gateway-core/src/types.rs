//! Data model shared by the listener and the gateway (spec §3).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Connection metadata for one cluster: `{ path?, host, ca?, auth? }` (spec §3/§6).
///
/// Byte-valued fields stay base64-encoded here; decoding happens at the point
/// of use via [`AuthSpec::decode`] and [`CaBundle::decode`] so a malformed
/// cluster doesn't fail to even be looked up, only to be connected to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterAccess {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub host: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca: Option<CaBundle>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthSpec>,
}

impl ClusterAccess {
    /// Spec §3 invariant: `host` is a non-empty URL.
    pub fn validate(&self) -> Result<(), String> {
        if self.host.trim().is_empty() {
            return Err("host must not be empty".to_string());
        }
        url::Url::parse(&self.host).map_err(|e| format!("invalid host url: {e}"))?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaBundle {
    pub data: String,
}

impl CaBundle {
    pub fn decode(&self) -> Result<Vec<u8>, String> {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD
            .decode(&self.data)
            .map_err(|e| format!("invalid base64 CA data: {e}"))
    }
}

/// `auth?: oneof(token, kubeconfig, clientCert, serviceAccount)` (spec §3).
///
/// Serializes as `{"type": "...", ...fields}`, matching the wire shape in
/// spec §6 (`{type, token?|kubeconfig?|certData?|keyData?}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AuthSpec {
    Token {
        data: String,
    },
    Kubeconfig {
        data: String,
    },
    ClientCert {
        #[serde(rename = "certData")]
        cert_data: String,
        #[serde(rename = "keyData")]
        key_data: String,
    },
    ServiceAccount {
        name: String,
        ns: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        aud: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ttl_seconds: Option<u64>,
    },
}

/// Resolved client authentication material, produced by `build_auth` (spec §4.1,
/// "used by C2 and C8").
#[derive(Debug, Clone)]
pub enum ClientAuth {
    Bearer(String),
    Kubeconfig(Vec<u8>),
    ClientCert { cert: Vec<u8>, key: Vec<u8> },
    ServiceAccountToken(String),
}

/// Group-version-kind triple (spec GLOSSARY).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupVersionKind {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl GroupVersionKind {
    pub fn new(group: impl Into<String>, version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            kind: kind.into(),
        }
    }

    pub fn group_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// Reversed-group dotted schema key (spec §4.3 "Key format"), e.g.
    /// `{group: "io.openmfp.core", version: "v1alpha1", kind: "Account"}` ->
    /// `core.openmfp.io.v1alpha1.Account`.
    pub fn schema_key(&self) -> String {
        let reversed_group = reverse_dotted(&self.group);
        if reversed_group.is_empty() {
            format!("{}.{}", self.version, self.kind)
        } else {
            format!("{}.{}.{}", reversed_group, self.version, self.kind)
        }
    }
}

fn reverse_dotted(group: &str) -> String {
    if group.is_empty() {
        return String::new();
    }
    group.split('.').rev().collect::<Vec<_>>().join(".")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum Scope {
    Namespaced,
    Cluster,
}

/// A schema document, keyed by cluster (spec §3 "Schema document (catalog
/// value)"). The schema entries themselves stay `serde_json::Value` since their
/// shape is an arbitrary OpenAPI-v3-like JSON Schema tree with vendor
/// extensions; typing that tree exactly buys nothing beyond what the builder
/// and the type generator already validate structurally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaDocument {
    pub components: Components,
    #[serde(rename = "x-cluster-metadata")]
    pub cluster_metadata: ClusterAccess,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Components {
    pub schemas: SchemaMap,
}

/// `BTreeMap` rather than a hash map: key order feeds directly into the
/// content-hash/content-equality invariant in spec §8 ("Content-hash no-op"),
/// which requires that semantically identical documents serialize identically.
pub type SchemaMap = BTreeMap<String, serde_json::Value>;

pub const EXT_GVK: &str = "x-kubernetes-group-version-kind";
pub const EXT_SCOPE: &str = "x-scope";
pub const EXT_CATEGORIES: &str = "x-categories";
/// Not named in spec §3's vendor-extension list; added so the GraphQL type
/// generator (C7) doesn't need to re-derive the REST plural from `Kind`
/// (spec §9 "Unstructured objects" favors carrying data forward over
/// re-deriving it).
pub const EXT_PLURAL: &str = "x-gateway-plural";

/// Reads `x-kubernetes-group-version-kind` off a schema entry. Per spec §3,
/// the list is meaningful only at length exactly 1; other lengths are
/// retained verbatim but not indexed.
pub fn entry_gvk(entry: &serde_json::Value) -> Option<GroupVersionKind> {
    let list = entry.get(EXT_GVK)?.as_array()?;
    if list.len() != 1 {
        return None;
    }
    let obj = list.first()?;
    Some(GroupVersionKind {
        group: obj.get("group")?.as_str()?.to_string(),
        version: obj.get("version")?.as_str()?.to_string(),
        kind: obj.get("kind")?.as_str()?.to_string(),
    })
}

pub fn entry_scope(entry: &serde_json::Value) -> Option<Scope> {
    match entry.get(EXT_SCOPE)?.as_str()? {
        "Namespaced" => Some(Scope::Namespaced),
        "Cluster" => Some(Scope::Cluster),
        _ => None,
    }
}

pub fn entry_plural(entry: &serde_json::Value) -> Option<String> {
    entry.get(EXT_PLURAL)?.as_str().map(str::to_string)
}

pub fn entry_categories(entry: &serde_json::Value) -> Vec<String> {
    entry
        .get(EXT_CATEGORIES)
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}
