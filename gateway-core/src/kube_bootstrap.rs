//! Builds a `kube::Client` for a cluster from its `ClusterAccess` record
//! (spec §4.1/§4.2), shared by the listener's discovery client and the
//! gateway's resolver client.

use std::path::PathBuf;

use kube::config::{
    AuthInfo, Cluster as KubeCluster, Context as KubeContext, KubeConfigOptions, Kubeconfig,
    NamedAuthInfo, NamedCluster, NamedContext,
};
use kube::{Client, Config};
use serde_json::Value;
use tracing::info;

use crate::access::{build_auth, pick_kubeconfig_auth};
use crate::errors::{ErrorKind, Result};
use crate::resolver::RequestAuth;
use crate::types::{ClientAuth, ClusterAccess};

const CLUSTER_NAME: &str = "gateway-cluster";
const USER_NAME: &str = "gateway-user";
const CONTEXT_NAME: &str = "gateway-context";

/// Resolves connection metadata into a live `kube::Client`, reusing kube-rs's
/// own kubeconfig resolution (TLS setup, exec plugins, cert parsing) rather
/// than re-implementing it: a synthetic single-cluster/single-context
/// `Kubeconfig` is assembled in memory and handed to
/// `Config::from_custom_kubeconfig`, mirroring how the teacher's
/// `KubeClientImpl::new` drove `Config::from_kubeconfig`.
pub async fn client_for_access(access: &ClusterAccess, allow_insecure: bool) -> Result<Client> {
    access
        .validate()
        .map_err(|e| ErrorKind::InvalidInput(e).into_gateway())?;

    let auth = build_auth(access)?;
    match auth {
        Some(ClientAuth::Kubeconfig(bytes)) => return client_from_embedded_kubeconfig(&bytes).await,
        Some(ClientAuth::Bearer(token)) => {
            let mut auth_info = AuthInfo::default();
            auth_info.token = Some(token.into());
            client_with_auth_info(access, allow_insecure, auth_info).await
        }
        Some(ClientAuth::ClientCert { cert, key }) => {
            let mut auth_info = AuthInfo::default();
            auth_info.client_certificate_data = Some(encode_b64(&cert));
            auth_info.client_key_data = Some(encode_b64(&key));
            client_with_auth_info(access, allow_insecure, auth_info).await
        }
        Some(ClientAuth::ServiceAccountToken(token)) => {
            let mut auth_info = AuthInfo::default();
            auth_info.token = Some(token.into());
            client_with_auth_info(access, allow_insecure, auth_info).await
        }
        None => client_with_auth_info(access, allow_insecure, AuthInfo::default()).await,
    }
}

/// Builds a client scoped to one GraphQL request's caller (spec §4.8): when
/// not impersonating, the caller's bearer token is forwarded verbatim and the
/// cluster's own service credentials are never used; when impersonating, the
/// cluster's own credentials authenticate to the API server and the caller's
/// identity rides along as `Impersonate-User`/`Impersonate-Group`.
pub async fn client_for_request(access: &ClusterAccess, allow_insecure: bool, auth: &RequestAuth) -> Result<Client> {
    access
        .validate()
        .map_err(|e| ErrorKind::InvalidInput(e).into_gateway())?;

    if !auth.impersonate {
        let mut auth_info = AuthInfo::default();
        auth_info.token = Some(auth.token.clone().into());
        return client_with_auth_info(access, allow_insecure, auth_info).await;
    }

    let service_auth = build_auth(access)?;
    let mut auth_info = AuthInfo::default();
    match service_auth {
        Some(ClientAuth::Kubeconfig(_)) => {
            return Err(ErrorKind::CredentialUnusable(
                "impersonation is not supported with an embedded kubeconfig credential".to_string(),
            )
            .into_gateway());
        }
        Some(ClientAuth::Bearer(token)) | Some(ClientAuth::ServiceAccountToken(token)) => {
            auth_info.token = Some(token.into());
        }
        Some(ClientAuth::ClientCert { cert, key }) => {
            auth_info.client_certificate_data = Some(encode_b64(&cert));
            auth_info.client_key_data = Some(encode_b64(&key));
        }
        None => {}
    }
    auth_info.impersonate = Some(auth.user.clone());
    if !auth.groups.is_empty() {
        auth_info.impersonate_groups = Some(auth.groups.clone());
    }
    client_with_auth_info(access, allow_insecure, auth_info).await
}

async fn client_with_auth_info(access: &ClusterAccess, allow_insecure: bool, auth_info: AuthInfo) -> Result<Client> {
    let (certificate_authority_data, insecure_skip_tls_verify) = match &access.ca {
        Some(ca) => {
            let decoded = ca
                .decode()
                .map_err(|e| ErrorKind::CredentialUnusable(e).into_gateway())?;
            (
                Some(base64::Engine::encode(
                    &base64::engine::general_purpose::STANDARD,
                    decoded,
                )),
                Some(false),
            )
        }
        None => (None, Some(allow_insecure)),
    };

    let kubeconfig = Kubeconfig {
        clusters: vec![NamedCluster {
            name: CLUSTER_NAME.to_string(),
            cluster: Some(KubeCluster {
                server: Some(access.host.clone()),
                certificate_authority_data,
                insecure_skip_tls_verify,
                ..Default::default()
            }),
        }],
        auth_infos: vec![NamedAuthInfo {
            name: USER_NAME.to_string(),
            auth_info: Some(auth_info),
        }],
        contexts: vec![NamedContext {
            name: CONTEXT_NAME.to_string(),
            context: Some(KubeContext {
                cluster: CLUSTER_NAME.to_string(),
                user: USER_NAME.to_string(),
                namespace: None,
                extensions: None,
            }),
        }],
        current_context: Some(CONTEXT_NAME.to_string()),
        ..Default::default()
    };

    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| ErrorKind::DiscoveryFailed(format!("building client config: {e}")).into_gateway())?;
    info!(host = %access.host, "built kube client for cluster");
    Ok(Client::try_from(config)?)
}

/// Builds a client from an embedded kubeconfig. Rather than trusting kube-rs's
/// own internal auth-resolution order for the current-context user, the raw
/// credential fields are read directly and run through
/// [`pick_kubeconfig_auth`]'s spec §4.1 precedence
/// (token > clientCertData+clientKeyData > clientCertFile+clientKeyFile >
/// username+password), and the user's `AuthInfo` is rebuilt from whichever
/// field that picks before handing the kubeconfig to `kube`.
async fn client_from_embedded_kubeconfig(bytes: &[u8]) -> Result<Client> {
    let mut kubeconfig: Kubeconfig = serde_yaml_compatible_from_slice(bytes)?;
    let picked = pick_auth_for_kubeconfig(bytes, &kubeconfig)?;
    apply_picked_auth(&mut kubeconfig, picked)?;
    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| ErrorKind::DiscoveryFailed(format!("building client config from embedded kubeconfig: {e}")).into_gateway())?;
    Ok(Client::try_from(config)?)
}

/// Reads the current-context user's raw credential fields from the embedded
/// kubeconfig's own JSON (not from the parsed `Kubeconfig`'s typed `AuthInfo`,
/// whose secret-bearing fields aren't meant to be read back out) and applies
/// the precedence rule.
fn pick_auth_for_kubeconfig(bytes: &[u8], kubeconfig: &Kubeconfig) -> Result<ClientAuth> {
    let raw: Value = serde_json::from_slice(bytes)
        .map_err(|e| ErrorKind::CredentialUnusable(format!("embedded kubeconfig is not valid JSON: {e}")).into_gateway())?;
    let current_context = kubeconfig
        .current_context
        .as_deref()
        .ok_or_else(|| ErrorKind::CredentialUnusable("embedded kubeconfig has no current-context".to_string()).into_gateway())?;
    let user_name = raw
        .get("contexts")
        .and_then(Value::as_array)
        .and_then(|contexts| {
            contexts
                .iter()
                .find(|c| c.get("name").and_then(Value::as_str) == Some(current_context))
        })
        .and_then(|c| c.get("context"))
        .and_then(|c| c.get("user"))
        .and_then(Value::as_str)
        .ok_or_else(|| ErrorKind::CredentialUnusable(format!("embedded kubeconfig context {current_context} not found")).into_gateway())?;
    let user = raw
        .get("users")
        .and_then(Value::as_array)
        .and_then(|users| users.iter().find(|u| u.get("name").and_then(Value::as_str) == Some(user_name)))
        .and_then(|u| u.get("user"))
        .cloned()
        .unwrap_or(Value::Null);

    let token = user.get("token").and_then(Value::as_str);
    let cert_data = user
        .get("client-certificate-data")
        .and_then(Value::as_str)
        .map(decode_b64)
        .transpose()?;
    let key_data = user
        .get("client-key-data")
        .and_then(Value::as_str)
        .map(decode_b64)
        .transpose()?;
    let cert_file = user.get("client-certificate").and_then(Value::as_str).map(PathBuf::from);
    let key_file = user.get("client-key").and_then(Value::as_str).map(PathBuf::from);
    let username = user.get("username").and_then(Value::as_str);
    let password = user.get("password").and_then(Value::as_str);

    pick_kubeconfig_auth(
        token,
        cert_data.as_deref(),
        key_data.as_deref(),
        cert_file.as_deref(),
        key_file.as_deref(),
        username,
        password,
    )
}

/// Replaces the current-context user's `AuthInfo` with one built purely from
/// the credential [`pick_auth_for_kubeconfig`] picked, so kube-rs's own
/// resolution order never gets a say.
fn apply_picked_auth(kubeconfig: &mut Kubeconfig, auth: ClientAuth) -> Result<()> {
    let current_context = kubeconfig
        .current_context
        .clone()
        .ok_or_else(|| ErrorKind::CredentialUnusable("embedded kubeconfig has no current-context".to_string()).into_gateway())?;
    let user_name = kubeconfig
        .contexts
        .iter()
        .find(|c| c.name == current_context)
        .and_then(|c| c.context.as_ref())
        .map(|c| c.user.clone())
        .ok_or_else(|| ErrorKind::CredentialUnusable(format!("embedded kubeconfig context {current_context} not found")).into_gateway())?;

    let mut auth_info = AuthInfo::default();
    match auth {
        ClientAuth::Bearer(token) => auth_info.token = Some(token.into()),
        ClientAuth::ClientCert { cert, key } => {
            auth_info.client_certificate_data = Some(encode_b64(&cert));
            auth_info.client_key_data = Some(encode_b64(&key));
        }
        ClientAuth::ServiceAccountToken(token) => auth_info.token = Some(token.into()),
        ClientAuth::Kubeconfig(_) => {
            return Err(ErrorKind::CredentialUnusable("embedded kubeconfig auth cannot nest another kubeconfig".to_string()).into_gateway());
        }
    }

    match kubeconfig.auth_infos.iter_mut().find(|a| a.name == user_name) {
        Some(named) => named.auth_info = Some(auth_info),
        None => kubeconfig.auth_infos.push(NamedAuthInfo {
            name: user_name,
            auth_info: Some(auth_info),
        }),
    }
    Ok(())
}

fn decode_b64(s: &str) -> Result<Vec<u8>> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD
        .decode(s)
        .map_err(|e| ErrorKind::CredentialUnusable(format!("invalid base64 in embedded kubeconfig: {e}")).into_gateway())
}

/// Kubeconfig files are YAML, not JSON, but share a superset grammar for the
/// subset this gateway embeds; a minimal parser independent of a YAML crate
/// would be fragile, so `serde_json` is used on the assumption (documented
/// in DESIGN.md) that embedded kubeconfigs are authored as JSON, which is
/// valid YAML.
fn serde_yaml_compatible_from_slice(bytes: &[u8]) -> Result<Kubeconfig> {
    serde_json::from_slice(bytes).map_err(|e| {
        ErrorKind::CredentialUnusable(format!("embedded kubeconfig is not valid JSON: {e}")).into_gateway()
    })
}

fn encode_b64(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AuthSpec;
    use base64::Engine;

    fn b64(s: &str) -> String {
        base64::engine::general_purpose::STANDARD.encode(s)
    }

    #[tokio::test]
    async fn rejects_invalid_host() {
        let access = ClusterAccess {
            path: None,
            host: String::new(),
            ca: None,
            auth: None,
        };
        assert!(client_for_access(&access, true).await.is_err());
    }

    #[tokio::test]
    async fn builds_client_with_bearer_token() {
        let access = ClusterAccess {
            path: None,
            host: "https://api.example.com:6443".to_string(),
            ca: None,
            auth: Some(AuthSpec::Token { data: b64("s3cr3t") }),
        };
        let client = client_for_access(&access, true).await;
        assert!(client.is_ok());
    }

    #[tokio::test]
    async fn client_for_request_forwards_caller_token_when_not_impersonating() {
        let access = ClusterAccess {
            path: None,
            host: "https://api.example.com:6443".to_string(),
            ca: None,
            auth: Some(AuthSpec::Token { data: b64("service-account-token") }),
        };
        let auth = RequestAuth {
            user: "alice@example.com".to_string(),
            token: "caller-token".to_string(),
            groups: vec!["system:authenticated".to_string()],
            impersonate: false,
        };
        assert!(client_for_request(&access, true, &auth).await.is_ok());
    }

    #[test]
    fn pick_auth_for_kubeconfig_prefers_token_over_cert() {
        let raw = serde_json::json!({
            "apiVersion": "v1",
            "kind": "Config",
            "clusters": [{"name": "c", "cluster": {"server": "https://api.example.com"}}],
            "contexts": [{"name": "ctx", "context": {"cluster": "c", "user": "u"}}],
            "current-context": "ctx",
            "users": [{"name": "u", "user": {
                "token": "tok",
                "client-certificate-data": b64("cert"),
                "client-key-data": b64("key")
            }}]
        });
        let bytes = serde_json::to_vec(&raw).unwrap();
        let kubeconfig: Kubeconfig = serde_json::from_slice(&bytes).unwrap();
        let picked = pick_auth_for_kubeconfig(&bytes, &kubeconfig).unwrap();
        assert!(matches!(picked, ClientAuth::Bearer(t) if t == "tok"));
    }

    #[test]
    fn pick_auth_for_kubeconfig_falls_back_to_cert_without_token() {
        let raw = serde_json::json!({
            "clusters": [{"name": "c", "cluster": {"server": "https://api.example.com"}}],
            "contexts": [{"name": "ctx", "context": {"cluster": "c", "user": "u"}}],
            "current-context": "ctx",
            "users": [{"name": "u", "user": {
                "client-certificate-data": b64("cert"),
                "client-key-data": b64("key")
            }}]
        });
        let bytes = serde_json::to_vec(&raw).unwrap();
        let kubeconfig: Kubeconfig = serde_json::from_slice(&bytes).unwrap();
        let picked = pick_auth_for_kubeconfig(&bytes, &kubeconfig).unwrap();
        assert!(matches!(picked, ClientAuth::ClientCert { .. }));
    }

    #[tokio::test]
    async fn client_for_request_impersonates_when_requested() {
        let access = ClusterAccess {
            path: None,
            host: "https://api.example.com:6443".to_string(),
            ca: None,
            auth: Some(AuthSpec::Token { data: b64("service-account-token") }),
        };
        let auth = RequestAuth {
            user: "alice@example.com".to_string(),
            token: "caller-token".to_string(),
            groups: vec!["system:authenticated".to_string()],
            impersonate: true,
        };
        assert!(client_for_request(&access, true, &auth).await.is_ok());
    }
}
