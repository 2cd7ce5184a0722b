//! Cluster Access Store (C1, spec §4.1).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use base64::Engine;
use futures::{Stream, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::warn;

use crate::errors::{ErrorKind, Result};
use crate::types::{AuthSpec, ClientAuth, ClusterAccess};

const BROADCAST_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub enum AccessEvent {
    Added(String, ClusterAccess),
    Updated(String, ClusterAccess),
    Deleted(String),
}

/// Contract from spec §4.1: `Lookup` and `Watch`. Implementations are
/// pluggable — a cluster-scoped CRD registry or a KCP virtual workspace both
/// surface this same trait.
#[async_trait]
pub trait ClusterAccessStore: Send + Sync {
    async fn lookup(&self, cluster_name: &str) -> Result<ClusterAccess>;
    fn watch(&self) -> std::pin::Pin<Box<dyn Stream<Item = AccessEvent> + Send>>;
}

/// Default, dependency-free back-end: one `ClusterAccess` JSON file per
/// cluster in a directory, watched with `notify`. This is the collaborator
/// seam spec §4.1 leaves open — a real deployment swaps this for a
/// controller watching a cluster-scoped custom resource, or a KCP virtual
/// workspace, without touching C2/C4.
pub struct StaticAccessStore {
    dir: PathBuf,
    cache: Arc<RwLock<HashMap<String, ClusterAccess>>>,
    events: broadcast::Sender<AccessEvent>,
    _watcher: notify::RecommendedWatcher,
}

impl StaticAccessStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        use notify::{RecursiveMode, Watcher};

        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let mut cache = HashMap::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            let bytes = std::fs::read(entry.path())?;
            match serde_json::from_slice::<ClusterAccess>(&bytes) {
                Ok(access) => {
                    cache.insert(name, access);
                }
                Err(err) => warn!("skipping malformed cluster access file {name}: {err}"),
            }
        }
        let cache = Arc::new(RwLock::new(cache));
        let (events, _rx) = broadcast::channel(BROADCAST_CAPACITY);

        let tx = events.clone();
        let watch_cache = cache.clone();
        let watch_dir = dir.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let event = match res {
                Ok(event) => event,
                Err(err) => {
                    warn!("access store watch error: {err}");
                    return;
                }
            };
            for path in &event.paths {
                let Some(name) = path.strip_prefix(&watch_dir).ok().and_then(|p| p.to_str()).map(str::to_string) else {
                    continue;
                };
                match event.kind {
                    notify::EventKind::Remove(_) => {
                        if watch_cache.write().expect("lock poisoned").remove(&name).is_some() {
                            let _ = tx.send(AccessEvent::Deleted(name));
                        }
                    }
                    notify::EventKind::Create(_) | notify::EventKind::Modify(_) => {
                        // Tolerate ENOENT races: the file may have been
                        // removed again between the notify event and our
                        // read (spec §6 "tolerate ENOENT races").
                        let Ok(bytes) = std::fs::read(path) else { continue };
                        let access = match serde_json::from_slice::<ClusterAccess>(&bytes) {
                            Ok(access) => access,
                            Err(err) => {
                                warn!("skipping malformed cluster access file {name}: {err}");
                                continue;
                            }
                        };
                        let existed = watch_cache.write().expect("lock poisoned").insert(name.clone(), access.clone()).is_some();
                        let event = if existed {
                            AccessEvent::Updated(name, access)
                        } else {
                            AccessEvent::Added(name, access)
                        };
                        let _ = tx.send(event);
                    }
                    _ => {}
                }
            }
        })
        .map_err(|e| ErrorKind::CatalogIo(format!("starting access directory watch: {e}")).into_gateway())?;
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| ErrorKind::CatalogIo(format!("watching {}: {e}", dir.display())).into_gateway())?;

        Ok(Self {
            dir,
            cache,
            events,
            _watcher: watcher,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl ClusterAccessStore for StaticAccessStore {
    async fn lookup(&self, cluster_name: &str) -> Result<ClusterAccess> {
        self.cache
            .read()
            .expect("lock poisoned")
            .get(cluster_name)
            .cloned()
            .ok_or_else(|| ErrorKind::NotFound(format!("cluster {cluster_name}")).into_gateway())
    }

    /// Spec §4.1 "Watch": the initial snapshot is emitted as `Added` events,
    /// followed by live directory events for as long as the stream is
    /// polled — mirrors the catalog's own snapshot-then-live contract (§4.5)
    /// so C4 observes cluster add/update/delete without a restart.
    fn watch(&self) -> std::pin::Pin<Box<dyn Stream<Item = AccessEvent> + Send>> {
        let initial: Vec<AccessEvent> = self
            .cache
            .read()
            .expect("lock poisoned")
            .iter()
            .map(|(name, access)| AccessEvent::Added(name.clone(), access.clone()))
            .collect();
        let live = BroadcastStream::new(self.events.subscribe()).take_while(|res| {
            let keep = !matches!(res, Err(tokio_stream::wrappers::errors::BroadcastStreamRecvError::Lagged(_)));
            async move { keep }
        });
        let live = live.filter_map(|res| async move { res.ok() });
        Box::pin(futures::stream::iter(initial).chain(live))
    }
}

/// Authentication construction rules from spec §4.1, shared by C2 (discovery
/// client bootstrap) and C8 (per-request resolver client).
pub fn build_auth(access: &ClusterAccess) -> Result<Option<ClientAuth>> {
    let Some(auth) = &access.auth else {
        return Ok(None);
    };
    let b64 = base64::engine::general_purpose::STANDARD;
    match auth {
        AuthSpec::Token { data } => {
            let bytes = b64
                .decode(data)
                .map_err(|e| ErrorKind::CredentialUnusable(format!("invalid token base64: {e}")).into_gateway())?;
            let token = String::from_utf8(bytes)
                .map_err(|e| ErrorKind::CredentialUnusable(format!("token is not utf8: {e}")).into_gateway())?;
            Ok(Some(ClientAuth::Bearer(token)))
        }
        AuthSpec::Kubeconfig { data } => {
            let bytes = b64
                .decode(data)
                .map_err(|e| ErrorKind::CredentialUnusable(format!("invalid kubeconfig base64: {e}")).into_gateway())?;
            Ok(Some(ClientAuth::Kubeconfig(bytes)))
        }
        AuthSpec::ClientCert { cert_data, key_data } => {
            let cert = b64
                .decode(cert_data)
                .map_err(|e| ErrorKind::CredentialUnusable(format!("invalid cert base64: {e}")).into_gateway())?;
            let key = b64
                .decode(key_data)
                .map_err(|e| ErrorKind::CredentialUnusable(format!("invalid key base64: {e}")).into_gateway())?;
            Ok(Some(ClientAuth::ClientCert { cert, key }))
        }
        AuthSpec::ServiceAccount { .. } => {
            // Minting is delegated to the caller (needs a live client to the
            // cluster that owns the service account); the store only
            // describes what to mint.
            Err(ErrorKind::CredentialUnusable(
                "serviceAccount auth requires minting via a live cluster client".to_string(),
            )
            .into_gateway())
        }
    }
}

/// Chooses the strongest usable credential within a decoded kubeconfig
/// current-context's `user`, per spec §4.1's precedence:
/// `token > clientCertData+clientKeyData > clientCertFile+clientKeyFile > username+password`.
pub fn pick_kubeconfig_auth(
    token: Option<&str>,
    client_cert_data: Option<&[u8]>,
    client_key_data: Option<&[u8]>,
    client_cert_file: Option<&Path>,
    client_key_file: Option<&Path>,
    username: Option<&str>,
    password: Option<&str>,
) -> Result<ClientAuth> {
    if let Some(token) = token {
        return Ok(ClientAuth::Bearer(token.to_string()));
    }
    if let (Some(cert), Some(key)) = (client_cert_data, client_key_data) {
        return Ok(ClientAuth::ClientCert {
            cert: cert.to_vec(),
            key: key.to_vec(),
        });
    }
    if let (Some(cert_path), Some(key_path)) = (client_cert_file, client_key_file) {
        let cert = std::fs::read(cert_path)?;
        let key = std::fs::read(key_path)?;
        return Ok(ClientAuth::ClientCert { cert, key });
    }
    if let (Some(user), Some(pass)) = (username, password) {
        // Basic auth is encoded as a bearer-shaped "user:pass" credential; the
        // HTTP layer applying this is responsible for the `Basic ` framing.
        let raw = format!("{user}:{pass}");
        return Ok(ClientAuth::Bearer(raw));
    }
    Err(ErrorKind::CredentialUnusable("no usable credential in kubeconfig context".to_string()).into_gateway())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b64(s: &str) -> String {
        base64::engine::general_purpose::STANDARD.encode(s)
    }

    #[test]
    fn build_auth_decodes_token() {
        let access = ClusterAccess {
            path: None,
            host: "https://api.example.com".to_string(),
            ca: None,
            auth: Some(AuthSpec::Token { data: b64("s3cr3t") }),
        };
        let auth = build_auth(&access).unwrap().unwrap();
        match auth {
            ClientAuth::Bearer(token) => assert_eq!(token, "s3cr3t"),
            _ => panic!("expected bearer"),
        }
    }

    #[test]
    fn build_auth_rejects_invalid_base64() {
        let access = ClusterAccess {
            path: None,
            host: "https://api.example.com".to_string(),
            ca: None,
            auth: Some(AuthSpec::Token {
                data: "not base64!!".to_string(),
            }),
        };
        assert!(build_auth(&access).is_err());
    }

    #[test]
    fn kubeconfig_precedence_prefers_token() {
        let auth = pick_kubeconfig_auth(
            Some("tok"),
            Some(b"cert"),
            Some(b"key"),
            None,
            None,
            Some("u"),
            Some("p"),
        )
        .unwrap();
        assert!(matches!(auth, ClientAuth::Bearer(t) if t == "tok"));
    }

    #[test]
    fn kubeconfig_precedence_falls_back_to_cert_data() {
        let auth = pick_kubeconfig_auth(None, Some(b"cert"), Some(b"key"), None, None, Some("u"), Some("p"))
            .unwrap();
        assert!(matches!(auth, ClientAuth::ClientCert { .. }));
    }

    #[test]
    fn kubeconfig_with_no_usable_credential_errors() {
        let result = pick_kubeconfig_auth(None, None, None, None, None, None, None);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn static_store_lookup_and_watch_emit_initial_snapshot() {
        let dir = std::env::temp_dir().join(format!("gw-access-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let access = ClusterAccess {
            path: None,
            host: "https://api.c1.local".to_string(),
            ca: None,
            auth: Some(AuthSpec::Token { data: b64("tok") }),
        };
        std::fs::write(dir.join("c1"), serde_json::to_vec(&access).unwrap()).unwrap();

        let store = StaticAccessStore::new(&dir).unwrap();
        let looked_up = store.lookup("c1").await.unwrap();
        assert_eq!(looked_up.host, "https://api.c1.local");

        use futures::StreamExt;
        let mut stream = store.watch();
        let first = stream.next().await.unwrap();
        assert!(matches!(&first, AccessEvent::Added(name, _) if name == "c1"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn static_store_watch_emits_live_events_after_snapshot() {
        let dir = std::env::temp_dir().join(format!("gw-access-live-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let store = StaticAccessStore::new(&dir).unwrap();
        use futures::StreamExt;
        let mut stream = store.watch();

        let access = ClusterAccess {
            path: None,
            host: "https://api.c2.local".to_string(),
            ca: None,
            auth: Some(AuthSpec::Token { data: b64("tok2") }),
        };
        std::fs::write(dir.join("c2"), serde_json::to_vec(&access).unwrap()).unwrap();

        let event = tokio::time::timeout(std::time::Duration::from_secs(5), stream.next())
            .await
            .expect("timed out waiting for live access event")
            .unwrap();
        assert!(matches!(event, AccessEvent::Added(name, a) if name == "c2" && a.host == "https://api.c2.local"));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
