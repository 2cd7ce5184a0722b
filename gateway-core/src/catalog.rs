//! Schema Catalog (C5, spec §4.5/§6): the transport between Listener and
//! Gateway. Two interchangeable back-ends share the same event contract.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::warn;

use crate::errors::{ErrorKind, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogEventKind {
    Created,
    Updated,
    Removed,
}

#[derive(Debug, Clone)]
pub struct CatalogEvent {
    pub kind: CatalogEventKind,
    pub key: String,
    /// Present for `Created`/`Updated`, absent for `Removed`.
    pub bytes: Option<Vec<u8>>,
}

pub type EventStream = Pin<Box<dyn Stream<Item = CatalogEvent> + Send>>;

/// Write side of the catalog: single writer per key, required by spec §4.5.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Vec<u8>>;
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Read side: `Subscribe` first replays the current snapshot as `Created`
/// events, then streams live events (spec §4.5).
pub trait CatalogSubscriber: Send + Sync {
    fn subscribe(&self) -> EventStream;
}

const BROADCAST_CAPACITY: usize = 1024;

/// Filesystem back-end (spec §4.5/§6): one file per cluster in a directory,
/// keys never contain `/`. `Put` is write-then-rename for atomicity; watched
/// with `notify` and collapsed to key events by stripping the directory
/// prefix.
pub struct FileCatalog {
    dir: PathBuf,
    events: broadcast::Sender<CatalogEvent>,
    _watcher: notify::RecommendedWatcher,
}

impl FileCatalog {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        use notify::{RecursiveMode, Watcher};

        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let (events, _rx) = broadcast::channel(BROADCAST_CAPACITY);
        let tx = events.clone();
        let watch_dir = dir.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let event = match res {
                Ok(event) => event,
                Err(err) => {
                    warn!("file catalog watch error: {err}");
                    return;
                }
            };
            for path in &event.paths {
                let Some(key) = key_from_path(&watch_dir, path) else {
                    continue;
                };
                let catalog_event = match event.kind {
                    notify::EventKind::Remove(_) => CatalogEvent {
                        kind: CatalogEventKind::Removed,
                        key,
                        bytes: None,
                    },
                    notify::EventKind::Create(_) | notify::EventKind::Modify(_) => {
                        match std::fs::read(path) {
                            Ok(bytes) => CatalogEvent {
                                kind: CatalogEventKind::Updated,
                                key,
                                bytes: Some(bytes),
                            },
                            // Tolerate ENOENT races: the file may have been
                            // removed or renamed away between the notify
                            // event and our read (spec §6).
                            Err(_) => continue,
                        }
                    }
                    _ => continue,
                };
                let _ = tx.send(catalog_event);
            }
        })
        .map_err(|e| ErrorKind::CatalogIo(format!("starting directory watch: {e}")).into_gateway())?;
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| ErrorKind::CatalogIo(format!("watching {}: {e}", dir.display())).into_gateway())?;

        Ok(Self {
            dir,
            events,
            _watcher: watcher,
        })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }

    fn snapshot(&self) -> Result<Vec<(String, Vec<u8>)>> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let key = entry.file_name().to_string_lossy().to_string();
            match std::fs::read(entry.path()) {
                Ok(bytes) => out.push((key, bytes)),
                Err(_) => continue,
            }
        }
        Ok(out)
    }
}

fn key_from_path(dir: &Path, path: &Path) -> Option<String> {
    path.strip_prefix(dir)
        .ok()
        .and_then(|p| p.to_str())
        .map(|s| s.to_string())
}

#[async_trait]
impl CatalogStore for FileCatalog {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        let final_path = self.path_for(key);
        let tmp_path = self.dir.join(format!(".{key}.tmp-{}", std::process::id()));
        tokio::fs::write(&tmp_path, &bytes).await?;
        tokio::fs::rename(&tmp_path, &final_path).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        tokio::fs::read(self.path_for(key)).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ErrorKind::NotFound(format!("catalog key {key}")).into_gateway()
            } else {
                ErrorKind::CatalogIo(e.to_string()).into_gateway()
            }
        })
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            // A concurrent deleter already removed it; deletion is idempotent.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ErrorKind::CatalogIo(e.to_string()).into_gateway()),
        }
    }
}

impl CatalogSubscriber for FileCatalog {
    fn subscribe(&self) -> EventStream {
        let initial = self.snapshot().unwrap_or_default();
        let initial_events = initial.into_iter().map(|(key, bytes)| CatalogEvent {
            kind: CatalogEventKind::Created,
            key,
            bytes: Some(bytes),
        });
        let live = BroadcastStream::new(self.events.subscribe()).take_while(|res| {
            let keep = !matches!(res, Err(tokio_stream::wrappers::errors::BroadcastStreamRecvError::Lagged(_)));
            async move { keep }
        });
        let live = live.filter_map(|res| async move { res.ok() });
        Box::pin(futures::stream::iter(initial_events).chain(live))
    }
}

/// Streaming RPC back-end (spec §4.5/§6). This process-local half holds the
/// authoritative snapshot and fans it out; [`crate::catalog::GrpcCatalogClient`]
/// is the consuming half used by a remote Gateway process.
pub struct GrpcCatalogServer {
    snapshot: Arc<RwLock<HashMap<String, Vec<u8>>>>,
    events: broadcast::Sender<CatalogEvent>,
}

impl Default for GrpcCatalogServer {
    fn default() -> Self {
        let (events, _rx) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            snapshot: Arc::new(RwLock::new(HashMap::new())),
            events,
        }
    }
}

impl GrpcCatalogServer {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CatalogStore for GrpcCatalogServer {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        let kind = {
            let mut snapshot = self.snapshot.write().expect("lock poisoned");
            let kind = if snapshot.contains_key(key) {
                CatalogEventKind::Updated
            } else {
                CatalogEventKind::Created
            };
            snapshot.insert(key.to_string(), bytes.clone());
            kind
        };
        let _ = self.events.send(CatalogEvent {
            kind,
            key: key.to_string(),
            bytes: Some(bytes),
        });
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.snapshot
            .read()
            .expect("lock poisoned")
            .get(key)
            .cloned()
            .ok_or_else(|| ErrorKind::NotFound(format!("catalog key {key}")).into_gateway())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let removed = self.snapshot.write().expect("lock poisoned").remove(key);
        if removed.is_some() {
            let _ = self.events.send(CatalogEvent {
                kind: CatalogEventKind::Removed,
                key: key.to_string(),
                bytes: None,
            });
        }
        Ok(())
    }
}

impl CatalogSubscriber for GrpcCatalogServer {
    fn subscribe(&self) -> EventStream {
        let initial: Vec<CatalogEvent> = self
            .snapshot
            .read()
            .expect("lock poisoned")
            .iter()
            .map(|(key, bytes)| CatalogEvent {
                kind: CatalogEventKind::Created,
                key: key.clone(),
                bytes: Some(bytes.clone()),
            })
            .collect();
        let live = BroadcastStream::new(self.events.subscribe()).take_while(|res| {
            let keep = !matches!(res, Err(tokio_stream::wrappers::errors::BroadcastStreamRecvError::Lagged(_)));
            async move { keep }
        });
        let live = live.filter_map(|res| async move { res.ok() });
        Box::pin(futures::stream::iter(initial).chain(live))
    }
}

/// Adapts [`GrpcCatalogServer`] to the generated `tonic` service trait for
/// the wire-level `Subscribe` RPC (spec §6).
#[derive(Clone)]
pub struct GrpcCatalogService {
    inner: Arc<GrpcCatalogServer>,
}

impl GrpcCatalogService {
    pub fn new(inner: Arc<GrpcCatalogServer>) -> Self {
        Self { inner }
    }
}

#[tonic::async_trait]
impl gateway_proto::schema_catalog_server::SchemaCatalog for GrpcCatalogService {
    type SubscribeStream = Pin<Box<dyn Stream<Item = std::result::Result<gateway_proto::SubscribeResponse, tonic::Status>> + Send>>;

    async fn subscribe(
        &self,
        _request: tonic::Request<gateway_proto::SubscribeRequest>,
    ) -> std::result::Result<tonic::Response<Self::SubscribeStream>, tonic::Status> {
        let stream = self.inner.subscribe().map(|event| Ok(event.into()));
        Ok(tonic::Response::new(Box::pin(stream)))
    }
}

impl From<CatalogEvent> for gateway_proto::SubscribeResponse {
    fn from(event: CatalogEvent) -> Self {
        let event_type = match event.kind {
            CatalogEventKind::Created => gateway_proto::EventType::Created,
            CatalogEventKind::Updated => gateway_proto::EventType::Updated,
            CatalogEventKind::Removed => gateway_proto::EventType::Removed,
        };
        gateway_proto::SubscribeResponse {
            event_type: event_type as i32,
            cluster_name: event.key,
            schema: event
                .bytes
                .map(|b| String::from_utf8_lossy(&b).into_owned())
                .unwrap_or_default(),
        }
    }
}

/// Consuming half used by a Gateway process: subscribes to a remote
/// `GrpcCatalogServer` and translates wire events back to [`CatalogEvent`].
/// Read-only — the Gateway never writes to the catalog (spec §4.6).
pub struct GrpcCatalogClient {
    client: gateway_proto::schema_catalog_client::SchemaCatalogClient<tonic::transport::Channel>,
}

impl GrpcCatalogClient {
    pub async fn connect(endpoint: impl Into<String>) -> Result<Self> {
        let channel = tonic::transport::Endpoint::from_shared(endpoint.into())
            .map_err(|e| ErrorKind::InvalidUrl(e.to_string()).into_gateway())?
            .connect()
            .await?;
        Ok(Self {
            client: gateway_proto::schema_catalog_client::SchemaCatalogClient::new(channel),
        })
    }

    pub async fn subscribe(&self) -> Result<EventStream> {
        let mut client = self.client.clone();
        let response = client
            .subscribe(gateway_proto::SubscribeRequest {})
            .await?
            .into_inner();
        let stream = response.filter_map(|res| async move {
            let msg = res.ok()?;
            let kind = match gateway_proto::EventType::try_from(msg.event_type).ok()? {
                gateway_proto::EventType::Created => CatalogEventKind::Created,
                gateway_proto::EventType::Updated => CatalogEventKind::Updated,
                gateway_proto::EventType::Removed => CatalogEventKind::Removed,
            };
            let bytes = match kind {
                CatalogEventKind::Removed => None,
                _ => Some(msg.schema.into_bytes()),
            };
            Some(CatalogEvent {
                kind,
                key: msg.cluster_name,
                bytes,
            })
        });
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    struct TempDir(PathBuf);
    impl TempDir {
        fn new(label: &str) -> Self {
            let dir = std::env::temp_dir().join(format!("gw-catalog-{label}-{}", std::process::id()));
            let _ = std::fs::remove_dir_all(&dir);
            std::fs::create_dir_all(&dir).unwrap();
            Self(dir)
        }
    }
    impl Drop for TempDir {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.0);
        }
    }

    #[tokio::test]
    async fn file_catalog_put_get_delete_round_trips() {
        let dir = TempDir::new("put-get");
        let catalog = FileCatalog::new(&dir.0).unwrap();
        catalog.put("c1", b"hello".to_vec()).await.unwrap();
        assert_eq!(catalog.get("c1").await.unwrap(), b"hello");
        catalog.delete("c1").await.unwrap();
        assert!(catalog.get("c1").await.is_err());
    }

    #[tokio::test]
    async fn file_catalog_delete_tolerates_missing_file() {
        let dir = TempDir::new("delete-missing");
        let catalog = FileCatalog::new(&dir.0).unwrap();
        assert!(catalog.delete("never-existed").await.is_ok());
    }

    #[tokio::test]
    async fn file_catalog_subscribe_emits_initial_snapshot_before_live_events() {
        let dir = TempDir::new("subscribe");
        let catalog = FileCatalog::new(&dir.0).unwrap();
        catalog.put("c1", b"one".to_vec()).await.unwrap();

        let mut stream = catalog.subscribe();
        let first = stream.next().await.unwrap();
        assert_eq!(first.kind, CatalogEventKind::Created);
        assert_eq!(first.key, "c1");
    }

    #[tokio::test]
    async fn grpc_catalog_server_put_get_delete_and_subscribe_snapshot() {
        let server = GrpcCatalogServer::new();
        server.put("c1", b"one".to_vec()).await.unwrap();
        server.put("c2", b"two".to_vec()).await.unwrap();
        assert_eq!(server.get("c1").await.unwrap(), b"one");

        let mut stream = server.subscribe();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..2 {
            let event = stream.next().await.unwrap();
            assert_eq!(event.kind, CatalogEventKind::Created);
            seen.insert(event.key);
        }
        assert_eq!(seen, std::collections::HashSet::from(["c1".to_string(), "c2".to_string()]));

        server.delete("c1").await.unwrap();
        assert!(server.get("c1").await.is_err());
    }
}
