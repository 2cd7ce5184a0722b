use thiserror::Error;

/// Top-level error type for the gateway core. Follows the boxed-enum shape used
/// throughout this workspace so `Result<T>` stays a thin wrapper rather than a
/// bare `Box<dyn Error>`.
#[derive(Error, Debug)]
#[error(transparent)]
pub struct GatewayError(Box<ErrorKind>);

impl GatewayError {
    pub fn kind(&self) -> &ErrorKind {
        &self.0
    }
}

/// Error kinds from spec §7, mapped onto `thiserror` variants.
#[derive(Error, Debug)]
pub enum ErrorKind {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("access denied")]
    AccessDenied,

    #[error("credential unusable: {0}")]
    CredentialUnusable(String),

    #[error("discovery failed: {0}")]
    DiscoveryFailed(String),

    #[error("schema build failed: {0}")]
    SchemaBuildFailed(String),

    #[error("catalog io error: {0}")]
    CatalogIo(String),

    #[error("watch disconnected")]
    WatchDisconnected,

    #[error("cancelled")]
    Cancelled,

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("missing path annotation on logical cluster {0}")]
    MissingPathAnnotation(String),

    #[error("serde_json error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("kube client error: {0}")]
    Kube(#[from] kube::Error),

    #[error("kubeconfig error: {0}")]
    Kubeconfig(#[from] kube::config::KubeconfigError),

    #[error("in-cluster config error: {0}")]
    InCluster(#[from] kube::config::InClusterError),

    #[error("tonic transport error: {0}")]
    TonicTransport(#[from] tonic::transport::Error),

    #[error("tonic status: {0}")]
    TonicStatus(#[from] tonic::Status),
}

impl<E> From<E> for GatewayError
where
    ErrorKind: From<E>,
{
    fn from(err: E) -> Self {
        GatewayError(Box::new(ErrorKind::from(err)))
    }
}

impl ErrorKind {
    pub fn into_gateway(self) -> GatewayError {
        GatewayError(Box::new(self))
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

/// `true` for errors the reconciler should requeue rather than surface as a
/// permanent condition (spec §4.4 "Failure semantics").
pub fn is_transient(err: &GatewayError) -> bool {
    matches!(
        err.kind(),
        ErrorKind::Kube(_)
            | ErrorKind::DiscoveryFailed(_)
            | ErrorKind::CatalogIo(_)
            | ErrorKind::TonicTransport(_)
            | ErrorKind::TonicStatus(_)
    )
}
