use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use gateway_core::errors::ErrorKind as CoreErrorKind;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
#[error(transparent)]
pub struct AppError(Box<ErrorKind>);

#[derive(Error, Debug)]
pub enum ErrorKind {
    #[error("gateway core error: {0}")]
    Core(#[from] gateway_core::errors::GatewayError),

    #[error("missing or invalid bearer token")]
    MissingToken,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("address parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),
}

impl<E> From<E> for AppError
where
    ErrorKind: From<E>,
{
    fn from(err: E) -> Self {
        AppError(Box::new(ErrorKind::from(err)))
    }
}

impl ErrorKind {
    pub fn into_app(self) -> AppError {
        AppError(Box::new(self))
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

/// Status codes follow spec §6/§7: `NotFound` (unknown cluster) -> 404,
/// a missing/invalid bearer token -> 401, malformed input -> 400. `AccessDenied`
/// is raised inside GraphQL resolver execution (spec §4.8) and surfaces as a
/// GraphQL error at HTTP 200 there, not through this path.
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &*self.0 {
            ErrorKind::Core(err) => match err.kind() {
                CoreErrorKind::NotFound(_) => StatusCode::NOT_FOUND,
                CoreErrorKind::AccessDenied => StatusCode::OK,
                CoreErrorKind::InvalidInput(_) => StatusCode::BAD_REQUEST,
                CoreErrorKind::CredentialUnusable(_) => StatusCode::UNAUTHORIZED,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ErrorKind::MissingToken => StatusCode::UNAUTHORIZED,
            ErrorKind::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ErrorKind::Io(_) | ErrorKind::AddrParse(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let message = self.to_string();
        (status, Json(ErrorBody { error: message })).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
