//! HTTP Front-end (C9, spec §4.9/§6): one GraphQL endpoint per cluster, a
//! query/mutation path returning a standard GraphQL JSON response and a
//! subscription path streamed over SSE.

use std::convert::Infallible;
use std::sync::Arc;

use async_graphql::{Request as GqlRequest, Variables};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use base64::Engine;
use futures::stream::{self, StreamExt};
use gateway_core::kube_bootstrap::client_for_request;
use gateway_core::registry::ClusterRegistry;
use gateway_core::resolver::{RequestAuth, ResolverEngine};
use serde::Deserialize;
use serde_json::Value;

use crate::errors::{AppError, ErrorKind, Result};

#[derive(Clone)]
pub struct AppState {
    registry: ClusterRegistry,
    username_claim: String,
    impersonate: bool,
    allow_insecure_tls: bool,
}

impl AppState {
    pub fn new(registry: ClusterRegistry, username_claim: String, impersonate: bool, allow_insecure_tls: bool) -> Self {
        Self {
            registry,
            username_claim,
            impersonate,
            allow_insecure_tls,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/api/clusters/{name}", get(graphql_get).post(graphql_post))
        .route("/api/clusters/{name}/graphql", get(graphql_get).post(graphql_post))
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

/// 503 until the registry has loaded at least one cluster from the catalog
/// (spec §6 "gateway not started").
async fn readyz(State(state): State<AppState>) -> StatusCode {
    if state.registry.is_empty() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    }
}

#[derive(Debug, Deserialize)]
pub struct GraphQlQueryParams {
    query: String,
    #[serde(default)]
    variables: Option<String>,
    #[serde(default, rename = "operationName")]
    operation_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct GraphQlBody {
    query: String,
    #[serde(default)]
    variables: Option<Value>,
    #[serde(default, rename = "operationName")]
    operation_name: Option<String>,
}

async fn graphql_get(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Query(params): Query<GraphQlQueryParams>,
) -> Response {
    let variables = match params.variables.as_deref().map(serde_json::from_str::<Value>).transpose() {
        Ok(v) => v,
        Err(e) => return AppError::from(ErrorKind::InvalidInput(format!("invalid variables: {e}"))).into_response(),
    };
    match execute(&state, &name, &headers, params.query, variables, params.operation_name).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn graphql_post(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Json(body): Json<GraphQlBody>,
) -> Response {
    match execute(&state, &name, &headers, body.query, body.variables, body.operation_name).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn execute(
    state: &AppState,
    cluster_name: &str,
    headers: &HeaderMap,
    query: String,
    variables: Option<Value>,
    operation_name: Option<String>,
) -> Result<Response> {
    let cluster = state
        .registry
        .route(cluster_name)
        .ok_or_else(|| gateway_core::errors::ErrorKind::NotFound(format!("cluster {cluster_name}")).into_gateway())?;

    let auth = extract_request_auth(headers, &state.username_claim, state.impersonate)?;
    let client = client_for_request(&cluster.access, state.allow_insecure_tls, &auth).await?;
    let engine = Arc::new(ResolverEngine::new(client));

    let mut request = GqlRequest::new(query);
    if let Some(op) = operation_name {
        request = request.operation_name(op);
    }
    if let Some(vars) = variables {
        request = request.variables(Variables::from_json(vars));
    }
    request = request.data(engine).data(auth);

    if wants_event_stream(headers) {
        Ok(sse_response(cluster.gql_schema.execute_stream(request)))
    } else {
        let response = cluster.gql_schema.execute(request).await;
        Ok(Json(response).into_response())
    }
}

fn wants_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("text/event-stream"))
}

/// Subscription delivery over SSE (spec §4.9/§6): each resolved value is a
/// `next` event carrying the standard GraphQL envelope, the stream ends with
/// a `complete` event. A client disconnect drops this future, which cancels
/// the underlying `watch` call (spec §4.8 "stop on disconnect").
fn sse_response(stream: impl futures::Stream<Item = async_graphql::Response> + Send + 'static) -> Response {
    let events = stream
        .map(|response| {
            let data = serde_json::to_string(&response).unwrap_or_else(|_| "null".to_string());
            Ok::<Event, Infallible>(Event::default().event("next").data(data))
        })
        .chain(stream::once(async { Ok(Event::default().event("complete")) }));

    let mut response = Sse::new(events).keep_alive(KeepAlive::default()).into_response();
    let response_headers = response.headers_mut();
    response_headers.insert(header::CACHE_CONTROL, header::HeaderValue::from_static("no-cache"));
    response_headers.insert(header::CONNECTION, header::HeaderValue::from_static("keep-alive"));
    response
}

/// Reads the bearer token and, unverified, the configured JWT claim (spec
/// §4.8): splits on `.`, base64url-decodes the payload segment, parses it as
/// JSON, and reads `claim`. No signature verification is performed — end-user
/// authentication is out of scope, the gateway only routes the caller's
/// already-authenticated identity through to the cluster.
fn extract_request_auth(headers: &HeaderMap, username_claim: &str, impersonate: bool) -> Result<RequestAuth> {
    let raw = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ErrorKind::MissingToken.into_app())?;
    let token = raw
        .strip_prefix("Bearer ")
        .or_else(|| raw.strip_prefix("bearer "))
        .unwrap_or(raw)
        .to_string();

    if token.is_empty() {
        return Err(ErrorKind::MissingToken.into_app());
    }

    let user = extract_jwt_claim(&token, username_claim).unwrap_or_default();

    Ok(RequestAuth {
        user,
        token,
        groups: Vec::new(),
        impersonate,
    })
}

fn extract_jwt_claim(token: &str, claim: &str) -> Option<String> {
    let payload_b64 = token.split('.').nth(1)?;
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(payload_b64).ok()?;
    let json: Value = serde_json::from_slice(&bytes).ok()?;
    json.get(claim)?.as_str().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn encode_claims(claims: &Value) -> String {
        let payload = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(claims.to_string());
        format!("header.{payload}.sig")
    }

    #[test]
    fn extracts_configured_claim_from_unverified_jwt() {
        let token = encode_claims(&serde_json::json!({"email": "alice@example.com"}));
        assert_eq!(extract_jwt_claim(&token, "email").as_deref(), Some("alice@example.com"));
    }

    #[test]
    fn missing_claim_yields_none() {
        let token = encode_claims(&serde_json::json!({"sub": "alice"}));
        assert_eq!(extract_jwt_claim(&token, "email"), None);
    }

    #[test]
    fn malformed_token_yields_none_without_panicking() {
        assert_eq!(extract_jwt_claim("not-a-jwt", "email"), None);
    }

    #[test]
    fn extract_request_auth_strips_bearer_prefix() {
        let mut headers = HeaderMap::new();
        let token = encode_claims(&serde_json::json!({"email": "bob@example.com"}));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {token}")).unwrap());
        let auth = extract_request_auth(&headers, "email", false).unwrap();
        assert_eq!(auth.user, "bob@example.com");
        assert_eq!(auth.token, token);
        assert!(!auth.impersonate);
    }

    #[test]
    fn extract_request_auth_rejects_missing_header() {
        let headers = HeaderMap::new();
        assert!(extract_request_auth(&headers, "email", false).is_err());
    }

    #[test]
    fn wants_event_stream_reads_accept_header() {
        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT, HeaderValue::from_static("text/event-stream"));
        assert!(wants_event_stream(&headers));
        assert!(!wants_event_stream(&HeaderMap::new()));
    }
}
