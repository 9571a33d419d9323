//!
//! datapub HTTP server
//! -------------------
//! Axum-based HTTP API for the publication registry.
//!
//! Responsibilities:
//! - Bearer-token authentication for publish/unpublish, delegated to the
//!   external token validator.
//! - Listing, search, view, and download endpoints over the registry.
//! - Publish/pull/unpublish endpoints delegating to the workflow.
//! - Startup wiring of the repo catalog, registry store, and collaborator
//!   clients, plus a startup inventory log of the configured roots.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio_util::io::ReaderStream;
use tracing::{error, info};

use crate::auth::{extract_token, AuthenticatedUser, HttpTokenValidator, TokenValidator};
use crate::directory::HttpUserDirectory;
use crate::error::AppError;
use crate::mail::RegexMailValidator;
use crate::registry::SharedRegistry;
use crate::repos::RepoCatalog;
use crate::tasks::HttpTaskDispatcher;
use crate::workflow::{PublicationWorkflow, PullOutcome};

/// Startup configuration, read from the environment by `main`.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub http_port: u16,
    pub repos_conf: String,
    pub data_root: String,
    pub mode: String,
    pub admin_users: Vec<String>,
    pub auth_url: String,
    pub directory_url: String,
    pub task_url: String,
    pub version: String,
}

/// Shared server state injected into all handlers.
#[derive(Clone)]
pub struct AppState {
    pub workflow: Arc<PublicationWorkflow>,
    pub tokens: Arc<dyn TokenValidator>,
    pub version: String,
    pub mode: String,
}

fn error_response(e: &AppError) -> (StatusCode, Json<serde_json::Value>) {
    let status = StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(json!({ "error": e.message() })))
}

/// Parse offset/limit from the query string with the legacy defaults:
/// absent or non-numeric offset is 0, absent limit is 10, non-numeric limit
/// is 0 (an empty page, but the total stays correct).
fn page_params(params: &HashMap<String, String>) -> (usize, usize) {
    let offset = params
        .get("offset")
        .map(|v| v.parse::<usize>().unwrap_or(0))
        .unwrap_or(0);
    let limit = params
        .get("limit")
        .map(|v| v.parse::<usize>().unwrap_or(0))
        .unwrap_or(10);
    (offset, limit)
}

async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<AuthenticatedUser, (StatusCode, Json<serde_json::Value>)> {
    let token = extract_token(headers).map_err(|e| error_response(&e))?;
    state.tokens.validate(&token).await.map_err(|e| error_response(&e))
}

/// Start the HTTP server with collaborators built from `cfg`.
pub async fn run(cfg: ServerConfig) -> anyhow::Result<()> {
    let catalog = RepoCatalog::from_file(&cfg.repos_conf)
        .map_err(|e| anyhow::anyhow!("failed to load repository definitions: {}", e))?;
    for root in catalog.roots() {
        info!(target: "startup", "repository root: {}", root);
    }

    let registry = SharedRegistry::open(&cfg.data_root)?;
    let restricted = cfg.mode == "prod";
    let workflow = Arc::new(PublicationWorkflow::new(
        registry,
        catalog,
        Arc::new(HttpTaskDispatcher::new(cfg.task_url.clone())),
        Arc::new(HttpUserDirectory::new(cfg.directory_url.clone())),
        Arc::new(RegexMailValidator),
        cfg.admin_users.clone(),
        restricted,
    ));

    let state = AppState {
        workflow,
        tokens: Arc::new(HttpTokenValidator::new(cfg.auth_url.clone())),
        version: cfg.version.clone(),
        mode: cfg.mode.clone(),
    };

    let app = router(state);
    let addr: SocketAddr = format!("0.0.0.0:{}", cfg.http_port).parse()?;
    info!("Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// Method/path inventory served by `/api/endpoints`. Kept in sync with
/// `router` by hand.
const API_ENDPOINTS: &[(&str, &str)] = &[
    ("GET", "/api/status"),
    ("GET", "/api/endpoints"),
    ("GET", "/api/list"),
    ("GET", "/api/search"),
    ("GET", "/api/view/{id}"),
    ("GET", "/api/download/{id}"),
    ("POST", "/api/publish"),
    ("POST", "/api/pull/{id}"),
    ("DELETE", "/api/unpublish/{id}"),
];

/// Mount all API routes onto a router with the given state.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(status))
        .route("/api/endpoints", get(endpoints))
        .route("/api/list", get(list_files))
        .route("/api/search", get(search))
        .route("/api/view/{id}", get(view_file))
        .route("/api/download/{id}", get(download_file))
        .route("/api/publish", post(publish_file))
        .route("/api/pull/{id}", post(pull_file))
        .route("/api/unpublish/{id}", delete(unpublish_file))
        .with_state(state)
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "version": state.version, "mode": state.mode }))
}

async fn endpoints() -> impl IntoResponse {
    let list: Vec<serde_json::Value> = API_ENDPOINTS
        .iter()
        .map(|(method, path)| json!({ "method": method, "path": path }))
        .collect();
    Json(json!({ "endpoints": list }))
}

async fn list_files(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let (offset, limit) = page_params(&params);
    let (files, total) = state.workflow.list(offset, limit);
    (StatusCode::OK, Json(json!({ "files": files, "total": total })))
}

async fn search(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let (offset, limit) = page_params(&params);
    // `file` is the legacy name of the query parameter.
    let query = params
        .get("query")
        .or_else(|| params.get("file"))
        .map(|s| s.as_str())
        .filter(|s| !s.is_empty());
    let tags: Vec<String> = params
        .get("tags")
        .map(|raw| raw.split(',').map(|t| t.trim().to_string()).filter(|t| !t.is_empty()).collect())
        .unwrap_or_default();
    let (files, total) = state.workflow.search(query, &tags, offset, limit);
    (StatusCode::OK, Json(json!({ "files": files, "total": total })))
}

async fn view_file(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    info!(target: "datapub::api", "API call: view file {}", id);
    match state.workflow.view(&id) {
        Ok(detail) => (StatusCode::OK, Json(json!({ "file": detail }))),
        Err(e) => error_response(&e),
    }
}

async fn download_file(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    info!(target: "datapub::api", "API call: download file {}", id);
    let (path, file_name) = match state.workflow.download(&id) {
        Ok(v) => v,
        Err(e) => return error_response(&e).into_response(),
    };
    let file = match tokio::fs::File::open(&path).await {
        Ok(f) => f,
        Err(e) => {
            error!("download open failed for {}: {}", path.display(), e);
            return error_response(&AppError::not_found("missing_file", "missing file")).into_response();
        }
    };
    let stream = ReaderStream::new(file);
    let headers = [
        ("content-type", "application/octet-stream".to_string()),
        (
            "content-disposition",
            format!("attachment; filename=\"{}\"", file_name),
        ),
    ];
    (StatusCode::OK, headers, axum::body::Body::from_stream(stream)).into_response()
}

#[derive(Debug, Deserialize, Default)]
struct PublishPayload {
    path: Option<String>,
    email: Option<String>,
    contact: Option<String>,
    linked_to: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
}

async fn publish_file(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> impl IntoResponse {
    let user = match authenticate(&state, &headers).await {
        Ok(u) => u,
        Err(resp) => return resp,
    };
    if body.is_empty() {
        return (StatusCode::BAD_REQUEST, Json(json!({ "error": "Missing body" })));
    }
    let payload: PublishPayload = match serde_json::from_slice(&body) {
        Ok(p) => p,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, Json(json!({ "error": format!("Malformed body: {}", e) })));
        }
    };
    let Some(path) = payload.path.as_deref() else {
        return (StatusCode::BAD_REQUEST, Json(json!({ "error": "Missing path" })));
    };

    match state
        .workflow
        .publish(
            path,
            &user,
            payload.email.as_deref(),
            payload.contact.as_deref(),
            payload.linked_to.as_deref(),
            &payload.tags,
        )
        .await
    {
        Ok((file_id, version)) => {
            let message = if payload.email.is_some() {
                "File registering. An email will be sent to you when the file is ready."
            } else {
                "File registering. It should be ready soon"
            };
            (
                StatusCode::OK,
                Json(json!({ "message": message, "file_id": file_id, "version": version })),
            )
        }
        Err(e) => error_response(&e),
    }
}

#[derive(Debug, Deserialize, Default)]
struct PullPayload {
    email: Option<String>,
}

async fn pull_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: axum::body::Bytes,
) -> impl IntoResponse {
    let payload: PullPayload = if body.is_empty() {
        PullPayload::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(p) => p,
            Err(e) => {
                return (StatusCode::BAD_REQUEST, Json(json!({ "error": format!("Malformed body: {}", e) })));
            }
        }
    };
    match state.workflow.pull(&id, payload.email.as_deref()).await {
        Ok(PullOutcome::AlreadyAvailable) => {
            (StatusCode::OK, Json(json!({ "message": "File already available" })))
        }
        Ok(PullOutcome::Accepted) => (StatusCode::OK, Json(json!({ "message": "Ok" }))),
        Err(e) => error_response(&e),
    }
}

async fn unpublish_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let user = match authenticate(&state, &headers).await {
        Ok(u) => u,
        Err(resp) => return resp,
    };
    match state.workflow.unpublish(&id, &user) {
        Ok(()) => (StatusCode::OK, Json(json!({ "message": "File unpublished" }))),
        Err(e) => error_response(&e),
    }
}
