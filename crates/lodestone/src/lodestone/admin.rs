use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::{Arc, LazyLock},
};

use anyhow::Context;
use axum::{
    Json, Router,
    extract::{Path as UrlPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use regex::Regex;
use serde::Serialize;
use tokio::sync::watch;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::lodestone::{
    config::{self, ServerFile},
    reload::{ReloadHandle, ReloadRequest},
    telemetry,
};

static NAME_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._-]+$").expect("static regex"));

#[derive(Clone)]
pub struct AdminState {
    pub prom: telemetry::SharedPrometheusHandle,
    pub sessions: telemetry::SharedSessions,
    pub servers_dir: PathBuf,
    pub reload: ReloadHandle,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/conns", get(conns))
        .route("/reload", post(reload))
        .route("/proxies", post(create_proxy))
        .route("/proxies/{name}", post(put_proxy))
        .route("/proxies/{name}", delete(delete_proxy))
        .with_state(Arc::new(state))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

pub async fn serve_with_shutdown(
    addr: SocketAddr,
    state: AdminState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("admin: bind {addr}"))?;
    tracing::info!(admin_addr = %addr, "admin: listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|s| *s).await;
        })
        .await?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { ok: true }))
}

async fn metrics(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (StatusCode::OK, st.prom.render())
}

async fn conns(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (StatusCode::OK, Json(st.sessions.snapshot()))
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

struct ApiError(StatusCode, String);

impl ApiError {
    fn bad_request(msg: impl Into<String>) -> Self {
        Self(StatusCode::BAD_REQUEST, msg.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(ErrorResponse { error: self.1 })).into_response()
    }
}

async fn reload(State(st): State<Arc<AdminState>>) -> Result<StatusCode, ApiError> {
    st.reload
        .request(ReloadRequest::Full)
        .await
        .map_err(|err| ApiError(StatusCode::UNPROCESSABLE_ENTITY, format!("{err:#}")))?;
    Ok(StatusCode::NO_CONTENT)
}

fn valid_name(name: &str) -> bool {
    !name.starts_with('.') && NAME_RE.is_match(name)
}

/// File name for a descriptor posted without one: its main domain, with
/// wildcards made filesystem-safe.
fn name_from_domain(sf: &ServerFile) -> Option<String> {
    let first = sf.domains.first()?;
    let name = config::normalize_domain(first).replace('*', "_");
    (!name.is_empty()).then_some(name)
}

#[derive(Debug, Serialize)]
struct ProxyResponse {
    name: String,
    id: String,
}

async fn create_proxy(
    State(st): State<Arc<AdminState>>,
    Json(sf): Json<ServerFile>,
) -> Result<(StatusCode, Json<ProxyResponse>), ApiError> {
    let name = name_from_domain(&sf).ok_or_else(|| ApiError::bad_request("descriptor has no domains"))?;
    write_proxy(&st, name, sf).await
}

async fn put_proxy(
    State(st): State<Arc<AdminState>>,
    UrlPath(name): UrlPath<String>,
    Json(sf): Json<ServerFile>,
) -> Result<(StatusCode, Json<ProxyResponse>), ApiError> {
    write_proxy(&st, name, sf).await
}

/// Validates, writes `<servers_dir>/<name>.json` and applies it. The file is
/// restored to its previous state if the registry rejects the server.
async fn write_proxy(
    st: &AdminState,
    name: String,
    sf: ServerFile,
) -> Result<(StatusCode, Json<ProxyResponse>), ApiError> {
    if !valid_name(&name) {
        return Err(ApiError::bad_request(format!("invalid name {name:?}")));
    }
    let cfg = sf
        .clone()
        .into_config(Some(&name), &st.servers_dir)
        .map_err(|err| ApiError::bad_request(format!("{err:#}")))?;
    let id = cfg.id.clone();

    let path = st.servers_dir.join(format!("{name}.json"));
    let previous = tokio::fs::read(&path).await.ok();
    let body = serde_json::to_vec_pretty(&sf).map_err(|err| ApiError(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
    write_file(&path, &body)
        .await
        .map_err(|err| ApiError(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}")))?;

    if let Err(err) = st.reload.request(ReloadRequest::UpsertServer(cfg)).await {
        let restored = match &previous {
            Some(old) => tokio::fs::write(&path, old).await,
            None => tokio::fs::remove_file(&path).await,
        };
        if let Err(rerr) = restored {
            tracing::warn!(path = %path.display(), err = %rerr, "admin: rollback failed");
        }
        return Err(ApiError(StatusCode::CONFLICT, format!("{err:#}")));
    }

    tracing::info!(name = %name, server = %id, "admin: proxy written");
    let status = if previous.is_some() { StatusCode::OK } else { StatusCode::CREATED };
    Ok((status, Json(ProxyResponse { name, id })))
}

async fn write_file(path: &Path, body: &[u8]) -> anyhow::Result<()> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("create {}", dir.display()))?;
    }
    tokio::fs::write(path, body)
        .await
        .with_context(|| format!("write {}", path.display()))
}

async fn delete_proxy(
    State(st): State<Arc<AdminState>>,
    UrlPath(name): UrlPath<String>,
) -> Result<StatusCode, ApiError> {
    if !valid_name(&name) {
        return Err(ApiError::bad_request(format!("invalid name {name:?}")));
    }
    let path = config::SERVER_FILE_EXTENSIONS
        .iter()
        .map(|ext| st.servers_dir.join(format!("{name}.{ext}")))
        .find(|p| p.is_file())
        .ok_or_else(|| ApiError(StatusCode::NOT_FOUND, format!("no proxy {name:?}")))?;

    // Fall back to the stem when the file no longer parses.
    let id = config::load_server_file(&path)
        .map(|c| c.id)
        .unwrap_or_else(|_| name.clone());
    tokio::fs::remove_file(&path)
        .await
        .map_err(|err| ApiError(StatusCode::INTERNAL_SERVER_ERROR, format!("remove {}: {err}", path.display())))?;
    if let Err(err) = st.reload.request(ReloadRequest::RemoveServer(id.clone())).await {
        tracing::debug!(server = %id, err = %format!("{err:#}"), "admin: server was not live");
    }
    tracing::info!(name = %name, server = %id, "admin: proxy deleted");
    Ok(StatusCode::NO_CONTENT)
}
