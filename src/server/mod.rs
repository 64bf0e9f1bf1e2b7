//! HTTP surface: single-dataset uploads plus the `/multifile` workspace.

mod types;

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, State};
use axum::http::header::{ACCEPT, CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderValue, Method};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use bytes::Bytes;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{fmt, EnvFilter};

pub use self::types::AppError;
use self::types::{ChunkParams, CurrentResponse, HealthResponse, RemoveResponse};
use crate::config::{LimitsSection, ServiceConfig};
use crate::error::DataslotError;
use crate::query::{OpsRequest, QueryService, ResultGrid, SqlRequest};
use crate::registry::{DatasetStore, StoredDataset, Workspace, WorkspaceUpload};
use crate::storage::{check_declared_size, Chunk};

/// Errors that stop the server from starting or running.
#[derive(Debug, Error)]
pub enum ServerError {
    /// A data directory could not be opened.
    #[error("failed to open data directory: {0}")]
    Open(#[from] DataslotError),
    /// Binding or serving failed.
    #[error("server i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Shared handler state.
#[derive(Debug, Clone)]
pub struct AppState {
    workspace: Arc<Workspace>,
    store: Arc<DatasetStore>,
    queries: QueryService,
    limits: LimitsSection,
    allow_origins: Vec<String>,
}

impl AppState {
    /// Opens both stores under the configured data directory.
    pub fn open(config: &ServiceConfig) -> Result<Self, ServerError> {
        let workspace = Arc::new(Workspace::open(config)?);
        let store = Arc::new(DatasetStore::open(config)?);
        let queries = QueryService::new(Arc::clone(&workspace), &config.query);
        Ok(Self {
            workspace,
            store,
            queries,
            limits: config.limits.clone(),
            allow_origins: config.server.allow_origins.clone(),
        })
    }
}

/// Opens the stores and serves until ctrl-c.
pub async fn serve(config: ServiceConfig) -> Result<(), ServerError> {
    install_tracing_subscriber();

    let state = AppState::open(&config)?;
    let app = build_router(state);
    let addr = SocketAddr::from((config.server.host, config.server.port));
    let listener = TcpListener::bind(addr).await?;

    tracing::info!(
        %addr,
        data_dir = %config.storage.data_dir.display(),
        allow_origins = ?config.server.allow_origins,
        "server.listening"
    );

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

/// Routes, body limit, CORS, and request tracing.
pub fn build_router(state: AppState) -> Router {
    let body_limit = usize::try_from(state.limits.soft_max_upload_bytes).unwrap_or(usize::MAX);
    let cors = build_cors_layer(&state.allow_origins);

    let multifile = Router::new()
        .route("/upload", post(workspace_upload))
        .route("/current", get(workspace_current).delete(workspace_clear))
        .route("/current/:dataset_id", delete(workspace_remove))
        .route("/chunk", get(workspace_chunk))
        .route("/sql", post(workspace_sql))
        .route("/ops", post(workspace_ops));

    let mut router = Router::new()
        .route("/health", get(health_handler))
        .route("/upload", post(store_upload))
        .route("/datasets/:dataset_id", get(store_summary))
        .nest("/multifile", multifile)
        .layer(DefaultBodyLimit::max(body_limit));

    if let Some(layer) = cors {
        router = router.layer(layer);
    }

    router.with_state(state).layer(TraceLayer::new_for_http())
}

fn build_cors_layer(origins: &[String]) -> Option<CorsLayer> {
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| {
            let trimmed = origin.trim().trim_end_matches('/');
            match HeaderValue::from_str(trimmed) {
                Ok(value) if !trimmed.is_empty() => Some(value),
                _ => {
                    tracing::warn!(%origin, "server.cors.invalid_origin");
                    None
                }
            }
        })
        .collect();
    if allowed.is_empty() {
        return None;
    }
    Some(
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(allowed))
            .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
            .allow_headers([ACCEPT, CONTENT_TYPE]),
    )
}

async fn blocking<T, F>(job: F) -> Result<T, AppError>
where
    F: FnOnce() -> crate::Result<T> + Send + 'static,
    T: Send + 'static,
{
    Ok(task::spawn_blocking(job).await??)
}

fn declared_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
}

async fn read_file_field(mut multipart: Multipart) -> Result<(String, Bytes), AppError> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some("file") {
            continue;
        }
        let name = field.file_name().unwrap_or_default().to_string();
        let bytes = field.bytes().await?;
        return Ok((name, bytes));
    }
    Err(AppError::MissingFile)
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn store_upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<Json<StoredDataset>, AppError> {
    check_declared_size(declared_length(&headers), &state.limits)?;
    let (name, bytes) = read_file_field(multipart).await?;
    let store = Arc::clone(&state.store);
    let stored = blocking(move || store.upload(&name, &bytes)).await?;
    Ok(Json(stored))
}

async fn store_summary(
    State(state): State<AppState>,
    Path(dataset_id): Path<String>,
) -> Result<Json<StoredDataset>, AppError> {
    let store = Arc::clone(&state.store);
    let stored = blocking(move || store.summary(&dataset_id)).await?;
    Ok(Json(stored))
}

async fn workspace_upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<Json<WorkspaceUpload>, AppError> {
    check_declared_size(declared_length(&headers), &state.limits)?;
    let (name, bytes) = read_file_field(multipart).await?;
    let workspace = Arc::clone(&state.workspace);
    let upload = blocking(move || workspace.register_or_reuse(&name, &bytes)).await?;
    Ok(Json(upload))
}

async fn workspace_current(
    State(state): State<AppState>,
) -> Result<Json<CurrentResponse>, AppError> {
    let workspace = Arc::clone(&state.workspace);
    let datasets = blocking(move || workspace.current()).await?;
    Ok(Json(CurrentResponse { datasets }))
}

async fn workspace_remove(
    State(state): State<AppState>,
    Path(dataset_id): Path<String>,
) -> Result<Json<RemoveResponse>, AppError> {
    let workspace = Arc::clone(&state.workspace);
    let slot_count = blocking(move || workspace.remove(&dataset_id)).await?;
    Ok(Json(RemoveResponse {
        ok: true,
        slot_count,
    }))
}

async fn workspace_clear(State(state): State<AppState>) -> Result<Json<RemoveResponse>, AppError> {
    let workspace = Arc::clone(&state.workspace);
    blocking(move || workspace.remove_all()).await?;
    Ok(Json(RemoveResponse {
        ok: true,
        slot_count: 0,
    }))
}

async fn workspace_chunk(
    State(state): State<AppState>,
    Query(params): Query<ChunkParams>,
) -> Result<Json<Chunk>, AppError> {
    let workspace = Arc::clone(&state.workspace);
    let chunk = blocking(move || workspace.chunk(&params.dataset_id, params.request())).await?;
    Ok(Json(chunk))
}

async fn workspace_sql(
    State(state): State<AppState>,
    payload: Result<Json<SqlRequest>, JsonRejection>,
) -> Result<Json<ResultGrid>, AppError> {
    let Json(request) = payload.map_err(AppError::sql_body)?;
    Ok(Json(state.queries.sql(request).await?))
}

async fn workspace_ops(
    State(state): State<AppState>,
    payload: Result<Json<OpsRequest>, JsonRejection>,
) -> Result<Json<ResultGrid>, AppError> {
    let Json(request) = payload.map_err(AppError::ops_body)?;
    Ok(Json(state.queries.ops(request).await?))
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("server.shutdown"),
        Err(err) => tracing::error!(?err, "failed to listen for shutdown signal"),
    }
}

/// Installs the `fmt` subscriber once, honoring `RUST_LOG` (default `info`).
pub fn install_tracing_subscriber() {
    static INSTALLED: OnceLock<()> = OnceLock::new();
    INSTALLED.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = fmt().with_env_filter(filter).with_writer(std::io::stderr).try_init();
    });
}
