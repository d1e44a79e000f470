//! Network-facing receiver: accepts uploads, runs detection and stereo, and
//! serves the log and stored files back.

pub mod log;
pub mod pipeline;
pub mod storage;

use anyhow::{Context, Result};
use axum::extract::{DefaultBodyLimit, Multipart, Path as UrlPath, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use scout_proto::wire::{self, ErrorResponse, ObstaclesResponse, UploadResponse};
use scout_vision::InferenceEngine;
use serde::Deserialize;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

use crate::log::ResultLog;
use crate::pipeline::{DepthSettings, Upload};
use crate::storage::Storage;

fn default_bind() -> String {
    "0.0.0.0:8888".into()
}
fn default_storage_root() -> PathBuf {
    PathBuf::from("data_results")
}
fn default_log_file() -> PathBuf {
    PathBuf::from("data_results/inference_logs.csv")
}
fn default_max_upload_mb() -> usize {
    50
}
fn default_max_concurrent_uploads() -> usize {
    2
}
fn default_limit() -> usize {
    50
}

/// `[server]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_storage_root")]
    pub storage_root: PathBuf,
    #[serde(default = "default_log_file")]
    pub log_file: PathBuf,
    /// Also write `depth/{frame}_depth.png` for frames with detections.
    #[serde(default)]
    pub save_depth_preview: bool,
    #[serde(default = "default_max_upload_mb")]
    pub max_upload_mb: usize,
    /// Uploads processed at once. Further requests wait for a slot.
    #[serde(default = "default_max_concurrent_uploads")]
    pub max_concurrent_uploads: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            storage_root: default_storage_root(),
            log_file: default_log_file(),
            save_depth_preview: false,
            max_upload_mb: default_max_upload_mb(),
            max_concurrent_uploads: default_max_concurrent_uploads(),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<Storage>,
    pub log: Arc<ResultLog>,
    pub engine: Arc<InferenceEngine>,
    pub depth: Arc<DepthSettings>,
    upload_slots: Arc<Semaphore>,
}

impl AppState {
    pub fn new(storage: Storage, log: ResultLog, engine: Arc<InferenceEngine>, depth: DepthSettings) -> Self {
        Self {
            storage: Arc::new(storage),
            log: Arc::new(log),
            engine,
            depth: Arc::new(depth),
            upload_slots: Arc::new(Semaphore::new(default_max_concurrent_uploads())),
        }
    }

    /// Caps how many uploads run inference and stereo matching at once.
    pub fn with_upload_slots(mut self, slots: usize) -> Self {
        self.upload_slots = Arc::new(Semaphore::new(slots.max(1)));
        self
    }
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound,
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, msg) = match self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::NotFound => (StatusCode::NOT_FOUND, "File not found".to_string()),
            ApiError::Internal(e) => {
                error!("ingest: {:#}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e))
            }
        };
        (status, Json(ErrorResponse::new(msg))).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::Internal(e)
    }
}

pub fn router(state: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route(wire::UPLOAD_PATH, post(upload))
        .route("/obstacles", get(obstacles))
        .route("/files/*path", get(files))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Binds and serves until `shutdown` resolves.
pub async fn serve(cfg: &ServerConfig, state: AppState, shutdown: impl Future<Output = ()> + Send + 'static) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(&cfg.bind)
        .await
        .with_context(|| format!("bind {}", cfg.bind))?;
    info!("ingest: listening on http://{}", listener.local_addr()?);
    axum::serve(listener, router(state, cfg.max_upload_mb * 1024 * 1024))
        .with_graceful_shutdown(shutdown)
        .await
        .context("http server")?;
    Ok(())
}

async fn read_upload(mut mp: Multipart) -> Result<Upload, ApiError> {
    let mut left: Option<Bytes> = None;
    let mut right: Option<Bytes> = None;
    let mut mask: Option<Bytes> = None;
    let mut lat: Option<String> = None;
    let mut lon: Option<String> = None;
    let mut frame_id: Option<String> = None;

    while let Some(field) = mp.next_field().await.map_err(|e| ApiError::BadRequest(e.body_text()))? {
        let name = field.name().unwrap_or_default().to_string();
        let bad = |e: axum::extract::multipart::MultipartError| ApiError::BadRequest(e.body_text());
        match name.as_str() {
            wire::PART_LEFT => left = Some(field.bytes().await.map_err(bad)?),
            wire::PART_RIGHT => right = Some(field.bytes().await.map_err(bad)?),
            wire::PART_MASK => mask = Some(field.bytes().await.map_err(bad)?),
            wire::FIELD_LATITUDE => lat = Some(field.text().await.map_err(bad)?),
            wire::FIELD_LONGITUDE => lon = Some(field.text().await.map_err(bad)?),
            wire::FIELD_FRAME_ID => frame_id = Some(field.text().await.map_err(bad)?),
            other => warn!("ingest: ignoring unexpected part {:?}", other),
        }
    }

    let missing = |what: &str| ApiError::BadRequest(format!("missing field: {}", what));
    let frame_id = frame_id.ok_or_else(|| missing(wire::FIELD_FRAME_ID))?;
    if frame_id.trim().is_empty() || storage::frame_stem(&frame_id).is_none() {
        return Err(ApiError::BadRequest("frame_id must not be empty".into()));
    }
    Ok(Upload {
        left: left.ok_or_else(|| missing(wire::PART_LEFT))?,
        right: right.ok_or_else(|| missing(wire::PART_RIGHT))?,
        mask,
        latitude: lat.ok_or_else(|| missing(wire::FIELD_LATITUDE))?,
        longitude: lon.ok_or_else(|| missing(wire::FIELD_LONGITUDE))?,
        frame_id,
    })
}

async fn upload(State(state): State<AppState>, mp: Multipart) -> Result<Json<UploadResponse>, ApiError> {
    let up = read_upload(mp).await?;
    let permit = state.upload_slots.clone().acquire_owned().await.context("upload slots closed")?;
    let resp = tokio::task::spawn_blocking(move || {
        let _permit = permit;
        pipeline::process_upload(&state, up)
    })
        .await
        .context("upload worker")??;
    Ok(Json(resp))
}

#[derive(Debug, Deserialize)]
struct ObstaclesQuery {
    #[serde(default = "default_limit")]
    limit: usize,
}

async fn obstacles(State(state): State<AppState>, Query(q): Query<ObstaclesQuery>) -> Result<Json<ObstaclesResponse>, ApiError> {
    let log = state.log.clone();
    let page = tokio::task::spawn_blocking(move || log.read(q.limit)).await.context("log reader")??;
    Ok(Json(ObstaclesResponse { status: "success".into(), data: page.records, skipped: page.skipped }))
}

async fn files(State(state): State<AppState>, UrlPath(path): UrlPath<String>) -> Result<Response, ApiError> {
    let Some(full) = state.storage.resolve(&path) else {
        warn!("ingest: refused file path {:?}", path);
        return Err(ApiError::BadRequest("invalid path".into()));
    };
    if !full.is_file() {
        return Err(ApiError::NotFound);
    }
    let bytes = tokio::fs::read(&full).await.with_context(|| format!("read {}", full.display()))?;
    Ok(([(header::CONTENT_TYPE, storage::content_type(&full))], bytes).into_response())
}
