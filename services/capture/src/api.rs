use crate::config::ApiConfig;
use crate::error::PipelineError;
use crate::metadata_store::{ImageQuery, ImageRecord, MetadataStore};
use crate::pipeline::CapturePipeline;
use crate::settings::{RuntimeSettings, SettingsUpdate, SharedSettings};
use crate::storage_paths::StoragePaths;
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{
        rejection::{PathRejection, QueryRejection},
        Path, Query, State,
    },
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, warn};

const API_KEY_HEADER: &str = "x-api-key";

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<CapturePipeline>,
    pub store: Arc<MetadataStore>,
    pub settings: SharedSettings,
    pub admin_api_key: Option<String>,
    pub public_base_url: Option<String>,
}

impl AppState {
    pub fn new(pipeline: Arc<CapturePipeline>, config: &ApiConfig) -> Self {
        Self {
            store: pipeline.store().clone(),
            settings: pipeline.settings().clone(),
            pipeline,
            admin_api_key: config.admin_api_key.clone(),
            public_base_url: config.public_base_url.clone(),
        }
    }
}

/// Image metadata in API responses
#[derive(Debug, Serialize, Deserialize)]
pub struct ImageResponse {
    pub id: i64,
    pub filename: String,
    pub timestamp: DateTime<FixedOffset>,
    pub image_url: String,
    pub thumbnail_url: String,
    pub filesize: u64,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub note: Option<String>,
}

impl ImageResponse {
    pub fn from_record(record: ImageRecord, base_url: &str) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            image_url: format!("{}/images/{}", base, record.filename),
            thumbnail_url: format!("{}/thumbnails/{}", base, record.filename),
            id: record.id,
            filename: record.filename,
            timestamp: record.timestamp,
            filesize: record.filesize,
            width: record.width,
            height: record.height,
            note: record.note,
        }
    }
}

/// Query parameters for the image list
#[derive(Debug, Deserialize)]
pub struct ListParams {
    /// Local calendar day, `YYYY-MM-DD`
    pub date: Option<String>,
    pub page: Option<i64>,
    pub per_page: Option<i64>,
}

/// Image list response
#[derive(Debug, Serialize, Deserialize)]
pub struct ListResponse {
    pub page: u32,
    pub per_page: u32,
    pub total: i64,
    pub items: Vec<ImageResponse>,
}

/// Credentials accepted as a query parameter on settings writes
#[derive(Debug, Deserialize)]
pub struct AuthParams {
    pub api_key: Option<String>,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

impl From<PipelineError> for ErrorResponse {
    fn from(e: PipelineError) -> Self {
        Self {
            error: e.code().to_string(),
            detail: Some(e.to_string()),
        }
    }
}

fn status_for(e: &PipelineError) -> StatusCode {
    match e {
        PipelineError::Validation(_) => StatusCode::BAD_REQUEST,
        PipelineError::Auth => StatusCode::UNAUTHORIZED,
        PipelineError::NotFound(_) => StatusCode::NOT_FOUND,
        PipelineError::Constraint(_) => StatusCode::CONFLICT,
        PipelineError::Filesystem { .. }
        | PipelineError::Capture(_)
        | PipelineError::Codec(_)
        | PipelineError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn api_error(e: PipelineError) -> ApiError {
    let status = status_for(&e);
    if status.is_server_error() {
        error!(code = e.code(), error = %e, "Request failed");
    }
    (status, Json(e.into()))
}

/// Base for image links: the configured public URL, else the request host plus `/api`
fn base_url(state: &AppState, headers: &HeaderMap) -> String {
    if let Some(base) = &state.public_base_url {
        return base.trim_end_matches('/').to_string();
    }

    let host = headers
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok());
    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("http");

    match host {
        Some(host) => format!("{}://{}/api", scheme, host),
        None => "/api".to_string(),
    }
}

/// Create the API router
pub fn create_router(state: AppState, paths: &StoragePaths, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<HeaderValue> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    let api = Router::new()
        .route("/latest", get(latest_image))
        .route("/list", get(list_images))
        .route("/capture", post(capture_image))
        .route("/image/:id", get(get_image))
        .route("/settings", get(get_settings).post(update_settings))
        .nest_service("/images", ServeDir::new(paths.images_dir()))
        .nest_service("/thumbnails", ServeDir::new(paths.thumbs_dir()));

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .nest("/api", api)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "capture-service"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match sqlx::query("SELECT 1").fetch_one(state.store.pool()).await {
        Ok(_) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "database": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

/// Most recent capture
#[instrument(skip(state, headers))]
async fn latest_image(State(state): State<AppState>, headers: HeaderMap) -> Response {
    match state.store.latest().await {
        Ok(Some(record)) => {
            Json(ImageResponse::from_record(record, &base_url(&state, &headers))).into_response()
        }
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "message": "no_images" })),
        )
            .into_response(),
        Err(e) => api_error(e).into_response(),
    }
}

/// Paginated listing, newest first
#[instrument(skip(state, headers))]
async fn list_images(
    State(state): State<AppState>,
    headers: HeaderMap,
    params: Result<Query<ListParams>, QueryRejection>,
) -> Result<Json<ListResponse>, ApiError> {
    let Query(params) =
        params.map_err(|e| api_error(PipelineError::Validation(e.body_text())))?;
    let query = ImageQuery {
        date: params.date.filter(|d| !d.trim().is_empty()),
        page: clamp_page_param(params.page, 1),
        per_page: clamp_page_param(params.per_page, 50),
    };

    let page = state.store.list(&query).await.map_err(api_error)?;
    let base = base_url(&state, &headers);

    Ok(Json(ListResponse {
        page: query.page,
        per_page: query.per_page,
        total: page.total,
        items: page
            .items
            .into_iter()
            .map(|r| ImageResponse::from_record(r, &base))
            .collect(),
    }))
}

fn clamp_page_param(value: Option<i64>, default: u32) -> u32 {
    value
        .map(|v| v.clamp(1, i64::from(u32::MAX)) as u32)
        .unwrap_or(default)
}

/// Synchronous on-demand capture
#[instrument(skip(state, headers))]
async fn capture_image(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ImageResponse>, ApiError> {
    let record = state.pipeline.capture_one().await.map_err(|e| {
        if matches!(e, PipelineError::Constraint(_)) {
            warn!(error = %e, "On-demand capture collided with a previous capture");
        }
        api_error(e)
    })?;

    Ok(Json(ImageResponse::from_record(
        record,
        &base_url(&state, &headers),
    )))
}

/// Single image metadata
#[instrument(skip(state, headers))]
async fn get_image(
    State(state): State<AppState>,
    headers: HeaderMap,
    id: Result<Path<i64>, PathRejection>,
) -> Result<Json<ImageResponse>, ApiError> {
    let Path(id) = id.map_err(|e| api_error(PipelineError::Validation(e.body_text())))?;
    let record = state
        .store
        .get_by_id(id)
        .await
        .map_err(api_error)?
        .ok_or_else(|| api_error(PipelineError::NotFound(id)))?;

    Ok(Json(ImageResponse::from_record(
        record,
        &base_url(&state, &headers),
    )))
}

async fn get_settings(State(state): State<AppState>) -> Json<RuntimeSettings> {
    Json(state.settings.snapshot())
}

/// Apply a partial settings update; requires the admin key
#[instrument(skip(state, headers, auth, body))]
async fn update_settings(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(auth): Query<AuthParams>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let provided = headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .or(auth.api_key.as_deref());

    let authorized = match (&state.admin_api_key, provided) {
        (Some(expected), Some(provided)) => !expected.is_empty() && expected == provided,
        _ => false,
    };
    if !authorized {
        warn!("Rejected settings update without a valid admin key");
        return Err(api_error(PipelineError::Auth));
    }

    let update: SettingsUpdate = if body.iter().all(u8::is_ascii_whitespace) {
        SettingsUpdate::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| api_error(PipelineError::Validation(format!("invalid JSON body: {e}"))))?
    };

    state.settings.apply(update).map_err(api_error)?;

    Ok(Json(serde_json::json!({ "status": "ok" })))
}

/// Start the API server and serve until `shutdown` is cancelled
pub async fn start_api_server(
    state: AppState,
    paths: &StoragePaths,
    config: &ApiConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let router = create_router(state, paths, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting capture API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("API server error")?;

    Ok(())
}
