//! Export endpoints: one-shot exports, bulk exports, artifact downloads,
//! and standing subscription feeds.

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use trimsync_core::config::PrivacyLevel;
use trimsync_core::export::{ExportFormat, ExportOptions, ExportResult};

use crate::routes::AppError;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/export", post(run_export))
        .route("/bulk-export", post(run_bulk_export))
        .route("/download/{export_id}", get(download))
        .route("/subscription", post(create_subscription))
        .route("/subscription/{token}", get(subscription_feed))
}

/// Artifact metadata returned instead of inlining the payload.
#[derive(Serialize)]
pub struct ExportResponse {
    pub id: Uuid,
    pub filename: String,
    pub content_type: String,
    pub event_count: usize,
    pub generated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub download_url: String,
}

impl From<&ExportResult> for ExportResponse {
    fn from(result: &ExportResult) -> Self {
        ExportResponse {
            id: result.id,
            filename: result.filename.clone(),
            content_type: result.content_type.clone(),
            event_count: result.event_count,
            generated_at: result.generated_at,
            expires_at: result.expires_at,
            download_url: format!("/download/{}", result.id),
        }
    }
}

/// POST /export - Run one export
async fn run_export(
    State(state): State<AppState>,
    Json(options): Json<ExportOptions>,
) -> Result<Json<ExportResponse>, AppError> {
    let result = state.exports.export(&options)?;
    Ok(Json(ExportResponse::from(&result)))
}

#[derive(Deserialize)]
pub struct BulkExportRequest {
    pub exports: Vec<ExportOptions>,
}

#[derive(Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BulkExportItem {
    Ok(ExportResponse),
    Failed { error: String },
}

/// POST /bulk-export - Run several exports; items fail independently
async fn run_bulk_export(
    State(state): State<AppState>,
    Json(req): Json<BulkExportRequest>,
) -> Result<Json<Vec<BulkExportItem>>, AppError> {
    let items = state
        .exports
        .bulk_export(&req.exports)
        .iter()
        .map(|outcome| match outcome {
            Ok(result) => BulkExportItem::Ok(ExportResponse::from(result)),
            Err(err) => BulkExportItem::Failed {
                error: err.to_string(),
            },
        })
        .collect();
    Ok(Json(items))
}

/// GET /download/:export_id - Fetch a generated artifact
async fn download(
    State(state): State<AppState>,
    Path(export_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let artifact = state.exports.download(export_id)?;
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, artifact.content_type.clone()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", artifact.filename),
            ),
        ],
        artifact.content,
    ))
}

#[derive(Deserialize)]
pub struct CreateSubscriptionRequest {
    pub config_id: Uuid,
    pub format: ExportFormat,
    pub privacy_level: PrivacyLevel,
    #[serde(default = "default_past_days")]
    pub past_days: i64,
    #[serde(default = "default_future_days")]
    pub future_days: i64,
    /// Feed lifetime; omitted means the feed never expires.
    pub ttl_hours: Option<i64>,
}

fn default_past_days() -> i64 {
    30
}

fn default_future_days() -> i64 {
    90
}

#[derive(Serialize)]
pub struct SubscriptionResponse {
    pub token: String,
    pub url: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// POST /subscription - Create a standing live feed
async fn create_subscription(
    State(state): State<AppState>,
    Json(req): Json<CreateSubscriptionRequest>,
) -> Result<Json<SubscriptionResponse>, AppError> {
    let subscription = state.exports.subscribe(
        req.config_id,
        req.format,
        req.privacy_level,
        req.past_days,
        req.future_days,
        req.ttl_hours.map(Duration::hours),
    )?;
    Ok(Json(SubscriptionResponse {
        url: format!("/subscription/{}", subscription.token),
        expires_at: subscription.expires_at,
        token: subscription.token,
    }))
}

/// GET /subscription/:token - Evaluate the feed now
async fn subscription_feed(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let artifact = state.exports.feed(&token)?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, artifact.content_type.clone())],
        artifact.content,
    ))
}
