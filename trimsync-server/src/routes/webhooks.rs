//! Provider webhook endpoint. Deliveries are acknowledged immediately and
//! processed by the ingestor's debounced background loop, keeping the
//! response inside provider SLAs.

use std::collections::HashMap;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use serde::Deserialize;

use trimsync_core::config::CalendarProvider;
use trimsync_core::webhook::{IngestOutcome, WebhookRequest};

use crate::routes::AppError;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/sync/webhooks/{provider}", post(receive_webhook))
        .route("/sync/webhooks/replay", post(replay_webhooks))
}

#[derive(Deserialize)]
pub struct HandshakeParams {
    /// Microsoft Graph subscription validation handshake.
    #[serde(rename = "validationToken")]
    pub validation_token: Option<String>,
}

/// POST /sync/webhooks/:provider - Receive a push notification
async fn receive_webhook(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(params): Query<HandshakeParams>,
    headers: HeaderMap,
    body: String,
) -> Result<impl IntoResponse, AppError> {
    let Some(provider) = CalendarProvider::from_name(&provider) else {
        return Ok((StatusCode::NOT_FOUND, format!("unknown provider '{provider}'")).into_response());
    };

    // Graph validates new subscriptions by echoing a token back.
    if let Some(token) = params.validation_token {
        return Ok((StatusCode::OK, token).into_response());
    }

    let header_map: HashMap<String, String> = headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_lowercase(), v.to_string()))
        })
        .collect();
    let request = WebhookRequest {
        headers: header_map,
        body,
    };

    // Ack-then-process: ingest only validates and enqueues; the sync runs
    // on the background loop.
    let response = match state.ingestor.ingest(provider, &request) {
        IngestOutcome::Accepted => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "status": "accepted" })),
        )
            .into_response(),
        IngestOutcome::Duplicate => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "status": "duplicate" })),
        )
            .into_response(),
        IngestOutcome::Invalid(reason) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "status": "invalid", "reason": reason })),
        )
            .into_response(),
    };
    Ok(response)
}

/// POST /sync/webhooks/replay - Re-enqueue unprocessed deliveries
async fn replay_webhooks(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    let replayed = state.ingestor.replay_unprocessed();
    Ok(Json(serde_json::json!({ "replayed": replayed })))
}
