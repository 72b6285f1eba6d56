//! Sync configuration endpoints: CRUD, manual triggers, pause/resume,
//! history, health, and conflict management.

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use trimsync_core::config::{
    CalendarProvider, ConflictStrategy, PrivacyLevel, SyncConfiguration, SyncDirection,
};
use trimsync_core::conflict::{ConflictDetails, ResolutionOutcome};
use trimsync_core::monitor::{health_report, HealthReport};
use trimsync_core::providers::ProviderCredentials;
use trimsync_core::{ConflictResolver, SyncError, SyncResult};

use crate::routes::AppError;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/sync/configurations", get(list_configurations).post(create_configuration))
        .route(
            "/sync/configurations/{id}",
            get(get_configuration)
                .put(update_configuration)
                .delete(delete_configuration),
        )
        .route("/sync/credentials", post(store_credentials))
        .route("/sync/{id}/trigger", post(trigger_sync))
        .route("/sync/{id}/pause", post(pause_sync))
        .route("/sync/{id}/resume", post(resume_sync))
        .route("/sync/{id}/history", get(sync_history))
        .route("/sync/{id}/health", get(sync_health))
        .route("/sync/conflicts", get(list_conflicts))
        .route("/sync/conflicts/bulk-resolve", post(bulk_resolve))
}

/// GET /sync/configurations - List all configurations
async fn list_configurations(
    State(state): State<AppState>,
) -> Result<Json<Vec<SyncConfiguration>>, AppError> {
    Ok(Json(state.store.list_configs()))
}

/// Request body for creating a configuration
#[derive(Deserialize)]
pub struct CreateConfigurationRequest {
    pub user_id: Uuid,
    pub provider: CalendarProvider,
    pub external_calendar_id: String,
    pub sync_direction: Option<SyncDirection>,
    pub conflict_resolution: Option<ConflictStrategy>,
    pub sync_frequency_minutes: Option<u32>,
    pub privacy_level: Option<PrivacyLevel>,
    pub webhook_secret: Option<String>,
}

/// POST /sync/configurations - Create a configuration
async fn create_configuration(
    State(state): State<AppState>,
    Json(req): Json<CreateConfigurationRequest>,
) -> Result<Json<SyncConfiguration>, AppError> {
    let mut config =
        SyncConfiguration::new(req.user_id, req.provider, req.external_calendar_id);
    if let Some(direction) = req.sync_direction {
        config.sync_direction = direction;
    }
    if let Some(strategy) = req.conflict_resolution {
        config.conflict_resolution = strategy;
    }
    if let Some(frequency) = req.sync_frequency_minutes {
        if frequency == 0 {
            return Err(SyncError::Validation("sync_frequency_minutes must be positive".into()).into());
        }
        config.sync_frequency_minutes = frequency;
    }
    if let Some(privacy) = req.privacy_level {
        config.privacy_level = privacy;
    }
    config.webhook_secret = req.webhook_secret;

    state.store.insert_config(config.clone());
    Ok(Json(config))
}

/// GET /sync/configurations/:id
async fn get_configuration(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SyncConfiguration>, AppError> {
    Ok(Json(state.store.get_config(id)?))
}

/// Request body for updating a configuration; absent fields are unchanged
#[derive(Deserialize)]
pub struct UpdateConfigurationRequest {
    pub sync_direction: Option<SyncDirection>,
    pub conflict_resolution: Option<ConflictStrategy>,
    pub sync_frequency_minutes: Option<u32>,
    pub privacy_level: Option<PrivacyLevel>,
    pub webhook_secret: Option<String>,
    pub enabled: Option<bool>,
}

/// PUT /sync/configurations/:id
async fn update_configuration(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateConfigurationRequest>,
) -> Result<Json<SyncConfiguration>, AppError> {
    let mut config = state.store.get_config(id)?;
    if let Some(direction) = req.sync_direction {
        config.sync_direction = direction;
    }
    if let Some(strategy) = req.conflict_resolution {
        config.conflict_resolution = strategy;
    }
    if let Some(frequency) = req.sync_frequency_minutes {
        if frequency == 0 {
            return Err(SyncError::Validation("sync_frequency_minutes must be positive".into()).into());
        }
        config.sync_frequency_minutes = frequency;
    }
    if let Some(privacy) = req.privacy_level {
        config.privacy_level = privacy;
    }
    if let Some(secret) = req.webhook_secret {
        config.webhook_secret = Some(secret);
    }
    if let Some(enabled) = req.enabled {
        config.enabled = enabled;
        if enabled && config.next_sync.is_none() {
            config.next_sync = Some(Utc::now());
        }
    }
    config.updated_at = Utc::now();
    state.store.save_config(config.clone())?;
    Ok(Json(config))
}

/// DELETE /sync/configurations/:id - Soft-disable, preserving history
async fn delete_configuration(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SyncConfiguration>, AppError> {
    state.store.disable_config(id)?;
    state.ingestor.cancel_pending(id);
    Ok(Json(state.store.get_config(id)?))
}

/// Request body for storing provider credentials
#[derive(Deserialize)]
pub struct StoreCredentialsRequest {
    pub user_id: Uuid,
    pub provider: CalendarProvider,
    pub credentials: ProviderCredentials,
}

/// POST /sync/credentials - Store per-user provider credentials
async fn store_credentials(
    State(state): State<AppState>,
    Json(req): Json<StoreCredentialsRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    state
        .credentials
        .set_credentials(req.user_id, req.provider, req.credentials);
    Ok(Json(serde_json::json!({ "stored": true })))
}

#[derive(Deserialize)]
pub struct TriggerParams {
    /// Force a full resync, ignoring `last_sync` deltas.
    #[serde(default)]
    pub full: bool,
}

#[derive(Serialize)]
pub struct TriggerResponse {
    /// True when an in-flight cycle absorbed this trigger.
    pub coalesced: bool,
    pub result: Option<SyncResult>,
}

/// POST /sync/:id/trigger - Run a sync cycle now
async fn trigger_sync(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(params): Query<TriggerParams>,
) -> Result<Json<TriggerResponse>, AppError> {
    let result = if params.full {
        state.engine.trigger_full(id).await?
    } else {
        state.engine.trigger(id).await?
    };
    Ok(Json(TriggerResponse {
        coalesced: result.is_none(),
        result,
    }))
}

/// POST /sync/:id/pause - Disable and drop pending triggers
async fn pause_sync(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SyncConfiguration>, AppError> {
    state.store.disable_config(id)?;
    state.ingestor.cancel_pending(id);
    Ok(Json(state.store.get_config(id)?))
}

/// POST /sync/:id/resume - Re-enable and schedule immediately
async fn resume_sync(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SyncConfiguration>, AppError> {
    let mut config = state.store.get_config(id)?;
    config.enabled = true;
    config.next_sync = Some(Utc::now());
    config.updated_at = Utc::now();
    state.store.save_config(config.clone())?;
    Ok(Json(config))
}

/// GET /sync/:id/history - Past sync results, oldest first
async fn sync_history(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<SyncResult>>, AppError> {
    // 404 for unknown configurations rather than an empty history.
    let _config = state.store.get_config(id)?;
    Ok(Json(state.store.history(id)))
}

/// GET /sync/:id/health - Health score and recommendations
async fn sync_health(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<HealthReport>, AppError> {
    let config = state.store.get_config(id)?;
    let history = state.store.history(id);
    Ok(Json(health_report(&config, &history, Utc::now())))
}

#[derive(Deserialize)]
pub struct ConflictParams {
    pub config_id: Option<Uuid>,
}

/// GET /sync/conflicts - Open conflicts, optionally per configuration
async fn list_conflicts(
    State(state): State<AppState>,
    Query(params): Query<ConflictParams>,
) -> Result<Json<Vec<ConflictDetails>>, AppError> {
    Ok(Json(state.store.open_conflicts(params.config_id)))
}

/// Request body for bulk conflict resolution
#[derive(Deserialize)]
pub struct BulkResolveRequest {
    pub conflict_ids: Vec<Uuid>,
    pub strategy: ConflictStrategy,
}

#[derive(Serialize)]
pub struct BulkResolveResponse {
    pub resolved: usize,
    pub skipped: usize,
}

/// POST /sync/conflicts/bulk-resolve
///
/// Applies the strategy to each listed conflict and updates the local
/// store; the remote side converges on the next sync cycle, since the
/// resolved content carries a fresh modification timestamp.
async fn bulk_resolve(
    State(state): State<AppState>,
    Json(req): Json<BulkResolveRequest>,
) -> Result<Json<BulkResolveResponse>, AppError> {
    let resolver = ConflictResolver::default();
    let now = Utc::now();
    let mut resolved = 0;
    let mut skipped = 0;

    for conflict_id in req.conflict_ids {
        let Some(conflict) = state.store.get_conflict(conflict_id) else {
            skipped += 1;
            continue;
        };
        if !conflict.is_open() {
            // Idempotent: already-resolved conflicts are left untouched.
            skipped += 1;
            continue;
        }

        let outcome = resolver.resolve(&conflict, req.strategy, now);
        if outcome == ResolutionOutcome::Manual {
            skipped += 1;
            continue;
        }

        apply_locally(&state, &conflict, &outcome);
        state
            .store
            .record_resolution(conflict_id, ConflictResolver::applied(req.strategy, outcome, now))?;
        resolved += 1;
    }

    Ok(Json(BulkResolveResponse { resolved, skipped }))
}

/// Write the resolved content into the local store. The remote side is
/// reconciled by the next sync cycle.
fn apply_locally(state: &AppState, conflict: &ConflictDetails, outcome: &ResolutionOutcome) {
    match outcome {
        ResolutionOutcome::Keep { content, .. } | ResolutionOutcome::Merged { content } => {
            let mut event = content.clone();
            if let Some(local) = &conflict.local {
                event.id = local.id.clone();
                event.created_at = local.created_at;
            }
            if event.external_id.is_none() {
                event.external_id = conflict
                    .remote
                    .as_ref()
                    .and_then(|r| r.external_id.clone());
            }
            state.store.upsert_local_event(conflict.config_id, event);
        }
        ResolutionOutcome::Delete => {
            if let Some(local) = &conflict.local {
                state.store.remove_local_event(conflict.config_id, &local.id);
            }
        }
        ResolutionOutcome::Manual => {}
    }
}
