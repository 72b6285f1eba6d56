//! Webhook ingestion: provider push notifications are validated,
//! deduplicated, and collapsed into debounced sync triggers.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use uuid::Uuid;

use crate::backoff;
use crate::config::CalendarProvider;
use crate::engine::SyncEngine;
use crate::error::{EngineResult, SyncError};
use crate::store::EventStore;

type HmacSha256 = Hmac<Sha256>;

/// Webhooks within this window for the same calendar collapse into one
/// sync trigger.
const DEBOUNCE_SECONDS: i64 = 3;

/// Processing attempts before a webhook is marked permanently failed.
const MAX_ATTEMPTS: u32 = 5;

/// Bound on the idempotency key set.
const SEEN_CAP: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookChange {
    Created,
    Updated,
    Deleted,
}

/// A received provider notification, retained for replay and diagnosis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: Uuid,
    pub provider: CalendarProvider,
    pub user_id: Uuid,
    pub change: WebhookChange,
    pub calendar_id: String,
    pub event_id: String,
    pub received_at: DateTime<Utc>,
    pub processed: bool,
    pub attempts: u32,
    /// Permanently failed after exhausting retries; surfaced as a warning,
    /// never silently dropped.
    pub failed: bool,
}

impl WebhookEvent {
    /// Key for atomic deduplication of provider redeliveries: identical
    /// notifications within the same minute bucket are one delivery.
    pub fn idempotency_key(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.provider,
            self.calendar_id,
            self.event_id,
            self.received_at.timestamp() / 60
        )
    }
}

/// The provider-agnostic content of one push notification.
#[derive(Debug, Clone)]
pub struct WebhookNotification {
    pub calendar_id: String,
    pub event_id: String,
    pub change: WebhookChange,
}

/// Raw webhook request as received by the HTTP layer. Header names are
/// expected lowercased.
#[derive(Debug, Clone, Default)]
pub struct WebhookRequest {
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl WebhookRequest {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Accepted,
    Duplicate,
    Invalid(String),
}

struct PendingTrigger {
    due_at: DateTime<Utc>,
    webhook_ids: Vec<Uuid>,
}

#[derive(Default)]
struct IngestState {
    seen: HashSet<String>,
    seen_order: VecDeque<String>,
    log: Vec<WebhookEvent>,
    pending: HashMap<Uuid, PendingTrigger>,
}

pub struct WebhookIngestor {
    store: Arc<EventStore>,
    engine: Arc<SyncEngine>,
    state: StdMutex<IngestState>,
    debounce: Duration,
}

impl WebhookIngestor {
    pub fn new(store: Arc<EventStore>, engine: Arc<SyncEngine>) -> Self {
        WebhookIngestor {
            store,
            engine,
            state: StdMutex::new(IngestState::default()),
            debounce: Duration::seconds(DEBOUNCE_SECONDS),
        }
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Validate, deduplicate, and enqueue one webhook delivery.
    ///
    /// Invalid or unverifiable deliveries are recorded but never acted on.
    pub fn ingest(&self, provider: CalendarProvider, request: &WebhookRequest) -> IngestOutcome {
        let notification = match parse_notification(provider, request) {
            Ok(Some(notification)) => notification,
            // A handshake (e.g. Google's `sync` probe) needs an ack only.
            Ok(None) => return IngestOutcome::Accepted,
            Err(err) => return IngestOutcome::Invalid(err.to_string()),
        };

        let config = self
            .store
            .list_configs()
            .into_iter()
            .find(|c| c.provider == provider && c.external_calendar_id == notification.calendar_id);
        let Some(config) = config else {
            return IngestOutcome::Invalid(format!(
                "no configuration for {} calendar '{}'",
                provider, notification.calendar_id
            ));
        };

        let event = WebhookEvent {
            id: Uuid::new_v4(),
            provider,
            user_id: config.user_id,
            change: notification.change,
            calendar_id: notification.calendar_id,
            event_id: notification.event_id,
            received_at: Utc::now(),
            processed: false,
            attempts: 0,
            failed: false,
        };

        if let Some(secret) = &config.webhook_secret {
            if !verify_signature(provider, secret, request) {
                tracing::warn!(provider = %provider, calendar = %event.calendar_id,
                    "webhook failed signature validation");
                // Recorded but never acted on.
                self.record_rejected(event);
                return IngestOutcome::Invalid("signature validation failed".into());
            }
        }

        if !config.enabled {
            let reason = format!("configuration {} is disabled", config.id);
            self.record_rejected(event);
            return IngestOutcome::Invalid(reason);
        }

        let key = event.idempotency_key();

        // Dedup and debounce under one lock: concurrent deliveries of the
        // same key resolve to exactly one accepted event.
        let mut state = self.state.lock().unwrap();
        if !state.seen.insert(key.clone()) {
            return IngestOutcome::Duplicate;
        }
        state.seen_order.push_back(key);
        if state.seen_order.len() > SEEN_CAP {
            if let Some(evicted) = state.seen_order.pop_front() {
                state.seen.remove(&evicted);
            }
        }

        let due_at = event.received_at + self.debounce;
        let webhook_id = event.id;
        state.log.push(event);
        state
            .pending
            .entry(config.id)
            .and_modify(|pending| {
                pending.due_at = due_at;
                pending.webhook_ids.push(webhook_id);
            })
            .or_insert(PendingTrigger {
                due_at,
                webhook_ids: vec![webhook_id],
            });

        IngestOutcome::Accepted
    }

    fn record_rejected(&self, mut event: WebhookEvent) {
        event.failed = true;
        self.state.lock().unwrap().log.push(event);
    }

    /// Re-enqueue deliveries that never completed processing.
    pub fn replay_unprocessed(&self) -> usize {
        let now = Utc::now();
        let mut state = self.state.lock().unwrap();
        let unprocessed: Vec<(Uuid, Uuid)> = state
            .log
            .iter()
            .filter(|e| !e.processed && !e.failed)
            .filter_map(|e| {
                // Config may have been removed since delivery.
                self.store
                    .list_configs()
                    .iter()
                    .find(|c| c.provider == e.provider && c.external_calendar_id == e.calendar_id)
                    .map(|c| (c.id, e.id))
            })
            .collect();
        let count = unprocessed.len();
        for (config_id, webhook_id) in unprocessed {
            state
                .pending
                .entry(config_id)
                .and_modify(|pending| pending.webhook_ids.push(webhook_id))
                .or_insert(PendingTrigger {
                    due_at: now,
                    webhook_ids: vec![webhook_id],
                });
        }
        count
    }

    /// All retained deliveries, most recent last.
    pub fn events(&self) -> Vec<WebhookEvent> {
        self.state.lock().unwrap().log.clone()
    }

    /// Number of calendars with a debounced trigger waiting.
    pub fn pending_count(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }

    /// Drop the pending trigger for a configuration (pause semantics).
    pub fn cancel_pending(&self, config_id: Uuid) {
        self.state.lock().unwrap().pending.remove(&config_id);
        self.engine.cancel_pending(config_id);
    }

    /// Fire sync triggers whose debounce window has elapsed. Trigger
    /// failures are retried with exponential backoff up to a bounded
    /// attempt count; beyond it the deliveries are marked failed.
    pub async fn process_due(&self, now: DateTime<Utc>) {
        let due: Vec<(Uuid, Vec<Uuid>)> = {
            let mut state = self.state.lock().unwrap();
            let ready: Vec<Uuid> = state
                .pending
                .iter()
                .filter(|(_, pending)| pending.due_at <= now)
                .map(|(config_id, _)| *config_id)
                .collect();
            ready
                .into_iter()
                .filter_map(|id| state.pending.remove(&id).map(|p| (id, p.webhook_ids)))
                .collect()
        };

        for (config_id, webhook_ids) in due {
            match self.engine.trigger(config_id).await {
                Ok(_) => self.mark(&webhook_ids, |event| event.processed = true),
                Err(err) => {
                    tracing::warn!(%config_id, error = %err, "webhook-triggered sync failed");
                    self.retry(config_id, webhook_ids, now);
                }
            }
        }
    }

    /// Debounce-aware processing loop; spawn once per process.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(std::time::Duration::from_millis(500));
        loop {
            ticker.tick().await;
            self.process_due(Utc::now()).await;
        }
    }

    fn retry(&self, config_id: Uuid, webhook_ids: Vec<Uuid>, now: DateTime<Utc>) {
        let mut state = self.state.lock().unwrap();
        let mut max_attempts = 0;
        for event in state.log.iter_mut().filter(|e| webhook_ids.contains(&e.id)) {
            event.attempts += 1;
            if event.attempts >= MAX_ATTEMPTS {
                event.failed = true;
                tracing::warn!(webhook = %event.id, "webhook permanently failed after {MAX_ATTEMPTS} attempts");
            } else {
                max_attempts = max_attempts.max(event.attempts);
            }
        }
        let surviving: Vec<Uuid> = state
            .log
            .iter()
            .filter(|e| webhook_ids.contains(&e.id) && !e.failed)
            .map(|e| e.id)
            .collect();
        if !surviving.is_empty() {
            let delay = backoff::webhook_backoff_seconds(max_attempts);
            state.pending.insert(
                config_id,
                PendingTrigger {
                    due_at: now + Duration::seconds(delay as i64),
                    webhook_ids: surviving,
                },
            );
        }
    }

    fn mark(&self, webhook_ids: &[Uuid], apply: impl Fn(&mut WebhookEvent)) {
        let mut state = self.state.lock().unwrap();
        for event in state.log.iter_mut().filter(|e| webhook_ids.contains(&e.id)) {
            apply(event);
        }
    }
}

// ---------------------------------------------------------------------------
// Provider-specific validation and parsing
// ---------------------------------------------------------------------------

/// Verify a webhook delivery against the configuration's shared secret.
///
/// Google channels carry the secret verbatim in `X-Goog-Channel-Token`;
/// Microsoft Graph echoes it as `clientState` in the payload; CalDAV
/// deliveries are HMAC-SHA256 signed over `{timestamp}.{body}` with a
/// constant-time comparison.
pub fn verify_signature(
    provider: CalendarProvider,
    secret: &str,
    request: &WebhookRequest,
) -> bool {
    match provider {
        CalendarProvider::Google => request.header("x-goog-channel-token") == Some(secret),
        CalendarProvider::Outlook => {
            let Ok(body) = serde_json::from_str::<serde_json::Value>(&request.body) else {
                return false;
            };
            let notifications = body["value"].as_array().cloned().unwrap_or_default();
            !notifications.is_empty()
                && notifications
                    .iter()
                    .all(|n| n["clientState"].as_str() == Some(secret))
        }
        CalendarProvider::Apple | CalendarProvider::Caldav => {
            let (Some(signature), Some(timestamp)) = (
                request.header("x-trimsync-signature"),
                request.header("x-trimsync-timestamp"),
            ) else {
                return false;
            };
            let Ok(expected) = hex::decode(signature) else {
                return false;
            };
            let mut mac = match <HmacSha256 as Mac>::new_from_slice(secret.as_bytes()) {
                Ok(mac) => mac,
                Err(_) => return false,
            };
            mac.update(timestamp.as_bytes());
            mac.update(b".");
            mac.update(request.body.as_bytes());
            mac.verify_slice(&expected).is_ok()
        }
    }
}

/// Compute the CalDAV-style delivery signature (used by tests and by
/// relays that push into the generic endpoint).
pub fn compute_signature(secret: &str, timestamp: &str, body: &str) -> String {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts any key length");
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(body.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Extract the provider-agnostic notification, or `None` for handshake
/// probes that only need an acknowledgement.
pub fn parse_notification(
    provider: CalendarProvider,
    request: &WebhookRequest,
) -> EngineResult<Option<WebhookNotification>> {
    match provider {
        CalendarProvider::Google => {
            let state = request
                .header("x-goog-resource-state")
                .ok_or_else(|| SyncError::Validation("missing x-goog-resource-state".into()))?;
            if state == "sync" {
                return Ok(None);
            }
            let change = if state == "not_exists" {
                WebhookChange::Deleted
            } else {
                WebhookChange::Updated
            };
            let resource_uri = request
                .header("x-goog-resource-uri")
                .ok_or_else(|| SyncError::Validation("missing x-goog-resource-uri".into()))?;
            let calendar_id = resource_uri
                .split("/calendars/")
                .nth(1)
                .and_then(|rest| rest.split('/').next())
                .ok_or_else(|| {
                    SyncError::Validation(format!("unrecognized resource uri '{resource_uri}'"))
                })?;
            let event_id = request.header("x-goog-resource-id").unwrap_or_default();
            Ok(Some(WebhookNotification {
                calendar_id: calendar_id.to_string(),
                event_id: event_id.to_string(),
                change,
            }))
        }
        CalendarProvider::Outlook => {
            let body: serde_json::Value = serde_json::from_str(&request.body)
                .map_err(|e| SyncError::Validation(format!("invalid notification body: {e}")))?;
            let Some(first) = body["value"].as_array().and_then(|v| v.first()) else {
                return Ok(None);
            };
            let change = match first["changeType"].as_str() {
                Some("created") => WebhookChange::Created,
                Some("deleted") => WebhookChange::Deleted,
                _ => WebhookChange::Updated,
            };
            let resource = first["resource"].as_str().unwrap_or_default();
            let calendar_id = resource
                .split("calendars('")
                .nth(1)
                .and_then(|rest| rest.split("')").next())
                .ok_or_else(|| {
                    SyncError::Validation(format!("unrecognized resource '{resource}'"))
                })?;
            let event_id = first["resourceData"]["id"].as_str().unwrap_or_default();
            Ok(Some(WebhookNotification {
                calendar_id: calendar_id.to_string(),
                event_id: event_id.to_string(),
                change,
            }))
        }
        CalendarProvider::Apple | CalendarProvider::Caldav => {
            #[derive(Deserialize)]
            struct CalDavNotification {
                calendar_id: String,
                event_id: String,
                change: WebhookChange,
            }
            let parsed: CalDavNotification = serde_json::from_str(&request.body)
                .map_err(|e| SyncError::Validation(format!("invalid notification body: {e}")))?;
            Ok(Some(WebhookNotification {
                calendar_id: parsed.calendar_id,
                event_id: parsed.event_id,
                change: parsed.change,
            }))
        }
    }
}
