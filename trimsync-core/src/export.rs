//! Calendar export: date-bounded, privacy-filtered projections of the
//! event store serialized as iCal, CSV, JSON, or provider-native payloads,
//! plus standing subscription feeds re-evaluated on each fetch.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use chrono::{DateTime, Duration, Utc};
use icalendar::{Component, EventLike};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::PrivacyLevel;
use crate::error::{EngineResult, SyncError};
use crate::event::{EventStatus, SyncEvent};
use crate::store::EventStore;

/// How long a generated artifact stays downloadable.
const ARTIFACT_TTL_HOURS: i64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    Ical,
    Csv,
    Json,
    /// Provider-shaped JSON (Google Calendar API event resources).
    ProviderNative,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Ical => "ics",
            ExportFormat::Csv => "csv",
            ExportFormat::Json | ExportFormat::ProviderNative => "json",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ExportFormat::Ical => "text/calendar; charset=utf-8",
            ExportFormat::Csv => "text/csv; charset=utf-8",
            ExportFormat::Json | ExportFormat::ProviderNative => "application/json",
        }
    }
}

/// A read-only projection request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportOptions {
    pub config_id: Uuid,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub format: ExportFormat,
    pub privacy_level: PrivacyLevel,
    #[serde(default)]
    pub include_cancelled: bool,
}

/// A generated artifact. Derived state, cached briefly for download.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportResult {
    pub id: Uuid,
    pub filename: String,
    pub content_type: String,
    pub content: String,
    pub event_count: usize,
    pub generated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// A standing export definition addressed by an unguessable token. The
/// date window is rolling: it is recomputed on every fetch, so the feed
/// stays live rather than a static snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportSubscription {
    pub token: String,
    pub config_id: Uuid,
    pub format: ExportFormat,
    pub privacy_level: PrivacyLevel,
    pub past_days: i64,
    pub future_days: i64,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

pub struct ExportService {
    store: Arc<EventStore>,
    artifacts: StdMutex<HashMap<Uuid, ExportResult>>,
    subscriptions: StdMutex<HashMap<String, ExportSubscription>>,
}

impl ExportService {
    pub fn new(store: Arc<EventStore>) -> Self {
        ExportService {
            store,
            artifacts: StdMutex::new(HashMap::new()),
            subscriptions: StdMutex::new(HashMap::new()),
        }
    }

    /// Run one export and cache the artifact for download.
    pub fn export(&self, options: &ExportOptions) -> EngineResult<ExportResult> {
        // Verify the configuration exists before projecting.
        let _config = self.store.get_config(options.config_id)?;

        let mut events: Vec<SyncEvent> = self
            .store
            .local_events(options.config_id)
            .into_iter()
            .filter(|e| e.start >= options.from && e.start < options.to)
            .filter(|e| options.include_cancelled || e.status != EventStatus::Cancelled)
            .map(|e| redact(e, options.privacy_level))
            .collect();
        events.sort_by_key(|e| e.start);

        let content = match options.format {
            ExportFormat::Ical => serialize_ical(&events),
            ExportFormat::Csv => serialize_csv(&events),
            ExportFormat::Json => serde_json::to_string_pretty(&events)?,
            ExportFormat::ProviderNative => {
                let items: Vec<serde_json::Value> = events
                    .iter()
                    .map(crate::providers::google::event_to_google)
                    .collect();
                serde_json::to_string_pretty(&serde_json::json!({ "items": items }))?
            }
        };

        let generated_at = Utc::now();
        let result = ExportResult {
            id: Uuid::new_v4(),
            filename: format!(
                "calendar-{}-{}.{}",
                options.from.format("%Y%m%d"),
                options.to.format("%Y%m%d"),
                options.format.extension()
            ),
            content_type: options.format.content_type().to_string(),
            content,
            event_count: events.len(),
            generated_at,
            expires_at: Some(generated_at + Duration::hours(ARTIFACT_TTL_HOURS)),
        };

        self.artifacts
            .lock()
            .unwrap()
            .insert(result.id, result.clone());
        Ok(result)
    }

    /// Run several exports; each item succeeds or fails independently.
    pub fn bulk_export(&self, requests: &[ExportOptions]) -> Vec<EngineResult<ExportResult>> {
        requests.iter().map(|options| self.export(options)).collect()
    }

    /// Fetch a cached artifact by id; expired artifacts are gone.
    pub fn download(&self, id: Uuid) -> EngineResult<ExportResult> {
        let mut artifacts = self.artifacts.lock().unwrap();
        match artifacts.get(&id) {
            Some(artifact) if artifact.expires_at.is_none_or(|at| at > Utc::now()) => {
                Ok(artifact.clone())
            }
            Some(_) => {
                artifacts.remove(&id);
                Err(SyncError::ExportNotFound(id.to_string()))
            }
            None => Err(SyncError::ExportNotFound(id.to_string())),
        }
    }

    /// Create a standing feed definition and return it with its token.
    pub fn subscribe(
        &self,
        config_id: Uuid,
        format: ExportFormat,
        privacy_level: PrivacyLevel,
        past_days: i64,
        future_days: i64,
        ttl: Option<Duration>,
    ) -> EngineResult<ExportSubscription> {
        let _config = self.store.get_config(config_id)?;
        let now = Utc::now();
        let subscription = ExportSubscription {
            token: Uuid::new_v4().simple().to_string(),
            config_id,
            format,
            privacy_level,
            past_days,
            future_days,
            created_at: now,
            expires_at: ttl.map(|ttl| now + ttl),
        };
        self.subscriptions
            .lock()
            .unwrap()
            .insert(subscription.token.clone(), subscription.clone());
        Ok(subscription)
    }

    /// Evaluate a subscription feed. Each fetch projects the current store
    /// state over the rolling window.
    pub fn feed(&self, token: &str) -> EngineResult<ExportResult> {
        let subscription = {
            let subscriptions = self.subscriptions.lock().unwrap();
            subscriptions
                .get(token)
                .cloned()
                .ok_or_else(|| SyncError::ExportNotFound(token.to_string()))?
        };
        if subscription.expires_at.is_some_and(|at| at <= Utc::now()) {
            self.subscriptions.lock().unwrap().remove(token);
            return Err(SyncError::ExportNotFound(token.to_string()));
        }

        let now = Utc::now();
        self.export(&ExportOptions {
            config_id: subscription.config_id,
            from: now - Duration::days(subscription.past_days),
            to: now + Duration::days(subscription.future_days),
            format: subscription.format,
            privacy_level: subscription.privacy_level,
            include_cancelled: false,
        })
    }
}

/// Apply the privacy tier to one event.
///
/// `business` strips client PII (attendees, notes); `minimal` keeps the
/// time window and service name only; `anonymous` leaves no identifying
/// text at all.
fn redact(mut event: SyncEvent, level: PrivacyLevel) -> SyncEvent {
    match level {
        PrivacyLevel::Full => event,
        PrivacyLevel::Business => {
            event.attendees.clear();
            event.description = None;
            event
        }
        PrivacyLevel::Minimal => {
            event.attendees.clear();
            event.description = None;
            event.location = None;
            event
        }
        PrivacyLevel::Anonymous => {
            event.title = "Appointment".to_string();
            event.description = None;
            event.location = None;
            event.attendees.clear();
            event
        }
    }
}

/// RFC 5545 subset: VEVENT with UID, DTSTAMP, DTSTART/DTEND, SUMMARY,
/// DESCRIPTION, LOCATION, ATTENDEE.
fn serialize_ical(events: &[SyncEvent]) -> String {
    let mut calendar = icalendar::Calendar::new();
    for event in events {
        let mut ics_event = icalendar::Event::new();
        ics_event.uid(&format!("{}@trimsync", event.id));
        ics_event.summary(&event.title);
        ics_event.add_property(
            "DTSTAMP",
            event.modified_at.format("%Y%m%dT%H%M%SZ").to_string(),
        );
        ics_event.add_property("DTSTART", event.start.format("%Y%m%dT%H%M%SZ").to_string());
        ics_event.add_property("DTEND", event.end.format("%Y%m%dT%H%M%SZ").to_string());
        if let Some(ref description) = event.description {
            ics_event.description(description);
        }
        if let Some(ref location) = event.location {
            ics_event.location(location);
        }
        match event.status {
            EventStatus::Confirmed => {}
            EventStatus::Tentative => {
                ics_event.add_property("STATUS", "TENTATIVE");
            }
            EventStatus::Cancelled => {
                ics_event.add_property("STATUS", "CANCELLED");
            }
        }
        for attendee in &event.attendees {
            let prop = icalendar::Property::new("ATTENDEE", format!("mailto:{attendee}"));
            ics_event.append_multi_property(prop);
        }
        calendar.push(ics_event.done());
    }
    calendar.done().to_string()
}

/// Fixed column schema; revenue-adjacent fields are never exported.
fn serialize_csv(events: &[SyncEvent]) -> String {
    let mut out = String::from("date,start_time,end_time,service,location,status\n");
    for event in events {
        out.push_str(&format!(
            "{},{},{},{},{},{}\n",
            event.start.format("%Y-%m-%d"),
            event.start.format("%H:%M"),
            event.end.format("%H:%M"),
            csv_field(&event.title),
            csv_field(event.location.as_deref().unwrap_or("")),
            event.status.as_str(),
        ));
    }
    out
}

fn csv_field(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CalendarProvider, SyncConfiguration};
    use chrono::TimeZone;

    fn seeded_service() -> (ExportService, Uuid) {
        let store = Arc::new(EventStore::new());
        let config = SyncConfiguration::new(Uuid::new_v4(), CalendarProvider::Google, "primary");
        let config_id = config.id;
        store.insert_config(config);

        for (i, (title, client)) in [
            ("Haircut", "sam@example.com"),
            ("Beard trim", "lee@example.com"),
            ("Fade cut", "ana@example.com"),
        ]
        .iter()
        .enumerate()
        {
            let start = Utc
                .with_ymd_and_hms(2025, 1, 10, 9 + i as u32, 0, 0)
                .unwrap();
            let mut event = SyncEvent::new(*title, start, start + Duration::minutes(30));
            event.attendees = vec![client.to_string()];
            event.description = Some(format!("Notes for {client}"));
            event.location = Some("Main St shop".into());
            store.upsert_local_event(config_id, event);
        }

        (ExportService::new(store), config_id)
    }

    fn options(config_id: Uuid, format: ExportFormat, privacy: PrivacyLevel) -> ExportOptions {
        ExportOptions {
            config_id,
            from: Utc.with_ymd_and_hms(2025, 1, 10, 0, 0, 0).unwrap(),
            to: Utc.with_ymd_and_hms(2025, 1, 11, 0, 0, 0).unwrap(),
            format,
            privacy_level: privacy,
            include_cancelled: false,
        }
    }

    #[test]
    fn anonymous_export_contains_no_identifying_text() {
        let (service, config_id) = seeded_service();
        let result = service
            .export(&options(config_id, ExportFormat::Json, PrivacyLevel::Anonymous))
            .unwrap();

        assert_eq!(result.event_count, 3);
        // Three generic placeholders, no client names or contact fields.
        assert_eq!(result.content.matches("Appointment").count(), 3);
        for needle in ["sam@", "lee@", "ana@", "Haircut", "Notes for", "Main St"] {
            assert!(
                !result.content.contains(needle),
                "anonymous payload leaked '{needle}'"
            );
        }
    }

    #[test]
    fn business_export_strips_client_pii_only() {
        let (service, config_id) = seeded_service();
        let result = service
            .export(&options(config_id, ExportFormat::Json, PrivacyLevel::Business))
            .unwrap();

        assert!(result.content.contains("Haircut"));
        assert!(result.content.contains("Main St shop"));
        assert!(!result.content.contains("sam@example.com"));
        assert!(!result.content.contains("Notes for"));
    }

    #[test]
    fn ical_export_is_rfc5545_subset() {
        let (service, config_id) = seeded_service();
        let result = service
            .export(&options(config_id, ExportFormat::Ical, PrivacyLevel::Full))
            .unwrap();

        assert_eq!(result.content.matches("BEGIN:VEVENT").count(), 3);
        assert!(result.content.contains("SUMMARY:Haircut"));
        assert!(result.content.contains("ATTENDEE:mailto:sam@example.com"));
        assert!(result.content.contains("DTSTART:20250110T090000Z"));
    }

    #[test]
    fn csv_export_has_fixed_columns() {
        let (service, config_id) = seeded_service();
        let result = service
            .export(&options(config_id, ExportFormat::Csv, PrivacyLevel::Minimal))
            .unwrap();

        let mut lines = result.content.lines();
        assert_eq!(
            lines.next().unwrap(),
            "date,start_time,end_time,service,location,status"
        );
        assert_eq!(lines.clone().count(), 3);
        assert!(lines.next().unwrap().starts_with("2025-01-10,09:00,09:30,Haircut,"));
    }

    #[test]
    fn date_range_bounds_the_projection() {
        let (service, config_id) = seeded_service();
        let mut narrow = options(config_id, ExportFormat::Json, PrivacyLevel::Full);
        narrow.to = Utc.with_ymd_and_hms(2025, 1, 10, 10, 0, 0).unwrap();
        let result = service.export(&narrow).unwrap();
        assert_eq!(result.event_count, 1);
    }

    #[test]
    fn download_respects_expiry() {
        let (service, config_id) = seeded_service();
        let result = service
            .export(&options(config_id, ExportFormat::Json, PrivacyLevel::Full))
            .unwrap();
        assert!(service.download(result.id).is_ok());

        // Force-expire the artifact.
        service
            .artifacts
            .lock()
            .unwrap()
            .get_mut(&result.id)
            .unwrap()
            .expires_at = Some(Utc::now() - Duration::minutes(1));
        assert!(matches!(
            service.download(result.id),
            Err(SyncError::ExportNotFound(_))
        ));
    }

    #[test]
    fn subscription_feed_is_live() {
        let (service, config_id) = seeded_service();
        let subscription = service
            .subscribe(
                config_id,
                ExportFormat::Json,
                PrivacyLevel::Business,
                365,
                365,
                None,
            )
            .unwrap();

        let first = service.feed(&subscription.token).unwrap();
        assert_eq!(first.event_count, 3);

        // A new appointment shows up on the next fetch.
        let start = Utc::now() + Duration::days(1);
        service.store.upsert_local_event(
            config_id,
            SyncEvent::new("Walk-in", start, start + Duration::minutes(30)),
        );
        let second = service.feed(&subscription.token).unwrap();
        assert_eq!(second.event_count, 4);
    }

    #[test]
    fn expired_subscription_is_rejected() {
        let (service, config_id) = seeded_service();
        let subscription = service
            .subscribe(
                config_id,
                ExportFormat::Ical,
                PrivacyLevel::Minimal,
                30,
                30,
                Some(Duration::minutes(-1)),
            )
            .unwrap();
        assert!(matches!(
            service.feed(&subscription.token),
            Err(SyncError::ExportNotFound(_))
        ));
    }
}
