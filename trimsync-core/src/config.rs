//! Sync configuration: the linkage between a user's local appointment
//! calendar and one external calendar, including direction and conflict
//! policy.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::backoff;

/// Maximum accumulated error messages kept on a configuration.
const MAX_RECORDED_ERRORS: usize = 20;

/// External calendar providers supported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalendarProvider {
    Google,
    Outlook,
    /// Apple calendars, reached through iCloud's CalDAV endpoints.
    Apple,
    /// Any standards-compliant CalDAV server.
    Caldav,
}

impl CalendarProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            CalendarProvider::Google => "google",
            CalendarProvider::Outlook => "outlook",
            CalendarProvider::Apple => "apple",
            CalendarProvider::Caldav => "caldav",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "google" => Some(CalendarProvider::Google),
            "outlook" => Some(CalendarProvider::Outlook),
            "apple" => Some(CalendarProvider::Apple),
            "caldav" => Some(CalendarProvider::Caldav),
            _ => None,
        }
    }
}

impl std::fmt::Display for CalendarProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which way events flow between the local store and the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    ExportOnly,
    ImportOnly,
    Bidirectional,
}

impl SyncDirection {
    pub fn exports(&self) -> bool {
        matches!(self, SyncDirection::ExportOnly | SyncDirection::Bidirectional)
    }

    pub fn imports(&self) -> bool {
        matches!(self, SyncDirection::ImportOnly | SyncDirection::Bidirectional)
    }
}

/// How detected conflicts are resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    LocalWins,
    RemoteWins,
    NewestWins,
    Merge,
    /// No automatic resolution; conflicts are held for a human operator.
    Prompt,
}

/// Redaction tier applied to exported event data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrivacyLevel {
    /// All fields.
    Full,
    /// Client PII stripped (attendees, description).
    Business,
    /// Time and service only.
    Minimal,
    /// Generic placeholders with no identifying text.
    Anonymous,
}

/// A user's sync configuration for one external calendar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfiguration {
    pub id: Uuid,
    pub user_id: Uuid,
    pub provider: CalendarProvider,
    pub external_calendar_id: String,
    pub sync_direction: SyncDirection,
    pub conflict_resolution: ConflictStrategy,
    pub sync_frequency_minutes: u32,
    pub privacy_level: PrivacyLevel,
    /// Soft-disable flag. Disabled configurations keep their history.
    pub enabled: bool,
    pub last_sync: Option<DateTime<Utc>>,
    pub next_sync: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    /// Most recent error messages, oldest dropped beyond the cap.
    pub sync_errors: Vec<String>,
    /// Shared secret for validating provider webhook deliveries.
    pub webhook_secret: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SyncConfiguration {
    pub fn new(
        user_id: Uuid,
        provider: CalendarProvider,
        external_calendar_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        SyncConfiguration {
            id: Uuid::new_v4(),
            user_id,
            provider,
            external_calendar_id: external_calendar_id.into(),
            sync_direction: SyncDirection::Bidirectional,
            conflict_resolution: ConflictStrategy::NewestWins,
            sync_frequency_minutes: 15,
            privacy_level: PrivacyLevel::Business,
            enabled: true,
            last_sync: None,
            next_sync: Some(now),
            consecutive_failures: 0,
            sync_errors: Vec::new(),
            webhook_secret: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the scheduler should trigger this configuration now.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_sync.is_some_and(|at| at <= now)
    }

    /// Record a successful cycle: reset failure tracking and schedule the
    /// next run at the configured frequency.
    pub fn record_success(&mut self, now: DateTime<Utc>) {
        self.last_sync = Some(now);
        self.consecutive_failures = 0;
        self.next_sync = Some(now + Duration::minutes(i64::from(self.sync_frequency_minutes)));
        self.updated_at = now;
    }

    /// Record a failed cycle: accumulate the error and push `next_sync` out
    /// with exponential backoff rather than retrying immediately.
    pub fn record_failure(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        self.sync_errors.push(error.into());
        if self.sync_errors.len() > MAX_RECORDED_ERRORS {
            let excess = self.sync_errors.len() - MAX_RECORDED_ERRORS;
            self.sync_errors.drain(..excess);
        }
        let delay = backoff::sync_backoff_seconds(self.consecutive_failures);
        self.consecutive_failures += 1;
        self.next_sync = Some(now + Duration::seconds(delay as i64));
        self.updated_at = now;
    }

    /// Degrade the configuration after an auth failure: sync pauses until
    /// the user re-authenticates and re-enables it.
    pub fn degrade(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        self.record_failure(error, now);
        self.enabled = false;
        self.next_sync = None;
    }

    pub fn last_error(&self) -> Option<&str> {
        self.sync_errors.last().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SyncConfiguration {
        SyncConfiguration::new(Uuid::new_v4(), CalendarProvider::Google, "primary")
    }

    #[test]
    fn new_configuration_is_due_immediately() {
        let cfg = config();
        assert!(cfg.is_due(Utc::now()));
    }

    #[test]
    fn success_schedules_at_frequency() {
        let mut cfg = config();
        let now = Utc::now();
        cfg.record_success(now);
        assert_eq!(cfg.last_sync, Some(now));
        assert_eq!(cfg.consecutive_failures, 0);
        assert_eq!(cfg.next_sync, Some(now + Duration::minutes(15)));
    }

    #[test]
    fn failures_back_off_and_bound_error_log() {
        let mut cfg = config();
        let now = Utc::now();

        cfg.record_failure("timeout", now);
        let first_delay = cfg.next_sync.unwrap() - now;
        cfg.record_failure("timeout", now);
        let second_delay = cfg.next_sync.unwrap() - now;
        assert!(second_delay > first_delay);

        for i in 0..50 {
            cfg.record_failure(format!("err {i}"), now);
        }
        assert_eq!(cfg.sync_errors.len(), 20);
        assert_eq!(cfg.last_error(), Some("err 49"));
    }

    #[test]
    fn degraded_configuration_is_not_due() {
        let mut cfg = config();
        cfg.degrade("credentials expired", Utc::now());
        assert!(!cfg.enabled);
        assert!(!cfg.is_due(Utc::now() + Duration::days(1)));
    }
}
