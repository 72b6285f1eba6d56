//! Provider-neutral event types.
//!
//! These types represent appointment calendar events in a provider-agnostic
//! way. Provider adapters convert their API responses into these types, and
//! the engine works exclusively with them for diffing, conflict detection,
//! and export.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Where an event originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Local,
    External,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Confirmed,
    Tentative,
    Cancelled,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Confirmed => "confirmed",
            EventStatus::Tentative => "tentative",
            EventStatus::Cancelled => "cancelled",
        }
    }
}

/// A calendar event in canonical form.
///
/// `external_id` is set once the event is linked to a remote counterpart.
/// The pair (local event, remote event with the same `external_id`) is what
/// the conflict detector operates on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEvent {
    pub id: String,
    /// Provider-assigned ID of the linked remote event, if any.
    pub external_id: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub location: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Attendee email addresses.
    pub attendees: Vec<String>,
    pub status: EventStatus,
    pub source: EventSource,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl SyncEvent {
    /// Create a new local event with a generated ID.
    pub fn new(title: impl Into<String>, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        let now = Utc::now();
        SyncEvent {
            id: Uuid::new_v4().to_string(),
            external_id: None,
            title: title.into(),
            description: None,
            location: None,
            start,
            end,
            attendees: Vec::new(),
            status: EventStatus::Confirmed,
            source: EventSource::Local,
            created_at: now,
            modified_at: now,
        }
    }

    /// Stable content checksum over semantically meaningful fields.
    ///
    /// Two events with equal checksums are content-equal. The hash covers
    /// title, description, location, time window, status, and the attendee
    /// set (sorted, so list order does not matter). Identity and bookkeeping
    /// fields (`id`, `external_id`, `source`, timestamps) are excluded so
    /// the checksum survives relinking and provider etag churn.
    pub fn checksum(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.title.as_bytes());
        hasher.update([0x1f]);
        hasher.update(self.description.as_deref().unwrap_or("").as_bytes());
        hasher.update([0x1f]);
        hasher.update(self.location.as_deref().unwrap_or("").as_bytes());
        hasher.update([0x1f]);
        hasher.update(self.start.timestamp().to_be_bytes());
        hasher.update(self.end.timestamp().to_be_bytes());
        hasher.update(self.status.as_str().as_bytes());
        hasher.update([0x1f]);

        let mut attendees = self.attendees.clone();
        attendees.sort();
        for attendee in &attendees {
            hasher.update(attendee.as_bytes());
            hasher.update([0x1e]);
        }

        hex::encode(hasher.finalize())
    }

    /// Whether this event is linked to a remote counterpart.
    pub fn is_linked(&self) -> bool {
        self.external_id.is_some()
    }

    /// Interval-overlap test on the event time windows.
    pub fn overlaps(&self, other: &SyncEvent) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Content similarity in [0, 1], used for best-effort first-time linking
    /// of events that were created independently on both sides.
    pub fn similarity(&self, other: &SyncEvent) -> f64 {
        let mut score = 0.0;
        if self.start == other.start && self.end == other.end {
            score += 0.5;
        } else if self.overlaps(other) {
            score += 0.2;
        }
        if self.title.trim().eq_ignore_ascii_case(other.title.trim()) {
            score += 0.3;
        }
        if self.location == other.location {
            score += 0.1;
        }
        if self.description == other.description {
            score += 0.1;
        }
        score
    }

}

/// Minimum similarity for best-effort linking of unlinked pairs.
pub const LINK_SIMILARITY_THRESHOLD: f64 = 0.8;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn event_at(h: u32, len_min: i64) -> SyncEvent {
        let start = Utc.with_ymd_and_hms(2025, 1, 10, h, 0, 0).unwrap();
        SyncEvent::new("Haircut", start, start + chrono::Duration::minutes(len_min))
    }

    #[test]
    fn checksum_ignores_attendee_order() {
        let mut a = event_at(10, 30);
        a.attendees = vec!["zoe@example.com".into(), "amir@example.com".into()];
        let mut b = a.clone();
        b.attendees = vec!["amir@example.com".into(), "zoe@example.com".into()];
        assert_eq!(a.checksum(), b.checksum());
    }

    #[test]
    fn checksum_ignores_identity_and_timestamps() {
        let a = event_at(10, 30);
        let mut b = a.clone();
        b.id = "other-id".into();
        b.external_id = Some("remote-1".into());
        b.source = EventSource::External;
        b.modified_at = b.modified_at + chrono::Duration::hours(3);
        assert_eq!(a.checksum(), b.checksum());
    }

    #[test]
    fn checksum_changes_on_semantic_fields() {
        let a = event_at(10, 30);

        let mut title_changed = a.clone();
        title_changed.title = "Beard trim".into();
        assert_ne!(a.checksum(), title_changed.checksum());

        let mut time_changed = a.clone();
        time_changed.end = time_changed.end + chrono::Duration::minutes(15);
        assert_ne!(a.checksum(), time_changed.checksum());

        let mut status_changed = a.clone();
        status_changed.status = EventStatus::Cancelled;
        assert_ne!(a.checksum(), status_changed.checksum());
    }

    #[test]
    fn overlap_is_strict_interval_intersection() {
        let a = event_at(10, 30);
        let b = event_at(10, 60);
        assert!(a.overlaps(&b));

        // Back-to-back events do not overlap
        let start = a.end;
        let c = SyncEvent::new("Next", start, start + chrono::Duration::minutes(30));
        assert!(!a.overlaps(&c));
    }

    #[test]
    fn similarity_high_for_same_window_and_title() {
        let a = event_at(10, 30);
        let mut b = a.clone();
        b.id = "different".into();
        assert!(a.similarity(&b) >= LINK_SIMILARITY_THRESHOLD);

        let mut c = event_at(14, 30);
        c.title = "Completely different".into();
        assert!(a.similarity(&c) < LINK_SIMILARITY_THRESHOLD);
    }
}
