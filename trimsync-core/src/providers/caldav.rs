//! Generic CalDAV adapter, also used for Apple calendars via iCloud.
//!
//! CalDAV has no delta query, so fetches always return the full VEVENT set
//! for the collection and the engine falls back to full-state diffing.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use icalendar::parser::{read_calendar, unfold};
use icalendar::{Component, DatePerhapsTime, EventLike};
use reqwest::{Client, Method};

use crate::config::CalendarProvider;
use crate::error::{EngineResult, SyncError};
use crate::event::{EventSource, EventStatus, SyncEvent};
use crate::providers::http::send_with_retry;
use crate::providers::ProviderAdapter;

const ICLOUD_BASE_URL: &str = "https://caldav.icloud.com";

/// REPORT body asking for every VEVENT in the collection.
const CALENDAR_QUERY: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<c:calendar-query xmlns:d="DAV:" xmlns:c="urn:ietf:params:xml:ns:caldav">
  <d:prop>
    <c:calendar-data/>
  </d:prop>
  <c:filter>
    <c:comp-filter name="VCALENDAR">
      <c:comp-filter name="VEVENT"/>
    </c:comp-filter>
  </c:filter>
</c:calendar-query>"#;

pub struct CalDavAdapter {
    client: Client,
    base_url: String,
    username: String,
    password: String,
    provider: CalendarProvider,
}

impl CalDavAdapter {
    pub fn new(
        base_url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
        provider: CalendarProvider,
    ) -> Self {
        CalDavAdapter {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            username: username.into(),
            password: password.into(),
            provider,
        }
    }

    /// Apple calendars: CalDAV against iCloud with an app-specific password.
    pub fn icloud(username: impl Into<String>, password: impl Into<String>) -> Self {
        CalDavAdapter::new(ICLOUD_BASE_URL, username, password, CalendarProvider::Apple)
    }

    fn collection_url(&self, calendar_id: &str) -> String {
        format!("{}/{}/", self.base_url, calendar_id.trim_matches('/'))
    }

    fn resource_url(&self, calendar_id: &str, uid: &str) -> String {
        format!("{}{}.ics", self.collection_url(calendar_id), uid)
    }
}

#[async_trait]
impl ProviderAdapter for CalDavAdapter {
    fn provider(&self) -> CalendarProvider {
        self.provider
    }

    fn supports_delta(&self) -> bool {
        false
    }

    async fn validate_access(&self, calendar_id: &str) -> EngineResult<()> {
        let request = self
            .client
            .request(
                Method::from_bytes(b"PROPFIND").expect("valid method"),
                self.collection_url(calendar_id),
            )
            .basic_auth(&self.username, Some(&self.password))
            .header("Depth", "0");
        send_with_retry(request).await?;
        Ok(())
    }

    async fn fetch_events(
        &self,
        calendar_id: &str,
        _since: Option<DateTime<Utc>>,
    ) -> EngineResult<Vec<SyncEvent>> {
        let request = self
            .client
            .request(
                Method::from_bytes(b"REPORT").expect("valid method"),
                self.collection_url(calendar_id),
            )
            .basic_auth(&self.username, Some(&self.password))
            .header("Depth", "1")
            .header("Content-Type", "application/xml; charset=utf-8")
            .body(CALENDAR_QUERY);

        let response = send_with_retry(request).await?;
        let body = response.text().await?;
        parse_multistatus(&body)
    }

    async fn create_event(
        &self,
        calendar_id: &str,
        event: &SyncEvent,
    ) -> EngineResult<SyncEvent> {
        // The UID we PUT under becomes the external id.
        let uid = event.id.clone();
        let ics = event_to_ics(event, &uid);
        let request = self
            .client
            .put(self.resource_url(calendar_id, &uid))
            .basic_auth(&self.username, Some(&self.password))
            .header("Content-Type", "text/calendar; charset=utf-8")
            .header("If-None-Match", "*")
            .body(ics);
        send_with_retry(request).await?;

        let mut created = event.clone();
        created.external_id = Some(uid);
        Ok(created)
    }

    async fn update_event(
        &self,
        calendar_id: &str,
        event: &SyncEvent,
    ) -> EngineResult<SyncEvent> {
        let uid = event.external_id.clone().ok_or_else(|| {
            SyncError::Validation(format!("event {} has no external_id to update", event.id))
        })?;
        let ics = event_to_ics(event, &uid);
        let request = self
            .client
            .put(self.resource_url(calendar_id, &uid))
            .basic_auth(&self.username, Some(&self.password))
            .header("Content-Type", "text/calendar; charset=utf-8")
            .body(ics);
        send_with_retry(request).await?;
        Ok(event.clone())
    }

    async fn delete_event(&self, calendar_id: &str, external_id: &str) -> EngineResult<()> {
        let request = self
            .client
            .delete(self.resource_url(calendar_id, external_id))
            .basic_auth(&self.username, Some(&self.password));
        match send_with_retry(request).await {
            Ok(_) => Ok(()),
            Err(SyncError::NotFound(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

/// Pull every `calendar-data` block out of a multistatus response and parse
/// each into a canonical event. Malformed entries are skipped.
fn parse_multistatus(xml: &str) -> EngineResult<Vec<SyncEvent>> {
    let doc = roxmltree::Document::parse(xml)
        .map_err(|e| SyncError::Provider(format!("invalid multistatus response: {e}")))?;

    let mut events = Vec::new();
    for node in doc.descendants() {
        if node.tag_name().name() != "calendar-data" {
            continue;
        }
        let Some(ics) = node.text() else { continue };
        match parse_ics_event(ics) {
            Some(event) => events.push(event),
            None => tracing::warn!(provider = "caldav", "skipping unparseable calendar-data"),
        }
    }
    Ok(events)
}

/// Parse one ICS document into a canonical event.
fn parse_ics_event(content: &str) -> Option<SyncEvent> {
    let unfolded = unfold(content);
    let calendar = read_calendar(&unfolded).ok()?;
    let vevent = calendar.components.iter().find(|c| c.name == "VEVENT")?;

    let uid = vevent.find_prop("UID")?.val.to_string();
    let title = vevent
        .find_prop("SUMMARY")
        .map(|p| p.val.to_string())
        .unwrap_or_else(|| "(No title)".to_string());
    let start = to_utc(DatePerhapsTime::try_from(vevent.find_prop("DTSTART")?).ok()?)?;
    let end = to_utc(DatePerhapsTime::try_from(vevent.find_prop("DTEND")?).ok()?)?;

    let status = vevent
        .find_prop("STATUS")
        .map(|p| match p.val.as_ref() {
            "TENTATIVE" => EventStatus::Tentative,
            "CANCELLED" => EventStatus::Cancelled,
            _ => EventStatus::Confirmed,
        })
        .unwrap_or(EventStatus::Confirmed);

    let attendees: Vec<String> = vevent
        .properties
        .iter()
        .filter(|p| p.name == "ATTENDEE")
        .map(|p| p.val.as_ref().trim_start_matches("mailto:").to_string())
        .collect();

    let modified = vevent
        .find_prop("LAST-MODIFIED")
        .and_then(|p| parse_ics_utc(p.val.as_ref()))
        .unwrap_or_else(Utc::now);
    let created = vevent
        .find_prop("CREATED")
        .and_then(|p| parse_ics_utc(p.val.as_ref()))
        .unwrap_or(modified);

    Some(SyncEvent {
        id: uid.clone(),
        external_id: Some(uid),
        title,
        description: vevent.find_prop("DESCRIPTION").map(|p| p.val.to_string()),
        location: vevent.find_prop("LOCATION").map(|p| p.val.to_string()),
        start,
        end,
        attendees,
        status,
        source: EventSource::External,
        created_at: created,
        modified_at: modified,
    })
}

/// Serialize a canonical event as a single-VEVENT ICS document.
fn event_to_ics(event: &SyncEvent, uid: &str) -> String {
    let mut ics_event = icalendar::Event::new();
    ics_event.uid(uid);
    ics_event.summary(&event.title);
    ics_event.add_property("DTSTART", event.start.format("%Y%m%dT%H%M%SZ").to_string());
    ics_event.add_property("DTEND", event.end.format("%Y%m%dT%H%M%SZ").to_string());
    ics_event.add_property(
        "LAST-MODIFIED",
        event.modified_at.format("%Y%m%dT%H%M%SZ").to_string(),
    );

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

    let mut calendar = icalendar::Calendar::new();
    calendar.push(ics_event.done());
    calendar.done().to_string()
}

fn to_utc(time: DatePerhapsTime) -> Option<DateTime<Utc>> {
    match time {
        DatePerhapsTime::DateTime(dt) => match dt {
            icalendar::CalendarDateTime::Utc(utc) => Some(utc),
            // Floating times are treated as UTC; appointments are stored UTC.
            icalendar::CalendarDateTime::Floating(naive) => Some(naive.and_utc()),
            icalendar::CalendarDateTime::WithTimezone { date_time, tzid } => {
                let tz: chrono_tz::Tz = tzid.parse().ok()?;
                tz.from_local_datetime(&date_time)
                    .single()
                    .map(|zoned| zoned.with_timezone(&Utc))
            }
        },
        DatePerhapsTime::Date(date) => date.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc()),
    }
}

fn parse_ics_utc(value: &str) -> Option<DateTime<Utc>> {
    chrono::NaiveDateTime::parse_from_str(value, "%Y%m%dT%H%M%SZ")
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone as _;

    fn sample_event() -> SyncEvent {
        let start = Utc.with_ymd_and_hms(2025, 1, 10, 10, 0, 0).unwrap();
        let mut event = SyncEvent::new("Haircut - Sam", start, start + chrono::Duration::minutes(30));
        event.description = Some("Skin fade".into());
        event.location = Some("Chair 2".into());
        event.attendees = vec!["sam@example.com".into()];
        event
    }

    #[test]
    fn ics_round_trip_preserves_content() {
        let event = sample_event();
        let ics = event_to_ics(&event, "uid-123");
        let parsed = parse_ics_event(&ics).expect("generated ICS should parse");

        assert_eq!(parsed.external_id.as_deref(), Some("uid-123"));
        assert_eq!(parsed.title, event.title);
        assert_eq!(parsed.description, event.description);
        assert_eq!(parsed.location, event.location);
        assert_eq!(parsed.start, event.start);
        assert_eq!(parsed.end, event.end);
        assert_eq!(parsed.attendees, event.attendees);
    }

    #[test]
    fn multistatus_extracts_calendar_data() {
        let ics = event_to_ics(&sample_event(), "uid-9");
        let xml = format!(
            r#"<?xml version="1.0"?>
<d:multistatus xmlns:d="DAV:" xmlns:c="urn:ietf:params:xml:ns:caldav">
  <d:response>
    <d:href>/calendars/home/uid-9.ics</d:href>
    <d:propstat>
      <d:prop>
        <c:calendar-data>{}</c:calendar-data>
      </d:prop>
    </d:propstat>
  </d:response>
</d:multistatus>"#,
            ics.replace('&', "&amp;").replace('<', "&lt;")
        );

        let events = parse_multistatus(&xml).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].title, "Haircut - Sam");
    }

    #[test]
    fn icloud_adapter_reports_apple_provider() {
        let adapter = CalDavAdapter::icloud("user@icloud.com", "app-password");
        assert_eq!(adapter.provider(), CalendarProvider::Apple);
        assert!(!adapter.supports_delta());
    }
}
