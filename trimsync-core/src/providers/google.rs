//! Google Calendar adapter (Calendar API v3).

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::{Client, RequestBuilder};
use serde_json::{json, Value};
use tokio::sync::RwLock;

use crate::config::CalendarProvider;
use crate::error::{EngineResult, SyncError};
use crate::event::{EventSource, EventStatus, SyncEvent};
use crate::providers::http::{parse_rfc3339, send_with_retry};
use crate::providers::{ProviderAdapter, ProviderCredentials};

const DEFAULT_BASE_URL: &str = "https://www.googleapis.com/calendar/v3";
const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const PAGE_SIZE: u32 = 250;

pub struct GoogleAdapter {
    client: Client,
    base_url: String,
    token: RwLock<String>,
    refresh_token: Option<String>,
    client_id: Option<String>,
    client_secret: Option<String>,
}

impl GoogleAdapter {
    pub fn new(credentials: ProviderCredentials) -> Self {
        let (access_token, refresh_token, client_id, client_secret) = match credentials {
            ProviderCredentials::OAuth {
                access_token,
                refresh_token,
                client_id,
                client_secret,
            } => (access_token, refresh_token, client_id, client_secret),
            ProviderCredentials::Basic { .. } => (String::new(), None, None, None),
        };
        GoogleAdapter {
            client: Client::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            token: RwLock::new(access_token),
            refresh_token,
            client_id,
            client_secret,
        }
    }

    /// Point the adapter at a different API root (tests).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn can_refresh(&self) -> bool {
        self.refresh_token.is_some() && self.client_id.is_some() && self.client_secret.is_some()
    }

    /// Exchange the refresh token for a new access token.
    async fn refresh_access(&self) -> EngineResult<()> {
        let params = [
            ("client_id", self.client_id.as_deref().unwrap_or_default()),
            (
                "client_secret",
                self.client_secret.as_deref().unwrap_or_default(),
            ),
            (
                "refresh_token",
                self.refresh_token.as_deref().unwrap_or_default(),
            ),
            ("grant_type", "refresh_token"),
        ];
        let response = send_with_retry(self.client.post(TOKEN_URL).form(&params)).await?;
        let body: Value = response.json().await?;
        let access = body["access_token"]
            .as_str()
            .ok_or_else(|| SyncError::Auth("refresh response missing access_token".into()))?;
        *self.token.write().await = access.to_string();
        tracing::debug!(provider = "google", "refreshed access token");
        Ok(())
    }

    /// Send an authenticated request, refreshing the token once on 401.
    async fn send<F>(&self, build: F) -> EngineResult<reqwest::Response>
    where
        F: Fn(&str) -> RequestBuilder,
    {
        let token = self.token.read().await.clone();
        match send_with_retry(build(&token)).await {
            Err(SyncError::Auth(reason)) if self.can_refresh() => {
                tracing::info!(provider = "google", %reason, "access token rejected, refreshing");
                self.refresh_access().await?;
                let token = self.token.read().await.clone();
                send_with_retry(build(&token)).await
            }
            other => other,
        }
    }

    fn events_url(&self, calendar_id: &str) -> String {
        format!("{}/calendars/{}/events", self.base_url, calendar_id)
    }
}

#[async_trait]
impl ProviderAdapter for GoogleAdapter {
    fn provider(&self) -> CalendarProvider {
        CalendarProvider::Google
    }

    fn supports_delta(&self) -> bool {
        true
    }

    async fn validate_access(&self, calendar_id: &str) -> EngineResult<()> {
        let url = format!("{}/calendars/{}", self.base_url, calendar_id);
        self.send(|token| self.client.get(&url).bearer_auth(token))
            .await?;
        Ok(())
    }

    async fn fetch_events(
        &self,
        calendar_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> EngineResult<Vec<SyncEvent>> {
        let url = self.events_url(calendar_id);
        let mut events = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let response = self
                .send(|token| {
                    let mut request = self
                        .client
                        .get(&url)
                        .bearer_auth(token)
                        .query(&[("maxResults", PAGE_SIZE.to_string())])
                        .query(&[("singleEvents", "true"), ("showDeleted", "true")]);
                    if let Some(since) = since {
                        request = request.query(&[("updatedMin", since.to_rfc3339())]);
                    }
                    if let Some(ref token) = page_token {
                        request = request.query(&[("pageToken", token)]);
                    }
                    request
                })
                .await?;

            let body: Value = response.json().await?;
            for item in body["items"].as_array().into_iter().flatten() {
                match event_from_google(item) {
                    Ok(event) => events.push(event),
                    Err(err) => {
                        // A malformed item is skipped, never fatal to the fetch.
                        tracing::warn!(provider = "google", %err, "skipping malformed event");
                    }
                }
            }

            match body["nextPageToken"].as_str() {
                Some(next) => page_token = Some(next.to_string()),
                None => break,
            }
        }

        Ok(events)
    }

    async fn create_event(
        &self,
        calendar_id: &str,
        event: &SyncEvent,
    ) -> EngineResult<SyncEvent> {
        let url = self.events_url(calendar_id);
        let body = event_to_google(event);
        let response = self
            .send(|token| self.client.post(&url).bearer_auth(token).json(&body))
            .await?;
        event_from_google(&response.json::<Value>().await?)
    }

    async fn update_event(
        &self,
        calendar_id: &str,
        event: &SyncEvent,
    ) -> EngineResult<SyncEvent> {
        let external_id = event.external_id.as_deref().ok_or_else(|| {
            SyncError::Validation(format!("event {} has no external_id to update", event.id))
        })?;
        let url = format!("{}/{}", self.events_url(calendar_id), external_id);
        let body = event_to_google(event);
        let response = self
            .send(|token| self.client.put(&url).bearer_auth(token).json(&body))
            .await?;
        event_from_google(&response.json::<Value>().await?)
    }

    async fn delete_event(&self, calendar_id: &str, external_id: &str) -> EngineResult<()> {
        let url = format!("{}/{}", self.events_url(calendar_id), external_id);
        match self
            .send(|token| self.client.delete(&url).bearer_auth(token))
            .await
        {
            Ok(_) => Ok(()),
            // Already gone remotely: the delete is idempotent.
            Err(SyncError::NotFound(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

/// Convert a Google API event resource into a canonical event.
fn event_from_google(item: &Value) -> EngineResult<SyncEvent> {
    let google_id = item["id"]
        .as_str()
        .ok_or_else(|| SyncError::Validation("event missing id".into()))?
        .to_string();

    let status = match item["status"].as_str() {
        Some("cancelled") => EventStatus::Cancelled,
        Some("tentative") => EventStatus::Tentative,
        _ => EventStatus::Confirmed,
    };

    let updated = item["updated"]
        .as_str()
        .map(parse_rfc3339)
        .transpose()?
        .unwrap_or_else(Utc::now);
    let created = item["created"]
        .as_str()
        .map(parse_rfc3339)
        .transpose()?
        .unwrap_or(updated);

    // Cancelled deltas arrive as skeletons without times; carry the updated
    // timestamp so the event still sorts sensibly.
    let start = parse_google_time(&item["start"]).unwrap_or(updated);
    let end = parse_google_time(&item["end"]).unwrap_or(start);

    if status != EventStatus::Cancelled && item["start"].is_null() {
        return Err(SyncError::Validation(format!(
            "event {google_id} has no start time"
        )));
    }

    let attendees = item["attendees"]
        .as_array()
        .map(|list| {
            list.iter()
                .filter_map(|a| a["email"].as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    // Events we exported carry our canonical id in private properties.
    let id = item["extendedProperties"]["private"]["trimsync_id"]
        .as_str()
        .unwrap_or(&google_id)
        .to_string();

    Ok(SyncEvent {
        id,
        external_id: Some(google_id),
        title: item["summary"].as_str().unwrap_or("(No title)").to_string(),
        description: item["description"].as_str().map(str::to_string),
        location: item["location"].as_str().map(str::to_string),
        start,
        end,
        attendees,
        status,
        source: EventSource::External,
        created_at: created,
        modified_at: updated,
    })
}

/// Convert a canonical event into a Google API request body. Also used by
/// the export service's provider-native format.
pub(crate) fn event_to_google(event: &SyncEvent) -> Value {
    let attendees: Vec<Value> = event
        .attendees
        .iter()
        .map(|email| json!({ "email": email }))
        .collect();

    json!({
        "summary": event.title,
        "description": event.description,
        "location": event.location,
        "start": { "dateTime": event.start.to_rfc3339() },
        "end": { "dateTime": event.end.to_rfc3339() },
        "attendees": attendees,
        "status": event.status.as_str(),
        "extendedProperties": {
            "private": { "trimsync_id": event.id }
        }
    })
}

fn parse_google_time(value: &Value) -> Option<DateTime<Utc>> {
    if let Some(dt) = value["dateTime"].as_str() {
        return parse_rfc3339(dt).ok();
    }
    // All-day events carry a date only; pin to midnight UTC.
    value["date"]
        .as_str()
        .and_then(|d| d.parse::<NaiveDate>().ok())
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_item() -> Value {
        json!({
            "id": "gcal-abc123",
            "status": "confirmed",
            "summary": "Haircut - Sam",
            "description": "Skin fade",
            "location": "Chair 2",
            "start": { "dateTime": "2025-01-10T10:00:00Z" },
            "end": { "dateTime": "2025-01-10T10:30:00Z" },
            "attendees": [ { "email": "sam@example.com" } ],
            "created": "2025-01-02T09:00:00Z",
            "updated": "2025-01-05T12:00:00Z",
            "extendedProperties": { "private": { "trimsync_id": "appt-77" } }
        })
    }

    #[test]
    fn maps_google_resource_to_canonical_event() {
        let event = event_from_google(&sample_item()).unwrap();
        assert_eq!(event.id, "appt-77");
        assert_eq!(event.external_id.as_deref(), Some("gcal-abc123"));
        assert_eq!(event.title, "Haircut - Sam");
        assert_eq!(event.attendees, vec!["sam@example.com".to_string()]);
        assert_eq!(event.status, EventStatus::Confirmed);
        assert_eq!(event.source, EventSource::External);
        assert_eq!(event.start.to_rfc3339(), "2025-01-10T10:00:00+00:00");
    }

    #[test]
    fn cancelled_skeleton_is_not_rejected() {
        let item = json!({
            "id": "gcal-gone",
            "status": "cancelled",
            "updated": "2025-01-05T12:00:00Z"
        });
        let event = event_from_google(&item).unwrap();
        assert_eq!(event.status, EventStatus::Cancelled);
    }

    #[test]
    fn round_trip_preserves_canonical_id() {
        let event = event_from_google(&sample_item()).unwrap();
        let body = event_to_google(&event);
        assert_eq!(
            body["extendedProperties"]["private"]["trimsync_id"],
            "appt-77"
        );
        assert_eq!(body["summary"], "Haircut - Sam");
    }

    #[tokio::test]
    async fn fetch_maps_items_and_passes_updated_min() {
        let mut server = mockito::Server::new_async().await;
        let body = json!({ "items": [sample_item()] }).to_string();
        let mock = server
            .mock("GET", "/calendars/primary/events")
            .match_query(mockito::Matcher::UrlEncoded(
                "updatedMin".into(),
                "2025-01-04T00:00:00+00:00".into(),
            ))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(body)
            .create_async()
            .await;

        let adapter = GoogleAdapter::new(ProviderCredentials::OAuth {
            access_token: "tok".into(),
            refresh_token: None,
            client_id: None,
            client_secret: None,
        })
        .with_base_url(server.url());

        let since = "2025-01-04T00:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let events = adapter.fetch_events("primary", Some(since)).await.unwrap();

        mock.assert_async().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, "appt-77");
    }

    #[tokio::test]
    async fn rate_limit_is_classified() {
        let mut server = mockito::Server::new_async().await;
        // Three attempts, all rate limited: error must surface as RateLimit.
        let mock = server
            .mock("GET", "/calendars/primary/events")
            .match_query(mockito::Matcher::Any)
            .with_status(429)
            .with_header("retry-after", "1")
            .expect(3)
            .create_async()
            .await;

        let adapter = GoogleAdapter::new(ProviderCredentials::OAuth {
            access_token: "tok".into(),
            refresh_token: None,
            client_id: None,
            client_secret: None,
        })
        .with_base_url(server.url());

        let err = adapter.fetch_events("primary", None).await.unwrap_err();
        mock.assert_async().await;
        assert!(matches!(err, SyncError::RateLimit { .. }));
    }
}
