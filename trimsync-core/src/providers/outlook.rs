//! Outlook adapter (Microsoft Graph calendar API).

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::{Client, RequestBuilder};
use serde_json::{json, Value};
use tokio::sync::RwLock;

use crate::config::CalendarProvider;
use crate::error::{EngineResult, SyncError};
use crate::event::{EventSource, EventStatus, SyncEvent};
use crate::providers::http::{parse_rfc3339, send_with_retry};
use crate::providers::{ProviderAdapter, ProviderCredentials};

const DEFAULT_BASE_URL: &str = "https://graph.microsoft.com/v1.0";
const TOKEN_URL: &str = "https://login.microsoftonline.com/common/oauth2/v2.0/token";
const PAGE_SIZE: u32 = 100;

pub struct OutlookAdapter {
    client: Client,
    base_url: String,
    token: RwLock<String>,
    refresh_token: Option<String>,
    client_id: Option<String>,
    client_secret: Option<String>,
}

impl OutlookAdapter {
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
        OutlookAdapter {
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
        tracing::debug!(provider = "outlook", "refreshed access token");
        Ok(())
    }

    async fn send<F>(&self, build: F) -> EngineResult<reqwest::Response>
    where
        F: Fn(&str) -> RequestBuilder,
    {
        let token = self.token.read().await.clone();
        match send_with_retry(build(&token)).await {
            Err(SyncError::Auth(reason)) if self.can_refresh() => {
                tracing::info!(provider = "outlook", %reason, "access token rejected, refreshing");
                self.refresh_access().await?;
                let token = self.token.read().await.clone();
                send_with_retry(build(&token)).await
            }
            other => other,
        }
    }

    fn events_url(&self, calendar_id: &str) -> String {
        format!("{}/me/calendars/{}/events", self.base_url, calendar_id)
    }
}

#[async_trait]
impl ProviderAdapter for OutlookAdapter {
    fn provider(&self) -> CalendarProvider {
        CalendarProvider::Outlook
    }

    fn supports_delta(&self) -> bool {
        true
    }

    async fn validate_access(&self, calendar_id: &str) -> EngineResult<()> {
        let url = format!("{}/me/calendars/{}", self.base_url, calendar_id);
        self.send(|token| self.client.get(&url).bearer_auth(token))
            .await?;
        Ok(())
    }

    async fn fetch_events(
        &self,
        calendar_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> EngineResult<Vec<SyncEvent>> {
        let mut events = Vec::new();
        // Graph paginates through opaque @odata.nextLink URLs.
        let mut next_url = Some(self.events_url(calendar_id));
        let mut first_page = true;

        while let Some(url) = next_url.take() {
            let response = self
                .send(|token| {
                    let mut request = self
                        .client
                        .get(&url)
                        .bearer_auth(token)
                        .header("Prefer", "outlook.timezone=\"UTC\"");
                    if first_page {
                        request = request.query(&[("$top", PAGE_SIZE.to_string())]);
                        if let Some(since) = since {
                            request = request.query(&[(
                                "$filter",
                                format!(
                                    "lastModifiedDateTime ge {}",
                                    since.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
                                ),
                            )]);
                        }
                    }
                    request
                })
                .await?;

            let body: Value = response.json().await?;
            for item in body["value"].as_array().into_iter().flatten() {
                match event_from_graph(item) {
                    Ok(event) => events.push(event),
                    Err(err) => {
                        tracing::warn!(provider = "outlook", %err, "skipping malformed event");
                    }
                }
            }

            next_url = body["@odata.nextLink"].as_str().map(str::to_string);
            first_page = false;
        }

        Ok(events)
    }

    async fn create_event(
        &self,
        calendar_id: &str,
        event: &SyncEvent,
    ) -> EngineResult<SyncEvent> {
        let url = self.events_url(calendar_id);
        let body = event_to_graph(event);
        let response = self
            .send(|token| self.client.post(&url).bearer_auth(token).json(&body))
            .await?;
        event_from_graph(&response.json::<Value>().await?)
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
        let body = event_to_graph(event);
        let response = self
            .send(|token| self.client.patch(&url).bearer_auth(token).json(&body))
            .await?;
        event_from_graph(&response.json::<Value>().await?)
    }

    async fn delete_event(&self, calendar_id: &str, external_id: &str) -> EngineResult<()> {
        let url = format!("{}/{}", self.events_url(calendar_id), external_id);
        match self
            .send(|token| self.client.delete(&url).bearer_auth(token))
            .await
        {
            Ok(_) => Ok(()),
            Err(SyncError::NotFound(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

/// Convert a Graph event resource into a canonical event.
fn event_from_graph(item: &Value) -> EngineResult<SyncEvent> {
    let graph_id = item["id"]
        .as_str()
        .ok_or_else(|| SyncError::Validation("event missing id".into()))?
        .to_string();

    let status = if item["isCancelled"].as_bool().unwrap_or(false) {
        EventStatus::Cancelled
    } else if item["showAs"].as_str() == Some("tentative") {
        EventStatus::Tentative
    } else {
        EventStatus::Confirmed
    };

    let updated = item["lastModifiedDateTime"]
        .as_str()
        .map(parse_rfc3339)
        .transpose()?
        .unwrap_or_else(Utc::now);
    let created = item["createdDateTime"]
        .as_str()
        .map(parse_rfc3339)
        .transpose()?
        .unwrap_or(updated);

    let start = parse_graph_time(&item["start"]).unwrap_or(updated);
    let end = parse_graph_time(&item["end"]).unwrap_or(start);

    if status != EventStatus::Cancelled && item["start"].is_null() {
        return Err(SyncError::Validation(format!(
            "event {graph_id} has no start time"
        )));
    }

    let attendees = item["attendees"]
        .as_array()
        .map(|list| {
            list.iter()
                .filter_map(|a| a["emailAddress"]["address"].as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    // Body content is HTML by default; we only ever write text bodies.
    let description = item["body"]["content"]
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    Ok(SyncEvent {
        id: graph_id.clone(),
        external_id: Some(graph_id),
        title: item["subject"].as_str().unwrap_or("(No title)").to_string(),
        description,
        location: item["location"]["displayName"]
            .as_str()
            .filter(|s| !s.is_empty())
            .map(str::to_string),
        start,
        end,
        attendees,
        status,
        source: EventSource::External,
        created_at: created,
        modified_at: updated,
    })
}

/// Convert a canonical event into a Graph request body.
fn event_to_graph(event: &SyncEvent) -> Value {
    let attendees: Vec<Value> = event
        .attendees
        .iter()
        .map(|email| {
            json!({
                "emailAddress": { "address": email },
                "type": "required"
            })
        })
        .collect();

    json!({
        "subject": event.title,
        "body": {
            "contentType": "text",
            "content": event.description.as_deref().unwrap_or("")
        },
        "location": { "displayName": event.location.as_deref().unwrap_or("") },
        "start": {
            "dateTime": event.start.format("%Y-%m-%dT%H:%M:%S").to_string(),
            "timeZone": "UTC"
        },
        "end": {
            "dateTime": event.end.format("%Y-%m-%dT%H:%M:%S").to_string(),
            "timeZone": "UTC"
        },
        "attendees": attendees,
        "isCancelled": event.status == EventStatus::Cancelled
    })
}

/// Graph returns `{ "dateTime": "2025-01-10T10:00:00.0000000", "timeZone": "UTC" }`.
/// We request UTC via the `Prefer` header, so the naive time is UTC.
fn parse_graph_time(value: &Value) -> Option<DateTime<Utc>> {
    let raw = value["dateTime"].as_str()?;
    let trimmed = raw.split('.').next().unwrap_or(raw);
    NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}
