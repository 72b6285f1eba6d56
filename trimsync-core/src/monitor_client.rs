//! Client side of the real-time monitor channel.
//!
//! Consumes the server's SSE stream as an explicit cancellable task:
//! reconnects with jittered exponential backoff up to a bounded attempt
//! count, and exposes connect/disconnect as scoped resource acquisition -
//! dropping the connection aborts the task.

use std::time::Duration;

use futures::StreamExt;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::monitor::MonitorEvent;

const DEFAULT_MAX_ATTEMPTS: u32 = 8;
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
const MAX_EXPONENT: u32 = 6;

pub struct MonitorClient {
    endpoint: String,
    client: reqwest::Client,
    max_attempts: u32,
    base_delay: Duration,
}

impl MonitorClient {
    /// `endpoint` is the full monitor URL, e.g.
    /// `http://127.0.0.1:4870/sync/monitor`.
    pub fn new(endpoint: impl Into<String>) -> Self {
        MonitorClient {
            endpoint: endpoint.into(),
            client: reqwest::Client::new(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
        }
    }

    /// Consecutive failed connections tolerated before the task gives up.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Start streaming. The returned connection owns the background task.
    pub fn connect(&self) -> MonitorConnection {
        let (sender, receiver) = mpsc::channel(64);
        let client = self.client.clone();
        let endpoint = self.endpoint.clone();
        let max_attempts = self.max_attempts;
        let base_delay = self.base_delay;

        let handle = tokio::spawn(async move {
            stream_events(client, endpoint, max_attempts, base_delay, sender).await;
        });

        MonitorConnection {
            events: receiver,
            handle,
        }
    }
}

/// A live monitor subscription. Dropping it cancels the streaming task.
pub struct MonitorConnection {
    events: mpsc::Receiver<MonitorEvent>,
    handle: JoinHandle<()>,
}

impl MonitorConnection {
    /// Next event, or `None` once the task gave up reconnecting.
    pub async fn recv(&mut self) -> Option<MonitorEvent> {
        self.events.recv().await
    }

    pub fn disconnect(self) {
        // Drop does the work.
    }
}

impl Drop for MonitorConnection {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn stream_events(
    client: reqwest::Client,
    endpoint: String,
    max_attempts: u32,
    base_delay: Duration,
    sender: mpsc::Sender<MonitorEvent>,
) {
    let mut failures = 0u32;
    loop {
        match client.get(&endpoint).send().await {
            Ok(response) if response.status().is_success() => {
                let mut buffer = String::new();
                let mut stream = response.bytes_stream();
                while let Some(chunk) = stream.next().await {
                    let Ok(bytes) = chunk else { break };
                    buffer.push_str(&String::from_utf8_lossy(&bytes));
                    while let Some(pos) = buffer.find("\n\n") {
                        let frame: String = buffer.drain(..pos + 2).collect();
                        if let Some(event) = parse_sse_frame(&frame) {
                            // A delivered event proves the stream healthy.
                            failures = 0;
                            if sender.send(event).await.is_err() {
                                return;
                            }
                        }
                    }
                }
                tracing::debug!("monitor stream ended, reconnecting");
            }
            Ok(response) => {
                tracing::warn!(status = %response.status(), "monitor endpoint rejected connection");
            }
            Err(err) => {
                tracing::warn!(error = %err, "monitor connection failed");
            }
        }

        failures += 1;
        if failures >= max_attempts {
            tracing::warn!(attempts = failures, "monitor client giving up");
            return;
        }
        tokio::time::sleep(reconnect_delay(base_delay, failures)).await;
    }
}

/// Jittered exponential delay between reconnection attempts.
fn reconnect_delay(base: Duration, failures: u32) -> Duration {
    let capped = base.saturating_mul(2u32.saturating_pow(failures.min(MAX_EXPONENT)));
    let jitter_ms = rand::thread_rng().gen_range(0..=(capped.as_millis() as u64) / 10 + 1);
    capped + Duration::from_millis(jitter_ms)
}

/// Extract the JSON payload from one SSE frame.
fn parse_sse_frame(frame: &str) -> Option<MonitorEvent> {
    let data: String = frame
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(str::trim_start)
        .collect::<Vec<_>>()
        .join("\n");
    if data.is_empty() {
        return None;
    }
    serde_json::from_str(&data).ok()
}
