//! Real-time monitor channel: an SSE stream of sync lifecycle events.
//!
//! Clients reconnect with jittered exponential backoff on their side; the
//! keep-alive comment keeps intermediaries from closing idle streams.

use std::convert::Infallible;

use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
    routing::get,
    Router,
};
use futures::stream::Stream;
use tokio::sync::broadcast::error::RecvError;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/sync/monitor", get(monitor_stream))
}

/// GET /sync/monitor - Subscribe to sync lifecycle events
async fn monitor_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = state.monitor.subscribe();

    let stream = futures::stream::unfold(receiver, |mut receiver| async move {
        loop {
            match receiver.recv().await {
                Ok(event) => match Event::default().json_data(&event) {
                    Ok(sse_event) => return Some((Ok(sse_event), receiver)),
                    Err(err) => {
                        tracing::warn!(error = %err, "failed to serialize monitor event");
                        continue;
                    }
                },
                // A slow consumer skips the overwritten backlog and
                // continues from the current position.
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "monitor subscriber lagged");
                    continue;
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
