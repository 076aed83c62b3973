//! GET /stream?session_id=… — long-lived progress event stream (SSE).
//!
//! Each event body is `{id, type, level, message, timestamp, details}`.
//! Keep-alive comments flow every `gateway.heartbeat_seconds` so idle
//! streams survive proxies. Closing the connection drops only this
//! subscription; in-flight work is never cancelled.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::stream::Stream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use finsight_core::types::ProgressEvent;

use crate::app::AppState;

#[derive(Deserialize)]
pub struct StreamQuery {
    pub session_id: String,
}

/// Wire shape of one stream event.
#[derive(Serialize)]
struct StreamEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    level: String,
    message: String,
    timestamp: String,
    details: serde_json::Map<String, serde_json::Value>,
}

impl From<ProgressEvent> for StreamEvent {
    fn from(ev: ProgressEvent) -> Self {
        Self {
            id: ev.id,
            event_type: ev.event_type.to_string(),
            level: ev.level.to_string(),
            message: ev.message,
            timestamp: ev.created_at,
            details: ev.details,
        }
    }
}

pub async fn stream_handler(
    State(state): State<Arc<AppState>>,
    Query(q): Query<StreamQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    debug!(session_id = %q.session_id, "stream subscriber attached");
    let rx = state.orch.bus.subscribe(&q.session_id);
    let heartbeat = state.orch.config.gateway.heartbeat_seconds;

    let stream = ReceiverStream::new(rx).map(|ev| {
        let wire = StreamEvent::from(ev);
        Ok(Event::default()
            .json_data(&wire)
            .unwrap_or_else(|_| Event::default().data("{\"error\":\"serialization\"}")))
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(heartbeat))
            .text("{\"type\":\"heartbeat\"}"),
    )
}
