use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::debug;

use finsight_core::types::{ProgressEvent, ProgressEventType, ProgressLevel};
use finsight_store::{Result, StoreGateway};

/// Per-subscriber channel depth. A stream endpoint that forwards promptly
/// never comes close to this.
const SUBSCRIBER_BUFFER: usize = 64;

/// How long a delivery may wait on a full subscriber before the event is
/// counted as dropped for that subscriber.
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(1);

static NEXT_SUBSCRIBER_ID: AtomicU64 = AtomicU64::new(0);

#[derive(Clone)]
struct Subscriber {
    id: u64,
    tx: mpsc::Sender<ProgressEvent>,
    /// Events this subscriber missed since its last successful delivery.
    dropped: Arc<AtomicU64>,
}

/// Fan-out of progress events to per-session subscribers.
///
/// `emit` appends to the durable log only; the monitor polls the log and
/// calls [`ProgressBus::deliver`], so in-process delivery is at-least-once
/// and survives emitter crashes. Duplicate suppression by event id is the
/// subscriber's concern.
pub struct ProgressBus {
    store: Arc<StoreGateway>,
    subscribers: DashMap<String, Vec<Subscriber>>,
}

impl ProgressBus {
    pub fn new(store: Arc<StoreGateway>) -> Self {
        Self {
            store,
            subscribers: DashMap::new(),
        }
    }

    /// Append an event to the durable log. Delivery happens on the next
    /// monitor poll.
    pub fn emit(&self, event: &ProgressEvent) -> Result<()> {
        self.store.append_progress_event(event)
    }

    /// Register a subscriber for one session. The stream sees every event
    /// appended from this moment on.
    pub fn subscribe(&self, session_id: &str) -> mpsc::Receiver<ProgressEvent> {
        self.subscribe_with_capacity(session_id, SUBSCRIBER_BUFFER)
    }

    pub fn subscribe_with_capacity(
        &self,
        session_id: &str,
        capacity: usize,
    ) -> mpsc::Receiver<ProgressEvent> {
        let (tx, rx) = mpsc::channel(capacity);
        let sub = Subscriber {
            id: NEXT_SUBSCRIBER_ID.fetch_add(1, Ordering::Relaxed),
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        };
        debug!(session_id, subscriber = sub.id, "progress subscriber registered");
        self.subscribers
            .entry(session_id.to_string())
            .or_default()
            .push(sub);
        rx
    }

    /// Number of live subscribers for a session (closed channels pruned).
    pub fn subscriber_count(&self, session_id: &str) -> usize {
        match self.subscribers.get_mut(session_id) {
            Some(mut entry) => {
                entry.retain(|s| !s.tx.is_closed());
                entry.len()
            }
            None => 0,
        }
    }

    /// Push one event to every subscriber of its session.
    ///
    /// A subscriber that cannot accept within [`DELIVERY_TIMEOUT`] misses
    /// the event; before its next successful delivery it receives a
    /// `dropped N events` marker so the gap is visible downstream. One slow
    /// subscriber never blocks the others beyond that timeout.
    pub async fn deliver(&self, event: &ProgressEvent) {
        // Snapshot outside the map guard — sends await.
        let subs: Vec<Subscriber> = match self.subscribers.get_mut(&event.session_id) {
            Some(mut entry) => {
                entry.retain(|s| !s.tx.is_closed());
                entry.clone()
            }
            None => return,
        };

        for sub in subs {
            deliver_to(&sub, event.clone()).await;
        }
    }
}

async fn deliver_to(sub: &Subscriber, event: ProgressEvent) {
    let session_id = event.session_id.clone();
    let pending = sub.dropped.load(Ordering::Relaxed);
    if pending > 0 {
        let mut marker = ProgressEvent::info(&session_id, format!("dropped {pending} events"));
        marker.level = ProgressLevel::Warn;
        marker.event_type = ProgressEventType::Generic;
        marker
            .details
            .insert("dropped".into(), json!(pending));
        match tokio::time::timeout(DELIVERY_TIMEOUT, sub.tx.send(marker)).await {
            Ok(Ok(())) => sub.dropped.store(0, Ordering::Relaxed),
            _ => {
                // Still wedged; the current event joins the dropped count.
                sub.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
    }

    match tokio::time::timeout(DELIVERY_TIMEOUT, sub.tx.send(event)).await {
        Ok(Ok(())) => {}
        _ => {
            sub.dropped.fetch_add(1, Ordering::Relaxed);
            debug!(subscriber = sub.id, %session_id, "subscriber full, event dropped");
        }
    }
}
