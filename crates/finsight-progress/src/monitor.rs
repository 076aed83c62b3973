use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info};

use finsight_store::StoreGateway;

use crate::bus::ProgressBus;

/// Batch size per poll; anything beyond this waits for the next tick.
const POLL_BATCH: usize = 50;

/// Backoff applied after a storage error before polling again.
const ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Bridges the durable progress log to in-process subscribers.
///
/// Polls unprocessed events in append order, delivers each through the bus,
/// then marks it processed — even when delivery failed, so a wedged
/// subscriber cannot wedge the cursor.
pub struct ProgressMonitor {
    store: Arc<StoreGateway>,
    bus: Arc<ProgressBus>,
    poll_interval: Duration,
}

impl ProgressMonitor {
    pub fn new(store: Arc<StoreGateway>, bus: Arc<ProgressBus>, poll_interval: Duration) -> Self {
        Self {
            store,
            bus,
            poll_interval,
        }
    }

    /// Main loop. Polls until `shutdown` broadcasts `true`.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("progress monitor started");
        let mut interval = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        error!("progress monitor poll failed: {e}");
                        tokio::select! {
                            _ = tokio::time::sleep(ERROR_BACKOFF) => {}
                            _ = shutdown.changed() => {}
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("progress monitor shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Deliver one batch of unprocessed events.
    pub async fn tick(&self) -> finsight_store::Result<()> {
        let events = self.store.poll_unprocessed_events(POLL_BATCH)?;
        if events.is_empty() {
            return Ok(());
        }
        debug!(count = events.len(), "processing progress events");
        for event in events {
            self.bus.deliver(&event).await;
            self.store.mark_processed(&event.id)?;
        }
        Ok(())
    }
}
