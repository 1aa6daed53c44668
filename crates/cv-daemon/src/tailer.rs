use std::time::Duration;

use cv_bridge::event_bus::EventBus;
use cv_core::event_log::EventLog;
use cv_harness::shutdown::ShutdownSignal;
use tracing::{debug, warn};

const TAIL_BATCH: usize = 500;

/// Follows the event log and republishes every new record on the
/// in-process bus. Other processes append to the same store, so polling is
/// the only way to observe them.
pub struct EventTailer {
    events: EventLog,
    bus: EventBus,
    poll: Duration,
}

impl EventTailer {
    pub fn new(events: EventLog, bus: EventBus, poll: Duration) -> Self {
        Self { events, bus, poll }
    }

    /// Tail from `after` until shutdown. Returns the last cursor published.
    pub async fn run(&self, mut after: u64, shutdown: ShutdownSignal) -> u64 {
        let mut stop = shutdown.subscribe();
        loop {
            match self.events.read_from(after, TAIL_BATCH).await {
                Ok(batch) => {
                    let full = batch.len() == TAIL_BATCH;
                    for record in batch {
                        after = record.cursor;
                        self.bus.publish(record);
                    }
                    if full {
                        continue;
                    }
                }
                Err(e) => warn!(error = %e, after, "event tail read failed"),
            }
            tokio::select! {
                _ = tokio::time::sleep(self.poll) => {}
                _ = stop.stopped() => {
                    debug!(after, "event tailer stopping");
                    return after;
                }
            }
        }
    }
}
