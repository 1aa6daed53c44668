use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use cv_core::events::EventRecord;

/// A broadcast-style event bus built on top of flume channels.
///
/// Each call to [`subscribe`](EventBus::subscribe) creates a receiver that
/// gets every record published after the subscription was created. Clones
/// share the same subscriber list.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<Vec<flume::Sender<EventRecord>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn senders(&self) -> MutexGuard<'_, Vec<flume::Sender<EventRecord>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self) -> flume::Receiver<EventRecord> {
        let (tx, rx) = flume::unbounded();
        self.senders().push(tx);
        rx
    }

    /// Publish a record to all current subscribers. Disconnected subscribers
    /// are pruned.
    pub fn publish(&self, record: EventRecord) {
        self.senders().retain(|tx| tx.send(record.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.senders().len()
    }
}
