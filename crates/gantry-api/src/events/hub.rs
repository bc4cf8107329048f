//! In-process fan-out of freshly appended build events.

use gantry_core::{BuildEvent, BuildId};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

/// Per-build broadcast channels.
///
/// Publishing never waits on subscribers. Each subscriber has a bounded
/// buffer; one that falls further behind sees `RecvError::Lagged`.
pub struct EventHub {
    channels: Mutex<HashMap<BuildId, broadcast::Sender<BuildEvent>>>,
    capacity: usize,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe(&self, build_id: BuildId) -> broadcast::Receiver<BuildEvent> {
        let mut channels = self.lock();
        channels
            .entry(build_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    pub fn publish(&self, event: BuildEvent) {
        let mut channels = self.lock();
        let build_id = event.build_id;
        if let Some(sender) = channels.get(&build_id) {
            if sender.send(event).is_err() {
                // Nobody is watching any more.
                channels.remove(&build_id);
            }
        }
    }

    /// Hand back a receiver, dropping the build's channel once nobody
    /// else is subscribed.
    pub fn unsubscribe(&self, build_id: BuildId, receiver: broadcast::Receiver<BuildEvent>) {
        let mut channels = self.lock();
        drop(receiver);
        let idle = channels
            .get(&build_id)
            .is_some_and(|sender| sender.receiver_count() == 0);
        if idle {
            channels.remove(&build_id);
            debug!(build_id = %build_id, "Released idle event channel");
        }
    }

    /// Drop the build's channel. Subscribers drain what is buffered, then
    /// see `RecvError::Closed`.
    pub fn close(&self, build_id: BuildId) {
        if self.lock().remove(&build_id).is_some() {
            debug!(build_id = %build_id, "Closed event channel");
        }
    }

    pub fn channel_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<BuildId, broadcast::Sender<BuildEvent>>> {
        // The map holds no invariants a panicking holder could break.
        self.channels.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
