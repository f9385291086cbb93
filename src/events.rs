//! Event surface for an embedding shell.
//!
//! Services publish on a broadcast channel; the shell renders toasts and
//! status indicators from whatever it subscribes to. Emission is
//! fire-and-forget: nothing in the core waits on a listener.

use serde::Serialize;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AppEvent {
    NetworkStatus {
        online: bool,
    },
    SyncStarted,
    /// Aggregated drain outcome; one event per pass, never per-item popups.
    SyncCompleted {
        success: u32,
        conflicts: u32,
        failed: u32,
    },
    /// A write landed in the offline queue instead of the store.
    SavedOffline {
        item_type: String,
    },
    /// A record's edit window closes in under an hour.
    EditWindowWarning {
        record_id: String,
        item_type: String,
    },
    /// Cross-role alert: a farm has no statistics recorded for a date.
    MissingStatistics {
        farm_id: String,
        date: String,
        note: Option<String>,
    },
}

/// Shared event publisher.
#[derive(Clone)]
pub struct Notifier {
    tx: broadcast::Sender<AppEvent>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event; silently drops it when no listener is attached.
    pub fn emit(&self, event: AppEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AppEvent> {
        self.tx.subscribe()
    }
}
