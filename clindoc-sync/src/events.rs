//! Outcome notifications for UI collaborators
//!
//! Only final outcomes are reported. Whether a save reached the server or
//! stayed local is deliberately not part of the event.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::ids::{EntityKind, RecordId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    Saved {
        kind: EntityKind,
        id: RecordId,
    },
    NotSaved {
        kind: EntityKind,
        id: RecordId,
        reason: String,
    },
    Signed {
        encounter_id: RecordId,
        signed_by: String,
    },
    Deleted {
        kind: EntityKind,
        id: RecordId,
    },
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: SyncEvent);
}

/// Discards every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn emit(&self, _event: SyncEvent) {}
}

/// Fans events out to any number of subscribers
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    sender: broadcast::Sender<SyncEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventSink for BroadcastSink {
    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine: nobody is listening
        if self.sender.send(event).is_err() {
            tracing::trace!("Sync event dropped, no subscribers");
        }
    }
}
