use crate::ledger::ReservationId;
use crate::transfer::TransferStrategy;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Lifecycle events published for external log and metrics collectors.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LibrarianEvent {
    StoreRegistered {
        store: String,
        capacity: u64,
        available: bool,
    },
    StoreDecommissioned {
        store: String,
    },
    StorePurged {
        store: String,
    },
    PlacementDecided {
        store: String,
        pipeline: String,
        bytes: u64,
        attempts: usize,
    },
    ReservationCreated {
        reservation: ReservationId,
        store: String,
        bytes: u64,
    },
    ReservationCommitted {
        reservation: ReservationId,
        store: String,
        bytes: u64,
        used: u64,
    },
    ReservationReleased {
        reservation: ReservationId,
        store: String,
        bytes: u64,
        reason: ReleaseReason,
    },
    TransferAttemptFailed {
        reservation: ReservationId,
        store: String,
        strategy: TransferStrategy,
        attempt: usize,
        reason: String,
    },
    UsageCorrected {
        store: String,
        previous: u64,
        observed: u64,
        corrected: u64,
        at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseReason {
    Cancelled,
    TransferFailed,
    Expired,
}

/// Fan-out point for [`LibrarianEvent`]s. Cloning shares the channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<LibrarianEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LibrarianEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: LibrarianEvent) {
        // No receivers is the normal case for embedded use.
        let _ = self.sender.send(event);
    }
}
