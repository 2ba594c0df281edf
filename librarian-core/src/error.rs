use crate::ledger::{ReservationId, ReservationState};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, LibrarianError>;

#[derive(Error, Debug)]
pub enum LibrarianError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store already registered: {0}")]
    DuplicateStore(String),

    #[error("Store not found: {0}")]
    StoreNotFound(String),

    #[error("Store still holds data or pending reservations: {0}")]
    StoreNotEmpty(String),

    #[error("Insufficient capacity on store {store}: requested {requested}, free {free}")]
    InsufficientCapacity {
        store: String,
        requested: u64,
        free: u64,
    },

    #[error("No eligible store for {requested} bytes after {attempts} attempts")]
    NoEligibleStore { requested: u64, attempts: usize },

    #[error("Unknown reservation: {0}")]
    UnknownReservation(ReservationId),

    #[error("Reservation {id} already resolved as {state:?}")]
    AlreadyResolved {
        id: ReservationId,
        state: ReservationState,
    },

    #[error("Transfer failed: {reason}")]
    TransferFailed { reason: String },

    #[error("{name} landed on store {store} but could not be accounted for: {reason}")]
    UnaccountedDelivery {
        store: String,
        name: String,
        reason: String,
    },

    #[error("Content hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl LibrarianError {
    /// Errors that placement may resolve by re-ranking and trying again.
    pub fn is_capacity_race(&self) -> bool {
        matches!(self, LibrarianError::InsufficientCapacity { .. })
    }

    /// Errors a transfer may outlive by trying again after a delay.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LibrarianError::TransferFailed { .. } | LibrarianError::Io(_)
        )
    }
}

impl From<walkdir::Error> for LibrarianError {
    fn from(error: walkdir::Error) -> Self {
        LibrarianError::Io(error.into())
    }
}
