//! Librarian Core - store placement and capacity accounting for the
//! observatory archive

pub mod config;
pub mod error;
pub mod events;
pub mod journal;
pub mod ledger;
pub mod librarian;
pub mod placement;
pub mod reconcile;
pub mod registry;
pub mod retry;
pub mod store;
pub mod transfer;

pub use config::{
    JournalConfig, LibrarianConfig, PlacementConfig, ReconciliationConfig, TransferConfig,
    TransferDriver,
};
pub use error::{LibrarianError, Result};
pub use events::{EventBus, LibrarianEvent, ReleaseReason};
pub use journal::{
    Admission, DurableUsage, NullJournal, PersistedState, PersistedStore, Reconciled, Resolution,
    SqliteJournal, StateJournal, StoreSnapshot,
};
pub use ledger::{
    CapacityLedger, Reservation, ReservationId, ReservationState, StoreUsage, UsageCorrection,
};
pub use librarian::{Backends, Librarian, StoreReport};
pub use placement::{Candidate, Placement, PlacementEngine, PlacementPolicy, PlacementRequest};
pub use reconcile::{ReconciliationSweep, SweepConfig, SweepReport};
pub use registry::{StoreEntry, StoreListing, StoreRegistry};
pub use retry::{BackoffHandle, BackoffPolicy};
pub use store::{SourcePipeline, Store, StoreDescriptor, StoreStatus};
pub use transfer::{
    Delivery, DiskUsageProbe, LocalTransport, Payload, RemoteDuProbe, RsyncTransport,
    TransferCoordinator, TransferResult, TransferStrategy, Transport, UsageProbe,
};
