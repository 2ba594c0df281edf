//! The librarian core as one object: registry, ledger, placement, transfers
//! and the reconciliation sweep wired to a shared journal and event bus.

use crate::config::{LibrarianConfig, TransferDriver};
use crate::events::{EventBus, LibrarianEvent};
use crate::journal::{NullJournal, PersistedState, SqliteJournal, StateJournal};
use crate::ledger::{CapacityLedger, Reservation, ReservationId, StoreUsage};
use crate::placement::{Candidate, Placement, PlacementEngine, PlacementRequest};
use crate::reconcile::{ReconciliationSweep, SweepReport};
use crate::registry::StoreRegistry;
use crate::store::{Store, StoreDescriptor, StoreStatus};
use crate::transfer::{
    Delivery, DiskUsageProbe, LocalTransport, RemoteDuProbe, RsyncTransport, TransferCoordinator,
    TransferResult, Transport, UsageProbe,
};
use crate::{LibrarianError, Result};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;

/// The pluggable edges of the core.
#[derive(Clone)]
pub struct Backends {
    pub transport: Arc<dyn Transport>,
    pub probe: Arc<dyn UsageProbe>,
    pub journal: Arc<dyn StateJournal>,
}

impl Backends {
    /// Drivers named by configuration: local copies measured on disk, or
    /// rsync measured with `du` over ssh. The journal is SQLite when a path
    /// is configured and in-memory otherwise.
    pub fn from_config(config: &LibrarianConfig) -> Result<Self> {
        let (transport, probe): (Arc<dyn Transport>, Arc<dyn UsageProbe>) =
            match config.transfer.driver {
                TransferDriver::Local => (
                    Arc::new(LocalTransport::new()),
                    Arc::new(DiskUsageProbe::new()),
                ),
                TransferDriver::Rsync => (
                    Arc::new(
                        RsyncTransport::new(config.transfer.rsync_binary.clone())
                            .with_args(config.transfer.rsync_args.clone()),
                    ),
                    Arc::new(RemoteDuProbe::default()),
                ),
            };

        let journal: Arc<dyn StateJournal> = match &config.journal {
            Some(journal) => Arc::new(SqliteJournal::open(&journal.path)?),
            None => Arc::new(NullJournal),
        };

        Ok(Self {
            transport,
            probe,
            journal,
        })
    }
}

/// One row of the usage report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoreReport {
    pub name: String,
    pub status: StoreStatus,
    #[serde(flatten)]
    pub usage: StoreUsage,
    pub free_fraction: f64,
}

pub struct Librarian {
    registry: Arc<StoreRegistry>,
    ledger: Arc<CapacityLedger>,
    placement: PlacementEngine,
    transfers: Arc<TransferCoordinator>,
    sweep: Arc<ReconciliationSweep>,
    journal: Arc<dyn StateJournal>,
    events: EventBus,
    shutdown_tx: watch::Sender<bool>,
    sweep_task: Mutex<Option<JoinHandle<()>>>,
}

impl Librarian {
    /// Builds the core and restores persisted state.
    ///
    /// Configured stores come first in configuration order, followed by any
    /// store the journal knows that configuration no longer lists. A store
    /// decommissioned in a previous run stays decommissioned.
    pub async fn open(config: &LibrarianConfig, backends: Backends) -> Result<Self> {
        config.validate()?;

        let events = EventBus::new();
        let registry = Arc::new(StoreRegistry::new());
        let ledger = Arc::new(CapacityLedger::new(
            Arc::clone(&backends.journal),
            events.clone(),
        ));
        let placement = PlacementEngine::new(
            Arc::clone(&registry),
            Arc::clone(&ledger),
            config.placement_policy(),
            events.clone(),
        );
        let transfers = Arc::new(TransferCoordinator::new(
            Arc::clone(&registry),
            Arc::clone(&ledger),
            backends.transport,
            config.backoff_policy(),
            config.transfer.workers,
            events.clone(),
        ));
        let sweep = Arc::new(ReconciliationSweep::new(
            Arc::clone(&registry),
            Arc::clone(&ledger),
            backends.probe,
            config.sweep_config(),
        ));
        let (shutdown_tx, _) = watch::channel(false);

        let librarian = Self {
            registry,
            ledger,
            placement,
            transfers,
            sweep,
            journal: backends.journal,
            events,
            shutdown_tx,
            sweep_task: Mutex::new(None),
        };

        let persisted = librarian.journal.load()?;
        for descriptor in &config.stores {
            let mut descriptor = descriptor.clone();
            if let Some(previous) = persisted.store(descriptor.name.trim()) {
                descriptor.available &= previous.descriptor.available;
            }
            librarian.restore_store(&descriptor, &persisted).await?;
        }
        for previous in &persisted.stores {
            if librarian.registry.lookup(&previous.descriptor.name).await.is_err() {
                librarian
                    .restore_store(&previous.descriptor, &persisted)
                    .await?;
            }
        }

        tracing::info!(
            stores = librarian.registry.list().await.len(),
            reservations = persisted.reservations.len(),
            "librarian opened"
        );

        Ok(librarian)
    }

    async fn restore_store(
        &self,
        descriptor: &StoreDescriptor,
        persisted: &PersistedState,
    ) -> Result<()> {
        let store = self.registry.register(descriptor).await?;
        let (used, reservations) = match persisted.store(&store.name) {
            Some(previous) => (
                previous.used,
                persisted.reservations_for(&store.name).cloned().collect(),
            ),
            None => (0, Vec::new()),
        };
        self.ledger
            .restore_account(&store, used, reservations)
            .await?;
        self.registered(&store, descriptor.available);
        Ok(())
    }

    fn registered(&self, store: &Store, available: bool) {
        self.persist_store(&StoreDescriptor::from_store(store, available));
        tracing::info!(
            store = %store.name,
            capacity = store.capacity,
            available,
            "store registered"
        );
        self.events.publish(LibrarianEvent::StoreRegistered {
            store: store.name.clone(),
            capacity: store.capacity,
            available,
        });
    }

    fn persist_store(&self, descriptor: &StoreDescriptor) {
        if let Err(error) = self.journal.store_upserted(descriptor) {
            tracing::warn!(store = %descriptor.name, "failed to journal store: {}", error);
        }
    }

    pub fn registry(&self) -> &Arc<StoreRegistry> {
        &self.registry
    }

    pub fn ledger(&self) -> &Arc<CapacityLedger> {
        &self.ledger
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LibrarianEvent> {
        self.events.subscribe()
    }

    /// Adds a store at runtime with an empty account.
    pub async fn register_store(&self, descriptor: &StoreDescriptor) -> Result<Arc<Store>> {
        let store = self.registry.register(descriptor).await?;
        self.ledger.open_account(&store, 0).await?;
        self.registered(&store, descriptor.available);
        Ok(store)
    }

    pub async fn decommission_store(&self, name: &str) -> Result<()> {
        if !self.registry.decommission(name).await? {
            return Ok(());
        }

        let entry = self.registry.lookup(name).await?;
        self.persist_store(&StoreDescriptor::from_store(&entry.store, false));
        tracing::info!(store = %name, "store decommissioned");
        self.events.publish(LibrarianEvent::StoreDecommissioned {
            store: name.to_string(),
        });
        Ok(())
    }

    /// Forgets a decommissioned store whose account holds no used or
    /// reserved bytes.
    pub async fn purge_store(&self, name: &str) -> Result<()> {
        let entry = self.registry.lookup(name).await?;
        if entry.is_available() {
            return Err(LibrarianError::InvalidRequest(format!(
                "store {} must be decommissioned before it is purged",
                name
            )));
        }

        self.ledger.close_account(name).await?;
        self.registry.remove(name).await?;
        if let Err(error) = self.journal.store_removed(name) {
            tracing::warn!(store = %name, "failed to journal store removal: {}", error);
        }

        tracing::info!(store = %name, "store purged");
        self.events.publish(LibrarianEvent::StorePurged {
            store: name.to_string(),
        });
        Ok(())
    }

    pub async fn place(&self, request: &PlacementRequest) -> Result<Placement> {
        self.placement.choose(request).await
    }

    pub async fn recommend(&self, request: &PlacementRequest) -> Result<Candidate> {
        self.placement.recommend(request).await
    }

    /// Cancels a pending reservation.
    pub async fn release(&self, id: ReservationId) -> Result<Reservation> {
        self.ledger.release(id).await
    }

    /// Hands an already placed payload to the transfer worker pool.
    pub fn deliver(
        &self,
        placement: Placement,
        delivery: Delivery,
    ) -> JoinHandle<Result<TransferResult>> {
        self.transfers.spawn_delivery(placement.reservation, delivery)
    }

    /// Places the payload, delivers it and waits for the outcome. A failed
    /// delivery has already released its reservation when this returns.
    pub async fn ingest(
        &self,
        request: &PlacementRequest,
        delivery: Delivery,
    ) -> Result<TransferResult> {
        let placement = self.place(request).await?;
        self.deliver(placement, delivery)
            .await
            .map_err(|error| LibrarianError::Internal(format!("transfer task failed: {}", error)))?
    }

    /// Usage of every registered store in registration order.
    pub async fn usage_report(&self) -> Vec<StoreReport> {
        let listing = self.registry.list().await;
        let mut report = Vec::with_capacity(listing.len());
        for entry in &listing {
            let usage = match self.ledger.usage(entry.name()).await {
                Ok(usage) => usage,
                Err(error) => {
                    tracing::debug!(store = %entry.name(), "store vanished from report: {}", error);
                    continue;
                }
            };
            let free_fraction = if usage.capacity == 0 {
                0.0
            } else {
                usage.free as f64 / usage.capacity as f64
            };
            report.push(StoreReport {
                name: entry.name().to_string(),
                status: entry.status,
                usage,
                free_fraction,
            });
        }
        report
    }

    pub async fn sweep_once(&self) -> Result<SweepReport> {
        self.sweep.sweep_once().await
    }

    /// Starts the periodic reconciliation sweep. Calling it again while the
    /// sweep runs does nothing.
    pub async fn start_reconciliation(&self) {
        let mut task = self.sweep_task.lock().await;
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        self.shutdown_tx.send_replace(false);
        let shutdown_rx = self.shutdown_tx.subscribe();
        tracing::info!(
            interval_secs = self.sweep.config().interval.as_secs(),
            "starting reconciliation sweep"
        );
        *task = Some(Arc::clone(&self.sweep).start(shutdown_rx));
    }

    /// Stops the sweep and waits for it to exit. In-flight deliveries are
    /// left to finish on their own tasks.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        let handle = self.sweep_task.lock().await.take();
        if let Some(handle) = handle {
            if let Err(error) = handle.await {
                tracing::warn!("reconciliation task ended abnormally: {}", error);
            }
        }
        tracing::info!("librarian shut down");
    }
}
