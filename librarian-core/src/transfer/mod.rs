//! Transfer coordinator: moves a payload to the store holding its
//! reservation, then commits or releases that reservation.

pub mod local;
pub mod rsync;
mod tree;

pub use local::{DiskUsageProbe, LocalTransport};
pub use rsync::{RemoteDuProbe, RsyncTransport};

use crate::events::{EventBus, LibrarianEvent, ReleaseReason};
use crate::ledger::{CapacityLedger, Reservation, ReservationState};
use crate::registry::StoreRegistry;
use crate::retry::BackoffPolicy;
use crate::store::Store;
use crate::{LibrarianError, Result};
use async_trait::async_trait;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

/// Byte-moving capability of a store backend.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Bulk-copies the payload to the store's rsync endpoint.
    async fn push(&self, store: &Store, payload: &Payload) -> Result<()>;

    /// Makes the payload fetchable from the store and returns its URL.
    async fn expose_for_pull(&self, store: &Store, payload: &Payload) -> Result<String>;
}

/// Reports how many bytes a store actually holds.
#[async_trait]
pub trait UsageProbe: Send + Sync {
    async fn occupied_bytes(&self, store: &Store) -> Result<u64>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStrategy {
    Push,
    Pull,
}

/// A local file or directory to be delivered under `name` on the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub name: String,
    pub source: PathBuf,
    pub size_bytes: u64,
}

impl Payload {
    /// Builds a payload from a local path, measuring its size. Directories
    /// count the sum of all regular files below them.
    pub async fn from_path(source: impl Into<PathBuf>, name: &str) -> Result<Self> {
        let source = source.into();
        let size_bytes = tree::tree_bytes(source.clone()).await?;
        Ok(Self {
            name: normalize_payload_name(name)?,
            source,
            size_bytes,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub payload: Payload,
    pub strategy: TransferStrategy,
}

impl Delivery {
    pub fn push(payload: Payload) -> Self {
        Self {
            payload,
            strategy: TransferStrategy::Push,
        }
    }

    pub fn pull(payload: Payload) -> Self {
        Self {
            payload,
            strategy: TransferStrategy::Pull,
        }
    }

    /// Push for bulk ingestion, pull when a consumer will fetch on demand.
    pub fn for_consumer(payload: Payload, fetch_on_demand: bool) -> Self {
        if fetch_on_demand {
            Self::pull(payload)
        } else {
            Self::push(payload)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransferResult {
    pub reservation: Reservation,
    pub strategy: TransferStrategy,
    pub attempts: usize,
    pub url: Option<String>,
}

pub struct TransferCoordinator {
    registry: Arc<StoreRegistry>,
    ledger: Arc<CapacityLedger>,
    transport: Arc<dyn Transport>,
    backoff: BackoffPolicy,
    workers: Arc<Semaphore>,
    events: EventBus,
}

impl TransferCoordinator {
    pub fn new(
        registry: Arc<StoreRegistry>,
        ledger: Arc<CapacityLedger>,
        transport: Arc<dyn Transport>,
        backoff: BackoffPolicy,
        workers: usize,
        events: EventBus,
    ) -> Self {
        Self {
            registry,
            ledger,
            transport,
            backoff,
            workers: Arc::new(Semaphore::new(workers.max(1))),
            events,
        }
    }

    /// Runs the delivery on the worker pool so callers never wait on the
    /// network while holding up placement.
    pub fn spawn_delivery(
        self: &Arc<Self>,
        reservation: Reservation,
        delivery: Delivery,
    ) -> JoinHandle<Result<TransferResult>> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let _permit = match Arc::clone(&coordinator.workers).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    return Err(LibrarianError::Internal(
                        "transfer worker pool closed".to_string(),
                    ));
                }
            };
            coordinator.deliver(&reservation, &delivery).await
        })
    }

    /// Moves the payload with bounded exponential backoff. Success commits
    /// the reservation; exhaustion releases it and reports `TransferFailed`,
    /// after which the caller may place again, possibly on another store.
    /// Errors that are not transient release the reservation at once and are
    /// returned unchanged.
    pub async fn deliver(
        &self,
        reservation: &Reservation,
        delivery: &Delivery,
    ) -> Result<TransferResult> {
        let store = match self.target_store(reservation, delivery).await {
            Ok(store) => store,
            Err(error) => {
                self.release_failed(reservation).await;
                return Err(error);
            }
        };

        let mut backoff = self.backoff.handle();
        let mut attempt = 0usize;
        let (url, attempts) = loop {
            attempt += 1;
            let outcome = match delivery.strategy {
                TransferStrategy::Push => self
                    .transport
                    .push(&store, &delivery.payload)
                    .await
                    .map(|_| None),
                TransferStrategy::Pull => self
                    .transport
                    .expose_for_pull(&store, &delivery.payload)
                    .await
                    .map(Some),
            };

            match outcome {
                Ok(url) => break (url, attempt),
                Err(error) => {
                    tracing::warn!(
                        store = %store.name,
                        reservation = %reservation.id,
                        attempt,
                        "transfer attempt failed: {}",
                        error
                    );
                    self.events.publish(LibrarianEvent::TransferAttemptFailed {
                        reservation: reservation.id,
                        store: store.name.clone(),
                        strategy: delivery.strategy,
                        attempt,
                        reason: error.to_string(),
                    });

                    if !error.is_transient() {
                        self.release_failed(reservation).await;
                        return Err(error);
                    }

                    match backoff.next_delay() {
                        Some(delay) => tokio::time::sleep(delay).await,
                        None => {
                            self.release_failed(reservation).await;
                            return Err(LibrarianError::TransferFailed {
                                reason: format!(
                                    "{} attempt(s) to store {} exhausted: {}",
                                    attempt, store.name, error
                                ),
                            });
                        }
                    }
                }
            }
        };

        let committed = match self.ledger.commit(reservation.id).await {
            Ok(committed) => committed,
            Err(LibrarianError::AlreadyResolved {
                state: ReservationState::Released,
                ..
            }) => self.reaccount(&store, reservation, delivery).await?,
            Err(error) => {
                tracing::warn!(
                    store = %store.name,
                    reservation = %reservation.id,
                    "payload delivered but reservation could not be committed: {}",
                    error
                );
                return Err(error);
            }
        };

        Ok(TransferResult {
            reservation: committed,
            strategy: delivery.strategy,
            attempts,
            url,
        })
    }

    async fn target_store(
        &self,
        reservation: &Reservation,
        delivery: &Delivery,
    ) -> Result<Arc<Store>> {
        if delivery.payload.size_bytes > reservation.bytes {
            return Err(LibrarianError::InvalidRequest(format!(
                "payload {} is {} bytes but reservation {} covers {}",
                delivery.payload.name, delivery.payload.size_bytes, reservation.id, reservation.bytes
            )));
        }

        Ok(self.registry.lookup(&reservation.store).await?.store)
    }

    /// The reservation expired while its payload was in flight, yet the bytes
    /// are on the store now. Reserve and commit them again there.
    async fn reaccount(
        &self,
        store: &Store,
        expired: &Reservation,
        delivery: &Delivery,
    ) -> Result<Reservation> {
        tracing::warn!(
            store = %store.name,
            reservation = %expired.id,
            "reservation expired during transfer, reserving the landed bytes again"
        );

        let unaccounted = |error: LibrarianError| LibrarianError::UnaccountedDelivery {
            store: store.name.clone(),
            name: delivery.payload.name.clone(),
            reason: error.to_string(),
        };
        let replacement = self
            .ledger
            .reserve(&store.name, expired.bytes)
            .await
            .map_err(unaccounted)?;
        self.ledger.commit(replacement.id).await.map_err(unaccounted)
    }

    async fn release_failed(&self, reservation: &Reservation) {
        if let Err(error) = self
            .ledger
            .release_with_reason(reservation.id, ReleaseReason::TransferFailed)
            .await
        {
            tracing::warn!(
                reservation = %reservation.id,
                "failed to release reservation after transfer failure: {}",
                error
            );
        }
    }
}

/// Location under the store's HTTP endpoint where a pulled payload lives.
pub fn pull_url(store: &Store, name: &str) -> Result<String> {
    let base = if store.http_endpoint.ends_with('/') {
        store.http_endpoint.clone()
    } else {
        format!("{}/", store.http_endpoint)
    };

    let url = Url::parse(&base)
        .and_then(|base| base.join(name))
        .map_err(|error| {
            LibrarianError::InvalidRequest(format!(
                "invalid http endpoint {} for store {}: {}",
                store.http_endpoint, store.name, error
            ))
        })?;

    Ok(url.to_string())
}

pub(crate) fn normalize_payload_name(input: &str) -> Result<String> {
    let trimmed = input.trim_matches('/');
    if trimmed.is_empty() {
        return Err(LibrarianError::InvalidRequest(
            "payload name cannot be empty".to_string(),
        ));
    }

    let mut parts = Vec::new();
    for part in trimmed.split('/') {
        if part.is_empty() || part == "." || part == ".." {
            return Err(LibrarianError::InvalidRequest(format!(
                "invalid payload name component: {}",
                part
            )));
        }
        parts.push(part);
    }

    Ok(parts.join("/"))
}
