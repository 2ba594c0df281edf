//! Capacity ledger: the only writer of per-store used and reserved bytes.
//!
//! Each store has its own account behind its own mutex, so reserve, commit
//! and release against one store are linearizable while different stores
//! never contend. Journal calls run on the blocking pool while the account
//! stays locked, which keeps per-store writes in order. When the journal
//! tracks a store, its answer replaces the account's numbers; other
//! processes sharing the journal are then accounted for too.

use crate::events::{EventBus, LibrarianEvent, ReleaseReason};
use crate::journal::{Admission, DurableUsage, Reconciled, Resolution, StateJournal};
use crate::store::Store;
use crate::{LibrarianError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task;
use ulid::Ulid;

pub type ReservationId = Ulid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservationState {
    Pending,
    Committed,
    Released,
}

/// Provisionally claimed capacity on one store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub store: String,
    pub bytes: u64,
    pub created_at: DateTime<Utc>,
    pub state: ReservationState,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Reservation {
    pub fn pending(store: impl Into<String>, bytes: u64) -> Self {
        Self {
            id: Ulid::new(),
            store: store.into(),
            bytes,
            created_at: Utc::now(),
            state: ReservationState::Pending,
            resolved_at: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.state == ReservationState::Pending
    }

    fn resolve(&mut self, state: ReservationState, at: DateTime<Utc>) {
        self.state = state;
        self.resolved_at = Some(at);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreUsage {
    pub capacity: u64,
    pub used: u64,
    pub reserved: u64,
    pub free: u64,
}

impl StoreUsage {
    /// Compares `self.free / self.capacity` with `other.free / other.capacity`
    /// without floating point. A zero-capacity store counts as fully used.
    pub fn cmp_free_fraction(&self, other: &StoreUsage) -> std::cmp::Ordering {
        let lhs = if self.capacity == 0 {
            0
        } else {
            u128::from(self.free) * u128::from(other.capacity.max(1))
        };
        let rhs = if other.capacity == 0 {
            0
        } else {
            u128::from(other.free) * u128::from(self.capacity.max(1))
        };
        lhs.cmp(&rhs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageCorrection {
    pub store: String,
    pub previous: u64,
    pub observed: u64,
    /// Pending bytes that were assumed to be on the store already.
    pub in_flight: u64,
    pub corrected: u64,
}

impl UsageCorrection {
    pub fn drift(&self) -> i128 {
        i128::from(self.corrected) - i128::from(self.previous)
    }
}

/// Used bytes implied by an observed byte count, or `None` when the ledger
/// already agrees.
///
/// Payloads whose reservation is still pending may be partly or fully on the
/// store, so any observation between `used` and `used + pending` (widened by
/// `tolerance`) is accepted as is. Above that band every pending byte is
/// taken to be on disk already and left to its commit.
pub(crate) fn corrected_used(usage: DurableUsage, observed: u64, tolerance: u64) -> Option<u64> {
    let low = usage.used.saturating_sub(tolerance);
    let high = usage
        .used
        .saturating_add(usage.pending)
        .saturating_add(tolerance);

    if observed < low {
        Some(observed)
    } else if observed > high {
        Some(observed - usage.pending)
    } else {
        None
    }
}

struct StoreAccount {
    capacity: u64,
    used: u64,
    reserved: u64,
    reservations: HashMap<ReservationId, Reservation>,
}

impl StoreAccount {
    fn new(capacity: u64, used: u64) -> Self {
        Self {
            capacity,
            used,
            reserved: 0,
            reservations: HashMap::new(),
        }
    }

    fn free(&self) -> u64 {
        self.capacity
            .saturating_sub(self.used.saturating_add(self.reserved))
    }

    fn usage(&self) -> StoreUsage {
        StoreUsage {
            capacity: self.capacity,
            used: self.used,
            reserved: self.reserved,
            free: self.free(),
        }
    }

    fn durable(&self) -> DurableUsage {
        DurableUsage {
            used: self.used,
            pending: self.reserved,
        }
    }

    fn apply(&mut self, usage: DurableUsage) {
        self.used = usage.used;
        self.reserved = usage.pending;
    }

    /// Copy of a pending reservation moved to `state`. The account itself is
    /// left alone until the journal agrees.
    fn resolving(&self, id: ReservationId, state: ReservationState) -> Result<Reservation> {
        let reservation = self
            .reservations
            .get(&id)
            .ok_or(LibrarianError::UnknownReservation(id))?;
        if !reservation.is_pending() {
            return Err(LibrarianError::AlreadyResolved {
                id,
                state: reservation.state,
            });
        }

        let mut resolved = reservation.clone();
        resolved.resolve(state, Utc::now());
        Ok(resolved)
    }

    fn record(&mut self, reservation: Reservation) {
        self.reservations.insert(reservation.id, reservation);
    }
}

pub struct CapacityLedger {
    accounts: RwLock<HashMap<String, Arc<Mutex<StoreAccount>>>>,
    index: RwLock<HashMap<ReservationId, String>>,
    journal: Arc<dyn StateJournal>,
    events: EventBus,
}

impl CapacityLedger {
    pub fn new(journal: Arc<dyn StateJournal>, events: EventBus) -> Self {
        Self {
            accounts: RwLock::new(HashMap::new()),
            index: RwLock::new(HashMap::new()),
            journal,
            events,
        }
    }

    pub async fn open_account(&self, store: &Store, used: u64) -> Result<()> {
        self.restore_account(store, used, Vec::new()).await
    }

    /// Opens an account with previously persisted usage and reservations.
    pub async fn restore_account(
        &self,
        store: &Store,
        used: u64,
        reservations: Vec<Reservation>,
    ) -> Result<()> {
        let mut account = StoreAccount::new(store.capacity, used);
        let mut ids = Vec::with_capacity(reservations.len());
        for reservation in reservations {
            if reservation.store != store.name {
                return Err(LibrarianError::Internal(format!(
                    "reservation {} belongs to store {}, not {}",
                    reservation.id, reservation.store, store.name
                )));
            }
            if reservation.is_pending() {
                account.reserved = account.reserved.saturating_add(reservation.bytes);
            }
            ids.push(reservation.id);
            account.reservations.insert(reservation.id, reservation);
        }

        {
            let mut accounts = self.accounts.write().await;
            if accounts.contains_key(&store.name) {
                return Err(LibrarianError::DuplicateStore(store.name.clone()));
            }
            accounts.insert(store.name.clone(), Arc::new(Mutex::new(account)));
        }

        let mut index = self.index.write().await;
        for id in ids {
            index.insert(id, store.name.clone());
        }

        Ok(())
    }

    /// Drops an empty account. Fails with `StoreNotEmpty` while the store
    /// still has used bytes or pending reservations.
    pub async fn close_account(&self, store: &str) -> Result<()> {
        let account = self.account(store).await?;
        let resolved: Vec<ReservationId> = {
            let account = account.lock().await;
            if account.used > 0 || account.reserved > 0 {
                return Err(LibrarianError::StoreNotEmpty(store.to_string()));
            }
            account.reservations.keys().copied().collect()
        };

        self.accounts.write().await.remove(store);
        let mut index = self.index.write().await;
        for id in resolved {
            index.remove(&id);
        }

        Ok(())
    }

    pub async fn reserve(&self, store: &str, bytes: u64) -> Result<Reservation> {
        let account = self.account(store).await?;
        let reservation = {
            let mut account = account.lock().await;
            let reservation = Reservation::pending(store, bytes);
            let capacity = account.capacity;
            let admitted = reservation.clone();
            match self
                .journaled(move |journal| journal.admit(&admitted, capacity))
                .await?
            {
                Admission::Admitted(usage) => account.apply(usage),
                Admission::Rejected(usage) => {
                    account.apply(usage);
                    return Err(LibrarianError::InsufficientCapacity {
                        store: store.to_string(),
                        requested: bytes,
                        free: account.free(),
                    });
                }
                Admission::Untracked => {
                    let free = account.free();
                    if bytes > free {
                        return Err(LibrarianError::InsufficientCapacity {
                            store: store.to_string(),
                            requested: bytes,
                            free,
                        });
                    }
                    account.reserved += bytes;
                }
            }

            account.record(reservation.clone());
            reservation
        };

        self.index
            .write()
            .await
            .insert(reservation.id, store.to_string());

        tracing::info!(
            store = %store,
            reservation = %reservation.id,
            bytes,
            "reservation created"
        );
        self.events.publish(LibrarianEvent::ReservationCreated {
            reservation: reservation.id,
            store: store.to_string(),
            bytes,
        });

        Ok(reservation)
    }

    /// Turns a pending reservation's bytes into used bytes.
    pub async fn commit(&self, id: ReservationId) -> Result<Reservation> {
        let (store, account) = self.account_for(id).await?;
        let (reservation, used) = {
            let mut account = account.lock().await;
            let committed = account.resolving(id, ReservationState::Committed)?;
            let resolved = committed.clone();
            match self
                .journaled(move |journal| journal.resolve(&resolved))
                .await?
            {
                Resolution::Applied(usage) => account.apply(usage),
                Resolution::Superseded(state, usage) => {
                    account.apply(usage);
                    account.record(Reservation {
                        state,
                        ..committed
                    });
                    return Err(LibrarianError::AlreadyResolved { id, state });
                }
                Resolution::Untracked => {
                    account.reserved = account.reserved.saturating_sub(committed.bytes);
                    account.used = account.used.saturating_add(committed.bytes);
                }
            }

            account.record(committed.clone());
            (committed, account.used)
        };

        tracing::info!(
            store = %store,
            reservation = %id,
            bytes = reservation.bytes,
            used,
            "reservation committed"
        );
        self.events.publish(LibrarianEvent::ReservationCommitted {
            reservation: id,
            store,
            bytes: reservation.bytes,
            used,
        });

        Ok(reservation)
    }

    /// Returns a pending reservation's bytes to the free pool. Releasing an
    /// already released reservation is a no-op; releasing a committed one is
    /// an error.
    pub async fn release(&self, id: ReservationId) -> Result<Reservation> {
        self.release_with_reason(id, ReleaseReason::Cancelled).await
    }

    pub(crate) async fn release_with_reason(
        &self,
        id: ReservationId,
        reason: ReleaseReason,
    ) -> Result<Reservation> {
        let (store, account) = self.account_for(id).await?;
        let reservation = {
            let mut account = account.lock().await;
            let current = account
                .reservations
                .get(&id)
                .ok_or(LibrarianError::UnknownReservation(id))?;
            match current.state {
                ReservationState::Released => return Ok(current.clone()),
                ReservationState::Committed => {
                    return Err(LibrarianError::AlreadyResolved {
                        id,
                        state: current.state,
                    });
                }
                ReservationState::Pending => {}
            }

            let released = account.resolving(id, ReservationState::Released)?;
            let resolved = released.clone();
            let resolution = match self
                .journaled(move |journal| journal.resolve(&resolved))
                .await
            {
                Ok(resolution) => resolution,
                Err(error) => {
                    // The journal keeps holding the bytes until a later sweep
                    // expires them.
                    tracing::warn!(
                        "failed to journal release of reservation {} on store {}: {}",
                        id,
                        store,
                        error
                    );
                    Resolution::Untracked
                }
            };

            match resolution {
                Resolution::Applied(usage) => account.apply(usage),
                Resolution::Superseded(state, usage) => {
                    account.apply(usage);
                    let settled = Reservation { state, ..released };
                    account.record(settled.clone());
                    return match state {
                        ReservationState::Committed => {
                            Err(LibrarianError::AlreadyResolved { id, state })
                        }
                        _ => Ok(settled),
                    };
                }
                Resolution::Untracked => {
                    account.reserved = account.reserved.saturating_sub(released.bytes);
                }
            }

            account.record(released.clone());
            released
        };

        tracing::info!(
            store = %store,
            reservation = %id,
            bytes = reservation.bytes,
            reason = ?reason,
            "reservation released"
        );
        self.events.publish(LibrarianEvent::ReservationReleased {
            reservation: id,
            store,
            bytes: reservation.bytes,
            reason,
        });

        Ok(reservation)
    }

    pub async fn free(&self, store: &str) -> Result<u64> {
        Ok(self.usage(store).await?.free)
    }

    pub async fn usage(&self, store: &str) -> Result<StoreUsage> {
        let account = self.account(store).await?;
        let account = account.lock().await;
        Ok(account.usage())
    }

    pub async fn reservation(&self, id: ReservationId) -> Result<Reservation> {
        let (_, account) = self.account_for(id).await?;
        let account = account.lock().await;
        account
            .reservations
            .get(&id)
            .cloned()
            .ok_or(LibrarianError::UnknownReservation(id))
    }

    /// Corrects the store's used bytes from an externally observed byte
    /// count; see [`corrected_used`] for which observations count as drift.
    pub async fn reconcile_used(
        &self,
        store: &str,
        observed: u64,
        tolerance: u64,
    ) -> Result<Option<UsageCorrection>> {
        let account = self.account(store).await?;
        let correction = {
            let mut account = account.lock().await;
            let name = store.to_string();
            let reconciled = match self
                .journaled(move |journal| journal.reconcile_usage(&name, observed, tolerance))
                .await?
            {
                Some(reconciled) => reconciled,
                None => Reconciled {
                    before: account.durable(),
                    corrected: corrected_used(account.durable(), observed, tolerance),
                },
            };

            account.apply(reconciled.before);
            let Some(corrected) = reconciled.corrected else {
                return Ok(None);
            };
            account.used = corrected;

            UsageCorrection {
                store: store.to_string(),
                previous: reconciled.before.used,
                observed,
                in_flight: reconciled.before.pending,
                corrected,
            }
        };

        tracing::warn!(
            store = %store,
            previous = correction.previous,
            observed = correction.observed,
            in_flight = correction.in_flight,
            drift = correction.drift() as i64,
            "ledger usage corrected from store report"
        );
        self.events.publish(LibrarianEvent::UsageCorrected {
            store: store.to_string(),
            previous: correction.previous,
            observed: correction.observed,
            corrected: correction.corrected,
            at: Utc::now(),
        });

        Ok(Some(correction))
    }

    /// Pulls durable usage and pending reservations written by other
    /// processes sharing the journal. Returns how many reservations were
    /// adopted.
    pub async fn refresh(&self) -> Result<usize> {
        let mut adopted_total = 0;
        for (store, account) in self.snapshot_accounts().await {
            let mut adopted = Vec::new();
            {
                let mut account = account.lock().await;
                let name = store.clone();
                let Some(snapshot) = self
                    .journaled(move |journal| journal.snapshot(&name))
                    .await?
                else {
                    continue;
                };

                account.apply(snapshot.usage);
                for reservation in snapshot.pending {
                    if !account.reservations.contains_key(&reservation.id) {
                        adopted.push(reservation.id);
                        account.record(reservation);
                    }
                }
            }

            if !adopted.is_empty() {
                let mut index = self.index.write().await;
                for id in &adopted {
                    index.insert(*id, store.clone());
                }
                adopted_total += adopted.len();
            }
        }

        if adopted_total > 0 {
            tracing::info!(count = adopted_total, "adopted reservations from journal");
        }
        Ok(adopted_total)
    }

    pub async fn expire_pending(&self, ttl: Duration) -> Result<Vec<Reservation>> {
        self.expire_pending_at(Utc::now(), ttl).await
    }

    /// Releases every reservation still pending `ttl` after its creation.
    pub async fn expire_pending_at(
        &self,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Vec<Reservation>> {
        let ttl = to_chrono(ttl)?;
        let mut expired = Vec::new();

        for (_, account) in self.snapshot_accounts().await {
            let account = account.lock().await;
            let stale: Vec<ReservationId> = account
                .reservations
                .values()
                .filter(|reservation| reservation.is_pending() && now - reservation.created_at > ttl)
                .map(|reservation| reservation.id)
                .collect();
            drop(account);

            // Go through release so a concurrent commit wins cleanly.
            for id in stale {
                match self.release_with_reason(id, ReleaseReason::Expired).await {
                    Ok(reservation) if reservation.state == ReservationState::Released => {
                        expired.push(reservation)
                    }
                    Ok(_) | Err(LibrarianError::AlreadyResolved { .. }) => {}
                    Err(error) => return Err(error),
                }
            }
        }

        Ok(expired)
    }

    pub async fn prune_resolved(&self, retention: Duration) -> Result<usize> {
        self.prune_resolved_at(Utc::now(), retention).await
    }

    /// Forgets committed and released reservations resolved longer than
    /// `retention` ago. Later commit or release calls on them fail with
    /// `UnknownReservation`.
    pub async fn prune_resolved_at(
        &self,
        now: DateTime<Utc>,
        retention: Duration,
    ) -> Result<usize> {
        let retention = to_chrono(retention)?;
        let mut pruned = Vec::new();

        for (_, account) in self.snapshot_accounts().await {
            let mut account = account.lock().await;
            account.reservations.retain(|id, reservation| {
                let stale = reservation
                    .resolved_at
                    .is_some_and(|resolved_at| now - resolved_at > retention);
                if stale {
                    pruned.push(*id);
                }
                !stale
            });
        }

        if pruned.is_empty() {
            return Ok(0);
        }

        {
            let mut index = self.index.write().await;
            for id in &pruned {
                index.remove(id);
            }
        }

        let count = pruned.len();
        if let Err(error) = self
            .journaled(move |journal| journal.reservations_pruned(&pruned))
            .await
        {
            tracing::warn!("failed to journal pruned reservations: {}", error);
        }

        tracing::debug!(count, "pruned resolved reservations");
        Ok(count)
    }

    async fn account(&self, store: &str) -> Result<Arc<Mutex<StoreAccount>>> {
        let accounts = self.accounts.read().await;
        accounts
            .get(store)
            .cloned()
            .ok_or_else(|| LibrarianError::StoreNotFound(store.to_string()))
    }

    async fn account_for(&self, id: ReservationId) -> Result<(String, Arc<Mutex<StoreAccount>>)> {
        let store = {
            let index = self.index.read().await;
            index
                .get(&id)
                .cloned()
                .ok_or(LibrarianError::UnknownReservation(id))?
        };

        let account = self
            .account(&store)
            .await
            .map_err(|_| LibrarianError::UnknownReservation(id))?;
        Ok((store, account))
    }

    async fn snapshot_accounts(&self) -> Vec<(String, Arc<Mutex<StoreAccount>>)> {
        let accounts = self.accounts.read().await;
        accounts
            .iter()
            .map(|(name, account)| (name.clone(), Arc::clone(account)))
            .collect()
    }

    async fn journaled<T, F>(&self, call: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn StateJournal) -> Result<T> + Send + 'static,
    {
        let journal = Arc::clone(&self.journal);
        task::spawn_blocking(move || call(journal.as_ref()))
            .await
            .map_err(|error| LibrarianError::Internal(format!("journal task failed: {}", error)))?
    }
}

fn to_chrono(duration: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(duration)
        .map_err(|error| LibrarianError::Config(format!("duration out of range: {}", error)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::{NullJournal, SqliteJournal};
    use crate::store::StoreDescriptor;

    async fn ledger_with(stores: &[(&str, u64)]) -> Arc<CapacityLedger> {
        let ledger = Arc::new(CapacityLedger::new(Arc::new(NullJournal), EventBus::new()));
        for (name, capacity) in stores {
            let store = StoreDescriptor::new(*name, *capacity).store();
            ledger.open_account(&store, 0).await.unwrap();
        }
        ledger
    }

    #[tokio::test]
    async fn reserve_commit_release_keeps_used_within_capacity() {
        let ledger = ledger_with(&[("s", 100)]).await;

        let a = ledger.reserve("s", 60).await.unwrap();
        assert_eq!(ledger.free("s").await.unwrap(), 40);

        let err = ledger.reserve("s", 41).await.unwrap_err();
        assert!(matches!(
            err,
            LibrarianError::InsufficientCapacity { requested: 41, free: 40, .. }
        ));

        let b = ledger.reserve("s", 40).await.unwrap();
        assert_eq!(ledger.free("s").await.unwrap(), 0);

        ledger.commit(a.id).await.unwrap();
        ledger.release(b.id).await.unwrap();

        let usage = ledger.usage("s").await.unwrap();
        assert_eq!(usage.used, 60);
        assert_eq!(usage.reserved, 0);
        assert_eq!(usage.free, 40);
        assert!(usage.used <= usage.capacity);
    }

    #[tokio::test]
    async fn release_after_commit_is_rejected_and_double_release_is_idempotent() {
        let ledger = ledger_with(&[("s", 100)]).await;

        let committed = ledger.reserve("s", 10).await.unwrap();
        ledger.commit(committed.id).await.unwrap();
        let err = ledger.release(committed.id).await.unwrap_err();
        assert!(matches!(
            err,
            LibrarianError::AlreadyResolved { state: ReservationState::Committed, .. }
        ));
        let err = ledger.commit(committed.id).await.unwrap_err();
        assert!(matches!(err, LibrarianError::AlreadyResolved { .. }));

        let released = ledger.reserve("s", 10).await.unwrap();
        let first = ledger.release(released.id).await.unwrap();
        let second = ledger.release(released.id).await.unwrap();
        assert_eq!(first.state, ReservationState::Released);
        assert_eq!(second, first);
        assert_eq!(ledger.free("s").await.unwrap(), 90);

        let err = ledger.commit(released.id).await.unwrap_err();
        assert!(matches!(
            err,
            LibrarianError::AlreadyResolved { state: ReservationState::Released, .. }
        ));
    }

    #[tokio::test]
    async fn unknown_reservation_and_store_are_reported() {
        let ledger = ledger_with(&[("s", 100)]).await;
        let id = Ulid::new();
        assert!(matches!(
            ledger.commit(id).await.unwrap_err(),
            LibrarianError::UnknownReservation(missing) if missing == id
        ));
        assert!(matches!(
            ledger.release(id).await.unwrap_err(),
            LibrarianError::UnknownReservation(_)
        ));
        assert!(matches!(
            ledger.reserve("nope", 1).await.unwrap_err(),
            LibrarianError::StoreNotFound(_)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_reserves_never_overcommit() {
        let capacity = 10_000_000_000_000u64;
        let chunk = 1_000_000_000_000u64;
        let ledger = ledger_with(&[("Store 0", capacity)]).await;

        let mut handles = Vec::new();
        for _ in 0..25 {
            let ledger = Arc::clone(&ledger);
            handles.push(tokio::spawn(async move { ledger.reserve("Store 0", chunk).await }));
        }

        let mut granted = 0u64;
        let mut rejected = 0u64;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => granted += 1,
                Err(LibrarianError::InsufficientCapacity { .. }) => rejected += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }

        assert_eq!(granted, 10);
        assert_eq!(rejected, 15);
        let usage = ledger.usage("Store 0").await.unwrap();
        assert_eq!(usage.reserved, capacity);
        assert_eq!(usage.free, 0);
    }

    #[tokio::test]
    async fn reconcile_respects_tolerance() {
        let ledger = ledger_with(&[("s", 1_000)]).await;
        let r = ledger.reserve("s", 300).await.unwrap();
        ledger.commit(r.id).await.unwrap();

        assert!(ledger.reconcile_used("s", 305, 10).await.unwrap().is_none());
        assert_eq!(ledger.usage("s").await.unwrap().used, 300);

        let correction = ledger.reconcile_used("s", 120, 10).await.unwrap().unwrap();
        assert_eq!(correction.previous, 300);
        assert_eq!(correction.observed, 120);
        assert_eq!(correction.corrected, 120);
        assert_eq!(correction.drift(), -180);
        assert_eq!(ledger.usage("s").await.unwrap().used, 120);
        assert_eq!(ledger.free("s").await.unwrap(), 880);
    }

    #[tokio::test]
    async fn landed_but_uncommitted_bytes_are_not_counted_twice() {
        let ledger = ledger_with(&[("s", 1_000)]).await;
        let landing = ledger.reserve("s", 600).await.unwrap();

        // The payload is fully on disk, its commit has not happened yet.
        assert!(ledger.reconcile_used("s", 600, 0).await.unwrap().is_none());
        let usage = ledger.usage("s").await.unwrap();
        assert_eq!((usage.used, usage.reserved, usage.free), (0, 600, 400));
        let other = ledger.reserve("s", 400).await.unwrap();
        ledger.release(other.id).await.unwrap();

        ledger.commit(landing.id).await.unwrap();
        let usage = ledger.usage("s").await.unwrap();
        assert_eq!(usage.used, 600);
        assert!(usage.used <= usage.capacity);

        // Beyond the in-flight band the pending bytes are left to their commit.
        let next = ledger.reserve("s", 100).await.unwrap();
        let correction = ledger.reconcile_used("s", 850, 0).await.unwrap().unwrap();
        assert_eq!(correction.in_flight, 100);
        assert_eq!(correction.corrected, 750);
        ledger.commit(next.id).await.unwrap();
        assert_eq!(ledger.usage("s").await.unwrap().used, 850);
    }

    #[tokio::test]
    async fn ledgers_sharing_a_journal_never_overcommit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("librarian.sqlite3");
        let descriptor = StoreDescriptor::new("Store 0", 1_000);

        let mut ledgers = Vec::new();
        for _ in 0..2 {
            let journal = Arc::new(SqliteJournal::open(&path).unwrap());
            journal.store_upserted(&descriptor).unwrap();
            let ledger = CapacityLedger::new(journal, EventBus::new());
            ledger.open_account(&descriptor.store(), 0).await.unwrap();
            ledgers.push(ledger);
        }

        let a = ledgers[0].reserve("Store 0", 600).await.unwrap();
        let err = ledgers[1].reserve("Store 0", 600).await.unwrap_err();
        assert!(matches!(
            err,
            LibrarianError::InsufficientCapacity { requested: 600, free: 400, .. }
        ));
        ledgers[0].commit(a.id).await.unwrap();

        let b = ledgers[1].reserve("Store 0", 400).await.unwrap();
        assert_eq!(ledgers[1].usage("Store 0").await.unwrap().used, 600);

        assert_eq!(ledgers[0].refresh().await.unwrap(), 1);
        assert_eq!(ledgers[0].free("Store 0").await.unwrap(), 0);

        // The first process expires the second one's reservation.
        let later = Utc::now() + chrono::Duration::seconds(120);
        let expired = ledgers[0]
            .expire_pending_at(later, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, b.id);

        assert!(matches!(
            ledgers[1].commit(b.id).await.unwrap_err(),
            LibrarianError::AlreadyResolved { state: ReservationState::Released, .. }
        ));
        let usage = ledgers[1].usage("Store 0").await.unwrap();
        assert_eq!((usage.used, usage.reserved), (600, 0));
    }

    #[tokio::test]
    async fn expired_pending_reservations_are_released() {
        let ledger = ledger_with(&[("s", 1_000)]).await;
        let stale = ledger.reserve("s", 400).await.unwrap();
        let done = ledger.reserve("s", 100).await.unwrap();
        ledger.commit(done.id).await.unwrap();

        let ttl = Duration::from_secs(60);
        assert!(ledger.expire_pending(ttl).await.unwrap().is_empty());

        let later = Utc::now() + chrono::Duration::seconds(120);
        let expired = ledger.expire_pending_at(later, ttl).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, stale.id);
        assert_eq!(ledger.free("s").await.unwrap(), 900);

        let pruned = ledger
            .prune_resolved_at(later + chrono::Duration::seconds(600), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(pruned, 2);
        assert!(matches!(
            ledger.release(stale.id).await.unwrap_err(),
            LibrarianError::UnknownReservation(_)
        ));
    }

    #[tokio::test]
    async fn restored_pending_reservations_hold_capacity() {
        let ledger = Arc::new(CapacityLedger::new(Arc::new(NullJournal), EventBus::new()));
        let store = StoreDescriptor::new("s", 1_000).store();
        let pending = Reservation::pending("s", 250);
        ledger
            .restore_account(&store, 500, vec![pending.clone()])
            .await
            .unwrap();

        assert_eq!(ledger.free("s").await.unwrap(), 250);
        ledger.commit(pending.id).await.unwrap();
        assert_eq!(ledger.usage("s").await.unwrap().used, 750);

        assert!(matches!(
            ledger.close_account("s").await.unwrap_err(),
            LibrarianError::StoreNotEmpty(_)
        ));
    }
}
