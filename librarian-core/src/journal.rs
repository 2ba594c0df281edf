//! Persistence seam for registry and ledger state.
//!
//! The core reports every store and reservation change to a [`StateJournal`]
//! and rebuilds its in-memory model from [`StateJournal::load`] on startup.
//! Several processes may share one SQLite journal; capacity checks re-read
//! the persisted state inside `BEGIN IMMEDIATE` transactions so none of them
//! can over-commit a store.

use crate::ledger::{Reservation, ReservationId, ReservationState, corrected_used};
use crate::store::StoreDescriptor;
use crate::{LibrarianError, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior, params};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use ulid::Ulid;

#[derive(Debug, Clone, PartialEq)]
pub struct PersistedStore {
    pub descriptor: StoreDescriptor,
    pub used: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PersistedState {
    /// Stores in their original registration order.
    pub stores: Vec<PersistedStore>,
    pub reservations: Vec<Reservation>,
}

impl PersistedState {
    pub fn store(&self, name: &str) -> Option<&PersistedStore> {
        self.stores
            .iter()
            .find(|store| store.descriptor.name == name)
    }

    pub fn reservations_for<'a>(&'a self, store: &'a str) -> impl Iterator<Item = &'a Reservation> {
        self.reservations
            .iter()
            .filter(move |reservation| reservation.store == store)
    }
}

/// Used bytes and the sum of pending reservations of one store as the
/// journal records them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DurableUsage {
    pub used: u64,
    pub pending: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted(DurableUsage),
    /// The durable state has no room left; carries what it holds now.
    Rejected(DurableUsage),
    /// The journal does not track the store and the caller decides alone.
    Untracked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Applied(DurableUsage),
    /// Another writer resolved the reservation first.
    Superseded(ReservationState, DurableUsage),
    Untracked,
}

/// Outcome of checking an observed byte count against the durable state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reconciled {
    pub before: DurableUsage,
    pub corrected: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreSnapshot {
    pub usage: DurableUsage,
    pub pending: Vec<Reservation>,
}

/// Durable home of registry and ledger state.
///
/// Every capacity decision that must hold across processes goes through one
/// of the check-and-write methods, each of which reads and writes a store's
/// state atomically. Journals that keep nothing answer `Untracked` and leave
/// the decision to the in-memory ledger.
pub trait StateJournal: Send + Sync {
    fn store_upserted(&self, descriptor: &StoreDescriptor) -> Result<()>;

    fn store_removed(&self, name: &str) -> Result<()>;

    /// Records a new pending reservation if the store still has room for it.
    fn admit(&self, reservation: &Reservation, capacity: u64) -> Result<Admission>;

    /// Moves a pending reservation into the state it carries. Committing adds
    /// its bytes to the store's used bytes.
    fn resolve(&self, reservation: &Reservation) -> Result<Resolution>;

    /// Compares an observed byte count with the durable state and stores the
    /// corrected used bytes, if any, in the same transaction.
    fn reconcile_usage(
        &self,
        store: &str,
        observed: u64,
        tolerance: u64,
    ) -> Result<Option<Reconciled>>;

    fn snapshot(&self, store: &str) -> Result<Option<StoreSnapshot>>;

    fn reservations_pruned(&self, ids: &[ReservationId]) -> Result<()>;

    fn load(&self) -> Result<PersistedState>;
}

/// Journal that keeps nothing; state lives only as long as the process.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullJournal;

impl StateJournal for NullJournal {
    fn store_upserted(&self, _descriptor: &StoreDescriptor) -> Result<()> {
        Ok(())
    }

    fn store_removed(&self, _name: &str) -> Result<()> {
        Ok(())
    }

    fn admit(&self, _reservation: &Reservation, _capacity: u64) -> Result<Admission> {
        Ok(Admission::Untracked)
    }

    fn resolve(&self, _reservation: &Reservation) -> Result<Resolution> {
        Ok(Resolution::Untracked)
    }

    fn reconcile_usage(
        &self,
        _store: &str,
        _observed: u64,
        _tolerance: u64,
    ) -> Result<Option<Reconciled>> {
        Ok(None)
    }

    fn snapshot(&self, _store: &str) -> Result<Option<StoreSnapshot>> {
        Ok(None)
    }

    fn reservations_pruned(&self, _ids: &[ReservationId]) -> Result<()> {
        Ok(())
    }

    fn load(&self) -> Result<PersistedState> {
        Ok(PersistedState::default())
    }
}

/// SQLite-backed journal: one `stores` row per registered store and one
/// `reservations` row per live or recently resolved reservation.
pub struct SqliteJournal {
    db_path: PathBuf,
}

impl SqliteJournal {
    pub fn open(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let journal = Self { db_path };
        journal.ensure_schema()?;
        Ok(journal)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.connection()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS stores (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                capacity INTEGER NOT NULL,
                rsync_endpoint TEXT NOT NULL,
                http_endpoint TEXT NOT NULL,
                path TEXT NOT NULL,
                available INTEGER NOT NULL,
                used INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS reservations (
                id TEXT PRIMARY KEY,
                store TEXT NOT NULL,
                bytes INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                state TEXT NOT NULL,
                resolved_at TEXT
            );",
        )?;

        Ok(())
    }

    fn connection(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(conn)
    }

    fn load_stores(conn: &Connection) -> Result<Vec<PersistedStore>> {
        let mut stmt = conn.prepare(
            "SELECT name, capacity, rsync_endpoint, http_endpoint, path, available, used
             FROM stores
             ORDER BY seq ASC",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, bool>(5)?,
                row.get::<_, i64>(6)?,
            ))
        })?;

        let mut stores = Vec::new();
        for row in rows {
            let (name, capacity, rsync_endpoint, http_endpoint, path, available, used) = row?;
            stores.push(PersistedStore {
                descriptor: StoreDescriptor {
                    name,
                    capacity: from_sql_bytes(capacity)?,
                    rsync_endpoint,
                    http_endpoint,
                    path,
                    available,
                },
                used: from_sql_bytes(used)?,
            });
        }

        Ok(stores)
    }

    fn load_reservations(conn: &Connection) -> Result<Vec<Reservation>> {
        let mut stmt = conn.prepare(
            "SELECT id, store, bytes, created_at, state, resolved_at
             FROM reservations
             ORDER BY id ASC",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, Option<String>>(5)?,
            ))
        })?;

        let mut reservations = Vec::new();
        for row in rows {
            let (id, store, bytes, created_at, state, resolved_at) = row?;
            reservations.push(Reservation {
                id: Ulid::from_str(&id).map_err(|error| {
                    LibrarianError::Internal(format!("invalid reservation id {}: {}", id, error))
                })?,
                store,
                bytes: from_sql_bytes(bytes)?,
                created_at: parse_timestamp(&created_at)?,
                state: parse_state(&state)?,
                resolved_at: resolved_at.as_deref().map(parse_timestamp).transpose()?,
            });
        }

        Ok(reservations)
    }

    fn immediate(conn: &mut Connection) -> Result<Transaction<'_>> {
        Ok(conn.transaction_with_behavior(TransactionBehavior::Immediate)?)
    }

    fn durable_usage(conn: &Connection, store: &str) -> Result<Option<DurableUsage>> {
        let used = conn
            .query_row(
                "SELECT used FROM stores WHERE name = ?1",
                params![store],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        let Some(used) = used else {
            return Ok(None);
        };

        let pending: i64 = conn.query_row(
            "SELECT COALESCE(SUM(bytes), 0) FROM reservations
             WHERE store = ?1 AND state = 'pending'",
            params![store],
            |row| row.get(0),
        )?;

        Ok(Some(DurableUsage {
            used: from_sql_bytes(used)?,
            pending: from_sql_bytes(pending)?,
        }))
    }

    fn write_reservation(conn: &Connection, reservation: &Reservation) -> Result<()> {
        conn.execute(
            "INSERT INTO reservations (
                id,
                store,
                bytes,
                created_at,
                state,
                resolved_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(id) DO UPDATE SET
                state = excluded.state,
                resolved_at = excluded.resolved_at",
            params![
                reservation.id.to_string(),
                reservation.store,
                to_sql_bytes(reservation.bytes)?,
                reservation.created_at.to_rfc3339(),
                state_label(reservation.state),
                reservation.resolved_at.map(|at| at.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    fn write_used(conn: &Connection, store: &str, used: u64) -> Result<()> {
        conn.execute(
            "UPDATE stores SET used = ?2 WHERE name = ?1",
            params![store, to_sql_bytes(used)?],
        )?;
        Ok(())
    }
}

impl StateJournal for SqliteJournal {
    fn store_upserted(&self, descriptor: &StoreDescriptor) -> Result<()> {
        let conn = self.connection()?;
        conn.execute(
            "INSERT INTO stores (
                name,
                capacity,
                rsync_endpoint,
                http_endpoint,
                path,
                available
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(name) DO UPDATE SET
                capacity = excluded.capacity,
                rsync_endpoint = excluded.rsync_endpoint,
                http_endpoint = excluded.http_endpoint,
                path = excluded.path,
                available = excluded.available",
            params![
                descriptor.name,
                to_sql_bytes(descriptor.capacity)?,
                descriptor.rsync_endpoint,
                descriptor.http_endpoint,
                descriptor.path,
                descriptor.available,
            ],
        )?;

        Ok(())
    }

    fn store_removed(&self, name: &str) -> Result<()> {
        let conn = self.connection()?;
        conn.execute("DELETE FROM reservations WHERE store = ?1", params![name])?;
        conn.execute("DELETE FROM stores WHERE name = ?1", params![name])?;
        Ok(())
    }

    fn admit(&self, reservation: &Reservation, capacity: u64) -> Result<Admission> {
        let mut conn = self.connection()?;
        let tx = Self::immediate(&mut conn)?;
        let Some(usage) = Self::durable_usage(&tx, &reservation.store)? else {
            return Ok(Admission::Untracked);
        };

        let free = capacity.saturating_sub(usage.used.saturating_add(usage.pending));
        if reservation.bytes > free {
            return Ok(Admission::Rejected(usage));
        }

        Self::write_reservation(&tx, reservation)?;
        tx.commit()?;
        Ok(Admission::Admitted(DurableUsage {
            used: usage.used,
            pending: usage.pending.saturating_add(reservation.bytes),
        }))
    }

    fn resolve(&self, reservation: &Reservation) -> Result<Resolution> {
        let mut conn = self.connection()?;
        let tx = Self::immediate(&mut conn)?;
        let Some(mut usage) = Self::durable_usage(&tx, &reservation.store)? else {
            return Ok(Resolution::Untracked);
        };

        let current = tx
            .query_row(
                "SELECT state FROM reservations WHERE id = ?1",
                params![reservation.id.to_string()],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        match current.as_deref().map(parse_state).transpose()? {
            Some(ReservationState::Pending) => {
                usage.pending = usage.pending.saturating_sub(reservation.bytes);
            }
            Some(state) => return Ok(Resolution::Superseded(state, usage)),
            None => {}
        }

        Self::write_reservation(&tx, reservation)?;
        if reservation.state == ReservationState::Committed {
            usage.used = usage.used.saturating_add(reservation.bytes);
            Self::write_used(&tx, &reservation.store, usage.used)?;
        }
        tx.commit()?;
        Ok(Resolution::Applied(usage))
    }

    fn reconcile_usage(
        &self,
        store: &str,
        observed: u64,
        tolerance: u64,
    ) -> Result<Option<Reconciled>> {
        let mut conn = self.connection()?;
        let tx = Self::immediate(&mut conn)?;
        let Some(before) = Self::durable_usage(&tx, store)? else {
            return Ok(None);
        };

        let corrected = corrected_used(before, observed, tolerance);
        if let Some(used) = corrected {
            Self::write_used(&tx, store, used)?;
            tx.commit()?;
        }
        Ok(Some(Reconciled { before, corrected }))
    }

    fn snapshot(&self, store: &str) -> Result<Option<StoreSnapshot>> {
        let conn = self.connection()?;
        let Some(usage) = Self::durable_usage(&conn, store)? else {
            return Ok(None);
        };

        let pending = Self::load_reservations(&conn)?
            .into_iter()
            .filter(|reservation| reservation.store == store && reservation.is_pending())
            .collect();
        Ok(Some(StoreSnapshot { usage, pending }))
    }

    fn reservations_pruned(&self, ids: &[ReservationId]) -> Result<()> {
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        for id in ids {
            tx.execute(
                "DELETE FROM reservations WHERE id = ?1",
                params![id.to_string()],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn load(&self) -> Result<PersistedState> {
        let conn = self.connection()?;
        Ok(PersistedState {
            stores: Self::load_stores(&conn)?,
            reservations: Self::load_reservations(&conn)?,
        })
    }
}

fn to_sql_bytes(value: u64) -> Result<i64> {
    i64::try_from(value)
        .map_err(|_| LibrarianError::InvalidRequest(format!("byte count {} out of range", value)))
}

fn from_sql_bytes(value: i64) -> Result<u64> {
    u64::try_from(value)
        .map_err(|_| LibrarianError::Internal(format!("negative byte count {} in journal", value)))
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|error| LibrarianError::Internal(format!("invalid timestamp {}: {}", value, error)))
}

fn state_label(state: ReservationState) -> &'static str {
    match state {
        ReservationState::Pending => "pending",
        ReservationState::Committed => "committed",
        ReservationState::Released => "released",
    }
}

fn parse_state(value: &str) -> Result<ReservationState> {
    match value {
        "pending" => Ok(ReservationState::Pending),
        "committed" => Ok(ReservationState::Committed),
        "released" => Ok(ReservationState::Released),
        other => Err(LibrarianError::Internal(format!(
            "unknown reservation state in journal: {}",
            other
        ))),
    }
}
