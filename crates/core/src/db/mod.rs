//! SQLite persistence layer for changekit.
//!
//! Provides a [`Database`] handle with WAL-mode journaling, automatic schema
//! migrations, and the transaction wrapper every mutating operation goes
//! through.
//!
//! Each operation of the kernel is a free function taking `&Connection` in
//! its own module (see [`crate::branch`], [`crate::conflict`], ...). Handed a
//! [`rusqlite::Transaction`] (which derefs to `Connection`) they join it;
//! handed a connection in autocommit mode they open one through
//! [`join_or_begin`]. The methods on [`Database`] are the standalone form.
//!
//! A [`Database`] handle is not reentrant: inside a
//! [`Database::transaction`] closure, use the free functions with the
//! closure's connection. Calling a `Database` method there fails with
//! [`DatabaseError::InvalidArgument`].

pub mod queries;
pub mod schema;

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::Duration;

use rusqlite::{Connection, Transaction, TransactionBehavior};
use tracing::{debug, info};

use crate::config::DatabaseConfig;
use crate::errors::DatabaseError;

const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

/// Main database handle wrapping a SQLite connection.
///
/// The inner connection is wrapped in a `Mutex` so that `Database` is
/// `Send + Sync`, enabling use inside `Arc`. Several handles may be opened on
/// the same file; writers across handles are serialized by SQLite's write
/// lock, which [`Database::transaction`] takes up front.
pub struct Database {
    conn: Mutex<Connection>,
    /// Thread currently running a closure inside [`Database::transaction`].
    tx_owner: Mutex<Option<ThreadId>>,
}

/// Run `f` inside the transaction `conn` already holds, or, if `conn` is in
/// autocommit mode, inside a new `BEGIN IMMEDIATE` transaction that commits
/// when `f` succeeds and rolls back otherwise.
pub fn join_or_begin<F, T>(conn: &Connection, f: F) -> Result<T, DatabaseError>
where
    F: FnOnce(&Connection) -> Result<T, DatabaseError>,
{
    if !conn.is_autocommit() {
        return f(conn);
    }
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    let result = f(&tx)?;
    tx.commit()?;
    Ok(result)
}

/// Marks the current thread as the transaction owner until dropped.
struct OwnerMark<'a> {
    owner: &'a Mutex<Option<ThreadId>>,
}

impl<'a> OwnerMark<'a> {
    fn enter(owner: &'a Mutex<Option<ThreadId>>) -> Self {
        *owner.lock().unwrap_or_else(PoisonError::into_inner) = Some(thread::current().id());
        Self { owner }
    }
}

impl Drop for OwnerMark<'_> {
    fn drop(&mut self) {
        *self.owner.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl Database {
    /// Open (or create) a SQLite database at `path` with default settings.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DatabaseError> {
        Self::open_with(path.as_ref(), DEFAULT_BUSY_TIMEOUT, true)
    }

    /// Open the database described by a [`DatabaseConfig`], creating the
    /// parent directory if needed.
    pub fn open(config: &DatabaseConfig) -> Result<Self, DatabaseError> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Self::open_with(
            &config.path,
            Duration::from_millis(config.busy_timeout_ms),
            config.wal,
        )
    }

    fn open_with(path: &Path, busy_timeout: Duration, wal: bool) -> Result<Self, DatabaseError> {
        info!(path = %path.display(), wal, "opening database");

        let conn = Connection::open(path)?;

        // Set before anything that may contend for the lock.
        conn.busy_timeout(busy_timeout)?;
        if wal {
            conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        }
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        debug!("database opened successfully");
        Ok(Self {
            conn: Mutex::new(conn),
            tx_owner: Mutex::new(None),
        })
    }

    /// Open an in-memory database (useful for testing).
    pub fn in_memory() -> Result<Self, DatabaseError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self {
            conn: Mutex::new(conn),
            tx_owner: Mutex::new(None),
        })
    }

    /// Run all schema migrations to bring the database up to date.
    pub fn initialize(&self) -> Result<(), DatabaseError> {
        info!("initializing database schema");
        self.transaction(schema::run_migrations)?;
        debug!("database schema is up to date");
        Ok(())
    }

    /// Obtain a lock on the underlying connection.
    ///
    /// Reads may go through this directly; writes should go through
    /// [`Database::transaction`] so they are atomic. Must not be called from
    /// inside a [`Database::transaction`] closure on the same handle: the
    /// lock is already held there.
    ///
    /// If the Mutex is poisoned (a previous holder panicked), the lock is
    /// recovered rather than propagating a panic. Any transaction the
    /// panicking holder had open was rolled back when it was dropped.
    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("database mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Execute a closure inside a SQLite transaction. If the closure returns
    /// `Ok`, the transaction is committed; otherwise it is rolled back and
    /// nothing the closure wrote persists.
    ///
    /// The transaction is opened with `BEGIN IMMEDIATE`, so the write lock is
    /// held from the first statement. Two callers running a read-decide-write
    /// sequence therefore never both observe the pre-write state.
    ///
    /// Inside `f`, compose operations with the free functions over the given
    /// connection. Re-entering this handle from `f` returns
    /// [`DatabaseError::InvalidArgument`] instead of blocking.
    pub fn transaction<F, T>(&self, f: F) -> Result<T, DatabaseError>
    where
        F: FnOnce(&Connection) -> Result<T, DatabaseError>,
    {
        self.ensure_not_reentered()?;
        let mut conn = self.conn();
        let _owner = OwnerMark::enter(&self.tx_owner);
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    /// Run a read-only closure on the connection, with the same reentrancy
    /// check as [`Database::transaction`].
    pub(crate) fn read<F, T>(&self, f: F) -> Result<T, DatabaseError>
    where
        F: FnOnce(&Connection) -> Result<T, DatabaseError>,
    {
        self.ensure_not_reentered()?;
        f(&self.conn())
    }

    fn ensure_not_reentered(&self) -> Result<(), DatabaseError> {
        let owner = *self.tx_owner.lock().unwrap_or_else(PoisonError::into_inner);
        if owner == Some(thread::current().id()) {
            return Err(DatabaseError::InvalidArgument(
                "database handle used inside its own transaction; \
                 call the free functions with the transaction's connection"
                    .into(),
            ));
        }
        Ok(())
    }
}
