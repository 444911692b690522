//! Metadata store: a pooled SQLite database behind a transactional facade.
//!
//! Every public mutation in the query layer runs inside a single
//! transaction obtained through [`Store::with_txn`]; readers borrow a
//! connection through [`Store::with_conn`]. Connections are recycled
//! through a channel, and each one warms the prepared-statement cache at
//! pool construction so steady-state queries never re-parse SQL.

pub mod migrations;
pub mod query;
pub mod row;

use std::path::Path;

use crossbeam_channel::{bounded, Receiver, Sender};
use rusqlite::Connection;
use tracing::debug;

use crate::error::{Result, VaultError};

/// Seconds since the Unix epoch, the timestamp format of every table.
pub fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Handle to the metadata store. Cheap to clone; all clones share the
/// same connection pool.
#[derive(Clone)]
pub struct Store {
    tx: Sender<Connection>,
    rx: Receiver<Connection>,
}

impl Store {
    /// Open (or create) the store at `path` with `pool_size` connections,
    /// apply pending migrations, and warm the statement caches.
    pub fn open(path: &Path, pool_size: usize) -> Result<Self> {
        let pool_size = pool_size.max(1);
        let (tx, rx) = bounded(pool_size);

        for i in 0..pool_size {
            let conn = Connection::open(path).map_err(|e| {
                VaultError::Fatal(format!("cannot open metadata store {}: {e}", path.display()))
            })?;
            Self::configure(&conn)?;
            if i == 0 {
                migrations::apply(&conn)?;
            }
            Self::warm_statements(&conn)?;
            tx.send(conn)
                .map_err(|_| VaultError::Fatal("connection pool channel closed".into()))?;
        }

        debug!(pool_size, path = %path.display(), "metadata store opened");
        Ok(Self { tx, rx })
    }

    /// In-memory store with a single connection, for tests.
    pub fn open_in_memory() -> Result<Self> {
        let (tx, rx) = bounded(1);
        let conn = Connection::open_in_memory()
            .map_err(|e| VaultError::Fatal(format!("cannot open in-memory store: {e}")))?;
        Self::configure(&conn)?;
        migrations::apply(&conn)?;
        Self::warm_statements(&conn)?;
        tx.send(conn)
            .map_err(|_| VaultError::Fatal("connection pool channel closed".into()))?;
        Ok(Self { tx, rx })
    }

    fn configure(conn: &Connection) -> Result<()> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;
        conn.set_prepared_statement_cache_capacity(128);
        Ok(())
    }

    fn warm_statements(conn: &Connection) -> Result<()> {
        for sql in query::WARM_STATEMENTS {
            conn.prepare_cached(sql)?;
        }
        Ok(())
    }

    /// Borrow a connection for read-only work.
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self
            .rx
            .recv()
            .map_err(|_| VaultError::Fatal("metadata store pool shut down".into()))?;
        let out = f(&conn);
        let _ = self.tx.send(conn);
        out
    }

    /// Run `f` inside a single transaction; commit on `Ok`, roll back on
    /// `Err`. Readers never observe intermediate state.
    pub fn with_txn<T>(&self, f: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self
            .rx
            .recv()
            .map_err(|_| VaultError::Fatal("metadata store pool shut down".into()))?;
        let out = Self::run_txn(&mut conn, f);
        let _ = self.tx.send(conn);
        out
    }

    fn run_txn<T>(
        conn: &mut Connection,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        let txn = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        match f(&txn) {
            Ok(v) => {
                txn.commit()?;
                Ok(v)
            }
            Err(e) => {
                // Dropping the transaction rolls it back.
                Err(e)
            }
        }
    }
}
