//! # tss-db
//!
//! Deposit-state database for the signing service.
//!
//! A single SQLite file holds the `deposits` table. Writers go through the
//! shared [`Database`] handle, which serializes access and keeps every write
//! a short statement or transaction.
//!
//! ## Schema
//!
//! - Schema version stored in `PRAGMA user_version`
//! - Amounts are decimal strings (arbitrary precision)
//! - `(chain_id, tx_hash, tx_nonce)` is unique

pub mod migrations;
pub mod queries;
pub mod schema;

use std::path::Path;
use std::sync::Arc;

use rusqlite::Connection;
use tokio::sync::Mutex;
use tss_types::{Deposit, DepositIdentifier, WithdrawalStatus};

/// Current schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// Database error types.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("migration failed: {0}")]
    Migration(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Unique constraint on the deposit identifier.
    #[error("duplicate deposit: {0}")]
    Duplicate(DepositIdentifier),

    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, DbError>;

/// Open or create the database at the given path and migrate it.
pub fn open(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    configure(&conn)?;
    migrations::run(&conn)?;
    Ok(conn)
}

/// Open the database without running migrations.
pub fn open_unmigrated(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    configure(&conn)?;
    Ok(conn)
}

/// Open an in-memory database (for testing).
pub fn open_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    configure(&conn)?;
    migrations::run(&conn)?;
    Ok(conn)
}

fn configure(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;
    Ok(())
}

/// Shared handle used by sessions and the API.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    pub fn open(path: &Path) -> Result<Self> {
        open(path).map(Self::new)
    }

    pub fn open_memory() -> Result<Self> {
        open_memory().map(Self::new)
    }

    /// Insert a new deposit. Fails with [`DbError::Duplicate`] if known.
    pub async fn insert_deposit(&self, deposit: &Deposit) -> Result<i64> {
        let conn = self.conn.lock().await;
        queries::deposits::insert(&conn, deposit)
    }

    pub async fn get_deposit(&self, id: &DepositIdentifier) -> Result<Deposit> {
        let conn = self.conn.lock().await;
        queries::deposits::get(&conn, id)
    }

    /// The oldest pending deposit withdrawing to `withdrawal_chain_id`.
    pub async fn oldest_pending(&self, withdrawal_chain_id: &str) -> Result<Option<Deposit>> {
        let conn = self.conn.lock().await;
        queries::deposits::oldest_pending(&conn, withdrawal_chain_id)
    }

    pub async fn mark_processed(
        &self,
        id: &DepositIdentifier,
        signature: &str,
        withdrawal_tx_hash: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        queries::deposits::mark_processed(&conn, id, signature, withdrawal_tx_hash)
    }

    pub async fn set_status(&self, id: &DepositIdentifier, status: WithdrawalStatus) -> Result<()> {
        let conn = self.conn.lock().await;
        queries::deposits::set_status(&conn, id, status)
    }

    pub async fn count_by_status(&self, status: WithdrawalStatus) -> Result<u64> {
        let conn = self.conn.lock().await;
        queries::deposits::count_by_status(&conn, status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_memory() {
        let conn = open_memory().expect("open in-memory db");
        let version: u32 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .expect("get user_version");
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_journal_mode() {
        let conn = open_memory().expect("open");
        let mode: String = conn
            .pragma_query_value(None, "journal_mode", |row| row.get(0))
            .expect("get journal_mode");
        assert!(mode == "wal" || mode == "memory");
    }
}
