//! SQLite storage layer for the SiteHero sync engine.
//!
//! Provides durable local storage for cached records, the pending mutation
//! queue, unresolved conflicts and per-table sync state.
//!
//! # Architecture
//!
//! - One SQLite table per synced table (`rec_<table>`), keyed by entity id,
//!   with a secondary index on sync status
//! - `pending_mutations` holds the persisted sync queue
//! - `conflicts` holds unresolved conflicts until the user settles them
//! - `sync_state` holds the table priority ranking and last-synced cursors
//! - Multi-row writes go through [`LocalStore::atomically`]

mod error;
mod local_store;
mod quota;

pub use error::{StorageError, StorageResult};
pub use local_store::{EvictionCandidate, LocalStore, StoreTxn};
pub use quota::{QuotaConfig, StorageQuotaManager};

use std::path::{Path, PathBuf};
use tracing::warn;

/// Open a SQLite connection, recovering once from a damaged WAL.
///
/// Only a database that SQLite reports as corrupt or not a database gets a
/// second attempt: the `-wal` file next to it is moved aside to
/// `<name>-wal.corrupt` and the open is retried once. Every other failure,
/// including a busy or locked database, is returned unchanged and leaves the
/// WAL where it is.
pub fn open_sqlite_with_wal_recovery(path: &Path) -> StorageResult<rusqlite::Connection> {
    match open_and_configure(path) {
        Ok(conn) => Ok(conn),
        Err(err) if is_corruption(&err) => {
            let wal_path = sibling(path, "-wal");
            if !wal_path.exists() {
                return Err(err);
            }
            let aside = sibling(path, "-wal.corrupt");
            warn!(
                "SQLite reported a damaged database, moving WAL aside to {} and retrying: {err}",
                aside.display()
            );
            std::fs::rename(&wal_path, &aside)?;
            open_and_configure(path)
        }
        Err(err) => Err(err),
    }
}

fn is_corruption(err: &StorageError) -> bool {
    matches!(
        err,
        StorageError::Sqlite(rusqlite::Error::SqliteFailure(e, _))
            if matches!(
                e.code,
                rusqlite::ErrorCode::NotADatabase | rusqlite::ErrorCode::DatabaseCorrupt
            )
    )
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

fn open_and_configure(path: &Path) -> StorageResult<rusqlite::Connection> {
    let conn = rusqlite::Connection::open(path)?;
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
    conn.pragma_update(None, "synchronous", "FULL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(conn)
}
