//! Database connection primitives.
//!
//! A single connection per process owns the store's SQLite file. Concurrent
//! readers are supported by WAL; concurrent writers serialize on the busy
//! timeout plus the in-process write lock held by the gateway.

use crate::core::error::EngineError;
use crate::core::migration;
use crate::core::store::Store;
use rusqlite::Connection;
use std::fs;
use std::path::Path;

/// Establish a SQLite connection with the engine's standard configuration.
///
/// Enables:
/// - WAL (Write-Ahead Logging) mode for better concurrency
/// - Foreign key constraints
/// - 5-second busy timeout for lock contention
pub fn db_connect(db_path: &Path) -> Result<Connection, EngineError> {
    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent).map_err(EngineError::Io)?;
    }
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .map_err(EngineError::Storage)?;
    conn.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))
        .map_err(EngineError::Storage)?;
    conn.execute("PRAGMA foreign_keys=ON;", [])
        .map_err(EngineError::Storage)?;
    Ok(conn)
}

/// Open the store database, applying any pending migrations first.
///
/// Migration failure is fatal to the caller; the error names the migration.
pub fn open_store_db(store: &Store) -> Result<Connection, EngineError> {
    let mut conn = db_connect(&store.db_path())?;
    migration::run_migrations(&mut conn)?;
    Ok(conn)
}
