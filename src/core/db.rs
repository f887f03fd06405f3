//! Database connection primitives for the workspace SQLite index.
//!
//! # Notes
//!
//! - WAL mode enabled for concurrent readers.
//! - Foreign keys enforced.
//! - 30-second busy timeout, matching the concurrency model's suspension-point
//!   contract (SQLite in WAL mode with timeout 30 s).
//! - Callers should not open connections directly for writes; go through
//!   [`crate::core::pool::WorkspacePool::with_write`] so writes are serialized per
//!   database file.

use crate::core::error::CanaryError;
use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;

pub const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// Open a connection with Canary's standard pragmas.
pub fn connect(db_path: &Path) -> Result<Connection, CanaryError> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))?;
    conn.execute("PRAGMA foreign_keys=ON;", [])?;
    Ok(conn)
}
