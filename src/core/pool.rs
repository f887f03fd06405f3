//! Serialized-writer / concurrent-reader pool for the workspace database.
//!
//! Write operations are serialized through a per-path mutex so exactly one writer
//! transaction is in flight against a given `workspace.sqlite3` at a time; reads take
//! a fresh connection and rely on WAL mode for concurrency with the writer.
//!
//! Retry policy on `SQLITE_BUSY` / `SQLITE_LOCKED`: exponential backoff, base 50 ms,
//! factor 2, up to 8 attempts.

use crate::core::db;
use crate::core::error::CanaryError;
use rusqlite::Connection;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::thread;
use std::time::Duration;

const MAX_RETRIES: u32 = 8;
const BASE_DELAY_MS: u64 = 50;

struct PoolEntry {
    write_lock: Mutex<()>,
}

/// Connection pool providing read/write separation for a single workspace database.
pub struct WorkspacePool {
    entries: Mutex<HashMap<PathBuf, &'static PoolEntry>>,
}

impl WorkspacePool {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entry(&self, db_path: &Path) -> Result<&'static PoolEntry, CanaryError> {
        let key = db_path.to_path_buf();
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| CanaryError::ValidationError("pool lock poisoned".into()))?;
        if let Some(e) = entries.get(&key) {
            return Ok(*e);
        }
        let entry = Box::leak(Box::new(PoolEntry {
            write_lock: Mutex::new(()),
        }));
        entries.insert(key, entry);
        Ok(entry)
    }

    /// Run `f` with an exclusive writer connection, retrying on transient contention.
    pub fn with_write<F, R>(&self, db_path: &Path, mut f: F) -> Result<R, CanaryError>
    where
        F: FnMut(&Connection) -> Result<R, CanaryError>,
    {
        let entry = self.entry(db_path)?;
        let _guard = entry
            .write_lock
            .lock()
            .map_err(|_| CanaryError::ValidationError("write lock poisoned".into()))?;
        retry_on_busy(|| {
            let conn = db::connect(db_path)?;
            f(&conn)
        })
    }

    /// Run `f` with a fresh read connection. No mutex: WAL allows concurrent reads.
    pub fn with_read<F, R>(&self, db_path: &Path, mut f: F) -> Result<R, CanaryError>
    where
        F: FnMut(&Connection) -> Result<R, CanaryError>,
    {
        retry_on_busy(|| {
            let conn = db::connect(db_path)?;
            f(&conn)
        })
    }
}

fn retry_on_busy<F, R>(mut f: F) -> Result<R, CanaryError>
where
    F: FnMut() -> Result<R, CanaryError>,
{
    let mut attempt = 0u32;
    loop {
        match f() {
            Ok(v) => return Ok(v),
            Err(e) if is_busy_error(&e) && attempt < MAX_RETRIES => {
                attempt += 1;
                let delay_ms = BASE_DELAY_MS * 2u64.pow(attempt - 1);
                thread::sleep(Duration::from_millis(delay_ms));
            }
            Err(e) => return Err(e),
        }
    }
}

fn is_busy_error(err: &CanaryError) -> bool {
    match err {
        CanaryError::RusqliteError(rusqlite::Error::SqliteFailure(code, _)) => matches!(
            code.code,
            rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
        ),
        _ => false,
    }
}

/// Global pool instance, one per process.
pub fn global_pool() -> &'static WorkspacePool {
    static POOL: OnceLock<WorkspacePool> = OnceLock::new();
    POOL.get_or_init(WorkspacePool::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_write_and_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("workspace.sqlite3");
        let pool = WorkspacePool::new();
        pool.with_write(&db_path, |conn| {
            conn.execute("CREATE TABLE t (id INTEGER PRIMARY KEY)", [])?;
            conn.execute("INSERT INTO t (id) VALUES (1)", [])?;
            Ok(())
        })
        .unwrap();
        let count: i64 = pool
            .with_read(&db_path, |conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0))?)
            })
            .unwrap();
        assert_eq!(count, 1);
    }
}
