//! Metadata index
//!
//! Durable identifier -> expiry table. The orchestrator only talks to the
//! [`MetadataIndex`] trait, so the SQLite engine can be swapped for another
//! embedded store (or the volatile [`MemoryIndex`]) without touching it.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use once_cell::sync::OnceCell;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info, warn};

use crate::error::{CacheError, Result};

/// Schema: one row per identifier, expiry indexed for sweeps
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS CacheItem (
    Key        TEXT PRIMARY KEY NOT NULL,
    ExpireTime INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS CacheItem_ExpireTime ON CacheItem(ExpireTime);
"#;

/// One metadata row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    /// Hashed key identifier
    pub id: String,
    /// Absolute expiry time
    pub expire_at: SystemTime,
}

impl IndexEntry {
    /// An entry is expired once its expiry time is not in the future
    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        self.expire_at <= now
    }
}

/// Durable, sorted identifier -> expiry table
pub trait MetadataIndex: Send + Sync {
    /// Create the underlying storage and schema if needed.
    ///
    /// Idempotent; every other method initializes lazily on first use,
    /// so calling this is only a way to surface init errors early.
    fn init(&self) -> Result<()> {
        Ok(())
    }

    /// Insert or replace the row for `id`
    fn upsert(&self, id: &str, expire_at: SystemTime) -> Result<()>;

    /// Point lookup
    fn lookup(&self, id: &str) -> Result<Option<IndexEntry>>;

    /// All rows with `expire_at <= now`, in no particular order
    fn list_expired(&self, now: SystemTime) -> Result<Vec<IndexEntry>>;

    /// Remove the given rows, returning how many existed
    fn remove(&self, ids: &[String]) -> Result<usize>;

    /// Remove the given rows only where `expire_at <= now` still holds,
    /// so rows refreshed since they were listed survive
    fn remove_expired(&self, ids: &[String], now: SystemTime) -> Result<usize>;

    /// Remove every row, returning how many existed
    fn clear(&self) -> Result<usize>;

    /// Number of rows
    fn len(&self) -> Result<usize>;

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

/// Milliseconds since the Unix epoch (negative before it)
fn to_millis(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => i64::try_from(d.as_millis()).unwrap_or(i64::MAX),
        Err(e) => -i64::try_from(e.duration().as_millis()).unwrap_or(i64::MAX),
    }
}

/// Inverse of [`to_millis`]; unrepresentable values collapse to the epoch (expired)
fn from_millis(ms: i64) -> SystemTime {
    let offset = Duration::from_millis(ms.unsigned_abs());
    let time = if ms >= 0 {
        UNIX_EPOCH.checked_add(offset)
    } else {
        UNIX_EPOCH.checked_sub(offset)
    };
    time.unwrap_or(UNIX_EPOCH)
}

/// SQLite-backed index with a lazily opened, shared connection
///
/// The connection is opened and the schema created exactly once, on the
/// first call that needs it; concurrent first callers block until that one
/// initialization finishes and then share the same handle. A failed
/// initialization leaves the cell empty, so the next call tries again.
pub struct SqliteIndex {
    /// Database file location
    path: PathBuf,
    /// Busy timeout applied to the connection
    busy_timeout: Duration,
    /// Connection, created on first use
    conn: OnceCell<Mutex<Connection>>,
}

impl SqliteIndex {
    /// Describe an index at `path`; nothing touches the disk until first use
    ///
    /// # Arguments
    /// * `path` - Database file, created with its parent directories
    /// * `busy_timeout` - How long a call waits on a locked database
    pub fn new(path: impl Into<PathBuf>, busy_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            busy_timeout,
            conn: OnceCell::new(),
        }
    }

    /// Path of the database file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the connection has been opened yet
    pub fn is_initialized(&self) -> bool {
        self.conn.get().is_some()
    }

    fn connection(&self) -> Result<MutexGuard<'_, Connection>> {
        let conn = self.conn.get_or_try_init(|| self.open().map(Mutex::new))?;
        Ok(conn.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn open(&self) -> Result<Connection> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| CacheError::io(parent, e))?;
        }

        let init_err = |source: rusqlite::Error| CacheError::IndexInit {
            path: self.path.clone(),
            source,
        };

        let conn = Connection::open(&self.path).map_err(init_err)?;
        conn.busy_timeout(self.busy_timeout).map_err(init_err)?;
        if let Err(e) = conn.pragma_update(None, "journal_mode", "WAL") {
            warn!(path = %self.path.display(), error = %e, "Could not enable WAL journal");
        }
        conn.execute_batch(SCHEMA).map_err(init_err)?;

        info!(path = %self.path.display(), "Metadata index initialized");
        Ok(conn)
    }
}

impl MetadataIndex for SqliteIndex {
    fn init(&self) -> Result<()> {
        self.connection().map(drop)
    }

    fn upsert(&self, id: &str, expire_at: SystemTime) -> Result<()> {
        let conn = self.connection()?;
        conn.execute(
            "INSERT INTO CacheItem (Key, ExpireTime) VALUES (?1, ?2)
             ON CONFLICT(Key) DO UPDATE SET ExpireTime = excluded.ExpireTime",
            params![id, to_millis(expire_at)],
        )?;
        Ok(())
    }

    fn lookup(&self, id: &str) -> Result<Option<IndexEntry>> {
        let conn = self.connection()?;
        let expire_ms: Option<i64> = conn
            .query_row(
                "SELECT ExpireTime FROM CacheItem WHERE Key = ?1",
                [id],
                |row| row.get(0),
            )
            .optional()?;

        Ok(expire_ms.map(|ms| IndexEntry {
            id: id.to_string(),
            expire_at: from_millis(ms),
        }))
    }

    fn list_expired(&self, now: SystemTime) -> Result<Vec<IndexEntry>> {
        let conn = self.connection()?;
        let mut stmt =
            conn.prepare("SELECT Key, ExpireTime FROM CacheItem WHERE ExpireTime <= ?1")?;

        let rows = stmt.query_map([to_millis(now)], |row| {
            Ok(IndexEntry {
                id: row.get(0)?,
                expire_at: from_millis(row.get(1)?),
            })
        })?;

        let mut expired = Vec::new();
        for row in rows {
            expired.push(row?);
        }
        Ok(expired)
    }

    fn remove(&self, ids: &[String]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        let mut removed = 0;
        {
            let mut stmt = tx.prepare("DELETE FROM CacheItem WHERE Key = ?1")?;
            for id in ids {
                removed += stmt.execute([id])?;
            }
        }
        tx.commit()?;

        debug!(removed = removed, "Removed index rows");
        Ok(removed)
    }

    fn remove_expired(&self, ids: &[String], now: SystemTime) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }

        let now_ms = to_millis(now);
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        let mut removed = 0;
        {
            let mut stmt =
                tx.prepare("DELETE FROM CacheItem WHERE Key = ?1 AND ExpireTime <= ?2")?;
            for id in ids {
                removed += stmt.execute(params![id, now_ms])?;
            }
        }
        tx.commit()?;

        debug!(removed = removed, "Removed expired index rows");
        Ok(removed)
    }

    fn clear(&self) -> Result<usize> {
        let conn = self.connection()?;
        Ok(conn.execute("DELETE FROM CacheItem", [])?)
    }

    fn len(&self) -> Result<usize> {
        let conn = self.connection()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM CacheItem", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }
}

/// Volatile index for tests and hosts that do not need durability
#[derive(Default)]
pub struct MemoryIndex {
    rows: Mutex<HashMap<String, SystemTime>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn rows(&self) -> MutexGuard<'_, HashMap<String, SystemTime>> {
        self.rows.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MetadataIndex for MemoryIndex {
    fn upsert(&self, id: &str, expire_at: SystemTime) -> Result<()> {
        self.rows().insert(id.to_string(), expire_at);
        Ok(())
    }

    fn lookup(&self, id: &str) -> Result<Option<IndexEntry>> {
        Ok(self.rows().get(id).map(|&expire_at| IndexEntry {
            id: id.to_string(),
            expire_at,
        }))
    }

    fn list_expired(&self, now: SystemTime) -> Result<Vec<IndexEntry>> {
        Ok(self
            .rows()
            .iter()
            .filter(|(_, expire_at)| **expire_at <= now)
            .map(|(id, &expire_at)| IndexEntry {
                id: id.clone(),
                expire_at,
            })
            .collect())
    }

    fn remove(&self, ids: &[String]) -> Result<usize> {
        let mut rows = self.rows();
        Ok(ids.iter().filter(|id| rows.remove(*id).is_some()).count())
    }

    fn remove_expired(&self, ids: &[String], now: SystemTime) -> Result<usize> {
        let mut rows = self.rows();
        let mut removed = 0;
        for id in ids {
            if rows.get(id).is_some_and(|expire_at| *expire_at <= now) {
                rows.remove(id);
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn clear(&self) -> Result<usize> {
        let mut rows = self.rows();
        let count = rows.len();
        rows.clear();
        Ok(count)
    }

    fn len(&self) -> Result<usize> {
        Ok(self.rows().len())
    }
}
