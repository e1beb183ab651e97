//! SQLite-backed key store
//!
//! Keeps a single connection behind a `std::sync::Mutex` and runs every
//! statement on the blocking pool so request tasks never stall the runtime
//! on disk I/O. The table layout matches the `keys` schema used by earlier
//! deployments, so an existing `keys.db` can be opened as-is.

use std::path::Path;
use std::sync::{Arc, Mutex};

use common::fingerprint;
use rusqlite::{Connection, ErrorCode, params};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::{KeyRecord, KeyStore, StoreFuture};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS keys (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    key TEXT UNIQUE,
    memo TEXT,
    usage INTEGER DEFAULT 0
)";

/// Key store persisted in a SQLite database file.
#[derive(Clone)]
pub struct SqliteKeyStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteKeyStore {
    /// Open (or create) the database at `path` and ensure the schema exists.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute(SCHEMA, [])?;
        info!(path = %path.display(), "opened key database");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory database, used by tests and throwaway deployments.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute(SCHEMA, [])?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `op` against the connection on the blocking thread pool.
    async fn with_conn<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|_| Error::Unavailable("connection mutex poisoned".into()))?;
            op(&conn)
        })
        .await
        .map_err(|e| Error::Unavailable(format!("blocking task failed: {e}")))?
    }
}

impl KeyStore for SqliteKeyStore {
    fn scan_all(&self) -> StoreFuture<'_, Vec<KeyRecord>> {
        Box::pin(self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT key, COALESCE(memo, ''), COALESCE(usage, 0) FROM keys ORDER BY id")?;
            let rows = stmt.query_map([], |row| {
                let usage: i64 = row.get(2)?;
                Ok(KeyRecord {
                    value: row.get(0)?,
                    memo: row.get(1)?,
                    usage: u64::try_from(usage).unwrap_or(0),
                })
            })?;
            let records = rows.collect::<rusqlite::Result<Vec<_>>>()?;
            debug!(records = records.len(), "scanned key table");
            Ok(records)
        }))
    }

    fn insert<'a>(&'a self, value: &'a str, memo: &'a str) -> StoreFuture<'a, ()> {
        let value = value.to_owned();
        let memo = memo.to_owned();
        Box::pin(self.with_conn(move |conn| {
            match conn.execute(
                "INSERT INTO keys (key, memo) VALUES (?1, ?2)",
                params![value, memo],
            ) {
                Ok(_) => {
                    debug!(key = %fingerprint(&value), "inserted key");
                    Ok(())
                }
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == ErrorCode::ConstraintViolation =>
                {
                    Err(Error::Duplicate(fingerprint(&value)))
                }
                Err(e) => Err(e.into()),
            }
        }))
    }

    fn delete<'a>(&'a self, value: &'a str) -> StoreFuture<'a, bool> {
        let value = value.to_owned();
        Box::pin(self.with_conn(move |conn| {
            let removed = conn.execute("DELETE FROM keys WHERE key = ?1", params![value])?;
            debug!(key = %fingerprint(&value), removed, "deleted key");
            Ok(removed > 0)
        }))
    }

    fn increment_usage<'a>(&'a self, value: &'a str, weight: u64) -> StoreFuture<'a, ()> {
        let value = value.to_owned();
        let weight = i64::try_from(weight).unwrap_or(i64::MAX);
        Box::pin(self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE keys SET usage = COALESCE(usage, 0) + ?1 WHERE key = ?2",
                params![weight, value],
            )?;
            if updated == 0 {
                return Err(Error::NotFound(fingerprint(&value)));
            }
            Ok(())
        }))
    }
}
