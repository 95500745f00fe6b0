//! Durable telemetry buffer backed by SQLite.
//!
//! The store is insert-then-flag: readings are appended once, flipped to
//! published at most once, and deleted only by retention eviction after they
//! have been published.
//!
//! # Schema
//!
//! ```sql
//! CREATE TABLE telemetry_buffer (
//!     id INTEGER PRIMARY KEY AUTOINCREMENT,
//!     device_id TEXT NOT NULL,
//!     timestamp INTEGER NOT NULL,
//!     co2_ppm INTEGER,
//!     temperature_c REAL,
//!     humidity_rh REAL,
//!     occupancy INTEGER,
//!     battery_mv INTEGER,
//!     rssi INTEGER,
//!     received_at INTEGER NOT NULL,
//!     published INTEGER DEFAULT 0,
//!     published_at INTEGER
//! );
//! CREATE INDEX idx_published ON telemetry_buffer(published, received_at);
//! CREATE INDEX idx_device_timestamp ON telemetry_buffer(device_id, timestamp DESC);
//! ```

use crate::reading::{BufferedRecord, Reading};
use rusqlite::{Connection, params};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;

/// Errors from the underlying storage medium.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Failed to create store directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("Telemetry store is closed")]
    Closed,
    #[error("Store operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("Store worker failed: {0}")]
    Worker(String),
}

/// Durable log of buffered readings.
///
/// Thread-safe via an internal mutex; every statement runs under the lock so
/// writes are serialized and readers never see a half-written row.
#[derive(Debug)]
pub struct TelemetryStore {
    conn: Mutex<Option<Connection>>,
}

impl TelemetryStore {
    /// Open (or create) a store at `path`, creating parent directories.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        let _mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Self::with_connection(conn)
    }

    /// Create an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StorageError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS telemetry_buffer (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                device_id TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                co2_ppm INTEGER,
                temperature_c REAL,
                humidity_rh REAL,
                occupancy INTEGER,
                battery_mv INTEGER,
                rssi INTEGER,
                received_at INTEGER NOT NULL,
                published INTEGER DEFAULT 0,
                published_at INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_published
                ON telemetry_buffer(published, received_at);
            CREATE INDEX IF NOT EXISTS idx_device_timestamp
                ON telemetry_buffer(device_id, timestamp DESC);",
        )?;

        Ok(Self {
            conn: Mutex::new(Some(conn)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Option<Connection>> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T, StorageError> {
        let guard = self.lock();
        let conn = guard.as_ref().ok_or(StorageError::Closed)?;
        Ok(f(conn)?)
    }

    /// Run `op` on the blocking pool so callers on the async runtime never
    /// wait on disk I/O directly. Gives up after `limit`; the operation
    /// itself may still complete in the background.
    pub async fn run_blocking<T, F>(
        self: &Arc<Self>,
        limit: Duration,
        op: F,
    ) -> Result<T, StorageError>
    where
        F: FnOnce(&TelemetryStore) -> Result<T, StorageError> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(self);
        match timeout(limit, tokio::task::spawn_blocking(move || op(&store))).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(StorageError::Worker(e.to_string())),
            Err(_) => Err(StorageError::Timeout(limit)),
        }
    }

    /// Append a reading, returning its local record id.
    pub fn append(&self, reading: &Reading) -> Result<i64, StorageError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO telemetry_buffer
                 (device_id, timestamp, co2_ppm, temperature_c, humidity_rh,
                  occupancy, battery_mv, rssi, received_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    reading.device_id,
                    reading.sample_timestamp,
                    reading.co2_ppm,
                    f64::from(reading.temperature_c),
                    f64::from(reading.humidity_rh),
                    reading.occupancy,
                    reading.battery_mv,
                    reading.signal_strength,
                    reading.received_at,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Up to `limit` unpublished records, oldest `received_at` first,
    /// ties broken by insertion order.
    pub fn fetch_unpublished(&self, limit: usize) -> Result<Vec<BufferedRecord>, StorageError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id, device_id, timestamp, co2_ppm, temperature_c, humidity_rh,
                        occupancy, battery_mv, rssi, received_at, published, published_at
                 FROM telemetry_buffer
                 WHERE published = 0
                 ORDER BY received_at ASC, id ASC
                 LIMIT ?1",
            )?;
            let records = stmt
                .query_map([limit], row_to_record)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(records)
        })
    }

    /// Flag the record identified by `(device_id, sample_timestamp)` as published.
    ///
    /// Idempotent: already published or unknown records are left untouched.
    /// Returns the number of records that changed state.
    pub fn mark_published(
        &self,
        device_id: &str,
        sample_timestamp: u32,
        at: i64,
    ) -> Result<usize, StorageError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE telemetry_buffer
                 SET published = 1, published_at = ?1
                 WHERE device_id = ?2 AND timestamp = ?3 AND published = 0",
                params![at, device_id, sample_timestamp],
            )
        })
    }

    /// Delete published records received before `cutoff`.
    ///
    /// Unpublished records are kept regardless of age.
    pub fn evict_published_older_than(&self, cutoff: i64) -> Result<usize, StorageError> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM telemetry_buffer WHERE published = 1 AND received_at < ?1",
                [cutoff],
            )
        })
    }

    /// Backlog size.
    pub fn count_unpublished(&self) -> Result<u64, StorageError> {
        let count: i64 = self.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM telemetry_buffer WHERE published = 0",
                [],
                |row| row.get(0),
            )
        })?;
        Ok(count.max(0) as u64)
    }

    /// Release the underlying connection. Later operations fail with
    /// [`StorageError::Closed`]; closing twice is a no-op.
    pub fn close(&self) -> Result<(), StorageError> {
        let conn = self.lock().take();
        match conn {
            Some(conn) => conn.close().map_err(|(_, e)| StorageError::Sqlite(e)),
            None => Ok(()),
        }
    }
}

fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<BufferedRecord> {
    Ok(BufferedRecord {
        id: row.get(0)?,
        reading: Reading {
            device_id: row.get(1)?,
            sample_timestamp: row.get(2)?,
            co2_ppm: row.get(3)?,
            temperature_c: row.get::<_, f64>(4)? as f32,
            humidity_rh: row.get::<_, f64>(5)? as f32,
            occupancy: row.get(6)?,
            battery_mv: row.get(7)?,
            signal_strength: row.get(8)?,
            received_at: row.get(9)?,
        },
        published: row.get(10)?,
        published_at: row.get(11)?,
    })
}
