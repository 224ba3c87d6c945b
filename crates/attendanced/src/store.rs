//! Attendance record storage.
//!
//! [`AttendanceStore`] is the only thing handlers talk to. [`SqliteStore`]
//! is the real backend: a fixed set of SQLite connections handed out behind
//! a semaphore, so concurrent check-ins never queue behind one connection
//! and never open more than the configured number. When the database cannot
//! be opened at startup, [`UnavailableStore`] stands in and every call
//! reports the outage.

use async_trait::async_trait;
use attendance_core::{AttendanceRecord, RecordRef};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_rusqlite::Connection;

/// How long a request waits for a free connection before giving up.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS attendance (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    image      TEXT NOT NULL,
    period     TEXT NOT NULL,
    latitude   REAL,
    longitude  REAL,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);
CREATE INDEX IF NOT EXISTS idx_attendance_created_at ON attendance (created_at);
";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("storage query failed: {0}")]
    Query(String),
}

impl From<tokio_rusqlite::Error> for StoreError {
    fn from(err: tokio_rusqlite::Error) -> Self {
        match err {
            tokio_rusqlite::Error::ConnectionClosed => {
                StoreError::Unavailable("connection closed".into())
            }
            other => StoreError::Query(other.to_string()),
        }
    }
}

/// A row to insert. The store assigns `id` and `created_at`.
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub image: String,
    pub period: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

#[async_trait]
pub trait AttendanceStore: Send + Sync {
    /// Whether the backend was reachable at startup. Handlers use this to
    /// refuse writes before touching the upload directory.
    fn is_available(&self) -> bool {
        true
    }

    async fn insert_record(&self, record: NewRecord) -> Result<RecordRef, StoreError>;

    /// All records, most recent first.
    async fn list_records(&self) -> Result<Vec<AttendanceRecord>, StoreError>;

    /// Probe the backend with a trivial query. Never errors.
    async fn health_check(&self) -> bool;
}

fn parse_created_at(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn row_to_record(row: &Row) -> rusqlite::Result<AttendanceRecord> {
    Ok(AttendanceRecord {
        id: row.get(0)?,
        image: row.get(1)?,
        period: row.get(2)?,
        latitude: row.get(3)?,
        longitude: row.get(4)?,
        created_at: parse_created_at(row, 5)?,
    })
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Bounded pool of SQLite connections.
pub struct SqliteStore {
    connections: Vec<Connection>,
    idle: Mutex<Vec<usize>>,
    permits: Semaphore,
}

/// Returns a connection slot to the idle list when dropped.
struct Checkout<'a> {
    store: &'a SqliteStore,
    slot: usize,
}

impl Drop for Checkout<'_> {
    fn drop(&mut self) {
        lock(&self.store.idle).push(self.slot);
    }
}

impl SqliteStore {
    /// Open `pool_size` connections to the database at `path`, creating the
    /// file and schema if needed.
    pub async fn open(
        path: &Path,
        pool_size: usize,
        busy_timeout: Duration,
    ) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                StoreError::Unavailable(format!("create {}: {e}", parent.display()))
            })?;
        }

        let pool_size = pool_size.max(1);
        let mut connections = Vec::with_capacity(pool_size);
        for i in 0..pool_size {
            let conn = Connection::open(path)
                .await
                .map_err(|e| StoreError::Unavailable(format!("open {}: {e}", path.display())))?;

            let first = i == 0;
            conn.call(move |conn| {
                conn.busy_timeout(busy_timeout)?;
                if first {
                    let mode: String =
                        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
                    if !mode.eq_ignore_ascii_case("wal") {
                        tracing::warn!(%mode, "WAL journal mode not available");
                    }
                    conn.execute_batch(SCHEMA)?;
                }
                Ok(())
            })
            .await
            .map_err(|e| StoreError::Unavailable(format!("initialize {}: {e}", path.display())))?;

            connections.push(conn);
        }

        tracing::info!(path = %path.display(), pool_size, "attendance store opened");

        Ok(Self {
            idle: Mutex::new((0..pool_size).collect()),
            permits: Semaphore::new(pool_size),
            connections,
        })
    }

    /// Run `f` on a pooled connection.
    async fn call<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut rusqlite::Connection) -> tokio_rusqlite::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let _permit = tokio::time::timeout(ACQUIRE_TIMEOUT, self.permits.acquire())
            .await
            .map_err(|_| StoreError::Unavailable("timed out waiting for a connection".into()))?
            .map_err(|_| StoreError::Unavailable("pool closed".into()))?;

        let slot = lock(&self.idle)
            .pop()
            .ok_or_else(|| StoreError::Unavailable("no idle connection".into()))?;
        let checkout = Checkout { store: self, slot };

        let result = self.connections[checkout.slot].call(f).await;
        drop(checkout);
        Ok(result?)
    }
}

#[async_trait]
impl AttendanceStore for SqliteStore {
    async fn insert_record(&self, record: NewRecord) -> Result<RecordRef, StoreError> {
        self.call(move |conn| {
            let (id, created_at) = conn.query_row(
                "INSERT INTO attendance (image, period, latitude, longitude)
                 VALUES (?1, ?2, ?3, ?4)
                 RETURNING id, created_at",
                params![record.image, record.period, record.latitude, record.longitude],
                |row| Ok((row.get::<_, i64>(0)?, parse_created_at(row, 1)?)),
            )?;
            Ok(RecordRef {
                id,
                image: record.image,
                period: record.period,
                created_at,
            })
        })
        .await
    }

    async fn list_records(&self) -> Result<Vec<AttendanceRecord>, StoreError> {
        self.call(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, image, period, latitude, longitude, created_at
                 FROM attendance
                 ORDER BY created_at DESC, id DESC",
            )?;
            let records = stmt
                .query_map([], row_to_record)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(records)
        })
        .await
    }

    async fn health_check(&self) -> bool {
        let probe = self
            .call(|conn| Ok(conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?))
            .await;
        match probe {
            Ok(_) => true,
            Err(err) => {
                tracing::warn!(error = %err, "health check failed");
                false
            }
        }
    }
}

/// Stand-in used when the database could not be opened at startup.
pub struct UnavailableStore {
    reason: String,
}

impl UnavailableStore {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl AttendanceStore for UnavailableStore {
    fn is_available(&self) -> bool {
        false
    }

    async fn insert_record(&self, _record: NewRecord) -> Result<RecordRef, StoreError> {
        Err(StoreError::Unavailable(self.reason.clone()))
    }

    async fn list_records(&self) -> Result<Vec<AttendanceRecord>, StoreError> {
        Err(StoreError::Unavailable(self.reason.clone()))
    }

    async fn health_check(&self) -> bool {
        false
    }
}
