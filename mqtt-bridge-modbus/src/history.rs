//! Telemetry history in SQLite.

use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rtugate_common::{TelemetryEvent, current_timestamp_millis};
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{DbConfig, HistoryConfig};

const DAY_MS: i64 = 86_400_000;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Append-only event table with size and age limits.
#[derive(Debug)]
pub struct HistoryStore {
    pool: SqlitePool,
    rotation: HistoryConfig,
    /// Inserts since the last rotation; the lock also serializes writers.
    inserts: Mutex<u64>,
}

impl HistoryStore {
    /// Open (or create) the database and its schema.
    pub async fn open(config: &DbConfig) -> Result<Self, HistoryError> {
        let in_memory = config.url.contains(":memory:");
        let mut options = SqliteConnectOptions::from_str(&config.url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));

        let pool_options = if in_memory {
            // Every connection to :memory: is a separate database.
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            if let Some(parent) = options.get_filename().parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            options = options.journal_mode(SqliteJournalMode::Wal);
            SqlitePoolOptions::new().max_connections(4)
        };

        let pool = pool_options.connect_with(options).await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS telemetry_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                topic TEXT NOT NULL,
                object TEXT NOT NULL,
                param TEXT NOT NULL,
                line TEXT NOT NULL,
                unit_id INTEGER NOT NULL,
                register_type TEXT NOT NULL,
                address INTEGER NOT NULL,
                value TEXT,
                code INTEGER NOT NULL,
                message TEXT NOT NULL,
                silent_for_s INTEGER NOT NULL,
                ts_ms INTEGER NOT NULL
            )",
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_telemetry_events_ts ON telemetry_events (ts_ms, id)",
        )
        .execute(&pool)
        .await?;

        info!(url = %config.url, "History database ready");

        Ok(Self {
            pool,
            rotation: config.history.clone(),
            inserts: Mutex::new(0),
        })
    }

    /// Append one event; runs rotation every `cleanup_every` inserts.
    pub async fn insert(&self, event: &TelemetryEvent) -> Result<(), HistoryError> {
        let mut inserts = self.inserts.lock().await;

        sqlx::query(
            "INSERT INTO telemetry_events
                (topic, object, param, line, unit_id, register_type, address,
                 value, code, message, silent_for_s, ts_ms)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&event.topic)
        .bind(&event.object)
        .bind(&event.param)
        .bind(&event.line)
        .bind(i64::from(event.unit_id))
        .bind(&event.register_type)
        .bind(i64::from(event.address))
        .bind(&event.value)
        .bind(event.code)
        .bind(&event.message)
        .bind(i64::try_from(event.silent_for_s).unwrap_or(i64::MAX))
        .bind(event.timestamp)
        .execute(&self.pool)
        .await?;

        *inserts += 1;
        if *inserts >= self.rotation.cleanup_every {
            *inserts = 0;
            match self.rotate(current_timestamp_millis()).await {
                Ok(0) => {}
                Ok(deleted) => debug!(deleted, "History rotated"),
                Err(e) => warn!(error = %e, "History rotation failed"),
            }
        }

        Ok(())
    }

    /// Apply the TTL and row cap relative to `now_ms`. Returns the number of deleted rows.
    pub async fn rotate(&self, now_ms: i64) -> Result<u64, HistoryError> {
        let mut deleted = 0;

        if self.rotation.ttl_days > 0 {
            let ttl = i64::try_from(self.rotation.ttl_days)
                .unwrap_or(i64::MAX / DAY_MS)
                .saturating_mul(DAY_MS);
            let cutoff = now_ms.saturating_sub(ttl);
            deleted += sqlx::query("DELETE FROM telemetry_events WHERE ts_ms < ?")
                .bind(cutoff)
                .execute(&self.pool)
                .await?
                .rows_affected();
        }

        if self.rotation.max_rows > 0 {
            let max_rows = i64::try_from(self.rotation.max_rows).unwrap_or(i64::MAX);
            let count = self.count().await?;
            if count > max_rows {
                deleted += sqlx::query(
                    "DELETE FROM telemetry_events WHERE id IN (
                        SELECT id FROM telemetry_events ORDER BY ts_ms ASC, id ASC LIMIT ?
                    )",
                )
                .bind(count - max_rows)
                .execute(&self.pool)
                .await?
                .rows_affected();
            }
        }

        Ok(deleted)
    }

    pub async fn count(&self) -> Result<i64, HistoryError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM telemetry_events")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Newest events first.
    pub async fn recent(&self, limit: u32) -> Result<Vec<TelemetryEvent>, HistoryError> {
        let rows = sqlx::query(
            "SELECT topic, object, param, line, unit_id, register_type, address,
                    value, code, message, silent_for_s, ts_ms
             FROM telemetry_events ORDER BY ts_ms DESC, id DESC LIMIT ?",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<TelemetryEvent, HistoryError> {
                Ok(TelemetryEvent {
                    topic: row.try_get("topic")?,
                    object: row.try_get("object")?,
                    param: row.try_get("param")?,
                    line: row.try_get("line")?,
                    unit_id: u8::try_from(row.try_get::<i64, _>("unit_id")?).unwrap_or_default(),
                    register_type: row.try_get("register_type")?,
                    address: u16::try_from(row.try_get::<i64, _>("address")?).unwrap_or_default(),
                    value: row.try_get("value")?,
                    code: row.try_get("code")?,
                    message: row.try_get("message")?,
                    silent_for_s: u64::try_from(row.try_get::<i64, _>("silent_for_s")?)
                        .unwrap_or_default(),
                    timestamp: row.try_get("ts_ms")?,
                })
            })
            .collect()
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Non-blocking destination for telemetry events.
pub trait EventSink: Send + Sync {
    fn submit(&self, event: TelemetryEvent);
}

/// Queue in front of a [`HistoryStore`], drained by one writer task.
#[derive(Debug, Clone)]
pub struct HistoryWriter {
    tx: mpsc::Sender<TelemetryEvent>,
    dropped: Arc<AtomicU64>,
}

impl HistoryWriter {
    /// Start the writer task. It ends once every writer handle is dropped.
    pub fn spawn(store: Arc<HistoryStore>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<TelemetryEvent>(capacity.max(1));

        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(e) = store.insert(&event).await {
                    warn!(topic = %event.topic, error = %e, "Failed to store telemetry event");
                }
            }
            debug!("History writer stopped");
        });

        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            handle,
        )
    }

    /// Events dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl EventSink for HistoryWriter {
    fn submit(&self, event: TelemetryEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(topic = %event.topic, dropped, "History queue full, event dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("History writer closed, event dropped");
            }
        }
    }
}
