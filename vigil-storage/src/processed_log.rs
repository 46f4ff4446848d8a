//! Durable processed-event log and per-(subject, channel) cursors.

use crate::error::{StorageError, StorageResult};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// One event ever durably applied. Never mutated once written.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedEventRecord {
    pub event_id: String,
    pub processed_at: DateTime<Utc>,
}

/// Gap-resync watermark for one (subject, channel) pair.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub subject_id: String,
    pub channel: String,
    pub last_processed_server_timestamp: i64,
}

/// Input to [`ProcessedLog::record`].
#[derive(Clone, Debug)]
pub struct ProcessedEntry<'a> {
    pub event_id: &'a str,
    pub subject_id: &'a str,
    pub channel: &'a str,
    pub server_timestamp: i64,
    pub processed_at: DateTime<Utc>,
}

/// Per-origin durable store of processed events and cursors.
///
/// Written only by the leader tab; readable by every tab.
#[derive(Clone)]
pub struct ProcessedLog {
    conn: Arc<Mutex<Connection>>,
}

impl ProcessedLog {
    /// Opens or creates the log at the given path.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let conn = crate::open_shared_sqlite(path)?;
        initialize_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Opens an in-memory log (for testing).
    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        initialize_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> StorageResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StorageError::LockPoisoned)
    }

    /// Records an event as processed and advances its cursor, atomically.
    ///
    /// Returns `false` when the event id was already present; in that case the
    /// cursor is left untouched because the first writer already advanced it.
    pub fn record(&self, entry: &ProcessedEntry<'_>) -> StorageResult<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let inserted = tx.execute(
            "INSERT OR IGNORE INTO processed_events (event_id, processed_at) VALUES (?1, ?2)",
            params![entry.event_id, entry.processed_at.timestamp_millis()],
        )?;

        if inserted == 0 {
            debug!("event {} already in processed log", entry.event_id);
            tx.commit()?;
            return Ok(false);
        }

        upsert_cursor(
            &tx,
            entry.subject_id,
            entry.channel,
            entry.server_timestamp,
            entry.processed_at.timestamp_millis(),
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Returns true if the event id has been durably processed.
    pub fn is_processed(&self, event_id: &str) -> StorageResult<bool> {
        let conn = self.lock()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM processed_events WHERE event_id = ?1",
                params![event_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Gets the processed record for an event id.
    pub fn get(&self, event_id: &str) -> StorageResult<Option<ProcessedEventRecord>> {
        let conn = self.lock()?;
        let row: Option<(String, i64)> = conn
            .query_row(
                "SELECT event_id, processed_at FROM processed_events WHERE event_id = ?1",
                params![event_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        row.map(|(event_id, millis)| {
            let processed_at = DateTime::from_timestamp_millis(millis).ok_or_else(|| {
                StorageError::InvalidData(format!("processed_at out of range: {millis}"))
            })?;
            Ok(ProcessedEventRecord {
                event_id,
                processed_at,
            })
        })
        .transpose()
    }

    /// Number of events ever recorded.
    pub fn processed_count(&self) -> StorageResult<u64> {
        let conn = self.lock()?;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM processed_events", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Last processed server timestamp for a (subject, channel) pair.
    pub fn cursor(&self, subject_id: &str, channel: &str) -> StorageResult<Option<i64>> {
        let conn = self.lock()?;
        let ts = conn
            .query_row(
                "SELECT last_processed_server_timestamp FROM cursors \
                 WHERE subject_id = ?1 AND channel = ?2",
                params![subject_id, channel],
                |row| row.get(0),
            )
            .optional()?;
        Ok(ts)
    }

    /// All cursors for a subject, ordered by channel name.
    pub fn cursors_for(&self, subject_id: &str) -> StorageResult<Vec<Cursor>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT subject_id, channel, last_processed_server_timestamp FROM cursors \
             WHERE subject_id = ?1 ORDER BY channel",
        )?;
        let cursors = stmt
            .query_map(params![subject_id], |row| {
                Ok(Cursor {
                    subject_id: row.get(0)?,
                    channel: row.get(1)?,
                    last_processed_server_timestamp: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(cursors)
    }

    /// Moves a cursor forward. A timestamp older than the stored one is ignored.
    pub fn advance_cursor(
        &self,
        subject_id: &str,
        channel: &str,
        server_timestamp: i64,
    ) -> StorageResult<()> {
        let conn = self.lock()?;
        upsert_cursor(
            &conn,
            subject_id,
            channel,
            server_timestamp,
            Utc::now().timestamp_millis(),
        )
    }
}

fn upsert_cursor(
    conn: &Connection,
    subject_id: &str,
    channel: &str,
    server_timestamp: i64,
    updated_at: i64,
) -> StorageResult<()> {
    conn.execute(
        r#"
        INSERT INTO cursors (subject_id, channel, last_processed_server_timestamp, updated_at)
        VALUES (?1, ?2, ?3, ?4)
        ON CONFLICT(subject_id, channel) DO UPDATE SET
            last_processed_server_timestamp =
                MAX(last_processed_server_timestamp, excluded.last_processed_server_timestamp),
            updated_at = excluded.updated_at
        "#,
        params![subject_id, channel, server_timestamp, updated_at],
    )?;
    Ok(())
}

fn initialize_schema(conn: &Connection) -> StorageResult<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS processed_events (
            event_id TEXT PRIMARY KEY,
            processed_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS cursors (
            subject_id TEXT NOT NULL,
            channel TEXT NOT NULL,
            last_processed_server_timestamp INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (subject_id, channel)
        );
        "#,
    )?;
    Ok(())
}
