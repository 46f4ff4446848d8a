//! Shared leadership lease record.
//!
//! The lease is advisory: tabs read it to notice a missing or expired leader,
//! but conflicts are settled by comparing claims, not by who wrote last.

use crate::error::{StorageError, StorageResult};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// The single per-origin leadership lease.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub leader_id: String,
    pub priority: u8,
    /// Creation time of the leader tab, in ms since the Unix epoch.
    pub created_at: i64,
    /// Lease expiry, in ms since the Unix epoch.
    pub expires_at: i64,
    /// Bumped on every write. Zero for a record not yet written.
    pub version: u64,
}

impl LeaseRecord {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at <= now_ms
    }

    pub fn is_held_by(&self, tab_id: &str) -> bool {
        self.leader_id == tab_id
    }
}

/// Durable home of the [`LeaseRecord`].
#[derive(Clone)]
pub struct LeaseStore {
    conn: Arc<Mutex<Connection>>,
}

impl LeaseStore {
    /// Opens or creates the lease store at the given path.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let conn = crate::open_shared_sqlite(path)?;
        initialize_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Opens an in-memory lease store (for testing).
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

    /// Reads the current lease, if any tab has written one.
    pub fn read(&self) -> StorageResult<Option<LeaseRecord>> {
        let conn = self.lock()?;
        let lease = conn
            .query_row(
                "SELECT leader_id, priority, created_at, expires_at, version \
                 FROM leadership_lease WHERE id = 1",
                [],
                |row| {
                    let priority: i64 = row.get(1)?;
                    let version: i64 = row.get(4)?;
                    Ok(LeaseRecord {
                        leader_id: row.get(0)?,
                        priority: priority.clamp(0, u8::MAX as i64) as u8,
                        created_at: row.get(2)?,
                        expires_at: row.get(3)?,
                        version: version.max(0) as u64,
                    })
                },
            )
            .optional()?;
        Ok(lease)
    }

    /// Writes the lease and returns the new version.
    ///
    /// The stored version is always the previous one plus one, regardless of
    /// the `version` carried by `lease`.
    pub fn write(&self, lease: &LeaseRecord) -> StorageResult<u64> {
        let conn = self.lock()?;
        let version: i64 = conn.query_row(
            r#"
            INSERT INTO leadership_lease (id, leader_id, priority, created_at, expires_at, version)
            VALUES (1, ?1, ?2, ?3, ?4, 1)
            ON CONFLICT(id) DO UPDATE SET
                leader_id = excluded.leader_id,
                priority = excluded.priority,
                created_at = excluded.created_at,
                expires_at = excluded.expires_at,
                version = leadership_lease.version + 1
            RETURNING version
            "#,
            params![
                lease.leader_id,
                lease.priority as i64,
                lease.created_at,
                lease.expires_at
            ],
            |row| row.get(0),
        )?;
        Ok(version as u64)
    }

    /// Removes the lease only if `leader_id` still holds it.
    pub fn clear_if_held_by(&self, leader_id: &str) -> StorageResult<bool> {
        let conn = self.lock()?;
        let removed = conn.execute(
            "DELETE FROM leadership_lease WHERE id = 1 AND leader_id = ?1",
            params![leader_id],
        )?;
        Ok(removed > 0)
    }
}

fn initialize_schema(conn: &Connection) -> StorageResult<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS leadership_lease (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            leader_id TEXT NOT NULL,
            priority INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            expires_at INTEGER NOT NULL,
            version INTEGER NOT NULL
        );
        "#,
    )?;
    Ok(())
}
