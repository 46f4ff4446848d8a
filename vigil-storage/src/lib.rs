//! SQLite storage layer for Vigil realtime.
//!
//! Holds the state that must survive a reload and be visible to every tab of
//! an origin:
//!
//! - The processed-event log (`event_id -> processed_at`) used for durable
//!   deduplication
//! - Per-(subject, channel) cursors used as the gap-resync watermark
//! - The advisory leadership lease shared by all tabs
//!
//! All APIs are blocking. Async callers run them on `spawn_blocking`.

mod error;
mod lease_store;
mod processed_log;

pub use error::{StorageError, StorageResult};
pub use lease_store::{LeaseRecord, LeaseStore};
pub use processed_log::{Cursor, ProcessedEntry, ProcessedEventRecord, ProcessedLog};

use std::time::Duration;

/// How long a writer waits on another process holding the database lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Open a SQLite connection tuned for several tabs sharing one file.
///
/// WAL mode lets readers in other processes proceed while the leader writes;
/// the busy timeout turns short lock contention into a wait instead of an
/// immediate `SQLITE_BUSY`.
pub fn open_shared_sqlite(path: &std::path::Path) -> StorageResult<rusqlite::Connection> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let conn = rusqlite::Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    let _mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    Ok(conn)
}
