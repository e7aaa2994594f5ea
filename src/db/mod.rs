mod schema;
pub mod checkpoints;
pub mod files;
pub mod maintenance;
pub mod segments;
pub mod tags;

pub mod features;

use anyhow::Result;
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

pub use checkpoints::{CheckpointRow, CheckpointType, SceneDetectionState};
pub use features::{
    FeatureBlob, FEATURE_CONCEPTS, FEATURE_EMBEDDING, FEATURE_HISTOGRAM, FEATURE_TYPE_VISUAL,
};
pub use files::{MediaFileRow, ProcessingStatus, StatusCounts};
pub use segments::SegmentRow;
pub use tags::{TagRow, TAG_TYPE_CONCEPT, TAG_TYPE_DOMINANT};

use schema::{MIGRATIONS, SCHEMA};

/// Handle to the SQLite store.
///
/// The connection lives behind a mutex so the worker thread and retrieval
/// queries can share one `Database` across threads. WAL mode keeps readers
/// from blocking behind the worker's writes.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn initialize(&self) -> Result<()> {
        let conn = self.lock();
        conn.execute_batch(SCHEMA)?;
        for migration in MIGRATIONS {
            let _ = conn.execute(migration, []);
        }
        Ok(())
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        // A poisoned lock means another thread panicked mid-statement; the
        // connection itself is still usable.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}
