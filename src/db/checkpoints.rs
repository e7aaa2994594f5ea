//! Append-only processing checkpoints.
//!
//! Checkpoint state is stored as a versioned JSON envelope so the layout can
//! evolve without corrupting resumes from older rows. Rows are never updated
//! in place; the latest frame number wins and older rows are pruned lazily.

use anyhow::{bail, Result};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

use super::Database;
use crate::pipeline::scenes::Scene;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointType {
    SceneDetection,
    FeatureExtraction,
}

impl CheckpointType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointType::SceneDetection => "scene_detection",
            CheckpointType::FeatureExtraction => "feature_extraction",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "scene_detection" => Some(CheckpointType::SceneDetection),
            "feature_extraction" => Some(CheckpointType::FeatureExtraction),
            _ => None,
        }
    }
}

/// Envelope version understood by this build.
const STATE_VERSION: u32 = 1;

/// Scene detection resume state: the last sampled frame plus the scene list
/// accumulated so far. The comparison baseline is not stored; it is re-read
/// from the source at `last_frame - sample_interval` when resuming.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SceneDetectionState {
    pub version: u32,
    pub last_frame: u64,
    pub sample_interval: u64,
    pub frames_total: u64,
    /// Start of the still-open scene run.
    pub current_start: u64,
    /// Scenes closed by a boundary so far.
    pub scenes: Vec<Scene>,
}

impl SceneDetectionState {
    pub fn new(last_frame: u64, sample_interval: u64, frames_total: u64) -> Self {
        Self {
            version: STATE_VERSION,
            last_frame,
            sample_interval,
            frames_total,
            current_start: 0,
            scenes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CheckpointRow {
    pub id: i64,
    pub media_file_id: i64,
    pub checkpoint_type: CheckpointType,
    pub frame_number: u64,
    pub state: Vec<u8>,
}

impl Database {
    pub fn save_checkpoint(
        &self,
        file_id: i64,
        checkpoint_type: CheckpointType,
        frame_number: u64,
        state: &[u8],
    ) -> Result<i64> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO checkpoints (media_file_id, checkpoint_type, frame_number, state)
             VALUES (?, ?, ?, ?)",
            params![file_id, checkpoint_type.as_str(), frame_number as i64, state],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Latest checkpoint for a (file, type) pair, by frame number.
    pub fn load_latest_checkpoint(
        &self,
        file_id: i64,
        checkpoint_type: CheckpointType,
    ) -> Result<Option<CheckpointRow>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT id, media_file_id, checkpoint_type, frame_number, state
                 FROM checkpoints
                 WHERE media_file_id = ? AND checkpoint_type = ?
                 ORDER BY frame_number DESC, id DESC
                 LIMIT 1",
                params![file_id, checkpoint_type.as_str()],
                |row| {
                    let type_str: String = row.get(2)?;
                    Ok(CheckpointRow {
                        id: row.get(0)?,
                        media_file_id: row.get(1)?,
                        checkpoint_type: CheckpointType::from_str(&type_str)
                            .unwrap_or(CheckpointType::SceneDetection),
                        frame_number: row.get::<_, i64>(3)? as u64,
                        state: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn save_scene_checkpoint(
        &self,
        file_id: i64,
        state: &SceneDetectionState,
    ) -> Result<i64> {
        let blob = serde_json::to_vec(state)?;
        self.save_checkpoint(
            file_id,
            CheckpointType::SceneDetection,
            state.last_frame,
            &blob,
        )
    }

    pub fn load_scene_checkpoint(&self, file_id: i64) -> Result<Option<SceneDetectionState>> {
        let Some(row) = self.load_latest_checkpoint(file_id, CheckpointType::SceneDetection)?
        else {
            return Ok(None);
        };
        let state: SceneDetectionState = serde_json::from_slice(&row.state)?;
        if state.version != STATE_VERSION {
            bail!(
                "unsupported checkpoint version {} for file {}",
                state.version,
                file_id
            );
        }
        Ok(Some(state))
    }

    /// Remove all but the authoritative checkpoint per (file, type) pair,
    /// the same row `load_latest_checkpoint` would return.
    pub fn prune_checkpoints(&self) -> Result<usize> {
        let count = self.lock().execute(
            "DELETE FROM checkpoints
             WHERE id NOT IN (
                 SELECT c.id FROM checkpoints c
                 WHERE c.media_file_id = checkpoints.media_file_id
                   AND c.checkpoint_type = checkpoints.checkpoint_type
                 ORDER BY c.frame_number DESC, c.id DESC
                 LIMIT 1
             )",
            [],
        )?;
        Ok(count)
    }

    pub fn delete_checkpoints(&self, file_id: i64) -> Result<usize> {
        let count = self
            .lock()
            .execute("DELETE FROM checkpoints WHERE media_file_id = ?", [file_id])?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_db;

    #[test]
    fn test_latest_checkpoint_wins() {
        let db = test_db();
        let file = db.register_file("/m/a.mp4", "a.mp4").unwrap();
        db.save_scene_checkpoint(file, &SceneDetectionState::new(100, 5, 9000))
            .unwrap();
        db.save_scene_checkpoint(file, &SceneDetectionState::new(450, 5, 9000))
            .unwrap();

        let state = db.load_scene_checkpoint(file).unwrap().unwrap();
        assert_eq!(state.last_frame, 450);
    }

    #[test]
    fn test_prune_keeps_newest_per_pair() {
        let db = test_db();
        let a = db.register_file("/m/a.mp4", "a.mp4").unwrap();
        let b = db.register_file("/m/b.mp4", "b.mp4").unwrap();
        for frame in [100, 200, 300] {
            db.save_scene_checkpoint(a, &SceneDetectionState::new(frame, 5, 9000))
                .unwrap();
        }
        db.save_scene_checkpoint(b, &SceneDetectionState::new(50, 5, 600))
            .unwrap();

        assert_eq!(db.prune_checkpoints().unwrap(), 2);
        assert_eq!(
            db.load_scene_checkpoint(a).unwrap().unwrap().last_frame,
            300
        );
        assert_eq!(db.load_scene_checkpoint(b).unwrap().unwrap().last_frame, 50);
    }

    #[test]
    fn test_prune_keeps_highest_frame_not_newest_row() {
        let db = test_db();
        let file = db.register_file("/m/a.mp4", "a.mp4").unwrap();
        // A later row can carry a lower frame number; the highest frame
        // number stays authoritative.
        db.save_scene_checkpoint(file, &SceneDetectionState::new(300, 5, 9000))
            .unwrap();
        db.save_scene_checkpoint(file, &SceneDetectionState::new(200, 5, 9000))
            .unwrap();

        assert_eq!(db.prune_checkpoints().unwrap(), 1);
        assert_eq!(
            db.load_scene_checkpoint(file).unwrap().unwrap().last_frame,
            300
        );
    }

    #[test]
    fn test_unknown_version_is_rejected() {
        let db = test_db();
        let file = db.register_file("/m/a.mp4", "a.mp4").unwrap();
        let blob = serde_json::to_vec(&serde_json::json!({
            "version": 99,
            "last_frame": 10,
            "sample_interval": 5,
            "frames_total": 100,
            "current_start": 0,
            "scenes": [],
        }))
        .unwrap();
        db.save_checkpoint(file, CheckpointType::SceneDetection, 10, &blob)
            .unwrap();
        assert!(db.load_scene_checkpoint(file).is_err());
    }
}
