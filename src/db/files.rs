//! Media file rows and pipeline status transitions.

use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::Database;
use crate::error::truncate_error;
use crate::source::VideoProperties;

/// Pipeline status of a file or segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Pending => "pending",
            ProcessingStatus::InProgress => "in_progress",
            ProcessingStatus::Completed => "completed",
            ProcessingStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ProcessingStatus::Pending),
            "in_progress" => Some(ProcessingStatus::InProgress),
            "completed" => Some(ProcessingStatus::Completed),
            "failed" => Some(ProcessingStatus::Failed),
            _ => None,
        }
    }
}

/// A media file record.
#[derive(Debug, Clone)]
pub struct MediaFileRow {
    pub id: i64,
    pub path: String,
    pub filename: String,
    pub duration: Option<f64>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub fps: Option<f64>,
    pub has_audio: bool,
    pub status: ProcessingStatus,
    pub scene_detection_complete: bool,
    pub features_extraction_complete: bool,
    pub scene_detection_progress: f64,
    pub feature_extraction_progress: f64,
    pub created_at: String,
    pub updated_at: String,
    pub processing_started_at: Option<String>,
    pub processing_completed_at: Option<String>,
    pub last_error: Option<String>,
    pub error_count: i64,
}

impl MediaFileRow {
    /// Weighted per-file progress: scene detection dominates wall-clock time.
    pub fn overall_progress(&self) -> f64 {
        0.6 * self.scene_detection_progress + 0.4 * self.feature_extraction_progress
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let status_str: String = row.get(8)?;
        Ok(MediaFileRow {
            id: row.get(0)?,
            path: row.get(1)?,
            filename: row.get(2)?,
            duration: row.get(3)?,
            width: row.get(4)?,
            height: row.get(5)?,
            fps: row.get(6)?,
            has_audio: row.get(7)?,
            status: ProcessingStatus::from_str(&status_str)
                .unwrap_or(ProcessingStatus::Pending),
            scene_detection_complete: row.get(9)?,
            features_extraction_complete: row.get(10)?,
            scene_detection_progress: row.get(11)?,
            feature_extraction_progress: row.get(12)?,
            created_at: row.get(13)?,
            updated_at: row.get(14)?,
            processing_started_at: row.get(15)?,
            processing_completed_at: row.get(16)?,
            last_error: row.get(17)?,
            error_count: row.get(18)?,
        })
    }
}

const FILE_COLUMNS: &str = "id, path, filename, duration, width, height, fps, has_audio, \
     processing_status, scene_detection_complete, features_extraction_complete, \
     scene_detection_progress, feature_extraction_progress, \
     created_at, updated_at, processing_started_at, processing_completed_at, \
     last_error, error_count";

/// File counts per status for the status summary.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatusCounts {
    pub total: i64,
    pub pending: i64,
    pub in_progress: i64,
    pub completed: i64,
    pub failed: i64,
}

impl Database {
    /// Register a file, returning its id. Re-registering an existing path is
    /// a no-op apart from refreshing the filename.
    pub fn register_file(&self, path: &str, filename: &str) -> Result<i64> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO media_files (path, filename) VALUES (?, ?)
             ON CONFLICT(path) DO UPDATE SET filename = excluded.filename",
            params![path, filename],
        )?;
        let id: i64 = conn.query_row(
            "SELECT id FROM media_files WHERE path = ?",
            [path],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    /// Store stream metadata once the source has been opened.
    pub fn set_file_properties(&self, file_id: i64, props: &VideoProperties) -> Result<()> {
        let duration = if props.fps > 0.0 {
            props.frame_count as f64 / props.fps
        } else {
            0.0
        };
        self.lock().execute(
            "UPDATE media_files
             SET duration = ?, width = ?, height = ?, fps = ?, has_audio = ?,
                 updated_at = CURRENT_TIMESTAMP
             WHERE id = ?",
            params![
                duration,
                props.width as i64,
                props.height as i64,
                props.fps,
                props.has_audio,
                file_id
            ],
        )?;
        Ok(())
    }

    pub fn get_file(&self, file_id: i64) -> Result<Option<MediaFileRow>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                &format!("SELECT {} FROM media_files WHERE id = ?", FILE_COLUMNS),
                [file_id],
                MediaFileRow::from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn get_file_by_path(&self, path: &str) -> Result<Option<MediaFileRow>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                &format!("SELECT {} FROM media_files WHERE path = ?", FILE_COLUMNS),
                [path],
                MediaFileRow::from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Take the processing lease on a file.
    ///
    /// Transactionally reads the current status and only flips it to
    /// `in_progress` when the file is pending. Returns false when the claim
    /// is lost (already in progress) or the file is terminal; failed files
    /// go back through `retry_failed_files` first.
    pub fn claim_file(&self, file_id: i64) -> Result<bool> {
        let mut guard = self.lock();
        let tx = guard.transaction()?;
        let status: Option<String> = tx
            .query_row(
                "SELECT processing_status FROM media_files WHERE id = ?",
                [file_id],
                |row| row.get(0),
            )
            .optional()?;

        let claimable = matches!(
            status.as_deref().and_then(ProcessingStatus::from_str),
            Some(ProcessingStatus::Pending)
        );
        if !claimable {
            tx.rollback()?;
            return Ok(false);
        }

        tx.execute(
            "UPDATE media_files
             SET processing_status = 'in_progress',
                 processing_started_at = CURRENT_TIMESTAMP,
                 updated_at = CURRENT_TIMESTAMP
             WHERE id = ?",
            [file_id],
        )?;
        tx.commit()?;
        Ok(true)
    }

    pub fn set_scene_progress(&self, file_id: i64, percent: f64) -> Result<()> {
        self.lock().execute(
            "UPDATE media_files
             SET scene_detection_progress = ?, updated_at = CURRENT_TIMESTAMP
             WHERE id = ?",
            params![percent.clamp(0.0, 100.0), file_id],
        )?;
        Ok(())
    }

    pub fn set_feature_progress(&self, file_id: i64, percent: f64) -> Result<()> {
        self.lock().execute(
            "UPDATE media_files
             SET feature_extraction_progress = ?, updated_at = CURRENT_TIMESTAMP
             WHERE id = ?",
            params![percent.clamp(0.0, 100.0), file_id],
        )?;
        Ok(())
    }

    pub fn mark_scene_detection_complete(&self, file_id: i64) -> Result<()> {
        self.lock().execute(
            "UPDATE media_files
             SET scene_detection_complete = 1, scene_detection_progress = 100,
                 updated_at = CURRENT_TIMESTAMP
             WHERE id = ?",
            [file_id],
        )?;
        Ok(())
    }

    /// Mark the feature stage done and the file completed.
    ///
    /// Only legal once scene detection is complete; the update itself guards
    /// the invariant so a buggy caller cannot produce a completed file with
    /// `scene_detection_complete = 0`.
    pub fn mark_file_completed(&self, file_id: i64) -> Result<()> {
        let updated = self.lock().execute(
            "UPDATE media_files
             SET features_extraction_complete = 1, feature_extraction_progress = 100,
                 processing_status = 'completed',
                 processing_completed_at = CURRENT_TIMESTAMP,
                 updated_at = CURRENT_TIMESTAMP
             WHERE id = ? AND scene_detection_complete = 1",
            [file_id],
        )?;
        if updated == 0 {
            anyhow::bail!(
                "cannot complete file {}: scene detection not finished",
                file_id
            );
        }
        Ok(())
    }

    pub fn mark_file_failed(&self, file_id: i64, error: &str) -> Result<()> {
        self.lock().execute(
            "UPDATE media_files
             SET processing_status = 'failed',
                 last_error = ?,
                 error_count = error_count + 1,
                 updated_at = CURRENT_TIMESTAMP
             WHERE id = ?",
            params![truncate_error(error), file_id],
        )?;
        Ok(())
    }

    /// Reset every failed file to pending and clear its error message.
    /// Error counts are preserved. Returns the ids that were reset.
    pub fn retry_failed_files(&self) -> Result<Vec<i64>> {
        let mut guard = self.lock();
        let tx = guard.transaction()?;
        let ids: Vec<i64> = {
            let mut stmt = tx.prepare(
                "SELECT id FROM media_files WHERE processing_status = 'failed'",
            )?;
            let ids = stmt
                .query_map([], |row| row.get(0))?
                .filter_map(|r| r.ok())
                .collect();
            ids
        };
        // Segments of completed files keep their failure records; only the
        // files being requeued get their segments reset.
        tx.execute(
            "UPDATE video_segments
             SET processing_status = 'pending', last_error = NULL,
                 updated_at = CURRENT_TIMESTAMP
             WHERE processing_status = 'failed'
               AND media_file_id IN
                   (SELECT id FROM media_files WHERE processing_status = 'failed')",
            [],
        )?;
        tx.execute(
            "UPDATE media_files
             SET processing_status = 'pending', last_error = NULL,
                 updated_at = CURRENT_TIMESTAMP
             WHERE processing_status = 'failed'",
            [],
        )?;
        tx.commit()?;
        Ok(ids)
    }

    /// Reset one file (and its segments) to a clean pending state.
    pub fn reset_file(&self, file_id: i64) -> Result<()> {
        let mut guard = self.lock();
        let tx = guard.transaction()?;
        tx.execute(
            "UPDATE media_files
             SET processing_status = 'pending',
                 scene_detection_complete = 0, features_extraction_complete = 0,
                 scene_detection_progress = 0, feature_extraction_progress = 0,
                 last_error = NULL, error_count = 0,
                 updated_at = CURRENT_TIMESTAMP
             WHERE id = ?",
            [file_id],
        )?;
        tx.execute(
            "UPDATE video_segments
             SET processing_status = 'pending', features_extracted = 0,
                 last_error = NULL, error_count = 0,
                 updated_at = CURRENT_TIMESTAMP
             WHERE media_file_id = ?",
            [file_id],
        )?;
        tx.execute(
            "DELETE FROM checkpoints WHERE media_file_id = ?",
            [file_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Reset every file and segment, and drop all checkpoints.
    pub fn reset_all_files(&self) -> Result<(usize, usize)> {
        let mut guard = self.lock();
        let tx = guard.transaction()?;
        let files = tx.execute(
            "UPDATE media_files
             SET processing_status = 'pending',
                 scene_detection_complete = 0, features_extraction_complete = 0,
                 scene_detection_progress = 0, feature_extraction_progress = 0,
                 last_error = NULL, error_count = 0,
                 updated_at = CURRENT_TIMESTAMP",
            [],
        )?;
        let segments = tx.execute(
            "UPDATE video_segments
             SET processing_status = 'pending', features_extracted = 0,
                 last_error = NULL, error_count = 0,
                 updated_at = CURRENT_TIMESTAMP",
            [],
        )?;
        tx.execute("DELETE FROM checkpoints", [])?;
        tx.commit()?;
        Ok((files, segments))
    }

    /// Requeue files stuck in `in_progress` without a live owner.
    ///
    /// Run at coordinator startup, before any worker exists, so every
    /// in-progress row is necessarily a leftover from a previous process.
    /// Checkpoints are untouched; the stage resumes where it stopped.
    pub fn requeue_stale_in_progress(&self) -> Result<usize> {
        let count = self.lock().execute(
            "UPDATE media_files
             SET processing_status = 'pending', updated_at = CURRENT_TIMESTAMP
             WHERE processing_status = 'in_progress'",
            [],
        )?;
        Ok(count)
    }

    pub fn pending_files(&self) -> Result<Vec<MediaFileRow>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM media_files WHERE processing_status = 'pending' ORDER BY id",
            FILE_COLUMNS
        ))?;
        let rows = stmt
            .query_map([], MediaFileRow::from_row)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    pub fn list_files(
        &self,
        status: Option<ProcessingStatus>,
        limit: usize,
    ) -> Result<Vec<MediaFileRow>> {
        let conn = self.lock();
        let rows = match status {
            Some(status) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM media_files WHERE processing_status = ?
                     ORDER BY updated_at DESC LIMIT ?",
                    FILE_COLUMNS
                ))?;
                let rows: Vec<MediaFileRow> = stmt
                    .query_map(params![status.as_str(), limit as i64], MediaFileRow::from_row)?
                    .filter_map(|r| r.ok())
                    .collect();
                rows
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM media_files ORDER BY updated_at DESC LIMIT ?",
                    FILE_COLUMNS
                ))?;
                let rows: Vec<MediaFileRow> = stmt
                    .query_map([limit as i64], MediaFileRow::from_row)?
                    .filter_map(|r| r.ok())
                    .collect();
                rows
            }
        };
        Ok(rows)
    }

    pub fn count_files_by_status(&self) -> Result<StatusCounts> {
        let conn = self.lock();
        let mut counts = StatusCounts::default();
        let mut stmt = conn.prepare(
            "SELECT processing_status, COUNT(*) FROM media_files GROUP BY processing_status",
        )?;
        let rows: Vec<(String, i64)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .filter_map(|r| r.ok())
            .collect();
        for (status, count) in rows {
            counts.total += count;
            match ProcessingStatus::from_str(&status) {
                Some(ProcessingStatus::Pending) => counts.pending = count,
                Some(ProcessingStatus::InProgress) => counts.in_progress = count,
                Some(ProcessingStatus::Completed) => counts.completed = count,
                Some(ProcessingStatus::Failed) => counts.failed = count,
                None => {}
            }
        }
        Ok(counts)
    }

    pub(crate) fn file_paths(conn: &Connection) -> rusqlite::Result<Vec<(i64, String)>> {
        let mut stmt = conn.prepare("SELECT id, path FROM media_files")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_db;

    #[test]
    fn test_register_is_idempotent() {
        let db = test_db();
        let a = db.register_file("/m/a.mp4", "a.mp4").unwrap();
        let b = db.register_file("/m/a.mp4", "a.mp4").unwrap();
        assert_eq!(a, b);
        assert_eq!(db.count_files_by_status().unwrap().total, 1);
    }

    #[test]
    fn test_claim_is_exclusive() {
        let db = test_db();
        let id = db.register_file("/m/a.mp4", "a.mp4").unwrap();
        assert!(db.claim_file(id).unwrap());
        // Second claim fails while the lease is held.
        assert!(!db.claim_file(id).unwrap());
    }

    #[test]
    fn test_completed_requires_scene_detection() {
        let db = test_db();
        let id = db.register_file("/m/a.mp4", "a.mp4").unwrap();
        db.claim_file(id).unwrap();
        assert!(db.mark_file_completed(id).is_err());

        db.mark_scene_detection_complete(id).unwrap();
        db.mark_file_completed(id).unwrap();

        let row = db.get_file(id).unwrap().unwrap();
        assert_eq!(row.status, ProcessingStatus::Completed);
        assert!(row.scene_detection_complete);
        assert!(row.features_extraction_complete);
    }

    #[test]
    fn test_retry_failed_resets_status_and_error_only() {
        let db = test_db();
        let mut ids = Vec::new();
        for i in 0..3 {
            let id = db
                .register_file(&format!("/m/{i}.mp4"), &format!("{i}.mp4"))
                .unwrap();
            db.claim_file(id).unwrap();
            db.mark_file_failed(id, "decode error").unwrap();
            ids.push(id);
        }

        let reset = db.retry_failed_files().unwrap();
        assert_eq!(reset.len(), 3);

        for id in ids {
            let row = db.get_file(id).unwrap().unwrap();
            assert_eq!(row.status, ProcessingStatus::Pending);
            assert!(row.last_error.is_none());
            assert_eq!(row.error_count, 1); // counts preserved
        }
    }

    #[test]
    fn test_retry_failed_leaves_completed_files_segments_alone() {
        let db = test_db();
        let done = db.register_file("/m/done.mp4", "done.mp4").unwrap();
        db.claim_file(done).unwrap();
        let seg = db.insert_segment(done, 0, 300, 10.0, Some(0.4)).unwrap();
        db.mark_segment_failed(seg, "embed error").unwrap();
        db.mark_scene_detection_complete(done).unwrap();
        db.mark_file_completed(done).unwrap();

        let failed = db.register_file("/m/bad.mp4", "bad.mp4").unwrap();
        db.claim_file(failed).unwrap();
        db.mark_file_failed(failed, "decode error").unwrap();

        assert_eq!(db.retry_failed_files().unwrap(), vec![failed]);

        // The completed file's failed segment keeps its error record.
        let row = db.get_segment(seg).unwrap().unwrap();
        assert_eq!(row.status, ProcessingStatus::Failed);
        assert_eq!(row.last_error.as_deref(), Some("embed error"));
    }

    #[test]
    fn test_failed_file_is_not_claimable() {
        let db = test_db();
        let id = db.register_file("/m/a.mp4", "a.mp4").unwrap();
        db.claim_file(id).unwrap();
        db.mark_file_failed(id, "decode error").unwrap();
        // Failed files re-enter the queue via retry, never a direct claim.
        assert!(!db.claim_file(id).unwrap());
        db.retry_failed_files().unwrap();
        assert!(db.claim_file(id).unwrap());
    }

    #[test]
    fn test_failed_error_is_truncated() {
        let db = test_db();
        let id = db.register_file("/m/a.mp4", "a.mp4").unwrap();
        db.claim_file(id).unwrap();
        db.mark_file_failed(id, &"e".repeat(5000)).unwrap();
        let row = db.get_file(id).unwrap().unwrap();
        assert_eq!(row.last_error.unwrap().len(), 500);
        assert_eq!(row.error_count, 1);
    }

    #[test]
    fn test_requeue_stale_in_progress() {
        let db = test_db();
        let id = db.register_file("/m/a.mp4", "a.mp4").unwrap();
        db.claim_file(id).unwrap();
        assert_eq!(db.requeue_stale_in_progress().unwrap(), 1);
        let row = db.get_file(id).unwrap().unwrap();
        assert_eq!(row.status, ProcessingStatus::Pending);
    }

    #[test]
    fn test_overall_progress_weighting() {
        let db = test_db();
        let id = db.register_file("/m/a.mp4", "a.mp4").unwrap();
        db.set_scene_progress(id, 100.0).unwrap();
        db.set_feature_progress(id, 50.0).unwrap();
        let row = db.get_file(id).unwrap().unwrap();
        assert!((row.overall_progress() - 80.0).abs() < 1e-9);
    }
}
