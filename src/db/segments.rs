//! Video segment rows.

use anyhow::Result;
use rusqlite::{params, OptionalExtension, Row};

use super::files::ProcessingStatus;
use super::Database;
use crate::error::truncate_error;

/// A detected scene stored as a frame range within one file.
#[derive(Debug, Clone)]
pub struct SegmentRow {
    pub id: i64,
    pub media_file_id: i64,
    pub start_frame: u64,
    pub end_frame: u64,
    pub duration: f64,
    pub scene_score: Option<f64>,
    pub status: ProcessingStatus,
    pub features_extracted: bool,
    pub last_error: Option<String>,
    pub error_count: i64,
}

impl SegmentRow {
    pub fn frame_count(&self) -> u64 {
        self.end_frame.saturating_sub(self.start_frame)
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let status_str: String = row.get(6)?;
        Ok(SegmentRow {
            id: row.get(0)?,
            media_file_id: row.get(1)?,
            start_frame: row.get::<_, i64>(2)? as u64,
            end_frame: row.get::<_, i64>(3)? as u64,
            duration: row.get(4)?,
            scene_score: row.get(5)?,
            status: ProcessingStatus::from_str(&status_str)
                .unwrap_or(ProcessingStatus::Pending),
            features_extracted: row.get(7)?,
            last_error: row.get(8)?,
            error_count: row.get(9)?,
        })
    }
}

const SEGMENT_COLUMNS: &str = "id, media_file_id, start_frame, end_frame, duration, scene_score, \
     processing_status, features_extracted, last_error, error_count";

impl Database {
    /// Insert a segment, returning its id. Re-inserting the same frame range
    /// for a file returns the existing row unchanged, so a resumed scene pass
    /// never duplicates work already persisted.
    pub fn insert_segment(
        &self,
        file_id: i64,
        start_frame: u64,
        end_frame: u64,
        duration: f64,
        scene_score: Option<f64>,
    ) -> Result<i64> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO video_segments
                 (media_file_id, start_frame, end_frame, duration, scene_score)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(media_file_id, start_frame, end_frame) DO NOTHING",
            params![
                file_id,
                start_frame as i64,
                end_frame as i64,
                duration,
                scene_score
            ],
        )?;
        let id: i64 = conn.query_row(
            "SELECT id FROM video_segments
             WHERE media_file_id = ? AND start_frame = ? AND end_frame = ?",
            params![file_id, start_frame as i64, end_frame as i64],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn get_segment(&self, segment_id: i64) -> Result<Option<SegmentRow>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM video_segments WHERE id = ?",
                    SEGMENT_COLUMNS
                ),
                [segment_id],
                SegmentRow::from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn segments_for_file(&self, file_id: i64) -> Result<Vec<SegmentRow>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM video_segments WHERE media_file_id = ? ORDER BY start_frame",
            SEGMENT_COLUMNS
        ))?;
        let rows = stmt
            .query_map([file_id], SegmentRow::from_row)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Segments of a file that still need feature extraction.
    pub fn segments_pending_features(&self, file_id: i64) -> Result<Vec<SegmentRow>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM video_segments
             WHERE media_file_id = ? AND features_extracted = 0
               AND processing_status != 'failed'
             ORDER BY start_frame",
            SEGMENT_COLUMNS
        ))?;
        let rows = stmt
            .query_map([file_id], SegmentRow::from_row)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    pub fn mark_segment_completed(&self, segment_id: i64) -> Result<()> {
        self.lock().execute(
            "UPDATE video_segments
             SET processing_status = 'completed', features_extracted = 1,
                 updated_at = CURRENT_TIMESTAMP
             WHERE id = ?",
            [segment_id],
        )?;
        Ok(())
    }

    pub fn mark_segment_failed(&self, segment_id: i64, error: &str) -> Result<()> {
        self.lock().execute(
            "UPDATE video_segments
             SET processing_status = 'failed',
                 last_error = ?,
                 error_count = error_count + 1,
                 updated_at = CURRENT_TIMESTAMP
             WHERE id = ?",
            params![truncate_error(error), segment_id],
        )?;
        Ok(())
    }

    pub fn count_segments_for_file(&self, file_id: i64) -> Result<i64> {
        let count = self.lock().query_row(
            "SELECT COUNT(*) FROM video_segments WHERE media_file_id = ?",
            [file_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn count_failed_segments_for_file(&self, file_id: i64) -> Result<i64> {
        let count = self.lock().query_row(
            "SELECT COUNT(*) FROM video_segments
             WHERE media_file_id = ? AND processing_status = 'failed'",
            [file_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Ids of all segments in a terminal usable state, the candidate pool
    /// for retrieval.
    pub fn completed_segment_ids(&self) -> Result<Vec<i64>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id FROM video_segments WHERE processing_status = 'completed' ORDER BY id",
        )?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(ids)
    }

    pub fn count_segments(&self) -> Result<i64> {
        let count =
            self.lock()
                .query_row("SELECT COUNT(*) FROM video_segments", [], |row| row.get(0))?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_db;

    #[test]
    fn test_insert_segment_is_idempotent() {
        let db = test_db();
        let file = db.register_file("/m/a.mp4", "a.mp4").unwrap();
        let a = db.insert_segment(file, 0, 300, 10.0, Some(0.4)).unwrap();
        let b = db.insert_segment(file, 0, 300, 10.0, Some(0.4)).unwrap();
        assert_eq!(a, b);
        assert_eq!(db.count_segments_for_file(file).unwrap(), 1);
    }

    #[test]
    fn test_segments_pending_features_excludes_done_and_failed() {
        let db = test_db();
        let file = db.register_file("/m/a.mp4", "a.mp4").unwrap();
        let done = db.insert_segment(file, 0, 100, 4.0, None).unwrap();
        let bad = db.insert_segment(file, 100, 200, 4.0, None).unwrap();
        let todo = db.insert_segment(file, 200, 300, 4.0, None).unwrap();
        db.mark_segment_completed(done).unwrap();
        db.mark_segment_failed(bad, "no frames").unwrap();

        let pending = db.segments_pending_features(file).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, todo);
    }

    #[test]
    fn test_segment_failure_bookkeeping() {
        let db = test_db();
        let file = db.register_file("/m/a.mp4", "a.mp4").unwrap();
        let seg = db.insert_segment(file, 0, 100, 4.0, None).unwrap();
        db.mark_segment_failed(seg, "boom").unwrap();
        db.mark_segment_failed(seg, "boom again").unwrap();

        let row = db.get_segment(seg).unwrap().unwrap();
        assert_eq!(row.status, ProcessingStatus::Failed);
        assert_eq!(row.error_count, 2);
        assert_eq!(row.last_error.as_deref(), Some("boom again"));
        assert_eq!(db.count_failed_segments_for_file(file).unwrap(), 1);
    }
}
