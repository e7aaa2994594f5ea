//! Semantic tags derived from concept scores.

use anyhow::Result;
use rusqlite::{params, Row};

use super::Database;

pub const TAG_TYPE_CONCEPT: &str = "concept";
pub const TAG_TYPE_DOMINANT: &str = "dominant_concept";

#[derive(Debug, Clone)]
pub struct TagRow {
    pub id: i64,
    pub segment_id: i64,
    pub tag_type: String,
    pub tag_value: String,
    pub confidence: f64,
}

impl TagRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(TagRow {
            id: row.get(0)?,
            segment_id: row.get(1)?,
            tag_type: row.get(2)?,
            tag_value: row.get(3)?,
            confidence: row.get(4)?,
        })
    }
}

const TAG_COLUMNS: &str = "id, segment_id, tag_type, tag_value, confidence";

impl Database {
    pub fn insert_tag(
        &self,
        segment_id: i64,
        tag_type: &str,
        tag_value: &str,
        confidence: f64,
    ) -> Result<i64> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO tags (segment_id, tag_type, tag_value, confidence)
             VALUES (?, ?, ?, ?)",
            params![segment_id, tag_type, tag_value, confidence.clamp(0.0, 1.0)],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn tags_for_segment(&self, segment_id: i64) -> Result<Vec<TagRow>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM tags WHERE segment_id = ? ORDER BY confidence DESC",
            TAG_COLUMNS
        ))?;
        let rows = stmt
            .query_map([segment_id], TagRow::from_row)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Segment ids carrying the given tag, best confidence first. Matches a
    /// single tag type so dominant-concept entries for low-scoring concepts
    /// never leak into concept searches. Only segments whose feature pass
    /// completed are returned.
    pub fn segments_with_tag(
        &self,
        tag_value: &str,
        tag_type: &str,
        limit: usize,
    ) -> Result<Vec<(i64, f64)>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT t.segment_id, MAX(t.confidence)
             FROM tags t
             JOIN video_segments s ON s.id = t.segment_id
             WHERE t.tag_value = ? AND t.tag_type = ?
               AND s.processing_status = 'completed'
             GROUP BY t.segment_id
             ORDER BY MAX(t.confidence) DESC
             LIMIT ?",
            )?;
        let rows = stmt
            .query_map(params![tag_value, tag_type, limit as i64], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Most frequent values of one tag type across completed segments.
    pub fn common_tags(&self, tag_type: &str, limit: usize) -> Result<Vec<(String, i64)>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT t.tag_value, COUNT(*) AS n
             FROM tags t
             JOIN video_segments s ON s.id = t.segment_id
             WHERE t.tag_type = ? AND s.processing_status = 'completed'
             GROUP BY t.tag_value
             ORDER BY n DESC, t.tag_value
             LIMIT ?",
        )?;
        let rows = stmt
            .query_map(params![tag_type, limit as i64], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Drop all tags of a segment before re-deriving them.
    pub fn delete_tags_for_segment(&self, segment_id: i64) -> Result<usize> {
        let count = self
            .lock()
            .execute("DELETE FROM tags WHERE segment_id = ?", [segment_id])?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_db;

    #[test]
    fn test_tags_ordered_by_confidence() {
        let db = test_db();
        let file = db.register_file("/m/a.mp4", "a.mp4").unwrap();
        let seg = db.insert_segment(file, 0, 300, 10.0, None).unwrap();
        db.insert_tag(seg, TAG_TYPE_CONCEPT, "nature", 0.61).unwrap();
        db.insert_tag(seg, TAG_TYPE_CONCEPT, "daytime", 0.82).unwrap();

        let tags = db.tags_for_segment(seg).unwrap();
        assert_eq!(tags[0].tag_value, "daytime");
        assert_eq!(tags[1].tag_value, "nature");
    }

    #[test]
    fn test_segments_with_tag_requires_completed() {
        let db = test_db();
        let file = db.register_file("/m/a.mp4", "a.mp4").unwrap();
        let done = db.insert_segment(file, 0, 100, 4.0, None).unwrap();
        let pending = db.insert_segment(file, 100, 200, 4.0, None).unwrap();
        db.mark_segment_completed(done).unwrap();
        db.insert_tag(done, TAG_TYPE_CONCEPT, "water", 0.7).unwrap();
        db.insert_tag(pending, TAG_TYPE_CONCEPT, "water", 0.9).unwrap();

        let hits = db.segments_with_tag("water", TAG_TYPE_CONCEPT, 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, done);
    }

    #[test]
    fn test_tag_searches_filter_by_type() {
        let db = test_db();
        let file = db.register_file("/m/a.mp4", "a.mp4").unwrap();
        let seg = db.insert_segment(file, 0, 100, 4.0, None).unwrap();
        db.mark_segment_completed(seg).unwrap();
        // A concept scoring below the tag threshold exists only as a
        // dominant-concept entry.
        db.insert_tag(seg, TAG_TYPE_DOMINANT, "urban", 0.3).unwrap();
        db.insert_tag(seg, TAG_TYPE_CONCEPT, "water", 0.7).unwrap();
        db.insert_tag(seg, TAG_TYPE_DOMINANT, "water", 0.7).unwrap();

        assert!(db
            .segments_with_tag("urban", TAG_TYPE_CONCEPT, 10)
            .unwrap()
            .is_empty());
        assert_eq!(
            db.segments_with_tag("urban", TAG_TYPE_DOMINANT, 10)
                .unwrap()
                .len(),
            1
        );

        // Concept counts ignore the duplicate dominant entry.
        let common = db.common_tags(TAG_TYPE_CONCEPT, 10).unwrap();
        assert_eq!(common, vec![("water".to_string(), 1)]);
    }

    #[test]
    fn test_confidence_is_clamped() {
        let db = test_db();
        let file = db.register_file("/m/a.mp4", "a.mp4").unwrap();
        let seg = db.insert_segment(file, 0, 100, 4.0, None).unwrap();
        db.insert_tag(seg, TAG_TYPE_CONCEPT, "bright", 1.7).unwrap();
        let tags = db.tags_for_segment(seg).unwrap();
        assert!((tags[0].confidence - 1.0).abs() < 1e-9);
    }
}
