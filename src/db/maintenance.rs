//! Database housekeeping for the cleanup command.

use std::path::Path;

use anyhow::Result;
use tracing::info;

use super::Database;

/// What a cleanup pass removed.
#[derive(Debug, Clone, Copy, Default)]
pub struct CleanupReport {
    pub missing_files: usize,
    pub orphaned_features: usize,
    pub orphaned_tags: usize,
    pub pruned_checkpoints: usize,
}

impl Database {
    /// Delete records for files that no longer exist on disk. Segment rows,
    /// features, tags and checkpoints follow through cascading deletes.
    pub fn remove_missing_files(&self) -> Result<usize> {
        let paths = {
            let conn = self.lock();
            Self::file_paths(&conn)?
        };
        let mut removed = 0;
        for (id, path) in paths {
            if !Path::new(&path).exists() {
                self.lock()
                    .execute("DELETE FROM media_files WHERE id = ?", [id])?;
                info!(file_id = id, path = %path, "removed record for missing file");
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Delete feature and tag rows whose segment is gone. Such rows can only
    /// appear if a database was written with foreign keys off.
    pub fn remove_orphaned_rows(&self) -> Result<(usize, usize)> {
        let conn = self.lock();
        let features = conn.execute(
            "DELETE FROM segment_features
             WHERE segment_id NOT IN (SELECT id FROM video_segments)",
            [],
        )?;
        let tags = conn.execute(
            "DELETE FROM tags
             WHERE segment_id NOT IN (SELECT id FROM video_segments)",
            [],
        )?;
        Ok((features, tags))
    }

    /// Full housekeeping pass.
    pub fn cleanup(&self) -> Result<CleanupReport> {
        let missing_files = self.remove_missing_files()?;
        let (orphaned_features, orphaned_tags) = self.remove_orphaned_rows()?;
        let pruned_checkpoints = self.prune_checkpoints()?;
        let report = CleanupReport {
            missing_files,
            orphaned_features,
            orphaned_tags,
            pruned_checkpoints,
        };
        info!(
            missing_files = report.missing_files,
            orphaned_features = report.orphaned_features,
            orphaned_tags = report.orphaned_tags,
            pruned_checkpoints = report.pruned_checkpoints,
            "cleanup finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::checkpoints::SceneDetectionState;
    use crate::testutil::test_db;
    use std::io::Write;

    #[test]
    fn test_remove_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let kept = dir.path().join("kept.mp4");
        std::fs::File::create(&kept)
            .unwrap()
            .write_all(b"x")
            .unwrap();

        let db = test_db();
        db.register_file(kept.to_str().unwrap(), "kept.mp4").unwrap();
        let gone = db
            .register_file(dir.path().join("gone.mp4").to_str().unwrap(), "gone.mp4")
            .unwrap();
        db.insert_segment(gone, 0, 100, 4.0, None).unwrap();

        assert_eq!(db.remove_missing_files().unwrap(), 1);
        assert!(db.get_file(gone).unwrap().is_none());
        // Cascade removed the segment too.
        assert_eq!(db.count_segments().unwrap(), 0);
    }

    #[test]
    fn test_cleanup_prunes_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.mp4");
        std::fs::File::create(&path).unwrap().write_all(b"x").unwrap();

        let db = test_db();
        let file = db.register_file(path.to_str().unwrap(), "a.mp4").unwrap();
        for frame in [100, 200, 300] {
            db.save_scene_checkpoint(file, &SceneDetectionState::new(frame, 5, 900))
                .unwrap();
        }

        let report = db.cleanup().unwrap();
        assert_eq!(report.pruned_checkpoints, 2);
        assert_eq!(report.missing_files, 0);
    }
}
