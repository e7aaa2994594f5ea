//! Processing coordinator.
//!
//! Owns the FIFO work queue and one background worker that drains it. A
//! file is processed under an exclusive lease: the worker transactionally
//! flips the row to in-progress before touching it, so a second worker (or
//! a second process sharing the database) can never work the same file.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use anyhow::Result;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::db::{Database, ProcessingStatus};
use crate::embed::Embedder;
use crate::source::{discover_media, SourceOpener};

use super::features::FeatureExtractor;
use super::scenes::SceneSegmenter;

/// Snapshot returned by [`Coordinator::status`].
#[derive(Debug, Clone, Copy)]
pub struct PipelineStatus {
    pub queue_length: usize,
    pub processed_count: i64,
    pub failed_count: i64,
    pub total_count: i64,
    /// Weighted progress of the file currently being worked, if any.
    pub current_file_progress: f64,
    pub overall_progress: f64,
}

struct Shared {
    config: Config,
    db: Arc<Database>,
    opener: Box<dyn SourceOpener>,
    embedder: Box<dyn Embedder>,
    queue: Mutex<VecDeque<i64>>,
    cancel: AtomicBool,
    worker_active: AtomicBool,
}

pub struct Coordinator {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Coordinator {
    /// Build a coordinator over an initialized database.
    ///
    /// Any file left in-progress by a previous process is requeued to
    /// pending here, before a worker exists, so a stale lease can never
    /// shadow a live one.
    pub fn new(
        config: Config,
        db: Arc<Database>,
        opener: Box<dyn SourceOpener>,
        embedder: Box<dyn Embedder>,
    ) -> Result<Self> {
        let requeued = db.requeue_stale_in_progress()?;
        if requeued > 0 {
            info!(requeued, "requeued files left in progress by a previous run");
        }
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                db,
                opener,
                embedder,
                queue: Mutex::new(VecDeque::new()),
                cancel: AtomicBool::new(false),
                worker_active: AtomicBool::new(false),
            }),
            worker: Mutex::new(None),
        })
    }

    /// Queue one file for processing. No-op if the file is already queued.
    /// Returns the file's database id.
    pub fn enqueue(&self, path: &Path) -> Result<i64> {
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let file_id = self
            .shared
            .db
            .register_file(&path.display().to_string(), &filename)?;

        {
            let mut queue = self.shared.queue.lock().unwrap_or_else(|e| e.into_inner());
            if !queue.contains(&file_id) {
                queue.push_back(file_id);
            }
        }
        self.ensure_worker();
        Ok(file_id)
    }

    /// Discover every media file under the configured directory and queue
    /// it. Returns the number of files queued.
    pub fn process_all(&self) -> Result<usize> {
        let paths = discover_media(
            &self.shared.config.media_dir,
            &self.shared.config.pipeline.media_extensions,
        );
        info!(count = paths.len(), "discovered media files");
        for path in &paths {
            self.enqueue(path)?;
        }
        Ok(paths.len())
    }

    /// Reset every failed file to pending and queue it again. Returns how
    /// many files were retried.
    pub fn retry_failed(&self) -> Result<usize> {
        let ids = self.shared.db.retry_failed_files()?;
        let count = ids.len();
        {
            let mut queue = self.shared.queue.lock().unwrap_or_else(|e| e.into_inner());
            for id in ids {
                if !queue.contains(&id) {
                    queue.push_back(id);
                }
            }
        }
        if count > 0 {
            self.ensure_worker();
        }
        Ok(count)
    }

    pub fn status(&self) -> Result<PipelineStatus> {
        let counts = self.shared.db.count_files_by_status()?;
        let queue_length = self
            .shared
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len();

        let current_file_progress = self
            .shared
            .db
            .list_files(Some(ProcessingStatus::InProgress), 1)?
            .first()
            .map(|row| row.overall_progress())
            .unwrap_or(0.0);

        let overall_progress = if counts.total == 0 {
            0.0
        } else {
            (counts.completed as f64 * 100.0 + current_file_progress) / counts.total as f64
        };

        Ok(PipelineStatus {
            queue_length,
            processed_count: counts.completed,
            failed_count: counts.failed,
            total_count: counts.total,
            current_file_progress,
            overall_progress,
        })
    }

    /// Request a cooperative stop and wait for the worker to finish its
    /// current unit of work. All checkpointed state remains resumable.
    pub fn stop(&self) {
        self.shared.cancel.store(true, Ordering::SeqCst);
        self.join_worker();
        self.shared.cancel.store(false, Ordering::SeqCst);
    }

    /// Block until the queue is drained and the worker has exited.
    pub fn wait_idle(&self) {
        self.join_worker();
    }

    fn join_worker(&self) {
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    fn ensure_worker(&self) {
        if self.shared.worker_active.swap(true, Ordering::SeqCst) {
            return;
        }
        let shared = Arc::clone(&self.shared);
        let handle = std::thread::spawn(move || worker_loop(&shared));
        *self.worker.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }
}

fn worker_loop(shared: &Arc<Shared>) {
    loop {
        if shared.cancel.load(Ordering::Relaxed) {
            break;
        }
        let next = shared
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        let Some(file_id) = next else {
            shared.worker_active.store(false, Ordering::SeqCst);
            // An enqueue may have raced the flag clear; reclaim if so.
            let queue_empty = shared
                .queue
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .is_empty();
            if !queue_empty && !shared.worker_active.swap(true, Ordering::SeqCst) {
                continue;
            }
            return;
        };

        match shared.db.claim_file(file_id) {
            Ok(true) => {}
            Ok(false) => {
                info!(file_id, "skipping file: lease unavailable");
                continue;
            }
            Err(err) => {
                error!(file_id, error = %err, "lease claim failed");
                continue;
            }
        }

        match process_file(shared, file_id) {
            Ok(false) => {}
            Ok(true) => {
                // Cancelled mid-file; the lease stays held and startup
                // reconciliation requeues it next run.
                info!(file_id, "processing interrupted, state left resumable");
            }
            Err(err) => {
                // A file's failure never stops the worker loop.
                error!(file_id, error = %err, "file processing failed");
                if let Err(db_err) = shared.db.mark_file_failed(file_id, &err.to_string()) {
                    error!(file_id, error = %db_err, "could not record file failure");
                }
            }
        }
    }
    shared.worker_active.store(false, Ordering::SeqCst);
}

/// Drive one file through both stages. Returns true when interrupted by a
/// cancellation request.
fn process_file(shared: &Arc<Shared>, file_id: i64) -> Result<bool> {
    let db = &shared.db;
    let row = db
        .get_file(file_id)?
        .ok_or_else(|| anyhow::anyhow!("file {} vanished from the database", file_id))?;
    info!(file_id, path = %row.path, "processing file");

    let mut source = shared.opener.open(Path::new(&row.path))?;
    db.set_file_properties(file_id, source.properties())?;
    let fps = source.properties().fps;

    if !row.scene_detection_complete {
        let resume = match db.load_scene_checkpoint(file_id) {
            Ok(state) => state,
            Err(err) => {
                // A corrupt or stale checkpoint costs a rescan, not the file.
                warn!(file_id, error = %err, "ignoring unreadable scene checkpoint");
                None
            }
        };

        let segmenter = SceneSegmenter::new(
            shared.config.segmenter.clone(),
            shared.config.pipeline.checkpoint_percent,
        );
        let detection = segmenter.detect(
            source.as_mut(),
            resume,
            &shared.cancel,
            |progress, state| {
                db.save_scene_checkpoint(file_id, state)?;
                db.set_scene_progress(file_id, progress.percent())?;
                Ok(())
            },
        )?;
        if !detection.completed {
            return Ok(true);
        }

        for scene in &detection.scenes {
            let duration = if fps > 0.0 {
                scene.frame_count() as f64 / fps
            } else {
                0.0
            };
            db.insert_segment(
                file_id,
                scene.start_frame,
                scene.end_frame,
                duration,
                Some(scene.score),
            )?;
        }
        db.mark_scene_detection_complete(file_id)?;
    }

    let extractor = FeatureExtractor::new(
        shared.config.features.clone(),
        db,
        shared.embedder.as_ref(),
    );
    let summary = extractor.extract_for_file(file_id, source.as_mut(), &shared.cancel, |p| {
        db.set_feature_progress(file_id, p)
    })?;
    if summary.cancelled {
        return Ok(true);
    }

    // Completion policy is permissive: a file with failed segments still
    // completes, and the failures stay queryable on the segment rows.
    let failed_segments = db.count_failed_segments_for_file(file_id)?;
    if failed_segments > 0 {
        warn!(file_id, failed_segments, "file completed with failed segments");
    }
    db.mark_file_completed(file_id)?;
    info!(file_id, segments = summary.completed, "file completed");
    Ok(false)
}
