//! Resumable scene boundary detection.
//!
//! Frames are sampled at a fraction of the stream rate, downscaled to a
//! small grayscale analysis buffer, and compared pixel-wise against the
//! previous sample. A sample position where enough pixels changed is a
//! boundary; scenes are the runs between boundaries.

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::SegmenterConfig;
use crate::db::checkpoints::SceneDetectionState;
use crate::source::FrameSource;

/// One detected scene as a half-open frame range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scene {
    pub start_frame: u64,
    pub end_frame: u64,
    /// Changed-pixel fraction of the boundary that ended this scene,
    /// 0 for the trailing scene.
    pub score: f64,
}

impl Scene {
    pub fn frame_count(&self) -> u64 {
        self.end_frame.saturating_sub(self.start_frame)
    }
}

/// Passed to the progress callback alongside the resume state.
#[derive(Debug, Clone, Copy)]
pub struct SceneProgress {
    pub current_frame: u64,
    pub total_frames: u64,
    pub scenes_so_far: usize,
}

impl SceneProgress {
    pub fn percent(&self) -> f64 {
        if self.total_frames == 0 {
            100.0
        } else {
            self.current_frame as f64 / self.total_frames as f64 * 100.0
        }
    }
}

/// Result of one detection pass.
#[derive(Debug)]
pub struct Detection {
    /// Post-processed scenes; only meaningful when `completed`.
    pub scenes: Vec<Scene>,
    /// False when the pass stopped at a cancellation point.
    pub completed: bool,
}

/// Fraction of pixels whose intensity moved more than `threshold`.
fn changed_fraction(prev: &[u8], current: &[u8], threshold: u8) -> f64 {
    if prev.is_empty() || prev.len() != current.len() {
        return 0.0;
    }
    let changed = prev
        .iter()
        .zip(current)
        .filter(|(a, b)| a.abs_diff(**b) > threshold)
        .count();
    changed as f64 / prev.len() as f64
}

pub struct SceneSegmenter {
    config: SegmenterConfig,
    /// Progress callback cadence as a percentage of total frames.
    checkpoint_percent: f64,
}

impl SceneSegmenter {
    pub fn new(config: SegmenterConfig, checkpoint_percent: f64) -> Self {
        Self {
            config,
            checkpoint_percent,
        }
    }

    /// Scan the source for scene boundaries, optionally resuming from a
    /// checkpointed state.
    ///
    /// The callback fires roughly every `checkpoint_percent` of total frames
    /// and immediately on every new boundary; each invocation receives a
    /// state snapshot suitable for checkpointing. On resume the baseline
    /// frame one sample interval before the resume point is re-read, and the
    /// resume frame itself is re-examined; a re-detected boundary at or
    /// before the last recorded scene end moves that end instead of creating
    /// an overlapping scene.
    pub fn detect(
        &self,
        source: &mut dyn FrameSource,
        resume: Option<SceneDetectionState>,
        cancel: &AtomicBool,
        mut on_progress: impl FnMut(&SceneProgress, &SceneDetectionState) -> Result<()>,
    ) -> Result<Detection> {
        let props = source.properties().clone();
        let total_frames = props.frame_count;
        let interval = self.config.sample_interval(props.fps);
        let (width, height) = (self.config.analysis_width, self.config.analysis_height);

        let mut state = match resume {
            Some(state) => {
                info!(
                    resume_frame = state.last_frame,
                    scenes = state.scenes.len(),
                    "resuming scene detection"
                );
                state
            }
            None => SceneDetectionState::new(0, interval, total_frames),
        };
        // A config change between runs must not produce mixed-interval scans.
        state.sample_interval = interval;
        state.frames_total = total_frames;

        if total_frames == 0 {
            return Ok(Detection {
                scenes: Vec::new(),
                completed: true,
            });
        }

        let (mut frame, mut baseline) = if state.last_frame == 0 {
            (interval, source.read_gray(0, width, height)?)
        } else {
            let baseline_frame = state.last_frame.saturating_sub(interval);
            (
                state.last_frame,
                source.read_gray(baseline_frame, width, height)?,
            )
        };

        let callback_stride =
            ((total_frames as f64 * self.checkpoint_percent / 100.0) as u64).max(interval);
        let mut next_callback = frame + callback_stride;

        while frame < total_frames {
            if cancel.load(Ordering::Relaxed) {
                info!(frame, "scene detection cancelled");
                let progress = self.progress_of(&state, frame, total_frames);
                on_progress(&progress, &state)?;
                return Ok(Detection {
                    scenes: Vec::new(),
                    completed: false,
                });
            }

            let sample = source.read_gray(frame, width, height)?;
            let fraction = changed_fraction(&baseline, &sample, self.config.pixel_threshold);
            state.last_frame = frame;

            if fraction > self.config.change_threshold {
                record_boundary(&mut state, frame, fraction);
                debug!(frame, score = fraction, "scene boundary");
                let progress = self.progress_of(&state, frame, total_frames);
                on_progress(&progress, &state)?;
                next_callback = frame + callback_stride;
            } else if frame >= next_callback {
                let progress = self.progress_of(&state, frame, total_frames);
                on_progress(&progress, &state)?;
                next_callback = frame + callback_stride;
            }

            baseline = sample;
            frame += interval;
        }

        let mut scenes = state.scenes.clone();
        if state.current_start < total_frames {
            scenes.push(Scene {
                start_frame: state.current_start,
                end_frame: total_frames,
                score: 0.0,
            });
        }
        let scenes = postprocess(
            scenes,
            self.config.min_segment_frames(props.fps),
            self.config.max_segment_frames(props.fps),
        );
        info!(scenes = scenes.len(), "scene detection finished");
        Ok(Detection {
            scenes,
            completed: true,
        })
    }

    fn progress_of(
        &self,
        state: &SceneDetectionState,
        frame: u64,
        total_frames: u64,
    ) -> SceneProgress {
        SceneProgress {
            current_frame: frame,
            total_frames,
            scenes_so_far: state.scenes.len(),
        }
    }
}

/// Fold a boundary into the accumulated scene list.
///
/// A boundary at or before the last scene's end moves that end; anything
/// else closes the open run. One rule covers both the steady state and the
/// re-examined sample after a resume.
fn record_boundary(state: &mut SceneDetectionState, frame: u64, score: f64) {
    if let Some(last) = state.scenes.last_mut() {
        if frame <= last.end_frame {
            last.end_frame = frame;
            last.score = score;
            state.current_start = frame;
            return;
        }
    }
    if frame > state.current_start {
        state.scenes.push(Scene {
            start_frame: state.current_start,
            end_frame: frame,
            score,
        });
    }
    state.current_start = frame;
}

/// Drop scenes below the minimum length, then split scenes above the
/// maximum into consecutive chunks of at most `max_frames` (the final chunk
/// may be shorter). Chunks inherit the parent scene's score.
pub fn postprocess(scenes: Vec<Scene>, min_frames: u64, max_frames: u64) -> Vec<Scene> {
    let mut out = Vec::new();
    for scene in scenes {
        if scene.frame_count() < min_frames {
            continue;
        }
        if scene.frame_count() <= max_frames {
            out.push(scene);
            continue;
        }
        let mut start = scene.start_frame;
        while start < scene.end_frame {
            let end = (start + max_frames).min(scene.end_frame);
            out.push(Scene {
                start_frame: start,
                end_frame: end,
                score: scene.score,
            });
            start = end;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::SyntheticSource;
    use std::sync::atomic::AtomicBool;

    fn segmenter() -> SceneSegmenter {
        SceneSegmenter::new(SegmenterConfig::default(), 5.0)
    }

    /// Segmenter whose max-length split never fires, so detected boundaries
    /// map one-to-one to scenes.
    fn no_split_segmenter() -> SceneSegmenter {
        let config = SegmenterConfig {
            max_segment_secs: 3600.0,
            ..Default::default()
        };
        SceneSegmenter::new(config, 5.0)
    }

    fn no_progress(_: &SceneProgress, _: &SceneDetectionState) -> Result<()> {
        Ok(())
    }

    #[test]
    fn test_changed_fraction() {
        let a = vec![10u8; 100];
        let mut b = vec![10u8; 100];
        for pixel in b.iter_mut().take(20) {
            *pixel = 200;
        }
        assert!((changed_fraction(&a, &b, 30) - 0.2).abs() < 1e-9);
        assert_eq!(changed_fraction(&a, &a, 30), 0.0);
    }

    #[test]
    fn test_detects_hard_cuts() {
        // 30s at 30fps with cuts at 300 and 600.
        let mut source =
            SyntheticSource::new(900, 30.0, vec![(0, 20), (300, 120), (600, 240)]);
        let cancel = AtomicBool::new(false);
        let detection = segmenter()
            .detect(&mut source, None, &cancel, no_progress)
            .unwrap();
        assert!(detection.completed);

        let ranges: Vec<_> = detection
            .scenes
            .iter()
            .map(|s| (s.start_frame, s.end_frame))
            .collect();
        assert_eq!(ranges, vec![(0, 300), (300, 600), (600, 900)]);
        // Cuts replace every pixel, so boundary scores saturate.
        assert!((detection.scenes[0].score - 1.0).abs() < 1e-9);
        assert_eq!(detection.scenes[2].score, 0.0);
    }

    #[test]
    fn test_uniform_footage_is_one_scene() {
        let mut source = SyntheticSource::new(450, 30.0, vec![(0, 100)]);
        let cancel = AtomicBool::new(false);
        let detection = segmenter()
            .detect(&mut source, None, &cancel, no_progress)
            .unwrap();
        assert_eq!(detection.scenes.len(), 1);
        assert_eq!(detection.scenes[0].start_frame, 0);
        assert_eq!(detection.scenes[0].end_frame, 450);
    }

    #[test]
    fn test_postprocess_drop_and_split() {
        // Matches a 9000-frame file at 30fps with boundaries at 1500, 4500
        // and 7500, a 30-frame minimum and a 450-frame maximum.
        let raw = vec![
            Scene { start_frame: 0, end_frame: 1500, score: 0.8 },
            Scene { start_frame: 1500, end_frame: 4500, score: 0.9 },
            Scene { start_frame: 4500, end_frame: 7500, score: 0.7 },
            Scene { start_frame: 7500, end_frame: 9000, score: 0.0 },
        ];
        let out = postprocess(raw, 30, 450);

        // 1500 frames split as 3x450 + 150; 3000 frames as 6x450 + 300.
        assert_eq!(out.len(), 4 + 7 + 7 + 4);
        let second: Vec<_> = out
            .iter()
            .filter(|s| s.start_frame >= 1500 && s.end_frame <= 4500)
            .collect();
        assert_eq!(second.len(), 7);
        assert!(second[..6].iter().all(|s| s.frame_count() == 450));
        assert_eq!(second[6].frame_count(), 300);

        // Chunks tile the parent ranges without gaps or overlap.
        for pair in out.windows(2) {
            assert_eq!(pair[0].end_frame, pair[1].start_frame);
        }
    }

    #[test]
    fn test_postprocess_drops_short_scenes() {
        let raw = vec![
            Scene { start_frame: 0, end_frame: 10, score: 0.5 },
            Scene { start_frame: 10, end_frame: 200, score: 0.0 },
        ];
        let out = postprocess(raw, 30, 450);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].start_frame, 10);
    }

    #[test]
    fn test_resume_matches_cold_run() {
        let shots = vec![(0u64, 20u8), (600, 120), (1200, 240)];
        let cancel = AtomicBool::new(false);

        let mut cold_source = SyntheticSource::new(1800, 30.0, shots.clone());
        let cold = segmenter()
            .detect(&mut cold_source, None, &cancel, no_progress)
            .unwrap();

        // First run up to roughly half the file, keeping the last state the
        // callback saw.
        let mut first = SyntheticSource::new(1800, 30.0, shots.clone());
        let mut saved: Option<SceneDetectionState> = None;
        segmenter()
            .detect(&mut first, None, &cancel, |progress, state| {
                if progress.current_frame <= 900 {
                    saved = Some(state.clone());
                }
                Ok(())
            })
            .unwrap();
        let saved = saved.expect("no checkpoint captured");
        assert!(saved.last_frame <= 900);

        let mut resumed_source = SyntheticSource::new(1800, 30.0, shots);
        let resumed = segmenter()
            .detect(&mut resumed_source, Some(saved.clone()), &cancel, no_progress)
            .unwrap();

        assert_eq!(cold.scenes, resumed.scenes);
        // The resumed pass never read frames before the baseline.
        let min_read = *resumed_source
            .gray_reads
            .lock()
            .unwrap()
            .iter()
            .min()
            .unwrap();
        assert_eq!(min_read, saved.last_frame - saved.sample_interval);
    }

    #[test]
    fn test_resume_boundary_merge_is_idempotent() {
        // Checkpoint taken right at a boundary: the re-examined resume frame
        // re-detects it and must move the recorded end, not duplicate it.
        let shots = vec![(0u64, 20u8), (600, 200)];
        let cancel = AtomicBool::new(false);

        let mut first = SyntheticSource::new(1200, 30.0, shots.clone());
        let mut at_boundary: Option<SceneDetectionState> = None;
        segmenter()
            .detect(&mut first, None, &cancel, |_, state| {
                if state.last_frame == 600 && at_boundary.is_none() {
                    at_boundary = Some(state.clone());
                }
                Ok(())
            })
            .unwrap();
        let state = at_boundary.expect("no boundary checkpoint");
        assert_eq!(state.scenes.len(), 1);

        let mut resumed_source = SyntheticSource::new(1200, 30.0, shots);
        let resumed = no_split_segmenter()
            .detect(&mut resumed_source, Some(state), &cancel, no_progress)
            .unwrap();
        let ranges: Vec<_> = resumed
            .scenes
            .iter()
            .map(|s| (s.start_frame, s.end_frame))
            .collect();
        assert_eq!(ranges, vec![(0, 600), (600, 1200)]);
    }

    #[test]
    fn test_cancel_stops_before_completion() {
        let mut source = SyntheticSource::new(1800, 30.0, vec![(0, 20)]);
        let cancel = AtomicBool::new(true);
        let detection = segmenter()
            .detect(&mut source, None, &cancel, no_progress)
            .unwrap();
        assert!(!detection.completed);
        assert!(detection.scenes.is_empty());
    }
}
