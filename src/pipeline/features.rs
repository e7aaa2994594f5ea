//! Per-segment feature extraction and tag derivation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use tracing::{info, warn};

use crate::config::FeatureConfig;
use crate::db::{
    Database, SegmentRow, FEATURE_EMBEDDING, FEATURE_HISTOGRAM, TAG_TYPE_CONCEPT,
    TAG_TYPE_DOMINANT,
};
use crate::embed::{Embedder, FrameDescriptor};
use crate::source::FrameSource;

/// Outcome of one file's feature pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtractionSummary {
    pub completed: usize,
    pub failed: usize,
    /// True when the pass stopped at a cancellation point with segments
    /// still pending.
    pub cancelled: bool,
}

/// Element-wise mean of equal-length vectors.
fn mean_pool(vectors: &[Vec<f32>]) -> Vec<f32> {
    let Some(first) = vectors.first() else {
        return Vec::new();
    };
    let mut pooled = vec![0f32; first.len()];
    for vector in vectors {
        for (sum, value) in pooled.iter_mut().zip(vector) {
            *sum += value;
        }
    }
    let n = vectors.len() as f32;
    for value in &mut pooled {
        *value /= n;
    }
    pooled
}

/// Per-concept average over the sampled frames.
fn mean_scores(maps: &[HashMap<String, f64>]) -> HashMap<String, f64> {
    let mut sums: HashMap<String, (f64, usize)> = HashMap::new();
    for scores in maps {
        for (concept, score) in scores {
            let entry = sums.entry(concept.clone()).or_insert((0.0, 0));
            entry.0 += score;
            entry.1 += 1;
        }
    }
    sums.into_iter()
        .map(|(concept, (total, n))| (concept, total / n as f64))
        .collect()
}

/// Tags derived from averaged concept scores: a `concept` tag for every
/// score above the threshold, plus the top scorers as `dominant_concept`
/// tags regardless of threshold. Confidence is the score on a 0-1 scale.
pub fn derive_tags(
    scores: &HashMap<String, f64>,
    threshold: f64,
    dominant_count: usize,
) -> Vec<(&'static str, String, f64)> {
    let mut tags = Vec::new();
    for (concept, score) in scores {
        if *score > threshold {
            tags.push((TAG_TYPE_CONCEPT, concept.clone(), score / 100.0));
        }
    }

    let mut ranked: Vec<(&String, &f64)> = scores.iter().collect();
    // Name as tie-breaker keeps dominant tags stable across runs.
    ranked.sort_by(|a, b| {
        b.1.partial_cmp(a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(b.0))
    });
    for (concept, score) in ranked.into_iter().take(dominant_count) {
        tags.push((TAG_TYPE_DOMINANT, concept.clone(), score / 100.0));
    }
    tags
}

pub struct FeatureExtractor<'a> {
    config: FeatureConfig,
    db: &'a Database,
    embedder: &'a dyn Embedder,
}

impl<'a> FeatureExtractor<'a> {
    pub fn new(config: FeatureConfig, db: &'a Database, embedder: &'a dyn Embedder) -> Self {
        Self {
            config,
            db,
            embedder,
        }
    }

    /// Frames sampled for a segment: up to `frames_per_segment`, evenly
    /// spaced across the range.
    fn sample_frames(&self, segment: &SegmentRow) -> Vec<u64> {
        let length = segment.frame_count();
        if length == 0 {
            return Vec::new();
        }
        let interval = (length / self.config.frames_per_segment as u64).max(1);
        (0..self.config.frames_per_segment as u64)
            .map(|i| segment.start_frame + i * interval)
            .filter(|frame| *frame < segment.end_frame)
            .collect()
    }

    /// Describe, pool and persist one segment's features and tags.
    fn extract_segment(
        &self,
        segment: &SegmentRow,
        source: &mut dyn FrameSource,
    ) -> Result<()> {
        let frames = self.sample_frames(segment);
        let mut descriptors: Vec<FrameDescriptor> = Vec::with_capacity(frames.len());
        for frame in &frames {
            let image = source.read_rgb(*frame)?;
            descriptors.push(self.embedder.describe(&image)?);
        }
        if descriptors.is_empty() {
            anyhow::bail!("segment {} produced no sampled frames", segment.id);
        }

        let vectors: Vec<Vec<f32>> = descriptors.iter().map(|d| d.vector.clone()).collect();
        let histograms: Vec<Vec<f32>> =
            descriptors.iter().map(|d| d.histogram.clone()).collect();
        let score_maps: Vec<HashMap<String, f64>> = descriptors
            .iter()
            .map(|d| d.concept_scores.clone())
            .collect();

        self.db
            .store_vector_feature(segment.id, FEATURE_EMBEDDING, &mean_pool(&vectors), None)?;
        self.db.store_vector_feature(
            segment.id,
            FEATURE_HISTOGRAM,
            &mean_pool(&histograms),
            None,
        )?;
        let pooled_scores = mean_scores(&score_maps);
        self.db.store_concept_scores(segment.id, &pooled_scores)?;

        // Re-derive from scratch so a re-run never stacks duplicate tags.
        self.db.delete_tags_for_segment(segment.id)?;
        for (tag_type, value, confidence) in derive_tags(
            &pooled_scores,
            self.config.concept_tag_threshold as f64,
            self.config.dominant_tag_count,
        ) {
            self.db.insert_tag(segment.id, tag_type, &value, confidence)?;
        }

        self.db.mark_segment_completed(segment.id)?;
        Ok(())
    }

    /// Run the feature stage for every pending segment of one file.
    ///
    /// A segment's extraction failure marks that segment failed and moves
    /// on; only persistence failures abort the pass. Progress is reported
    /// after each segment as a percentage of the file's pending set.
    pub fn extract_for_file(
        &self,
        file_id: i64,
        source: &mut dyn FrameSource,
        cancel: &AtomicBool,
        mut on_progress: impl FnMut(f64) -> Result<()>,
    ) -> Result<ExtractionSummary> {
        let pending = self.db.segments_pending_features(file_id)?;
        let total = pending.len();
        let mut summary = ExtractionSummary::default();

        for (index, segment) in pending.iter().enumerate() {
            if cancel.load(Ordering::Relaxed) {
                info!(file_id, "feature extraction cancelled");
                summary.cancelled = true;
                return Ok(summary);
            }

            match self.extract_segment(segment, source) {
                Ok(()) => summary.completed += 1,
                Err(err) => {
                    // Persistence problems are not per-segment conditions.
                    if err.downcast_ref::<rusqlite::Error>().is_some() {
                        return Err(err);
                    }
                    warn!(
                        segment_id = segment.id,
                        error = %err,
                        "segment feature extraction failed"
                    );
                    self.db.mark_segment_failed(segment.id, &err.to_string())?;
                    summary.failed += 1;
                }
            }
            on_progress((index + 1) as f64 / total as f64 * 100.0)?;
        }

        info!(
            file_id,
            completed = summary.completed,
            failed = summary.failed,
            "feature extraction finished"
        );
        Ok(summary)
    }
}
