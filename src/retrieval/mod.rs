//! Segment retrieval: similarity, tag and random queries plus sequence
//! generation over completed segments.
//!
//! Every query runs under a deadline checked cooperatively inside the
//! candidate loops. On expiry the query returns an empty result rather than
//! an error, so interactive callers degrade to fallbacks instead of
//! stalling as the corpus grows.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use rand::seq::SliceRandom;
use rand::Rng;
use tracing::{debug, warn};

use crate::config::RetrievalConfig;
use crate::db::{
    Database, FEATURE_EMBEDDING, FEATURE_HISTOGRAM, TAG_TYPE_CONCEPT,
};
use crate::pipeline::similarity::{
    combined_similarity, concept_similarity, embedding_similarity, histogram_similarity,
};

/// Metric used to rank candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimilarityMetric {
    Embedding,
    Histogram,
    Concept,
    Combined,
}

impl SimilarityMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            SimilarityMetric::Embedding => "embedding",
            SimilarityMetric::Histogram => "histogram",
            SimilarityMetric::Concept => "concept",
            SimilarityMetric::Combined => "combined",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "embedding" => Some(SimilarityMetric::Embedding),
            "histogram" => Some(SimilarityMetric::Histogram),
            "concept" => Some(SimilarityMetric::Concept),
            "combined" => Some(SimilarityMetric::Combined),
            _ => None,
        }
    }
}

/// How `generate_sequence` picks each next segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceMode {
    Similar,
    Contrast,
    ConceptChain,
    Random,
    Diverse,
}

impl SequenceMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SequenceMode::Similar => "similar",
            SequenceMode::Contrast => "contrast",
            SequenceMode::ConceptChain => "concept_chain",
            SequenceMode::Random => "random",
            SequenceMode::Diverse => "diverse",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "similar" => Some(SequenceMode::Similar),
            "contrast" => Some(SequenceMode::Contrast),
            "concept_chain" => Some(SequenceMode::ConceptChain),
            "random" => Some(SequenceMode::Random),
            "diverse" => Some(SequenceMode::Diverse),
            _ => None,
        }
    }
}

/// Pooled features of one candidate, loaded lazily during ranking.
struct CandidateFeatures {
    embedding: Option<Vec<f32>>,
    histogram: Option<Vec<f32>>,
    concepts: Option<std::collections::HashMap<String, f64>>,
}

/// Burst length before `diverse` rotates to the next sub-mode.
const DIVERSE_BURST: usize = 2;
/// Candidates considered by the sequence modes.
const SEQUENCE_TOP_K: usize = 3;

pub struct SegmentRetrievalEngine {
    db: Arc<Database>,
    config: RetrievalConfig,
    /// Rolling window of recently selected ids, excluded from candidate
    /// pools to reduce immediate repetition.
    recent: Mutex<VecDeque<i64>>,
}

impl SegmentRetrievalEngine {
    pub fn new(db: Arc<Database>, config: RetrievalConfig) -> Self {
        Self {
            db,
            config,
            recent: Mutex::new(VecDeque::new()),
        }
    }

    fn deadline(&self) -> Instant {
        Instant::now() + Duration::from_millis(self.config.query_timeout_ms)
    }

    fn recent_ids(&self) -> Vec<i64> {
        self.recent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .copied()
            .collect()
    }

    fn remember(&self, segment_id: i64) {
        let mut recent = self.recent.lock().unwrap_or_else(|e| e.into_inner());
        recent.push_back(segment_id);
        while recent.len() > self.config.recent_window {
            recent.pop_front();
        }
    }

    fn load_features(&self, segment_id: i64) -> Result<CandidateFeatures> {
        Ok(CandidateFeatures {
            embedding: self.db.load_vector_feature(segment_id, FEATURE_EMBEDDING)?,
            histogram: self.db.load_vector_feature(segment_id, FEATURE_HISTOGRAM)?,
            concepts: self.db.load_concept_scores(segment_id)?,
        })
    }

    fn score(metric: SimilarityMetric, reference: &CandidateFeatures, candidate: &CandidateFeatures) -> Option<f64> {
        let embedding = || match (&reference.embedding, &candidate.embedding) {
            (Some(a), Some(b)) => Some(embedding_similarity(a, b)),
            _ => None,
        };
        let histogram = || match (&reference.histogram, &candidate.histogram) {
            (Some(a), Some(b)) => Some(histogram_similarity(a, b)),
            _ => None,
        };
        let concept = || match (&reference.concepts, &candidate.concepts) {
            (Some(a), Some(b)) => Some(concept_similarity(a, b)),
            _ => None,
        };
        match metric {
            SimilarityMetric::Embedding => embedding(),
            SimilarityMetric::Histogram => histogram(),
            SimilarityMetric::Concept => concept(),
            SimilarityMetric::Combined => Some(combined_similarity(
                embedding()?,
                histogram().unwrap_or(0.0),
                concept().unwrap_or(0.0),
            )),
        }
    }

    /// Rank all completed segments against a reference segment and return
    /// the top `k` as (id, score), best first. Expired deadlines yield an
    /// empty result.
    pub fn find_similar(
        &self,
        segment_id: i64,
        metric: SimilarityMetric,
        k: usize,
        exclude_recent: bool,
    ) -> Result<Vec<(i64, f64)>> {
        self.ranked(segment_id, metric, k, exclude_recent, false)
    }

    /// Like [`find_similar`] but worst matches first.
    ///
    /// [`find_similar`]: Self::find_similar
    pub fn find_contrasting(
        &self,
        segment_id: i64,
        metric: SimilarityMetric,
        k: usize,
        exclude_recent: bool,
    ) -> Result<Vec<(i64, f64)>> {
        self.ranked(segment_id, metric, k, exclude_recent, true)
    }

    fn ranked(
        &self,
        segment_id: i64,
        metric: SimilarityMetric,
        k: usize,
        exclude_recent: bool,
        ascending: bool,
    ) -> Result<Vec<(i64, f64)>> {
        let deadline = self.deadline();
        let reference = self.load_features(segment_id)?;
        let excluded = if exclude_recent {
            self.recent_ids()
        } else {
            Vec::new()
        };

        let mut scored = Vec::new();
        for candidate_id in self.db.completed_segment_ids()? {
            if Instant::now() >= deadline {
                warn!(
                    segment_id,
                    metric = metric.as_str(),
                    "similarity query deadline exceeded, returning empty"
                );
                return Ok(Vec::new());
            }
            if candidate_id == segment_id || excluded.contains(&candidate_id) {
                continue;
            }
            let features = self.load_features(candidate_id)?;
            if let Some(score) = Self::score(metric, &reference, &features) {
                scored.push((candidate_id, score));
            }
        }

        scored.sort_by(|a, b| {
            let ordering = a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal);
            if ascending {
                ordering
            } else {
                ordering.reverse()
            }
        });
        scored.truncate(k);
        Ok(scored)
    }

    /// Completed segments carrying a tag of the given type, best confidence
    /// first.
    pub fn find_by_tag(
        &self,
        tag_value: &str,
        tag_type: &str,
        k: usize,
    ) -> Result<Vec<(i64, f64)>> {
        let deadline = self.deadline();
        if Instant::now() >= deadline {
            warn!(tag_value, "tag query deadline exceeded, returning empty");
            return Ok(Vec::new());
        }
        let hits = self.db.segments_with_tag(tag_value, tag_type, k)?;
        if Instant::now() >= deadline {
            warn!(tag_value, "tag query deadline exceeded, returning empty");
            return Ok(Vec::new());
        }
        Ok(hits)
    }

    /// A uniformly random completed segment outside the recent window.
    pub fn random_segment(&self) -> Result<Option<i64>> {
        let excluded = self.recent_ids();
        let pool: Vec<i64> = self
            .db
            .completed_segment_ids()?
            .into_iter()
            .filter(|id| !excluded.contains(id))
            .collect();
        Ok(pool.choose(&mut rand::thread_rng()).copied())
    }

    /// Build a chain of up to `length` segment ids, each chosen from the
    /// previous one according to `mode`. Shorter chains mean the corpus ran
    /// out of usable candidates.
    pub fn generate_sequence(
        &self,
        mode: SequenceMode,
        length: usize,
        seed: Option<i64>,
    ) -> Result<Vec<i64>> {
        let mut sequence = Vec::with_capacity(length);
        let Some(first) = (match seed {
            Some(id) => Some(id),
            None => self.random_segment()?,
        }) else {
            return Ok(sequence);
        };
        self.remember(first);
        sequence.push(first);

        let mut current = first;
        for step in 1..length {
            let step_mode = match mode {
                SequenceMode::Diverse => {
                    const ROTATION: [SequenceMode; 3] = [
                        SequenceMode::Similar,
                        SequenceMode::Contrast,
                        SequenceMode::ConceptChain,
                    ];
                    ROTATION[(step / DIVERSE_BURST) % ROTATION.len()]
                }
                other => other,
            };
            let Some(next) = self.next_in_sequence(current, step_mode)? else {
                break;
            };
            self.remember(next);
            sequence.push(next);
            current = next;
        }
        debug!(mode = mode.as_str(), len = sequence.len(), "sequence generated");
        Ok(sequence)
    }

    fn next_in_sequence(&self, current: i64, mode: SequenceMode) -> Result<Option<i64>> {
        let mut rng = rand::thread_rng();
        let pick_from = |candidates: Vec<(i64, f64)>, rng: &mut rand::rngs::ThreadRng| {
            if candidates.is_empty() {
                None
            } else {
                Some(candidates[rng.gen_range(0..candidates.len())].0)
            }
        };

        let chosen = match mode {
            SequenceMode::Random => None,
            SequenceMode::Similar => pick_from(
                self.find_similar(current, SimilarityMetric::Combined, SEQUENCE_TOP_K, true)?,
                &mut rng,
            ),
            SequenceMode::Contrast => pick_from(
                self.find_contrasting(current, SimilarityMetric::Combined, SEQUENCE_TOP_K, true)?,
                &mut rng,
            ),
            SequenceMode::ConceptChain => {
                let chained = self.concept_chain_candidate(current, &mut rng)?;
                match chained {
                    Some(id) => Some(id),
                    // Fall back through similarity before giving up.
                    None => pick_from(
                        self.find_similar(
                            current,
                            SimilarityMetric::Combined,
                            SEQUENCE_TOP_K,
                            true,
                        )?,
                        &mut rng,
                    ),
                }
            }
            SequenceMode::Diverse => unreachable!("diverse resolves to a concrete mode"),
        };

        match chosen {
            Some(id) => Ok(Some(id)),
            None => self.random_segment(),
        }
    }

    /// Pick a random tag among the current segment's strongest concept tags
    /// and follow it to another segment.
    fn concept_chain_candidate(
        &self,
        current: i64,
        rng: &mut rand::rngs::ThreadRng,
    ) -> Result<Option<i64>> {
        let tags: Vec<_> = self
            .db
            .tags_for_segment(current)?
            .into_iter()
            .filter(|tag| tag.tag_type == TAG_TYPE_CONCEPT)
            .take(SEQUENCE_TOP_K)
            .collect();
        let Some(tag) = tags.choose(rng) else {
            return Ok(None);
        };

        let excluded = self.recent_ids();
        let candidates: Vec<i64> = self
            .find_by_tag(
                &tag.tag_value,
                TAG_TYPE_CONCEPT,
                SEQUENCE_TOP_K + excluded.len() + 1,
            )?
            .into_iter()
            .map(|(id, _)| id)
            .filter(|id| *id != current && !excluded.contains(id))
            .take(SEQUENCE_TOP_K)
            .collect();
        Ok(candidates.choose(rng).copied())
    }

    /// Most frequent concept tag values across completed segments.
    pub fn common_tags(&self, limit: usize) -> Result<Vec<(String, i64)>> {
        self.db.common_tags(TAG_TYPE_CONCEPT, limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::TAG_TYPE_DOMINANT;
    use crate::testutil::test_db;
    use std::collections::HashMap;

    /// Seed `n` completed segments whose embeddings march along a line, so
    /// neighbors in id order are neighbors in feature space.
    fn seeded_engine(n: usize, timeout_ms: u64) -> (Arc<Database>, SegmentRetrievalEngine, Vec<i64>) {
        let db = Arc::new(test_db());
        let file = db.register_file("/m/a.mp4", "a.mp4").unwrap();
        let mut ids = Vec::new();
        for i in 0..n {
            let start = (i as u64) * 100;
            let seg = db
                .insert_segment(file, start, start + 100, 3.3, None)
                .unwrap();
            let x = i as f32 / n as f32;
            db.store_vector_feature(seg, FEATURE_EMBEDDING, &[x, 1.0 - x], None)
                .unwrap();
            let mut hist = vec![0f32; 4];
            hist[i % 4] = 1.0;
            db.store_vector_feature(seg, FEATURE_HISTOGRAM, &hist, None)
                .unwrap();
            let mut scores = HashMap::new();
            scores.insert("bright".to_string(), 100.0 * i as f64 / n as f64);
            db.store_concept_scores(seg, &scores).unwrap();
            db.insert_tag(seg, TAG_TYPE_CONCEPT, "bright", i as f64 / n as f64)
                .unwrap();
            db.mark_segment_completed(seg).unwrap();
            ids.push(seg);
        }
        let config = RetrievalConfig {
            query_timeout_ms: timeout_ms,
            recent_window: 10,
        };
        let engine = SegmentRetrievalEngine::new(Arc::clone(&db), config);
        (db, engine, ids)
    }

    #[test]
    fn test_find_similar_ranks_neighbors_first() {
        let (_db, engine, ids) = seeded_engine(8, 3000);
        let hits = engine
            .find_similar(ids[0], SimilarityMetric::Embedding, 3, false)
            .unwrap();
        assert_eq!(hits.len(), 3);
        // Dot product against [0, 1] favors early, low-x segments.
        assert_eq!(hits[0].0, ids[1]);
        assert!(hits[0].1 >= hits[1].1 && hits[1].1 >= hits[2].1);
    }

    #[test]
    fn test_find_contrasting_is_reverse_order() {
        let (_db, engine, ids) = seeded_engine(8, 3000);
        let similar = engine
            .find_similar(ids[0], SimilarityMetric::Embedding, 7, false)
            .unwrap();
        let contrasting = engine
            .find_contrasting(ids[0], SimilarityMetric::Embedding, 7, false)
            .unwrap();
        let reversed: Vec<i64> = contrasting.iter().map(|(id, _)| *id).rev().collect();
        let forward: Vec<i64> = similar.iter().map(|(id, _)| *id).collect();
        // Scores are distinct along the line, so the orders mirror.
        assert_eq!(forward, reversed);
    }

    #[test]
    fn test_expired_deadline_returns_empty() {
        let (_db, engine, ids) = seeded_engine(8, 0);
        let hits = engine
            .find_similar(ids[0], SimilarityMetric::Combined, 5, false)
            .unwrap();
        assert!(hits.is_empty());
        assert!(engine
            .find_by_tag("bright", TAG_TYPE_CONCEPT, 5)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_find_by_tag_orders_by_confidence() {
        let (_db, engine, ids) = seeded_engine(6, 3000);
        let hits = engine.find_by_tag("bright", TAG_TYPE_CONCEPT, 3).unwrap();
        assert_eq!(hits.len(), 3);
        // Highest confidence first: the last-seeded segments.
        assert_eq!(hits[0].0, ids[5]);
        assert!(hits[0].1 >= hits[1].1);
    }

    #[test]
    fn test_find_by_tag_excludes_other_tag_types() {
        let (db, engine, ids) = seeded_engine(4, 3000);
        // "dark" never crossed the concept threshold; it exists only as a
        // dominant-concept entry.
        db.insert_tag(ids[0], TAG_TYPE_DOMINANT, "dark", 0.3).unwrap();

        assert!(engine
            .find_by_tag("dark", TAG_TYPE_CONCEPT, 5)
            .unwrap()
            .is_empty());
        assert_eq!(
            engine
                .find_by_tag("dark", TAG_TYPE_DOMINANT, 5)
                .unwrap()
                .len(),
            1
        );
        assert_eq!(engine.common_tags(5).unwrap(), vec![("bright".to_string(), 4)]);
    }

    #[test]
    fn test_random_segment_only_returns_completed() {
        let db = Arc::new(test_db());
        let file = db.register_file("/m/a.mp4", "a.mp4").unwrap();
        db.insert_segment(file, 0, 100, 3.3, None).unwrap();
        let engine =
            SegmentRetrievalEngine::new(Arc::clone(&db), RetrievalConfig::default());
        assert!(engine.random_segment().unwrap().is_none());

        let done = db.insert_segment(file, 100, 200, 3.3, None).unwrap();
        db.mark_segment_completed(done).unwrap();
        assert_eq!(engine.random_segment().unwrap(), Some(done));
    }

    #[test]
    fn test_sequence_has_no_immediate_repeats() {
        let (_db, engine, _ids) = seeded_engine(20, 3000);
        let sequence = engine
            .generate_sequence(SequenceMode::Similar, 8, None)
            .unwrap();
        assert_eq!(sequence.len(), 8);
        // The rolling window keeps the last 10 picks out of the pool.
        for window in sequence.windows(2) {
            assert_ne!(window[0], window[1]);
        }
        let unique: std::collections::HashSet<_> = sequence.iter().collect();
        assert_eq!(unique.len(), sequence.len());
    }

    #[test]
    fn test_sequence_seeded_start() {
        let (_db, engine, ids) = seeded_engine(12, 3000);
        let sequence = engine
            .generate_sequence(SequenceMode::Diverse, 5, Some(ids[3]))
            .unwrap();
        assert_eq!(sequence[0], ids[3]);
        assert_eq!(sequence.len(), 5);
    }

    #[test]
    fn test_sequence_on_empty_corpus() {
        let db = Arc::new(test_db());
        let engine =
            SegmentRetrievalEngine::new(Arc::clone(&db), RetrievalConfig::default());
        let sequence = engine
            .generate_sequence(SequenceMode::Random, 5, None)
            .unwrap();
        assert!(sequence.is_empty());
    }

    #[test]
    fn test_mode_round_trip() {
        for mode in [
            SequenceMode::Similar,
            SequenceMode::Contrast,
            SequenceMode::ConceptChain,
            SequenceMode::Random,
            SequenceMode::Diverse,
        ] {
            assert_eq!(SequenceMode::from_str(mode.as_str()), Some(mode));
        }
        assert_eq!(SequenceMode::from_str("bogus"), None);
    }
}
