//! Similarity metrics over pooled segment features.

use std::collections::HashMap;

/// Dot product of two embedding vectors. Mismatched lengths compare over
/// the shorter prefix.
pub fn embedding_similarity(a: &[f32], b: &[f32]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (*x as f64) * (*y as f64)).sum()
}

/// Histogram intersection normalized by the reference histogram's mass.
/// The first argument is the reference.
pub fn histogram_similarity(reference: &[f32], other: &[f32]) -> f64 {
    let total: f64 = reference.iter().map(|v| *v as f64).sum();
    if total <= 0.0 {
        return 0.0;
    }
    let intersection: f64 = reference
        .iter()
        .zip(other)
        .map(|(a, b)| (*a as f64).min(*b as f64))
        .sum();
    intersection / total
}

/// 1 minus the mean absolute score difference over the shared concept set,
/// scores on a 0-100 scale. No shared concepts means no evidence either
/// way, scored 0.
pub fn concept_similarity(a: &HashMap<String, f64>, b: &HashMap<String, f64>) -> f64 {
    let mut total_diff = 0.0;
    let mut shared = 0usize;
    for (concept, score_a) in a {
        if let Some(score_b) = b.get(concept) {
            total_diff += (score_a - score_b).abs();
            shared += 1;
        }
    }
    if shared == 0 {
        return 0.0;
    }
    1.0 - total_diff / shared as f64 / 100.0
}

/// Weighted blend of the three metrics.
pub fn combined_similarity(
    embedding: f64,
    histogram: f64,
    concept: f64,
) -> f64 {
    0.6 * embedding + 0.2 * histogram + 0.2 * concept
}
