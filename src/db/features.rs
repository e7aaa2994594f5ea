//! Segment feature storage.
//!
//! Features are stored as versioned JSON envelopes so blob layout changes
//! never silently misread old rows. Vectors (embeddings, histograms) and
//! concept score maps use separate envelope shapes under the same version
//! field.

use std::collections::HashMap;

use anyhow::{bail, Result};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

use super::Database;

pub const FEATURE_TYPE_VISUAL: &str = "visual";

pub const FEATURE_EMBEDDING: &str = "clip_embedding";
pub const FEATURE_HISTOGRAM: &str = "color_histogram";
pub const FEATURE_CONCEPTS: &str = "concept_scores";

const BLOB_VERSION: u32 = 1;

/// Envelope for vector-valued features.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeatureBlob {
    pub version: u32,
    pub values: Vec<f32>,
}

impl FeatureBlob {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            version: BLOB_VERSION,
            values,
        }
    }
}

/// Envelope for concept score maps, values in [0, 100].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConceptBlob {
    pub version: u32,
    pub scores: HashMap<String, f64>,
}

impl ConceptBlob {
    pub fn new(scores: HashMap<String, f64>) -> Self {
        Self {
            version: BLOB_VERSION,
            scores,
        }
    }
}

fn check_version(version: u32, segment_id: i64, name: &str) -> Result<()> {
    if version != BLOB_VERSION {
        bail!(
            "unsupported feature blob version {} for segment {} ({})",
            version,
            segment_id,
            name
        );
    }
    Ok(())
}

impl Database {
    /// Store a vector feature, replacing any previous value for the same
    /// (segment, type, name) key.
    pub fn store_vector_feature(
        &self,
        segment_id: i64,
        name: &str,
        values: &[f32],
        frame_number: Option<u64>,
    ) -> Result<()> {
        let blob = serde_json::to_vec(&FeatureBlob::new(values.to_vec()))?;
        self.lock().execute(
            "INSERT INTO segment_features
                 (segment_id, feature_type, feature_name, feature_value, frame_number)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(segment_id, feature_type, feature_name)
             DO UPDATE SET feature_value = excluded.feature_value,
                           frame_number = excluded.frame_number",
            params![
                segment_id,
                FEATURE_TYPE_VISUAL,
                name,
                blob,
                frame_number.map(|f| f as i64)
            ],
        )?;
        Ok(())
    }

    pub fn load_vector_feature(&self, segment_id: i64, name: &str) -> Result<Option<Vec<f32>>> {
        let blob: Option<Vec<u8>> = self
            .lock()
            .query_row(
                "SELECT feature_value FROM segment_features
                 WHERE segment_id = ? AND feature_type = ? AND feature_name = ?",
                params![segment_id, FEATURE_TYPE_VISUAL, name],
                |row| row.get(0),
            )
            .optional()?;
        let Some(blob) = blob else { return Ok(None) };
        let envelope: FeatureBlob = serde_json::from_slice(&blob)?;
        check_version(envelope.version, segment_id, name)?;
        Ok(Some(envelope.values))
    }

    pub fn store_concept_scores(
        &self,
        segment_id: i64,
        scores: &HashMap<String, f64>,
    ) -> Result<()> {
        let blob = serde_json::to_vec(&ConceptBlob::new(scores.clone()))?;
        self.lock().execute(
            "INSERT INTO segment_features
                 (segment_id, feature_type, feature_name, feature_value)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(segment_id, feature_type, feature_name)
             DO UPDATE SET feature_value = excluded.feature_value",
            params![segment_id, FEATURE_TYPE_VISUAL, FEATURE_CONCEPTS, blob],
        )?;
        Ok(())
    }

    pub fn load_concept_scores(&self, segment_id: i64) -> Result<Option<HashMap<String, f64>>> {
        let blob: Option<Vec<u8>> = self
            .lock()
            .query_row(
                "SELECT feature_value FROM segment_features
                 WHERE segment_id = ? AND feature_type = ? AND feature_name = ?",
                params![segment_id, FEATURE_TYPE_VISUAL, FEATURE_CONCEPTS],
                |row| row.get(0),
            )
            .optional()?;
        let Some(blob) = blob else { return Ok(None) };
        let envelope: ConceptBlob = serde_json::from_slice(&blob)?;
        check_version(envelope.version, segment_id, FEATURE_CONCEPTS)?;
        Ok(Some(envelope.scores))
    }

    pub fn delete_features_for_segment(&self, segment_id: i64) -> Result<usize> {
        let count = self.lock().execute(
            "DELETE FROM segment_features WHERE segment_id = ?",
            [segment_id],
        )?;
        Ok(count)
    }
}
