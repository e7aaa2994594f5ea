//! Stage-level error taxonomy.
//!
//! Errors are attributed at the narrowest scope that can name an entity
//! (segment or file), recorded on that entity's row, and re-raised only far
//! enough to abort the current stage. The worker loop itself never dies on a
//! per-file error.

use std::time::Duration;
use thiserror::Error;

/// Maximum length of an error message stored in a `last_error` column.
pub const MAX_STORED_ERROR_LEN: usize = 500;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("could not open media source {path}: {reason}")]
    SourceOpen { path: String, reason: String },

    #[error("could not decode frame {frame}: {reason}")]
    Decode { frame: u64, reason: String },

    #[error("feature extraction failed: {0}")]
    Extraction(String),

    #[error("persistence failure: {0}")]
    Persistence(#[from] rusqlite::Error),

    #[error("query deadline of {0:?} exceeded")]
    QueryTimeout(Duration),
}

/// Truncate an error message for storage in a `last_error` column.
pub fn truncate_error(message: &str) -> String {
    if message.len() <= MAX_STORED_ERROR_LEN {
        return message.to_string();
    }
    let mut end = MAX_STORED_ERROR_LEN;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    message[..end].to_string()
}
