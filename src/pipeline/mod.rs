//! The processing pipeline: scene detection, feature extraction and the
//! coordinator that drives files through both stages.

pub mod coordinator;
pub mod features;
pub mod scenes;
pub mod similarity;

pub use coordinator::{Coordinator, PipelineStatus};
pub use features::{ExtractionSummary, FeatureExtractor};
pub use scenes::{Scene, SceneSegmenter};
