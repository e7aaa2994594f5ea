use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Immutable application configuration.
///
/// Every threshold, interval and batch size used by the pipeline lives here
/// and is handed to components at construction. Nothing reads mutable
/// process-global settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default = "default_media_dir")]
    pub media_dir: PathBuf,

    #[serde(default)]
    pub segmenter: SegmenterConfig,

    #[serde(default)]
    pub features: FeatureConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub retrieval: RetrievalConfig,

    #[serde(default)]
    pub embedder: EmbedderConfig,
}

/// Scene detection parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmenterConfig {
    /// Sampled positions per second of video. Full-rate inspection is too
    /// costly; 6/s catches cuts without reading every frame.
    #[serde(default = "default_samples_per_second")]
    pub samples_per_second: f64,

    /// Fraction of changed pixels above which a sampled position is a scene
    /// boundary.
    #[serde(default = "default_change_threshold")]
    pub change_threshold: f64,

    /// Per-pixel intensity delta (0-255) above which a pixel counts as
    /// changed.
    #[serde(default = "default_pixel_threshold")]
    pub pixel_threshold: u8,

    /// Frames are downscaled to this resolution before differencing.
    #[serde(default = "default_analysis_width")]
    pub analysis_width: u32,

    #[serde(default = "default_analysis_height")]
    pub analysis_height: u32,

    /// Scenes shorter than this are discarded.
    #[serde(default = "default_min_segment_secs")]
    pub min_segment_secs: f64,

    /// Scenes longer than this are split into consecutive sub-segments.
    #[serde(default = "default_max_segment_secs")]
    pub max_segment_secs: f64,
}

fn default_samples_per_second() -> f64 {
    6.0
}

fn default_change_threshold() -> f64 {
    0.15
}

fn default_pixel_threshold() -> u8 {
    30
}

fn default_analysis_width() -> u32 {
    320
}

fn default_analysis_height() -> u32 {
    180
}

fn default_min_segment_secs() -> f64 {
    1.0
}

fn default_max_segment_secs() -> f64 {
    15.0
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            samples_per_second: default_samples_per_second(),
            change_threshold: default_change_threshold(),
            pixel_threshold: default_pixel_threshold(),
            analysis_width: default_analysis_width(),
            analysis_height: default_analysis_height(),
            min_segment_secs: default_min_segment_secs(),
            max_segment_secs: default_max_segment_secs(),
        }
    }
}

/// Feature extraction parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureConfig {
    /// Frames sampled evenly across each segment.
    #[serde(default = "default_frames_per_segment")]
    pub frames_per_segment: usize,

    /// Averaged concept score (0-100) above which a `concept` tag is emitted.
    #[serde(default = "default_concept_tag_threshold")]
    pub concept_tag_threshold: f32,

    /// Number of `dominant_concept` tags always emitted per segment.
    #[serde(default = "default_dominant_tag_count")]
    pub dominant_tag_count: usize,
}

fn default_frames_per_segment() -> usize {
    5
}

fn default_concept_tag_threshold() -> f32 {
    50.0
}

fn default_dominant_tag_count() -> usize {
    3
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            frames_per_segment: default_frames_per_segment(),
            concept_tag_threshold: default_concept_tag_threshold(),
            dominant_tag_count: default_dominant_tag_count(),
        }
    }
}

/// Processing coordinator parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_media_extensions")]
    pub media_extensions: Vec<String>,

    /// Scene detection progress is checkpointed at least this often,
    /// expressed as a percentage of total frames.
    #[serde(default = "default_checkpoint_percent")]
    pub checkpoint_percent: f64,
}

fn default_media_extensions() -> Vec<String> {
    vec![
        "mp4".to_string(),
        "mov".to_string(),
        "avi".to_string(),
        "mkv".to_string(),
        "webm".to_string(),
    ]
}

fn default_checkpoint_percent() -> f64 {
    5.0
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            media_extensions: default_media_extensions(),
            checkpoint_percent: default_checkpoint_percent(),
        }
    }
}

/// Segment retrieval parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Deadline for similarity and tag queries. On expiry the query returns
    /// an empty result rather than blocking the caller.
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,

    /// Recently selected segment ids excluded from candidate pools.
    #[serde(default = "default_recent_window")]
    pub recent_window: usize,
}

fn default_query_timeout_ms() -> u64 {
    3000
}

fn default_recent_window() -> usize {
    10
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            query_timeout_ms: default_query_timeout_ms(),
            recent_window: default_recent_window(),
        }
    }
}

/// Embedding service connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbedderConfig {
    #[serde(default = "default_embedder_endpoint")]
    pub endpoint: String,

    #[serde(default)]
    pub api_key: Option<String>,
}

fn default_embedder_endpoint() -> String {
    "http://127.0.0.1:8192/v1/embed".to_string()
}

impl Default for EmbedderConfig {
    fn default() -> Self {
        Self {
            endpoint: default_embedder_endpoint(),
            api_key: None,
        }
    }
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("kaleido")
        .join("kaleido.db")
}

fn default_media_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("Movies")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            media_dir: default_media_dir(),
            segmenter: SegmenterConfig::default(),
            features: FeatureConfig::default(),
            pipeline: PipelineConfig::default(),
            retrieval: RetrievalConfig::default(),
            embedder: EmbedderConfig::default(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(config_path: &Path) -> Result<Self> {
        if config_path.exists() {
            let content = std::fs::read_to_string(config_path)?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path();

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;

        Ok(())
    }

    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("kaleido")
    }

    fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }
}

impl SegmenterConfig {
    /// Frames between analyzed samples at the given frame rate.
    pub fn sample_interval(&self, fps: f64) -> u64 {
        ((fps / self.samples_per_second) as u64).max(1)
    }

    /// Minimum segment length in frames at the given frame rate.
    pub fn min_segment_frames(&self, fps: f64) -> u64 {
        (self.min_segment_secs * fps) as u64
    }

    /// Maximum segment length in frames at the given frame rate.
    pub fn max_segment_frames(&self, fps: f64) -> u64 {
        ((self.max_segment_secs * fps) as u64).max(1)
    }
}
