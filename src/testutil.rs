//! Shared fixtures for unit tests.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use image::{Rgb, RgbImage};

use crate::db::Database;
use crate::embed::{color_histogram, Embedder, FrameDescriptor};
use crate::error::PipelineError;
use crate::source::{FrameSource, SourceOpener, VideoProperties};

pub fn test_db() -> Database {
    let db = Database::open_in_memory().unwrap();
    db.initialize().unwrap();
    db
}

/// Scripted footage: uniform gray shots separated by hard cuts.
///
/// Every frame inside a shot has one luma value, so any cut whose luma delta
/// exceeds the pixel threshold registers as a full-frame change.
#[derive(Clone)]
pub struct SyntheticSource {
    props: VideoProperties,
    /// (first_frame, luma) per shot, ascending by first_frame.
    shots: Vec<(u64, u8)>,
    /// Frames handed out via read_gray, shared across clones.
    pub gray_reads: Arc<Mutex<Vec<u64>>>,
}

impl SyntheticSource {
    pub fn new(frame_count: u64, fps: f64, shots: Vec<(u64, u8)>) -> Self {
        Self {
            props: VideoProperties {
                width: 640,
                height: 360,
                fps,
                frame_count,
                has_audio: false,
            },
            shots,
            gray_reads: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn luma_at(&self, frame_number: u64) -> u8 {
        self.shots
            .iter()
            .rev()
            .find(|(start, _)| *start <= frame_number)
            .map(|(_, luma)| *luma)
            .unwrap_or(0)
    }
}

impl FrameSource for SyntheticSource {
    fn properties(&self) -> &VideoProperties {
        &self.props
    }

    fn read_gray(
        &mut self,
        frame_number: u64,
        width: u32,
        height: u32,
    ) -> Result<Vec<u8>, PipelineError> {
        if frame_number >= self.props.frame_count {
            return Err(PipelineError::Decode {
                frame: frame_number,
                reason: "past end of stream".to_string(),
            });
        }
        self.gray_reads.lock().unwrap().push(frame_number);
        Ok(vec![self.luma_at(frame_number); (width * height) as usize])
    }

    fn read_rgb(&mut self, frame_number: u64) -> Result<RgbImage, PipelineError> {
        if frame_number >= self.props.frame_count {
            return Err(PipelineError::Decode {
                frame: frame_number,
                reason: "past end of stream".to_string(),
            });
        }
        let luma = self.luma_at(frame_number);
        Ok(RgbImage::from_pixel(64, 36, Rgb([luma, luma, luma])))
    }
}

/// Opener handing out clones of one synthetic source regardless of path.
pub struct SyntheticOpener {
    pub source: SyntheticSource,
}

impl SourceOpener for SyntheticOpener {
    fn open(&self, _path: &Path) -> Result<Box<dyn FrameSource>, PipelineError> {
        Ok(Box::new(self.source.clone()))
    }
}

/// Embedder that derives everything from the frame's mean luma, so tests get
/// deterministic descriptors without a model service.
pub struct StubEmbedder {
    /// Fixed concept scores returned for every frame; when empty, "bright"
    /// and "dark" are derived from the luma instead.
    pub scores: HashMap<String, f64>,
    /// When set, every describe call fails with this message.
    pub fail_with: Option<String>,
}

impl Default for StubEmbedder {
    fn default() -> Self {
        Self {
            scores: HashMap::new(),
            fail_with: None,
        }
    }
}

impl Embedder for StubEmbedder {
    fn describe(&self, image: &RgbImage) -> Result<FrameDescriptor, PipelineError> {
        if let Some(message) = &self.fail_with {
            return Err(PipelineError::Extraction(message.clone()));
        }
        let total: f64 = image
            .pixels()
            .map(|p| (p[0] as f64 + p[1] as f64 + p[2] as f64) / 3.0)
            .sum();
        let mean = total / (image.width() as f64 * image.height() as f64);
        let brightness = mean / 255.0;

        let concept_scores = if self.scores.is_empty() {
            let mut scores = HashMap::new();
            scores.insert("bright".to_string(), brightness * 100.0);
            scores.insert("dark".to_string(), (1.0 - brightness) * 100.0);
            scores
        } else {
            self.scores.clone()
        };

        Ok(FrameDescriptor {
            vector: vec![brightness as f32, 1.0 - brightness as f32],
            histogram: color_histogram(image),
            concept_scores,
        })
    }
}
