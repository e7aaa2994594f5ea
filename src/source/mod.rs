//! Media source access.
//!
//! The pipeline never touches decoders directly; it reads frames through the
//! [`FrameSource`] trait so tests can feed synthetic footage and the worker
//! can swap decoding backends without changes elsewhere.

pub mod ffmpeg;

use std::path::{Path, PathBuf};

use image::RgbImage;
use walkdir::WalkDir;

use crate::error::PipelineError;

pub use ffmpeg::FfmpegOpener;

/// Stream metadata for an opened source.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoProperties {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub frame_count: u64,
    pub has_audio: bool,
}

impl VideoProperties {
    pub fn duration_secs(&self) -> f64 {
        if self.fps > 0.0 {
            self.frame_count as f64 / self.fps
        } else {
            0.0
        }
    }
}

/// Random access to the frames of one media file.
pub trait FrameSource: Send {
    fn properties(&self) -> &VideoProperties;

    /// Read one frame as grayscale, scaled to the given analysis size.
    /// Row-major, one byte per pixel.
    fn read_gray(
        &mut self,
        frame_number: u64,
        width: u32,
        height: u32,
    ) -> Result<Vec<u8>, PipelineError>;

    /// Read one frame at native resolution for feature extraction.
    fn read_rgb(&mut self, frame_number: u64) -> Result<RgbImage, PipelineError>;
}

/// Opens paths into frame sources.
pub trait SourceOpener: Send + Sync {
    fn open(&self, path: &Path) -> Result<Box<dyn FrameSource>, PipelineError>;
}

/// Recursively find media files under `dir` with one of the given
/// extensions (lowercase, without dot). Results are sorted for stable
/// queue order across runs.
pub fn discover_media(dir: &Path, extensions: &[String]) -> Vec<PathBuf> {
    let mut found: Vec<PathBuf> = WalkDir::new(dir)
        .follow_links(true)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            entry
                .path()
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| {
                    let ext = ext.to_ascii_lowercase();
                    extensions.iter().any(|want| want == &ext)
                })
                .unwrap_or(false)
        })
        .map(|entry| entry.into_path())
        .collect();
    found.sort();
    found
}
