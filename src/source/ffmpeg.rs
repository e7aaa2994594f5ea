//! ffmpeg/ffprobe-backed frame source.
//!
//! Frames are pulled one at a time with an input seek, which is accurate
//! enough at the pipeline's sampling granularity and keeps no decoder state
//! in-process.

use std::path::{Path, PathBuf};
use std::process::Command;

use image::RgbImage;
use serde::Deserialize;
use tracing::debug;

use super::{FrameSource, SourceOpener, VideoProperties};
use crate::error::PipelineError;

#[derive(Debug, Clone)]
pub struct FfmpegOpener {
    ffmpeg_bin: String,
    ffprobe_bin: String,
}

impl Default for FfmpegOpener {
    fn default() -> Self {
        Self {
            ffmpeg_bin: "ffmpeg".to_string(),
            ffprobe_bin: "ffprobe".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    nb_frames: Option<String>,
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

/// Parse ffprobe's "30000/1001" rate notation.
fn parse_rate(rate: &str) -> Option<f64> {
    match rate.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.parse().ok()?;
            let den: f64 = den.parse().ok()?;
            if den > 0.0 {
                Some(num / den)
            } else {
                None
            }
        }
        None => rate.parse().ok(),
    }
}

impl FfmpegOpener {
    fn probe(&self, path: &Path) -> Result<VideoProperties, PipelineError> {
        let source_err = |reason: String| PipelineError::SourceOpen {
            path: path.display().to_string(),
            reason,
        };

        let output = Command::new(&self.ffprobe_bin)
            .args([
                "-v",
                "error",
                "-print_format",
                "json",
                "-show_streams",
                "-show_format",
            ])
            .arg(path)
            .output()
            .map_err(|e| source_err(format!("ffprobe failed to start: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(source_err(format!("ffprobe: {}", stderr.trim())));
        }

        let probe: ProbeOutput = serde_json::from_slice(&output.stdout)
            .map_err(|e| source_err(format!("unparseable ffprobe output: {e}")))?;

        let video = probe
            .streams
            .iter()
            .find(|s| s.codec_type.as_deref() == Some("video"))
            .ok_or_else(|| source_err("no video stream".to_string()))?;
        let has_audio = probe
            .streams
            .iter()
            .any(|s| s.codec_type.as_deref() == Some("audio"));

        let fps = video
            .r_frame_rate
            .as_deref()
            .and_then(parse_rate)
            .filter(|fps| *fps > 0.0)
            .ok_or_else(|| source_err("no usable frame rate".to_string()))?;

        // nb_frames is absent in many containers; fall back to duration * fps.
        let frame_count = match video.nb_frames.as_deref().and_then(|n| n.parse().ok()) {
            Some(n) if n > 0 => n,
            _ => {
                let duration: f64 = video
                    .duration
                    .as_deref()
                    .or(probe.format.as_ref().and_then(|f| f.duration.as_deref()))
                    .and_then(|d| d.parse().ok())
                    .ok_or_else(|| source_err("no duration".to_string()))?;
                (duration * fps).floor() as u64
            }
        };

        Ok(VideoProperties {
            width: video.width.unwrap_or(0),
            height: video.height.unwrap_or(0),
            fps,
            frame_count,
            has_audio,
        })
    }
}

impl SourceOpener for FfmpegOpener {
    fn open(&self, path: &Path) -> Result<Box<dyn FrameSource>, PipelineError> {
        let props = self.probe(path)?;
        debug!(
            path = %path.display(),
            fps = props.fps,
            frames = props.frame_count,
            "opened media source"
        );
        Ok(Box::new(FfmpegSource {
            path: path.to_path_buf(),
            ffmpeg_bin: self.ffmpeg_bin.clone(),
            props,
        }))
    }
}

pub struct FfmpegSource {
    path: PathBuf,
    ffmpeg_bin: String,
    props: VideoProperties,
}

impl FfmpegSource {
    fn read_raw(
        &self,
        frame_number: u64,
        pix_fmt: &str,
        width: u32,
        height: u32,
        bytes_per_pixel: usize,
    ) -> Result<Vec<u8>, PipelineError> {
        let decode_err = |reason: String| PipelineError::Decode {
            frame: frame_number,
            reason,
        };

        let timestamp = frame_number as f64 / self.props.fps;
        let output = Command::new(&self.ffmpeg_bin)
            .args(["-v", "error", "-ss", &format!("{timestamp:.6}"), "-i"])
            .arg(&self.path)
            .args([
                "-frames:v",
                "1",
                "-f",
                "rawvideo",
                "-pix_fmt",
                pix_fmt,
                "-s",
                &format!("{width}x{height}"),
                "pipe:1",
            ])
            .output()
            .map_err(|e| decode_err(format!("ffmpeg failed to start: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(decode_err(format!("ffmpeg: {}", stderr.trim())));
        }

        let expected = width as usize * height as usize * bytes_per_pixel;
        if output.stdout.len() != expected {
            return Err(decode_err(format!(
                "got {} bytes, expected {}",
                output.stdout.len(),
                expected
            )));
        }
        Ok(output.stdout)
    }
}

impl FrameSource for FfmpegSource {
    fn properties(&self) -> &VideoProperties {
        &self.props
    }

    fn read_gray(
        &mut self,
        frame_number: u64,
        width: u32,
        height: u32,
    ) -> Result<Vec<u8>, PipelineError> {
        self.read_raw(frame_number, "gray", width, height, 1)
    }

    fn read_rgb(&mut self, frame_number: u64) -> Result<RgbImage, PipelineError> {
        let (width, height) = (self.props.width, self.props.height);
        let raw = self.read_raw(frame_number, "rgb24", width, height, 3)?;
        RgbImage::from_raw(width, height, raw).ok_or(PipelineError::Decode {
            frame: frame_number,
            reason: "rgb buffer size mismatch".to_string(),
        })
    }
}
