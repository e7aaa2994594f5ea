//! Frame description: embeddings, color histograms and concept scores.

pub mod remote;

use std::collections::HashMap;

use image::RgbImage;

use crate::error::PipelineError;

pub use remote::RemoteEmbedder;

/// Concept vocabulary scored for every frame. Tag derivation and concept
/// similarity both work over this fixed set.
pub const CONCEPTS: &[&str] = &[
    "daytime",
    "nighttime",
    "indoor",
    "outdoor",
    "urban",
    "nature",
    "water",
    "person",
    "vehicle",
    "building",
    "animal",
    "text",
    "food",
    "technology",
    "bright",
    "dark",
    "colorful",
    "monochrome",
];

/// Everything extracted from a single frame.
#[derive(Debug, Clone)]
pub struct FrameDescriptor {
    /// Embedding vector from the model backend.
    pub vector: Vec<f32>,
    /// Normalized color histogram, sums to 1 for non-empty frames.
    pub histogram: Vec<f32>,
    /// Concept name to score in [0, 100].
    pub concept_scores: HashMap<String, f64>,
}

/// Produces a [`FrameDescriptor`] for a frame image.
pub trait Embedder: Send + Sync {
    fn describe(&self, image: &RgbImage) -> Result<FrameDescriptor, PipelineError>;
}

/// Bins per color channel for the joint RGB histogram.
const HISTOGRAM_BINS: u32 = 8;

/// Joint RGB histogram with 8 bins per channel (512 total), normalized so
/// the bins sum to 1.
pub fn color_histogram(image: &RgbImage) -> Vec<f32> {
    let bins = HISTOGRAM_BINS as usize;
    let mut hist = vec![0f32; bins * bins * bins];
    let shift = 8 - HISTOGRAM_BINS.trailing_zeros();
    for pixel in image.pixels() {
        let r = (pixel[0] as u32 >> shift) as usize;
        let g = (pixel[1] as u32 >> shift) as usize;
        let b = (pixel[2] as u32 >> shift) as usize;
        hist[(r * bins + g) * bins + b] += 1.0;
    }
    let total = (image.width() as f32) * (image.height() as f32);
    if total > 0.0 {
        for bin in &mut hist {
            *bin /= total;
        }
    }
    hist
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_concept_vocabulary_size() {
        assert_eq!(CONCEPTS.len(), 18);
    }

    #[test]
    fn test_histogram_sums_to_one() {
        let mut img = RgbImage::new(16, 16);
        for (x, y, pixel) in img.enumerate_pixels_mut() {
            *pixel = Rgb([(x * 16) as u8, (y * 16) as u8, 128]);
        }
        let hist = color_histogram(&img);
        assert_eq!(hist.len(), 512);
        let sum: f32 = hist.iter().sum();
        assert!((sum - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_uniform_image_fills_one_bin() {
        let img = RgbImage::from_pixel(8, 8, Rgb([255, 0, 0]));
        let hist = color_histogram(&img);
        let nonzero: Vec<_> = hist.iter().filter(|v| **v > 0.0).collect();
        assert_eq!(nonzero.len(), 1);
        assert!((*nonzero[0] - 1.0).abs() < 1e-6);
    }
}
