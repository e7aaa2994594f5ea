//! HTTP embedding backend.
//!
//! Frames are encoded as JPEG and posted to an embedding service that runs
//! the vision model out of process. The service scores the concept
//! vocabulary in the same request so one round trip covers everything the
//! model contributes; the color histogram is computed locally.

use std::collections::HashMap;
use std::io::Cursor;
use std::time::Duration;

use base64::prelude::*;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{color_histogram, Embedder, FrameDescriptor, CONCEPTS};
use crate::config::EmbedderConfig;
use crate::error::PipelineError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

pub struct RemoteEmbedder {
    endpoint: String,
    api_key: Option<String>,
    agent: ureq::Agent,
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    image: String,
    concepts: &'a [&'a str],
}

#[derive(Deserialize)]
struct EmbedResponse {
    embedding: Vec<f32>,
    #[serde(default)]
    concept_scores: HashMap<String, f64>,
}

impl RemoteEmbedder {
    pub fn new(config: &EmbedderConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(REQUEST_TIMEOUT)
            .build();
        Self {
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
            agent,
        }
    }

    fn encode_jpeg(image: &RgbImage) -> Result<String, PipelineError> {
        let mut buf = Cursor::new(Vec::new());
        image
            .write_to(&mut buf, image::ImageFormat::Jpeg)
            .map_err(|e| PipelineError::Extraction(format!("jpeg encode: {e}")))?;
        Ok(BASE64_STANDARD.encode(buf.into_inner()))
    }
}

impl Embedder for RemoteEmbedder {
    fn describe(&self, image: &RgbImage) -> Result<FrameDescriptor, PipelineError> {
        let body = EmbedRequest {
            image: Self::encode_jpeg(image)?,
            concepts: CONCEPTS,
        };

        let mut request = self.agent.post(&self.endpoint);
        if let Some(key) = &self.api_key {
            request = request.set("Authorization", &format!("Bearer {key}"));
        }
        let response: EmbedResponse = request
            .send_json(&body)
            .map_err(|e| PipelineError::Extraction(format!("embedding request: {e}")))?
            .into_json()
            .map_err(|e| PipelineError::Extraction(format!("embedding response: {e}")))?;

        if response.embedding.is_empty() {
            return Err(PipelineError::Extraction(
                "embedding service returned an empty vector".to_string(),
            ));
        }
        debug!(dims = response.embedding.len(), "frame described");

        Ok(FrameDescriptor {
            vector: response.embedding,
            histogram: color_histogram(image),
            concept_scores: response.concept_scores,
        })
    }
}
