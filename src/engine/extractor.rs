//! Embedding-backend boundary
//!
//! The face detection/embedding model is an external collaborator: the core
//! only ever calls `image -> faces`. Implementations run blocking inference
//! and are invoked from `spawn_blocking` tasks.

use anyhow::Result;
use image::DynamicImage;
use serde::{Deserialize, Serialize};

/// Axis-aligned face bounding box in original-image coordinates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

/// A detected face: bounding box, 5-point landmarks, and an L2-normalized
/// embedding vector (512 dimensions in the reference configuration).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Face {
    pub bbox: BoundingBox,
    pub landmarks: Vec<(f32, f32)>,
    pub embedding: Vec<f32>,
    pub confidence: f32,
}

/// Model and device information surfaced by `/health` and `/status`.
#[derive(Debug, Clone, Serialize)]
pub struct ExtractorInfo {
    pub model_name: String,
    pub model_loaded: bool,
    pub using_gpu: bool,
    pub device_info: String,
}

/// The embedding backend seam.
///
/// Implementations must be thread-safe; `extract` is called concurrently
/// from multiple workers and must not retain per-call state.
pub trait FaceExtractor: Send + Sync {
    /// Detect faces and compute one embedding per face.
    ///
    /// An image with no detectable faces is an empty `Ok`, not an error.
    fn extract(&self, image: &DynamicImage) -> Result<Vec<Face>>;

    fn info(&self) -> ExtractorInfo;

    /// Whether inference runs on an accelerator. Drives the batch
    /// scheduler's sequential fallback.
    fn is_accelerated(&self) -> bool;

    /// Health probe for the `/health` endpoint.
    fn ready(&self) -> Result<()> {
        Ok(())
    }
}

/// Extractor that never detects a face.
///
/// Always available: used when the service is built without the `openvino`
/// feature, and as a stand-in in tests.
pub struct NoopExtractor {
    dimension: usize,
}

impl NoopExtractor {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }
}

impl FaceExtractor for NoopExtractor {
    fn extract(&self, _image: &DynamicImage) -> Result<Vec<Face>> {
        Ok(Vec::new())
    }

    fn info(&self) -> ExtractorInfo {
        ExtractorInfo {
            model_name: "noop".to_string(),
            model_loaded: false,
            using_gpu: false,
            device_info: "cpu".to_string(),
        }
    }

    fn is_accelerated(&self) -> bool {
        false
    }
}
