//! REST API request/response data transfer objects
//!
//! Field names follow the wire format of the original photo-matching
//! clients: `photoId`, `selfieData`, and the legacy `photoPath` alias.

use serde::{Deserialize, Serialize};

use crate::engine::Face;

/// Process-photo request
#[derive(Debug, Deserialize)]
pub struct ProcessPhotoRequest {
    pub file_reference: Option<String>,
    /// Legacy alias for `file_reference`.
    #[serde(rename = "photoPath")]
    pub photo_path: Option<String>,
}

impl ProcessPhotoRequest {
    pub fn reference(&self) -> Option<&str> {
        self.file_reference
            .as_deref()
            .or(self.photo_path.as_deref())
    }
}

/// Process-photo response
#[derive(Debug, Serialize)]
pub struct ProcessPhotoResponse {
    pub success: bool,
    pub faces: Vec<FaceDto>,
}

#[derive(Debug, Serialize)]
pub struct FaceDto {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
    pub landmarks: Vec<LandmarkDto>,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Serialize)]
pub struct LandmarkDto {
    pub x: f32,
    pub y: f32,
}

impl From<&Face> for FaceDto {
    fn from(face: &Face) -> Self {
        Self {
            x1: face.bbox.x1,
            y1: face.bbox.y1,
            x2: face.bbox.x2,
            y2: face.bbox.y2,
            confidence: face.confidence,
            landmarks: face
                .landmarks
                .iter()
                .map(|&(x, y)| LandmarkDto { x, y })
                .collect(),
            embedding: face.embedding.clone(),
        }
    }
}

/// Compare-faces request
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompareFacesRequest {
    /// Base64 image, optionally `data:...;base64,` prefixed.
    pub selfie_data: Option<String>,
    pub embeddings: Option<Vec<CandidateDto>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateDto {
    pub photo_id: String,
    pub embedding: Vec<f32>,
}

/// Compare-faces response, sorted by similarity descending
#[derive(Debug, Serialize)]
pub struct CompareFacesResponse {
    pub success: bool,
    pub matches: Vec<MatchDto>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchDto {
    pub photo_id: String,
    pub similarity: f32,
}

/// Health response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub gpu_acceleration: bool,
    pub device: String,
    pub model_loaded: bool,
}

/// Status response
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub success: bool,
    pub model_info: crate::engine::ExtractorInfo,
    pub performance_stats: crate::engine::PoolStats,
    pub similarity_calculator: crate::similarity::SimilarityInfo,
}
