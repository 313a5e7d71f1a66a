//! Service layer types

use serde::{Deserialize, Serialize};

use crate::engine::{ExtractorInfo, PoolStats};
use crate::similarity::SimilarityInfo;

/// A stored embedding to compare the selfie against. The caller supplies
/// and retains these; the service never persists them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub photo_id: String,
    pub embedding: Vec<f32>,
}

/// One similarity score, paired with the candidate's id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceMatch {
    pub photo_id: String,
    pub similarity: f32,
}

/// Health check result
#[derive(Debug, Clone, Serialize)]
pub struct HealthInfo {
    pub gpu_acceleration: bool,
    pub device: String,
    pub model_loaded: bool,
}

/// Detailed system status
#[derive(Debug, Clone, Serialize)]
pub struct StatusInfo {
    pub model_info: ExtractorInfo,
    pub performance_stats: PoolStats,
    pub similarity_calculator: SimilarityInfo,
}
