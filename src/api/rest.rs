//! Axum REST API handlers

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::error::ServiceError;
use crate::service::types::Candidate;
use crate::service::FaceService;

use super::dto::*;

pub const SERVICE_NAME: &str = "face-recognition";

/// Application state shared across handlers
pub struct AppState {
    pub service: Arc<FaceService>,
}

/// Create the REST API router
pub fn create_rest_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/process-photo", post(process_photo_handler))
        .route("/compare-faces", post(compare_faces_handler))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check with accelerator status
async fn health_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<HealthResponse>, (StatusCode, Json<serde_json::Value>)> {
    match state.service.health() {
        Ok(health) => Ok(Json(HealthResponse {
            status: "healthy".to_string(),
            service: SERVICE_NAME.to_string(),
            gpu_acceleration: health.gpu_acceleration,
            device: health.device,
            model_loaded: health.model_loaded,
        })),
        Err(e) => {
            error!("Health check failed: {e}");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "status": "unhealthy",
                    "error": e.to_string(),
                    "service": SERVICE_NAME,
                })),
            ))
        }
    }
}

/// Detailed system status
async fn status_handler(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let status = state.service.status();
    Json(StatusResponse {
        success: true,
        model_info: status.model_info,
        performance_stats: status.performance_stats,
        similarity_calculator: status.similarity_calculator,
    })
}

/// Process a photo and extract face embeddings
async fn process_photo_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ProcessPhotoRequest>,
) -> Result<Json<ProcessPhotoResponse>, ServiceError> {
    let reference = request.reference().ok_or_else(|| {
        ServiceError::Validation("file_reference or photoPath is required".to_string())
    })?;

    let faces = state.service.process_photo(reference).await?;

    Ok(Json(ProcessPhotoResponse {
        success: true,
        faces: faces.iter().map(FaceDto::from).collect(),
    }))
}

/// Compare a selfie with caller-supplied face embeddings
async fn compare_faces_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CompareFacesRequest>,
) -> Result<Json<CompareFacesResponse>, ServiceError> {
    let selfie_data = request
        .selfie_data
        .as_deref()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            ServiceError::Validation("selfieData and embeddings are required".to_string())
        })?;
    let embeddings = request
        .embeddings
        .filter(|e| !e.is_empty())
        .ok_or_else(|| {
            ServiceError::Validation("selfieData and embeddings are required".to_string())
        })?;

    let candidates: Vec<Candidate> = embeddings
        .into_iter()
        .map(|c| Candidate {
            photo_id: c.photo_id,
            embedding: c.embedding,
        })
        .collect();

    let matches = state.service.compare_faces(selfie_data, &candidates).await?;

    Ok(Json(CompareFacesResponse {
        success: true,
        matches: matches
            .into_iter()
            .map(|m| MatchDto {
                photo_id: m.photo_id,
                similarity: m.similarity,
            })
            .collect(),
    }))
}
