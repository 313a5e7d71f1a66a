//! Service error taxonomy and HTTP mapping
//!
//! `JobError` travels inside job results: every per-job failure is captured
//! by the worker and delivered as a value, never raised across the worker
//! boundary. `ServiceError` is the endpoint-level taxonomy and carries its
//! own HTTP translation.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// A per-job processing failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobError {
    /// Remote fetch, image lookup, or local read failed.
    #[error("{0}")]
    Upstream(String),
    /// The acquired bytes are not a decodable image.
    #[error("image decode failed: {0}")]
    Decode(String),
    /// The embedding backend rejected the image.
    #[error("embedding backend failed: {0}")]
    Backend(String),
}

/// Endpoint-level errors.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// Missing or malformed request fields.
    #[error("{0}")]
    Validation(String),
    /// Queue at or over the overload threshold, or the buffer stayed full
    /// past the enqueue timeout.
    #[error("Service overloaded, please try again later")]
    Overloaded,
    /// No result arrived within the await window. The worker keeps running;
    /// its eventual result is discarded.
    #[error("Processing timeout")]
    Timeout,
    /// A job completed with an error result.
    #[error(transparent)]
    Job(#[from] JobError),
    /// Last-resort path for failures not anticipated above.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ServiceError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::Validation(_) => StatusCode::BAD_REQUEST,
            ServiceError::Overloaded => StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ServiceError::Job(_) | ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        // Job failures keep the `{success: false, error}` wire shape; every
        // other error is a plain `{error}` body.
        let body = match &self {
            ServiceError::Job(e) => json!({ "success": false, "error": e.to_string() }),
            other => json!({ "error": other.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            ServiceError::Validation("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ServiceError::Overloaded.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(ServiceError::Timeout.status_code(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            ServiceError::Job(JobError::Decode("bad".into())).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_overload_message() {
        assert_eq!(
            ServiceError::Overloaded.to_string(),
            "Service overloaded, please try again later"
        );
        assert_eq!(ServiceError::Timeout.to_string(), "Processing timeout");
    }

    #[test]
    fn test_job_error_display() {
        let e = JobError::Upstream("remote fetch failed: 404".into());
        assert_eq!(e.to_string(), "remote fetch failed: 404");

        let e = JobError::Decode("unsupported format".into());
        assert!(e.to_string().starts_with("image decode failed"));
    }
}
