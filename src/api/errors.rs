use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::services::artifact_registry::RegistryError;
use crate::services::assignment_mapping::MappingError;
use crate::services::filename::InvalidFilename;
use crate::services::submission_queue::QueueError;

#[derive(Debug, Serialize)]
struct ErrorResponse {
    status: u16,
    detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    request_id: Option<String>,
}

#[derive(Debug)]
pub(crate) enum ApiError {
    Unauthorized(&'static str),
    Forbidden(&'static str),
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    /// Single-flight conflict; carries the request that already owns the artifact.
    InFlight { detail: String, request_id: String },
    PayloadTooLarge(String),
    TooManyRequests(&'static str),
    ServiceUnavailable(String),
    Internal(String),
}

impl ApiError {
    /// Log the underlying error with context and return an `Internal` variant.
    pub(crate) fn internal(err: impl std::fmt::Display, context: &str) -> Self {
        tracing::error!(error = %err, "{context}");
        Self::Internal(context.to_string())
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) | Self::InFlight { .. } => StatusCode::CONFLICT,
            Self::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::TooManyRequests(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (detail, request_id) = match self {
            ApiError::Unauthorized(message) => {
                let body = ErrorResponse {
                    status: status.as_u16(),
                    detail: message.to_string(),
                    request_id: None,
                };
                let mut response = (status, Json(body)).into_response();
                response
                    .headers_mut()
                    .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
                return response;
            }
            ApiError::Forbidden(message) | ApiError::TooManyRequests(message) => {
                (message.to_string(), None)
            }
            ApiError::BadRequest(message)
            | ApiError::NotFound(message)
            | ApiError::Conflict(message)
            | ApiError::PayloadTooLarge(message) => (message, None),
            ApiError::InFlight { detail, request_id } => (detail, Some(request_id)),
            ApiError::ServiceUnavailable(message) => {
                tracing::error!(error = %message, "Service unavailable");
                (message, None)
            }
            ApiError::Internal(message) => {
                tracing::error!(error = %message, "Internal server error");
                (message, None)
            }
        };

        (status, Json(ErrorResponse { status: status.as_u16(), detail, request_id }))
            .into_response()
    }
}

impl From<InvalidFilename> for ApiError {
    fn from(err: InvalidFilename) -> Self {
        Self::BadRequest(err.to_string())
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::DuplicateArtifact { .. } => Self::Conflict(err.to_string()),
            RegistryError::NotFound(_) => Self::NotFound("Artifact not found".to_string()),
            RegistryError::InvalidTransition { .. } => Self::Conflict(err.to_string()),
            RegistryError::InFlight { ref request_id, .. } => {
                Self::InFlight { request_id: request_id.clone(), detail: err.to_string() }
            }
            RegistryError::Audit(err) => {
                tracing::error!(error = %err, "Audit write failed; transition rejected");
                Self::ServiceUnavailable("Audit trail unavailable".to_string())
            }
            RegistryError::Database(err) => Self::internal(err, "Artifact store error"),
        }
    }
}

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::ArtifactNotFound(_) => Self::NotFound("Artifact not found".to_string()),
            QueueError::NotFound(_) => Self::NotFound("Submission not found".to_string()),
            QueueError::NotSubmittable { .. } => Self::Conflict(err.to_string()),
            QueueError::AlreadyInFlight { ref request_id, .. } => {
                Self::InFlight { request_id: request_id.clone(), detail: err.to_string() }
            }
            QueueError::AdmissionContended(_) | QueueError::LeaseLost(_) => {
                Self::Conflict(err.to_string())
            }
            QueueError::Audit(err) => {
                tracing::error!(error = %err, "Audit write failed; transition rejected");
                Self::ServiceUnavailable("Audit trail unavailable".to_string())
            }
            QueueError::Cipher(err) => Self::internal(err, "Failed to seal student token"),
            QueueError::Database(err) => Self::internal(err, "Submission store error"),
        }
    }
}

impl From<MappingError> for ApiError {
    fn from(err: MappingError) -> Self {
        match err {
            MappingError::Unmapped(_) => Self::NotFound(err.to_string()),
            MappingError::Discovery(failure) if failure.is_transient() => {
                Self::ServiceUnavailable(format!("LMS unavailable: {}", failure.reason))
            }
            MappingError::Discovery(failure) => {
                Self::internal(failure.reason, "Assignment discovery failed")
            }
            MappingError::Database(err) => Self::internal(err, "Mapping store error"),
        }
    }
}
