use serde::Serialize;

use crate::core::time::format_primitive;
use crate::db::models::SubmissionRequest;
use crate::db::types::{FailureKind, ProtocolStep, SubmissionState};

/// Status view of a request. The sealed student token and lease internals stay server-side.
#[derive(Debug, Serialize)]
pub(crate) struct SubmissionResponse {
    pub(crate) id: String,
    pub(crate) artifact_id: String,
    pub(crate) state: SubmissionState,
    pub(crate) attempt_count: i32,
    pub(crate) resume_step: ProtocolStep,
    pub(crate) cancel_requested: bool,
    pub(crate) last_failure_kind: Option<FailureKind>,
    pub(crate) result_detail: Option<String>,
    pub(crate) next_attempt_at: Option<String>,
    pub(crate) created_at: String,
    pub(crate) updated_at: String,
    pub(crate) completed_at: Option<String>,
}

impl SubmissionResponse {
    pub(crate) fn from_db(request: SubmissionRequest) -> Self {
        Self {
            id: request.id,
            artifact_id: request.artifact_id,
            state: request.state,
            attempt_count: request.attempt_count,
            resume_step: request.resume_step,
            cancel_requested: request.cancel_requested,
            last_failure_kind: request.last_failure_kind,
            result_detail: request.result_detail,
            next_attempt_at: request.next_attempt_at.map(format_primitive),
            created_at: format_primitive(request.created_at),
            updated_at: format_primitive(request.updated_at),
            completed_at: request.completed_at.map(format_primitive),
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct SubmitAcceptedResponse {
    pub(crate) request_id: String,
    pub(crate) state: SubmissionState,
}

#[derive(Debug, Serialize)]
pub(crate) struct CancelResponse {
    pub(crate) outcome: &'static str,
    pub(crate) submission: SubmissionResponse,
}
