use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use time::PrimitiveDateTime;

use crate::db::types::{ArtifactState, FailureKind, ProtocolStep, SubmissionState};

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct Artifact {
    pub(crate) id: String,
    pub(crate) register_number: String,
    pub(crate) subject_code: String,
    pub(crate) exam_session: String,
    pub(crate) original_filename: String,
    pub(crate) file_extension: String,
    pub(crate) mime_type: String,
    pub(crate) file_size_bytes: i64,
    pub(crate) file_hash: String,
    pub(crate) storage_ref: String,
    pub(crate) state: ArtifactState,
    pub(crate) uploaded_by: String,
    pub(crate) uploaded_at: PrimitiveDateTime,
    pub(crate) updated_at: PrimitiveDateTime,
}

#[derive(Debug, Clone, FromRow)]
pub(crate) struct SubmissionRequest {
    pub(crate) id: String,
    pub(crate) artifact_id: String,
    pub(crate) student_token_enc: Vec<u8>,
    pub(crate) requested_by: String,
    pub(crate) state: SubmissionState,
    pub(crate) attempt_count: i32,
    pub(crate) resume_step: ProtocolStep,
    pub(crate) next_attempt_at: Option<PrimitiveDateTime>,
    pub(crate) lease_id: Option<String>,
    pub(crate) lease_owner: Option<String>,
    pub(crate) lease_expires_at: Option<PrimitiveDateTime>,
    pub(crate) file_handle: Option<i64>,
    pub(crate) handle_obtained_at: Option<PrimitiveDateTime>,
    pub(crate) cancel_requested: bool,
    pub(crate) last_failure_kind: Option<FailureKind>,
    pub(crate) last_failure_reason: Option<String>,
    pub(crate) result_detail: Option<String>,
    pub(crate) created_at: PrimitiveDateTime,
    pub(crate) last_attempt_at: Option<PrimitiveDateTime>,
    pub(crate) updated_at: PrimitiveDateTime,
    pub(crate) completed_at: Option<PrimitiveDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct SubjectMapping {
    pub(crate) subject_code: String,
    pub(crate) lms_course_id: Option<i64>,
    pub(crate) lms_assignment_id: i64,
    pub(crate) assignment_name: Option<String>,
    pub(crate) source: String,
    pub(crate) is_active: bool,
    pub(crate) created_at: PrimitiveDateTime,
    pub(crate) updated_at: PrimitiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct AuditEvent {
    pub(crate) id: i64,
    pub(crate) occurred_at: PrimitiveDateTime,
    pub(crate) actor_ref: String,
    pub(crate) entity_ref: String,
    pub(crate) event_type: String,
    pub(crate) before_state: Option<String>,
    pub(crate) after_state: Option<String>,
    pub(crate) detail: Json<serde_json::Value>,
}
