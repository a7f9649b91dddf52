use time::PrimitiveDateTime;

use crate::db::models::SubmissionRequest;
use crate::db::types::{FailureKind, SubmissionState};

pub(crate) const COLUMNS: &str = "\
    id, artifact_id, student_token_enc, requested_by, state, attempt_count, resume_step, \
    next_attempt_at, lease_id, lease_owner, lease_expires_at, file_handle, handle_obtained_at, \
    cancel_requested, last_failure_kind, last_failure_reason, result_detail, created_at, \
    last_attempt_at, updated_at, completed_at";

pub(crate) struct CreateSubmissionRequest<'a> {
    pub(crate) id: &'a str,
    pub(crate) artifact_id: &'a str,
    pub(crate) student_token_enc: &'a [u8],
    pub(crate) requested_by: &'a str,
    pub(crate) created_at: PrimitiveDateTime,
}

pub(crate) struct LeaseGrant<'a> {
    pub(crate) lease_id: &'a str,
    pub(crate) owner: &'a str,
    pub(crate) now: PrimitiveDateTime,
    pub(crate) expires_at: PrimitiveDateTime,
}

pub(crate) struct FailureUpdate<'a> {
    pub(crate) kind: Option<FailureKind>,
    pub(crate) reason: &'a str,
    pub(crate) result_detail: &'a str,
    pub(crate) now: PrimitiveDateTime,
}

/// A request returned by a claim, with the state it had before the lease was granted.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ClaimedRow {
    pub(crate) prior_state: SubmissionState,
    pub(crate) prior_lease_id: Option<String>,
    #[sqlx(flatten)]
    pub(crate) request: SubmissionRequest,
}
