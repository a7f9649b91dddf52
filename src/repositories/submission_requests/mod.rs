mod commands;
mod queries;
mod types;

pub(crate) use commands::{
    claim_next, enter_step, insert_if_none_active, mark_failed, mark_submitted, record_handle,
    release_lease, request_cancel, schedule_retry,
};
pub(crate) use queries::{
    count_stuck, find_active_for_artifact, find_by_id, list_by_artifact, lock_by_id,
};
pub(crate) use types::{ClaimedRow, CreateSubmissionRequest, FailureUpdate, LeaseGrant};
