use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use sqlx::{PgConnection, PgPool};
use tokio::sync::watch;
use uuid::Uuid;

use crate::core::time::{add_seconds, primitive_now_utc};
use crate::db::models::SubmissionRequest;
use crate::db::types::{ProtocolStep, SubmissionState};
use crate::repositories::submission_requests::{self, FailureUpdate, LeaseGrant};
use crate::services::artifact_registry;
use crate::services::lms::{ExternalFailure, FileHandle};
use crate::services::retry_policy::RetryPolicy;
use crate::services::submission_protocol::{AttemptJournal, StepGate};

use super::outcome::{plan_failure, FailurePlan};
use super::{audit, QueueError};

/// Identifies the worker lease a write must still hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Lease {
    pub(crate) request_id: String,
    pub(crate) lease_id: String,
    pub(crate) owner: String,
}

#[derive(Debug)]
pub(crate) struct LeasedRequest {
    pub(crate) lease: Lease,
    pub(crate) request: SubmissionRequest,
    /// The previous holder's lease lapsed mid-attempt; remote progress is unknown.
    pub(crate) reclaimed: bool,
}

pub(crate) async fn claim_next(
    pool: &PgPool,
    owner: &str,
    lease_duration: Duration,
) -> Result<Option<LeasedRequest>, QueueError> {
    let now = primitive_now_utc();
    let lease_id = Uuid::new_v4().to_string();
    let mut tx = pool.begin().await?;

    let Some(claimed) = submission_requests::claim_next(
        &mut tx,
        LeaseGrant {
            lease_id: &lease_id,
            owner,
            now,
            expires_at: add_seconds(now, lease_duration.as_secs()),
        },
    )
    .await?
    else {
        return Ok(None);
    };

    let request = claimed.request;
    let reclaimed = claimed.prior_state.is_in_flight() || claimed.prior_lease_id.is_some();

    if reclaimed {
        audit(
            &mut tx,
            &request.id,
            owner,
            "lease_reclaimed",
            Some(request.state),
            Some(request.state),
            json!({ "attempt": request.attempt_count, "previous_lease": claimed.prior_lease_id }),
        )
        .await?;
    } else {
        audit(
            &mut tx,
            &request.id,
            owner,
            "attempt_started",
            None,
            None,
            json!({ "attempt": request.attempt_count, "resume_step": request.resume_step }),
        )
        .await?;
    }

    tx.commit().await?;

    if reclaimed {
        tracing::warn!(
            request_id = %request.id,
            state = request.state.as_str(),
            owner,
            "Reclaimed expired submission lease"
        );
    } else {
        metrics::counter!("submission_attempts_total").increment(1);
        tracing::info!(
            request_id = %request.id,
            attempt = request.attempt_count,
            resume_step = request.resume_step.as_str(),
            owner,
            "Submission attempt leased"
        );
    }

    Ok(Some(LeasedRequest {
        lease: Lease { request_id: request.id.clone(), lease_id, owner: owner.to_string() },
        request,
        reclaimed,
    }))
}

async fn lock_leased(
    conn: &mut PgConnection,
    lease: &Lease,
) -> Result<SubmissionRequest, QueueError> {
    let request = submission_requests::lock_by_id(conn, &lease.request_id)
        .await?
        .ok_or_else(|| QueueError::NotFound(lease.request_id.clone()))?;

    if request.lease_id.as_deref() != Some(lease.lease_id.as_str()) {
        return Err(QueueError::LeaseLost(lease.request_id.clone()));
    }
    Ok(request)
}

/// Journal that persists step boundaries for a leased request.
pub(crate) struct LeasedAttempt<'a> {
    pool: &'a PgPool,
    lease: &'a Lease,
    lease_duration: Duration,
    shutdown: watch::Receiver<bool>,
}

impl<'a> LeasedAttempt<'a> {
    pub(crate) fn new(
        pool: &'a PgPool,
        lease: &'a Lease,
        lease_duration: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self { pool, lease, lease_duration, shutdown }
    }
}

#[async_trait]
impl AttemptJournal for LeasedAttempt<'_> {
    type Error = QueueError;

    async fn enter_step(&mut self, step: ProtocolStep) -> Result<StepGate, QueueError> {
        if *self.shutdown.borrow() {
            return Ok(StepGate::ShuttingDown);
        }

        let now = primitive_now_utc();
        let mut tx = self.pool.begin().await?;
        let current = lock_leased(&mut tx, self.lease).await?;
        if current.cancel_requested {
            return Ok(StepGate::Cancelled);
        }

        let expires_at = add_seconds(now, self.lease_duration.as_secs());
        submission_requests::enter_step(&mut tx, &current.id, step, expires_at, now).await?;

        let target = step.state();
        if current.state != target || current.resume_step != step {
            audit(
                &mut tx,
                &current.id,
                &self.lease.owner,
                "step_started",
                Some(current.state),
                Some(target),
                json!({ "step": step, "attempt": current.attempt_count }),
            )
            .await?;
        }

        tx.commit().await?;
        tracing::debug!(request_id = %current.id, step = step.as_str(), "Entered protocol step");
        Ok(StepGate::Proceed)
    }

    async fn record_handle(&mut self, handle: FileHandle) -> Result<(), QueueError> {
        let now = primitive_now_utc();
        let mut tx = self.pool.begin().await?;
        let current = lock_leased(&mut tx, self.lease).await?;

        submission_requests::record_handle(&mut tx, &current.id, handle.0, now).await?;
        audit(
            &mut tx,
            &current.id,
            &self.lease.owner,
            "file_handle_recorded",
            None,
            None,
            json!({ "file_handle": handle.0 }),
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }
}

/// Terminal success. The artifact is marked submitted in the same transaction.
pub(crate) async fn complete(
    pool: &PgPool,
    lease: &Lease,
    already_submitted: bool,
) -> Result<SubmissionRequest, QueueError> {
    let now = primitive_now_utc();
    let mut tx = pool.begin().await?;
    let mut current = lock_leased(&mut tx, lease).await?;

    if current.state != SubmissionState::Submitting {
        let before = current.state;
        current = submission_requests::enter_step(
            &mut tx,
            &current.id,
            ProtocolStep::Submit,
            now,
            now,
        )
        .await?;
        audit(
            &mut tx,
            &current.id,
            &lease.owner,
            "step_started",
            Some(before),
            Some(SubmissionState::Submitting),
            json!({ "step": ProtocolStep::Submit, "confirmed_remotely": true }),
        )
        .await?;
    }

    let result_detail = if already_submitted {
        "Submitted for grading (confirmed in the LMS)."
    } else {
        "Submitted for grading."
    };
    let submitted =
        submission_requests::mark_submitted(&mut tx, &current.id, result_detail, now).await?;
    audit(
        &mut tx,
        &current.id,
        &lease.owner,
        "submitted",
        Some(SubmissionState::Submitting),
        Some(SubmissionState::Submitted),
        json!({ "attempt": current.attempt_count, "already_submitted": already_submitted }),
    )
    .await?;

    artifact_registry::mark_submitted(&mut tx, &current.artifact_id, &lease.owner).await?;
    tx.commit().await?;

    Ok(submitted)
}

/// Applies the retry policy to a failed step: RETRY_SCHEDULED at the same step, or FAILED.
pub(crate) async fn fail_or_retry(
    pool: &PgPool,
    lease: &Lease,
    step: ProtocolStep,
    failure: &ExternalFailure,
    policy: &RetryPolicy,
) -> Result<SubmissionRequest, QueueError> {
    let now = primitive_now_utc();
    let mut tx = pool.begin().await?;
    let current = lock_leased(&mut tx, lease).await?;

    let attempts = u32::try_from(current.attempt_count).unwrap_or(0);
    let plan = plan_failure(
        policy.decide(failure.kind, attempts),
        failure,
        step,
        attempts,
        policy.max_attempts,
    );
    let detail = json!({
        "step": step,
        "kind": failure.kind,
        "reason": failure.reason,
        "attempt": current.attempt_count,
    });

    let updated = match &plan {
        FailurePlan::Retry { delay, result_detail } => {
            let next_attempt_at = add_seconds(now, delay.as_secs());
            let updated = submission_requests::schedule_retry(
                &mut tx,
                &current.id,
                FailureUpdate {
                    kind: Some(failure.kind),
                    reason: &failure.reason,
                    result_detail,
                    now,
                },
                next_attempt_at,
            )
            .await?;
            audit(
                &mut tx,
                &current.id,
                &lease.owner,
                "retry_scheduled",
                Some(current.state),
                Some(SubmissionState::RetryScheduled),
                json!({ "failure": detail, "delay_seconds": delay.as_secs() }),
            )
            .await?;
            updated
        }
        FailurePlan::Fail { result_detail } => {
            let updated = submission_requests::mark_failed(
                &mut tx,
                &current.id,
                FailureUpdate {
                    kind: Some(failure.kind),
                    reason: &failure.reason,
                    result_detail,
                    now,
                },
            )
            .await?;
            audit(
                &mut tx,
                &current.id,
                &lease.owner,
                "failed",
                Some(current.state),
                Some(SubmissionState::Failed),
                json!({ "failure": detail }),
            )
            .await?;
            updated
        }
    };

    tx.commit().await?;

    tracing::warn!(
        request_id = %current.id,
        step = step.as_str(),
        kind = failure.kind.as_str(),
        reason = %failure.reason,
        attempt = current.attempt_count,
        next_state = updated.state.as_str(),
        "Submission step failed"
    );
    Ok(updated)
}

/// Ends a cancel-flagged request at a step boundary.
pub(crate) async fn stop_cancelled(
    pool: &PgPool,
    lease: &Lease,
) -> Result<SubmissionRequest, QueueError> {
    let now = primitive_now_utc();
    let mut tx = pool.begin().await?;
    let current = lock_leased(&mut tx, lease).await?;

    let failed = submission_requests::mark_failed(
        &mut tx,
        &current.id,
        FailureUpdate {
            kind: None,
            reason: "cancelled",
            result_detail: "Submission was cancelled by exam staff.",
            now,
        },
    )
    .await?;
    audit(
        &mut tx,
        &current.id,
        &lease.owner,
        "cancelled",
        Some(current.state),
        Some(SubmissionState::Failed),
        json!({ "resume_step": current.resume_step }),
    )
    .await?;

    tx.commit().await?;
    Ok(failed)
}

/// Gives the request back without a transition, e.g. on shutdown between steps.
pub(crate) async fn release(pool: &PgPool, lease: &Lease) -> Result<bool, QueueError> {
    let now = primitive_now_utc();
    let mut tx = pool.begin().await?;

    let released =
        submission_requests::release_lease(&mut tx, &lease.request_id, &lease.lease_id, now)
            .await?;
    if released {
        audit(
            &mut tx,
            &lease.request_id,
            &lease.owner,
            "lease_released",
            None,
            None,
            json!({}),
        )
        .await?;
    }

    tx.commit().await?;
    tracing::info!(request_id = %lease.request_id, released, "Submission lease released");
    Ok(released)
}
