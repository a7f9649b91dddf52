use sqlx::PgConnection;
use time::PrimitiveDateTime;

use crate::db::models::SubmissionRequest;
use crate::db::types::{ProtocolStep, SubmissionState};

use super::types::{
    ClaimedRow, CreateSubmissionRequest, FailureUpdate, LeaseGrant, COLUMNS,
};

/// Inserts a PENDING request unless the artifact already has a non-terminal one.
///
/// Returns `None` when the single-flight index rejected the insert.
pub(crate) async fn insert_if_none_active(
    conn: &mut PgConnection,
    params: CreateSubmissionRequest<'_>,
) -> Result<Option<SubmissionRequest>, sqlx::Error> {
    sqlx::query_as::<_, SubmissionRequest>(&format!(
        "INSERT INTO submission_requests (
            id, artifact_id, student_token_enc, requested_by, state, attempt_count, resume_step,
            cancel_requested, created_at, updated_at
         )
         VALUES ($1, $2, $3, $4, $5, 0, $6, FALSE, $7, $7)
         ON CONFLICT (artifact_id) WHERE state NOT IN ('submitted', 'failed') DO NOTHING
         RETURNING {COLUMNS}"
    ))
    .bind(params.id)
    .bind(params.artifact_id)
    .bind(params.student_token_enc)
    .bind(params.requested_by)
    .bind(SubmissionState::Pending)
    .bind(ProtocolStep::Upload)
    .bind(params.created_at)
    .fetch_optional(conn)
    .await
}

/// Leases the oldest runnable request: due PENDING/RETRY_SCHEDULED work or in-flight work whose
/// lease has lapsed. A fresh lease on queued work opens a new attempt; a reclaimed lease does not.
/// Cancel-flagged work is still claimed so the next step boundary can finish it.
pub(crate) async fn claim_next(
    conn: &mut PgConnection,
    lease: LeaseGrant<'_>,
) -> Result<Option<ClaimedRow>, sqlx::Error> {
    sqlx::query_as::<_, ClaimedRow>(&format!(
        "WITH candidate AS (
            SELECT id, state AS prior_state, lease_id AS prior_lease_id
            FROM submission_requests
            WHERE (
                    (state IN ('pending', 'retry_scheduled')
                     AND COALESCE(next_attempt_at, created_at) <= $1
                     AND (lease_expires_at IS NULL OR lease_expires_at < $1))
                 OR (state IN ('uploading', 'saving', 'submitting')
                     AND (lease_expires_at IS NULL OR lease_expires_at < $1))
              )
            ORDER BY COALESCE(next_attempt_at, created_at), created_at
            FOR UPDATE SKIP LOCKED
            LIMIT 1
        )
        UPDATE submission_requests AS r
        SET lease_id = $2,
            lease_owner = $3,
            lease_expires_at = $4,
            attempt_count = CASE
                WHEN c.prior_state IN ('pending', 'retry_scheduled') AND c.prior_lease_id IS NULL
                THEN r.attempt_count + 1
                ELSE r.attempt_count
            END,
            last_attempt_at = CASE
                WHEN c.prior_state IN ('pending', 'retry_scheduled') AND c.prior_lease_id IS NULL
                THEN $1
                ELSE r.last_attempt_at
            END,
            next_attempt_at = NULL,
            updated_at = $1
        FROM candidate c
        WHERE r.id = c.id
        RETURNING c.prior_state, c.prior_lease_id, {}",
        qualified_columns("r")
    ))
    .bind(lease.now)
    .bind(lease.lease_id)
    .bind(lease.owner)
    .bind(lease.expires_at)
    .fetch_optional(conn)
    .await
}

pub(crate) async fn enter_step(
    conn: &mut PgConnection,
    id: &str,
    step: ProtocolStep,
    lease_expires_at: PrimitiveDateTime,
    now: PrimitiveDateTime,
) -> Result<SubmissionRequest, sqlx::Error> {
    sqlx::query_as::<_, SubmissionRequest>(&format!(
        "UPDATE submission_requests
         SET state = $1,
             resume_step = $2,
             lease_expires_at = $3,
             updated_at = $4
         WHERE id = $5
         RETURNING {COLUMNS}"
    ))
    .bind(step.state())
    .bind(step)
    .bind(lease_expires_at)
    .bind(now)
    .bind(id)
    .fetch_one(conn)
    .await
}

pub(crate) async fn record_handle(
    conn: &mut PgConnection,
    id: &str,
    file_handle: i64,
    now: PrimitiveDateTime,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE submission_requests
         SET file_handle = $1, handle_obtained_at = $2, updated_at = $2
         WHERE id = $3",
    )
    .bind(file_handle)
    .bind(now)
    .bind(id)
    .execute(conn)
    .await?;

    Ok(())
}

pub(crate) async fn mark_submitted(
    conn: &mut PgConnection,
    id: &str,
    result_detail: &str,
    now: PrimitiveDateTime,
) -> Result<SubmissionRequest, sqlx::Error> {
    sqlx::query_as::<_, SubmissionRequest>(&format!(
        "UPDATE submission_requests
         SET state = $1,
             result_detail = $2,
             lease_id = NULL,
             lease_owner = NULL,
             lease_expires_at = NULL,
             next_attempt_at = NULL,
             completed_at = $3,
             updated_at = $3
         WHERE id = $4
         RETURNING {COLUMNS}"
    ))
    .bind(SubmissionState::Submitted)
    .bind(result_detail)
    .bind(now)
    .bind(id)
    .fetch_one(conn)
    .await
}

pub(crate) async fn schedule_retry(
    conn: &mut PgConnection,
    id: &str,
    failure: FailureUpdate<'_>,
    next_attempt_at: PrimitiveDateTime,
) -> Result<SubmissionRequest, sqlx::Error> {
    sqlx::query_as::<_, SubmissionRequest>(&format!(
        "UPDATE submission_requests
         SET state = $1,
             next_attempt_at = $2,
             last_failure_kind = $3,
             last_failure_reason = $4,
             result_detail = $5,
             lease_id = NULL,
             lease_owner = NULL,
             lease_expires_at = NULL,
             updated_at = $6
         WHERE id = $7
         RETURNING {COLUMNS}"
    ))
    .bind(SubmissionState::RetryScheduled)
    .bind(next_attempt_at)
    .bind(failure.kind)
    .bind(failure.reason)
    .bind(failure.result_detail)
    .bind(failure.now)
    .bind(id)
    .fetch_one(conn)
    .await
}

pub(crate) async fn mark_failed(
    conn: &mut PgConnection,
    id: &str,
    failure: FailureUpdate<'_>,
) -> Result<SubmissionRequest, sqlx::Error> {
    sqlx::query_as::<_, SubmissionRequest>(&format!(
        "UPDATE submission_requests
         SET state = $1,
             last_failure_kind = COALESCE($2, last_failure_kind),
             last_failure_reason = $3,
             result_detail = $4,
             lease_id = NULL,
             lease_owner = NULL,
             lease_expires_at = NULL,
             next_attempt_at = NULL,
             completed_at = $5,
             updated_at = $5
         WHERE id = $6
         RETURNING {COLUMNS}"
    ))
    .bind(SubmissionState::Failed)
    .bind(failure.kind)
    .bind(failure.reason)
    .bind(failure.result_detail)
    .bind(failure.now)
    .bind(id)
    .fetch_one(conn)
    .await
}

/// Drops the lease without a state change. An attempt that never reached a step is handed back.
pub(crate) async fn release_lease(
    conn: &mut PgConnection,
    id: &str,
    lease_id: &str,
    now: PrimitiveDateTime,
) -> Result<bool, sqlx::Error> {
    let updated = sqlx::query(
        "UPDATE submission_requests
         SET attempt_count = CASE
                 WHEN state IN ('pending', 'retry_scheduled') THEN GREATEST(attempt_count - 1, 0)
                 ELSE attempt_count
             END,
             lease_id = NULL,
             lease_owner = NULL,
             lease_expires_at = NULL,
             updated_at = $1
         WHERE id = $2 AND lease_id = $3",
    )
    .bind(now)
    .bind(id)
    .bind(lease_id)
    .execute(conn)
    .await?;

    Ok(updated.rows_affected() > 0)
}

pub(crate) async fn request_cancel(
    conn: &mut PgConnection,
    id: &str,
    now: PrimitiveDateTime,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE submission_requests SET cancel_requested = TRUE, updated_at = $1 WHERE id = $2",
    )
    .bind(now)
    .bind(id)
    .execute(conn)
    .await?;

    Ok(())
}

fn qualified_columns(alias: &str) -> String {
    COLUMNS
        .split(',')
        .map(|column| format!("{alias}.{}", column.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}
