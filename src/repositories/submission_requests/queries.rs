use sqlx::{PgConnection, PgPool};
use time::PrimitiveDateTime;

use crate::db::models::SubmissionRequest;

use super::types::COLUMNS;

pub(crate) async fn find_by_id(
    pool: &PgPool,
    id: &str,
) -> Result<Option<SubmissionRequest>, sqlx::Error> {
    sqlx::query_as::<_, SubmissionRequest>(&format!(
        "SELECT {COLUMNS} FROM submission_requests WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await
}

/// Row-locks the request for the rest of the transaction.
pub(crate) async fn lock_by_id(
    conn: &mut PgConnection,
    id: &str,
) -> Result<Option<SubmissionRequest>, sqlx::Error> {
    sqlx::query_as::<_, SubmissionRequest>(&format!(
        "SELECT {COLUMNS} FROM submission_requests WHERE id = $1 FOR UPDATE"
    ))
    .bind(id)
    .fetch_optional(conn)
    .await
}

pub(crate) async fn find_active_for_artifact(
    conn: &mut PgConnection,
    artifact_id: &str,
) -> Result<Option<SubmissionRequest>, sqlx::Error> {
    sqlx::query_as::<_, SubmissionRequest>(&format!(
        "SELECT {COLUMNS}
         FROM submission_requests
         WHERE artifact_id = $1 AND state NOT IN ('submitted', 'failed')"
    ))
    .bind(artifact_id)
    .fetch_optional(conn)
    .await
}

pub(crate) async fn list_by_artifact(
    pool: &PgPool,
    artifact_id: &str,
) -> Result<Vec<SubmissionRequest>, sqlx::Error> {
    sqlx::query_as::<_, SubmissionRequest>(&format!(
        "SELECT {COLUMNS}
         FROM submission_requests
         WHERE artifact_id = $1
         ORDER BY created_at DESC"
    ))
    .bind(artifact_id)
    .fetch_all(pool)
    .await
}

/// In-flight requests whose lease lapsed more than `grace_seconds` ago.
pub(crate) async fn count_stuck(
    pool: &PgPool,
    now: PrimitiveDateTime,
    grace_seconds: i64,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*)
         FROM submission_requests
         WHERE state IN ('uploading', 'saving', 'submitting')
           AND lease_expires_at IS NOT NULL
           AND lease_expires_at < $1 - make_interval(secs => $2)",
    )
    .bind(now)
    .bind(grace_seconds as f64)
    .fetch_one(pool)
    .await
}
