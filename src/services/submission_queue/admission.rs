use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::core::security::SecretToken;
use crate::core::time::primitive_now_utc;
use crate::core::token_cipher::TokenCipher;
use crate::db::models::SubmissionRequest;
use crate::db::types::{ArtifactState, SubmissionState};
use crate::repositories::{artifacts, submission_requests};
use crate::services::artifact_registry;

use super::{audit, QueueError};

const ADMISSION_ATTEMPTS: u32 = 3;

#[derive(Debug)]
pub(crate) enum CancelOutcome {
    /// Queued work was failed immediately.
    Cancelled(SubmissionRequest),
    /// In-flight work stops before its next step.
    Flagged(SubmissionRequest),
    AlreadyTerminal(SubmissionRequest),
}

/// Admits a submission for `artifact_id`. The partial unique index decides single-flight, so two
/// concurrent callers get exactly one request and one `AlreadyInFlight`.
pub(crate) async fn enqueue(
    pool: &PgPool,
    cipher: &TokenCipher,
    artifact_id: &str,
    student_token: &SecretToken,
    requested_by: &str,
) -> Result<SubmissionRequest, QueueError> {
    let now = primitive_now_utc();
    let mut tx = pool.begin().await?;

    let artifact = artifacts::lock_by_id(&mut tx, artifact_id)
        .await?
        .ok_or_else(|| QueueError::ArtifactNotFound(artifact_id.to_string()))?;
    if matches!(artifact.state, ArtifactState::Submitted | ArtifactState::Archived) {
        return Err(QueueError::NotSubmittable {
            artifact_id: artifact_id.to_string(),
            state: artifact.state.as_str(),
        });
    }

    let sealed = cipher.encrypt(student_token)?;
    let request_id = Uuid::new_v4().to_string();

    let mut tries = 0;
    let request = loop {
        let inserted = submission_requests::insert_if_none_active(
            &mut tx,
            submission_requests::CreateSubmissionRequest {
                id: &request_id,
                artifact_id,
                student_token_enc: &sealed,
                requested_by,
                created_at: now,
            },
        )
        .await?;
        if let Some(request) = inserted {
            break request;
        }

        // The conflicting request may have failed between the insert and this read.
        if let Some(active) =
            submission_requests::find_active_for_artifact(&mut tx, artifact_id).await?
        {
            return Err(QueueError::AlreadyInFlight {
                artifact_id: artifact_id.to_string(),
                request_id: active.id,
            });
        }

        tries += 1;
        if tries >= ADMISSION_ATTEMPTS {
            return Err(QueueError::AdmissionContended(artifact_id.to_string()));
        }
    };

    audit(
        &mut tx,
        &request.id,
        requested_by,
        "submission_created",
        None,
        Some(SubmissionState::Pending),
        json!({ "artifact_id": artifact_id }),
    )
    .await?;

    artifact_registry::assign(&mut tx, artifact, requested_by).await?;
    tx.commit().await?;

    tracing::info!(
        request_id = %request.id,
        artifact_id,
        "Submission request queued"
    );
    Ok(request)
}

pub(crate) async fn status(pool: &PgPool, request_id: &str) -> Result<SubmissionRequest, QueueError> {
    submission_requests::find_by_id(pool, request_id)
        .await?
        .ok_or_else(|| QueueError::NotFound(request_id.to_string()))
}

/// All requests ever made for an artifact, newest first.
pub(crate) async fn history(
    pool: &PgPool,
    artifact_id: &str,
) -> Result<Vec<SubmissionRequest>, QueueError> {
    Ok(submission_requests::list_by_artifact(pool, artifact_id).await?)
}

pub(crate) async fn cancel(
    pool: &PgPool,
    request_id: &str,
    actor: &str,
) -> Result<CancelOutcome, QueueError> {
    let now = primitive_now_utc();
    let mut tx = pool.begin().await?;

    let request = submission_requests::lock_by_id(&mut tx, request_id)
        .await?
        .ok_or_else(|| QueueError::NotFound(request_id.to_string()))?;

    let outcome = match request.state {
        state if state.is_terminal() => CancelOutcome::AlreadyTerminal(request),
        state if state.is_in_flight() => {
            submission_requests::request_cancel(&mut tx, request_id, now).await?;
            audit(&mut tx, request_id, actor, "cancel_requested", None, None, json!({})).await?;
            CancelOutcome::Flagged(request)
        }
        before => {
            let failed = submission_requests::mark_failed(
                &mut tx,
                request_id,
                submission_requests::FailureUpdate {
                    kind: None,
                    reason: "cancelled",
                    result_detail: "Submission was cancelled by exam staff.",
                    now,
                },
            )
            .await?;
            audit(
                &mut tx,
                request_id,
                actor,
                "cancelled",
                Some(before),
                Some(SubmissionState::Failed),
                json!({}),
            )
            .await?;
            CancelOutcome::Cancelled(failed)
        }
    };

    tx.commit().await?;
    tracing::info!(request_id, actor, outcome = outcome_name(&outcome), "Cancel processed");
    Ok(outcome)
}

fn outcome_name(outcome: &CancelOutcome) -> &'static str {
    match outcome {
        CancelOutcome::Cancelled(_) => "cancelled",
        CancelOutcome::Flagged(_) => "flagged",
        CancelOutcome::AlreadyTerminal(_) => "already_terminal",
    }
}
