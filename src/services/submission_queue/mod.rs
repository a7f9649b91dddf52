//! Sole writer of submission requests. Every state change is committed together with its audit
//! event; the lease columns decide which worker may write at all.

mod admission;
mod lease;
mod outcome;

use serde_json::Value;
use sqlx::PgConnection;
use thiserror::Error;

use crate::core::token_cipher::TokenCipherError;
use crate::db::types::SubmissionState;
use crate::services::artifact_registry::RegistryError;
use crate::services::audit_trail::{self, AuditRecord, AuditWriteFailure, EntityRef};

pub(crate) use admission::{cancel, enqueue, history, status, CancelOutcome};
pub(crate) use lease::{
    claim_next, complete, fail_or_retry, release, stop_cancelled, Lease, LeasedAttempt,
    LeasedRequest,
};
pub(crate) use outcome::{plan_failure, FailurePlan};

#[derive(Debug, Error)]
pub(crate) enum QueueError {
    #[error("artifact {0} not found")]
    ArtifactNotFound(String),
    #[error("submission request {0} not found")]
    NotFound(String),
    #[error("artifact {artifact_id} cannot be submitted while {state}")]
    NotSubmittable { artifact_id: String, state: &'static str },
    #[error("artifact {artifact_id} already has submission {request_id} in progress")]
    AlreadyInFlight { artifact_id: String, request_id: String },
    #[error("submissions for artifact {0} kept changing during admission; try again")]
    AdmissionContended(String),
    #[error("lease on submission {0} is no longer held")]
    LeaseLost(String),
    #[error(transparent)]
    Audit(#[from] AuditWriteFailure),
    #[error("student token could not be sealed: {0}")]
    Cipher(#[from] TokenCipherError),
    #[error("submission store error: {0}")]
    Database(#[from] sqlx::Error),
}

impl From<RegistryError> for QueueError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(id) => Self::ArtifactNotFound(id),
            RegistryError::InvalidTransition { id, from, .. } => {
                Self::NotSubmittable { artifact_id: id, state: from }
            }
            RegistryError::InFlight { artifact_id, request_id } => {
                Self::AlreadyInFlight { artifact_id, request_id }
            }
            RegistryError::DuplicateArtifact { .. } => {
                Self::Database(sqlx::Error::Protocol("unexpected duplicate artifact".to_string()))
            }
            RegistryError::Audit(err) => Self::Audit(err),
            RegistryError::Database(err) => Self::Database(err),
        }
    }
}

/// Audit row for a request transition. `after: None` marks an annotation that leaves the state
/// where it was.
#[allow(clippy::too_many_arguments)]
async fn audit(
    conn: &mut PgConnection,
    request_id: &str,
    actor: &str,
    event_type: &str,
    before: Option<SubmissionState>,
    after: Option<SubmissionState>,
    detail: Value,
) -> Result<(), AuditWriteFailure> {
    audit_trail::record(
        conn,
        AuditRecord {
            entity: &EntityRef::Submission(request_id.to_string()),
            actor,
            event_type,
            before: before.map(SubmissionState::as_str),
            after: after.map(SubmissionState::as_str),
            detail,
        },
    )
    .await?;

    if let Some(to) = after.filter(|to| Some(*to) != before) {
        metrics::counter!("submission_transitions_total", "to" => to.as_str()).increment(1);
        tracing::info!(
            request_id,
            from = before.map(SubmissionState::as_str).unwrap_or("-"),
            to = to.as_str(),
            event_type,
            "Submission state changed"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests;
