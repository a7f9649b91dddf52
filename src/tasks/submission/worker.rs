use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::PgPool;
use tokio::sync::watch;

use crate::core::config::HandleVerification;
use crate::core::state::AppState;
use crate::core::time::primitive_now_utc;
use crate::db::models::Artifact;
use crate::services::artifact_registry;
use crate::services::filename;
use crate::services::lms::{CallContext, ExternalFailure, FileHandle, UploadFile};
use crate::services::retry_policy::RetryPolicy;
use crate::services::storage::BlobStore;
use crate::services::submission_protocol::{
    self, AttemptJournal, AttemptOutcome, AttemptPlan, HandleFreshness, PayloadSource, PriorHandle,
    StepGate, StopReason,
};
use crate::services::submission_queue::{self, LeasedAttempt, LeasedRequest, QueueError};

/// Artifact bytes fetched from blob storage on demand.
struct ArtifactPayload {
    store: Option<Arc<dyn BlobStore>>,
    storage_ref: String,
    filename: String,
    mime_type: String,
}

impl ArtifactPayload {
    fn new(store: Option<Arc<dyn BlobStore>>, artifact: &Artifact) -> Self {
        Self {
            store,
            storage_ref: artifact.storage_ref.clone(),
            filename: filename::sanitize(&artifact.original_filename),
            mime_type: artifact.mime_type.clone(),
        }
    }
}

#[async_trait]
impl PayloadSource for ArtifactPayload {
    async fn load(&self) -> Result<UploadFile, ExternalFailure> {
        let Some(store) = self.store.as_ref() else {
            return Err(ExternalFailure::transient("blob_store_unconfigured"));
        };

        let bytes = store.get(&self.storage_ref).await.map_err(|err| {
            tracing::error!(storage_ref = %self.storage_ref, error = %err, "Failed to read artifact blob");
            ExternalFailure::transient("blob_unavailable")
        })?;

        Ok(UploadFile {
            filename: self.filename.clone(),
            mime_type: self.mime_type.clone(),
            bytes,
        })
    }
}

pub(crate) fn freshness(state: &AppState) -> HandleFreshness {
    let submission = state.settings().submission();
    match submission.handle_verification {
        HandleVerification::Probe => HandleFreshness::Probe,
        HandleVerification::Ttl => {
            HandleFreshness::Ttl(Duration::from_secs(submission.handle_ttl_seconds))
        }
    }
}

/// Runs one leased attempt to its next durable resting point.
pub(crate) async fn process_leased(
    state: &AppState,
    policy: &RetryPolicy,
    leased: &LeasedRequest,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let request = &leased.request;
    let lease = &leased.lease;
    let db = state.db();
    let lease_duration = Duration::from_secs(state.settings().submission().lease_seconds);
    let mut journal = LeasedAttempt::new(db, lease, lease_duration, shutdown);

    let student_token = match state.cipher().decrypt(&request.student_token_enc) {
        Ok(token) => token,
        Err(err) => {
            tracing::error!(request_id = %request.id, error = %err, "Stored student token is unreadable");
            let failure = ExternalFailure::permanent("student_token_unreadable");
            return fail_at_resume_step(db, leased, &mut journal, &failure, policy).await;
        }
    };

    let artifact = artifact_registry::get(db, &request.artifact_id)
        .await
        .context("Failed to load artifact for submission")?;

    let mapping = match state.mapper().lookup(&artifact.subject_code).await {
        Ok(mapping) => mapping,
        Err(err) => {
            tracing::warn!(
                request_id = %request.id,
                subject_code = %artifact.subject_code,
                error = %err,
                "Assignment lookup failed"
            );
            let failure = err.as_external();
            return fail_at_resume_step(db, leased, &mut journal, &failure, policy).await;
        }
    };

    let plan = AttemptPlan {
        assignment_id: mapping.assignment_id,
        resume_step: request.resume_step,
        prior_handle: request.file_handle.zip(request.handle_obtained_at).map(
            |(handle, obtained_at)| PriorHandle { handle: FileHandle(handle), obtained_at },
        ),
        verify_remote_first: leased.reclaimed || request.attempt_count > 1,
        freshness: freshness(state),
        now: primitive_now_utc(),
    };

    let ctx = CallContext::student(student_token);
    let payload = ArtifactPayload::new(state.storage().cloned(), &artifact);

    let outcome =
        match submission_protocol::execute(state.lms(), &ctx, &plan, &payload, &mut journal).await
        {
            Ok(outcome) => outcome,
            Err(err) => return settle::<()>(Err(err)),
        };

    let settled = match outcome {
        AttemptOutcome::Completed { already_submitted } => {
            submission_queue::complete(db, lease, already_submitted).await.map(|request| {
                tracing::info!(
                    request_id = %request.id,
                    artifact_id = %request.artifact_id,
                    attempt = request.attempt_count,
                    already_submitted,
                    "Submission completed"
                );
            })
        }
        AttemptOutcome::Failed { step, failure } => {
            submission_queue::fail_or_retry(db, lease, step, &failure, policy).await.map(|_| ())
        }
        AttemptOutcome::Stopped(StopReason::Cancelled) => {
            submission_queue::stop_cancelled(db, lease).await.map(|_| ())
        }
        AttemptOutcome::Stopped(StopReason::ShuttingDown) => {
            submission_queue::release(db, lease).await.map(|_| ())
        }
    };

    settle(settled)
}

/// Prerequisite failures are recorded against the resume step, so a queued request moves into
/// that step before it can be retried or failed.
async fn fail_at_resume_step(
    db: &PgPool,
    leased: &LeasedRequest,
    journal: &mut LeasedAttempt<'_>,
    failure: &ExternalFailure,
    policy: &RetryPolicy,
) -> Result<()> {
    let lease = &leased.lease;
    let step = leased.request.resume_step;

    match journal.enter_step(step).await {
        Ok(StepGate::Proceed) => {
            settle(submission_queue::fail_or_retry(db, lease, step, failure, policy).await)
        }
        Ok(StepGate::Cancelled) => settle(submission_queue::stop_cancelled(db, lease).await),
        Ok(StepGate::ShuttingDown) => settle(submission_queue::release(db, lease).await),
        Err(err) => settle::<()>(Err(err)),
    }
}

/// A lost lease means another worker owns the request now; that is not an error here.
fn settle<T>(result: Result<T, QueueError>) -> Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(QueueError::LeaseLost(request_id)) => {
            tracing::warn!(request_id = %request_id, "Lease lost mid-attempt; leaving request to its new owner");
            Ok(())
        }
        Err(err) => Err(err).context("Failed to persist submission progress"),
    }
}
