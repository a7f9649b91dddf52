use std::time::Duration;

use futures::TryStreamExt;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;

use super::*;
use crate::core::security::SecretToken;
use crate::core::token_cipher::TokenCipher;
use crate::db::types::{ArtifactState, FailureKind, ProtocolStep};
use crate::services::artifact_registry;
use crate::services::lms::{ExternalFailure, FileHandle};
use crate::services::retry_policy::RetryPolicy;
use crate::services::submission_protocol::{AttemptJournal, StepGate};
use crate::test_support;

const LEASE: Duration = Duration::from_secs(120);

fn cipher() -> TokenCipher {
    TokenCipher::from_passphrase("queue-test-key").expect("cipher")
}

fn policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay: Duration::ZERO,
        max_delay: Duration::ZERO,
        jitter_ratio: 0.0,
    }
}

fn token() -> SecretToken {
    SecretToken::new("student-lms-token")
}

#[tokio::test]
async fn concurrent_submits_admit_exactly_one_request() {
    let Some(ctx) = test_support::db_context().await else {
        return;
    };
    let artifact = test_support::seed_artifact(&ctx.pool, "611221104088", "19AI405").await;
    let cipher = cipher();

    let (token_a, token_b) = (token(), token());
    let (first, second) = tokio::join!(
        enqueue(&ctx.pool, &cipher, &artifact.id, &token_a, "student:611221104088"),
        enqueue(&ctx.pool, &cipher, &artifact.id, &token_b, "student:611221104088"),
    );

    let (created, conflict) = match (first, second) {
        (Ok(created), Err(conflict)) | (Err(conflict), Ok(created)) => (created, conflict),
        other => panic!("expected one admission and one conflict, got {other:?}"),
    };
    match conflict {
        QueueError::AlreadyInFlight { request_id, .. } => assert_eq!(request_id, created.id),
        other => panic!("unexpected error {other:?}"),
    }

    assert_eq!(created.state, SubmissionState::Pending);
    assert_ne!(created.student_token_enc, token().expose().as_bytes());
    let artifact = artifact_registry::get(&ctx.pool, &artifact.id).await.unwrap();
    assert_eq!(artifact.state, ArtifactState::Assigned);
}

#[tokio::test]
async fn transient_save_failure_retries_at_save() {
    let Some(ctx) = test_support::db_context().await else {
        return;
    };
    let artifact = test_support::seed_artifact(&ctx.pool, "611221104088", "19AI405").await;
    let request = enqueue(&ctx.pool, &cipher(), &artifact.id, &token(), "student:1").await.unwrap();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let leased = claim_next(&ctx.pool, "worker:test:0", LEASE).await.unwrap().expect("claim");
    assert_eq!(leased.request.id, request.id);
    assert_eq!(leased.request.attempt_count, 1);
    assert!(!leased.reclaimed);

    let mut journal = LeasedAttempt::new(&ctx.pool, &leased.lease, LEASE, shutdown_rx.clone());
    assert_eq!(journal.enter_step(ProtocolStep::Upload).await.unwrap(), StepGate::Proceed);
    journal.record_handle(FileHandle(555)).await.unwrap();
    assert_eq!(journal.enter_step(ProtocolStep::Save).await.unwrap(), StepGate::Proceed);

    let updated = fail_or_retry(
        &ctx.pool,
        &leased.lease,
        ProtocolStep::Save,
        &ExternalFailure::transient("http_503"),
        &policy(3),
    )
    .await
    .unwrap();
    assert_eq!(updated.state, SubmissionState::RetryScheduled);
    assert_eq!(updated.resume_step, ProtocolStep::Save);
    assert_eq!(updated.file_handle, Some(555));
    assert_eq!(updated.last_failure_kind, Some(FailureKind::Transient));

    let retry = claim_next(&ctx.pool, "worker:test:1", LEASE).await.unwrap().expect("reclaim");
    assert_eq!(retry.request.attempt_count, 2);
    assert_eq!(retry.request.resume_step, ProtocolStep::Save);

    let mut journal = LeasedAttempt::new(&ctx.pool, &retry.lease, LEASE, shutdown_rx);
    journal.enter_step(ProtocolStep::Save).await.unwrap();
    journal.enter_step(ProtocolStep::Submit).await.unwrap();
    let done = complete(&ctx.pool, &retry.lease, false).await.unwrap();
    assert_eq!(done.state, SubmissionState::Submitted);
    assert!(done.completed_at.is_some());

    let artifact = artifact_registry::get(&ctx.pool, &artifact.id).await.unwrap();
    assert_eq!(artifact.state, ArtifactState::Submitted);

    let entity_ref = format!("submission:{}", request.id);
    let events: Vec<_> =
        audit_trail::query(&ctx.pool, &entity_ref).try_collect().await.unwrap();
    assert_eq!(audit_trail::replay(&events), Ok(Some("submitted".to_string())));
}

#[tokio::test]
async fn exhausted_budget_fails_without_touching_the_artifact() {
    let Some(ctx) = test_support::db_context().await else {
        return;
    };
    let artifact = test_support::seed_artifact(&ctx.pool, "611221104088", "19AI405").await;
    enqueue(&ctx.pool, &cipher(), &artifact.id, &token(), "student:1").await.unwrap();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let leased = claim_next(&ctx.pool, "worker:test:0", LEASE).await.unwrap().expect("claim");
    let mut journal = LeasedAttempt::new(&ctx.pool, &leased.lease, LEASE, shutdown_rx);
    journal.enter_step(ProtocolStep::Upload).await.unwrap();

    let failed = fail_or_retry(
        &ctx.pool,
        &leased.lease,
        ProtocolStep::Upload,
        &ExternalFailure::transient("timeout"),
        &policy(1),
    )
    .await
    .unwrap();

    assert_eq!(failed.state, SubmissionState::Failed);
    assert!(failed.result_detail.unwrap_or_default().contains("submit again later"));
    let artifact = artifact_registry::get(&ctx.pool, &artifact.id).await.unwrap();
    assert_eq!(artifact.state, ArtifactState::Assigned);

    let again = enqueue(&ctx.pool, &cipher(), &artifact.id, &token(), "student:1").await;
    assert!(again.is_ok(), "a failed request must not block a new submit");
}

#[tokio::test]
async fn lost_lease_refuses_writes() {
    let Some(ctx) = test_support::db_context().await else {
        return;
    };
    let artifact = test_support::seed_artifact(&ctx.pool, "611221104088", "19AI405").await;
    enqueue(&ctx.pool, &cipher(), &artifact.id, &token(), "student:1").await.unwrap();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let leased = claim_next(&ctx.pool, "worker:test:0", Duration::ZERO).await.unwrap().unwrap();
    let mut journal = LeasedAttempt::new(&ctx.pool, &leased.lease, Duration::ZERO, shutdown_rx);
    journal.enter_step(ProtocolStep::Upload).await.unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    let stolen = claim_next(&ctx.pool, "worker:test:1", LEASE).await.unwrap().expect("reclaim");
    assert!(stolen.reclaimed);
    assert_eq!(stolen.request.attempt_count, 1);

    let err = journal.enter_step(ProtocolStep::Save).await.unwrap_err();
    assert!(matches!(err, QueueError::LeaseLost(_)), "{err:?}");
}

#[tokio::test]
async fn cancel_fails_queued_work_and_flags_running_work() {
    let Some(ctx) = test_support::db_context().await else {
        return;
    };
    let queued = test_support::seed_artifact(&ctx.pool, "611221104088", "19AI405").await;
    let running = test_support::seed_artifact(&ctx.pool, "611221104089", "19AI405").await;
    let queued_request =
        enqueue(&ctx.pool, &cipher(), &queued.id, &token(), "student:1").await.unwrap();

    let outcome = cancel(&ctx.pool, &queued_request.id, "staff:1").await.unwrap();
    assert!(matches!(outcome, CancelOutcome::Cancelled(ref r) if r.state == SubmissionState::Failed));

    let running_request =
        enqueue(&ctx.pool, &cipher(), &running.id, &token(), "student:2").await.unwrap();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let leased = claim_next(&ctx.pool, "worker:test:0", LEASE).await.unwrap().expect("claim");
    assert_eq!(leased.request.id, running_request.id);
    let mut journal = LeasedAttempt::new(&ctx.pool, &leased.lease, LEASE, shutdown_rx);
    journal.enter_step(ProtocolStep::Upload).await.unwrap();

    let outcome = cancel(&ctx.pool, &running_request.id, "staff:1").await.unwrap();
    assert!(matches!(outcome, CancelOutcome::Flagged(_)));
    assert_eq!(journal.enter_step(ProtocolStep::Save).await.unwrap(), StepGate::Cancelled);

    let stopped = stop_cancelled(&ctx.pool, &leased.lease).await.unwrap();
    assert_eq!(stopped.state, SubmissionState::Failed);
    assert_eq!(stopped.last_failure_reason.as_deref(), Some("cancelled"));
}

#[tokio::test]
async fn cancel_waiting_on_a_connection_still_replays_after_the_retry() {
    let Some(ctx) = test_support::db_context().await else {
        return;
    };
    let artifact = test_support::seed_artifact(&ctx.pool, "611221104088", "19AI405").await;
    let request = enqueue(&ctx.pool, &cipher(), &artifact.id, &token(), "student:1").await.unwrap();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let leased = claim_next(&ctx.pool, "worker:test:0", LEASE).await.unwrap().expect("claim");
    let mut journal = LeasedAttempt::new(&ctx.pool, &leased.lease, LEASE, shutdown_rx);
    journal.enter_step(ProtocolStep::Upload).await.unwrap();

    let api_pool = PgPoolOptions::new()
        .max_connections(1)
        .connect_with((*ctx.pool.connect_options()).clone())
        .await
        .expect("api pool");
    let held = api_pool.acquire().await.unwrap();

    let cancel_task = {
        let pool = api_pool.clone();
        let request_id = request.id.clone();
        tokio::spawn(async move { cancel(&pool, &request_id, "staff:1").await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let retried = fail_or_retry(
        &ctx.pool,
        &leased.lease,
        ProtocolStep::Upload,
        &ExternalFailure::transient("timeout"),
        &policy(3),
    )
    .await
    .unwrap();
    assert_eq!(retried.state, SubmissionState::RetryScheduled);

    drop(held);
    let outcome = cancel_task.await.unwrap().unwrap();
    assert!(matches!(outcome, CancelOutcome::Cancelled(ref r) if r.state == SubmissionState::Failed));

    let entity_ref = format!("submission:{}", request.id);
    let events: Vec<_> =
        audit_trail::query(&ctx.pool, &entity_ref).try_collect().await.unwrap();
    assert_eq!(events.last().map(|e| e.event_type.as_str()), Some("cancelled"));
    assert!(events.windows(2).all(|pair| pair[0].occurred_at <= pair[1].occurred_at));
    assert_eq!(audit_trail::replay(&events), Ok(Some("failed".to_string())));
}

#[tokio::test]
async fn shutdown_between_steps_releases_the_lease() {
    let Some(ctx) = test_support::db_context().await else {
        return;
    };
    let artifact = test_support::seed_artifact(&ctx.pool, "611221104088", "19AI405").await;
    enqueue(&ctx.pool, &cipher(), &artifact.id, &token(), "student:1").await.unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let leased = claim_next(&ctx.pool, "worker:test:0", LEASE).await.unwrap().expect("claim");
    let mut journal = LeasedAttempt::new(&ctx.pool, &leased.lease, LEASE, shutdown_rx);
    shutdown_tx.send(true).unwrap();
    assert_eq!(journal.enter_step(ProtocolStep::Upload).await.unwrap(), StepGate::ShuttingDown);
    assert!(release(&ctx.pool, &leased.lease).await.unwrap());

    let again = claim_next(&ctx.pool, "worker:test:1", LEASE).await.unwrap().expect("claim");
    assert_eq!(again.request.attempt_count, 1);
    assert!(!again.reclaimed);
}

#[tokio::test]
async fn archived_and_submitted_artifacts_are_not_submittable() {
    let Some(ctx) = test_support::db_context().await else {
        return;
    };
    let artifact = test_support::seed_artifact(&ctx.pool, "611221104088", "19AI405").await;
    artifact_registry::archive(&ctx.pool, &artifact.id, "staff:1").await.unwrap();

    let err = enqueue(&ctx.pool, &cipher(), &artifact.id, &token(), "student:1").await.unwrap_err();
    assert!(matches!(err, QueueError::NotSubmittable { state: "archived", .. }), "{err:?}");

    let err = enqueue(&ctx.pool, &cipher(), "missing", &token(), "student:1").await.unwrap_err();
    assert!(matches!(err, QueueError::ArtifactNotFound(_)));
}
