//! One attempt of the upload → save → submit protocol.
//!
//! The executor owns no persistence. Step boundaries are reported to an [`AttemptJournal`], which
//! decides whether the next step may start and durably records progress.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use time::PrimitiveDateTime;

use crate::core::time::seconds_between;
use crate::db::types::ProtocolStep;
use crate::services::lms::{
    CallContext, ExternalFailure, FileHandle, LmsGateway, RemoteSubmissionStatus, UploadFile,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StepGate {
    Proceed,
    Cancelled,
    ShuttingDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StopReason {
    Cancelled,
    ShuttingDown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum AttemptOutcome {
    Completed { already_submitted: bool },
    Failed { step: ProtocolStep, failure: ExternalFailure },
    Stopped(StopReason),
}

#[async_trait]
pub(crate) trait AttemptJournal: Send {
    type Error: Send;

    /// Called before each step starts. Only [`StepGate::Proceed`] records the transition.
    async fn enter_step(&mut self, step: ProtocolStep) -> Result<StepGate, Self::Error>;

    async fn record_handle(&mut self, handle: FileHandle) -> Result<(), Self::Error>;
}

/// Source of the artifact bytes, read only when an upload is actually needed.
#[async_trait]
pub(crate) trait PayloadSource: Send + Sync {
    async fn load(&self) -> Result<UploadFile, ExternalFailure>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandleFreshness {
    /// Ask the LMS whether the draft item still exists.
    Probe,
    /// Trust handles younger than the given age.
    Ttl(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PriorHandle {
    pub(crate) handle: FileHandle,
    pub(crate) obtained_at: PrimitiveDateTime,
}

#[derive(Debug, Clone)]
pub(crate) struct AttemptPlan {
    pub(crate) assignment_id: i64,
    pub(crate) resume_step: ProtocolStep,
    pub(crate) prior_handle: Option<PriorHandle>,
    /// Set for retries and reclaimed leases: an earlier attempt may already have finished remotely.
    pub(crate) verify_remote_first: bool,
    pub(crate) freshness: HandleFreshness,
    pub(crate) now: PrimitiveDateTime,
}

pub(crate) async fn execute<J>(
    gateway: &dyn LmsGateway,
    ctx: &CallContext,
    plan: &AttemptPlan,
    payload: &dyn PayloadSource,
    journal: &mut J,
) -> Result<AttemptOutcome, J::Error>
where
    J: AttemptJournal + ?Sized,
{
    let mut start = plan.resume_step;

    if plan.verify_remote_first {
        match gateway.submission_status(ctx, plan.assignment_id).await {
            Ok(RemoteSubmissionStatus::Submitted) => {
                tracing::info!(
                    assignment_id = plan.assignment_id,
                    "LMS already reports the submission as submitted"
                );
                return Ok(AttemptOutcome::Completed { already_submitted: true });
            }
            Ok(_) => {}
            Err(failure) => return Ok(AttemptOutcome::Failed { step: start, failure }),
        }
    }

    // Only save consumes the handle.
    let mut handle = None;
    if start == ProtocolStep::Save {
        match usable_handle(gateway, ctx, plan).await {
            Ok(Some(prior)) => handle = Some(prior),
            Ok(None) => {
                tracing::info!(
                    assignment_id = plan.assignment_id,
                    resume_step = start.as_str(),
                    "Prior file handle is not usable; restarting at upload"
                );
                start = ProtocolStep::Upload;
            }
            Err(failure) => return Ok(AttemptOutcome::Failed { step: start, failure }),
        }
    }

    for step in ProtocolStep::ORDER.into_iter().filter(|step| *step >= start) {
        match journal.enter_step(step).await? {
            StepGate::Proceed => {}
            StepGate::Cancelled => return Ok(AttemptOutcome::Stopped(StopReason::Cancelled)),
            StepGate::ShuttingDown => {
                return Ok(AttemptOutcome::Stopped(StopReason::ShuttingDown))
            }
        }

        let started = Instant::now();
        let result = run_step(gateway, ctx, plan.assignment_id, step, handle, payload).await;
        metrics::histogram!(
            "lms_step_duration_seconds",
            "step" => step.as_str(),
            "outcome" => if result.is_ok() { "ok" } else { "error" }
        )
        .record(started.elapsed().as_secs_f64());

        match result {
            Ok(Some(obtained)) => {
                journal.record_handle(obtained).await?;
                handle = Some(obtained);
            }
            Ok(None) => {}
            Err(failure) => {
                metrics::counter!(
                    "lms_failures_total",
                    "step" => step.as_str(),
                    "kind" => failure.kind.as_str()
                )
                .increment(1);
                return Ok(AttemptOutcome::Failed { step, failure });
            }
        }
    }

    Ok(AttemptOutcome::Completed { already_submitted: false })
}

/// Returns the handle an upload produced, if this step was the upload.
async fn run_step(
    gateway: &dyn LmsGateway,
    ctx: &CallContext,
    assignment_id: i64,
    step: ProtocolStep,
    handle: Option<FileHandle>,
    payload: &dyn PayloadSource,
) -> Result<Option<FileHandle>, ExternalFailure> {
    match step {
        ProtocolStep::Upload => {
            let file = payload.load().await?;
            gateway.upload(ctx, &file).await.map(Some)
        }
        ProtocolStep::Save => {
            let handle = handle.ok_or_else(|| ExternalFailure::permanent("missing_file_handle"))?;
            gateway.save_draft(ctx, assignment_id, handle).await.map(|_| None)
        }
        ProtocolStep::Submit => gateway.submit_for_grading(ctx, assignment_id).await.map(|_| None),
    }
}

async fn usable_handle(
    gateway: &dyn LmsGateway,
    ctx: &CallContext,
    plan: &AttemptPlan,
) -> Result<Option<FileHandle>, ExternalFailure> {
    let Some(prior) = plan.prior_handle else {
        return Ok(None);
    };

    let usable = match plan.freshness {
        HandleFreshness::Ttl(ttl) => {
            seconds_between(prior.obtained_at, plan.now) <= ttl.as_secs_f64()
        }
        HandleFreshness::Probe => gateway.handle_is_valid(ctx, prior.handle).await?,
    };

    Ok(usable.then_some(prior.handle))
}
