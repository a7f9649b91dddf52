use anyhow::Result;
use tokio::sync::watch;
use tokio::time::{interval, sleep, Duration};

use crate::core::state::AppState;
use crate::services::retry_policy::RetryPolicy;
use crate::services::submission_queue;
use crate::tasks::submission;

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

pub(crate) async fn run(state: AppState) -> Result<()> {
    let policy = RetryPolicy::from_settings(state.settings());
    let concurrency = state.settings().submission().worker_concurrency.max(1);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut handles = Vec::with_capacity(concurrency + 1);
    for slot in 0..concurrency {
        let owner = format!("worker:{}:{slot}", std::process::id());
        handles.push(tokio::spawn(submission_worker(
            state.clone(),
            policy.clone(),
            owner,
            shutdown_rx.clone(),
        )));
    }
    handles.push(tokio::spawn(maintenance_loop(state.clone(), shutdown_rx.clone())));

    tracing::info!(concurrency, "Submission workers started");

    crate::core::shutdown::shutdown_signal().await;
    if shutdown_tx.send(true).is_err() {
        tracing::warn!("Failed to broadcast shutdown signal to background tasks");
    }

    for handle in handles {
        if let Err(err) = handle.await {
            tracing::error!(error = %err, "Background task join failed");
        }
    }

    Ok(())
}

async fn submission_worker(
    state: AppState,
    policy: RetryPolicy,
    owner: String,
    mut shutdown: watch::Receiver<bool>,
) {
    let settings = state.settings().submission();
    let lease_duration = Duration::from_secs(settings.lease_seconds);
    let poll_interval = Duration::from_millis(settings.poll_interval_ms);

    loop {
        if *shutdown.borrow() {
            break;
        }

        match submission_queue::claim_next(state.db(), &owner, lease_duration).await {
            Ok(Some(leased)) => {
                if let Err(err) =
                    submission::process_leased(&state, &policy, &leased, shutdown.clone()).await
                {
                    tracing::error!(
                        request_id = %leased.lease.request_id,
                        owner = %owner,
                        error = %err,
                        "Failed to process submission request"
                    );
                    if let Err(release_err) =
                        submission_queue::release(state.db(), &leased.lease).await
                    {
                        tracing::error!(
                            request_id = %leased.lease.request_id,
                            error = %release_err,
                            "Failed to release submission lease after worker error"
                        );
                    }
                }
                continue;
            }
            Ok(None) => {}
            Err(err) => tracing::error!(owner = %owner, error = %err, "Failed to claim submission request"),
        }

        tokio::select! {
            _ = shutdown.changed() => break,
            _ = sleep(poll_interval) => {}
        }
    }

    tracing::info!(owner = %owner, "Submission worker stopped");
}

async fn maintenance_loop(state: AppState, mut shutdown: watch::Receiver<bool>) {
    let mut tick = interval(MAINTENANCE_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tick.tick() => {
                if let Err(err) = submission::report_stuck_requests(&state).await {
                    tracing::error!(error = %err, "report_stuck_requests failed");
                }
            }
        }
    }
}
