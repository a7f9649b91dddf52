use anyhow::{Context, Result};

use crate::core::state::AppState;
use crate::core::time::primitive_now_utc;
use crate::repositories;

/// Publishes how many in-flight requests sat on an expired lease for more than one lease period.
/// Those are requests no worker has been able to pick up.
pub(crate) async fn report_stuck_requests(state: &AppState) -> Result<i64> {
    let grace_seconds = state.settings().submission().lease_seconds as i64;
    let stuck = repositories::submission_requests::count_stuck(
        state.db(),
        primitive_now_utc(),
        grace_seconds,
    )
    .await
    .context("Failed to count stuck submission requests")?;

    metrics::gauge!("submission_requests_stuck").set(stuck as f64);
    if stuck > 0 {
        tracing::warn!(stuck, grace_seconds, "Submission requests are stuck on expired leases");
    }

    Ok(stuck)
}
