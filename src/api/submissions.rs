use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};

use crate::api::errors::ApiError;
use crate::api::guards::{require_owner, Caller, StaffUser};
use crate::core::state::AppState;
use crate::schemas::submission::{CancelResponse, SubmissionResponse};
use crate::services::artifact_registry;
use crate::services::submission_queue::{self, CancelOutcome};

pub(crate) fn router() -> Router<AppState> {
    Router::new()
        .route("/:request_id", get(get_status))
        .route("/:request_id/cancel", post(cancel_submission))
}

async fn get_status(
    Path(request_id): Path<String>,
    caller: Caller,
    State(state): State<AppState>,
) -> Result<Json<SubmissionResponse>, ApiError> {
    let request = submission_queue::status(state.db(), &request_id).await?;

    if let Caller::Student(student) = &caller {
        let artifact = artifact_registry::get(state.db(), &request.artifact_id).await?;
        require_owner(student, &artifact.register_number)?;
    }

    Ok(Json(SubmissionResponse::from_db(request)))
}

async fn cancel_submission(
    Path(request_id): Path<String>,
    staff: StaffUser,
    State(state): State<AppState>,
) -> Result<Json<CancelResponse>, ApiError> {
    let (outcome, request) =
        match submission_queue::cancel(state.db(), &request_id, &staff.actor).await? {
            CancelOutcome::Cancelled(request) => ("cancelled", request),
            CancelOutcome::Flagged(request) => ("cancel_requested", request),
            CancelOutcome::AlreadyTerminal(request) => ("already_terminal", request),
        };

    Ok(Json(CancelResponse { outcome, submission: SubmissionResponse::from_db(request) }))
}
