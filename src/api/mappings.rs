use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use validator::Validate;

use crate::api::errors::ApiError;
use crate::api::guards::StaffUser;
use crate::core::state::AppState;
use crate::schemas::mapping::{MappingResponse, MappingUpsertRequest};
use crate::services::filename;

pub(crate) fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_mappings))
        .route("/:subject_code", get(resolve_mapping).put(upsert_mapping))
}

async fn list_mappings(
    _staff: StaffUser,
    State(state): State<AppState>,
) -> Result<Json<Vec<MappingResponse>>, ApiError> {
    let mappings = state.mapper().list().await?;
    Ok(Json(mappings.into_iter().map(MappingResponse::from_db).collect()))
}

/// Resolves through the full lookup chain, so staff can check a subject before results open.
async fn resolve_mapping(
    Path(subject_code): Path<String>,
    _staff: StaffUser,
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let resolved = state.mapper().lookup(&subject_code).await?;
    Ok(Json(serde_json::json!({
        "subject_code": subject_code.trim().to_ascii_uppercase(),
        "lms_assignment_id": resolved.assignment_id,
        "source": resolved.source.as_str(),
    })))
}

async fn upsert_mapping(
    Path(subject_code): Path<String>,
    staff: StaffUser,
    State(state): State<AppState>,
    Json(payload): Json<MappingUpsertRequest>,
) -> Result<Json<MappingResponse>, ApiError> {
    payload.validate().map_err(|e| ApiError::BadRequest(e.to_string()))?;
    if !filename::is_subject_code(subject_code.trim()) {
        return Err(ApiError::BadRequest("subject code must be 2-10 letters or digits".to_string()));
    }

    let mapping = state
        .mapper()
        .upsert(
            &subject_code,
            payload.lms_course_id,
            payload.lms_assignment_id,
            payload.assignment_name.as_deref(),
            payload.is_active,
        )
        .await?;

    tracing::info!(actor = %staff.actor, subject_code = %mapping.subject_code, "Mapping updated by staff");
    Ok(Json(MappingResponse::from_db(mapping)))
}
