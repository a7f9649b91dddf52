use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use futures::TryStreamExt;

use crate::api::errors::ApiError;
use crate::api::guards::StaffUser;
use crate::core::state::AppState;
use crate::schemas::audit::{AuditEventResponse, AuditTrailResponse};
use crate::services::audit_trail::{self, EntityRef};

pub(crate) fn router() -> Router<AppState> {
    Router::new().route("/:entity_type/:entity_id", get(entity_trail))
}

async fn entity_trail(
    Path((entity_type, entity_id)): Path<(String, String)>,
    _staff: StaffUser,
    State(state): State<AppState>,
) -> Result<Json<AuditTrailResponse>, ApiError> {
    let entity = EntityRef::parse(&entity_type, &entity_id)
        .ok_or_else(|| ApiError::BadRequest(format!("Unknown entity type {entity_type}")))?;
    let entity_ref = entity.to_string();

    let events: Vec<_> = audit_trail::query(state.db(), &entity_ref)
        .try_collect()
        .await
        .map_err(|e| ApiError::internal(e, "Failed to read audit trail"))?;

    let replayed_state = match audit_trail::replay(&events) {
        Ok(state) => state,
        Err(err) => {
            tracing::error!(entity_ref = %entity_ref, error = %err, "Audit trail is discontinuous");
            None
        }
    };

    Ok(Json(AuditTrailResponse {
        entity_ref,
        replayed_state,
        events: events.into_iter().map(AuditEventResponse::from_db).collect(),
    }))
}
