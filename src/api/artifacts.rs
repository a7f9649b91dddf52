use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use uuid::Uuid;

use crate::api::errors::ApiError;
use crate::api::guards::{require_owner, StaffUser, StudentUser};
use crate::core::state::AppState;
use crate::schemas::artifact::{
    ArtifactDetailResponse, ArtifactResponse, ArtifactSearchQuery, ArtifactStateCount,
    ArtifactStatsResponse,
};
use crate::schemas::submission::{SubmissionResponse, SubmitAcceptedResponse};
use crate::services::artifact_registry::{self, NewArtifact};
use crate::services::filename;
use crate::services::storage::artifact_key;
use crate::services::submission_queue;

const SUBMIT_RATE_SCOPE: &str = "submit";

/// Multipart framing on top of the file itself.
const MULTIPART_OVERHEAD_BYTES: usize = 64 * 1024;

pub(crate) fn router(max_upload_bytes: usize) -> Router<AppState> {
    Router::new()
        .route(
            "/",
            post(upload_artifact)
                .layer(DefaultBodyLimit::max(max_upload_bytes + MULTIPART_OVERHEAD_BYTES))
                .get(search_artifacts),
        )
        .route("/stats", get(artifact_stats))
        .route("/:artifact_id", get(get_artifact))
        .route("/:artifact_id/archive", post(archive_artifact))
        .route("/:artifact_id/submit", post(submit_artifact))
}

pub(crate) fn student_router() -> Router<AppState> {
    Router::new()
        .route("/:register_number/artifacts", get(student_artifacts))
        .route("/:register_number/artifacts/:artifact_id/file", get(student_artifact_file))
}

struct UploadForm {
    filename: String,
    bytes: Vec<u8>,
    exam_session: String,
}

async fn read_upload(
    multipart: &mut Multipart,
    max_bytes: u64,
    max_mb: u64,
) -> Result<UploadForm, ApiError> {
    let mut file: Option<(String, Vec<u8>)> = None;
    let mut exam_session: Option<String> = None;

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|_| ApiError::BadRequest("Invalid multipart data".to_string()))?
    {
        match field.name().unwrap_or("") {
            "file" => {
                let filename = field.file_name().map(str::to_string).unwrap_or_default();
                let mut bytes = Vec::new();
                while let Some(chunk) = field
                    .chunk()
                    .await
                    .map_err(|_| ApiError::BadRequest("Failed to read file".to_string()))?
                {
                    if bytes.len() as u64 + chunk.len() as u64 > max_bytes {
                        return Err(ApiError::PayloadTooLarge(format!(
                            "File size exceeds {max_mb}MB limit"
                        )));
                    }
                    bytes.extend_from_slice(&chunk);
                }
                file = Some((filename, bytes));
            }
            "exam_session" => {
                let text = field
                    .text()
                    .await
                    .map_err(|_| ApiError::BadRequest("Invalid exam_session".to_string()))?;
                exam_session = Some(text.trim().to_string());
            }
            _ => {}
        }
    }

    let (filename, bytes) =
        file.ok_or_else(|| ApiError::BadRequest("File is required".to_string()))?;
    if bytes.is_empty() {
        return Err(ApiError::BadRequest("File is empty".to_string()));
    }
    let exam_session = exam_session
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ApiError::BadRequest("exam_session is required".to_string()))?;

    Ok(UploadForm { filename, bytes, exam_session })
}

/// Registers one scanned answer sheet. Bulk uploads call this once per file.
async fn upload_artifact(
    staff: StaffUser,
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<ArtifactResponse>), ApiError> {
    let storage = state.storage().cloned().ok_or_else(|| {
        ApiError::ServiceUnavailable("Blob storage is not configured".to_string())
    })?;

    let limits = state.settings().storage();
    let max_bytes = limits.max_upload_size_mb * 1024 * 1024;
    let form = read_upload(&mut multipart, max_bytes, limits.max_upload_size_mb).await?;

    let identity = filename::parse(&form.filename)?;
    if !limits.allowed_extensions.iter().any(|ext| ext.eq_ignore_ascii_case(&identity.extension)) {
        return Err(ApiError::BadRequest(format!(
            "File extension .{} is not accepted here",
            identity.extension
        )));
    }

    let artifact_id = Uuid::new_v4().to_string();
    let key = artifact_key(&form.exam_session, &artifact_id, &identity.extension);
    let blob = storage
        .put(&key, identity.mime_type(), form.bytes)
        .await
        .map_err(|e| ApiError::internal(e, "Failed to store artifact blob"))?;

    let artifact = artifact_registry::register(
        state.db(),
        &artifact_id,
        NewArtifact {
            identity: &identity,
            exam_session: &form.exam_session,
            original_filename: &form.filename,
            blob: &blob,
            uploaded_by: &staff.actor,
        },
    )
    .await
    .inspect_err(|err| {
        if matches!(err, artifact_registry::RegistryError::DuplicateArtifact { .. }) {
            tracing::warn!(storage_ref = %blob.storage_ref, "Duplicate upload left an unreferenced blob");
        }
    })?;

    Ok((StatusCode::CREATED, Json(ArtifactResponse::from_db(artifact))))
}

async fn search_artifacts(
    _staff: StaffUser,
    State(state): State<AppState>,
    Query(query): Query<ArtifactSearchQuery>,
) -> Result<Json<Vec<ArtifactResponse>>, ApiError> {
    let artifacts = artifact_registry::find(state.db(), query.register_number.trim()).await?;
    Ok(Json(artifacts.into_iter().map(ArtifactResponse::from_db).collect()))
}

async fn artifact_stats(
    _staff: StaffUser,
    State(state): State<AppState>,
) -> Result<Json<ArtifactStatsResponse>, ApiError> {
    let counts = artifact_registry::stats(state.db()).await?;
    let total = counts.iter().map(|(_, count)| count).sum();
    let by_state =
        counts.into_iter().map(|(state, count)| ArtifactStateCount { state, count }).collect();

    Ok(Json(ArtifactStatsResponse { total, by_state }))
}

async fn get_artifact(
    Path(artifact_id): Path<String>,
    _staff: StaffUser,
    State(state): State<AppState>,
) -> Result<Json<ArtifactDetailResponse>, ApiError> {
    let artifact = artifact_registry::get(state.db(), &artifact_id).await?;
    let submissions = submission_queue::history(state.db(), &artifact_id).await?;

    Ok(Json(ArtifactDetailResponse {
        artifact: ArtifactResponse::from_db(artifact),
        submissions: submissions.into_iter().map(SubmissionResponse::from_db).collect(),
    }))
}

async fn archive_artifact(
    Path(artifact_id): Path<String>,
    staff: StaffUser,
    State(state): State<AppState>,
) -> Result<Json<ArtifactResponse>, ApiError> {
    let artifact = artifact_registry::archive(state.db(), &artifact_id, &staff.actor).await?;
    Ok(Json(ArtifactResponse::from_db(artifact)))
}

async fn student_artifacts(
    Path(register_number): Path<String>,
    student: StudentUser,
    State(state): State<AppState>,
) -> Result<Json<Vec<ArtifactResponse>>, ApiError> {
    require_owner(&student, &register_number)?;
    let artifacts = artifact_registry::find(state.db(), &register_number).await?;
    Ok(Json(artifacts.into_iter().map(ArtifactResponse::from_db).collect()))
}

async fn student_artifact_file(
    Path((register_number, artifact_id)): Path<(String, String)>,
    student: StudentUser,
    State(state): State<AppState>,
) -> Result<Response, ApiError> {
    require_owner(&student, &register_number)?;
    let artifact = artifact_registry::get(state.db(), &artifact_id).await?;
    if artifact.register_number != register_number {
        return Err(ApiError::NotFound("Artifact not found".to_string()));
    }

    let storage = state.storage().ok_or_else(|| {
        ApiError::ServiceUnavailable("Blob storage is not configured".to_string())
    })?;
    let bytes = storage
        .get(&artifact.storage_ref)
        .await
        .map_err(|e| ApiError::internal(e, "Failed to read artifact file"))?;

    let mut response = (StatusCode::OK, bytes).into_response();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&artifact.mime_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    if let Ok(disposition) = HeaderValue::from_str(&format!(
        "inline; filename=\"{}\"",
        filename::sanitize(&artifact.original_filename)
    )) {
        response.headers_mut().insert(header::CONTENT_DISPOSITION, disposition);
    }
    response.headers_mut().insert(header::CACHE_CONTROL, HeaderValue::from_static("private, no-store"));
    Ok(response)
}

async fn submit_artifact(
    Path(artifact_id): Path<String>,
    student: StudentUser,
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<SubmitAcceptedResponse>), ApiError> {
    let artifact = artifact_registry::get(state.db(), &artifact_id).await?;
    require_owner(&student, &artifact.register_number)?;

    let limits = state.settings().submission();
    match state
        .redis()
        .rate_limit(
            SUBMIT_RATE_SCOPE,
            &artifact_id,
            limits.submit_rate_limit,
            limits.submit_rate_window_seconds,
        )
        .await
    {
        Ok(true) => {}
        Ok(false) => return Err(ApiError::TooManyRequests("Too many submit attempts; slow down")),
        Err(err) => {
            tracing::warn!(error = %err, "Submit rate limiter unavailable; allowing request");
        }
    }

    let request = submission_queue::enqueue(
        state.db(),
        state.cipher(),
        &artifact_id,
        &student.token,
        &student.actor(),
    )
    .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitAcceptedResponse { request_id: request.id, state: request.state }),
    ))
}
