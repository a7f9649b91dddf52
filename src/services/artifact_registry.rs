use serde_json::json;
use sqlx::{PgConnection, PgPool};
use thiserror::Error;

use crate::core::time::primitive_now_utc;
use crate::db::is_unique_violation;
use crate::db::models::Artifact;
use crate::db::types::ArtifactState;
use crate::repositories::{artifacts, submission_requests};
use crate::services::audit_trail::{self, AuditRecord, AuditWriteFailure, EntityRef};
use crate::services::filename::ArtifactIdentity;
use crate::services::storage::StoredBlob;

#[derive(Debug, Error)]
pub(crate) enum RegistryError {
    #[error(
        "an active artifact already exists for {register_number} / {subject_code} / {exam_session}"
    )]
    DuplicateArtifact { register_number: String, subject_code: String, exam_session: String },
    #[error("artifact {0} not found")]
    NotFound(String),
    #[error("artifact {id} cannot move from {from} to {to}")]
    InvalidTransition { id: String, from: &'static str, to: &'static str },
    #[error("artifact {artifact_id} has submission {request_id} in progress")]
    InFlight { artifact_id: String, request_id: String },
    #[error(transparent)]
    Audit(#[from] AuditWriteFailure),
    #[error("artifact store error: {0}")]
    Database(#[from] sqlx::Error),
}

pub(crate) struct NewArtifact<'a> {
    pub(crate) identity: &'a ArtifactIdentity,
    pub(crate) exam_session: &'a str,
    pub(crate) original_filename: &'a str,
    pub(crate) blob: &'a StoredBlob,
    pub(crate) uploaded_by: &'a str,
}

/// Records an uploaded artifact in state `new`. The id is chosen by the caller because the blob
/// key is derived from it.
pub(crate) async fn register(
    pool: &PgPool,
    artifact_id: &str,
    params: NewArtifact<'_>,
) -> Result<Artifact, RegistryError> {
    let now = primitive_now_utc();
    let mut tx = pool.begin().await?;

    let artifact = artifacts::insert(
        &mut tx,
        artifacts::CreateArtifact {
            id: artifact_id,
            register_number: &params.identity.register_number,
            subject_code: &params.identity.subject_code,
            exam_session: params.exam_session,
            original_filename: params.original_filename,
            file_extension: &params.identity.extension,
            mime_type: params.identity.mime_type(),
            file_size_bytes: params.blob.size_bytes,
            file_hash: &params.blob.sha256_hex,
            storage_ref: &params.blob.storage_ref,
            uploaded_by: params.uploaded_by,
            uploaded_at: now,
        },
    )
    .await
    .map_err(|err| {
        if is_unique_violation(&err, artifacts::ACTIVE_IDENTITY_CONSTRAINT) {
            RegistryError::DuplicateArtifact {
                register_number: params.identity.register_number.clone(),
                subject_code: params.identity.subject_code.clone(),
                exam_session: params.exam_session.to_string(),
            }
        } else {
            RegistryError::Database(err)
        }
    })?;

    audit_trail::record(
        &mut tx,
        AuditRecord {
            entity: &EntityRef::Artifact(artifact.id.clone()),
            actor: params.uploaded_by,
            event_type: "artifact_registered",
            before: None,
            after: Some(ArtifactState::New.as_str()),
            detail: json!({
                "register_number": artifact.register_number,
                "subject_code": artifact.subject_code,
                "exam_session": artifact.exam_session,
                "file_hash": artifact.file_hash,
                "file_size_bytes": artifact.file_size_bytes,
            }),
        },
    )
    .await?;

    tx.commit().await?;

    metrics::counter!("artifacts_registered_total").increment(1);
    tracing::info!(
        artifact_id = %artifact.id,
        register_number = %artifact.register_number,
        subject_code = %artifact.subject_code,
        exam_session = %artifact.exam_session,
        "Artifact registered"
    );
    Ok(artifact)
}

pub(crate) async fn find(pool: &PgPool, register_number: &str) -> Result<Vec<Artifact>, RegistryError> {
    Ok(artifacts::list_by_register_number(pool, register_number).await?)
}

pub(crate) async fn get(pool: &PgPool, artifact_id: &str) -> Result<Artifact, RegistryError> {
    artifacts::find_by_id(pool, artifact_id)
        .await?
        .ok_or_else(|| RegistryError::NotFound(artifact_id.to_string()))
}

/// NEW → ASSIGNED on the caller's transaction. Already-assigned artifacts are returned unchanged.
pub(crate) async fn assign(
    conn: &mut PgConnection,
    artifact: Artifact,
    actor: &str,
) -> Result<Artifact, RegistryError> {
    match artifact.state {
        ArtifactState::Assigned => Ok(artifact),
        ArtifactState::New => {
            transition(conn, &artifact, ArtifactState::Assigned, actor, "artifact_assigned").await
        }
        other => Err(RegistryError::InvalidTransition {
            id: artifact.id,
            from: other.as_str(),
            to: ArtifactState::Assigned.as_str(),
        }),
    }
}

/// Idempotent; runs on the caller's transaction so it commits with the request completion.
pub(crate) async fn mark_submitted(
    conn: &mut PgConnection,
    artifact_id: &str,
    actor: &str,
) -> Result<Artifact, RegistryError> {
    let artifact = artifacts::lock_by_id(conn, artifact_id)
        .await?
        .ok_or_else(|| RegistryError::NotFound(artifact_id.to_string()))?;

    match artifact.state {
        ArtifactState::Submitted => Ok(artifact),
        ArtifactState::New | ArtifactState::Assigned => {
            transition(conn, &artifact, ArtifactState::Submitted, actor, "artifact_submitted").await
        }
        ArtifactState::Archived => Err(RegistryError::InvalidTransition {
            id: artifact.id,
            from: ArtifactState::Archived.as_str(),
            to: ArtifactState::Submitted.as_str(),
        }),
    }
}

/// Retires an artifact so its identity can be uploaded again. Refused while a submission runs.
pub(crate) async fn archive(
    pool: &PgPool,
    artifact_id: &str,
    actor: &str,
) -> Result<Artifact, RegistryError> {
    let mut tx = pool.begin().await?;

    let artifact = artifacts::lock_by_id(&mut tx, artifact_id)
        .await?
        .ok_or_else(|| RegistryError::NotFound(artifact_id.to_string()))?;
    if artifact.state == ArtifactState::Archived {
        return Ok(artifact);
    }

    if let Some(active) = submission_requests::find_active_for_artifact(&mut tx, artifact_id).await? {
        return Err(RegistryError::InFlight {
            artifact_id: artifact_id.to_string(),
            request_id: active.id,
        });
    }

    let archived =
        transition(&mut tx, &artifact, ArtifactState::Archived, actor, "artifact_archived").await?;
    tx.commit().await?;

    tracing::info!(artifact_id, actor, "Artifact archived");
    Ok(archived)
}

pub(crate) async fn stats(pool: &PgPool) -> Result<Vec<(ArtifactState, i64)>, RegistryError> {
    Ok(artifacts::count_by_state(pool).await?)
}

async fn transition(
    conn: &mut PgConnection,
    artifact: &Artifact,
    to: ArtifactState,
    actor: &str,
    event_type: &str,
) -> Result<Artifact, RegistryError> {
    let now = primitive_now_utc();
    let updated = artifacts::update_state(conn, &artifact.id, to, now).await?;

    audit_trail::record(
        conn,
        AuditRecord {
            entity: &EntityRef::Artifact(artifact.id.clone()),
            actor,
            event_type,
            before: Some(artifact.state.as_str()),
            after: Some(to.as_str()),
            detail: json!({}),
        },
    )
    .await?;

    tracing::info!(
        artifact_id = %artifact.id,
        from = artifact.state.as_str(),
        to = to.as_str(),
        "Artifact state changed"
    );
    Ok(updated)
}
