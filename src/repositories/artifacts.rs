use sqlx::{PgConnection, PgPool};
use time::PrimitiveDateTime;

use crate::db::models::Artifact;
use crate::db::types::ArtifactState;

pub(crate) const COLUMNS: &str = "\
    id, register_number, subject_code, exam_session, original_filename, file_extension, \
    mime_type, file_size_bytes, file_hash, storage_ref, state, uploaded_by, uploaded_at, updated_at";

pub(crate) const ACTIVE_IDENTITY_CONSTRAINT: &str = "artifacts_active_identity_key";

pub(crate) struct CreateArtifact<'a> {
    pub(crate) id: &'a str,
    pub(crate) register_number: &'a str,
    pub(crate) subject_code: &'a str,
    pub(crate) exam_session: &'a str,
    pub(crate) original_filename: &'a str,
    pub(crate) file_extension: &'a str,
    pub(crate) mime_type: &'a str,
    pub(crate) file_size_bytes: i64,
    pub(crate) file_hash: &'a str,
    pub(crate) storage_ref: &'a str,
    pub(crate) uploaded_by: &'a str,
    pub(crate) uploaded_at: PrimitiveDateTime,
}

pub(crate) async fn insert(
    conn: &mut PgConnection,
    params: CreateArtifact<'_>,
) -> Result<Artifact, sqlx::Error> {
    sqlx::query_as::<_, Artifact>(&format!(
        "INSERT INTO artifacts (
            id, register_number, subject_code, exam_session, original_filename, file_extension,
            mime_type, file_size_bytes, file_hash, storage_ref, state, uploaded_by, uploaded_at,
            updated_at
         )
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $13)
         RETURNING {COLUMNS}"
    ))
    .bind(params.id)
    .bind(params.register_number)
    .bind(params.subject_code)
    .bind(params.exam_session)
    .bind(params.original_filename)
    .bind(params.file_extension)
    .bind(params.mime_type)
    .bind(params.file_size_bytes)
    .bind(params.file_hash)
    .bind(params.storage_ref)
    .bind(ArtifactState::New)
    .bind(params.uploaded_by)
    .bind(params.uploaded_at)
    .fetch_one(conn)
    .await
}

pub(crate) async fn find_by_id(pool: &PgPool, id: &str) -> Result<Option<Artifact>, sqlx::Error> {
    sqlx::query_as::<_, Artifact>(&format!("SELECT {COLUMNS} FROM artifacts WHERE id = $1"))
        .bind(id)
        .fetch_optional(pool)
        .await
}

/// Row-locks the artifact for the rest of the transaction.
pub(crate) async fn lock_by_id(
    conn: &mut PgConnection,
    id: &str,
) -> Result<Option<Artifact>, sqlx::Error> {
    sqlx::query_as::<_, Artifact>(&format!(
        "SELECT {COLUMNS} FROM artifacts WHERE id = $1 FOR UPDATE"
    ))
    .bind(id)
    .fetch_optional(conn)
    .await
}

pub(crate) async fn list_by_register_number(
    pool: &PgPool,
    register_number: &str,
) -> Result<Vec<Artifact>, sqlx::Error> {
    sqlx::query_as::<_, Artifact>(&format!(
        "SELECT {COLUMNS}
         FROM artifacts
         WHERE register_number = $1
         ORDER BY uploaded_at DESC, id"
    ))
    .bind(register_number)
    .fetch_all(pool)
    .await
}

pub(crate) async fn update_state(
    conn: &mut PgConnection,
    id: &str,
    state: ArtifactState,
    now: PrimitiveDateTime,
) -> Result<Artifact, sqlx::Error> {
    sqlx::query_as::<_, Artifact>(&format!(
        "UPDATE artifacts SET state = $1, updated_at = $2 WHERE id = $3 RETURNING {COLUMNS}"
    ))
    .bind(state)
    .bind(now)
    .bind(id)
    .fetch_one(conn)
    .await
}

pub(crate) async fn count_by_state(
    pool: &PgPool,
) -> Result<Vec<(ArtifactState, i64)>, sqlx::Error> {
    sqlx::query_as::<_, (ArtifactState, i64)>(
        "SELECT state, COUNT(*) FROM artifacts GROUP BY state ORDER BY state",
    )
    .fetch_all(pool)
    .await
}
