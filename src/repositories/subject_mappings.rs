use sqlx::PgPool;
use time::PrimitiveDateTime;

use crate::db::models::SubjectMapping;

const COLUMNS: &str = "\
    subject_code, lms_course_id, lms_assignment_id, assignment_name, source, is_active, \
    created_at, updated_at";

pub(crate) struct UpsertMapping<'a> {
    pub(crate) subject_code: &'a str,
    pub(crate) lms_course_id: Option<i64>,
    pub(crate) lms_assignment_id: i64,
    pub(crate) assignment_name: Option<&'a str>,
    pub(crate) source: &'a str,
    pub(crate) is_active: bool,
    pub(crate) now: PrimitiveDateTime,
}

pub(crate) async fn find_active(
    pool: &PgPool,
    subject_code: &str,
) -> Result<Option<SubjectMapping>, sqlx::Error> {
    sqlx::query_as::<_, SubjectMapping>(&format!(
        "SELECT {COLUMNS}
         FROM subject_mappings
         WHERE subject_code = UPPER($1) AND is_active = TRUE"
    ))
    .bind(subject_code)
    .fetch_optional(pool)
    .await
}

pub(crate) async fn list(pool: &PgPool) -> Result<Vec<SubjectMapping>, sqlx::Error> {
    sqlx::query_as::<_, SubjectMapping>(&format!(
        "SELECT {COLUMNS} FROM subject_mappings ORDER BY subject_code"
    ))
    .fetch_all(pool)
    .await
}

pub(crate) async fn upsert(
    pool: &PgPool,
    params: UpsertMapping<'_>,
) -> Result<SubjectMapping, sqlx::Error> {
    sqlx::query_as::<_, SubjectMapping>(&format!(
        "INSERT INTO subject_mappings (
            subject_code, lms_course_id, lms_assignment_id, assignment_name, source, is_active,
            created_at, updated_at
         )
         VALUES (UPPER($1), $2, $3, $4, $5, $6, $7, $7)
         ON CONFLICT (subject_code) DO UPDATE
         SET lms_course_id = EXCLUDED.lms_course_id,
             lms_assignment_id = EXCLUDED.lms_assignment_id,
             assignment_name = EXCLUDED.assignment_name,
             source = EXCLUDED.source,
             is_active = EXCLUDED.is_active,
             updated_at = EXCLUDED.updated_at
         RETURNING {COLUMNS}"
    ))
    .bind(params.subject_code)
    .bind(params.lms_course_id)
    .bind(params.lms_assignment_id)
    .bind(params.assignment_name)
    .bind(params.source)
    .bind(params.is_active)
    .bind(params.now)
    .fetch_one(pool)
    .await
}
