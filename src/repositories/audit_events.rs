use futures::stream::BoxStream;
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool};

use crate::db::models::AuditEvent;

pub(crate) struct InsertAuditEvent<'a> {
    pub(crate) actor_ref: &'a str,
    pub(crate) entity_ref: &'a str,
    pub(crate) event_type: &'a str,
    pub(crate) before_state: Option<&'a str>,
    pub(crate) after_state: Option<&'a str>,
    pub(crate) detail: serde_json::Value,
}

/// `occurred_at` comes from the database clock at insert time, after the caller's row lock.
pub(crate) async fn insert(
    conn: &mut PgConnection,
    params: InsertAuditEvent<'_>,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>(
        "INSERT INTO audit_events (
            occurred_at, actor_ref, entity_ref, event_type, before_state, after_state, detail
         )
         VALUES (clock_timestamp() AT TIME ZONE 'UTC', $1, $2, $3, $4, $5, $6)
         RETURNING id",
    )
    .bind(params.actor_ref)
    .bind(params.entity_ref)
    .bind(params.event_type)
    .bind(params.before_state)
    .bind(params.after_state)
    .bind(Json(params.detail))
    .fetch_one(conn)
    .await
}

/// Rows are fetched through a server-side cursor as the stream is polled. Writers for one entity
/// hold its row lock, so `id` order is commit order.
pub(crate) fn stream_by_entity<'a>(
    pool: &'a PgPool,
    entity_ref: &'a str,
) -> BoxStream<'a, Result<AuditEvent, sqlx::Error>> {
    sqlx::query_as::<_, AuditEvent>(
        "SELECT id, occurred_at, actor_ref, entity_ref, event_type, before_state, after_state, \
                detail
         FROM audit_events
         WHERE entity_ref = $1
         ORDER BY id",
    )
    .bind(entity_ref)
    .fetch(pool)
}
