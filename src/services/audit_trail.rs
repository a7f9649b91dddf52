use std::fmt;

use futures::stream::BoxStream;
use serde_json::Value;
use sqlx::{PgConnection, PgPool};
use thiserror::Error;

use crate::db::models::AuditEvent;
use crate::repositories::audit_events::{self, InsertAuditEvent};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum EntityRef {
    Artifact(String),
    Submission(String),
}

impl EntityRef {
    pub(crate) fn parse(entity_type: &str, entity_id: &str) -> Option<Self> {
        if entity_id.trim().is_empty() {
            return None;
        }
        match entity_type {
            "artifact" | "artifacts" => Some(Self::Artifact(entity_id.to_string())),
            "submission" | "submissions" => Some(Self::Submission(entity_id.to_string())),
            _ => None,
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Artifact(id) => write!(f, "artifact:{id}"),
            Self::Submission(id) => write!(f, "submission:{id}"),
        }
    }
}

/// The audit row could not be written, so the transition it describes must not commit.
#[derive(Debug, Error)]
#[error("audit trail unavailable: {0}")]
pub(crate) struct AuditWriteFailure(#[source] pub(crate) sqlx::Error);

pub(crate) struct AuditRecord<'a> {
    pub(crate) entity: &'a EntityRef,
    pub(crate) actor: &'a str,
    pub(crate) event_type: &'a str,
    pub(crate) before: Option<&'a str>,
    pub(crate) after: Option<&'a str>,
    pub(crate) detail: Value,
}

/// Appends one event on the caller's connection; run it inside the transition's transaction.
pub(crate) async fn record(
    conn: &mut PgConnection,
    record: AuditRecord<'_>,
) -> Result<i64, AuditWriteFailure> {
    let entity_ref = record.entity.to_string();
    let id = audit_events::insert(
        conn,
        InsertAuditEvent {
            actor_ref: record.actor,
            entity_ref: &entity_ref,
            event_type: record.event_type,
            before_state: record.before,
            after_state: record.after,
            detail: record.detail,
        },
    )
    .await
    .map_err(AuditWriteFailure)?;

    tracing::debug!(
        audit_id = id,
        entity_ref = %entity_ref,
        event_type = record.event_type,
        before = record.before.unwrap_or("-"),
        after = record.after.unwrap_or("-"),
        "Audit event recorded"
    );
    Ok(id)
}

/// Events for one entity in the order they were committed, fetched lazily.
pub(crate) fn query<'a>(
    pool: &'a PgPool,
    entity_ref: &'a str,
) -> BoxStream<'a, Result<AuditEvent, sqlx::Error>> {
    audit_events::stream_by_entity(pool, entity_ref)
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub(crate) enum ReplayError {
    #[error("event {event_id} starts from {found:?} but the previous state was {expected:?}")]
    Discontinuity { event_id: i64, expected: Option<String>, found: Option<String> },
}

/// Folds transition events into the last recorded state. Events without `after_state` are
/// annotations and do not move the state.
pub(crate) fn replay<'a, I>(events: I) -> Result<Option<String>, ReplayError>
where
    I: IntoIterator<Item = &'a AuditEvent>,
{
    let mut current: Option<String> = None;

    for event in events {
        let Some(after) = event.after_state.as_ref() else {
            continue;
        };
        if event.before_state != current {
            return Err(ReplayError::Discontinuity {
                event_id: event.id,
                expected: current,
                found: event.before_state.clone(),
            });
        }
        current = Some(after.clone());
    }

    Ok(current)
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use sqlx::types::Json;
    use time::macros::datetime;

    use super::*;

    const SYSTEM_ACTOR: &str = "system";

    fn event(id: i64, event_type: &str, before: Option<&str>, after: Option<&str>) -> AuditEvent {
        AuditEvent {
            id,
            occurred_at: datetime!(2025-03-01 10:00:00),
            actor_ref: SYSTEM_ACTOR.to_string(),
            entity_ref: "submission:abc".to_string(),
            event_type: event_type.to_string(),
            before_state: before.map(str::to_string),
            after_state: after.map(str::to_string),
            detail: Json(json!({})),
        }
    }

    #[test]
    fn entity_refs_render_with_type_prefix() {
        assert_eq!(EntityRef::Artifact("a1".into()).to_string(), "artifact:a1");
        assert_eq!(
            EntityRef::parse("submissions", "s1"),
            Some(EntityRef::Submission("s1".into()))
        );
        assert_eq!(EntityRef::parse("user", "u1"), None);
        assert_eq!(EntityRef::parse("artifact", " "), None);
    }

    #[test]
    fn replay_reconstructs_final_state() {
        let events = vec![
            event(1, "submission_created", None, Some("pending")),
            event(2, "step_started", Some("pending"), Some("uploading")),
            event(3, "handle_recorded", Some("uploading"), Some("uploading")),
            event(4, "step_started", Some("uploading"), Some("saving")),
            event(5, "retry_scheduled", Some("saving"), Some("retry_scheduled")),
            event(6, "lease_released", None, None),
            event(7, "step_started", Some("retry_scheduled"), Some("saving")),
            event(8, "step_started", Some("saving"), Some("submitting")),
            event(9, "submitted", Some("submitting"), Some("submitted")),
        ];

        assert_eq!(replay(&events), Ok(Some("submitted".to_string())));
    }

    #[test]
    fn replay_of_nothing_is_no_state() {
        assert_eq!(replay(&Vec::new()), Ok(None));
    }

    #[test]
    fn replay_rejects_gaps() {
        let events = vec![
            event(1, "submission_created", None, Some("pending")),
            event(2, "step_started", Some("saving"), Some("submitting")),
        ];

        assert_eq!(
            replay(&events),
            Err(ReplayError::Discontinuity {
                event_id: 2,
                expected: Some("pending".to_string()),
                found: Some("saving".to_string()),
            })
        );
    }
}
