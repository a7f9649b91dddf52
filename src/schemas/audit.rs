use serde::Serialize;

use crate::core::time::format_primitive;
use crate::db::models::AuditEvent;

#[derive(Debug, Serialize)]
pub(crate) struct AuditEventResponse {
    pub(crate) id: i64,
    pub(crate) occurred_at: String,
    pub(crate) actor_ref: String,
    pub(crate) entity_ref: String,
    pub(crate) event_type: String,
    pub(crate) before_state: Option<String>,
    pub(crate) after_state: Option<String>,
    pub(crate) detail: serde_json::Value,
}

impl AuditEventResponse {
    pub(crate) fn from_db(event: AuditEvent) -> Self {
        Self {
            id: event.id,
            occurred_at: format_primitive(event.occurred_at),
            actor_ref: event.actor_ref,
            entity_ref: event.entity_ref,
            event_type: event.event_type,
            before_state: event.before_state,
            after_state: event.after_state,
            detail: event.detail.0,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct AuditTrailResponse {
    pub(crate) entity_ref: String,
    /// Last state reached by replaying the transitions, when they are continuous.
    pub(crate) replayed_state: Option<String>,
    pub(crate) events: Vec<AuditEventResponse>,
}
