use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// In-process event published on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeEvent {
    pub id: String,
    pub event_type: String,
    pub payload: Value,
    pub source: String,
    pub created_at: DateTime<Utc>,
}

impl RuntimeEvent {
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            payload,
            source: "supervisor".to_string(),
            created_at: Utc::now(),
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }
}

/// Durable outbox row. A row is either pending delivery (`delivered_at` is
/// `None`) or delivered; delivered rows may be purged after retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: String,
    pub event_type: String,
    pub payload: Value,
    pub source: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry_count: u32,
}

impl OutboxEvent {
    pub fn from_runtime(event: &RuntimeEvent) -> Self {
        Self {
            id: event.id.clone(),
            event_type: event.event_type.clone(),
            payload: event.payload.clone(),
            source: event.source.clone(),
            created_at: event.created_at,
            delivered_at: None,
            retry_count: 0,
        }
    }

    pub fn to_runtime(&self) -> RuntimeEvent {
        RuntimeEvent {
            id: self.id.clone(),
            event_type: self.event_type.clone(),
            payload: self.payload.clone(),
            source: self.source.clone(),
            created_at: self.created_at,
        }
    }
}

/// Well-known event types emitted by the supervisor.
pub mod event_types {
    pub const TASK_RECEIVED: &str = "task.received";
    pub const TASK_STEP: &str = "task.step";
    pub const TASK_COMPLETED: &str = "task.completed";
    pub const TASK_FAILED: &str = "task.failed";
    pub const APPROVAL_ASKED: &str = "approval.asked";
    pub const APPROVAL_REPLIED: &str = "approval.replied";
    pub const SESSION_STATUS: &str = "session.status";
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn outbox_row_preserves_runtime_identity() {
        let event = RuntimeEvent::new(event_types::TASK_COMPLETED, json!({"task_id": "t-1"}));
        let row = OutboxEvent::from_runtime(&event);
        assert_eq!(row.id, event.id);
        assert!(row.delivered_at.is_none());
        let back = row.to_runtime();
        assert_eq!(back.event_type, event.event_type);
        assert_eq!(back.payload, event.payload);
    }
}
