use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    New,
    Active,
    Paused,
    Crashed,
    Completed,
    Recovered,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::New => "new",
            SessionState::Active => "active",
            SessionState::Paused => "paused",
            SessionState::Crashed => "crashed",
            SessionState::Completed => "completed",
            SessionState::Recovered => "recovered",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
    Tool,
}

/// One conversation entry. Append-only within a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl ConversationMessage {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
            metadata: BTreeMap::new(),
        }
    }
}

/// Serializable record of an operation that had not finished when the
/// snapshot was taken. Held by value so recovery can reconstruct work
/// without live references into the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
    pub id: String,
    pub kind: String,
    pub payload: Value,
}

impl PendingOperation {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind: kind.into(),
            payload,
        }
    }
}

/// Full durable state of one session. The checksum covers the serialized
/// snapshot minus the checksum field itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub messages: Vec<ConversationMessage>,
    #[serde(default)]
    pub context: BTreeMap<String, Value>,
    pub working_directory: String,
    #[serde(default)]
    pub open_files: Vec<String>,
    #[serde(default)]
    pub pending_operations: Vec<PendingOperation>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    #[serde(default)]
    pub checksum: String,
}

impl SessionSnapshot {
    pub fn new(session_id: impl Into<String>, working_directory: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            state: SessionState::Active,
            created_at: now,
            updated_at: now,
            messages: Vec::new(),
            context: BTreeMap::new(),
            working_directory: working_directory.into(),
            open_files: Vec::new(),
            pending_operations: Vec::new(),
            metadata: BTreeMap::new(),
            checksum: String::new(),
        }
    }
}

/// Index entry describing a stored session without loading it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub message_count: usize,
    pub working_directory: String,
    pub summary: String,
}
