//! Core conversation types and wire shapes
//!
//! Request bodies use camelCase JSON to match the agent server; message
//! metadata keeps the snake_case keys the agent emits.

use crate::metadata::MessageMetadata;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Author of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::System => write!(f, "system"),
        }
    }
}

/// A single entry in the conversation log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Locally generated identifier (msg-<session>-<seq>)
    pub id: String,

    /// Creation instant
    pub timestamp: DateTime<Utc>,

    pub role: Role,

    /// Visible text. Mutated in place while an assistant reply streams.
    #[serde(default)]
    pub content: String,

    /// Streaming metadata, assistant messages only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMetadata>,
}

impl Message {
    pub fn new(id: impl Into<String>, role: Role, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            timestamp: Utc::now(),
            role,
            content: content.into(),
            metadata: None,
        }
    }

    /// Empty assistant placeholder carrying live metadata
    pub fn assistant_placeholder(id: impl Into<String>) -> Self {
        Self {
            metadata: Some(MessageMetadata::default()),
            ..Self::new(id, Role::Assistant, "")
        }
    }

    /// Whether this assistant message has been finalized by a `complete` frame
    pub fn is_complete(&self) -> bool {
        self.metadata
            .as_ref()
            .is_some_and(|m| m.backend == Backend::StreamingComplete)
    }

    /// Remote session id echoed by the agent, if any
    pub fn session_id(&self) -> Option<&str> {
        self.metadata.as_ref().and_then(|m| m.session_id.as_deref())
    }
}

/// Snapshot tag distinguishing intermediate writes from the final one
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Backend {
    /// Intermediate snapshot; never authoritative for completion
    #[default]
    #[serde(rename = "streaming-live")]
    StreamingLive,
    /// Final snapshot written once on `complete`
    #[serde(rename = "streaming-complete")]
    StreamingComplete,
}

/// A tool use awaiting an operator decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingApproval {
    pub tool_name: String,
    /// Human-readable description of what the tool is about to do
    pub operation: String,
    /// Assistant message the tool use arrived on
    pub message_id: String,
    pub requires_approval: bool,
}

/// Generates monotonically unique message ids for one client session
#[derive(Debug)]
pub struct MessageIdGenerator {
    epoch_ms: i64,
    seq: AtomicU64,
}

impl MessageIdGenerator {
    pub fn new() -> Self {
        Self {
            epoch_ms: Utc::now().timestamp_millis(),
            seq: AtomicU64::new(0),
        }
    }

    pub fn next_id(&self) -> String {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        format!("msg-{}-{}", self.epoch_ms, seq)
    }
}

impl Default for MessageIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Wire shapes
// ============================================================================

/// Body of a command request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRequest {
    pub message: String,
    pub model: String,
}

/// Body of a durable-store write
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistRequest {
    pub message: String,
    pub role: Role,
    pub message_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Option<MessageMetadata>,
    pub save_only: bool,
}

impl From<&Message> for PersistRequest {
    fn from(message: &Message) -> Self {
        Self {
            message: message.content.clone(),
            role: message.role,
            message_id: message.id.clone(),
            timestamp: message.timestamp,
            metadata: message.metadata.clone(),
            save_only: true,
        }
    }
}

impl PersistRequest {
    /// Rebuild the message this write describes
    pub fn into_message(self) -> Message {
        Message {
            id: self.message_id,
            timestamp: self.timestamp,
            role: self.role,
            content: self.message,
            metadata: self.metadata,
        }
    }
}

/// Durable store read response
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationSnapshot {
    #[serde(default)]
    pub messages: Vec<Message>,
}

/// Body of a tool-approval submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalDecision {
    pub message_id: String,
    pub tool_name: String,
    pub approved: bool,
}

/// Body of a session-restore request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreRequest {
    pub session_id: String,
    pub model: String,
}

/// Session-restore response
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestoreResponse {
    #[serde(default)]
    pub restored: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_serde() {
        assert_eq!(serde_json::to_string(&Role::Assistant).unwrap(), "\"assistant\"");
        let role: Role = serde_json::from_str("\"system\"").unwrap();
        assert_eq!(role, Role::System);
    }

    #[test]
    fn test_backend_serde() {
        assert_eq!(
            serde_json::to_string(&Backend::StreamingLive).unwrap(),
            "\"streaming-live\""
        );
        let backend: Backend = serde_json::from_str("\"streaming-complete\"").unwrap();
        assert_eq!(backend, Backend::StreamingComplete);
    }

    #[test]
    fn test_message_ids_are_unique_and_ordered() {
        let ids = MessageIdGenerator::new();
        let a = ids.next_id();
        let b = ids.next_id();
        assert_ne!(a, b);
        assert!(a.starts_with("msg-"));
        assert!(a.ends_with("-0"));
        assert!(b.ends_with("-1"));
    }

    #[test]
    fn test_placeholder_is_live() {
        let msg = Message::assistant_placeholder("msg-1");
        assert_eq!(msg.content, "");
        assert!(!msg.is_complete());
        assert_eq!(msg.metadata.unwrap().backend, Backend::StreamingLive);
    }

    #[test]
    fn test_persist_request_wire_shape() {
        let msg = Message::new("msg-7", Role::User, "ls -la");
        let json = serde_json::to_value(PersistRequest::from(&msg)).unwrap();

        assert_eq!(json["message"], "ls -la");
        assert_eq!(json["role"], "user");
        assert_eq!(json["messageId"], "msg-7");
        assert_eq!(json["saveOnly"], true);
        assert!(json["metadata"].is_null());
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn test_pending_approval_camel_case() {
        let pending = PendingApproval {
            tool_name: "Write".into(),
            operation: "Write: notes.md".into(),
            message_id: "msg-2".into(),
            requires_approval: true,
        };
        let json = serde_json::to_value(&pending).unwrap();
        assert_eq!(json["toolName"], "Write");
        assert_eq!(json["requiresApproval"], true);
    }

    #[test]
    fn test_snapshot_missing_messages() {
        let snapshot: ConversationSnapshot = serde_json::from_str("{}").unwrap();
        assert!(snapshot.messages.is_empty());
    }
}
