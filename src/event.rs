//! Observer events emitted by a controller
//!
//! Delivered on a `tokio::sync::broadcast` channel; slow subscribers may
//! observe `RecvError::Lagged` and should reload the log.

use crate::continuity::TurnStatus;
use crate::types::{Message, PendingApproval};
use serde::{Deserialize, Serialize};

/// Events for UI and tooling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ConversationEvent {
    /// A message was added to the log
    #[serde(rename = "message_appended")]
    MessageAppended { agent_id: String, message: Message },

    /// Visible text streamed into an assistant message
    #[serde(rename = "content_delta")]
    ContentDelta {
        agent_id: String,
        message_id: String,
        text: String,
    },

    /// An assistant message was finalized
    #[serde(rename = "message_completed")]
    MessageCompleted { agent_id: String, message: Message },

    /// First visible text arrived; the "processing" indicator is gone
    #[serde(rename = "processing_cleared")]
    ProcessingCleared { agent_id: String },

    /// The current-operation indicator changed
    #[serde(rename = "operation_changed")]
    OperationChanged {
        agent_id: String,
        operation: Option<String>,
    },

    /// A tool use is waiting for an operator decision
    #[serde(rename = "approval_required")]
    ApprovalRequired {
        agent_id: String,
        approval: PendingApproval,
    },

    /// The pending approval was decided
    #[serde(rename = "approval_resolved")]
    ApprovalResolved {
        agent_id: String,
        approval: PendingApproval,
        approved: bool,
    },

    #[serde(rename = "busy_changed")]
    BusyChanged { agent_id: String, busy: bool },

    /// The log was replaced by a reload
    #[serde(rename = "reloaded")]
    Reloaded {
        agent_id: String,
        status: TurnStatus,
        message_count: usize,
    },

    /// The operator cleared the log view
    #[serde(rename = "cleared")]
    Cleared { agent_id: String },
}

impl ConversationEvent {
    /// Agent the event belongs to
    pub fn agent_id(&self) -> &str {
        match self {
            ConversationEvent::MessageAppended { agent_id, .. }
            | ConversationEvent::ContentDelta { agent_id, .. }
            | ConversationEvent::MessageCompleted { agent_id, .. }
            | ConversationEvent::ProcessingCleared { agent_id }
            | ConversationEvent::OperationChanged { agent_id, .. }
            | ConversationEvent::ApprovalRequired { agent_id, .. }
            | ConversationEvent::ApprovalResolved { agent_id, .. }
            | ConversationEvent::BusyChanged { agent_id, .. }
            | ConversationEvent::Reloaded { agent_id, .. }
            | ConversationEvent::Cleared { agent_id } => agent_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_tagging() {
        let event = ConversationEvent::BusyChanged {
            agent_id: "builder".into(),
            busy: true,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "busy_changed");
        assert_eq!(json["busy"], true);
        assert_eq!(event.agent_id(), "builder");

        let parsed: ConversationEvent =
            serde_json::from_str(r#"{"type":"cleared","agent_id":"a"}"#).unwrap();
        assert_eq!(parsed, ConversationEvent::Cleared { agent_id: "a".into() });
    }
}
