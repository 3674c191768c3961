//! In-memory message store
//!
//! Owns one agent's ordered conversation log. Assistant messages are
//! mutated in place while their reply streams and become immutable once
//! completed.

use crate::metadata::{MessageMetadata, MetadataEvent};
use crate::types::{Backend, Message, Role};
use serde::{Deserialize, Serialize};

/// Aggregate token and cost accounting across completed replies
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageTotals {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_cost_usd: f64,
    /// Completed assistant replies counted
    pub replies: usize,
}

/// Ordered conversation log for one agent
#[derive(Debug, Clone, Default)]
pub struct ConversationLog {
    messages: Vec<Message>,
}

impl ConversationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.messages.iter().rev().find(|m| m.id == id)
    }

    fn get_mut(&mut self, id: &str) -> Option<&mut Message> {
        self.messages.iter_mut().rev().find(|m| m.id == id)
    }

    /// Append a message as-is
    pub fn push(&mut self, message: Message) -> &Message {
        self.messages.push(message);
        &self.messages[self.messages.len() - 1]
    }

    pub fn push_user(&mut self, id: impl Into<String>, content: impl Into<String>) -> &Message {
        self.push(Message::new(id, Role::User, content))
    }

    pub fn push_system(&mut self, id: impl Into<String>, content: impl Into<String>) -> &Message {
        self.push(Message::new(id, Role::System, content))
    }

    /// Append an empty assistant placeholder
    pub fn begin_assistant(&mut self, id: impl Into<String>) -> &Message {
        self.push(Message::assistant_placeholder(id))
    }

    /// Append visible text to an assistant message.
    ///
    /// Returns `Some(true)` when this is the message's first visible text,
    /// `None` if the message is unknown or already complete.
    pub fn append_text(&mut self, id: &str, text: &str) -> Option<bool> {
        let message = self.get_mut(id)?;
        if message.is_complete() {
            tracing::debug!(message_id = %id, "Ignoring text for completed message");
            return None;
        }
        let first_visible = message.content.is_empty() && !text.is_empty();
        message.content.push_str(text);
        Some(first_visible)
    }

    /// Route a metadata event into the message's buckets
    pub fn apply_metadata(&mut self, id: &str, event: &MetadataEvent) -> bool {
        match self.get_mut(id) {
            Some(message) if !message.is_complete() => {
                message
                    .metadata
                    .get_or_insert_with(MessageMetadata::default)
                    .apply(event);
                true
            }
            _ => false,
        }
    }

    /// Finalize an assistant message; later mutations are refused
    pub fn complete(&mut self, id: &str) -> Option<&Message> {
        let message = self.get_mut(id)?;
        message
            .metadata
            .get_or_insert_with(MessageMetadata::default)
            .backend = Backend::StreamingComplete;
        Some(message)
    }

    /// Replace the whole log (reload)
    pub fn replace_all(&mut self, messages: Vec<Message>) {
        self.messages = messages;
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    /// Sum usage and cost over completed assistant replies
    pub fn usage_totals(&self) -> UsageTotals {
        self.messages
            .iter()
            .filter(|m| m.role == Role::Assistant && m.is_complete())
            .filter_map(|m| m.metadata.as_ref())
            .fold(UsageTotals::default(), |mut totals, meta| {
                if let Some(usage) = &meta.usage {
                    totals.input_tokens += usage.input_tokens;
                    totals.output_tokens += usage.output_tokens;
                }
                if let Some(cost) = meta.result.as_ref().and_then(|r| r.total_cost_usd) {
                    totals.total_cost_usd += cost;
                }
                totals.replies += 1;
                totals
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{MetadataKind, TurnResult, Usage};
    use serde_json::json;

    #[test]
    fn test_push_and_lookup() {
        let mut log = ConversationLog::new();
        assert!(log.is_empty());
        log.push_user("msg-1", "ls -la");
        log.begin_assistant("msg-2");
        log.push_system("msg-3", "Agent error: boom");

        assert_eq!(log.len(), 3);
        assert_eq!(log.get("msg-1").unwrap().role, Role::User);
        assert_eq!(log.get("msg-2").unwrap().content, "");
        assert_eq!(log.last().unwrap().role, Role::System);
        assert!(log.get("msg-9").is_none());
    }

    #[test]
    fn test_append_text_reports_first_visible() {
        let mut log = ConversationLog::new();
        log.begin_assistant("msg-1");

        assert_eq!(log.append_text("msg-1", ""), Some(false));
        assert_eq!(log.append_text("msg-1", "Found "), Some(true));
        assert_eq!(log.append_text("msg-1", "3 files"), Some(false));
        assert_eq!(log.get("msg-1").unwrap().content, "Found 3 files");
        assert_eq!(log.append_text("missing", "x"), None);
    }

    #[test]
    fn test_complete_freezes_message() {
        let mut log = ConversationLog::new();
        log.begin_assistant("msg-1");
        log.append_text("msg-1", "done");

        let completed = log.complete("msg-1").unwrap();
        assert!(completed.is_complete());

        assert_eq!(log.append_text("msg-1", " more"), None);
        let event =
            MetadataEvent::from_payload(MetadataKind::ToolUse, json!({"name": "Write"})).unwrap();
        assert!(!log.apply_metadata("msg-1", &event));
        assert_eq!(log.get("msg-1").unwrap().content, "done");
    }

    #[test]
    fn test_apply_metadata() {
        let mut log = ConversationLog::new();
        log.begin_assistant("msg-1");
        let event = MetadataEvent::from_payload(
            MetadataKind::System,
            json!({"session_id": "sess-1", "model": "sonnet"}),
        )
        .unwrap();
        assert!(log.apply_metadata("msg-1", &event));
        assert_eq!(log.get("msg-1").unwrap().session_id(), Some("sess-1"));
    }

    #[test]
    fn test_usage_totals_skips_live_replies() {
        let mut log = ConversationLog::new();
        for (id, cost, complete) in [("a", 0.01, true), ("b", 0.02, true), ("c", 0.5, false)] {
            log.begin_assistant(id);
            log.apply_metadata(
                id,
                &MetadataEvent::Usage(Usage {
                    input_tokens: 100,
                    output_tokens: 10,
                    cache_read_input_tokens: None,
                }),
            );
            log.apply_metadata(
                id,
                &MetadataEvent::Result(TurnResult {
                    duration_ms: 10,
                    total_cost_usd: Some(cost),
                    num_turns: None,
                }),
            );
            if complete {
                log.complete(id);
            }
        }

        let totals = log.usage_totals();
        assert_eq!(totals.replies, 2);
        assert_eq!(totals.input_tokens, 200);
        assert_eq!(totals.output_tokens, 20);
        assert!((totals.total_cost_usd - 0.03).abs() < 1e-9);
    }

    #[test]
    fn test_replace_and_clear() {
        let mut log = ConversationLog::new();
        log.push_user("msg-1", "hi");
        log.replace_all(vec![
            Message::new("x", Role::User, "a"),
            Message::new("y", Role::User, "b"),
        ]);
        assert_eq!(log.len(), 2);
        log.clear();
        assert!(log.is_empty());
    }
}
