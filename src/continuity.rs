//! Continuity across reloads
//!
//! Merges the durable log with what is already in memory and decides
//! whether the last turn is still running remotely. The in-flight check
//! is a heuristic: the agent server offers no "is this turn active" query,
//! so a trailing unanswered turn is presumed alive only for a bounded
//! window.

use crate::types::{Message, Role};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Classification of the last turn in a log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    /// Unanswered or still streaming, and recent enough to be running
    InFlight,
    /// Same shape as in-flight, but too old to still be running
    Abandoned,
    /// Answered or empty
    Done,
}

/// Result of a reload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReloadOutcome {
    pub status: TurnStatus,
    /// Messages in the log after reconciling
    pub message_count: usize,
    /// Busy indicator expiry for a turn presumed running remotely
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub busy_until: Option<DateTime<Utc>>,
    /// Session reattachment answer, if one was attempted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restored: Option<bool>,
}

/// Whether a message leaves its turn open
fn is_open_turn(message: &Message) -> bool {
    match message.role {
        Role::User => true,
        Role::Assistant => message.metadata.is_some() && !message.is_complete(),
        Role::System => false,
    }
}

/// Classify the trailing turn of `messages` as of `now`
pub fn classify(messages: &[Message], now: DateTime<Utc>, window: Duration) -> TurnStatus {
    let Some(last) = messages.last() else {
        return TurnStatus::Done;
    };
    if !is_open_turn(last) {
        return TurnStatus::Done;
    }
    if now.signed_duration_since(last.timestamp) < window {
        TurnStatus::InFlight
    } else {
        TurnStatus::Abandoned
    }
}

/// When the busy indicator for an in-flight trailing turn should lapse
pub fn busy_deadline(messages: &[Message], window: Duration) -> Option<DateTime<Utc>> {
    messages.last().map(|last| {
        last.timestamp
            .checked_add_signed(window)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    })
}

/// Merge the durable log with the in-memory one.
///
/// The durable copy wins, except for the live message of an active request
/// and for messages memory already finalized while durable still holds a
/// live snapshot. Messages known only to memory are kept. The result is
/// ordered by timestamp.
pub fn reconcile(durable: Vec<Message>, memory: &[Message], live_id: Option<&str>) -> Vec<Message> {
    let mut merged = durable;
    let mut seen: HashSet<String> = HashSet::with_capacity(merged.len());

    for message in merged.iter_mut() {
        seen.insert(message.id.clone());
        let Some(local) = memory.iter().find(|m| m.id == message.id) else {
            continue;
        };
        let is_live = live_id == Some(local.id.as_str());
        if is_live || (local.is_complete() && !message.is_complete()) {
            *message = local.clone();
        }
    }

    merged.extend(memory.iter().filter(|m| !seen.contains(&m.id)).cloned());
    merged.sort_by_key(|m| m.timestamp);
    merged
}

/// Session id to reattach: the one carried by the last assistant message
pub fn reattach_session_id(messages: &[Message]) -> Option<&str> {
    messages
        .iter()
        .rev()
        .find(|m| m.role == Role::Assistant)
        .and_then(|m| m.session_id())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::MessageMetadata;
    use crate::types::Backend;

    fn at(id: &str, role: Role, content: &str, minutes_ago: i64, now: DateTime<Utc>) -> Message {
        Message {
            timestamp: now - Duration::minutes(minutes_ago),
            ..Message::new(id, role, content)
        }
    }

    fn assistant(id: &str, content: &str, backend: Backend, minutes_ago: i64, now: DateTime<Utc>) -> Message {
        Message {
            metadata: Some(MessageMetadata {
                backend,
                session_id: Some(format!("sess-{}", id)),
                ..Default::default()
            }),
            ..at(id, Role::Assistant, content, minutes_ago, now)
        }
    }

    #[test]
    fn test_classify_empty_and_done() {
        let now = Utc::now();
        let window = Duration::minutes(5);
        assert_eq!(classify(&[], now, window), TurnStatus::Done);

        let log = vec![
            at("1", Role::User, "ls", 1, now),
            assistant("2", "ok", Backend::StreamingComplete, 1, now),
        ];
        assert_eq!(classify(&log, now, window), TurnStatus::Done);

        let log = vec![at("1", Role::System, "Agent error: boom", 0, now)];
        assert_eq!(classify(&log, now, window), TurnStatus::Done);
    }

    #[test]
    fn test_busy_deadline_saturates() {
        let now = Utc::now();
        let log = vec![at("1", Role::User, "ls", 1, now)];
        assert_eq!(
            busy_deadline(&log, Duration::minutes(5)),
            Some(log[0].timestamp + Duration::minutes(5))
        );
        assert_eq!(
            busy_deadline(&log, Duration::MAX),
            Some(DateTime::<Utc>::MAX_UTC)
        );
        assert_eq!(busy_deadline(&[], Duration::MAX), None);
    }

    #[test]
    fn test_classify_trailing_user() {
        let now = Utc::now();
        let window = Duration::minutes(5);

        let recent = vec![at("1", Role::User, "build", 1, now)];
        assert_eq!(classify(&recent, now, window), TurnStatus::InFlight);

        let stale = vec![at("1", Role::User, "build", 10, now)];
        assert_eq!(classify(&stale, now, window), TurnStatus::Abandoned);
    }

    #[test]
    fn test_classify_live_snapshot() {
        let now = Utc::now();
        let window = Duration::minutes(5);

        let recent = vec![
            at("1", Role::User, "build", 2, now),
            assistant("2", "Compiling", Backend::StreamingLive, 1, now),
        ];
        assert_eq!(classify(&recent, now, window), TurnStatus::InFlight);

        let stale = vec![
            at("1", Role::User, "build", 30, now),
            assistant("2", "Compiling", Backend::StreamingLive, 29, now),
        ];
        assert_eq!(classify(&stale, now, window), TurnStatus::Abandoned);
    }

    #[test]
    fn test_busy_deadline() {
        let now = Utc::now();
        let log = vec![at("1", Role::User, "build", 1, now)];
        let deadline = busy_deadline(&log, Duration::minutes(5)).unwrap();
        assert_eq!(deadline, now + Duration::minutes(4));
        assert!(busy_deadline(&[], Duration::minutes(5)).is_none());
    }

    #[test]
    fn test_reconcile_durable_wins() {
        let now = Utc::now();
        let durable = vec![
            at("1", Role::User, "ls", 3, now),
            assistant("2", "Found 3 files", Backend::StreamingComplete, 2, now),
        ];
        let memory = vec![
            at("1", Role::User, "ls", 3, now),
            assistant("2", "Found", Backend::StreamingComplete, 2, now),
        ];
        let merged = reconcile(durable.clone(), &memory, None);
        assert_eq!(merged, durable);
    }

    #[test]
    fn test_reconcile_keeps_live_message_and_completed_copy() {
        let now = Utc::now();
        let durable = vec![
            at("1", Role::User, "a", 5, now),
            assistant("2", "par", Backend::StreamingLive, 4, now),
            at("3", Role::User, "b", 3, now),
            assistant("4", "x", Backend::StreamingLive, 2, now),
        ];
        let memory = vec![
            at("1", Role::User, "a", 5, now),
            assistant("2", "partial done", Backend::StreamingComplete, 4, now),
            at("3", Role::User, "b", 3, now),
            assistant("4", "xyz", Backend::StreamingLive, 2, now),
        ];
        let merged = reconcile(durable, &memory, Some("4"));
        assert_eq!(merged[1].content, "partial done");
        assert_eq!(merged[3].content, "xyz");
    }

    #[test]
    fn test_reconcile_appends_memory_only_in_time_order() {
        let now = Utc::now();
        let durable = vec![at("1", Role::User, "a", 5, now), at("3", Role::User, "c", 1, now)];
        let memory = vec![at("2", Role::System, "Denied Write", 3, now)];

        let merged = reconcile(durable, &memory, None);
        let ids: Vec<&str> = merged.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
    }

    #[test]
    fn test_reattach_session_id() {
        let now = Utc::now();
        let log = vec![
            assistant("1", "a", Backend::StreamingComplete, 3, now),
            assistant("2", "b", Backend::StreamingComplete, 2, now),
            at("3", Role::User, "c", 1, now),
        ];
        assert_eq!(reattach_session_id(&log), Some("sess-2"));
        assert_eq!(reattach_session_id(&log[2..]), None);
    }
}
