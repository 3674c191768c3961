//! Out-of-band metadata carried by assistant messages
//!
//! Metadata arrives inside chunk frames as sentinels (see [`crate::sentinel`])
//! and is routed into per-message buckets here.

use crate::error::Result;
use crate::types::Backend;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Metadata attached to an assistant message
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Remote session id, the key used for reattachment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    #[serde(default)]
    pub tools: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,

    #[serde(default)]
    pub tool_uses: Vec<ToolUseEvent>,

    #[serde(default)]
    pub tool_results: Vec<ToolResultEvent>,

    #[serde(default)]
    pub thinking: Vec<ThinkingEvent>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TurnResult>,

    #[serde(default)]
    pub backend: Backend,
}

/// Token usage reported by the agent
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read_input_tokens: Option<u64>,
}

/// A tool invocation announced by the agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolUseEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub input: serde_json::Value,
}

impl ToolUseEvent {
    /// Short description of the operation for indicators and approval prompts
    pub fn operation(&self) -> String {
        const TARGET_KEYS: [&str; 6] = ["command", "file_path", "path", "pattern", "url", "query"];

        let target = TARGET_KEYS
            .iter()
            .find_map(|key| self.input.get(*key).and_then(|v| v.as_str()));

        match target {
            Some(target) => format!("{}: {}", self.name, target),
            None => self.name.clone(),
        }
    }
}

/// Result of a tool invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
    #[serde(default)]
    pub content: serde_json::Value,
    #[serde(default)]
    pub is_error: bool,
}

/// A reasoning block emitted by the agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThinkingEvent {
    #[serde(default, alias = "thinking")]
    pub content: String,
}

/// Final accounting for a turn
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnResult {
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_cost_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_turns: Option<u32>,
}

/// Payload of a `SYSTEM` sentinel
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemInfo {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub tools: Vec<String>,
}

/// Sentinel type token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetadataKind {
    System,
    Usage,
    ToolUse,
    ToolResult,
    Thinking,
    Result,
}

impl FromStr for MetadataKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "SYSTEM" => Ok(MetadataKind::System),
            "USAGE" => Ok(MetadataKind::Usage),
            "TOOL_USE" => Ok(MetadataKind::ToolUse),
            "TOOL_RESULT" => Ok(MetadataKind::ToolResult),
            "THINKING" => Ok(MetadataKind::Thinking),
            "RESULT" => Ok(MetadataKind::Result),
            other => Err(format!("unknown metadata type: {}", other)),
        }
    }
}

/// A decoded metadata item
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataEvent {
    System(SystemInfo),
    Usage(Usage),
    ToolUse(ToolUseEvent),
    ToolResult(ToolResultEvent),
    Thinking(ThinkingEvent),
    Result(TurnResult),
}

impl MetadataEvent {
    /// Decode a sentinel payload of the given kind
    pub fn from_payload(kind: MetadataKind, payload: serde_json::Value) -> Result<Self> {
        let event = match kind {
            MetadataKind::System => MetadataEvent::System(serde_json::from_value(payload)?),
            MetadataKind::Usage => MetadataEvent::Usage(serde_json::from_value(payload)?),
            MetadataKind::ToolUse => MetadataEvent::ToolUse(serde_json::from_value(payload)?),
            MetadataKind::ToolResult => {
                MetadataEvent::ToolResult(serde_json::from_value(payload)?)
            }
            MetadataKind::Thinking => MetadataEvent::Thinking(serde_json::from_value(payload)?),
            MetadataKind::Result => MetadataEvent::Result(serde_json::from_value(payload)?),
        };
        Ok(event)
    }
}

impl MessageMetadata {
    /// Route a metadata event into its bucket
    pub fn apply(&mut self, event: &MetadataEvent) {
        match event {
            MetadataEvent::System(info) => {
                if info.model.is_some() {
                    self.model = info.model.clone();
                }
                if info.session_id.is_some() {
                    self.session_id = info.session_id.clone();
                }
                if !info.tools.is_empty() {
                    self.tools = info.tools.clone();
                }
            }
            MetadataEvent::Usage(usage) => self.usage = Some(usage.clone()),
            MetadataEvent::ToolUse(tool_use) => self.tool_uses.push(tool_use.clone()),
            MetadataEvent::ToolResult(result) => self.tool_results.push(result.clone()),
            MetadataEvent::Thinking(thinking) => self.thinking.push(thinking.clone()),
            MetadataEvent::Result(result) => self.result = Some(result.clone()),
        }
    }
}
