//! Configuration for a3s-converse
//!
//! Provides configuration for:
//! - Agent endpoints (one long-running agent server per agent id)
//! - Endpoint paths of the agent server protocol
//! - Tool-approval policy
//! - Persistence throttling and continuity heuristics
//!
//! Configuration is built programmatically or loaded from a JSON file.

use crate::approval::ApprovalPolicy;
use crate::error::{ConverseError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default model sent with every command
pub const DEFAULT_MODEL: &str = "sonnet";

/// Command sent to the agent after an approved tool use
pub const DEFAULT_CONTINUATION_DIRECTIVE: &str =
    "The requested tool use was approved. Proceed with it and report the outcome.";

// ============================================================================
// Endpoints
// ============================================================================

/// One agent server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentEndpoint {
    /// Agent id used to address the controller
    pub id: String,
    /// Base URL of the agent server (e.g., "http://localhost:4001")
    pub base_url: String,
    /// Per-agent model override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Paths of the agent server protocol
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointPaths {
    #[serde(default = "default_command_path")]
    pub command: String,
    #[serde(default = "default_conversation_path")]
    pub conversation: String,
    #[serde(default = "default_tool_approval_path")]
    pub tool_approval: String,
    #[serde(default = "default_session_restore_path")]
    pub session_restore: String,
}

fn default_command_path() -> String {
    "/chat".to_string()
}

fn default_conversation_path() -> String {
    "/conversation".to_string()
}

fn default_tool_approval_path() -> String {
    "/tool-approval".to_string()
}

fn default_session_restore_path() -> String {
    "/session-restore".to_string()
}

impl Default for EndpointPaths {
    fn default() -> Self {
        Self {
            command: default_command_path(),
            conversation: default_conversation_path(),
            tool_approval: default_tool_approval_path(),
            session_restore: default_session_restore_path(),
        }
    }
}

// ============================================================================
// Persistence & Continuity
// ============================================================================

/// Snapshot throttling while a reply streams
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistenceConfig {
    /// Save a live snapshot every N chunk frames
    #[serde(default = "default_chunk_interval")]
    pub chunk_interval: u32,
    /// ...or once this much time passed since the last snapshot
    #[serde(default = "default_time_interval_ms")]
    pub time_interval_ms: u64,
}

fn default_chunk_interval() -> u32 {
    5
}

fn default_time_interval_ms() -> u64 {
    2_000
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            chunk_interval: default_chunk_interval(),
            time_interval_ms: default_time_interval_ms(),
        }
    }
}

impl PersistenceConfig {
    pub fn time_interval(&self) -> Duration {
        Duration::from_millis(self.time_interval_ms)
    }
}

/// Reload heuristics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContinuityConfig {
    /// A trailing unanswered turn younger than this is treated as in flight
    #[serde(default = "default_in_flight_window_secs")]
    pub in_flight_window_secs: u64,
    /// Attempt session reattachment on reload
    #[serde(default = "default_true")]
    pub reattach_sessions: bool,
}

fn default_in_flight_window_secs() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

impl Default for ContinuityConfig {
    fn default() -> Self {
        Self {
            in_flight_window_secs: default_in_flight_window_secs(),
            reattach_sessions: true,
        }
    }
}

impl ContinuityConfig {
    /// Window as a signed duration, saturating at the largest representable one
    pub fn in_flight_window(&self) -> chrono::Duration {
        i64::try_from(self.in_flight_window_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::Duration::MAX)
    }
}

// ============================================================================
// Per-controller configuration
// ============================================================================

/// Everything one agent controller needs besides its collaborators
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    pub model: String,
    pub approval: ApprovalPolicy,
    pub persistence: PersistenceConfig,
    pub continuity: ContinuityConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            approval: ApprovalPolicy::default(),
            persistence: PersistenceConfig::default(),
            continuity: ContinuityConfig::default(),
        }
    }
}

// ============================================================================
// Main Configuration
// ============================================================================

/// Configuration for a3s-converse
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConverseConfig {
    /// Model used when an agent has no override
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Known agents
    #[serde(default)]
    pub agents: Vec<AgentEndpoint>,

    /// Agent server paths
    #[serde(default)]
    pub paths: EndpointPaths,

    /// Tool-approval policy shared by all agents
    #[serde(default)]
    pub approval: ApprovalPolicy,

    #[serde(default)]
    pub persistence: PersistenceConfig,

    #[serde(default)]
    pub continuity: ContinuityConfig,

    /// Command sent after an approval; empty disables auto-continuation
    #[serde(default = "default_continuation_directive")]
    pub continuation_directive: String,

    /// Keep conversations in local JSON files instead of the agent server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_dir: Option<PathBuf>,
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_continuation_directive() -> String {
    DEFAULT_CONTINUATION_DIRECTIVE.to_string()
}

impl Default for ConverseConfig {
    fn default() -> Self {
        Self {
            default_model: default_model(),
            agents: Vec::new(),
            paths: EndpointPaths::default(),
            approval: ApprovalPolicy::default(),
            persistence: PersistenceConfig::default(),
            continuity: ContinuityConfig::default(),
            continuation_directive: default_continuation_directive(),
            store_dir: None,
        }
    }
}

impl ConverseConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ConverseError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let config: Self = serde_json::from_str(&content).map_err(|e| {
            ConverseError::Config(format!(
                "Failed to parse config file {}: {}",
                path.display(),
                e
            ))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a JSON file
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ConverseError::Config(format!(
                    "Failed to create config directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|e| {
            ConverseError::Config(format!(
                "Failed to write config file {}: {}",
                path.display(),
                e
            ))
        })?;

        Ok(())
    }

    /// Check invariants serde cannot express
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for agent in &self.agents {
            if agent.id.trim().is_empty() {
                return Err(ConverseError::Config("agent id must not be empty".into()));
            }
            if agent.base_url.trim().is_empty() {
                return Err(ConverseError::Config(format!(
                    "agent '{}' has no baseUrl",
                    agent.id
                )));
            }
            if !seen.insert(agent.id.as_str()) {
                return Err(ConverseError::Config(format!(
                    "duplicate agent id '{}'",
                    agent.id
                )));
            }
        }
        if self.persistence.chunk_interval == 0 {
            return Err(ConverseError::Config(
                "persistence.chunkInterval must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Add or replace an agent endpoint
    pub fn with_agent(mut self, id: impl Into<String>, base_url: impl Into<String>) -> Self {
        let endpoint = AgentEndpoint {
            id: id.into(),
            base_url: base_url.into(),
            model: None,
        };
        self.agents.retain(|a| a.id != endpoint.id);
        self.agents.push(endpoint);
        self
    }

    /// Set the default model
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    /// Set the approval policy
    pub fn with_approval(mut self, approval: ApprovalPolicy) -> Self {
        self.approval = approval;
        self
    }

    /// Store conversations under a local directory
    pub fn with_store_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.store_dir = Some(dir.into());
        self
    }

    /// Find an agent by id
    pub fn find_agent(&self, id: &str) -> Option<&AgentEndpoint> {
        self.agents.iter().find(|a| a.id == id)
    }

    /// Effective model for an agent (agent override or default)
    pub fn model_for(&self, agent: &AgentEndpoint) -> String {
        agent
            .model
            .clone()
            .unwrap_or_else(|| self.default_model.clone())
    }

    /// Controller settings for one agent
    pub fn controller_config(&self, agent: &AgentEndpoint) -> ControllerConfig {
        ControllerConfig {
            model: self.model_for(agent),
            approval: self.approval.clone(),
            persistence: self.persistence.clone(),
            continuity: self.continuity.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = ConverseConfig::default();
        assert_eq!(config.default_model, DEFAULT_MODEL);
        assert!(config.agents.is_empty());
        assert_eq!(config.paths.command, "/chat");
        assert_eq!(config.persistence.chunk_interval, 5);
        assert_eq!(config.persistence.time_interval(), Duration::from_secs(2));
        assert_eq!(config.continuity.in_flight_window(), chrono::Duration::minutes(5));
        assert!(config.continuity.reattach_sessions);
        assert!(config.approval.enabled);
    }

    #[test]
    fn test_config_from_json_missing_fields() {
        let config: ConverseConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, ConverseConfig::default());
    }

    #[test]
    fn test_config_from_json() {
        let json = r#"{
            "defaultModel": "opus",
            "agents": [
                {"id": "builder", "baseUrl": "http://localhost:4001"},
                {"id": "reviewer", "baseUrl": "http://localhost:4002", "model": "haiku"}
            ],
            "paths": {"command": "/stream"},
            "persistence": {"chunkInterval": 10},
            "continuity": {"inFlightWindowSecs": 60, "reattachSessions": false},
            "approval": {"requireApprovalTools": ["Read"]}
        }"#;
        let config: ConverseConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.agents.len(), 2);
        assert_eq!(config.paths.command, "/stream");
        assert_eq!(config.paths.conversation, "/conversation");
        assert_eq!(config.persistence.chunk_interval, 10);
        assert_eq!(config.persistence.time_interval_ms, 2_000);
        assert!(!config.continuity.reattach_sessions);
        assert!(config.approval.requires_approval("Read"));

        let builder = config.find_agent("builder").unwrap();
        assert_eq!(config.model_for(builder), "opus");
        let reviewer = config.find_agent("reviewer").unwrap();
        assert_eq!(config.controller_config(reviewer).model, "haiku");
    }

    #[test]
    fn test_validate_rejects_duplicates() {
        let mut config = ConverseConfig::new()
            .with_agent("a", "http://localhost:1")
            .with_agent("b", "http://localhost:2");
        assert!(config.validate().is_ok());

        config.agents.push(AgentEndpoint {
            id: "a".into(),
            base_url: "http://localhost:3".into(),
            model: None,
        });
        assert!(matches!(config.validate(), Err(ConverseError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_chunk_interval() {
        let mut config = ConverseConfig::new();
        config.persistence.chunk_interval = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_in_flight_window_saturates() {
        let mut continuity = ContinuityConfig::default();
        assert_eq!(continuity.in_flight_window(), chrono::Duration::seconds(300));

        continuity.in_flight_window_secs = u64::MAX;
        assert_eq!(continuity.in_flight_window(), chrono::Duration::MAX);

        continuity.in_flight_window_secs = i64::MAX as u64;
        assert_eq!(continuity.in_flight_window(), chrono::Duration::MAX);
    }

    #[test]
    fn test_with_agent_replaces() {
        let config = ConverseConfig::new()
            .with_agent("a", "http://old")
            .with_agent("a", "http://new");
        assert_eq!(config.agents.len(), 1);
        assert_eq!(config.agents[0].base_url, "http://new");
    }

    #[test]
    fn test_config_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("converse.json");

        let config = ConverseConfig::new()
            .with_agent("builder", "http://localhost:4001")
            .with_model("opus")
            .with_store_dir("/tmp/conversations");
        config.save_to_file(&path).unwrap();

        let loaded = ConverseConfig::from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_config_from_file_not_found() {
        let result = ConverseConfig::from_file(Path::new("/nonexistent/converse.json"));
        assert!(matches!(result, Err(ConverseError::Config(_))));
    }
}
