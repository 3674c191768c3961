//! Error types for a3s-converse

use thiserror::Error;

/// Errors that can occur while driving an agent conversation
#[derive(Debug, Error)]
pub enum ConverseError {
    /// Command was empty after trimming
    #[error("Validation error: command is empty")]
    EmptyCommand,

    /// A request for this agent is already in flight
    #[error("Validation error: agent '{agent_id}' is busy")]
    AgentBusy { agent_id: String },

    /// A tool approval must be resolved before the next command
    #[error("Validation error: agent '{agent_id}' is awaiting approval for tool '{tool_name}'")]
    ApprovalPending { agent_id: String, tool_name: String },

    /// Controller was detached from its view
    #[error("Validation error: agent '{agent_id}' is detached")]
    Detached { agent_id: String },

    /// Approval decision submitted while nothing is pending
    #[error("Validation error: agent '{agent_id}' has no pending approval")]
    NoPendingApproval { agent_id: String },

    /// Transport failure (request rejected, connection dropped mid-stream)
    #[error("Network error: {0}")]
    Network(String),

    /// Malformed or unexpected response stream
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Explicit `type: error` frame from the agent
    #[error("Agent error: {0}")]
    Remote(String),

    /// Durable store read/write failure
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem failure (file-backed store, config files)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Agent id not registered with the hub
    #[error("Agent not found: {0}")]
    AgentNotFound(String),
}

/// Coarse classification used to decide how an error is surfaced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Local precondition failed; rejected before any I/O
    Validation,
    Network,
    Protocol,
    Remote,
    /// Best-effort storage failure; never shown to the operator
    Persistence,
    Other,
}

impl ConverseError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConverseError::EmptyCommand
            | ConverseError::AgentBusy { .. }
            | ConverseError::ApprovalPending { .. }
            | ConverseError::Detached { .. }
            | ConverseError::NoPendingApproval { .. } => ErrorKind::Validation,
            ConverseError::Network(_) => ErrorKind::Network,
            ConverseError::Protocol(_) => ErrorKind::Protocol,
            ConverseError::Remote(_) => ErrorKind::Remote,
            ConverseError::Persistence(_) => ErrorKind::Persistence,
            ConverseError::Serialization(_)
            | ConverseError::Io(_)
            | ConverseError::Config(_)
            | ConverseError::AgentNotFound(_) => ErrorKind::Other,
        }
    }

    /// Whether this error is a rejected local precondition
    pub fn is_validation(&self) -> bool {
        self.kind() == ErrorKind::Validation
    }

    /// Whether a failed turn with this error becomes a system message in the log
    pub fn is_surfaced(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Network | ErrorKind::Protocol | ErrorKind::Remote
        )
    }
}

/// Result type alias for conversation operations
pub type Result<T> = std::result::Result<T, ConverseError>;
