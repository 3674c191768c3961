//! Tool-approval gate
//!
//! Pauses the conversation when the agent announces a tool use that needs
//! an operator decision. Supports:
//! - Tool categorization (ReadOnly, Mutating)
//! - Configurable approval policies (explicit lists, then category)
//! - A pluggable follow-up once a tool use is approved
//!
//! The gate never blocks frame consumption; only new commands are held
//! back while a decision is pending.

use crate::config::DEFAULT_CONTINUATION_DIRECTIVE;
use crate::metadata::ToolUseEvent;
use crate::types::PendingApproval;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Tool category for determining approval requirements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ToolCategory {
    /// Read-only operations (read, glob, ls, grep) - auto-approved
    ReadOnly,
    /// Mutating operations (bash, write, edit) - require approval
    Mutating,
}

impl ToolCategory {
    /// Classify a tool by its name (case-insensitive)
    pub fn from_tool_name(tool_name: &str) -> Self {
        match tool_name.to_ascii_lowercase().as_str() {
            "read" | "glob" | "ls" | "grep" | "list_files" | "search" | "webfetch"
            | "websearch" | "todoread" | "todowrite" | "notebookread" => ToolCategory::ReadOnly,
            "bash" | "write" | "edit" | "multiedit" | "notebookedit" | "delete" | "move"
            | "copy" | "execute" => ToolCategory::Mutating,
            _ => ToolCategory::Mutating, // Unknown tools are treated as mutating
        }
    }
}

/// Which tool uses require an operator decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalPolicy {
    /// Whether the gate is active (default: true)
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Tools that always require approval
    #[serde(default)]
    pub require_approval_tools: BTreeSet<String>,

    /// Tools that never require approval
    #[serde(default)]
    pub auto_approve_tools: BTreeSet<String>,
}

fn default_enabled() -> bool {
    true
}

impl Default for ApprovalPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            require_approval_tools: BTreeSet::new(),
            auto_approve_tools: BTreeSet::new(),
        }
    }
}

impl ApprovalPolicy {
    /// A policy that lets every tool through
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// Add tools to the require-approval list
    pub fn with_require_approval_tools(
        mut self,
        tools: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.require_approval_tools
            .extend(tools.into_iter().map(Into::into));
        self
    }

    /// Add tools to the auto-approve list
    pub fn with_auto_approve_tools(
        mut self,
        tools: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.auto_approve_tools
            .extend(tools.into_iter().map(Into::into));
        self
    }

    /// Check if a tool requires approval
    pub fn requires_approval(&self, tool_name: &str) -> bool {
        if !self.enabled {
            return false;
        }

        // Explicit require list first
        if self.require_approval_tools.contains(tool_name) {
            return true;
        }

        if self.auto_approve_tools.contains(tool_name) {
            return false;
        }

        matches!(
            ToolCategory::from_tool_name(tool_name),
            ToolCategory::Mutating
        )
    }
}

/// Gate state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum GateState {
    #[default]
    Idle,
    /// A tool use is waiting for approve/deny
    AwaitingDecision(PendingApproval),
}

/// Per-agent approval state machine
#[derive(Debug, Clone, Default)]
pub struct ApprovalGate {
    policy: ApprovalPolicy,
    state: GateState,
}

impl ApprovalGate {
    pub fn new(policy: ApprovalPolicy) -> Self {
        Self {
            policy,
            state: GateState::Idle,
        }
    }

    pub fn policy(&self) -> &ApprovalPolicy {
        &self.policy
    }

    pub fn state(&self) -> &GateState {
        &self.state
    }

    pub fn pending(&self) -> Option<&PendingApproval> {
        match &self.state {
            GateState::AwaitingDecision(pending) => Some(pending),
            GateState::Idle => None,
        }
    }

    pub fn is_awaiting(&self) -> bool {
        self.pending().is_some()
    }

    /// Feed a tool use; returns the new pending approval if the gate closed
    pub fn observe(&mut self, tool_use: &ToolUseEvent, message_id: &str) -> Option<PendingApproval> {
        if !self.policy.requires_approval(&tool_use.name) {
            return None;
        }

        if let Some(pending) = self.pending() {
            tracing::info!(
                pending = %pending.tool_name,
                tool = %tool_use.name,
                "Approval already pending; ignoring tool use"
            );
            return None;
        }

        let pending = PendingApproval {
            tool_name: tool_use.name.clone(),
            operation: tool_use.operation(),
            message_id: message_id.to_string(),
            requires_approval: true,
        };
        tracing::info!(tool = %pending.tool_name, message_id = %message_id, "Tool use awaiting approval");
        self.state = GateState::AwaitingDecision(pending.clone());
        Some(pending)
    }

    /// Take the pending approval, returning the gate to idle
    pub fn take(&mut self) -> Option<PendingApproval> {
        match std::mem::take(&mut self.state) {
            GateState::AwaitingDecision(pending) => Some(pending),
            GateState::Idle => None,
        }
    }

    pub fn reset(&mut self) {
        self.state = GateState::Idle;
    }
}

/// What happens after an operator approves a tool use
pub trait OnApproved: Send + Sync {
    /// Command to send next, if any
    fn follow_up(&self, approval: &PendingApproval) -> Option<String>;
}

/// Sends a fixed directive telling the agent to carry on
#[derive(Debug, Clone)]
pub struct ContinuationDirective {
    directive: String,
}

impl ContinuationDirective {
    pub fn new(directive: impl Into<String>) -> Self {
        Self {
            directive: directive.into(),
        }
    }
}

impl Default for ContinuationDirective {
    fn default() -> Self {
        Self::new(DEFAULT_CONTINUATION_DIRECTIVE)
    }
}

impl OnApproved for ContinuationDirective {
    fn follow_up(&self, _approval: &PendingApproval) -> Option<String> {
        let directive = self.directive.trim();
        if directive.is_empty() {
            None
        } else {
            Some(directive.to_string())
        }
    }
}

/// Approval only notifies the agent; nothing is sent afterwards
#[derive(Debug, Clone, Copy, Default)]
pub struct NoContinuation;

impl OnApproved for NoContinuation {
    fn follow_up(&self, _approval: &PendingApproval) -> Option<String> {
        None
    }
}
