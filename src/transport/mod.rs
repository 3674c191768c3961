//! Agent transport trait: how commands reach the remote agent process
//!
//! The agent server is an external collaborator: it runs the agent and
//! emits the response stream. Implementations only move bytes; decoding
//! lives in [`crate::decoder`].

use crate::error::Result;
use crate::types::{ApprovalDecision, CommandRequest, RestoreRequest, RestoreResponse};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

pub mod channel;
pub mod http;

/// Raw response body as delivered by the transport
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Core trait for reaching a remote agent
#[async_trait]
pub trait AgentTransport: Send + Sync {
    /// Issue a command and return the incrementally readable response body
    async fn send_command(&self, request: &CommandRequest) -> Result<ByteStream>;

    /// Report an operator's tool-approval decision
    async fn submit_approval(&self, decision: &ApprovalDecision) -> Result<()>;

    /// Ask the agent to reattach a detached session
    async fn restore_session(&self, request: &RestoreRequest) -> Result<RestoreResponse>;

    /// Transport name for diagnostics
    fn name(&self) -> &str;
}
