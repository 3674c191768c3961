//! In-process transport backed by channels
//!
//! Every `send_command` opens a reply channel that the owner drives frame
//! by frame through a [`ReplyHandle`], or consumes a reply queued ahead of
//! time with [`ChannelTransport::queue_reply`]. Used by tests and by
//! embedders that host the agent in the same process.

use crate::decoder::Frame;
use crate::error::{ConverseError, Result};
use crate::transport::{AgentTransport, ByteStream};
use crate::types::{ApprovalDecision, CommandRequest, RestoreRequest, RestoreResponse};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, Notify};
use tokio_stream::wrappers::UnboundedReceiverStream;

type ReplySender = mpsc::UnboundedSender<Result<Bytes>>;

/// Sending side of one streamed reply
#[derive(Debug, Clone)]
pub struct ReplyHandle {
    tx: Arc<Mutex<Option<ReplySender>>>,
}

impl ReplyHandle {
    fn new(tx: ReplySender) -> Self {
        Self {
            tx: Arc::new(Mutex::new(Some(tx))),
        }
    }

    fn send(&self, item: Result<Bytes>) {
        let guard = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = guard.as_ref() {
            // Receiver gone means the client dropped the request; ignore.
            let _ = tx.send(item);
        }
    }

    /// Emit a frame as a wire record
    pub fn frame(&self, frame: Frame) -> &Self {
        self.raw(frame.to_record())
    }

    pub fn start(&self) -> &Self {
        self.frame(Frame::Start)
    }

    pub fn chunk(&self, content: impl Into<String>) -> &Self {
        self.frame(Frame::chunk(content))
    }

    pub fn complete(&self) -> &Self {
        self.frame(Frame::Complete)
    }

    pub fn error(&self, message: impl Into<String>) -> &Self {
        self.frame(Frame::Error {
            error: message.into(),
        })
    }

    /// Emit raw bytes, bypassing frame encoding
    pub fn raw(&self, bytes: impl Into<Bytes>) -> &Self {
        self.send(Ok(bytes.into()));
        self
    }

    /// Fail the body mid-stream with a transport error
    pub fn fail(&self, message: impl Into<String>) {
        self.send(Err(ConverseError::Network(message.into())));
    }

    /// End the body without further frames
    pub fn close(&self) {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
    }

    /// Whether the client is still reading this reply
    pub fn is_open(&self) -> bool {
        self.tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }
}

#[derive(Default)]
struct ChannelState {
    requests: Vec<CommandRequest>,
    replies: Vec<ReplyHandle>,
    queued: VecDeque<Vec<Frame>>,
    fail_next: Option<String>,
    approvals: Vec<ApprovalDecision>,
    restores: Vec<RestoreRequest>,
    restore_result: Option<std::result::Result<bool, String>>,
}

/// Scriptable in-process transport
#[derive(Clone, Default)]
pub struct ChannelTransport {
    state: Arc<Mutex<ChannelState>>,
    opened: Arc<Notify>,
}

impl ChannelTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue a finished reply; the next command consumes it instead of opening a live one
    pub fn queue_reply(&self, frames: Vec<Frame>) {
        self.lock().queued.push_back(frames);
    }

    /// Make the next `send_command` fail with a network error
    pub fn fail_next_send(&self, message: impl Into<String>) {
        self.lock().fail_next = Some(message.into());
    }

    /// Configure the session-restore answer (defaults to `restored: false`)
    pub fn set_restore_result(&self, result: std::result::Result<bool, String>) {
        self.lock().restore_result = Some(result);
    }

    /// Wait until the `index`-th live reply (0-based, queued replies excluded) is open
    pub async fn reply(&self, index: usize) -> ReplyHandle {
        loop {
            let notified = self.opened.notified();
            if let Some(handle) = self.lock().replies.get(index).cloned() {
                return handle;
            }
            notified.await;
        }
    }

    /// Commands issued so far
    pub fn requests(&self) -> Vec<CommandRequest> {
        self.lock().requests.clone()
    }

    /// Approval decisions submitted so far
    pub fn approvals(&self) -> Vec<ApprovalDecision> {
        self.lock().approvals.clone()
    }

    /// Session-restore requests received so far
    pub fn restores(&self) -> Vec<RestoreRequest> {
        self.lock().restores.clone()
    }
}

#[async_trait]
impl AgentTransport for ChannelTransport {
    async fn send_command(&self, request: &CommandRequest) -> Result<ByteStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ReplyHandle::new(tx);

        {
            let mut state = self.lock();
            if let Some(message) = state.fail_next.take() {
                return Err(ConverseError::Network(message));
            }
            state.requests.push(request.clone());
            if let Some(frames) = state.queued.pop_front() {
                for frame in frames {
                    handle.frame(frame);
                }
                handle.close();
            } else {
                state.replies.push(handle.clone());
            }
        }
        self.opened.notify_waiters();

        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn submit_approval(&self, decision: &ApprovalDecision) -> Result<()> {
        self.lock().approvals.push(decision.clone());
        Ok(())
    }

    async fn restore_session(&self, request: &RestoreRequest) -> Result<RestoreResponse> {
        let mut state = self.lock();
        state.restores.push(request.clone());
        match state.restore_result.clone() {
            Some(Ok(restored)) => Ok(RestoreResponse { restored }),
            Some(Err(message)) => Err(ConverseError::Network(message)),
            None => Ok(RestoreResponse::default()),
        }
    }

    fn name(&self) -> &str {
        "channel"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::decode_frames;

    fn request(message: &str) -> CommandRequest {
        CommandRequest {
            message: message.into(),
            model: "sonnet".into(),
        }
    }

    #[tokio::test]
    async fn test_driven_reply() {
        let transport = ChannelTransport::new();
        let body = transport.send_command(&request("ls")).await.unwrap();

        let reply = transport.reply(0).await;
        reply.start().chunk("hi").complete();
        reply.close();
        assert!(!reply.is_open());

        let frames: Vec<Frame> = decode_frames(body).map(|f| f.unwrap()).collect().await;
        assert_eq!(frames, vec![Frame::Start, Frame::chunk("hi"), Frame::Complete]);
        assert_eq!(transport.requests()[0].message, "ls");
    }

    #[tokio::test]
    async fn test_queued_reply_closes() {
        let transport = ChannelTransport::new();
        transport.queue_reply(vec![Frame::Start, Frame::Complete]);

        let body = transport.send_command(&request("x")).await.unwrap();
        let frames: Vec<Frame> = decode_frames(body).map(|f| f.unwrap()).collect().await;
        assert_eq!(frames, vec![Frame::Start, Frame::Complete]);
    }

    #[tokio::test]
    async fn test_fail_next_send() {
        let transport = ChannelTransport::new();
        transport.fail_next_send("connection refused");

        let err = transport.send_command(&request("x")).await.err().unwrap();
        assert!(matches!(err, ConverseError::Network(_)));
        assert!(transport.requests().is_empty());
        assert!(transport.send_command(&request("y")).await.is_ok());
    }

    #[tokio::test]
    async fn test_reply_waits_for_command() {
        let transport = ChannelTransport::new();
        let waiter = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.reply(0).await })
        };
        tokio::task::yield_now().await;

        let _body = transport.send_command(&request("later")).await.unwrap();
        let handle = waiter.await.unwrap();
        assert!(handle.is_open());
    }

    #[tokio::test]
    async fn test_restore_and_approval_recorded() {
        let transport = ChannelTransport::new();
        transport.set_restore_result(Ok(true));

        let restored = transport
            .restore_session(&RestoreRequest {
                session_id: "sess-1".into(),
                model: "sonnet".into(),
            })
            .await
            .unwrap();
        assert!(restored.restored);

        transport
            .submit_approval(&ApprovalDecision {
                message_id: "msg-1".into(),
                tool_name: "Write".into(),
                approved: true,
            })
            .await
            .unwrap();
        assert_eq!(transport.approvals().len(), 1);
        assert_eq!(transport.restores()[0].session_id, "sess-1");
    }
}
