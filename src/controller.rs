//! Per-agent conversation controller
//!
//! Owns one agent's log, approval gate and in-flight request, and drives
//! the decode loop for each turn on a spawned task. Every mutation of the
//! agent's state happens under one `RwLock`, in frame arrival order.
//!
//! A turn's mutations only apply while its cancellation token is the
//! active one and the controller is attached. Frames and errors from any
//! other turn are dropped.

use crate::approval::{ApprovalGate, ContinuationDirective, GateState, OnApproved};
use crate::config::ControllerConfig;
use crate::continuity::{self, ReloadOutcome, TurnStatus};
use crate::conversation::{ConversationLog, UsageTotals};
use crate::decoder::{decode_frames, Frame};
use crate::error::{ConverseError, Result};
use crate::event::ConversationEvent;
use crate::metadata::{MetadataEvent, MetadataKind};
use crate::persistence::memory::MemoryDurableStore;
use crate::persistence::{DurableStore, PersistenceBridge, SnapshotDue, SnapshotThrottle};
use crate::sentinel::{self, Segment};
use crate::transport::AgentTransport;
use crate::types::{
    ApprovalDecision, CommandRequest, Message, MessageIdGenerator, PendingApproval,
    RestoreRequest,
};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Default broadcast capacity for observer events
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// How a turn ended
#[derive(Debug)]
pub enum TurnOutcome {
    /// The reply was finalized
    Completed { message_id: String },
    /// Superseded, cancelled, or the controller detached
    Cancelled,
    /// The turn failed; surfaced errors were appended as a system message
    Failed(ConverseError),
}

impl TurnOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, TurnOutcome::Completed { .. })
    }
}

/// Handle onto a running turn
#[derive(Debug)]
pub struct TurnHandle {
    generation: u64,
    user_message_id: String,
    task: JoinHandle<TurnOutcome>,
}

impl TurnHandle {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Id of the user message this turn appended
    pub fn user_message_id(&self) -> &str {
        &self.user_message_id
    }

    /// Wait for the turn to end
    pub async fn wait(self) -> TurnOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) if e.is_cancelled() => TurnOutcome::Cancelled,
            Err(e) => TurnOutcome::Failed(ConverseError::Protocol(format!(
                "turn task failed: {}",
                e
            ))),
        }
    }
}

/// The in-flight request of an agent
struct ActiveRequest {
    generation: u64,
    token: CancellationToken,
    live_message_id: Option<String>,
    throttle: SnapshotThrottle,
    /// Saves the live message if the stream stalls with unsaved chunks
    snapshot_timer: Option<JoinHandle<()>>,
    saw_frame: bool,
}

impl ActiveRequest {
    fn cancel_snapshot_timer(&mut self) {
        if let Some(timer) = self.snapshot_timer.take() {
            timer.abort();
        }
    }
}

impl Drop for ActiveRequest {
    fn drop(&mut self) {
        self.cancel_snapshot_timer();
    }
}

struct AgentState {
    log: ConversationLog,
    gate: ApprovalGate,
    active: Option<ActiveRequest>,
    next_generation: u64,
    /// Busy indicator for a turn presumed running remotely after a reload
    remote_busy_until: Option<DateTime<Utc>>,
    processing: bool,
    current_operation: Option<String>,
    attached: bool,
    visible: bool,
    was_hidden: bool,
}

impl AgentState {
    fn is_busy(&self, now: DateTime<Utc>) -> bool {
        self.active.is_some() || self.remote_busy_until.is_some_and(|until| now < until)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.attached
            && self
                .active
                .as_ref()
                .is_some_and(|a| a.generation == generation && !a.token.is_cancelled())
    }

    fn live_message_id(&self) -> Option<String> {
        self.active.as_ref().and_then(|a| a.live_message_id.clone())
    }
}

/// How a turn's stream ended
enum StreamEnd {
    Completed(String),
    /// The turn stopped being the active one
    Stale,
    /// Body closed without a `complete` frame
    Closed,
}

struct ControllerInner {
    agent_id: String,
    config: ControllerConfig,
    transport: Arc<dyn AgentTransport>,
    persistence: PersistenceBridge,
    on_approved: Arc<dyn OnApproved>,
    ids: MessageIdGenerator,
    events: broadcast::Sender<ConversationEvent>,
    state: RwLock<AgentState>,
}

/// Drives one agent's conversation
#[derive(Clone)]
pub struct AgentController {
    inner: Arc<ControllerInner>,
}

impl std::fmt::Debug for AgentController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentController")
            .field("agent_id", &self.inner.agent_id)
            .field("transport", &self.inner.transport.name())
            .field("store", &self.inner.persistence.backend_name())
            .finish()
    }
}

/// Builder for [`AgentController`]
pub struct AgentControllerBuilder {
    agent_id: String,
    transport: Option<Arc<dyn AgentTransport>>,
    store: Option<Arc<dyn DurableStore>>,
    config: ControllerConfig,
    on_approved: Option<Arc<dyn OnApproved>>,
    event_capacity: usize,
}

impl AgentControllerBuilder {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            transport: None,
            store: None,
            config: ControllerConfig::default(),
            on_approved: None,
            event_capacity: EVENT_CHANNEL_CAPACITY,
        }
    }

    pub fn transport(mut self, transport: Arc<dyn AgentTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn store(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn on_approved(mut self, action: Arc<dyn OnApproved>) -> Self {
        self.on_approved = Some(action);
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    /// Build the controller. Must be called inside a tokio runtime.
    pub fn build(self) -> Result<AgentController> {
        let transport = self
            .transport
            .ok_or_else(|| ConverseError::Config("transport is required".into()))?;
        if self.agent_id.trim().is_empty() {
            return Err(ConverseError::Config("agent id must not be empty".into()));
        }
        let store: Arc<dyn DurableStore> = match self.store {
            Some(store) => store,
            None => {
                tracing::debug!(agent = %self.agent_id, "No durable store configured; using memory");
                Arc::new(MemoryDurableStore::new())
            }
        };
        let on_approved: Arc<dyn OnApproved> = match self.on_approved {
            Some(action) => action,
            None => Arc::new(ContinuationDirective::default()),
        };

        let (events, _) = broadcast::channel(self.event_capacity);
        let persistence = PersistenceBridge::spawn(self.agent_id.as_str(), store);
        let state = AgentState {
            log: ConversationLog::new(),
            gate: ApprovalGate::new(self.config.approval.clone()),
            active: None,
            next_generation: 0,
            remote_busy_until: None,
            processing: false,
            current_operation: None,
            attached: true,
            visible: true,
            was_hidden: false,
        };

        Ok(AgentController {
            inner: Arc::new(ControllerInner {
                agent_id: self.agent_id,
                config: self.config,
                transport,
                persistence,
                on_approved,
                ids: MessageIdGenerator::new(),
                events,
                state: RwLock::new(state),
            }),
        })
    }
}

impl AgentController {
    pub fn builder(agent_id: impl Into<String>) -> AgentControllerBuilder {
        AgentControllerBuilder::new(agent_id)
    }

    pub fn agent_id(&self) -> &str {
        &self.inner.agent_id
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.inner.config
    }

    /// Subscribe to observer events
    pub fn subscribe(&self) -> broadcast::Receiver<ConversationEvent> {
        self.inner.events.subscribe()
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    /// Send a command.
    ///
    /// Rejected while a request is in flight or an approval is pending;
    /// use [`supersede`](Self::supersede) to interrupt a running turn.
    pub async fn send(&self, command: &str) -> Result<TurnHandle> {
        let command = command.trim();
        if command.is_empty() {
            return Err(ConverseError::EmptyCommand);
        }

        let mut guard = self.inner.state.write().await;
        let state = &mut *guard;
        self.inner.check_ready(state)?;
        if state.is_busy(Utc::now()) {
            return Err(ConverseError::AgentBusy {
                agent_id: self.inner.agent_id.clone(),
            });
        }

        Ok(self.inner.start_turn(state, command))
    }

    /// Cancel the in-flight request (if any) and send `command`
    pub async fn supersede(&self, command: &str) -> Result<TurnHandle> {
        let command = command.trim();
        if command.is_empty() {
            return Err(ConverseError::EmptyCommand);
        }

        let mut guard = self.inner.state.write().await;
        let state = &mut *guard;
        self.inner.check_ready(state)?;
        if let Some(previous) = state.active.take() {
            tracing::debug!(
                agent = %self.inner.agent_id,
                generation = previous.generation,
                "Superseding in-flight request"
            );
            previous.token.cancel();
        }
        state.remote_busy_until = None;

        Ok(self.inner.start_turn(state, command))
    }

    /// Cancel the in-flight request. Returns whether anything was cancelled.
    pub async fn cancel(&self) -> bool {
        let mut guard = self.inner.state.write().await;
        let state = &mut *guard;
        state.remote_busy_until = None;
        let cancelled = self.inner.stop_active(state);
        if cancelled {
            tracing::info!(agent = %self.inner.agent_id, "Request cancelled");
        }
        cancelled
    }

    /// Tear down the view: cancel the active request and stop mutating the log
    pub async fn detach(&self) {
        let mut guard = self.inner.state.write().await;
        let state = &mut *guard;
        self.inner.stop_active(state);
        state.attached = false;
        tracing::debug!(agent = %self.inner.agent_id, "Controller detached");
    }

    /// Re-attach after [`detach`](Self::detach)
    pub async fn attach(&self) {
        self.inner.state.write().await.attached = true;
        tracing::debug!(agent = %self.inner.agent_id, "Controller attached");
    }

    // ------------------------------------------------------------------
    // Approval
    // ------------------------------------------------------------------

    /// Approve the pending tool use and run the follow-up action
    pub async fn approve(&self) -> Result<Option<TurnHandle>> {
        let pending = self.inner.resolve_pending(true).await?;

        let decision = ApprovalDecision {
            message_id: pending.message_id.clone(),
            tool_name: pending.tool_name.clone(),
            approved: true,
        };
        if let Err(e) = self.inner.transport.submit_approval(&decision).await {
            tracing::warn!(
                agent = %self.inner.agent_id,
                tool = %pending.tool_name,
                error = %e,
                "Failed to submit approval"
            );
        }

        match self.inner.on_approved.follow_up(&pending) {
            Some(command) => self.supersede(&command).await.map(Some),
            None => Ok(None),
        }
    }

    /// Deny the pending tool use; recorded locally only
    pub async fn deny(&self) -> Result<()> {
        let pending = self.inner.resolve_pending(false).await?;

        let mut guard = self.inner.state.write().await;
        let text = format!("Denied {}", pending.operation);
        self.inner.append_system(&mut guard, text);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Continuity
    // ------------------------------------------------------------------

    /// Re-read the durable log and reconcile it with memory.
    ///
    /// On a load failure the in-memory state is left untouched.
    pub async fn reload(&self) -> Result<ReloadOutcome> {
        self.inner.reload().await
    }

    /// First mount of a view
    pub async fn on_mount(&self) -> Result<ReloadOutcome> {
        self.attach().await;
        self.reload().await
    }

    /// Visibility changed; reloads when becoming visible after being hidden
    pub async fn on_visibility_change(&self, visible: bool) -> Result<Option<ReloadOutcome>> {
        let should_reload = {
            let mut state = self.inner.state.write().await;
            state.visible = visible;
            if visible {
                std::mem::take(&mut state.was_hidden)
            } else {
                state.was_hidden = true;
                false
            }
        };

        if should_reload {
            self.reload().await.map(Some)
        } else {
            Ok(None)
        }
    }

    /// The view was re-selected after a page reload
    pub async fn on_reselected(&self) -> Result<ReloadOutcome> {
        self.inner.state.write().await.visible = true;
        self.reload().await
    }

    /// Clear the in-memory log and reset the gate. The durable log is kept.
    pub async fn clear(&self) -> Result<()> {
        let mut state = self.inner.state.write().await;
        if state.active.is_some() {
            return Err(ConverseError::AgentBusy {
                agent_id: self.inner.agent_id.clone(),
            });
        }
        state.log.clear();
        state.gate.reset();
        state.remote_busy_until = None;
        state.processing = false;
        state.current_operation = None;
        self.inner.emit(ConversationEvent::Cleared {
            agent_id: self.inner.agent_id.clone(),
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub async fn messages(&self) -> Vec<Message> {
        self.inner.state.read().await.log.messages().to_vec()
    }

    pub async fn is_busy(&self) -> bool {
        self.inner.state.read().await.is_busy(Utc::now())
    }

    /// Request issued but no visible text yet
    pub async fn is_processing(&self) -> bool {
        self.inner.state.read().await.processing
    }

    pub async fn current_operation(&self) -> Option<String> {
        self.inner.state.read().await.current_operation.clone()
    }

    pub async fn pending_approval(&self) -> Option<PendingApproval> {
        self.inner.state.read().await.gate.pending().cloned()
    }

    pub async fn gate_state(&self) -> GateState {
        self.inner.state.read().await.gate.state().clone()
    }

    /// Remote session id carried by the latest assistant message
    pub async fn session_id(&self) -> Option<String> {
        let state = self.inner.state.read().await;
        continuity::reattach_session_id(state.log.messages()).map(str::to_string)
    }

    pub async fn is_attached(&self) -> bool {
        self.inner.state.read().await.attached
    }

    pub async fn is_visible(&self) -> bool {
        self.inner.state.read().await.visible
    }

    pub async fn usage_totals(&self) -> UsageTotals {
        self.inner.state.read().await.log.usage_totals()
    }

    /// Wait for queued persistence writes
    pub async fn flush(&self) {
        self.inner.persistence.flush().await;
    }
}

impl ControllerInner {
    fn emit(&self, event: ConversationEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn check_ready(&self, state: &AgentState) -> Result<()> {
        if !state.attached {
            return Err(ConverseError::Detached {
                agent_id: self.agent_id.clone(),
            });
        }
        if let Some(pending) = state.gate.pending() {
            return Err(ConverseError::ApprovalPending {
                agent_id: self.agent_id.clone(),
                tool_name: pending.tool_name.clone(),
            });
        }
        Ok(())
    }

    fn start_turn(self: &Arc<Self>, state: &mut AgentState, command: &str) -> TurnHandle {
        state.next_generation += 1;
        let generation = state.next_generation;
        let token = CancellationToken::new();

        let user = state.log.push_user(self.ids.next_id(), command).clone();
        self.persistence.save(&user);
        self.emit(ConversationEvent::MessageAppended {
            agent_id: self.agent_id.clone(),
            message: user.clone(),
        });

        state.active = Some(ActiveRequest {
            generation,
            token: token.clone(),
            live_message_id: None,
            throttle: SnapshotThrottle::new(&self.config.persistence),
            snapshot_timer: None,
            saw_frame: false,
        });
        state.processing = true;
        state.current_operation = None;
        state.remote_busy_until = None;
        self.emit(ConversationEvent::BusyChanged {
            agent_id: self.agent_id.clone(),
            busy: true,
        });

        let request = CommandRequest {
            message: command.to_string(),
            model: self.config.model.clone(),
        };
        let span = tracing::info_span!(
            "a3s.converse.turn",
            "a3s.converse.agent" = %self.agent_id,
            "a3s.converse.model" = %request.model,
            "a3s.converse.generation" = generation,
            "a3s.converse.outcome" = tracing::field::Empty,
        );
        let inner = Arc::clone(self);
        let task = tokio::spawn(
            async move { inner.run_turn(generation, token, request).await }.instrument(span),
        );

        TurnHandle {
            generation,
            user_message_id: user.id,
            task,
        }
    }

    async fn run_turn(
        self: &Arc<Self>,
        generation: u64,
        token: CancellationToken,
        request: CommandRequest,
    ) -> TurnOutcome {
        tracing::debug!(transport = self.transport.name(), "Turn started");

        let result = tokio::select! {
            biased;
            _ = token.cancelled() => {
                tracing::Span::current().record("a3s.converse.outcome", "cancelled");
                tracing::debug!("Turn cancelled");
                return TurnOutcome::Cancelled;
            }
            result = self.stream_turn(generation, &request) => result,
        };

        let outcome = self.finish_turn(generation, result).await;
        let label = match &outcome {
            TurnOutcome::Completed { .. } => "completed",
            TurnOutcome::Cancelled => "cancelled",
            TurnOutcome::Failed(_) => "failed",
        };
        tracing::Span::current().record("a3s.converse.outcome", label);
        outcome
    }

    async fn stream_turn(
        self: &Arc<Self>,
        generation: u64,
        request: &CommandRequest,
    ) -> Result<StreamEnd> {
        let body = self.transport.send_command(request).await?;
        let mut frames = decode_frames(body);

        while let Some(frame) = frames.next().await {
            let frame = frame?;
            let mut guard = self.state.write().await;
            let state = &mut *guard;
            if !state.is_current(generation) {
                tracing::debug!("Dropping frame for inactive request");
                return Ok(StreamEnd::Stale);
            }
            if let Some(active) = state.active.as_mut() {
                active.saw_frame = true;
            }
            if let Some(id) = self.apply_frame(state, frame)? {
                return Ok(StreamEnd::Completed(id));
            }
        }

        Ok(StreamEnd::Closed)
    }

    /// Apply one frame; returns the message id once the reply completes
    fn apply_frame(self: &Arc<Self>, state: &mut AgentState, frame: Frame) -> Result<Option<String>> {
        match frame {
            Frame::Start => {
                self.ensure_live_message(state);
                Ok(None)
            }
            Frame::Chunk { content } => {
                let id = self.ensure_live_message(state);
                self.apply_chunk(state, &id, &content);

                let Some(active) = state.active.as_mut() else {
                    return Ok(None);
                };
                match active.throttle.record_chunk() {
                    SnapshotDue::Now => {
                        active.cancel_snapshot_timer();
                        if let Some(message) = state.log.get(&id) {
                            self.persistence.save(message);
                        }
                    }
                    SnapshotDue::Arm { deadline, epoch } => {
                        let timer = self.spawn_snapshot_timer(active.generation, deadline, epoch);
                        if let Some(previous) = active.snapshot_timer.replace(timer) {
                            previous.abort();
                        }
                    }
                    SnapshotDue::Later => {}
                }
                Ok(None)
            }
            Frame::Complete => {
                let id = self.ensure_live_message(state);
                self.finalize(state, &id);
                Ok(Some(id))
            }
            Frame::Error { error } => Err(ConverseError::Remote(error)),
        }
    }

    fn spawn_snapshot_timer(
        self: &Arc<Self>,
        generation: u64,
        deadline: tokio::time::Instant,
        epoch: u64,
    ) -> JoinHandle<()> {
        let inner = Arc::clone(self);
        tokio::spawn(
            async move {
                tokio::time::sleep_until(deadline).await;
                inner.save_stalled_snapshot(generation, epoch).await;
            }
            .in_current_span(),
        )
    }

    /// Deadline of an armed snapshot timer elapsed with no save in between
    async fn save_stalled_snapshot(&self, generation: u64, epoch: u64) {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        if !state.is_current(generation) {
            return;
        }
        let Some(active) = state.active.as_mut() else {
            return;
        };
        if !active.throttle.deadline_elapsed(epoch) {
            return;
        }
        // Our own handle; dropping it detaches
        active.snapshot_timer = None;
        let Some(id) = active.live_message_id.clone() else {
            return;
        };
        if let Some(message) = state.log.get(&id) {
            tracing::debug!(message_id = %id, "Saving live snapshot of stalled stream");
            self.persistence.save(message);
        }
    }

    /// Id of the live assistant message, creating the placeholder on first use
    fn ensure_live_message(&self, state: &mut AgentState) -> String {
        if let Some(id) = state.live_message_id() {
            return id;
        }

        let id = self.ids.next_id();
        let placeholder = state.log.begin_assistant(id.clone()).clone();
        if let Some(active) = state.active.as_mut() {
            active.live_message_id = Some(id.clone());
        }
        // Reserve the slot in the durable log
        self.persistence.save(&placeholder);
        self.emit(ConversationEvent::MessageAppended {
            agent_id: self.agent_id.clone(),
            message: placeholder,
        });
        id
    }

    fn apply_chunk(&self, state: &mut AgentState, message_id: &str, content: &str) {
        for segment in sentinel::split(content) {
            match segment {
                Segment::Text(text) => {
                    let Some(first_visible) = state.log.append_text(message_id, text) else {
                        continue;
                    };
                    if text.is_empty() {
                        continue;
                    }
                    self.emit(ConversationEvent::ContentDelta {
                        agent_id: self.agent_id.clone(),
                        message_id: message_id.to_string(),
                        text: text.to_string(),
                    });
                    if first_visible && state.processing {
                        state.processing = false;
                        self.emit(ConversationEvent::ProcessingCleared {
                            agent_id: self.agent_id.clone(),
                        });
                    }
                }
                Segment::Metadata { kind, payload } => {
                    self.apply_metadata(state, message_id, kind, payload);
                }
            }
        }
    }

    fn apply_metadata(
        &self,
        state: &mut AgentState,
        message_id: &str,
        kind: &str,
        payload: serde_json::Value,
    ) {
        let kind: MetadataKind = match kind.parse() {
            Ok(kind) => kind,
            Err(_) => {
                tracing::debug!(kind = %kind, "Discarding unknown metadata type");
                return;
            }
        };
        let event = match MetadataEvent::from_payload(kind, payload) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(kind = ?kind, error = %e, "Discarding invalid metadata payload");
                return;
            }
        };

        state.log.apply_metadata(message_id, &event);

        if let MetadataEvent::ToolUse(tool_use) = &event {
            let operation = tool_use.operation();
            state.current_operation = Some(operation.clone());
            self.emit(ConversationEvent::OperationChanged {
                agent_id: self.agent_id.clone(),
                operation: Some(operation),
            });

            if let Some(approval) = state.gate.observe(tool_use, message_id) {
                self.emit(ConversationEvent::ApprovalRequired {
                    agent_id: self.agent_id.clone(),
                    approval,
                });
            }
        }
    }

    /// Mark the reply complete and write the final snapshot
    fn finalize(&self, state: &mut AgentState, message_id: &str) {
        let Some(message) = state.log.complete(message_id).cloned() else {
            return;
        };
        self.persistence.save(&message);
        if let Some(active) = state.active.as_mut() {
            active.throttle.mark_saved();
            active.cancel_snapshot_timer();
        }
        tracing::debug!(message_id = %message_id, chars = message.content.len(), "Reply complete");
        self.emit(ConversationEvent::MessageCompleted {
            agent_id: self.agent_id.clone(),
            message,
        });
    }

    async fn finish_turn(&self, generation: u64, result: Result<StreamEnd>) -> TurnOutcome {
        let mut guard = self.state.write().await;
        let state = &mut *guard;

        if !state.is_current(generation) {
            return match result {
                Ok(StreamEnd::Completed(message_id)) => TurnOutcome::Completed { message_id },
                Ok(_) => TurnOutcome::Cancelled,
                Err(e) => {
                    tracing::debug!(error = %e, "Swallowing error from inactive request");
                    TurnOutcome::Cancelled
                }
            };
        }

        let saw_frame = state.active.as_ref().is_some_and(|a| a.saw_frame);
        let result = match result {
            Ok(StreamEnd::Closed) => match state.live_message_id() {
                Some(id) => {
                    tracing::warn!(message_id = %id, "Response stream closed without complete; finalizing");
                    self.finalize(state, &id);
                    Ok(id)
                }
                None if saw_frame => Err(ConverseError::Protocol(
                    "response stream ended without a reply".into(),
                )),
                None => Err(ConverseError::Protocol("empty response stream".into())),
            },
            Ok(StreamEnd::Completed(id)) => Ok(id),
            Ok(StreamEnd::Stale) => {
                self.release(state);
                return TurnOutcome::Cancelled;
            }
            Err(e) => Err(e),
        };

        let outcome = match result {
            Ok(message_id) => TurnOutcome::Completed { message_id },
            Err(e) => {
                tracing::warn!(agent = %self.agent_id, error = %e, "Turn failed");
                // Keep whatever streamed so far as a live snapshot
                if let Some(message) = state.live_message_id().and_then(|id| state.log.get(&id)) {
                    self.persistence.save(message);
                }
                if e.is_surfaced() {
                    self.append_system(state, e.to_string());
                }
                TurnOutcome::Failed(e)
            }
        };

        self.release(state);
        outcome
    }

    /// Drop the active request and clear the busy indicators
    fn release(&self, state: &mut AgentState) {
        state.active = None;
        state.processing = false;
        if state.current_operation.take().is_some() {
            self.emit(ConversationEvent::OperationChanged {
                agent_id: self.agent_id.clone(),
                operation: None,
            });
        }
        self.emit(ConversationEvent::BusyChanged {
            agent_id: self.agent_id.clone(),
            busy: false,
        });
    }

    /// Cancel and release the active request; false if none
    fn stop_active(&self, state: &mut AgentState) -> bool {
        match state.active.as_ref() {
            Some(active) => {
                active.token.cancel();
                if let Some(message) = state.live_message_id().and_then(|id| state.log.get(&id)) {
                    self.persistence.save(message);
                }
                self.release(state);
                true
            }
            None => false,
        }
    }

    fn append_system(&self, state: &mut AgentState, text: String) {
        let message = state.log.push_system(self.ids.next_id(), text).clone();
        self.persistence.save(&message);
        self.emit(ConversationEvent::MessageAppended {
            agent_id: self.agent_id.clone(),
            message,
        });
    }

    async fn resolve_pending(&self, approved: bool) -> Result<PendingApproval> {
        let mut state = self.state.write().await;
        let pending = state
            .gate
            .take()
            .ok_or_else(|| ConverseError::NoPendingApproval {
                agent_id: self.agent_id.clone(),
            })?;

        tracing::info!(
            agent = %self.agent_id,
            tool = %pending.tool_name,
            approved,
            "Tool approval resolved"
        );
        self.emit(ConversationEvent::ApprovalResolved {
            agent_id: self.agent_id.clone(),
            approval: pending.clone(),
            approved,
        });
        Ok(pending)
    }

    async fn reload(&self) -> Result<ReloadOutcome> {
        {
            let state = self.state.read().await;
            if !state.attached {
                return Err(ConverseError::Detached {
                    agent_id: self.agent_id.clone(),
                });
            }
        }

        let durable = self.persistence.load().await?;
        let now = Utc::now();
        let window = self.config.continuity.in_flight_window();

        let (mut outcome, reattach) = {
            let mut guard = self.state.write().await;
            let state = &mut *guard;

            let live_id = state.live_message_id();
            let merged = continuity::reconcile(durable, state.log.messages(), live_id.as_deref());
            state.log.replace_all(merged);

            let status = continuity::classify(state.log.messages(), now, window);
            let busy_until = match (status, state.active.is_some()) {
                (TurnStatus::InFlight, false) => {
                    continuity::busy_deadline(state.log.messages(), window)
                }
                _ => None,
            };
            state.remote_busy_until = busy_until;

            let reattach = if self.config.continuity.reattach_sessions && state.active.is_none() {
                continuity::reattach_session_id(state.log.messages()).map(str::to_string)
            } else {
                None
            };

            tracing::info!(
                agent = %self.agent_id,
                status = ?status,
                messages = state.log.len(),
                "Conversation reloaded"
            );
            self.emit(ConversationEvent::Reloaded {
                agent_id: self.agent_id.clone(),
                status,
                message_count: state.log.len(),
            });
            self.emit(ConversationEvent::BusyChanged {
                agent_id: self.agent_id.clone(),
                busy: state.is_busy(now),
            });

            let outcome = ReloadOutcome {
                status,
                message_count: state.log.len(),
                busy_until,
                restored: None,
            };
            (outcome, reattach)
        };

        if let Some(session_id) = reattach {
            outcome.restored = Some(self.restore_session(session_id).await);
        }
        Ok(outcome)
    }

    /// Best-effort session reattachment
    async fn restore_session(&self, session_id: String) -> bool {
        let request = RestoreRequest {
            session_id,
            model: self.config.model.clone(),
        };
        match self.transport.restore_session(&request).await {
            Ok(response) => {
                tracing::debug!(
                    agent = %self.agent_id,
                    session_id = %request.session_id,
                    restored = response.restored,
                    "Session restore answered"
                );
                response.restored
            }
            Err(e) => {
                tracing::warn!(
                    agent = %self.agent_id,
                    session_id = %request.session_id,
                    error = %e,
                    "Session restore failed"
                );
                false
            }
        }
    }
}
