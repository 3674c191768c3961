//! Persistence bridge: best-effort mirroring of the log into a durable store
//!
//! Writes are fire-and-forget from the caller's point of view. A per-agent
//! writer task drains them in submission order, so a later snapshot of a
//! message can never be overtaken by an earlier one. Failed writes are
//! logged and dropped; they never reach the operator.

use crate::config::PersistenceConfig;
use crate::error::Result;
use crate::types::Message;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

pub mod file;
pub mod http;
pub mod memory;

/// Durable conversation storage, keyed by agent id and message id
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Load an agent's full log in stored order
    async fn load(&self, agent_id: &str) -> Result<Vec<Message>>;

    /// Insert or replace one message (last write wins)
    async fn save(&self, agent_id: &str, message: &Message) -> Result<()>;

    /// Backend name for diagnostics
    fn backend_name(&self) -> &str {
        "unknown"
    }
}

enum WriteOp {
    Save(Message),
    Flush(oneshot::Sender<()>),
}

/// Per-agent handle onto the writer task
#[derive(Clone)]
pub struct PersistenceBridge {
    agent_id: Arc<str>,
    store: Arc<dyn DurableStore>,
    tx: mpsc::UnboundedSender<WriteOp>,
}

impl PersistenceBridge {
    /// Start the writer task for `agent_id`. Requires a tokio runtime.
    pub fn spawn(agent_id: impl Into<Arc<str>>, store: Arc<dyn DurableStore>) -> Self {
        let agent_id = agent_id.into();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(agent_id.clone(), store.clone(), rx));
        Self {
            agent_id,
            store,
            tx,
        }
    }

    pub fn backend_name(&self) -> &str {
        self.store.backend_name()
    }

    /// Queue a snapshot of `message`
    pub fn save(&self, message: &Message) {
        if self.tx.send(WriteOp::Save(message.clone())).is_err() {
            tracing::warn!(
                agent = %self.agent_id,
                message_id = %message.id,
                "Persistence writer stopped; snapshot dropped"
            );
        }
    }

    /// Wait until every queued write has been attempted
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(WriteOp::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Flush, then read the durable log
    pub async fn load(&self) -> Result<Vec<Message>> {
        self.flush().await;
        self.store.load(&self.agent_id).await
    }
}

async fn run_writer(
    agent_id: Arc<str>,
    store: Arc<dyn DurableStore>,
    mut rx: mpsc::UnboundedReceiver<WriteOp>,
) {
    while let Some(op) = rx.recv().await {
        match op {
            WriteOp::Save(message) => {
                if let Err(e) = store.save(&agent_id, &message).await {
                    tracing::warn!(
                        agent = %agent_id,
                        message_id = %message.id,
                        backend = store.backend_name(),
                        error = %e,
                        "Failed to persist message"
                    );
                }
            }
            WriteOp::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    tracing::debug!(agent = %agent_id, "Persistence writer stopped");
}

/// What a streaming reply should do about its live snapshot after a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotDue {
    /// Save now
    Now,
    /// First unsaved chunk: save at `deadline` unless a save happens first
    Arm { deadline: Instant, epoch: u64 },
    /// A deadline is already armed
    Later,
}

/// Decides when a streaming reply gets an intermediate snapshot.
///
/// A snapshot is due after `chunk_interval` unsaved chunks, or once the
/// oldest unsaved chunk is `time_interval` old even if the stream stalls.
/// Every save bumps the epoch so an armed deadline from before it is void.
#[derive(Debug, Clone)]
pub struct SnapshotThrottle {
    every_chunks: u32,
    interval: Duration,
    unsaved: u32,
    deadline: Option<Instant>,
    epoch: u64,
}

impl SnapshotThrottle {
    pub fn new(config: &PersistenceConfig) -> Self {
        Self {
            every_chunks: config.chunk_interval.max(1),
            interval: config.time_interval(),
            unsaved: 0,
            deadline: None,
            epoch: 0,
        }
    }

    /// Count one chunk
    pub fn record_chunk(&mut self) -> SnapshotDue {
        self.unsaved += 1;
        let expired = self.deadline.is_some_and(|d| Instant::now() >= d);
        if self.unsaved >= self.every_chunks || expired {
            self.mark_saved();
            return SnapshotDue::Now;
        }
        match self.deadline {
            Some(_) => SnapshotDue::Later,
            None => {
                let deadline = Instant::now() + self.interval;
                self.deadline = Some(deadline);
                SnapshotDue::Arm {
                    deadline,
                    epoch: self.epoch,
                }
            }
        }
    }

    /// An armed deadline elapsed; true when its snapshot is still owed
    pub fn deadline_elapsed(&mut self, epoch: u64) -> bool {
        if epoch != self.epoch || self.unsaved == 0 {
            return false;
        }
        self.mark_saved();
        true
    }

    /// The live message was written; disarm and start counting afresh
    pub fn mark_saved(&mut self) {
        self.unsaved = 0;
        self.deadline = None;
        self.epoch += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryDurableStore;
    use super::*;
    use crate::types::Role;

    #[tokio::test]
    async fn test_bridge_writes_in_order() {
        let store = Arc::new(MemoryDurableStore::new());
        let bridge = PersistenceBridge::spawn("builder", store.clone());

        let mut msg = Message::assistant_placeholder("msg-1");
        bridge.save(&msg);
        msg.content = "partial".into();
        bridge.save(&msg);
        msg.content = "final".into();
        bridge.save(&msg);
        bridge.flush().await;

        let writes = store.writes("builder").await;
        let contents: Vec<&str> = writes.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["", "partial", "final"]);

        let log = bridge.load().await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].content, "final");
    }

    #[tokio::test]
    async fn test_bridge_failure_is_swallowed() {
        let store = Arc::new(MemoryDurableStore::new());
        store.set_unavailable(true);
        let bridge = PersistenceBridge::spawn("builder", store.clone());

        bridge.save(&Message::new("msg-1", Role::User, "hi"));
        bridge.flush().await;
        assert!(bridge.load().await.is_err());

        store.set_unavailable(false);
        bridge.save(&Message::new("msg-2", Role::User, "again"));
        let log = bridge.load().await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].id, "msg-2");
        assert_eq!(bridge.backend_name(), "memory");
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_by_chunks() {
        let mut throttle = SnapshotThrottle::new(&PersistenceConfig::default());
        let due: Vec<bool> = (0..10)
            .map(|_| throttle.record_chunk() == SnapshotDue::Now)
            .collect();
        assert_eq!(
            due,
            vec![false, false, false, false, true, false, false, false, false, true]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_arms_once_per_batch() {
        let mut throttle = SnapshotThrottle::new(&PersistenceConfig::default());
        let start = Instant::now();

        let SnapshotDue::Arm { deadline, epoch } = throttle.record_chunk() else {
            panic!("first unsaved chunk should arm a deadline");
        };
        assert_eq!(deadline, start + Duration::from_secs(2));
        assert_eq!(throttle.record_chunk(), SnapshotDue::Later);

        // Stream stalled: the deadline owes a snapshot exactly once
        assert!(throttle.deadline_elapsed(epoch));
        assert!(!throttle.deadline_elapsed(epoch));
        assert!(matches!(throttle.record_chunk(), SnapshotDue::Arm { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_save_voids_armed_deadline() {
        let mut throttle = SnapshotThrottle::new(&PersistenceConfig::default());
        let SnapshotDue::Arm { epoch, .. } = throttle.record_chunk() else {
            panic!("expected a deadline");
        };
        for _ in 0..4 {
            throttle.record_chunk();
        }
        assert!(!throttle.deadline_elapsed(epoch));

        let SnapshotDue::Arm { epoch, .. } = throttle.record_chunk() else {
            panic!("expected a deadline");
        };
        throttle.mark_saved();
        assert!(!throttle.deadline_elapsed(epoch));
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_late_chunk_saves_immediately() {
        let mut throttle = SnapshotThrottle::new(&PersistenceConfig::default());
        assert!(matches!(throttle.record_chunk(), SnapshotDue::Arm { .. }));

        tokio::time::advance(Duration::from_millis(2_001)).await;
        assert_eq!(throttle.record_chunk(), SnapshotDue::Now);
        assert!(matches!(throttle.record_chunk(), SnapshotDue::Arm { .. }));
    }
}
