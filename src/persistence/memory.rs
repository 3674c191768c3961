//! In-memory durable store for testing

use super::DurableStore;
use crate::error::{ConverseError, Result};
use crate::types::Message;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

#[derive(Default)]
struct Inner {
    logs: HashMap<String, Vec<Message>>,
    writes: HashMap<String, Vec<Message>>,
}

/// Keeps logs in memory and records every write, for assertions
#[derive(Default)]
pub struct MemoryDurableStore {
    inner: RwLock<Inner>,
    unavailable: AtomicBool,
}

impl MemoryDurableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate an agent's log, bypassing the write history
    pub async fn seed(&self, agent_id: &str, messages: Vec<Message>) {
        self.inner
            .write()
            .await
            .logs
            .insert(agent_id.to_string(), messages);
    }

    /// Every snapshot written for an agent, in write order
    pub async fn writes(&self, agent_id: &str) -> Vec<Message> {
        self.inner
            .read()
            .await
            .writes
            .get(agent_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Make every operation fail until switched back
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ConverseError::Persistence(
                "memory store is unavailable".into(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl DurableStore for MemoryDurableStore {
    async fn load(&self, agent_id: &str) -> Result<Vec<Message>> {
        self.check_available()?;
        Ok(self
            .inner
            .read()
            .await
            .logs
            .get(agent_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn save(&self, agent_id: &str, message: &Message) -> Result<()> {
        self.check_available()?;
        let mut inner = self.inner.write().await;
        upsert(
            inner.logs.entry(agent_id.to_string()).or_default(),
            message.clone(),
        );
        inner
            .writes
            .entry(agent_id.to_string())
            .or_default()
            .push(message.clone());
        Ok(())
    }

    fn backend_name(&self) -> &str {
        "memory"
    }
}

/// Replace the message with the same id, or append
pub(crate) fn upsert(log: &mut Vec<Message>, message: Message) {
    match log.iter_mut().find(|m| m.id == message.id) {
        Some(existing) => *existing = message,
        None => log.push(message),
    }
}
