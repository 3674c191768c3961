//! Durable store served by the agent server's `/conversation` endpoints
//!
//! Each agent server keeps its own log, so the agent id only selects the
//! server (one store per agent) and never appears on the wire.

use super::DurableStore;
use crate::error::{ConverseError, Result};
use crate::transport::http::normalize_base_url;
use crate::types::{ConversationSnapshot, Message, PersistRequest};
use async_trait::async_trait;

pub struct HttpDurableStore {
    url: String,
    client: reqwest::Client,
}

impl HttpDurableStore {
    /// Store at `<base_url><conversation_path>`
    pub fn new(base_url: impl Into<String>, conversation_path: &str) -> Self {
        Self {
            url: format!("{}{}", normalize_base_url(&base_url.into()), conversation_path),
            client: reqwest::Client::new(),
        }
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl DurableStore for HttpDurableStore {
    async fn load(&self, agent_id: &str) -> Result<Vec<Message>> {
        let response = self.client.get(&self.url).send().await.map_err(|e| {
            ConverseError::Persistence(format!("Failed to reach {}: {}", self.url, e))
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ConverseError::Persistence(format!(
                "Conversation load returned {} from {}",
                status, self.url
            )));
        }

        let text = response.text().await.map_err(|e| {
            ConverseError::Persistence(format!("Failed to read conversation: {}", e))
        })?;
        let snapshot: ConversationSnapshot = serde_json::from_str(&text).map_err(|e| {
            ConverseError::Persistence(format!("Malformed conversation from {}: {}", self.url, e))
        })?;

        tracing::debug!(agent = %agent_id, count = snapshot.messages.len(), "Conversation loaded");
        Ok(snapshot.messages)
    }

    async fn save(&self, agent_id: &str, message: &Message) -> Result<()> {
        let body = PersistRequest::from(message);
        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                ConverseError::Persistence(format!("Failed to reach {}: {}", self.url, e))
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ConverseError::Persistence(format!(
                "Conversation save for agent '{}' returned {}",
                agent_id, status
            )));
        }
        Ok(())
    }

    fn backend_name(&self) -> &str {
        "http"
    }
}
