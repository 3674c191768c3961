//! Registry of per-agent controllers
//!
//! Agents are fully independent: the hub only maps ids to controllers and
//! tracks which agent's view is selected.

use crate::approval::ContinuationDirective;
use crate::config::ConverseConfig;
use crate::continuity::ReloadOutcome;
use crate::controller::AgentController;
use crate::error::{ConverseError, Result};
use crate::persistence::file::FileDurableStore;
use crate::persistence::http::HttpDurableStore;
use crate::persistence::DurableStore;
use crate::transport::http::HttpTransport;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Default)]
pub struct ConversationHub {
    controllers: RwLock<HashMap<String, AgentController>>,
    selected: RwLock<Option<String>>,
}

impl ConversationHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build one HTTP-backed controller per configured agent
    pub async fn from_config(config: &ConverseConfig) -> Result<Self> {
        config.validate()?;

        let file_store: Option<Arc<dyn DurableStore>> = match &config.store_dir {
            Some(dir) => Some(Arc::new(FileDurableStore::new(dir).await?)),
            None => None,
        };
        let on_approved = Arc::new(ContinuationDirective::new(
            config.continuation_directive.clone(),
        ));

        let hub = Self::new();
        for agent in &config.agents {
            let transport =
                HttpTransport::new(agent.base_url.clone()).with_paths(config.paths.clone());
            let store = match &file_store {
                Some(store) => store.clone(),
                None => Arc::new(HttpDurableStore::new(
                    agent.base_url.clone(),
                    &config.paths.conversation,
                )),
            };

            let controller = AgentController::builder(agent.id.clone())
                .transport(Arc::new(transport))
                .store(store)
                .config(config.controller_config(agent))
                .on_approved(on_approved.clone())
                .build()?;
            hub.register(controller).await;
        }

        tracing::debug!(agents = config.agents.len(), "Conversation hub ready");
        Ok(hub)
    }

    /// Add a controller, replacing (and detaching) any with the same id
    pub async fn register(&self, controller: AgentController) {
        let previous = self
            .controllers
            .write()
            .await
            .insert(controller.agent_id().to_string(), controller);
        if let Some(previous) = previous {
            previous.detach().await;
        }
    }

    pub async fn controller(&self, agent_id: &str) -> Result<AgentController> {
        self.controllers
            .read()
            .await
            .get(agent_id)
            .cloned()
            .ok_or_else(|| ConverseError::AgentNotFound(agent_id.to_string()))
    }

    /// Registered agent ids, sorted
    pub async fn agents(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.controllers.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Switch the visible agent: hide the previous one, then reload the new one
    pub async fn select(&self, agent_id: &str) -> Result<ReloadOutcome> {
        let controller = self.controller(agent_id).await?;

        let previous = self.selected.write().await.replace(agent_id.to_string());
        if let Some(previous) = previous.filter(|p| p != agent_id) {
            if let Ok(prev) = self.controller(&previous).await {
                prev.on_visibility_change(false).await?;
            }
        }

        controller.on_reselected().await
    }

    pub async fn selected(&self) -> Option<String> {
        self.selected.read().await.clone()
    }

    /// Unregister and detach an agent's controller
    pub async fn remove(&self, agent_id: &str) -> Option<AgentController> {
        let removed = self.controllers.write().await.remove(agent_id)?;
        removed.detach().await;

        let mut selected = self.selected.write().await;
        if selected.as_deref() == Some(agent_id) {
            *selected = None;
        }
        Some(removed)
    }
}
