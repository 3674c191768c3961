//! HTTP transport for agent servers

use crate::config::EndpointPaths;
use crate::error::{ConverseError, Result};
use crate::transport::{AgentTransport, ByteStream};
use crate::types::{ApprovalDecision, CommandRequest, RestoreRequest, RestoreResponse};
use async_trait::async_trait;
use futures::StreamExt;

/// Talks to one agent server over HTTP
pub struct HttpTransport {
    base_url: String,
    paths: EndpointPaths,
    client: reqwest::Client,
}

impl HttpTransport {
    /// Create a transport for the agent server at `base_url`
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: normalize_base_url(&base_url.into()),
            paths: EndpointPaths::default(),
            client: reqwest::Client::new(),
        }
    }

    /// Override endpoint paths
    pub fn with_paths(mut self, paths: EndpointPaths) -> Self {
        self.paths = paths;
        self
    }

    /// Use a preconfigured client (proxies, TLS roots, connect timeouts)
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post_json<T: serde::Serialize + ?Sized>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<reqwest::Response> {
        let url = self.url(path);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| ConverseError::Network(format!("Failed to reach {}: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ConverseError::Protocol(format!(
                "Agent server returned {} from {}: {}",
                status, url, body
            )));
        }

        Ok(response)
    }
}

/// Strip trailing slashes so paths join cleanly
pub(crate) fn normalize_base_url(base_url: &str) -> String {
    base_url.trim_end_matches('/').to_string()
}

#[async_trait]
impl AgentTransport for HttpTransport {
    async fn send_command(&self, request: &CommandRequest) -> Result<ByteStream> {
        tracing::debug!(url = %self.url(&self.paths.command), model = %request.model, "Sending command");

        let response = self.post_json(&self.paths.command, request).await?;
        let url = self.url(&self.paths.command);

        let body = response.bytes_stream().map(move |chunk| {
            chunk.map_err(|e| {
                ConverseError::Network(format!("Response stream from {} failed: {}", url, e))
            })
        });
        Ok(body.boxed())
    }

    async fn submit_approval(&self, decision: &ApprovalDecision) -> Result<()> {
        self.post_json(&self.paths.tool_approval, decision).await?;
        Ok(())
    }

    async fn restore_session(&self, request: &RestoreRequest) -> Result<RestoreResponse> {
        let response = self.post_json(&self.paths.session_restore, request).await?;
        let text = response
            .text()
            .await
            .map_err(|e| ConverseError::Network(format!("Failed to read restore response: {}", e)))?;
        let restore: RestoreResponse = serde_json::from_str(&text).map_err(|e| {
            ConverseError::Protocol(format!("Malformed session-restore response: {}", e))
        })?;
        Ok(restore)
    }

    fn name(&self) -> &str {
        "http"
    }
}
