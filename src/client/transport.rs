use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use crate::agent::models::{AgentCommand, ApprovalDecision, ControlAction, Run};
use crate::agent::ws::AgentEvent;
use crate::errors::ClientError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Request/response side of the command surface as the client sees it.
#[async_trait]
pub trait AgentTransport: Send + Sync {
    async fn submit_command(&self, command: &AgentCommand) -> Result<Run, ClientError>;

    async fn decide(&self, run_id: &str, decision: ApprovalDecision) -> Result<Run, ClientError>;

    async fn control(&self, run_id: &str, action: ControlAction) -> Result<Run, ClientError>;

    async fn get_run(&self, run_id: &str) -> Result<Run, ClientError>;

    /// Full state, in the same shape as the first push frame.
    async fn snapshot(&self) -> Result<AgentEvent, ClientError>;
}

/// [`AgentTransport`] over the server's JSON HTTP API.
#[derive(Debug, Clone)]
pub struct HttpAgentClient {
    base_url: String,
    http: reqwest::Client,
}

impl HttpAgentClient {
    pub fn new(base_url: &str) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("workspace-agent/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Decode a success body, or turn an error status into [`ClientError::Status`].
    async fn read<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, ClientError> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let message = serde_json::from_str::<serde_json::Value>(&body)
                .ok()
                .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
                .unwrap_or_else(|| {
                    if body.trim().is_empty() {
                        status.canonical_reason().unwrap_or("error").to_string()
                    } else {
                        body
                    }
                });
            return Err(ClientError::Status {
                status: status.as_u16(),
                message,
            });
        }
        resp.json::<T>()
            .await
            .map_err(|e| ClientError::Decode(e.to_string()))
    }
}

#[async_trait]
impl AgentTransport for HttpAgentClient {
    async fn submit_command(&self, command: &AgentCommand) -> Result<Run, ClientError> {
        let resp = self
            .http
            .post(self.url("/api/agent/command"))
            .json(command)
            .send()
            .await?;
        Self::read(resp).await
    }

    async fn decide(&self, run_id: &str, decision: ApprovalDecision) -> Result<Run, ClientError> {
        let resp = self
            .http
            .post(self.url(&format!("/api/runs/{}/approve", run_id)))
            .json(&serde_json::json!({ "decision": decision }))
            .send()
            .await?;
        Self::read(resp).await
    }

    async fn control(&self, run_id: &str, action: ControlAction) -> Result<Run, ClientError> {
        let resp = self
            .http
            .post(self.url(&format!("/api/runs/{}/control", run_id)))
            .json(&serde_json::json!({ "action": action }))
            .send()
            .await?;
        Self::read(resp).await
    }

    async fn get_run(&self, run_id: &str) -> Result<Run, ClientError> {
        let resp = self
            .http
            .get(self.url(&format!("/api/runs/{}", run_id)))
            .send()
            .await?;
        Self::read(resp).await
    }

    async fn snapshot(&self) -> Result<AgentEvent, ClientError> {
        let resp = self.http.get(self.url("/api/snapshot")).send().await?;
        Self::read(resp).await
    }
}
