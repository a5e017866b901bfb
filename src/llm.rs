//! Language-model transport: a thin client for OpenAI-compatible chat
//! completion endpoints.
//!
//! Authentication and endpoint selection come from [`AppConfig`]; nothing
//! here leaks into core state beyond the configured client itself.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::config::AppConfig;
use crate::errors::PlannerError;
use crate::planner::{LlmPlanner, PlanRequest};

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

/// Chat-completions client implementing the planner capability.
pub struct LlmClient {
    http: Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl LlmClient {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            http: Client::new(),
            endpoint: config.llm_endpoint.trim_end_matches('/').to_string(),
            api_key: config.llm_api_key.clone(),
            model: config.llm_model.clone(),
        }
    }
}

#[async_trait]
impl LlmPlanner for LlmClient {
    async fn generate(&self, request: &PlanRequest) -> Result<String, PlannerError> {
        let url = format!("{}/chat/completions", self.endpoint);
        debug!(model = %self.model, "requesting chat completion");

        let body = json!({
            "model": self.model,
            "temperature": 0.2,
            "messages": [
                { "role": "system", "content": request.system },
                { "role": "user", "content": request.user },
            ],
        });

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| PlannerError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(PlannerError::Transport(format!(
                "endpoint returned {status}: {detail}"
            )));
        }

        let payload: ChatResponse = response
            .json()
            .await
            .map_err(|err| PlannerError::Transport(err.to_string()))?;
        payload
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| PlannerError::Transport("response carried no choices".to_string()))
    }
}
