//! Delegation assistant gateway.
//!
//! When the agent hands a request off (via the delegation tool or a
//! wake-phrase capture), the session forwards it to a secondary chat
//! gateway and speaks the reply. Plain HTTP chat completion, no
//! streaming.

use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct AssistantConfig {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
}

pub struct AssistantClient {
    config: AssistantConfig,
    client: reqwest::Client,
}

impl AssistantClient {
    pub fn new(config: AssistantConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("building assistant HTTP client")?;
        Ok(Self { config, client })
    }

    /// Run one request through the assistant and return its reply text.
    pub async fn run(&self, intent: &str, request: &str) -> Result<String> {
        info!(intent, request, "Delegating to assistant");
        let body = serde_json::json!({
            "model": self.config.model,
            "messages": [
                {
                    "role": "system",
                    "content": "You are a phone agent's back-office assistant. \
                                Handle the request and reply with one short \
                                sentence the agent can read to the caller.",
                },
                {
                    "role": "user",
                    "content": format!("Intent: {}\nRequest: {}", intent, request),
                },
            ],
        });

        let resp = self
            .client
            .post(&self.config.endpoint)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .context("assistant request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("assistant API error {}: {}", status, text);
        }

        let json: serde_json::Value = resp.json().await.context("assistant response")?;
        let reply = json["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or("")
            .trim()
            .to_string();
        debug!(chars = reply.len(), "Assistant reply");
        Ok(reply)
    }
}
