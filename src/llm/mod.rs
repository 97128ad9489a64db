//! Streaming chat-completions client for the local voice pipeline.
//!
//! Plain HTTPS POST with `stream: true`; the response is a stream of
//! Server-Sent Event lines (`data: {...}`, terminated by `data: [DONE]`).
//! Token deltas are forwarded over a channel as they arrive so the
//! sentence pacer can start speaking before the model finishes.

use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Read timeout on the completion request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Generation cap; phone replies should stay short.
const MAX_TOKENS: u32 = 256;

const TEMPERATURE: f64 = 0.7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// One parsed SSE line.
#[derive(Debug, PartialEq)]
enum SseLine {
    /// A content token from the model.
    Delta(String),
    /// `data: [DONE]`, stream complete.
    Done,
    /// Blank line, comment, or chunk with no content.
    Skip,
}

/// Chat-completions endpoint client.
pub struct LlmClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl LlmClient {
    pub fn new(endpoint: &str, api_key: &str, model: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .read_timeout(REQUEST_TIMEOUT)
            .build()
            .context("building LLM HTTP client")?;
        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        })
    }

    /// Start a streaming completion. Token deltas arrive on the returned
    /// channel; the channel closes when the stream ends or errors.
    pub async fn stream_chat(
        &self,
        messages: &[ChatMessage],
    ) -> Result<mpsc::UnboundedReceiver<String>> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
            "max_tokens": MAX_TOKENS,
            "temperature": TEMPERATURE,
        });

        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .context("LLM request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("LLM API error {}: {}", status, text);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut stream = resp.bytes_stream();
            let mut buf: Vec<u8> = Vec::new();

            'outer: while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        warn!(error = %e, "LLM stream read error");
                        break;
                    }
                };
                buf.extend_from_slice(&chunk);

                while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = buf.drain(..=pos).collect();
                    let line = String::from_utf8_lossy(&line);
                    match parse_sse_line(line.trim()) {
                        SseLine::Delta(text) => {
                            if tx.send(text).is_err() {
                                break 'outer; // Consumer cancelled generation.
                            }
                        }
                        SseLine::Done => break 'outer,
                        SseLine::Skip => {}
                    }
                }
            }
            debug!("LLM stream finished");
        });

        Ok(rx)
    }
}

/// Parse one SSE line into a token delta, the DONE marker, or a skip.
///
/// Malformed JSON payloads are skipped so one bad chunk cannot kill the
/// response.
fn parse_sse_line(line: &str) -> SseLine {
    if line.is_empty() || line.starts_with(':') {
        return SseLine::Skip;
    }
    let Some(data) = line.strip_prefix("data:").map(str::trim) else {
        return SseLine::Skip;
    };
    if data == "[DONE]" {
        return SseLine::Done;
    }
    let value: serde_json::Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => {
            debug!(error = %e, "Skipping malformed SSE chunk");
            return SseLine::Skip;
        }
    };
    match value["choices"][0]["delta"]["content"].as_str() {
        Some(text) if !text.is_empty() => SseLine::Delta(text.to_string()),
        _ => SseLine::Skip,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_delta_is_extracted() {
        let line = r#"data: {"choices":[{"delta":{"content":"Hello"}}]}"#;
        assert_eq!(parse_sse_line(line), SseLine::Delta("Hello".to_string()));
    }

    #[test]
    fn done_marker_terminates() {
        assert_eq!(parse_sse_line("data: [DONE]"), SseLine::Done);
    }

    #[test]
    fn role_only_chunks_are_skipped() {
        let line = r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#;
        assert_eq!(parse_sse_line(line), SseLine::Skip);
    }

    #[test]
    fn malformed_chunks_are_skipped() {
        assert_eq!(parse_sse_line("data: {not json"), SseLine::Skip);
        assert_eq!(parse_sse_line(": keep-alive"), SseLine::Skip);
        assert_eq!(parse_sse_line(""), SseLine::Skip);
    }

    #[test]
    fn messages_serialize_with_lowercase_roles() {
        let msg = ChatMessage::new(Role::Assistant, "hi");
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"role":"assistant","content":"hi"}"#);
    }
}
