use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::llm::stream::{parse_sse_line, SseLineBuffer, SsePayload, ToolCallAssembler};
use crate::providers::ProviderError;
use crate::traits::{ModelProvider, ProviderResponse, StreamEvent, TokenUsage, ToolCall};

/// Chat-completions transport for OpenAI-compatible endpoints (DeepSeek,
/// OpenAI, local servers).
pub struct OpenAiCompatibleProvider {
    client: Client,
    endpoint: String,
    api_key: String,
    model: String,
}

/// Validate the endpoint URL.
/// HTTPS is required for remote hosts to protect the API key in transit;
/// HTTP is allowed only for localhost LLM servers.
fn validate_endpoint(endpoint: &str) -> Result<(), String> {
    let parsed = reqwest::Url::parse(endpoint)
        .map_err(|e| format!("Invalid endpoint '{}': {}", endpoint, e))?;

    let scheme = parsed.scheme();
    let host = parsed.host_str().unwrap_or("");

    match scheme {
        "https" => Ok(()),
        "http" => {
            let is_localhost =
                host == "localhost" || host == "127.0.0.1" || host == "[::1]" || host == "::1";
            if is_localhost {
                warn!(
                    "Using unencrypted HTTP for local LLM server at '{}'. \
                     API key will be transmitted in cleartext.",
                    endpoint
                );
                Ok(())
            } else {
                Err(format!(
                    "HTTP is not allowed for remote endpoints ('{}'). \
                     Use HTTPS to protect your API key in transit.",
                    endpoint
                ))
            }
        }
        _ => Err(format!(
            "Unsupported URL scheme '{}' in endpoint '{}'. Only http and https are allowed.",
            scheme, endpoint
        )),
    }
}

impl OpenAiCompatibleProvider {
    pub fn new(endpoint: &str, api_key: &str, model: &str) -> Result<Self, String> {
        validate_endpoint(endpoint)?;

        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| format!("Failed to build HTTP client: {}", e))?;

        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        })
    }

    pub fn default_model(&self) -> &str {
        &self.model
    }

    fn build_body(
        &self,
        model: &str,
        messages: &[Value],
        tools: &[Value],
        temperature: Option<f32>,
        stream: bool,
    ) -> Value {
        let mut body = json!({
            "model": model,
            "messages": messages,
        });
        if !tools.is_empty() {
            body["tools"] = json!(tools);
        }
        if let Some(t) = temperature {
            body["temperature"] = json!(t);
        }
        if stream {
            body["stream"] = json!(true);
        }
        body
    }
}

/// Extract content, tool calls, and usage from a non-streamed response body.
fn parse_chat_response(data: &Value, model: &str) -> anyhow::Result<ProviderResponse> {
    let choice = data["choices"]
        .get(0)
        .ok_or_else(|| anyhow::anyhow!("No choices in response"))?;
    let message = &choice["message"];

    let content = message["content"].as_str().map(|s| s.to_string());

    let mut tool_calls = Vec::new();
    if let Some(tcs) = message["tool_calls"].as_array() {
        for tc in tcs {
            tool_calls.push(ToolCall {
                id: tc["id"].as_str().unwrap_or("").to_string(),
                name: tc["function"]["name"].as_str().unwrap_or("").to_string(),
                arguments: tc["function"]["arguments"]
                    .as_str()
                    .unwrap_or("{}")
                    .to_string(),
            });
        }
    }

    let usage = data.get("usage").and_then(|u| {
        Some(TokenUsage {
            input_tokens: u.get("prompt_tokens")?.as_u64()? as u32,
            output_tokens: u.get("completion_tokens")?.as_u64()? as u32,
            model: model.to_string(),
        })
    });

    Ok(ProviderResponse {
        content,
        tool_calls,
        usage,
    })
}

#[async_trait]
impl ModelProvider for OpenAiCompatibleProvider {
    async fn chat(
        &self,
        model: &str,
        messages: &[Value],
        tools: &[Value],
        temperature: Option<f32>,
    ) -> anyhow::Result<ProviderResponse> {
        let body = self.build_body(model, messages, tools, temperature, false);
        info!(model, tools = tools.len(), "Calling LLM API");

        let resp = match self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                error!("HTTP request failed: {}", e);
                return Err(ProviderError::network(&e).into());
            }
        };

        let status = resp.status();
        let text = resp.text().await?;

        if !status.is_success() {
            error!(status = %status, "Provider API error: {}", text);
            return Err(ProviderError::from_status(status.as_u16(), &text).into());
        }

        // Safely truncate for debug logging, respecting UTF-8 char boundaries.
        let truncated = if text.len() > 2000 {
            let mut end = 2000;
            while end > 0 && !text.is_char_boundary(end) {
                end -= 1;
            }
            &text[..end]
        } else {
            &text
        };
        debug!("Provider response: {}", truncated);

        let data: Value = serde_json::from_str(&text)?;
        parse_chat_response(&data, model)
    }

    async fn chat_stream(
        &self,
        model: &str,
        messages: &[Value],
        tools: &[Value],
        temperature: Option<f32>,
        events: mpsc::Sender<StreamEvent>,
    ) -> anyhow::Result<ProviderResponse> {
        let body = self.build_body(model, messages, tools, temperature, true);
        info!(model, tools = tools.len(), "Calling LLM API (stream)");

        let resp = match self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                error!("HTTP request failed: {}", e);
                return Err(ProviderError::network(&e).into());
            }
        };

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            error!(status = %status, "Provider API error: {}", text);
            return Err(ProviderError::from_status(status.as_u16(), &text).into());
        }

        let mut byte_stream = resp.bytes_stream();
        let mut lines = SseLineBuffer::new();
        let mut assembler = ToolCallAssembler::new();
        let mut content = String::new();
        let mut tool_calls: Vec<ToolCall> = Vec::new();

        'read: while let Some(chunk) = byte_stream.next().await {
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    error!("Stream read failed: {}", e);
                    return Err(ProviderError::network(&e).into());
                }
            };
            for line in lines.push(&chunk) {
                let payload = match parse_sse_line(&line) {
                    Some(p) => p,
                    None => continue,
                };
                match payload {
                    SsePayload::Done => break 'read,
                    SsePayload::Chunk(v) => {
                        let choice = &v["choices"][0];
                        let delta = &choice["delta"];
                        if let Some(text) = delta["content"].as_str() {
                            if !text.is_empty() {
                                content.push_str(text);
                                let _ = events
                                    .send(StreamEvent::Content(text.to_string()))
                                    .await;
                            }
                        }
                        if delta.get("tool_calls").is_some() {
                            tool_calls.extend(assembler.absorb(&delta["tool_calls"]));
                        }
                        if choice["finish_reason"].as_str() == Some("tool_calls") {
                            tool_calls.extend(assembler.finish());
                        }
                    }
                }
            }
        }
        // Some servers close without a finish_reason; flush what assembled.
        tool_calls.extend(assembler.finish());

        Ok(ProviderResponse {
            content: if content.is_empty() { None } else { Some(content) },
            tool_calls,
            usage: None,
        })
    }
}
