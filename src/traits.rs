use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

/// A single tool call as returned by the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String, // JSON object, serialized
}

/// Token usage statistics from an LLM API response.
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub model: String,
}

/// The LLM's response: either content text, tool calls, or both.
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<TokenUsage>,
}

/// An incremental event from a streamed model turn.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Assistant text fragment, in arrival order.
    Content(String),
    /// A fully assembled tool call: id, name, and valid-JSON arguments.
    ToolCall(ToolCall),
    /// Terminal marker for the whole exchange. Sent exactly once, last.
    Done,
}

/// Model provider: sends messages + tool defs to an LLM, gets back a response.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    async fn chat(
        &self,
        model: &str,
        messages: &[Value],
        tools: &[Value],
        temperature: Option<f32>,
    ) -> anyhow::Result<ProviderResponse>;

    /// Streaming variant: content fragments are written to `events` as they
    /// arrive and the assembled response is returned when the turn ends.
    /// The default performs a plain `chat` and emits the content as a single
    /// fragment; transports with real delta streaming override this.
    async fn chat_stream(
        &self,
        model: &str,
        messages: &[Value],
        tools: &[Value],
        temperature: Option<f32>,
        events: mpsc::Sender<StreamEvent>,
    ) -> anyhow::Result<ProviderResponse> {
        let response = self.chat(model, messages, tools, temperature).await?;
        if let Some(content) = &response.content {
            if !content.is_empty() {
                let _ = events.send(StreamEvent::Content(content.clone())).await;
            }
        }
        Ok(response)
    }
}

/// A callable capability: in-process tools and MCP-proxied tools.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON-schema object describing the accepted arguments.
    fn schema(&self) -> Value;
    /// Execute with a JSON object of arguments, returning result text.
    async fn call(&self, args: &Value) -> anyhow::Result<String>;
}
