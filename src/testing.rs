//! Test infrastructure: MockProvider, ScriptedTool, and TestSink.
//!
//! Provides scripted stand-ins for the LLM provider, registry tools and
//! notification sinks, so tests can exercise the real execution paths
//! without a network or a child process.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::hub::NotificationSink;
use crate::traits::{ModelProvider, ProviderResponse, TokenUsage, Tool, ToolCall};
use crate::types::{Notification, NotificationKind};

// ---------------------------------------------------------------------------
// MockProvider
// ---------------------------------------------------------------------------

/// A recorded call to `MockProvider::chat()`.
#[derive(Debug, Clone)]
#[allow(dead_code)]
pub struct MockChatCall {
    pub model: String,
    pub messages: Vec<Value>,
    pub tools: Vec<Value>,
}

/// Build a text-only ProviderResponse.
pub fn text_response(text: &str) -> ProviderResponse {
    ProviderResponse {
        content: Some(text.to_string()),
        tool_calls: vec![],
        usage: Some(TokenUsage {
            input_tokens: 10,
            output_tokens: 5,
            model: "mock".to_string(),
        }),
    }
}

/// Build a single-tool-call ProviderResponse.
pub fn tool_call_response(id: &str, tool_name: &str, args: &str) -> ProviderResponse {
    ProviderResponse {
        content: None,
        tool_calls: vec![ToolCall {
            id: id.to_string(),
            name: tool_name.to_string(),
            arguments: args.to_string(),
        }],
        usage: Some(TokenUsage {
            input_tokens: 10,
            output_tokens: 5,
            model: "mock".to_string(),
        }),
    }
}

/// Mock LLM provider that returns scripted responses.
pub struct MockProvider {
    responses: Mutex<Vec<ProviderResponse>>,
    fallback: Option<ProviderResponse>,
    fail_message: Option<String>,
    pub call_log: Mutex<Vec<MockChatCall>>,
}

impl MockProvider {
    /// A provider with a FIFO queue of scripted responses. Once the queue
    /// is drained it answers with a plain "Mock response".
    pub fn script(responses: Vec<ProviderResponse>) -> Self {
        Self {
            responses: Mutex::new(responses),
            fallback: None,
            fail_message: None,
            call_log: Mutex::new(Vec::new()),
        }
    }

    /// A provider that returns the same response on every call.
    pub fn always(response: ProviderResponse) -> Self {
        Self {
            responses: Mutex::new(Vec::new()),
            fallback: Some(response),
            fail_message: None,
            call_log: Mutex::new(Vec::new()),
        }
    }

    /// A provider whose every call fails, for unreachable-LLM paths.
    pub fn failing(message: &str) -> Self {
        Self {
            responses: Mutex::new(Vec::new()),
            fallback: None,
            fail_message: Some(message.to_string()),
            call_log: Mutex::new(Vec::new()),
        }
    }

    /// How many times `chat()` was called.
    pub async fn call_count(&self) -> usize {
        self.call_log.lock().await.len()
    }

    /// The message list sent on the n-th call (0-based).
    pub async fn messages_of_call(&self, index: usize) -> Vec<Value> {
        self.call_log.lock().await[index].messages.clone()
    }
}

#[async_trait]
impl ModelProvider for MockProvider {
    async fn chat(
        &self,
        model: &str,
        messages: &[Value],
        tools: &[Value],
        _temperature: Option<f32>,
    ) -> anyhow::Result<ProviderResponse> {
        self.call_log.lock().await.push(MockChatCall {
            model: model.to_string(),
            messages: messages.to_vec(),
            tools: tools.to_vec(),
        });

        if let Some(message) = &self.fail_message {
            anyhow::bail!("{}", message);
        }

        let mut responses = self.responses.lock().await;
        if !responses.is_empty() {
            return Ok(responses.remove(0));
        }
        match &self.fallback {
            Some(response) => Ok(response.clone()),
            None => Ok(text_response("Mock response")),
        }
    }
}

// ---------------------------------------------------------------------------
// ScriptedTool
// ---------------------------------------------------------------------------

/// A registry tool with a fixed answer that records every argument set
/// it was called with.
pub struct ScriptedTool {
    name: String,
    description: String,
    output: Result<String, String>,
    seen: Mutex<Vec<Value>>,
}

impl ScriptedTool {
    pub fn new(name: &str, description: &str, result: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            output: Ok(result.to_string()),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// A tool whose every call fails with the given message.
    pub fn failing(name: &str, description: &str, error: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            output: Err(error.to_string()),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Arguments received so far, in call order.
    pub async fn seen_args(&self) -> Vec<Value> {
        self.seen.lock().await.clone()
    }
}

#[async_trait]
impl Tool for ScriptedTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn call(&self, args: &Value) -> anyhow::Result<String> {
        self.seen.lock().await.push(args.clone());
        match &self.output {
            Ok(result) => Ok(result.clone()),
            Err(error) => Err(anyhow::anyhow!("{}", error)),
        }
    }
}

// ---------------------------------------------------------------------------
// TestSink
// ---------------------------------------------------------------------------

/// A notification sink that captures everything delivered to it.
pub struct TestSink {
    received: Mutex<Vec<Notification>>,
}

impl TestSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            received: Mutex::new(Vec::new()),
        })
    }

    pub async fn received(&self) -> Vec<Notification> {
        self.received.lock().await.clone()
    }

    /// The notification kinds seen so far, in delivery order.
    #[allow(dead_code)]
    pub async fn kinds(&self) -> Vec<NotificationKind> {
        self.received.lock().await.iter().map(|n| n.kind).collect()
    }

    /// Poll until a notification matching the predicate shows up, or the
    /// deadline passes.
    pub async fn wait_for<F>(&self, predicate: F, deadline: Duration) -> Option<Notification>
    where
        F: Fn(&Notification) -> bool,
    {
        let poll = async {
            loop {
                if let Some(found) = self
                    .received
                    .lock()
                    .await
                    .iter()
                    .find(|n| predicate(n))
                    .cloned()
                {
                    return found;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(deadline, poll).await.ok()
    }

    /// Count of notifications of one kind.
    pub async fn count_of(&self, kind: NotificationKind) -> usize {
        self.received
            .lock()
            .await
            .iter()
            .filter(|n| n.kind == kind)
            .count()
    }
}

#[async_trait]
impl NotificationSink for TestSink {
    async fn deliver(&self, notification: Notification) -> anyhow::Result<()> {
        self.received.lock().await.push(notification);
        Ok(())
    }
}
