use std::sync::Arc;

use chrono::Local;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::AgentError;
use crate::llm::diary;
use crate::llm::sanitize::{
    compact_messages, sanitize_messages, truncate_str, ContextLimits, RETRY_TIERS,
};
use crate::providers::ProviderError;
use crate::registry::ToolRegistry;
use crate::store::DocumentStore;
use crate::traits::{ModelProvider, ProviderResponse, StreamEvent, ToolCall};

/// Upper bound on LLM round trips in one exchange. Applies to both the
/// sync and streaming surfaces.
pub const MAX_TOOL_ITERATIONS: usize = 25;

/// What one completed exchange produced.
#[derive(Debug, Clone)]
pub struct ChatOutcome {
    pub reply: String,
    pub tools_called: Vec<String>,
}

/// Runs the tool-calling conversation loop against one provider and one
/// tool registry. Shared by interactive chat and by sub-task execution.
pub struct ChatSession {
    provider: Arc<dyn ModelProvider>,
    registry: Arc<ToolRegistry>,
    store: Arc<dyn DocumentStore>,
    model: String,
    limits: ContextLimits,
}

fn system_prompt(account: &str, catalog: &str) -> String {
    format!(
        "You are a task assistant for account '{}'. Today is {}.\n\
         Use the available tools to read and update the account's documents, \
         reminders and reports. Tool arguments must be a JSON object; the \
         'account' field is filled in for you when omitted.\n\n\
         Available tools:\n{}",
        account,
        Local::now().format("%Y-%m-%d"),
        catalog
    )
}

impl ChatSession {
    pub fn new(
        provider: Arc<dyn ModelProvider>,
        registry: Arc<ToolRegistry>,
        store: Arc<dyn DocumentStore>,
        model: impl Into<String>,
        limits: ContextLimits,
    ) -> Self {
        Self {
            provider,
            registry,
            store,
            model: model.into(),
            limits,
        }
    }

    /// One exchange, returning only the final text.
    pub async fn run_sync(
        &self,
        account: &str,
        query: &str,
        cancel: &CancellationToken,
    ) -> anyhow::Result<ChatOutcome> {
        self.run_loop(account, query, cancel, None).await
    }

    /// One exchange with incremental events. Content fragments and tool
    /// calls are forwarded as they happen; `Done` is sent once at the end.
    pub async fn run_stream(
        &self,
        account: &str,
        query: &str,
        cancel: &CancellationToken,
        events: mpsc::Sender<StreamEvent>,
    ) -> anyhow::Result<ChatOutcome> {
        self.run_loop(account, query, cancel, Some(events)).await
    }

    async fn run_loop(
        &self,
        account: &str,
        query: &str,
        cancel: &CancellationToken,
        events: Option<mpsc::Sender<StreamEvent>>,
    ) -> anyhow::Result<ChatOutcome> {
        let tools = self.registry.llm_specs().await;
        let catalog = self.registry.catalog_text().await;
        debug!(account = %account, tools = tools.len(), "Starting chat exchange");

        let mut messages = vec![
            json!({"role": "system", "content": system_prompt(account, &catalog)}),
            json!({"role": "user", "content": query}),
        ];

        let mut full_response = String::new();
        let mut reply = String::new();
        let mut tools_called: Vec<String> = Vec::new();
        let mut last_batch: Vec<String> = Vec::new();

        let mut response = self
            .call_provider(&messages, &tools, cancel, events.as_ref())
            .await?;
        if let Some(content) = &response.content {
            reply = content.clone();
            full_response.push_str(content);
        }

        let mut remaining = MAX_TOOL_ITERATIONS;
        while !response.tool_calls.is_empty() && remaining > 0 {
            remaining -= 1;
            last_batch.clear();

            for call in std::mem::take(&mut response.tool_calls) {
                if cancel.is_cancelled() {
                    return Err(AgentError::conflict("chat canceled").into());
                }
                tools_called.push(call.name.clone());
                last_batch.push(call.name.clone());

                let (args_json, result_text) =
                    self.execute_call(account, &call, events.as_ref()).await;

                messages.push(json!({
                    "role": "assistant",
                    "tool_calls": [{
                        "id": call.id,
                        "type": "function",
                        "function": {
                            "name": call.name,
                            "arguments": truncate_str(&args_json, self.limits.max_tool_arg_chars),
                        },
                    }],
                }));
                messages.push(json!({
                    "role": "tool",
                    "tool_call_id": call.id,
                    "content": truncate_str(&result_text, self.limits.max_tool_result_chars),
                }));

                // Short results are safe to echo into the saved transcript;
                // long ones stay in the message history only.
                if result_text.len() < 32 {
                    full_response
                        .push_str(&format!("\n[Tool {} called with result: {}]\n", call.name, result_text));
                } else {
                    full_response.push_str(&format!("\n[Tool {} called]\n", call.name));
                }
            }

            messages = compact_messages(&messages, &self.limits);

            response = self
                .call_provider(&messages, &tools, cancel, events.as_ref())
                .await?;
            if let Some(content) = &response.content {
                if !content.is_empty() {
                    reply = content.clone();
                    full_response.push_str(content);
                }
            }
        }

        if !response.tool_calls.is_empty() {
            warn!(account = %account, "Chat exchange hit the iteration limit");
            reply = format!(
                "Tool calling completed (iteration limit reached). Last tools called: {}",
                last_batch.join("; ")
            );
        }

        if let Some(events) = &events {
            let _ = events.send(StreamEvent::Done).await;
        }

        tokio::spawn(diary::record_exchange(
            self.store.clone(),
            account.to_string(),
            query.to_string(),
            full_response,
        ));

        info!(account = %account, tools = tools_called.len(), "Chat exchange finished");
        Ok(ChatOutcome { reply, tools_called })
    }

    /// Parse arguments, inject the account, announce the call, run it.
    /// Returns the argument JSON as recorded in history plus the result
    /// text; failures come back as `Error: ...` so the model can react.
    async fn execute_call(
        &self,
        account: &str,
        call: &ToolCall,
        events: Option<&mpsc::Sender<StreamEvent>>,
    ) -> (String, String) {
        let mut parsed: Value = match serde_json::from_str(&call.arguments) {
            Ok(value @ Value::Object(_)) => value,
            Ok(other) => {
                warn!(tool = %call.name, "Tool arguments are not a JSON object");
                if let Some(events) = events {
                    let _ = events.send(StreamEvent::ToolCall(call.clone())).await;
                }
                return (
                    call.arguments.clone(),
                    format!("Error: tool arguments must be a JSON object, got: {}", other),
                );
            }
            Err(err) => {
                warn!(tool = %call.name, error = %err, "Tool arguments are not valid JSON");
                if let Some(events) = events {
                    let _ = events.send(StreamEvent::ToolCall(call.clone())).await;
                }
                return (
                    call.arguments.clone(),
                    format!("Error: invalid tool arguments: {}", err),
                );
            }
        };

        if let Some(obj) = parsed.as_object_mut() {
            if !obj.contains_key("account") {
                obj.insert("account".to_string(), json!(account));
            }
        }
        let args_json =
            serde_json::to_string(&parsed).unwrap_or_else(|_| call.arguments.clone());

        if let Some(events) = events {
            let _ = events
                .send(StreamEvent::ToolCall(ToolCall {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    arguments: args_json.clone(),
                }))
                .await;
        }

        info!(tool = %call.name, "Tool call begin");
        match self.registry.call(&call.name, &parsed).await {
            Ok(result) => {
                debug!(tool = %call.name, chars = result.len(), "Tool call done");
                (args_json, result)
            }
            Err(err) => {
                error!(tool = %call.name, error = %err, "Tool call failed");
                (args_json, format!("Error: {}", err))
            }
        }
    }

    /// One provider round trip. Messages are sanitized on every attempt;
    /// context-length rejections retry through progressively smaller
    /// budget tiers before giving up. Cancellation drops the in-flight
    /// request.
    async fn call_provider(
        &self,
        messages: &[Value],
        tools: &[Value],
        cancel: &CancellationToken,
        events: Option<&mpsc::Sender<StreamEvent>>,
    ) -> anyhow::Result<ProviderResponse> {
        let mut limits = self.limits;
        let mut tier = 0usize;
        loop {
            if cancel.is_cancelled() {
                return Err(AgentError::conflict("chat canceled").into());
            }
            let sanitized = sanitize_messages(messages, &limits);
            let request = async {
                match events {
                    Some(events) => {
                        self.provider
                            .chat_stream(&self.model, &sanitized, tools, None, events.clone())
                            .await
                    }
                    None => self.provider.chat(&self.model, &sanitized, tools, None).await,
                }
            };
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(AgentError::conflict("chat canceled").into()),
                result = request => result,
            };
            match result {
                Ok(response) => return Ok(response),
                Err(err) => {
                    let overflow = err
                        .downcast_ref::<ProviderError>()
                        .map(|p| p.is_context_overflow())
                        .unwrap_or(false);
                    if overflow && tier < RETRY_TIERS.len() {
                        warn!(tier = tier + 1, "Context overflow, shrinking the conversation and retrying");
                        limits = self.limits.with_tier(RETRY_TIERS[tier]);
                        tier += 1;
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{DocumentStore, MemoryStore};
    use crate::testing::{tool_call_response, text_response, MockProvider, ScriptedTool};

    fn session(provider: MockProvider, registry: Arc<ToolRegistry>) -> (ChatSession, Arc<MockProvider>) {
        let provider = Arc::new(provider);
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let session = ChatSession::new(
            provider.clone(),
            registry,
            store,
            "deepseek-chat",
            ContextLimits::default(),
        );
        (session, provider)
    }

    #[tokio::test]
    async fn plain_reply_without_tools() {
        let provider = MockProvider::script(vec![text_response("hello there")]);
        let (session, provider) = session(provider, ToolRegistry::new());

        let outcome = session
            .run_sync("alice", "say hi", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.reply, "hello there");
        assert!(outcome.tools_called.is_empty());
        assert_eq!(provider.call_count().await, 1);
    }

    #[tokio::test]
    async fn tool_call_round_trip_appends_message_pair() {
        let registry = ToolRegistry::new();
        let tool = Arc::new(ScriptedTool::new("RawAllBlogName", "list blog titles", "t1, t2"));
        registry.register("Inner_blog", tool.clone()).await;

        let provider = MockProvider::script(vec![
            tool_call_response("call_1", "RawAllBlogName", "{}"),
            text_response("you have two blogs"),
        ]);
        let (session, provider) = session(provider, registry);

        let outcome = session
            .run_sync("alice", "list my blogs", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.reply, "you have two blogs");
        assert_eq!(outcome.tools_called, vec!["RawAllBlogName"]);

        // The account is injected into the arguments the tool sees.
        let seen = tool.seen_args().await;
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0]["account"], "alice");

        // The second provider call carries the assistant/tool message pair.
        let second = provider.messages_of_call(1).await;
        let assistant = &second[second.len() - 2];
        assert_eq!(assistant["role"], "assistant");
        assert_eq!(assistant["tool_calls"][0]["id"], "call_1");
        assert!(assistant["tool_calls"][0]["function"]["arguments"]
            .as_str()
            .unwrap()
            .contains("alice"));
        let tool_msg = &second[second.len() - 1];
        assert_eq!(tool_msg["role"], "tool");
        assert_eq!(tool_msg["tool_call_id"], "call_1");
        assert_eq!(tool_msg["content"], "t1, t2");
    }

    #[tokio::test]
    async fn invalid_arguments_become_error_result() {
        let registry = ToolRegistry::new();
        let tool = Arc::new(ScriptedTool::new("RawGetBlogData", "fetch one blog", "data"));
        registry.register("Inner_blog", tool.clone()).await;

        let provider = MockProvider::script(vec![
            tool_call_response("call_1", "RawGetBlogData", "not json at all"),
            text_response("sorry"),
        ]);
        let (session, provider) = session(provider, registry);

        let outcome = session
            .run_sync("alice", "fetch", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.reply, "sorry");
        // The tool itself never ran.
        assert!(tool.seen_args().await.is_empty());
        let second = provider.messages_of_call(1).await;
        let tool_msg = &second[second.len() - 1];
        assert!(tool_msg["content"]
            .as_str()
            .unwrap()
            .starts_with("Error: invalid tool arguments"));
    }

    #[tokio::test]
    async fn failing_tool_gets_error_prefix() {
        let registry = ToolRegistry::new();
        let tool = Arc::new(ScriptedTool::failing("RawGetBlogData", "fetch one blog", "no such blog"));
        registry.register("Inner_blog", tool).await;

        let provider = MockProvider::script(vec![
            tool_call_response("call_1", "RawGetBlogData", "{\"title\":\"x\"}"),
            text_response("could not fetch"),
        ]);
        let (session, provider) = session(provider, registry);

        session
            .run_sync("alice", "fetch", &CancellationToken::new())
            .await
            .unwrap();

        let second = provider.messages_of_call(1).await;
        let tool_msg = &second[second.len() - 1];
        let content = tool_msg["content"].as_str().unwrap();
        assert!(content.starts_with("Error: "), "got: {}", content);
    }

    #[tokio::test]
    async fn iteration_limit_produces_completion_notice() {
        let registry = ToolRegistry::new();
        let tool = Arc::new(ScriptedTool::new("RawCurrentDate", "current date", "2026-08-22"));
        registry.register("Inner_blog", tool).await;

        let provider =
            MockProvider::always(tool_call_response("call_x", "RawCurrentDate", "{}"));
        let (session, provider) = session(provider, registry);

        let outcome = session
            .run_sync("alice", "loop forever", &CancellationToken::new())
            .await
            .unwrap();

        assert!(outcome.reply.contains("iteration limit"));
        assert!(outcome.reply.contains("RawCurrentDate"));
        assert_eq!(outcome.tools_called.len(), MAX_TOOL_ITERATIONS);
        assert_eq!(provider.call_count().await, MAX_TOOL_ITERATIONS + 1);
    }

    #[tokio::test]
    async fn stream_surface_emits_tool_call_then_content_then_done() {
        let registry = ToolRegistry::new();
        let tool = Arc::new(ScriptedTool::new("RawAllBlogName", "list blog titles", "t1"));
        registry.register("Inner_blog", tool).await;

        let provider = MockProvider::script(vec![
            tool_call_response("call_1", "RawAllBlogName", "{}"),
            text_response("one blog"),
        ]);
        let (session, _provider) = session(provider, registry);

        let (tx, mut rx) = mpsc::channel(32);
        session
            .run_stream("alice", "list", &CancellationToken::new(), tx)
            .await
            .unwrap();

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }

        let mut saw_tool_call = false;
        let mut done_count = 0;
        for event in &events {
            match event {
                StreamEvent::ToolCall(call) => {
                    saw_tool_call = true;
                    assert!(call.arguments.contains("alice"));
                }
                StreamEvent::Done => done_count += 1,
                StreamEvent::Content(_) => {}
            }
        }
        assert!(saw_tool_call);
        assert_eq!(done_count, 1);
        assert!(matches!(events.last(), Some(StreamEvent::Done)));
    }

    #[tokio::test]
    async fn cancellation_short_circuits_before_any_call() {
        let provider = MockProvider::script(vec![text_response("never sent")]);
        let (session, provider) = session(provider, ToolRegistry::new());

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = session.run_sync("alice", "hi", &cancel).await.unwrap_err();

        assert!(err.to_string().contains("canceled"));
        assert_eq!(provider.call_count().await, 0);
    }
}
