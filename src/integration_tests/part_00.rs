//! Chat plane: streaming with tool calls, diary capture, and the
//! context-overflow retry ladder.

use super::*;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::llm::diary;
use crate::providers::ProviderError;
use crate::testing::{text_response, tool_call_response, ScriptedTool};
use crate::traits::StreamEvent;

#[tokio::test]
async fn streaming_exchange_forwards_one_tool_call_and_saves_the_diary() {
    let provider = Arc::new(MockProvider::script(vec![
        tool_call_response("call_1", "RawAllBlogData", "{}"),
        text_response("You have three posts: post1, post2, post3."),
    ]));
    let s = stack_with(provider, 0).await;
    let tool = Arc::new(ScriptedTool::new(
        "RawAllBlogData",
        "full contents of every post",
        "post1 post2 post3",
    ));
    s.registry.register("Inner_blog", tool.clone()).await;

    let (events_tx, mut events_rx) = mpsc::channel(64);
    let cancel = CancellationToken::new();
    let query = "what posts do I have?";
    let outcome = s
        .chat
        .run_stream(ACCOUNT, query, &cancel, events_tx)
        .await
        .unwrap();
    assert_eq!(outcome.reply, "You have three posts: post1, post2, post3.");
    assert_eq!(outcome.tools_called, vec!["RawAllBlogData"]);

    let mut content = String::new();
    let mut tool_calls = Vec::new();
    let mut done = 0usize;
    while let Some(event) = events_rx.recv().await {
        match event {
            StreamEvent::Content(fragment) => content.push_str(&fragment),
            StreamEvent::ToolCall(call) => tool_calls.push(call),
            StreamEvent::Done => done += 1,
        }
    }
    assert!(content.contains("post1, post2, post3"));
    assert_eq!(done, 1, "Done must be sent exactly once");
    assert_eq!(tool_calls.len(), 1);
    assert_eq!(tool_calls[0].name, "RawAllBlogData");

    // The account is injected both into the announced call and the
    // arguments the tool actually received.
    let announced: Value = serde_json::from_str(&tool_calls[0].arguments).unwrap();
    assert_eq!(announced["account"], ACCOUNT);
    assert_eq!(tool.seen_args().await[0]["account"], ACCOUNT);

    // The diary write runs detached; poll until it lands.
    let title = diary_title_today();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        if let Some(doc) = s.store.get_document(ACCOUNT, &title).await {
            assert!(doc.content.contains(query));
            assert!(doc.content.contains("post1, post2, post3"));
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "diary document never written"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn sync_exchange_feeds_tool_result_back_to_the_model() {
    let provider = Arc::new(MockProvider::script(vec![
        tool_call_response("call_1", "RawCurrentDate", "{}"),
        text_response("Today is 2026-08-23."),
    ]));
    let s = stack_with(provider.clone(), 0).await;
    s.registry
        .register(
            "Inner_blog",
            Arc::new(ScriptedTool::new("RawCurrentDate", "current date", "2026-08-23")),
        )
        .await;

    let outcome = s
        .chat
        .run_sync(ACCOUNT, "what day is it?", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome.reply, "Today is 2026-08-23.");

    // Second call carries the assistant tool_calls / tool message pair.
    let messages = provider.messages_of_call(1).await;
    let roles: Vec<&str> = messages
        .iter()
        .map(|m| m["role"].as_str().unwrap())
        .collect();
    assert_eq!(roles, vec!["system", "user", "assistant", "tool"]);
    assert_eq!(messages[3]["tool_call_id"], "call_1");
    assert_eq!(messages[3]["content"], "2026-08-23");
}

/// Rejects every request for context length and records how large each
/// attempt was.
struct OverflowProvider {
    sizes: Mutex<Vec<usize>>,
}

#[async_trait]
impl ModelProvider for OverflowProvider {
    async fn chat(
        &self,
        _model: &str,
        messages: &[Value],
        _tools: &[Value],
        _temperature: Option<f32>,
    ) -> anyhow::Result<ProviderResponse> {
        let total: usize = messages.iter().map(|m| m.to_string().len()).sum();
        self.sizes.lock().await.push(total);
        Err(ProviderError::from_status(
            400,
            "This model's maximum context length is 65536 tokens, however you requested more",
        )
        .into())
    }
}

#[tokio::test]
async fn context_overflow_retries_smaller_tiers_then_surfaces() {
    let provider = Arc::new(OverflowProvider {
        sizes: Mutex::new(Vec::new()),
    });
    let s = stack_with(provider.clone(), 0).await;

    let query = "x".repeat(20_000);
    let err = s
        .chat
        .run_sync(ACCOUNT, &query, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(err
        .downcast_ref::<ProviderError>()
        .unwrap()
        .is_context_overflow());

    // Initial attempt plus one retry per tier, each strictly smaller.
    let sizes = provider.sizes.lock().await.clone();
    assert_eq!(sizes.len(), 3, "attempt sizes: {sizes:?}");
    assert!(sizes[0] > sizes[1] && sizes[1] > sizes[2], "attempt sizes: {sizes:?}");
}

#[tokio::test]
async fn non_overflow_provider_error_is_not_retried() {
    let provider = Arc::new(MockProvider::failing("upstream unavailable"));
    let s = stack_with(provider.clone(), 0).await;

    let err = s
        .chat
        .run_sync(ACCOUNT, "hello", &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("upstream unavailable"));
    assert_eq!(provider.call_count().await, 1);
}

fn diary_title_today() -> String {
    diary::diary_title(&chrono::Local::now().format("%Y-%m-%d").to_string())
}
