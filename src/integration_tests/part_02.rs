//! Scheduler fires, the scheduled report pipeline, and MCP discovery
//! resilience.

use super::*;

use chrono::Duration as ChronoDuration;
use serde_json::json;

use crate::mcp::{McpClientPool, McpConfigSet, McpServerConfig};
use crate::testing::{text_response, ScriptedTool};
use crate::tools::docs;
use crate::types::NotificationKind;

#[tokio::test]
async fn reminder_with_repeat_three_fires_three_times_then_disables() {
    let provider = Arc::new(MockProvider::script(Vec::new()));
    let s = stack_with(provider, 0).await;

    let reminder = s
        .scheduler
        .add_reminder(ACCOUNT, "stretch", "stand up", 2, 3, None)
        .await
        .unwrap();
    assert!(reminder.enabled);

    // Drive the clock past each next_run_at instead of sleeping.
    let mut now = reminder.next_run_at + ChronoDuration::seconds(1);
    for _ in 0..3 {
        s.scheduler.tick_once(now).await;
        now += ChronoDuration::seconds(3);
    }
    // The exhausted entry must not fire again.
    s.scheduler.tick_once(now + ChronoDuration::days(1)).await;

    assert_eq!(s.sink.count_of(NotificationKind::Reminder).await, 3);
    let fires: Vec<_> = s
        .sink
        .received()
        .await
        .into_iter()
        .filter(|n| n.kind == NotificationKind::Reminder)
        .collect();
    for (index, fire) in fires.iter().enumerate() {
        assert_eq!(fire.task_id, reminder.id);
        assert_eq!(fire.message.as_deref(), Some("[stretch] stand up"));
        let data = fire.data.as_ref().unwrap();
        assert_eq!(data["run_count"], json!(index as u64 + 1));
    }

    let after = s.scheduler.get_reminder(&reminder.id).await.unwrap();
    assert!(!after.enabled);
    assert_eq!(after.run_count, 3);
    assert_eq!(after.repeat_count, 0);
}

#[tokio::test]
async fn paused_reminder_skips_fires_until_resumed() {
    let provider = Arc::new(MockProvider::script(Vec::new()));
    let s = stack_with(provider, 0).await;

    let reminder = s
        .scheduler
        .add_reminder(ACCOUNT, "water", "drink", 60, -1, None)
        .await
        .unwrap();
    assert!(s.scheduler.pause_reminder(&reminder.id).await);

    let due = reminder.next_run_at + ChronoDuration::seconds(1);
    s.scheduler.tick_once(due).await;
    assert_eq!(s.sink.count_of(NotificationKind::Reminder).await, 0);

    assert!(s.scheduler.resume_reminder(&reminder.id).await);
    let resumed = s.scheduler.get_reminder(&reminder.id).await.unwrap();
    s.scheduler
        .tick_once(resumed.next_run_at + ChronoDuration::seconds(1))
        .await;
    assert_eq!(s.sink.count_of(NotificationKind::Reminder).await, 1);
}

#[tokio::test]
async fn due_daily_report_entry_runs_a_report_task() {
    let provider = Arc::new(MockProvider::always(text_response(
        "# Daily report\nA quiet day.",
    )));
    let s = stack_with(provider, 1).await;
    docs::register_all(&s.registry, &s.store).await;

    s.scheduler.register_report_entries(ACCOUNT).await;
    let daily = s
        .scheduler
        .list_reminders(ACCOUNT)
        .await
        .into_iter()
        .find(|r| r.report_kind.as_deref() == Some("daily"))
        .expect("daily entry registered");

    s.scheduler
        .tick_once(daily.next_run_at + ChronoDuration::seconds(1))
        .await;

    let generated = s
        .sink
        .wait_for(
            |n| n.kind == NotificationKind::ReportGenerated,
            Duration::from_secs(5),
        )
        .await
        .expect("report should be generated");
    let title = generated.data.unwrap()["title"].as_str().unwrap().to_string();
    assert!(title.starts_with("agent_report_daily_"), "{title}");

    s.sink
        .wait_for(|n| n.kind == NotificationKind::Done, Duration::from_secs(5))
        .await
        .expect("report task should finish");

    let doc = s
        .store
        .get_document(ACCOUNT, &title)
        .await
        .expect("report document saved");
    assert!(doc.content.contains("Daily report"));

    // The standing entry keeps repeating.
    let entry = s.scheduler.get_reminder(&daily.id).await.unwrap();
    assert!(entry.enabled);
    assert_eq!(entry.repeat_count, -1);
}

#[tokio::test]
async fn unreachable_mcp_server_does_not_hide_other_tools() {
    let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
    let mcp_pool = McpClientPool::new(Duration::from_secs(1));
    let configs = McpConfigSet::load(Arc::clone(&store), "admin", Arc::clone(&mcp_pool)).await;
    configs
        .add(McpServerConfig::new(
            "ghost",
            "agentd-no-such-binary",
            Vec::new(),
        ))
        .await
        .unwrap();

    let registry = ToolRegistry::new();
    registry
        .register(
            "Inner_blog",
            Arc::new(ScriptedTool::new("RawCurrentDate", "current date", "2026-08-23")),
        )
        .await;
    registry.attach_mcp(configs, Arc::clone(&mcp_pool)).await;

    // Discovery skips the unreachable server instead of failing.
    let specs = registry.llm_specs().await;
    let names: Vec<&str> = specs
        .iter()
        .map(|spec| spec["function"]["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["RawCurrentDate"]);

    // Calls to the bad server fail; local tools keep working.
    let err = registry
        .call("ghost.anything", &json!({}))
        .await
        .unwrap_err();
    assert!(
        err.to_string().contains("ghost"),
        "unexpected error: {err}"
    );
    let date = registry.call("RawCurrentDate", &json!({})).await.unwrap();
    assert_eq!(date, "2026-08-23");

    mcp_pool.shutdown_all().await;
}
