//! Worker pool control surface: cancel during execution and
//! pause/resume across sub-task boundaries.

use super::*;

use crate::task::{SubTask, SubTaskStatus, Task, TaskStatus};
use crate::testing::text_response;
use crate::types::NotificationKind;

fn preset_task(steps: usize) -> Task {
    let mut task = Task::new(ACCOUNT, "slow batch", "run the slow steps", 5);
    task.subtasks = (0..steps)
        .map(|i| SubTask::new(&format!("step {}", i + 1), Vec::new()))
        .collect();
    task
}

#[tokio::test]
async fn cancel_during_execution_stops_the_remaining_steps() {
    let provider = Arc::new(SlowProvider {
        inner: MockProvider::always(text_response("step done")),
        delay: Duration::from_millis(500),
    });
    let s = stack_with(provider, 1).await;

    let id = s.pool.submit(preset_task(3)).await.unwrap();
    s.sink
        .wait_for(|n| n.kind == NotificationKind::Started, Duration::from_secs(2))
        .await
        .expect("task should start");

    // Cancel while the first step's LLM turn is still in flight.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(s.pool.cancel_task(ACCOUNT, &id).await);
    s.sink
        .wait_for(|n| n.kind == NotificationKind::Canceled, Duration::from_secs(3))
        .await
        .expect("cancel should finalize the task");

    let task = s.pool.get_task(ACCOUNT, &id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Canceled);
    let finished = task
        .subtasks
        .iter()
        .filter(|sub| sub.status == SubTaskStatus::Done)
        .count();
    assert!(finished <= 1, "{finished} steps finished after cancel");
    assert_eq!(s.sink.count_of(NotificationKind::Done).await, 0);

    let kinds = s.sink.kinds().await;
    assert_eq!(kinds.first(), Some(&NotificationKind::Submitted));
    assert_eq!(kinds.last(), Some(&NotificationKind::Canceled));

    // Cancel is latched; a second request finds a terminal task.
    assert!(!s.pool.cancel_task(ACCOUNT, &id).await);
}

#[tokio::test]
async fn pause_parks_at_a_step_boundary_and_resume_finishes() {
    let provider = Arc::new(SlowProvider {
        inner: MockProvider::always(text_response("ok")),
        delay: Duration::from_millis(150),
    });
    let s = stack_with(provider, 1).await;

    let id = s.pool.submit(preset_task(5)).await.unwrap();
    s.sink
        .wait_for(
            |n| n.kind == NotificationKind::Progress && n.progress.unwrap_or(0.0) >= 40.0,
            Duration::from_secs(5),
        )
        .await
        .expect("two steps should land");
    assert!(s.pool.pause_task(ACCOUNT, &id).await);
    s.sink
        .wait_for(|n| n.kind == NotificationKind::Paused, Duration::from_secs(2))
        .await
        .expect("task should park");

    let parked = s.pool.get_task(ACCOUNT, &id).await.unwrap();
    assert_eq!(parked.status, TaskStatus::Paused);
    assert!(
        (2..5).contains(&parked.current_step),
        "parked at step {}",
        parked.current_step
    );

    assert!(s.pool.resume_task(ACCOUNT, &id).await);
    s.sink
        .wait_for(|n| n.kind == NotificationKind::Done, Duration::from_secs(10))
        .await
        .expect("task should finish after resume");

    let task = s.pool.get_task(ACCOUNT, &id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Done);
    assert_eq!(task.current_step, 5);
    assert!(task
        .subtasks
        .iter()
        .all(|sub| sub.status == SubTaskStatus::Done));

    // Started once; the resume re-entry is not a second start.
    assert_eq!(s.sink.count_of(NotificationKind::Started).await, 1);
    assert_eq!(s.sink.count_of(NotificationKind::Resumed).await, 1);
}

#[tokio::test]
async fn pause_applies_only_to_running_tasks() {
    let provider = Arc::new(MockProvider::always(text_response("ok")));
    let s = stack_with(provider, 0).await;

    // No workers, so the task stays pending on the queue.
    let id = s.pool.submit(preset_task(2)).await.unwrap();
    assert!(!s.pool.pause_task(ACCOUNT, &id).await);
    assert!(!s.pool.resume_task(ACCOUNT, &id).await);
    assert_eq!(
        s.pool.get_task(ACCOUNT, &id).await.unwrap().status,
        TaskStatus::Pending
    );
}
