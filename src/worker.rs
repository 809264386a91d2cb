//! Bounded worker pool driving tasks from submission to a terminal state.
//!
//! Submissions land on one bounded queue; N workers share the receiving
//! end and drive one task each at a time. Control signals live on the
//! task handle: cancel is a latched token checked between sub-tasks and
//! inside every LLM turn, pause is a level signal honored at sub-task
//! boundaries. A paused task is parked with no owning worker and rejoins
//! the queue on resume with its step cursor intact.
//!
//! Every state transition is written through storage before its
//! notification is emitted.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::error::{AgentError, ErrorKind};
use crate::hub::NotificationHub;
use crate::llm::chat::ChatSession;
use crate::llm::sanitize::truncate_str;
use crate::planner::{Plan, Planner};
use crate::reports::{ReportGenerator, ReportKind, REPORT_KIND_KEY};
use crate::storage::{StorageRegistry, TaskStorage};
use crate::task::{SubTaskStatus, Task, TaskHandle, TaskStatus};
use crate::types::{Notification, NotificationKind};

/// Context key the planner's title is stored under.
pub const PLAN_TITLE_KEY: &str = "plan_title";

const EARLIER_RESULT_CLAMP: usize = 500;

pub struct WorkerPool {
    queue_tx: mpsc::Sender<Arc<TaskHandle>>,
    queue: Arc<Mutex<mpsc::Receiver<Arc<TaskHandle>>>>,
    storages: Arc<StorageRegistry>,
    hub: Arc<NotificationHub>,
    chat: Arc<ChatSession>,
    planner: Arc<Planner>,
    reports: Arc<ReportGenerator>,
    shutdown: CancellationToken,
    running_workers: AtomicUsize,
    /// Cancelled by the last worker to exit.
    stopped: CancellationToken,
}

impl WorkerPool {
    pub fn new(
        config: &PoolConfig,
        storages: Arc<StorageRegistry>,
        hub: Arc<NotificationHub>,
        chat: Arc<ChatSession>,
        planner: Arc<Planner>,
        reports: Arc<ReportGenerator>,
    ) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity.max(1));

        let pool = Arc::new(Self {
            queue_tx,
            queue: Arc::new(Mutex::new(queue_rx)),
            storages,
            hub,
            chat,
            planner,
            reports,
            shutdown: CancellationToken::new(),
            running_workers: AtomicUsize::new(config.workers),
            stopped: CancellationToken::new(),
        });

        if config.workers == 0 {
            pool.stopped.cancel();
        }
        for worker_id in 0..config.workers {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                pool.worker_loop(worker_id).await;
            });
        }

        pool
    }

    /// Validates and enqueues a task. Returns the task id. At capacity
    /// the task is persisted as failed with reason "queue full" and the
    /// `submitted`, `error` notification pair is emitted.
    pub async fn submit(&self, mut task: Task) -> anyhow::Result<String> {
        if !(1..=10).contains(&task.priority) {
            return Err(AgentError::input(format!(
                "priority must be between 1 and 10, got: {}",
                task.priority
            ))
            .into());
        }
        if self.shutdown.is_cancelled() {
            return Err(AgentError::conflict("worker pool is shutting down").into());
        }

        task.add_log("info", "submitted");
        let account = task.account.clone();
        let id = task.id.clone();
        let storage = self.storages.for_account(&account).await;
        let handle = storage.insert(task).await;
        self.hub
            .broadcast(&account, Notification::new(&id, NotificationKind::Submitted));

        match self.queue_tx.try_send(Arc::clone(&handle)) {
            Ok(()) => {
                debug!(task_id = %id, account = %account, "task queued");
                Ok(id)
            }
            Err(_) => {
                handle
                    .update(|t| {
                        t.error = Some("queue full".to_string());
                        t.add_log("error", "queue full");
                        finalize_incomplete_subtasks(t, "queue full");
                        t.apply_status(TaskStatus::Failed);
                    })
                    .await;
                storage.persist(&handle).await;
                self.hub.broadcast(
                    &account,
                    Notification::new(&id, NotificationKind::Error).with_message("queue full"),
                );
                warn!(task_id = %id, account = %account, "submission rejected, queue full");
                Err(AgentError::fatal("queue full").into())
            }
        }
    }

    /// Requests a pause. Applicable only while the task is running; the
    /// executing worker parks it at the next sub-task boundary.
    pub async fn pause_task(&self, account: &str, id: &str) -> bool {
        let storage = self.storages.for_account(account).await;
        let Some(handle) = storage.get(id).await else {
            return false;
        };
        if handle.snapshot().await.status != TaskStatus::Running {
            return false;
        }
        handle.request_pause();
        true
    }

    /// Re-queues a paused task. The step cursor is preserved, so execution
    /// continues at the next pending sub-task.
    pub async fn resume_task(&self, account: &str, id: &str) -> bool {
        let storage = self.storages.for_account(account).await;
        let Some(handle) = storage.get(id).await else {
            return false;
        };
        if handle.snapshot().await.status != TaskStatus::Paused {
            return false;
        }

        handle.clear_pause();
        handle
            .update(|t| {
                t.apply_status(TaskStatus::Pending);
                t.add_log("info", "resumed");
            })
            .await;
        storage.persist(&handle).await;
        self.hub
            .broadcast(account, Notification::new(id, NotificationKind::Resumed));

        match self.queue_tx.try_send(Arc::clone(&handle)) {
            Ok(()) => true,
            Err(_) => {
                handle
                    .update(|t| {
                        t.error = Some("queue full".to_string());
                        t.add_log("error", "queue full");
                        finalize_incomplete_subtasks(t, "queue full");
                        t.apply_status(TaskStatus::Failed);
                    })
                    .await;
                storage.persist(&handle).await;
                self.hub.broadcast(
                    account,
                    Notification::new(id, NotificationKind::Error).with_message("queue full"),
                );
                false
            }
        }
    }

    /// Cancels a non-terminal task. Queued and parked tasks are finalized
    /// here; running tasks are finalized by their worker at the next
    /// checkpoint, abandoning any in-flight LLM turn.
    pub async fn cancel_task(&self, account: &str, id: &str) -> bool {
        let storage = self.storages.for_account(account).await;
        let Some(handle) = storage.get(id).await else {
            return false;
        };
        let status = handle.snapshot().await.status;
        if status.is_terminal() {
            return false;
        }

        handle.trigger_cancel();
        if status == TaskStatus::Running {
            return true;
        }
        self.finish_cancel(&storage, &handle, account, id).await;
        true
    }

    pub async fn get_task(&self, account: &str, id: &str) -> Option<Task> {
        let storage = self.storages.for_account(account).await;
        let handle = storage.get(id).await?;
        Some(handle.snapshot().await)
    }

    pub async fn list_tasks(&self, account: &str) -> Vec<Task> {
        self.storages.for_account(account).await.list_by_account().await
    }

    /// Re-enqueues the account's pending tasks, highest priority first.
    /// Called once per account after the startup scan.
    pub async fn resubmit_pending(&self, account: &str) -> usize {
        let storage = self.storages.for_account(account).await;
        let mut queued = 0usize;
        for task in storage.list_pending().await {
            let Some(handle) = storage.get(&task.id).await else {
                continue;
            };
            if self.queue_tx.try_send(handle).is_err() {
                warn!(account, task_id = %task.id, "queue full during recovery");
                break;
            }
            queued += 1;
        }
        if queued > 0 {
            info!(account, queued, "recovered pending tasks");
        }
        queued
    }

    /// Stops accepting work and blocks until every worker has finished
    /// its current task and exited.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.stopped.cancelled().await;
        info!("worker pool stopped");
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        debug!(worker_id, "worker started");
        loop {
            let next = tokio::select! {
                _ = self.shutdown.cancelled() => None,
                handle = async {
                    let mut queue = self.queue.lock().await;
                    queue.recv().await
                } => handle,
            };
            let Some(handle) = next else { break };
            self.run_task(worker_id, handle).await;
        }
        debug!(worker_id, "worker stopped");
        if self.running_workers.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.stopped.cancel();
        }
    }

    async fn run_task(&self, worker_id: usize, handle: Arc<TaskHandle>) {
        let snapshot = handle.snapshot().await;
        if snapshot.status != TaskStatus::Pending {
            debug!(task_id = %snapshot.id, status = ?snapshot.status, "skipping stale queue entry");
            return;
        }
        let account = snapshot.account.clone();
        let id = snapshot.id.clone();
        let storage = self.storages.for_account(&account).await;

        let first_run = snapshot.started_at.is_none();
        handle
            .update(|t| {
                t.apply_status(TaskStatus::Running);
                t.add_log("info", if first_run { "started" } else { "resumed execution" });
            })
            .await;
        storage.persist(&handle).await;
        if first_run {
            self.hub
                .broadcast(&account, Notification::new(&id, NotificationKind::Started));
        }
        info!(worker_id, task_id = %id, account = %account, "task running");

        if let Some(kind) = snapshot
            .context
            .get(REPORT_KIND_KEY)
            .and_then(Value::as_str)
        {
            self.run_report_task(&storage, &handle, &account, &id, kind).await;
            return;
        }

        let mut current = handle.snapshot().await;
        if current.subtasks.is_empty() {
            match self.planner.plan(&account, &current.description).await {
                Ok(plan) => {
                    let Plan { title, subtasks } = plan;
                    handle
                        .update(move |t| {
                            t.add_log("info", &format!("planned {} steps", subtasks.len()));
                            t.subtasks = subtasks;
                            if !title.is_empty() {
                                t.context.insert(PLAN_TITLE_KEY.to_string(), json!(title));
                            }
                        })
                        .await;
                    storage.persist(&handle).await;
                }
                Err(err) => {
                    self.fail_task(&storage, &handle, &account, &id, &format!("planning failed: {err}"))
                        .await;
                    return;
                }
            }
            current = handle.snapshot().await;
        }

        let total = current.subtasks.len();
        let mut step = current.current_step;
        while step < total {
            if handle.is_cancelled() {
                self.finish_cancel(&storage, &handle, &account, &id).await;
                return;
            }
            if handle.pause_requested() {
                handle
                    .update(|t| {
                        t.apply_status(TaskStatus::Paused);
                        t.add_log("info", &format!("paused before step {}", step + 1));
                    })
                    .await;
                storage.persist(&handle).await;
                self.hub
                    .broadcast(&account, Notification::new(&id, NotificationKind::Paused));
                info!(task_id = %id, step, "task parked");
                return;
            }

            let sub_description = current.subtasks[step].description.clone();
            handle
                .update(|t| {
                    t.current_step = step;
                    if let Some(sub) = t.subtasks.get_mut(step) {
                        sub.status = SubTaskStatus::Running;
                    }
                    t.add_log("info", &format!("step {}/{}: {}", step + 1, total, sub_description));
                })
                .await;
            storage.persist(&handle).await;

            let query = subtask_query(&current, step);
            let cancel = handle.cancel_token();
            let progress = ((step + 1) as f64 / total as f64) * 100.0;
            match self.chat.run_sync(&account, &query, &cancel).await {
                Ok(outcome) => {
                    handle
                        .update(|t| {
                            if let Some(sub) = t.subtasks.get_mut(step) {
                                sub.status = SubTaskStatus::Done;
                                sub.result = Some(outcome.reply.clone());
                            }
                            t.context
                                .insert(format!("step_{}_result", step + 1), json!(outcome.reply));
                            t.current_step = step + 1;
                            if progress < 100.0 {
                                t.progress = progress;
                            }
                            t.add_log("info", &format!("step {}/{} done", step + 1, total));
                        })
                        .await;
                    storage.persist(&handle).await;
                    self.hub.broadcast(
                        &account,
                        Notification::new(&id, NotificationKind::Progress)
                            .with_progress(progress)
                            .with_message(sub_description),
                    );
                }
                Err(err) => {
                    if handle.is_cancelled() {
                        self.finish_cancel(&storage, &handle, &account, &id).await;
                        return;
                    }
                    let step_level = err
                        .downcast_ref::<AgentError>()
                        .map(|e| {
                            matches!(
                                e.kind,
                                ErrorKind::Input | ErrorKind::NotFound | ErrorKind::Conflict
                            )
                        })
                        .unwrap_or(false);
                    if !step_level {
                        handle
                            .update(|t| {
                                if let Some(sub) = t.subtasks.get_mut(step) {
                                    sub.status = SubTaskStatus::Failed;
                                    sub.error = Some(err.to_string());
                                }
                            })
                            .await;
                        self.fail_task(&storage, &handle, &account, &id, &err.to_string())
                            .await;
                        return;
                    }
                    handle
                        .update(|t| {
                            if let Some(sub) = t.subtasks.get_mut(step) {
                                sub.status = SubTaskStatus::Failed;
                                sub.error = Some(err.to_string());
                            }
                            t.current_step = step + 1;
                            if progress < 100.0 {
                                t.progress = progress;
                            }
                            t.add_log("error", &format!("step {}/{} failed: {}", step + 1, total, err));
                        })
                        .await;
                    storage.persist(&handle).await;
                    self.hub.broadcast(
                        &account,
                        Notification::new(&id, NotificationKind::Progress)
                            .with_progress(progress)
                            .with_message(format!("step failed: {err}")),
                    );
                }
            }
            current = handle.snapshot().await;
            step += 1;
        }

        let final_result = current.subtasks.iter().rev().find_map(|s| s.result.clone());
        handle
            .update(|t| {
                t.result = final_result;
                t.add_log("info", "task completed");
                t.apply_status(TaskStatus::Done);
            })
            .await;
        storage.persist(&handle).await;
        self.hub.broadcast(
            &account,
            Notification::new(&id, NotificationKind::Done).with_progress(100.0),
        );
        info!(task_id = %id, "task done");
    }

    async fn run_report_task(
        &self,
        storage: &TaskStorage,
        handle: &TaskHandle,
        account: &str,
        id: &str,
        kind: &str,
    ) {
        let Some(kind) = ReportKind::parse(kind) else {
            self.fail_task(storage, handle, account, id, &format!("unknown report kind: {kind}"))
                .await;
            return;
        };
        match self.reports.generate(account, kind).await {
            Ok(report) => {
                handle
                    .update(|t| {
                        t.result = Some(report);
                        t.add_log("info", "report generated");
                        t.apply_status(TaskStatus::Done);
                    })
                    .await;
                storage.persist(handle).await;
                self.hub.broadcast(
                    account,
                    Notification::new(id, NotificationKind::Done).with_progress(100.0),
                );
            }
            Err(err) => {
                self.fail_task(storage, handle, account, id, &format!("report failed: {err}"))
                    .await;
            }
        }
    }

    async fn fail_task(
        &self,
        storage: &TaskStorage,
        handle: &TaskHandle,
        account: &str,
        id: &str,
        reason: &str,
    ) {
        handle
            .update(|t| {
                finalize_incomplete_subtasks(t, reason);
                t.error = Some(reason.to_string());
                t.add_log("error", reason);
                t.apply_status(TaskStatus::Failed);
            })
            .await;
        storage.persist(handle).await;
        self.hub.broadcast(
            account,
            Notification::new(id, NotificationKind::Error).with_message(reason),
        );
        warn!(task_id = %id, error = %reason, "task failed");
    }

    async fn finish_cancel(
        &self,
        storage: &TaskStorage,
        handle: &TaskHandle,
        account: &str,
        id: &str,
    ) {
        if handle.snapshot().await.status == TaskStatus::Canceled {
            return;
        }
        handle
            .update(|t| {
                finalize_incomplete_subtasks(t, "canceled");
                t.add_log("warn", "canceled");
                t.apply_status(TaskStatus::Canceled);
            })
            .await;
        storage.persist(handle).await;
        self.hub
            .broadcast(account, Notification::new(id, NotificationKind::Canceled));
        info!(task_id = %id, "task canceled");
    }
}

/// Terminal tasks must not leave sub-tasks in pending or running state.
fn finalize_incomplete_subtasks(task: &mut Task, reason: &str) {
    for sub in task.subtasks.iter_mut() {
        if !sub.status.is_terminal() {
            sub.status = SubTaskStatus::Failed;
            if sub.error.is_none() {
                sub.error = Some(reason.to_string());
            }
        }
    }
}

/// Builds the per-sub-task prompt: plan title, the step to execute, and
/// clamped results from the steps already done.
fn subtask_query(task: &Task, step: usize) -> String {
    let total = task.subtasks.len();
    let mut query = String::new();
    if let Some(title) = task.context.get(PLAN_TITLE_KEY).and_then(Value::as_str) {
        if !title.is_empty() {
            query.push_str(&format!("Task: {}\n", title));
        }
    }
    query.push_str(&format!(
        "Step {} of {}: {}\n",
        step + 1,
        total,
        task.subtasks[step].description
    ));

    let earlier: Vec<String> = task.subtasks[..step]
        .iter()
        .filter_map(|s| {
            s.result
                .as_ref()
                .map(|r| format!("- {}: {}", s.description, truncate_str(r, EARLIER_RESULT_CLAMP)))
        })
        .collect();
    if !earlier.is_empty() {
        query.push_str("\nResults from earlier steps:\n");
        query.push_str(&earlier.join("\n"));
    }
    query
}
