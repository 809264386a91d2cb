//! Tick-driven scheduler for recurring reminders and standing reports.
//!
//! One background task wakes every tick, collects the reminders whose
//! `next_run_at` has passed and fires them: a `reminder` notification
//! goes out, report entries submit a report task into the pool, linked
//! tasks are re-submitted as fresh copies. The reminder table is
//! persisted whole per account after every mutation, so a restart
//! resumes the same schedule.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Local, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::RwLock;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SchedulerConfig;
use crate::error::AgentError;
use crate::hub::NotificationHub;
use crate::reports::{
    next_daily_run, next_weekly_run, ReportKind, DAILY_INTERVAL_SECS, REPORT_KIND_KEY,
    WEEKLY_INTERVAL_SECS,
};
use crate::store::{AuthType, Document, DocumentStore};
use crate::task::{short_id, Task};
use crate::types::{Notification, NotificationKind};
use crate::worker::WorkerPool;

/// Store title prefix for the per-account reminder table.
pub const SCHEDULED_TASKS_PREFIX: &str = "scheduled_tasks_";

/// Priority of tasks the scheduler submits on a fire.
const SCHEDULED_TASK_PRIORITY: u8 = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reminder {
    pub id: String,
    pub account: String,
    pub title: String,
    pub message: String,
    pub interval_seconds: i64,
    /// -1 repeats forever, 0 is spent, k > 0 is the remaining count.
    pub repeat_count: i64,
    pub run_count: u64,
    pub next_run_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
    pub enabled: bool,
    /// Task to re-submit when this reminder fires.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linked_task_id: Option<String>,
    /// Set on the standing report entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_kind: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Reminder {
    pub fn new(
        account: &str,
        title: &str,
        message: &str,
        interval_seconds: i64,
        repeat_count: i64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: short_id(),
            account: account.to_string(),
            title: title.to_string(),
            message: message.to_string(),
            interval_seconds,
            repeat_count,
            run_count: 0,
            next_run_at: now + Duration::seconds(interval_seconds),
            last_run_at: None,
            enabled: true,
            linked_task_id: None,
            report_kind: None,
            created_at: now,
        }
    }
}

pub struct Scheduler {
    store: Arc<dyn DocumentStore>,
    hub: Arc<NotificationHub>,
    pool: Arc<WorkerPool>,
    reminders: RwLock<HashMap<String, Reminder>>,
    /// Accounts whose persisted table has been read this process.
    loaded: RwLock<HashSet<String>>,
    tick_secs: u64,
    shutdown: CancellationToken,
    /// Cancelled by the tick task when it exits.
    stopped: CancellationToken,
}

impl Scheduler {
    pub fn new(
        config: &SchedulerConfig,
        store: Arc<dyn DocumentStore>,
        hub: Arc<NotificationHub>,
        pool: Arc<WorkerPool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            hub,
            pool,
            reminders: RwLock::new(HashMap::new()),
            loaded: RwLock::new(HashSet::new()),
            tick_secs: config.tick_secs.max(1),
            shutdown: CancellationToken::new(),
            stopped: CancellationToken::new(),
        })
    }

    /// Spawns the tick loop.
    pub fn start(self: &Arc<Self>) {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            scheduler.run_ticks().await;
            scheduler.stopped.cancel();
        });
        info!(tick_secs = self.tick_secs, "scheduler started");
    }

    /// Stops the tick loop and waits for it to exit. A fire already in
    /// progress completes first.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.stopped.cancelled().await;
        info!("scheduler stopped");
    }

    pub async fn add_reminder(
        &self,
        account: &str,
        title: &str,
        message: &str,
        interval_seconds: i64,
        repeat_count: i64,
        linked_task_id: Option<String>,
    ) -> anyhow::Result<Reminder> {
        if interval_seconds < 1 {
            return Err(AgentError::input(format!(
                "interval must be at least 1 second, got: {interval_seconds}"
            ))
            .into());
        }
        if repeat_count < -1 {
            return Err(AgentError::input(format!(
                "repeat must be -1 (unbounded) or a non-negative count, got: {repeat_count}"
            ))
            .into());
        }

        let mut reminder = Reminder::new(account, title, message, interval_seconds, repeat_count);
        reminder.linked_task_id = linked_task_id;
        self.reminders
            .write()
            .await
            .insert(reminder.id.clone(), reminder.clone());
        self.save_reminders(account).await;
        info!(
            reminder_id = %reminder.id,
            account,
            interval_seconds,
            repeat_count,
            "reminder added"
        );
        Ok(reminder)
    }

    pub async fn remove_reminder(&self, id: &str) -> bool {
        let removed = self.reminders.write().await.remove(id);
        match removed {
            Some(reminder) => {
                self.save_reminders(&reminder.account).await;
                info!(reminder_id = %id, "reminder removed");
                true
            }
            None => false,
        }
    }

    pub async fn pause_reminder(&self, id: &str) -> bool {
        let account = {
            let mut table = self.reminders.write().await;
            match table.get_mut(id) {
                Some(reminder) => {
                    reminder.enabled = false;
                    reminder.account.clone()
                }
                None => return false,
            }
        };
        self.save_reminders(&account).await;
        true
    }

    /// Re-enables a reminder; the next fire is one full interval out.
    pub async fn resume_reminder(&self, id: &str) -> bool {
        let account = {
            let mut table = self.reminders.write().await;
            match table.get_mut(id) {
                Some(reminder) => {
                    reminder.enabled = true;
                    reminder.next_run_at =
                        Utc::now() + Duration::seconds(reminder.interval_seconds);
                    reminder.account.clone()
                }
                None => return false,
            }
        };
        self.save_reminders(&account).await;
        true
    }

    pub async fn list_reminders(&self, account: &str) -> Vec<Reminder> {
        let table = self.reminders.read().await;
        let mut list: Vec<Reminder> = table
            .values()
            .filter(|r| r.account == account)
            .cloned()
            .collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    pub async fn get_reminder(&self, id: &str) -> Option<Reminder> {
        self.reminders.read().await.get(id).cloned()
    }

    /// Reads the account's persisted reminder table once per process.
    pub async fn ensure_loaded(&self, account: &str) {
        if !self.loaded.write().await.insert(account.to_string()) {
            return;
        }
        let title = format!("{SCHEDULED_TASKS_PREFIX}{account}");
        let Some(doc) = self.store.get_document(account, &title).await else {
            return;
        };
        match serde_json::from_str::<Vec<Reminder>>(&doc.content) {
            Ok(list) => {
                let count = list.len();
                let mut table = self.reminders.write().await;
                for reminder in list {
                    table.entry(reminder.id.clone()).or_insert(reminder);
                }
                info!(account, count, "loaded persisted reminders");
            }
            Err(err) => {
                warn!(account, error = %err, "failed to parse saved reminders");
            }
        }
    }

    /// Creates the standing daily and weekly report entries unless the
    /// account already has them.
    pub async fn register_report_entries(&self, account: &str) {
        self.ensure_loaded(account).await;
        let (has_daily, has_weekly) = {
            let table = self.reminders.read().await;
            let has = |kind: &str| {
                table
                    .values()
                    .any(|r| r.account == account && r.report_kind.as_deref() == Some(kind))
            };
            (has("daily"), has("weekly"))
        };

        let now = Local::now();
        if !has_daily {
            let mut reminder = Reminder::new(
                account,
                "daily report",
                "scheduled daily report",
                DAILY_INTERVAL_SECS,
                -1,
            );
            reminder.next_run_at = next_daily_run(now);
            reminder.report_kind = Some(ReportKind::Daily.as_str().to_string());
            info!(reminder_id = %reminder.id, account, next_run_at = %reminder.next_run_at, "daily report scheduled");
            self.reminders
                .write()
                .await
                .insert(reminder.id.clone(), reminder);
        }
        if !has_weekly {
            let mut reminder = Reminder::new(
                account,
                "weekly report",
                "scheduled weekly report",
                WEEKLY_INTERVAL_SECS,
                -1,
            );
            reminder.next_run_at = next_weekly_run(now);
            reminder.report_kind = Some(ReportKind::Weekly.as_str().to_string());
            info!(reminder_id = %reminder.id, account, next_run_at = %reminder.next_run_at, "weekly report scheduled");
            self.reminders
                .write()
                .await
                .insert(reminder.id.clone(), reminder);
        }
        if !has_daily || !has_weekly {
            self.save_reminders(account).await;
        }
    }

    /// Pushes the account's enabled reminders as a `reminder_sync`
    /// notification. Called when a client connects.
    pub async fn sync_reminders(&self, account: &str) {
        self.ensure_loaded(account).await;
        let enabled: Vec<Reminder> = self
            .list_reminders(account)
            .await
            .into_iter()
            .filter(|r| r.enabled)
            .collect();
        if enabled.is_empty() {
            return;
        }
        let count = enabled.len();
        let notification =
            Notification::new("", NotificationKind::ReminderSync).with_data(json!(enabled));
        self.hub.broadcast_to_account(account, notification).await;
        debug!(account, count, "reminder sync pushed");
    }

    async fn run_ticks(&self) {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(self.tick_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => self.tick_once(Utc::now()).await,
            }
        }
    }

    /// One pass over the table. Due reminders fire in id order.
    pub(crate) async fn tick_once(&self, now: DateTime<Utc>) {
        let due: Vec<Reminder> = {
            let table = self.reminders.read().await;
            let mut due: Vec<Reminder> = table
                .values()
                .filter(|r| r.enabled && r.repeat_count != 0 && now > r.next_run_at)
                .cloned()
                .collect();
            due.sort_by(|a, b| a.id.cmp(&b.id));
            due
        };
        for reminder in due {
            self.fire(reminder, now).await;
        }
    }

    async fn fire(&self, reminder: Reminder, now: DateTime<Utc>) {
        info!(reminder_id = %reminder.id, title = %reminder.title, "reminder fired");

        let notification = Notification::new(&reminder.id, NotificationKind::Reminder)
            .with_progress(100.0)
            .with_message(format!("[{}] {}", reminder.title, reminder.message))
            .with_data(json!({
                "title": reminder.title,
                "message": reminder.message,
                "run_count": reminder.run_count + 1,
            }));
        self.hub
            .broadcast_to_account(&reminder.account, notification)
            .await;

        if let Some(kind) = reminder.report_kind.as_deref() {
            self.submit_report_task(&reminder, kind).await;
        }
        if let Some(linked) = reminder.linked_task_id.as_deref() {
            self.resubmit_linked_task(&reminder, linked).await;
        }

        let account = reminder.account.clone();
        {
            let mut table = self.reminders.write().await;
            if let Some(r) = table.get_mut(&reminder.id) {
                r.last_run_at = Some(now);
                r.run_count += 1;
                if r.repeat_count == -1 {
                    r.next_run_at = now + Duration::seconds(r.interval_seconds);
                } else if r.repeat_count > 0 {
                    r.repeat_count -= 1;
                    r.next_run_at = now + Duration::seconds(r.interval_seconds);
                    if r.repeat_count == 0 {
                        r.enabled = false;
                        info!(reminder_id = %r.id, "reminder completed");
                    }
                } else {
                    r.enabled = false;
                }
            }
        }
        self.save_reminders(&account).await;
    }

    async fn submit_report_task(&self, reminder: &Reminder, kind: &str) {
        let mut task = Task::new(
            &reminder.account,
            &format!("{kind} report"),
            &format!("generate the scheduled {kind} report"),
            SCHEDULED_TASK_PRIORITY,
        );
        task.context.insert(REPORT_KIND_KEY.to_string(), json!(kind));
        task.linked_reminder_id = Some(reminder.id.clone());
        if let Err(err) = self.pool.submit(task).await {
            warn!(reminder_id = %reminder.id, error = %err, "report task submission failed");
        }
    }

    /// Fires a fresh copy of the linked task; the original record keeps
    /// its history.
    async fn resubmit_linked_task(&self, reminder: &Reminder, linked: &str) {
        let Some(stored) = self.pool.get_task(&reminder.account, linked).await else {
            warn!(reminder_id = %reminder.id, task_id = %linked, "linked task not found");
            return;
        };
        let mut task = Task::new(
            &stored.account,
            &stored.title,
            &stored.description,
            stored.priority,
        );
        task.linked_reminder_id = Some(reminder.id.clone());
        task.context
            .insert("resubmitted_from".to_string(), json!(stored.id));
        match self.pool.submit(task).await {
            Ok(id) => {
                info!(reminder_id = %reminder.id, original = %stored.id, resubmitted = %id, "linked task re-submitted");
            }
            Err(err) => {
                warn!(reminder_id = %reminder.id, error = %err, "linked task re-submission failed");
            }
        }
    }

    /// Writes the account's whole reminder table through to the store.
    async fn save_reminders(&self, account: &str) {
        let list = self.list_reminders(account).await;
        let content = match serde_json::to_string_pretty(&list) {
            Ok(content) => content,
            Err(err) => {
                warn!(account, error = %err, "failed to serialize reminders");
                return;
            }
        };
        let title = format!("{SCHEDULED_TASKS_PREFIX}{account}");
        let doc = Document::new(&title, &content, "reminders,auto", AuthType::Private);
        if let Err(err) = self.store.save_document(account, doc).await {
            warn!(account, error = %err, "failed to persist reminders");
        }
    }
}
