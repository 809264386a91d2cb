//! Reminder, notification and report tools. These wrap the scheduler,
//! the notification hub and the report generator so the model can manage
//! recurring reminders and trigger a report on demand.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::AgentError;
use crate::hub::NotificationHub;
use crate::registry::ToolRegistry;
use crate::reports::{ReportGenerator, ReportKind};
use crate::scheduler::{Reminder, Scheduler};
use crate::tools::{envelope_input_errors, get_int_arg, get_optional_int_arg, get_string_arg, LOCAL_SERVER};
use crate::traits::Tool;
use crate::types::{Notification, NotificationKind};

/// Registers the reminder and report tool family on `registry`.
pub async fn register_all(
    registry: &ToolRegistry,
    scheduler: &Arc<Scheduler>,
    hub: &Arc<NotificationHub>,
    reports: &Arc<ReportGenerator>,
) {
    let tools: Vec<Arc<dyn Tool>> = vec![
        Arc::new(AddReminderTool::new(Arc::clone(scheduler))),
        Arc::new(ListRemindersTool::new(Arc::clone(scheduler))),
        Arc::new(RemoveReminderTool::new(Arc::clone(scheduler))),
        Arc::new(PauseReminderTool::new(Arc::clone(scheduler))),
        Arc::new(ResumeReminderTool::new(Arc::clone(scheduler))),
        Arc::new(SendNotificationTool::new(Arc::clone(hub))),
        Arc::new(GenerateReportTool::new(Arc::clone(reports))),
    ];
    for tool in tools {
        registry.register(LOCAL_SERVER, tool).await;
    }
}

fn account_property(description: &str) -> Value {
    json!({ "type": "string", "description": description })
}

/// Resolves a reminder id against the scheduler, rejecting ids that
/// belong to another account. Tools never cross account boundaries.
async fn owned_reminder(
    scheduler: &Scheduler,
    account: &str,
    id: &str,
) -> anyhow::Result<Reminder> {
    scheduler.ensure_loaded(account).await;
    match scheduler.get_reminder(id).await {
        Some(reminder) if reminder.account == account => Ok(reminder),
        _ => Err(AgentError::not_found(format!("reminder not found: {id}")).into()),
    }
}

fn reminder_line(reminder: &Reminder) -> String {
    let state = if reminder.enabled { "active" } else { "paused" };
    let repeat = match reminder.repeat_count {
        -1 => "repeats forever".to_string(),
        0 => "completed".to_string(),
        n => format!("{n} runs left"),
    };
    format!(
        "- [{}] {} ({state}, every {}s, {repeat}): {}",
        reminder.id, reminder.title, reminder.interval_seconds, reminder.message
    )
}

pub struct AddReminderTool {
    scheduler: Arc<Scheduler>,
}

impl AddReminderTool {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self { scheduler }
    }

    async fn run(&self, args: &Value) -> anyhow::Result<String> {
        let account = get_string_arg(args, "account")?;
        let title = get_string_arg(args, "title")?;
        let message = get_string_arg(args, "message")?;
        let interval = get_int_arg(args, "interval")?;
        let repeat = get_optional_int_arg(args, "repeat", -1);

        self.scheduler.ensure_loaded(&account).await;
        let reminder = self
            .scheduler
            .add_reminder(&account, &title, &message, interval, repeat, None)
            .await?;
        Ok(format!(
            "Reminder '{}' created with id {}, first fire at {}",
            reminder.title,
            reminder.id,
            reminder.next_run_at.format("%Y-%m-%d %H:%M:%S UTC")
        ))
    }
}

#[async_trait]
impl Tool for AddReminderTool {
    fn name(&self) -> &str {
        "RawAddReminder"
    }

    fn description(&self) -> &str {
        "Create a recurring reminder that notifies the account on an interval"
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "account": account_property("Account the reminder belongs to"),
                "title": { "type": "string", "description": "Short reminder title" },
                "message": { "type": "string", "description": "Text delivered when the reminder fires" },
                "interval": { "type": "integer", "description": "Seconds between fires, at least 1" },
                "repeat": { "type": "integer", "description": "Number of fires; -1 repeats forever (default)" },
            },
            "required": ["account", "title", "message", "interval"]
        })
    }

    async fn call(&self, args: &Value) -> anyhow::Result<String> {
        envelope_input_errors(self.run(args).await)
    }
}

pub struct ListRemindersTool {
    scheduler: Arc<Scheduler>,
}

impl ListRemindersTool {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self { scheduler }
    }

    async fn run(&self, args: &Value) -> anyhow::Result<String> {
        let account = get_string_arg(args, "account")?;
        self.scheduler.ensure_loaded(&account).await;
        let reminders = self.scheduler.list_reminders(&account).await;
        if reminders.is_empty() {
            return Ok("no reminders set".to_string());
        }
        Ok(reminders
            .iter()
            .map(reminder_line)
            .collect::<Vec<_>>()
            .join("\n"))
    }
}

#[async_trait]
impl Tool for ListRemindersTool {
    fn name(&self) -> &str {
        "RawAllReminders"
    }

    fn description(&self) -> &str {
        "List the account's reminders with their ids, intervals and state"
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "account": account_property("Account whose reminders are listed"),
            },
            "required": ["account"]
        })
    }

    async fn call(&self, args: &Value) -> anyhow::Result<String> {
        envelope_input_errors(self.run(args).await)
    }
}

pub struct RemoveReminderTool {
    scheduler: Arc<Scheduler>,
}

impl RemoveReminderTool {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self { scheduler }
    }

    async fn run(&self, args: &Value) -> anyhow::Result<String> {
        let account = get_string_arg(args, "account")?;
        let id = get_string_arg(args, "id")?;
        let reminder = owned_reminder(&self.scheduler, &account, &id).await?;
        self.scheduler.remove_reminder(&id).await;
        Ok(format!("Reminder '{}' removed", reminder.title))
    }
}

#[async_trait]
impl Tool for RemoveReminderTool {
    fn name(&self) -> &str {
        "RawRemoveReminder"
    }

    fn description(&self) -> &str {
        "Delete a reminder by id"
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "account": account_property("Account the reminder belongs to"),
                "id": { "type": "string", "description": "Reminder id, as shown by RawAllReminders" },
            },
            "required": ["account", "id"]
        })
    }

    async fn call(&self, args: &Value) -> anyhow::Result<String> {
        envelope_input_errors(self.run(args).await)
    }
}

pub struct PauseReminderTool {
    scheduler: Arc<Scheduler>,
}

impl PauseReminderTool {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self { scheduler }
    }

    async fn run(&self, args: &Value) -> anyhow::Result<String> {
        let account = get_string_arg(args, "account")?;
        let id = get_string_arg(args, "id")?;
        let reminder = owned_reminder(&self.scheduler, &account, &id).await?;
        self.scheduler.pause_reminder(&id).await;
        Ok(format!("Reminder '{}' paused", reminder.title))
    }
}

#[async_trait]
impl Tool for PauseReminderTool {
    fn name(&self) -> &str {
        "RawPauseReminder"
    }

    fn description(&self) -> &str {
        "Pause a reminder so it stops firing until resumed"
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "account": account_property("Account the reminder belongs to"),
                "id": { "type": "string", "description": "Reminder id" },
            },
            "required": ["account", "id"]
        })
    }

    async fn call(&self, args: &Value) -> anyhow::Result<String> {
        envelope_input_errors(self.run(args).await)
    }
}

pub struct ResumeReminderTool {
    scheduler: Arc<Scheduler>,
}

impl ResumeReminderTool {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self { scheduler }
    }

    async fn run(&self, args: &Value) -> anyhow::Result<String> {
        let account = get_string_arg(args, "account")?;
        let id = get_string_arg(args, "id")?;
        let reminder = owned_reminder(&self.scheduler, &account, &id).await?;
        self.scheduler.resume_reminder(&id).await;
        Ok(format!(
            "Reminder '{}' resumed, next fire one interval out",
            reminder.title
        ))
    }
}

#[async_trait]
impl Tool for ResumeReminderTool {
    fn name(&self) -> &str {
        "RawResumeReminder"
    }

    fn description(&self) -> &str {
        "Resume a paused reminder; the next fire is one full interval away"
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "account": account_property("Account the reminder belongs to"),
                "id": { "type": "string", "description": "Reminder id" },
            },
            "required": ["account", "id"]
        })
    }

    async fn call(&self, args: &Value) -> anyhow::Result<String> {
        envelope_input_errors(self.run(args).await)
    }
}

pub struct SendNotificationTool {
    hub: Arc<NotificationHub>,
}

impl SendNotificationTool {
    pub fn new(hub: Arc<NotificationHub>) -> Self {
        Self { hub }
    }

    async fn run(&self, args: &Value) -> anyhow::Result<String> {
        let account = get_string_arg(args, "account")?;
        let message = get_string_arg(args, "message")?;
        if message.trim().is_empty() {
            return Err(AgentError::input("message cannot be empty").into());
        }
        self.hub
            .broadcast_to_account(
                &account,
                Notification::new("", NotificationKind::Reminder).with_message(message),
            )
            .await;
        Ok("notification sent".to_string())
    }
}

#[async_trait]
impl Tool for SendNotificationTool {
    fn name(&self) -> &str {
        "RawSendNotification"
    }

    fn description(&self) -> &str {
        "Push an immediate notification to the account's connected clients"
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "account": account_property("Account whose clients are notified"),
                "message": { "type": "string", "description": "Notification text" },
            },
            "required": ["account", "message"]
        })
    }

    async fn call(&self, args: &Value) -> anyhow::Result<String> {
        envelope_input_errors(self.run(args).await)
    }
}

pub struct GenerateReportTool {
    reports: Arc<ReportGenerator>,
}

impl GenerateReportTool {
    pub fn new(reports: Arc<ReportGenerator>) -> Self {
        Self { reports }
    }

    async fn run(&self, args: &Value) -> anyhow::Result<String> {
        let account = get_string_arg(args, "account")?;
        let kind = get_string_arg(args, "kind")?;
        let kind = ReportKind::parse(&kind).ok_or_else(|| {
            AgentError::input(format!("kind must be 'daily' or 'weekly', got: {kind}"))
        })?;
        self.reports.generate(&account, kind).await
    }
}

#[async_trait]
impl Tool for GenerateReportTool {
    fn name(&self) -> &str {
        "RawGenerateReport"
    }

    fn description(&self) -> &str {
        "Generate the daily or weekly activity report right now"
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "account": account_property("Account the report covers"),
                "kind": { "type": "string", "description": "Report kind: 'daily' or 'weekly'" },
            },
            "required": ["account", "kind"]
        })
    }

    async fn call(&self, args: &Value) -> anyhow::Result<String> {
        envelope_input_errors(self.run(args).await)
    }
}
