//! Daily and weekly activity reports.
//!
//! A report run aggregates the account's documents through the
//! read-only registry tools plus its task table, asks the model for a
//! markdown write-up in one sync call, saves the result as a document
//! and announces it with a `report_generated` notification. Runs are
//! triggered either by the scheduler's standing entries or manually
//! through the report tool.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, Local, LocalResult, NaiveDate, TimeZone, Timelike, Utc};
use serde_json::json;
use tracing::{info, warn};

use crate::error::AgentError;
use crate::hub::NotificationHub;
use crate::registry::ToolRegistry;
use crate::storage::StorageRegistry;
use crate::store::{AuthType, Document, DocumentStore};
use crate::traits::ModelProvider;
use crate::types::{Notification, NotificationKind};

/// Task context key marking a queued task as a report run.
pub const REPORT_KIND_KEY: &str = "report_kind";

pub const DAILY_REPORT_HOUR: u32 = 21;
pub const WEEKLY_REPORT_HOUR: u32 = 20;
pub const DAILY_INTERVAL_SECS: i64 = 86_400;
pub const WEEKLY_INTERVAL_SECS: i64 = 604_800;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportKind {
    Daily,
    Weekly,
}

impl ReportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportKind::Daily => "daily",
            ReportKind::Weekly => "weekly",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "daily" => Some(ReportKind::Daily),
            "weekly" => Some(ReportKind::Weekly),
            _ => None,
        }
    }
}

pub struct ReportGenerator {
    provider: Arc<dyn ModelProvider>,
    registry: Arc<ToolRegistry>,
    store: Arc<dyn DocumentStore>,
    storages: Arc<StorageRegistry>,
    hub: Arc<NotificationHub>,
    model: String,
}

impl ReportGenerator {
    pub fn new(
        provider: Arc<dyn ModelProvider>,
        registry: Arc<ToolRegistry>,
        store: Arc<dyn DocumentStore>,
        storages: Arc<StorageRegistry>,
        hub: Arc<NotificationHub>,
        model: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            provider,
            registry,
            store,
            storages,
            hub,
            model: model.into(),
        })
    }

    /// Runs one report end to end and returns the generated markdown.
    pub async fn generate(&self, account: &str, kind: ReportKind) -> anyhow::Result<String> {
        let now = Local::now();
        let (title, span_line, sections) = match kind {
            ReportKind::Daily => (
                format!("agent_report_daily_{}", now.format("%Y-%m-%d")),
                format!("Date: {}", now.format("%Y-%m-%d")),
                "today's summary, completed work, task progress, suggestions for tomorrow",
            ),
            ReportKind::Weekly => {
                let start = (now - Duration::days(6)).format("%Y-%m-%d").to_string();
                let end = now.format("%Y-%m-%d").to_string();
                (
                    format!("agent_report_weekly_{start}_{end}"),
                    format!("Period: {start} to {end}"),
                    "week summary, completion analysis, task progress, plans for next week",
                )
            }
        };
        info!(account, kind = kind.as_str(), %title, "generating report");

        let material = self.collect_material(account).await;
        let prompt = format!(
            "You are a reporting assistant. Write a concise {} report from the data below.\n\n\
             {}\n\n## Data\n\n{}\n\n## Requirements\n\
             1. Markdown output\n\
             2. Sections: {}\n\
             3. If a section has no data, say so briefly\n\
             4. End with one or two concrete improvement suggestions",
            kind.as_str(),
            span_line,
            material,
            sections,
        );
        let messages = vec![json!({ "role": "user", "content": prompt })];
        let response = self.provider.chat(&self.model, &messages, &[], None).await?;
        let content = response.content.unwrap_or_default();
        if content.trim().is_empty() {
            return Err(AgentError::transient("model returned an empty report").into());
        }

        let doc = Document::new(&title, &content, "report,auto", AuthType::Public);
        self.store.save_document(account, doc).await?;
        info!(account, %title, "report saved");

        self.hub.broadcast(
            account,
            Notification::new("", NotificationKind::ReportGenerated)
                .with_message(format!("{} report generated: {}", kind.as_str(), title))
                .with_data(json!({
                    "type": kind.as_str(),
                    "title": title,
                    "link": format!("/get?blogname={title}"),
                })),
        );

        Ok(content)
    }

    async fn collect_material(&self, account: &str) -> String {
        let args = json!({ "account": account });
        let mut parts = Vec::new();

        match self.registry.call("RawAllBlogCount", &args).await {
            Ok(count) => parts.push(format!("Document count: {count}")),
            Err(err) => warn!(account, error = %err, "report aggregation: document count unavailable"),
        }
        match self.registry.call("RawAllBlogName", &args).await {
            Ok(names) => parts.push(format!("Document titles:\n{names}")),
            Err(err) => warn!(account, error = %err, "report aggregation: document titles unavailable"),
        }
        parts.push(format!("Task progress:\n{}", self.task_summary(account).await));

        if parts.is_empty() {
            "no data collected".to_string()
        } else {
            parts.join("\n\n")
        }
    }

    /// Status counts plus the most recent task headlines.
    async fn task_summary(&self, account: &str) -> String {
        let tasks = self.storages.for_account(account).await.list_by_account().await;
        if tasks.is_empty() {
            return "no tasks recorded".to_string();
        }

        let mut by_status: BTreeMap<&'static str, usize> = BTreeMap::new();
        for task in &tasks {
            *by_status.entry(task.status.as_str()).or_insert(0) += 1;
        }
        let counts = by_status
            .iter()
            .map(|(status, count)| format!("{status}: {count}"))
            .collect::<Vec<_>>()
            .join(", ");

        let recent = tasks
            .iter()
            .take(5)
            .map(|t| format!("- {} ({}, {:.0}%)", t.title, t.status.as_str(), t.progress))
            .collect::<Vec<_>>()
            .join("\n");

        format!("{counts}\n{recent}")
    }
}

/// The next 21:00 local time, rolling to tomorrow when today's slot has
/// passed.
pub fn next_daily_run(now: DateTime<Local>) -> DateTime<Utc> {
    let today = at_local_time(now.date_naive(), DAILY_REPORT_HOUR);
    let target = match today {
        Some(t) if t > now => Some(t),
        _ => at_local_time((now + Duration::days(1)).date_naive(), DAILY_REPORT_HOUR),
    };
    target
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|| Utc::now() + Duration::days(1))
}

/// The next Sunday 20:00 local time; a Sunday evening rolls a full week.
pub fn next_weekly_run(now: DateTime<Local>) -> DateTime<Utc> {
    let weekday = now.weekday().num_days_from_sunday() as i64;
    let mut days_ahead = (7 - weekday) % 7;
    if days_ahead == 0 && now.hour() >= WEEKLY_REPORT_HOUR {
        days_ahead = 7;
    }
    let date = (now + Duration::days(days_ahead)).date_naive();
    at_local_time(date, WEEKLY_REPORT_HOUR)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|| Utc::now() + Duration::days(7))
}

fn at_local_time(date: NaiveDate, hour: u32) -> Option<DateTime<Local>> {
    let naive = date.and_hms_opt(hour, 0, 0)?;
    match Local.from_local_datetime(&naive) {
        LocalResult::Single(dt) => Some(dt),
        LocalResult::Ambiguous(early, _) => Some(early),
        LocalResult::None => None,
    }
}
