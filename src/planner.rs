//! Task planner: one low-temperature completion that decomposes a user
//! request into an ordered list of sub-tasks.
//!
//! Models wrap JSON in prose or code fences often enough that the parser
//! strips fences and extracts the outermost brace pair before
//! deserializing. Anything that still fails to parse degrades to a single
//! sub-task carrying the raw input, so a bad plan never blocks execution.

use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::registry::ToolRegistry;
use crate::task::SubTask;
use crate::traits::ModelProvider;

const PLANNER_TEMPERATURE: f32 = 0.3;
const MAX_SUBTASKS: usize = 5;

/// Decomposition result. `title` seeds the task context so later turns
/// can refer to the plan by name.
#[derive(Debug)]
pub struct Plan {
    pub title: String,
    pub subtasks: Vec<SubTask>,
}

#[derive(Deserialize)]
struct PlanResponse {
    #[serde(default)]
    title: String,
    #[serde(default)]
    subtasks: Vec<PlannedStep>,
}

#[derive(Deserialize)]
struct PlannedStep {
    #[serde(default)]
    description: String,
    #[serde(default)]
    tools: Vec<String>,
}

pub struct Planner {
    provider: Arc<dyn ModelProvider>,
    registry: Arc<ToolRegistry>,
    model: String,
}

impl Planner {
    pub fn new(
        provider: Arc<dyn ModelProvider>,
        registry: Arc<ToolRegistry>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            registry,
            model: model.into(),
        }
    }

    /// Plans `user_input` for `account`. Fails only when the provider is
    /// unreachable; malformed model output falls back to a single step.
    pub async fn plan(&self, account: &str, user_input: &str) -> anyhow::Result<Plan> {
        let catalog = self.registry.catalog_text().await;
        let system = format!(
            "You are a task planning assistant. Decompose the user's request \
             into a short ordered sequence of executable steps.\n\
             Respond with strict JSON in the form \
             {{\"title\": \"...\", \"subtasks\": [{{\"description\": \"...\", \"tools\": [\"...\"]}}]}}.\n\
             Use between 1 and {MAX_SUBTASKS} subtasks. Current account: {account}\n\n\
             Available tools:\n{catalog}"
        );
        let messages = vec![
            serde_json::json!({ "role": "system", "content": system }),
            serde_json::json!({ "role": "user", "content": user_input }),
        ];

        let response = self
            .provider
            .chat(&self.model, &messages, &[], Some(PLANNER_TEMPERATURE))
            .await?;
        let text = response.content.unwrap_or_default();

        match parse_plan(&text) {
            Some(plan) => {
                debug!(steps = plan.subtasks.len(), title = %plan.title, "plan accepted");
                Ok(plan)
            }
            None => {
                warn!(response_len = text.len(), "unusable plan, falling back to a single step");
                Ok(Plan {
                    title: user_input.to_string(),
                    subtasks: vec![SubTask::new(user_input, Vec::new())],
                })
            }
        }
    }
}

fn parse_plan(response: &str) -> Option<Plan> {
    let json = extract_json(response);
    let parsed: PlanResponse = serde_json::from_str(json).ok()?;

    let subtasks: Vec<SubTask> = parsed
        .subtasks
        .into_iter()
        .filter(|step| !step.description.trim().is_empty())
        .map(|step| SubTask::new(step.description.trim(), step.tools))
        .collect();
    if subtasks.is_empty() || subtasks.len() > MAX_SUBTASKS {
        return None;
    }

    Some(Plan {
        title: parsed.title,
        subtasks,
    })
}

/// Strips code fences and returns the outermost `{...}` span, or the
/// trimmed input when no brace pair exists.
fn extract_json(response: &str) -> &str {
    let mut text = response.trim();
    text = text.strip_prefix("```json").unwrap_or(text);
    text = text.strip_prefix("```").unwrap_or(text);
    text = text.strip_suffix("```").unwrap_or(text);

    match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if end > start => &text[start..=end],
        _ => text.trim(),
    }
}
