use serde_json::{json, Value};

use crate::config::ContextConfig;

pub const TRUNCATION_MARKER: &str = "... [truncated]";

/// Character budgets applied to a conversation before an LLM call.
#[derive(Debug, Clone, Copy)]
pub struct ContextLimits {
    pub max_message_chars: usize,
    pub max_total_chars: usize,
    pub max_messages: usize,
    pub max_tool_result_chars: usize,
    pub max_tool_arg_chars: usize,
}

/// Progressively smaller (per-message, total, count) budgets used when the
/// provider rejects a request for context length.
pub const RETRY_TIERS: [(usize, usize, usize); 2] = [(4000, 100_000, 40), (2000, 60_000, 30)];

impl Default for ContextLimits {
    fn default() -> Self {
        Self::from(&ContextConfig::default())
    }
}

impl From<&ContextConfig> for ContextLimits {
    fn from(config: &ContextConfig) -> Self {
        Self {
            max_message_chars: config.max_message_chars,
            max_total_chars: config.max_total_chars,
            max_messages: config.max_messages,
            max_tool_result_chars: config.max_tool_result_chars,
            max_tool_arg_chars: config.max_tool_arg_chars,
        }
    }
}

impl ContextLimits {
    /// The same limits with one retry tier applied. Tool-field caps are
    /// unchanged by tiers.
    pub fn with_tier(&self, tier: (usize, usize, usize)) -> Self {
        Self {
            max_message_chars: tier.0,
            max_total_chars: tier.1,
            max_messages: tier.2,
            max_tool_result_chars: self.max_tool_result_chars,
            max_tool_arg_chars: self.max_tool_arg_chars,
        }
    }
}

/// Byte-budget truncation with a visible marker. The marker is appended
/// after the cut, and the cut never splits a UTF-8 sequence.
pub fn truncate_str(s: &str, max: usize) -> String {
    if max == 0 {
        return String::new();
    }
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{}", &s[..end], TRUNCATION_MARKER)
}

fn clamp_content(msg: &mut Value, max: usize) {
    let clamped = match msg["content"].as_str() {
        Some(content) if !content.is_empty() && content.len() > max => {
            Some(truncate_str(content, max))
        }
        _ => None,
    };
    if let Some(content) = clamped {
        msg["content"] = json!(content);
    }
}

fn clamp_tool_call_args(msg: &mut Value, max: usize) {
    let calls = match msg.get_mut("tool_calls").and_then(|v| v.as_array_mut()) {
        Some(c) => c,
        None => return,
    };
    for call in calls {
        let clamped = match call["function"]["arguments"].as_str() {
            Some(args) if args.len() > max => Some(truncate_str(args, max)),
            _ => None,
        };
        if let Some(args) = clamped {
            call["function"]["arguments"] = json!(args);
        }
    }
}

/// Rough budget contribution of one message: content plus, for each tool
/// call, name + arguments + id.
fn approx_cost(msg: &Value) -> usize {
    let mut cost = msg["content"].as_str().map_or(0, |c| c.len());
    if let Some(calls) = msg["tool_calls"].as_array() {
        for call in calls {
            cost += call["function"]["name"].as_str().map_or(0, |s| s.len());
            cost += call["function"]["arguments"].as_str().map_or(0, |s| s.len());
            cost += call["id"].as_str().map_or(0, |s| s.len());
        }
    }
    cost
}

/// Prune and clamp a conversation to fit the limits.
///
/// The leading system message is always preserved (clamped, not counted
/// against the total). The walk runs newest to oldest, clamping each
/// message, and stops at the first message that would break either the
/// count cap (one slot reserved for system) or the total budget.
pub fn sanitize_messages(original: &[Value], limits: &ContextLimits) -> Vec<Value> {
    let mut system: Option<Value> = None;
    if let Some(first) = original.first() {
        if first["role"].as_str() == Some("system") {
            let mut sys = first.clone();
            clamp_content(&mut sys, limits.max_message_chars);
            system = Some(sys);
        }
    }

    let mut total_chars = 0usize;
    let mut kept_reversed: Vec<Value> = Vec::new();

    for i in (0..original.len()).rev() {
        if system.is_some() && i == 0 {
            continue;
        }
        let mut msg = original[i].clone();
        clamp_content(&mut msg, limits.max_message_chars);
        clamp_tool_call_args(&mut msg, limits.max_tool_arg_chars);

        let cost = approx_cost(&msg);
        if kept_reversed.len() >= limits.max_messages.saturating_sub(1) {
            break;
        }
        if total_chars + cost > limits.max_total_chars {
            break;
        }
        total_chars += cost;
        kept_reversed.push(msg);
    }

    kept_reversed.reverse();
    match system {
        Some(sys) => {
            let mut result = Vec::with_capacity(kept_reversed.len() + 1);
            result.push(sys);
            result.extend(kept_reversed);
            result
        }
        None => kept_reversed,
    }
}

/// Fold the middle of a long conversation into one summary message.
///
/// Triggers only past 10 messages and 80% of the total budget; keeps the
/// system message and the last 8 turns, and replaces everything between
/// with a single user-role digest.
pub fn compact_messages(messages: &[Value], limits: &ContextLimits) -> Vec<Value> {
    if messages.len() <= 10 {
        return messages.to_vec();
    }

    let mut total_chars = 0usize;
    for msg in messages {
        total_chars += msg["content"].as_str().map_or(0, |c| c.len());
        if let Some(calls) = msg["tool_calls"].as_array() {
            for call in calls {
                total_chars += call["function"]["arguments"].as_str().map_or(0, |s| s.len());
            }
        }
    }
    if total_chars < limits.max_total_chars * 80 / 100 {
        return messages.to_vec();
    }

    let mut start_idx = 0;
    let mut system: Option<Value> = None;
    if messages[0]["role"].as_str() == Some("system") {
        system = Some(messages[0].clone());
        start_idx = 1;
    }

    let keep_count = 8;
    if messages.len() - start_idx <= keep_count {
        return messages.to_vec();
    }

    let recent = &messages[messages.len() - keep_count..];
    let old = &messages[start_idx..messages.len() - keep_count];

    let mut summary_parts: Vec<String> = Vec::new();
    for msg in old {
        let content = msg["content"].as_str().unwrap_or("");
        if content.is_empty() {
            continue;
        }
        match msg["role"].as_str() {
            Some("user") => summary_parts.push(format!("User: {}", truncate_str(content, 100))),
            Some("assistant") => summary_parts.push(format!("AI: {}", truncate_str(content, 100))),
            Some("tool") => {
                summary_parts.push(format!("Tool result: {}", truncate_str(content, 50)))
            }
            _ => {}
        }
    }

    let compacted = json!({
        "role": "user",
        "content": format!(
            "[Earlier conversation summary ({} messages compacted)]\n{}",
            old.len(),
            summary_parts.join("\n")
        ),
    });

    let mut result = Vec::with_capacity(keep_count + 2);
    if let Some(sys) = system {
        result.push(sys);
    }
    result.push(compacted);
    result.extend_from_slice(recent);
    result
}
