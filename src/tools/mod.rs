//! In-process tools exposed to the model.
//!
//! Tools that operate on the document store live in [`docs`]; tools that
//! drive reminders, notifications, and reports live in [`reminders`]. All
//! of them surface parameter problems to the model as a small JSON error
//! envelope instead of failing the call, so the model can correct its
//! arguments and retry.

pub mod docs;
pub mod reminders;

use serde_json::{json, Value};

use crate::error::{AgentError, ErrorKind};

/// Server prefix under which the document tools register.
pub const LOCAL_SERVER: &str = "Inner_blog";

/// Renders an error as the JSON envelope tools hand back to the model.
pub fn error_json(message: &str) -> String {
    json!({ "error": message }).to_string()
}

/// Maps input-class failures to the JSON error envelope so the model can
/// retry with corrected arguments. Every other failure propagates and
/// reaches the model as a failed tool call.
pub fn envelope_input_errors(result: anyhow::Result<String>) -> anyhow::Result<String> {
    match result {
        Err(err) => match err.downcast_ref::<AgentError>() {
            Some(agent) if agent.kind == ErrorKind::Input => Ok(error_json(&agent.message)),
            _ => Err(err),
        },
        ok => ok,
    }
}

/// Extracts a required string parameter from a tool argument object.
pub fn get_string_arg(args: &Value, key: &str) -> Result<String, AgentError> {
    match args.get(key) {
        None | Some(Value::Null) => Err(AgentError::input(format!("missing parameter: {key}"))),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(AgentError::input(format!(
            "parameter type error: {key} must be a string"
        ))),
    }
}

/// Extracts a required integer parameter. Accepts whole floats as well,
/// since models frequently emit `3.0` where `3` is meant.
pub fn get_int_arg(args: &Value, key: &str) -> Result<i64, AgentError> {
    let value = args
        .get(key)
        .filter(|v| !v.is_null())
        .ok_or_else(|| AgentError::input(format!("missing parameter: {key}")))?;
    if let Some(n) = value.as_i64() {
        return Ok(n);
    }
    if let Some(f) = value.as_f64() {
        return Ok(f as i64);
    }
    Err(AgentError::input(format!(
        "parameter type error: {key} must be a number"
    )))
}

/// Like [`get_int_arg`], but falls back to `default` when the parameter is
/// absent or has the wrong type.
pub fn get_optional_int_arg(args: &Value, key: &str, default: i64) -> i64 {
    get_int_arg(args, key).unwrap_or(default)
}
