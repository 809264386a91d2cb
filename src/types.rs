use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle event kind, serialized as a snake_case string on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Submitted,
    Started,
    Progress,
    Paused,
    Resumed,
    Canceled,
    Done,
    Error,
    Reminder,
    ReminderSync,
    ReportGenerated,
}

/// A lifecycle event delivered to connected clients.
///
/// `task_id` is empty for events not tied to a task (reminder fires,
/// reminder sync pushes).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub task_id: String,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Notification {
    pub fn new(task_id: &str, kind: NotificationKind) -> Self {
        Self {
            task_id: task_id.to_string(),
            kind,
            progress: None,
            message: None,
            data: None,
        }
    }

    pub fn with_progress(mut self, progress: f64) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_serializes_snake_case() {
        let json = serde_json::to_string(&NotificationKind::ReportGenerated).unwrap();
        assert_eq!(json, "\"report_generated\"");
        let back: NotificationKind = serde_json::from_str("\"reminder_sync\"").unwrap();
        assert_eq!(back, NotificationKind::ReminderSync);
    }

    #[test]
    fn optional_fields_are_omitted() {
        let n = Notification::new("t1", NotificationKind::Submitted);
        let v = serde_json::to_value(&n).unwrap();
        assert_eq!(v["task_id"], "t1");
        assert_eq!(v["type"], "submitted");
        assert!(v.get("progress").is_none());
        assert!(v.get("message").is_none());
        assert!(v.get("data").is_none());
    }

    #[test]
    fn builder_fields_round_trip() {
        let n = Notification::new("t2", NotificationKind::Progress)
            .with_progress(50.0)
            .with_message("halfway")
            .with_data(serde_json::json!({"step": "analyze"}));
        let v = serde_json::to_value(&n).unwrap();
        assert_eq!(v["progress"], 50.0);
        assert_eq!(v["message"], "halfway");
        assert_eq!(v["data"]["step"], "analyze");
    }
}
