use std::sync::Arc;

use chrono::Local;
use tracing::{debug, warn};

use crate::store::{AuthType, Document, DocumentStore};

/// Document title for a day's conversation diary.
pub fn diary_title(date: &str) -> String {
    format!("AI_assistant_{}", date)
}

/// Append one completed exchange to today's diary document, creating it
/// on first write. Runs detached after a chat finishes; failures are
/// logged and never surface to the caller.
pub async fn record_exchange(
    store: Arc<dyn DocumentStore>,
    account: String,
    user_query: String,
    reply: String,
) {
    if user_query.is_empty() || reply.is_empty() {
        return;
    }

    let now = Local::now();
    let date = now.format("%Y-%m-%d").to_string();
    let title = diary_title(&date);

    let entry = format!(
        "\n\n### AI assistant exchange ({})\n\n**User:**\n{}\n\n**Assistant:**\n{}\n\n---\n",
        now.format("%H:%M:%S"),
        user_query,
        reply
    );

    match store.get_document(&account, &title).await {
        Some(existing) => {
            debug!(account = %account, title = %title, "Appending to existing diary");
            let mut updated = existing.clone();
            updated.content.push_str(&entry);
            if let Err(err) = store.modify_document(&account, updated).await {
                warn!(account = %account, error = %err, "Diary append failed");
            }
        }
        None => {
            debug!(account = %account, title = %title, "Creating new diary");
            let content = format!("# {} Diary\n{}", date, entry);
            let doc = Document::new(&title, &content, "diary,assistant", AuthType::Diary);
            if let Err(err) = store.add_document(&account, doc).await {
                warn!(account = %account, error = %err, "Diary create failed");
            }
        }
    }
}
