//! Document-store tools. These run in-process against the configured
//! [`DocumentStore`] and are registered under the `Inner_blog` server
//! prefix, so the model addresses them by their short names.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Local;
use serde_json::{json, Value};

use crate::error::AgentError;
use crate::registry::ToolRegistry;
use crate::store::{AuthType, Document, DocumentStore};
use crate::tools::{envelope_input_errors, get_int_arg, get_string_arg, LOCAL_SERVER};
use crate::traits::Tool;

/// Registers the whole document tool family on `registry`.
pub async fn register_all(registry: &ToolRegistry, store: &Arc<dyn DocumentStore>) {
    let tools: Vec<Arc<dyn Tool>> = vec![
        Arc::new(BlogNamesTool::new(Arc::clone(store))),
        Arc::new(BlogDataTool::new(Arc::clone(store))),
        Arc::new(CreateBlogTool::new(Arc::clone(store))),
        Arc::new(BlogCountTool::new(Arc::clone(store))),
        Arc::new(CurrentDateTool),
        Arc::new(CurrentTimeTool),
    ];
    for tool in tools {
        registry.register(LOCAL_SERVER, tool).await;
    }
}

fn account_property(description: &str) -> Value {
    json!({ "type": "string", "description": description })
}

pub struct BlogNamesTool {
    store: Arc<dyn DocumentStore>,
}

impl BlogNamesTool {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    async fn run(&self, args: &Value) -> anyhow::Result<String> {
        let account = get_string_arg(args, "account")?;
        let docs = self.store.list_documents(&account).await;
        if docs.is_empty() {
            return Ok("no documents found".to_string());
        }
        let mut titles: Vec<String> = docs.into_keys().collect();
        titles.sort();
        Ok(titles.join("\n"))
    }
}

#[async_trait]
impl Tool for BlogNamesTool {
    fn name(&self) -> &str {
        "RawAllBlogName"
    }

    fn description(&self) -> &str {
        "List the titles of all documents stored for an account"
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "account": account_property("Account whose documents are listed"),
            },
            "required": ["account"]
        })
    }

    async fn call(&self, args: &Value) -> anyhow::Result<String> {
        envelope_input_errors(self.run(args).await)
    }
}

pub struct BlogDataTool {
    store: Arc<dyn DocumentStore>,
}

impl BlogDataTool {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    async fn run(&self, args: &Value) -> anyhow::Result<String> {
        let account = get_string_arg(args, "account")?;
        let title = get_string_arg(args, "title")?;
        let doc = self
            .store
            .get_document(&account, &title)
            .await
            .ok_or_else(|| AgentError::not_found(format!("document not found: {title}")))?;
        Ok(format!(
            "Title: {}\nTags: {}\nUpdated: {}\n\n{}",
            doc.title,
            doc.tags,
            doc.updated_at.format("%Y-%m-%d %H:%M:%S"),
            doc.content
        ))
    }
}

#[async_trait]
impl Tool for BlogDataTool {
    fn name(&self) -> &str {
        "RawGetBlogData"
    }

    fn description(&self) -> &str {
        "Fetch a stored document by title, including its tags and content"
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "account": account_property("Account that owns the document"),
                "title": { "type": "string", "description": "Exact title of the document" },
            },
            "required": ["account", "title"]
        })
    }

    async fn call(&self, args: &Value) -> anyhow::Result<String> {
        envelope_input_errors(self.run(args).await)
    }
}

pub struct CreateBlogTool {
    store: Arc<dyn DocumentStore>,
}

impl CreateBlogTool {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    async fn run(&self, args: &Value) -> anyhow::Result<String> {
        let account = get_string_arg(args, "account")?;
        let title = get_string_arg(args, "title")?;
        let content = get_string_arg(args, "content")?;
        let tags = get_string_arg(args, "tags")?;
        let auth_type = match get_int_arg(args, "authType")? {
            0 => AuthType::Private,
            1 => AuthType::Diary,
            2 => AuthType::Public,
            other => {
                return Err(AgentError::input(format!(
                    "authType must be 0 (private), 1 (diary) or 2 (public), got: {other}"
                ))
                .into())
            }
        };
        self.store
            .add_document(&account, Document::new(&title, &content, &tags, auth_type))
            .await?;
        Ok(format!("Document '{title}' created"))
    }
}

#[async_trait]
impl Tool for CreateBlogTool {
    fn name(&self) -> &str {
        "RawCreateBlog"
    }

    fn description(&self) -> &str {
        "Create a new document with a title, content, tags and visibility"
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "account": account_property("Account the document is created under"),
                "title": { "type": "string", "description": "Title of the new document, unique per account" },
                "content": { "type": "string", "description": "Document body" },
                "tags": { "type": "string", "description": "Comma-separated tags" },
                "authType": {
                    "type": "integer",
                    "description": "Visibility: 0 private, 1 diary, 2 public"
                },
            },
            "required": ["account", "title", "content", "tags", "authType"]
        })
    }

    async fn call(&self, args: &Value) -> anyhow::Result<String> {
        envelope_input_errors(self.run(args).await)
    }
}

pub struct BlogCountTool {
    store: Arc<dyn DocumentStore>,
}

impl BlogCountTool {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    async fn run(&self, args: &Value) -> anyhow::Result<String> {
        let account = get_string_arg(args, "account")?;
        Ok(self.store.list_documents(&account).await.len().to_string())
    }
}

#[async_trait]
impl Tool for BlogCountTool {
    fn name(&self) -> &str {
        "RawAllBlogCount"
    }

    fn description(&self) -> &str {
        "Count the documents stored for an account"
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "account": account_property("Account whose documents are counted"),
            },
            "required": ["account"]
        })
    }

    async fn call(&self, args: &Value) -> anyhow::Result<String> {
        envelope_input_errors(self.run(args).await)
    }
}

pub struct CurrentDateTool;

#[async_trait]
impl Tool for CurrentDateTool {
    fn name(&self) -> &str {
        "RawCurrentDate"
    }

    fn description(&self) -> &str {
        "Get the current date (YYYY-MM-DD)"
    }

    fn schema(&self) -> Value {
        json!({ "type": "object", "properties": {}, "required": [] })
    }

    async fn call(&self, _args: &Value) -> anyhow::Result<String> {
        Ok(Local::now().format("%Y-%m-%d").to_string())
    }
}

pub struct CurrentTimeTool;

#[async_trait]
impl Tool for CurrentTimeTool {
    fn name(&self) -> &str {
        "RawCurrentTime"
    }

    fn description(&self) -> &str {
        "Get the current time (HH:MM:SS)"
    }

    fn schema(&self) -> Value {
        json!({ "type": "object", "properties": {}, "required": [] })
    }

    async fn call(&self, _args: &Value) -> anyhow::Result<String> {
        Ok(Local::now().format("%H:%M:%S").to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::store::MemoryStore;

    fn store() -> Arc<dyn DocumentStore> {
        Arc::new(MemoryStore::new())
    }

    #[tokio::test]
    async fn create_then_fetch_round_trip() {
        let store = store();
        let create = CreateBlogTool::new(Arc::clone(&store));
        let out = create
            .call(&json!({
                "account": "alice",
                "title": "trip notes",
                "content": "packed the tent",
                "tags": "travel",
                "authType": 1
            }))
            .await
            .unwrap();
        assert_eq!(out, "Document 'trip notes' created");

        let saved = store.get_document("alice", "trip notes").await.unwrap();
        assert_eq!(saved.auth_type, AuthType::Diary);

        let fetch = BlogDataTool::new(Arc::clone(&store));
        let text = fetch
            .call(&json!({ "account": "alice", "title": "trip notes" }))
            .await
            .unwrap();
        assert!(text.starts_with("Title: trip notes\nTags: travel\n"));
        assert!(text.ends_with("packed the tent"));
    }

    #[tokio::test]
    async fn missing_parameter_becomes_error_envelope() {
        let names = BlogNamesTool::new(store());
        let out = names.call(&json!({})).await.unwrap();
        assert_eq!(out, r#"{"error":"missing parameter: account"}"#);
    }

    #[tokio::test]
    async fn out_of_range_auth_type_is_reported_to_the_model() {
        let create = CreateBlogTool::new(store());
        let out = create
            .call(&json!({
                "account": "alice",
                "title": "t",
                "content": "c",
                "tags": "",
                "authType": 9
            }))
            .await
            .unwrap();
        assert!(out.contains("authType must be 0 (private), 1 (diary) or 2 (public)"));
    }

    #[tokio::test]
    async fn duplicate_title_fails_the_call() {
        let store = store();
        let create = CreateBlogTool::new(Arc::clone(&store));
        let args = json!({
            "account": "alice",
            "title": "t",
            "content": "c",
            "tags": "",
            "authType": 0
        });
        create.call(&args).await.unwrap();

        let err = create.call(&args).await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<AgentError>().unwrap().kind,
            ErrorKind::Conflict
        );
    }

    #[tokio::test]
    async fn names_are_sorted_and_count_matches() {
        let store = store();
        for title in ["zebra", "apple", "mango"] {
            store
                .add_document("alice", Document::new(title, "x", "", AuthType::Private))
                .await
                .unwrap();
        }

        let names = BlogNamesTool::new(Arc::clone(&store));
        let listing = names.call(&json!({ "account": "alice" })).await.unwrap();
        assert_eq!(listing, "apple\nmango\nzebra");

        let count = BlogCountTool::new(Arc::clone(&store));
        assert_eq!(count.call(&json!({ "account": "alice" })).await.unwrap(), "3");
        assert_eq!(count.call(&json!({ "account": "bob" })).await.unwrap(), "0");
    }

    #[tokio::test]
    async fn clock_tools_use_fixed_formats() {
        let date = CurrentDateTool.call(&json!({})).await.unwrap();
        assert!(chrono::NaiveDate::parse_from_str(&date, "%Y-%m-%d").is_ok());

        let time = CurrentTimeTool.call(&json!({})).await.unwrap();
        assert!(chrono::NaiveTime::parse_from_str(&time, "%H:%M:%S").is_ok());
    }
}
