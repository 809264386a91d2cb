use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::AgentError;

/// Visibility class of a stored document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    Private,
    Diary,
    Public,
}

/// A named document owned by one account. Content is an opaque UTF-8 blob;
/// the agent core writes JSON into it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub title: String,
    pub content: String,
    pub tags: String,
    pub auth_type: AuthType,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    pub fn new(title: &str, content: &str, tags: &str, auth_type: AuthType) -> Self {
        let now = Utc::now();
        Self {
            title: title.to_string(),
            content: content.to_string(),
            tags: tags.to_string(),
            auth_type,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Account-scoped document storage. Titles are unique per account.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert a new document. Fails with `Conflict` if the title exists.
    async fn add_document(&self, account: &str, doc: Document) -> anyhow::Result<()>;
    /// Replace an existing document. Fails with `NotFound` if missing.
    async fn modify_document(&self, account: &str, doc: Document) -> anyhow::Result<()>;
    async fn delete_document(&self, account: &str, title: &str) -> anyhow::Result<()>;
    async fn get_document(&self, account: &str, title: &str) -> Option<Document>;
    /// All documents of the account, keyed by title.
    async fn list_documents(&self, account: &str) -> HashMap<String, Document>;

    /// Insert-or-replace, preserving `created_at` on replace.
    async fn save_document(&self, account: &str, doc: Document) -> anyhow::Result<()> {
        match self.get_document(account, &doc.title).await {
            Some(existing) => {
                let mut updated = doc;
                updated.created_at = existing.created_at;
                updated.updated_at = Utc::now();
                self.modify_document(account, updated).await
            }
            None => self.add_document(account, doc).await,
        }
    }
}

/// In-memory `DocumentStore`. The default backing store when no external
/// store is wired, and the store used throughout the test suite.
#[derive(Default)]
pub struct MemoryStore {
    accounts: RwLock<HashMap<String, HashMap<String, Document>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn add_document(&self, account: &str, doc: Document) -> anyhow::Result<()> {
        let mut accounts = self.accounts.write().await;
        let docs = accounts.entry(account.to_string()).or_default();
        if docs.contains_key(&doc.title) {
            return Err(AgentError::conflict(format!(
                "document already exists: {}",
                doc.title
            ))
            .into());
        }
        docs.insert(doc.title.clone(), doc);
        Ok(())
    }

    async fn modify_document(&self, account: &str, doc: Document) -> anyhow::Result<()> {
        let mut accounts = self.accounts.write().await;
        let docs = accounts.entry(account.to_string()).or_default();
        if !docs.contains_key(&doc.title) {
            return Err(
                AgentError::not_found(format!("document not found: {}", doc.title)).into(),
            );
        }
        docs.insert(doc.title.clone(), doc);
        Ok(())
    }

    async fn delete_document(&self, account: &str, title: &str) -> anyhow::Result<()> {
        let mut accounts = self.accounts.write().await;
        let docs = accounts.entry(account.to_string()).or_default();
        if docs.remove(title).is_none() {
            return Err(AgentError::not_found(format!("document not found: {}", title)).into());
        }
        Ok(())
    }

    async fn get_document(&self, account: &str, title: &str) -> Option<Document> {
        let accounts = self.accounts.read().await;
        accounts.get(account)?.get(title).cloned()
    }

    async fn list_documents(&self, account: &str) -> HashMap<String, Document> {
        let accounts = self.accounts.read().await;
        accounts.get(account).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn doc(title: &str, content: &str) -> Document {
        Document::new(title, content, "", AuthType::Private)
    }

    #[tokio::test]
    async fn add_rejects_duplicate_title() {
        let store = MemoryStore::new();
        store.add_document("alice", doc("notes", "v1")).await.unwrap();

        let err = store
            .add_document("alice", doc("notes", "v2"))
            .await
            .unwrap_err();
        let agent_err = err.downcast_ref::<AgentError>().unwrap();
        assert_eq!(agent_err.kind, ErrorKind::Conflict);

        // Same title under another account is a separate namespace.
        store.add_document("bob", doc("notes", "v2")).await.unwrap();
    }

    #[tokio::test]
    async fn modify_requires_existing() {
        let store = MemoryStore::new();
        let err = store
            .modify_document("alice", doc("missing", "x"))
            .await
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<AgentError>().unwrap().kind,
            ErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn save_upserts_and_preserves_created_at() {
        let store = MemoryStore::new();
        store.save_document("alice", doc("diary", "day 1")).await.unwrap();
        let created = store
            .get_document("alice", "diary")
            .await
            .unwrap()
            .created_at;

        store.save_document("alice", doc("diary", "day 1\nday 2")).await.unwrap();
        let after = store.get_document("alice", "diary").await.unwrap();
        assert_eq!(after.content, "day 1\nday 2");
        assert_eq!(after.created_at, created);
    }

    #[tokio::test]
    async fn list_is_account_scoped() {
        let store = MemoryStore::new();
        store.add_document("alice", doc("a", "1")).await.unwrap();
        store.add_document("alice", doc("b", "2")).await.unwrap();
        store.add_document("bob", doc("c", "3")).await.unwrap();

        let alice_docs = store.list_documents("alice").await;
        assert_eq!(alice_docs.len(), 2);
        assert!(alice_docs.contains_key("a"));
        assert!(!alice_docs.contains_key("c"));
        assert!(store.list_documents("carol").await.is_empty());
    }

    #[tokio::test]
    async fn delete_missing_is_not_found() {
        let store = MemoryStore::new();
        let err = store.delete_document("alice", "ghost").await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<AgentError>().unwrap().kind,
            ErrorKind::NotFound
        );
    }
}
