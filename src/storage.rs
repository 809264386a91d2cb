use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::store::{AuthType, Document, DocumentStore};
use crate::task::{Task, TaskHandle, TaskStatus};

/// Reserved document title prefix for serialized tasks.
pub const TASK_DOC_PREFIX: &str = "agent_task_";

/// Per-account task persistence plus the in-memory handle index.
///
/// Write-through: every state transition is saved before its notification
/// is emitted. A failed save keeps the in-memory transition and logs the
/// divergence; the next successful save repairs it.
pub struct TaskStorage {
    account: String,
    store: Arc<dyn DocumentStore>,
    tasks: RwLock<HashMap<String, Arc<TaskHandle>>>,
}

impl TaskStorage {
    /// Build the storage for one account, scanning its `agent_task_*`
    /// documents. Tasks interrupted mid-run by a previous shutdown
    /// (running or paused) are normalized back to pending with their
    /// `current_step` cursor preserved.
    pub async fn new(store: Arc<dyn DocumentStore>, account: &str) -> Arc<Self> {
        let storage = Arc::new(Self {
            account: account.to_string(),
            store,
            tasks: RwLock::new(HashMap::new()),
        });
        storage.load().await;
        storage
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    async fn load(&self) {
        let docs = self.store.list_documents(&self.account).await;
        let mut loaded = 0usize;
        let mut recovered = 0usize;
        for (title, doc) in docs {
            if !title.starts_with(TASK_DOC_PREFIX) {
                continue;
            }
            let mut task: Task = match serde_json::from_str(&doc.content) {
                Ok(t) => t,
                Err(e) => {
                    warn!(title = %title, error = %e, "Skipping unreadable task document");
                    continue;
                }
            };

            let was_interrupted =
                matches!(task.status, TaskStatus::Running | TaskStatus::Paused);
            if was_interrupted {
                task.status = TaskStatus::Pending;
                task.started_at = None;
                for sub in task.subtasks.iter_mut() {
                    if sub.status == crate::task::SubTaskStatus::Running {
                        sub.status = crate::task::SubTaskStatus::Pending;
                    }
                }
                task.add_log("warn", "interrupted by shutdown, re-queued");
                recovered += 1;
            }

            let handle = TaskHandle::new(task.clone());
            self.tasks.write().await.insert(task.id.clone(), handle);
            if was_interrupted {
                // Persist the normalized form so the store matches memory.
                if let Err(e) = self.save(&task).await {
                    warn!(task_id = %task.id, error = %e, "Failed to persist recovered task");
                }
            }
            loaded += 1;
        }
        if loaded > 0 {
            info!(
                account = %self.account,
                tasks = loaded,
                recovered,
                "Loaded persisted tasks"
            );
        }
    }

    /// Serialize one task record into its store document.
    pub async fn save(&self, task: &Task) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(task)?;
        let title = format!("{}{}", TASK_DOC_PREFIX, task.id);
        self.store
            .save_document(
                &self.account,
                Document::new(&title, &content, "agent,task", AuthType::Private),
            )
            .await
    }

    /// Snapshot the handle and write it through, logging save failures
    /// instead of propagating them.
    pub async fn persist(&self, handle: &TaskHandle) {
        let task = handle.snapshot().await;
        if let Err(e) = self.save(&task).await {
            error!(task_id = %task.id, error = %e, "Task save failed, in-memory state kept");
        }
    }

    /// Register a new task: index the handle and write the record through.
    pub async fn insert(&self, task: Task) -> Arc<TaskHandle> {
        let handle = TaskHandle::new(task.clone());
        self.tasks
            .write()
            .await
            .insert(task.id.clone(), handle.clone());
        if let Err(e) = self.save(&task).await {
            error!(task_id = %task.id, error = %e, "Task save failed, in-memory state kept");
        }
        handle
    }

    pub async fn get(&self, id: &str) -> Option<Arc<TaskHandle>> {
        self.tasks.read().await.get(id).cloned()
    }

    /// All tasks of the account, newest first.
    pub async fn list_by_account(&self) -> Vec<Task> {
        let handles: Vec<Arc<TaskHandle>> = self.tasks.read().await.values().cloned().collect();
        let mut tasks = Vec::with_capacity(handles.len());
        for handle in handles {
            tasks.push(handle.snapshot().await);
        }
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        tasks
    }

    /// Pending tasks ordered by priority, highest first. Recovery re-submits
    /// in this order.
    pub async fn list_pending(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .list_by_account()
            .await
            .into_iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .collect();
        tasks.sort_by(|a, b| b.priority.cmp(&a.priority));
        tasks
    }

    pub async fn delete(&self, id: &str) -> anyhow::Result<()> {
        self.tasks.write().await.remove(id);
        let title = format!("{}{}", TASK_DOC_PREFIX, id);
        self.store.delete_document(&self.account, &title).await
    }
}

/// Lazily built per-account storages sharing one backing store.
pub struct StorageRegistry {
    store: Arc<dyn DocumentStore>,
    storages: RwLock<HashMap<String, Arc<TaskStorage>>>,
}

impl StorageRegistry {
    pub fn new(store: Arc<dyn DocumentStore>) -> Arc<Self> {
        Arc::new(Self {
            store,
            storages: RwLock::new(HashMap::new()),
        })
    }

    /// Get the account's storage, building it (and running its startup
    /// scan) on first use. The build happens outside the map lock; a
    /// concurrent first use is resolved by a re-check on insert.
    pub async fn for_account(&self, account: &str) -> Arc<TaskStorage> {
        if let Some(existing) = self.storages.read().await.get(account) {
            return existing.clone();
        }

        let built = TaskStorage::new(self.store.clone(), account).await;

        let mut storages = self.storages.write().await;
        match storages.get(account) {
            Some(existing) => existing.clone(),
            None => {
                storages.insert(account.to_string(), built.clone());
                built
            }
        }
    }

    pub async fn loaded_accounts(&self) -> Vec<String> {
        self.storages.read().await.keys().cloned().collect()
    }
}
