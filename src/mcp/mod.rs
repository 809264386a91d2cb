mod client;
mod pool;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::error::AgentError;
use crate::store::{AuthType, Document, DocumentStore};

pub use client::McpClient;
pub use pool::McpClientPool;

/// Document title the server configurations persist under.
pub const MCP_CONFIG_DOC_TITLE: &str = "mcp_config";

/// One external MCP server: how to start it and whether it is in use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub description: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl McpServerConfig {
    pub fn new(name: &str, command: &str, args: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            name: name.to_string(),
            command: command.to_string(),
            args,
            environment: HashMap::new(),
            enabled: true,
            description: String::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct McpConfigFile {
    configs: Vec<McpServerConfig>,
}

/// Server names become tool-name prefixes, so they are kept short and
/// free of path characters.
pub fn validate_server_config(config: &McpServerConfig) -> Result<(), AgentError> {
    if config.name.is_empty() {
        return Err(AgentError::input("name cannot be empty"));
    }
    if config.command.is_empty() {
        return Err(AgentError::input("command cannot be empty"));
    }
    if config.name.trim() != config.name {
        return Err(AgentError::input("name cannot have leading or trailing spaces"));
    }
    if config.name.len() > 50 {
        return Err(AgentError::input("name cannot be longer than 50 characters"));
    }
    if config.name.contains('/') || config.name.contains('\\') {
        return Err(AgentError::input("name cannot contain path separators"));
    }
    Ok(())
}

/// The live set of MCP server configurations, persisted whole to the
/// `mcp_config` document under the admin account after every mutation.
pub struct McpConfigSet {
    store: Arc<dyn DocumentStore>,
    admin_account: String,
    pool: Arc<McpClientPool>,
    configs: RwLock<Vec<McpServerConfig>>,
}

impl McpConfigSet {
    /// Load the persisted configurations. Invalid entries are kept but
    /// flagged; unparseable content falls back to an empty set.
    pub async fn load(
        store: Arc<dyn DocumentStore>,
        admin_account: impl Into<String>,
        pool: Arc<McpClientPool>,
    ) -> Arc<Self> {
        let admin_account = admin_account.into();
        let mut configs = Vec::new();

        if let Some(doc) = store.get_document(&admin_account, MCP_CONFIG_DOC_TITLE).await {
            match serde_json::from_str::<McpConfigFile>(&doc.content) {
                Ok(parsed) => {
                    for config in &parsed.configs {
                        if let Err(err) = validate_server_config(config) {
                            warn!(name = %config.name, error = %err, "MCP config failed validation");
                        }
                    }
                    configs = parsed.configs;
                }
                Err(err) => {
                    error!(error = %err, "Failed to parse MCP config document, starting empty");
                }
            }
        }

        info!(count = configs.len(), "MCP configurations loaded");
        Arc::new(Self {
            store,
            admin_account,
            pool,
            configs: RwLock::new(configs),
        })
    }

    pub async fn add(&self, mut config: McpServerConfig) -> Result<(), AgentError> {
        {
            let configs = self.configs.read().await;
            if configs.iter().any(|c| c.name == config.name) {
                return Err(AgentError::conflict(format!(
                    "MCP config with name '{}' already exists",
                    config.name
                )));
            }
        }
        validate_server_config(&config)?;

        let now = Utc::now();
        config.created_at = now;
        config.updated_at = now;
        let name = config.name.clone();
        self.configs.write().await.push(config);
        info!(name = %name, "MCP config added");
        self.save().await
    }

    pub async fn update(&self, name: &str, mut config: McpServerConfig) -> Result<(), AgentError> {
        validate_server_config(&config)?;
        let mut configs = self.configs.write().await;
        match configs.iter_mut().find(|c| c.name == name) {
            Some(existing) => {
                config.created_at = existing.created_at;
                config.updated_at = Utc::now();
                *existing = config;
            }
            None => {
                return Err(AgentError::not_found(format!(
                    "MCP config with name '{}' not found",
                    name
                )));
            }
        }
        drop(configs);
        info!(name = %name, "MCP config updated");
        self.save().await
    }

    pub async fn delete(&self, name: &str) -> Result<(), AgentError> {
        let mut configs = self.configs.write().await;
        let before = configs.len();
        configs.retain(|c| c.name != name);
        if configs.len() == before {
            return Err(AgentError::not_found(format!(
                "MCP config with name '{}' not found",
                name
            )));
        }
        drop(configs);

        self.pool.remove(name).await;
        info!(name = %name, "MCP config deleted");
        self.save().await
    }

    /// Flip the enabled state, returning the new value. Disabling also
    /// evicts any live client for the server.
    pub async fn toggle(&self, name: &str) -> Result<bool, AgentError> {
        let enabled = {
            let mut configs = self.configs.write().await;
            let config = configs.iter_mut().find(|c| c.name == name).ok_or_else(|| {
                AgentError::not_found(format!("MCP config with name '{}' not found", name))
            })?;
            config.enabled = !config.enabled;
            config.updated_at = Utc::now();
            config.enabled
        };

        if !enabled {
            self.pool.remove(name).await;
        }
        info!(name = %name, enabled, "MCP config toggled");
        self.save().await?;
        Ok(enabled)
    }

    pub async fn get(&self, name: &str) -> Option<McpServerConfig> {
        self.configs.read().await.iter().find(|c| c.name == name).cloned()
    }

    pub async fn enabled(&self) -> Vec<McpServerConfig> {
        self.configs
            .read()
            .await
            .iter()
            .filter(|c| c.enabled)
            .cloned()
            .collect()
    }

    pub async fn list(&self) -> Vec<McpServerConfig> {
        self.configs.read().await.clone()
    }

    async fn save(&self) -> Result<(), AgentError> {
        let configs = self.configs.read().await.clone();
        let file = McpConfigFile { configs };
        let content = serde_json::to_string_pretty(&file)
            .map_err(|e| AgentError::fatal(format!("failed to serialize MCP configs: {}", e)))?;
        let doc = Document::new(MCP_CONFIG_DOC_TITLE, &content, "agent,mcp", AuthType::Private);
        self.store
            .save_document(&self.admin_account, doc)
            .await
            .map_err(|err| {
                error!(error = %err, "Failed to persist MCP configs");
                AgentError::fatal(err.to_string())
            })
    }
}
