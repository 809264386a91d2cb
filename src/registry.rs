//! Tool registry: the single dispatch point for everything the model can
//! call. In-process tools register under a server prefix; MCP servers are
//! attached as a routing backend and their tools are discovered lazily
//! when the model-facing specs are built.
//!
//! The model always sees short names (the part after the last dot). The
//! registry keeps a reverse map so a short name coming back from the model
//! resolves to the fully qualified `server.tool` it belongs to.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::AgentError;
use crate::mcp::{McpClientPool, McpConfigSet};
use crate::traits::Tool;

struct McpRouting {
    configs: Arc<McpConfigSet>,
    pool: Arc<McpClientPool>,
}

pub struct ToolRegistry {
    /// Fully qualified name (`server.tool`) to in-process tool.
    local: RwLock<HashMap<String, Arc<dyn Tool>>>,
    /// Short name to fully qualified name, for both local and MCP tools.
    short_names: RwLock<HashMap<String, String>>,
    /// Catalog lines for MCP tools seen during the last discovery pass.
    mcp_catalog: RwLock<Vec<(String, String)>>,
    mcp: RwLock<Option<McpRouting>>,
}

impl ToolRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            local: RwLock::new(HashMap::new()),
            short_names: RwLock::new(HashMap::new()),
            mcp_catalog: RwLock::new(Vec::new()),
            mcp: RwLock::new(None),
        })
    }

    /// Registers an in-process tool under `server`.
    pub async fn register(&self, server: &str, tool: Arc<dyn Tool>) {
        let full = format!("{}.{}", server, tool.name());
        let short = short_name(&full).to_string();
        debug!(name = %full, "tool registered");
        self.short_names.write().await.insert(short, full.clone());
        self.local.write().await.insert(full, tool);
    }

    /// Wires MCP servers into the registry. Until this is called, MCP
    /// tool names fail to resolve.
    pub async fn attach_mcp(&self, configs: Arc<McpConfigSet>, pool: Arc<McpClientPool>) {
        *self.mcp.write().await = Some(McpRouting { configs, pool });
    }

    /// Dispatches a call coming back from the model. `name` may be a short
    /// name from the advertised specs or a fully qualified `server.tool`.
    pub async fn call(&self, name: &str, args: &Value) -> anyhow::Result<String> {
        let full = match self.short_names.read().await.get(name) {
            Some(full) => full.clone(),
            None => name.to_string(),
        };

        let (server, tool_name) = full.split_once('.').ok_or_else(|| {
            AgentError::input("Invalid tool name format. Expected: server.tool".to_string())
        })?;

        if let Some(tool) = self.local.read().await.get(&full) {
            return tool.call(args).await;
        }

        let routing = self.mcp.read().await;
        let routing = routing.as_ref().ok_or_else(|| {
            AgentError::not_found(format!("Server configuration '{}' not found", server))
        })?;
        let config = routing.configs.get(server).await.ok_or_else(|| {
            AgentError::not_found(format!("Server configuration '{}' not found", server))
        })?;
        if !config.enabled {
            return Err(AgentError::not_found(format!("Server '{}' is disabled", server)).into());
        }

        let client = routing.pool.client_for(&config).await?;
        client.call_tool(tool_name, args.clone()).await
    }

    /// Builds the OpenAI-format tool definitions advertised to the model.
    /// MCP servers are queried here; a server that fails to connect or
    /// list its tools is skipped so one bad server cannot hide the rest.
    pub async fn llm_specs(&self) -> Vec<Value> {
        let mut specs = Vec::new();

        {
            let local = self.local.read().await;
            let mut entries: Vec<_> = local.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            for (full, tool) in entries {
                specs.push(json!({
                    "type": "function",
                    "function": {
                        "name": short_name(full),
                        "description": tool.description(),
                        "parameters": tool.schema(),
                    }
                }));
            }
        }

        let routing = self.mcp.read().await;
        let Some(routing) = routing.as_ref() else {
            return specs;
        };

        let mut catalog = Vec::new();
        for config in routing.configs.enabled().await {
            let client = match routing.pool.client_for(&config).await {
                Ok(client) => client,
                Err(err) => {
                    warn!(server = %config.name, error = %err, "skipping MCP server during discovery");
                    continue;
                }
            };
            let tools = match client.list_tools().await {
                Ok(tools) => tools,
                Err(err) => {
                    warn!(server = %config.name, error = %err, "MCP tool listing failed");
                    continue;
                }
            };

            for def in tools {
                let Some(tool_name) = def.get("name").and_then(Value::as_str) else {
                    continue;
                };
                let full = format!("{}.{}", config.name, tool_name);
                let short = short_name(&full).to_string();
                let description = def
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                let parameters = def
                    .get("inputSchema")
                    .cloned()
                    .unwrap_or_else(|| json!({ "type": "object", "properties": {} }));

                if let Some(previous) = self
                    .short_names
                    .write()
                    .await
                    .insert(short.clone(), full.clone())
                {
                    if previous != full {
                        debug!(short = %short, old = %previous, new = %full, "short tool name remapped");
                    }
                }
                catalog.push((short.clone(), description.clone()));
                specs.push(json!({
                    "type": "function",
                    "function": {
                        "name": short,
                        "description": description,
                        "parameters": parameters,
                    }
                }));
            }
        }
        *self.mcp_catalog.write().await = catalog;

        specs
    }

    /// One line per tool, for embedding in the system prompt. MCP entries
    /// reflect the last discovery pass.
    pub async fn catalog_text(&self) -> String {
        let mut lines = Vec::new();
        {
            let local = self.local.read().await;
            for (full, tool) in local.iter() {
                lines.push(format!("- {}: {}", short_name(full), tool.description()));
            }
        }
        for (name, description) in self.mcp_catalog.read().await.iter() {
            lines.push(format!("- {}: {}", name, description));
        }
        lines.sort();
        lines.join("\n")
    }
}

fn short_name(full: &str) -> &str {
    match full.rfind('.') {
        Some(idx) => &full[idx + 1..],
        None => full,
    }
}
