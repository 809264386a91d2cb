use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::mcp::{McpClient, McpServerConfig};

/// How often the background sweep drops disconnected clients.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// Persistent MCP connections keyed by server name. Handshakes run
/// outside the lock; a lost race closes the extra client.
pub struct McpClientPool {
    clients: RwLock<HashMap<String, Arc<McpClient>>>,
    request_timeout: Duration,
}

impl McpClientPool {
    pub fn new(request_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            clients: RwLock::new(HashMap::new()),
            request_timeout,
        })
    }

    /// A connected client for the server, reusing one when it is still
    /// alive and reconnecting otherwise.
    pub async fn client_for(&self, config: &McpServerConfig) -> anyhow::Result<Arc<McpClient>> {
        {
            let clients = self.clients.read().await;
            if let Some(existing) = clients.get(&config.name) {
                if existing.is_connected() {
                    return Ok(existing.clone());
                }
                debug!(server = %config.name, "Pooled MCP client is disconnected, reconnecting");
            }
        }

        let fresh = McpClient::connect(config, self.request_timeout).await.map_err(|err| {
            anyhow::anyhow!("failed to connect to MCP server {}: {}", config.name, err)
        })?;

        let mut clients = self.clients.write().await;
        if let Some(existing) = clients.get(&config.name) {
            if existing.is_connected() {
                // Another task connected first; keep theirs.
                fresh.close().await;
                return Ok(existing.clone());
            }
            existing.close().await;
        }
        clients.insert(config.name.clone(), fresh.clone());
        info!(server = %config.name, "MCP client connected and pooled");
        Ok(fresh)
    }

    /// Close and drop the client for one server, if pooled.
    pub async fn remove(&self, name: &str) {
        let removed = self.clients.write().await.remove(name);
        match removed {
            Some(client) => {
                client.close().await;
                info!(server = %name, "MCP client removed from pool");
            }
            None => debug!(server = %name, "No pooled MCP client to remove"),
        }
    }

    /// Drop every client whose connection has gone away.
    pub async fn cleanup_disconnected(&self) {
        let mut stale = Vec::new();
        {
            let mut clients = self.clients.write().await;
            let names: Vec<String> = clients
                .iter()
                .filter(|(_, c)| !c.is_connected())
                .map(|(name, _)| name.clone())
                .collect();
            for name in names {
                if let Some(client) = clients.remove(&name) {
                    stale.push(client);
                }
            }
        }
        for client in &stale {
            client.close().await;
        }
        if !stale.is_empty() {
            warn!(count = stale.len(), "Cleaned up disconnected MCP clients");
        }
    }

    /// Connection status per pooled server.
    pub async fn health_check(&self) -> HashMap<String, bool> {
        self.clients
            .read()
            .await
            .iter()
            .map(|(name, client)| (name.clone(), client.is_connected()))
            .collect()
    }

    pub async fn connected_count(&self) -> usize {
        self.clients
            .read()
            .await
            .values()
            .filter(|c| c.is_connected())
            .count()
    }

    /// Periodic sweep of dead connections. The handle is aborted on
    /// shutdown.
    pub fn start_sweep(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "MCP pool sweep started");
            loop {
                tokio::time::sleep(interval).await;
                pool.cleanup_disconnected().await;
            }
        })
    }

    /// Close everything. Used at daemon shutdown.
    pub async fn shutdown_all(&self) {
        let drained: Vec<Arc<McpClient>> = {
            let mut clients = self.clients.write().await;
            clients.drain().map(|(_, client)| client).collect()
        };
        for client in &drained {
            client.close().await;
        }
        info!(count = drained.len(), "MCP pool shut down");
    }
}
