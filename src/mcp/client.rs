use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

use crate::mcp::McpServerConfig;

pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

/// Maximum size (in bytes) for a single JSON-RPC response line.
/// Oversized lines are dropped; the waiting request times out.
const MAX_RESPONSE_BYTES: usize = 512 * 1024;

/// Environment variables passed through to MCP server subprocesses.
/// Everything else is stripped; a server that needs more gets it via
/// its config's `environment` map.
const SAFE_ENV_KEYS: &[&str] = &[
    "PATH",
    "HOME",
    "USER",
    "LANG",
    "LC_ALL",
    "LC_CTYPE",
    "TERM",
    "SHELL",
    "TMPDIR",
    "TMP",
    "TEMP",
    "XDG_RUNTIME_DIR",
    "XDG_DATA_HOME",
    "XDG_CONFIG_HOME",
    "XDG_CACHE_HOME",
    "NODE_PATH",
    "NPM_CONFIG_PREFIX",
    "NVM_DIR",
];

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>;

/// JSON-RPC client over stdio for the MCP protocol.
///
/// A background reader task demultiplexes response lines into per-request
/// oneshot waiters, so concurrent requests over one child are safe.
pub struct McpClient {
    name: String,
    stdin: Mutex<ChildStdin>,
    child: Mutex<Child>,
    pending: PendingMap,
    next_id: AtomicU64,
    request_timeout: Duration,
    connected: Arc<AtomicBool>,
}

impl McpClient {
    /// Spawn the server subprocess and run the initialize handshake.
    pub async fn connect(
        config: &McpServerConfig,
        request_timeout: Duration,
    ) -> anyhow::Result<Arc<Self>> {
        let safe_env: Vec<(String, String)> = std::env::vars()
            .filter(|(k, _)| SAFE_ENV_KEYS.iter().any(|safe| safe == k))
            .collect();

        let mut child = Command::new(&config.command)
            .args(&config.args)
            .env_clear()
            .envs(safe_env)
            .envs(&config.environment)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow::anyhow!("Failed to capture MCP server stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("Failed to capture MCP server stdout"))?;

        // Surface server-side errors instead of silently swallowing them.
        if let Some(stderr) = child.stderr.take() {
            let server = config.name.clone();
            tokio::spawn(async move {
                let mut reader = BufReader::new(stderr);
                let mut line = String::new();
                loop {
                    line.clear();
                    match reader.read_line(&mut line).await {
                        Ok(0) => break,
                        Ok(_) => {
                            let trimmed = line.trim_end();
                            if !trimmed.is_empty() {
                                warn!(mcp_server = %server, "{}", trimmed);
                            }
                        }
                        Err(_) => break,
                    }
                }
            });
        }

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let connected = Arc::new(AtomicBool::new(true));

        {
            let server = config.name.clone();
            let pending = pending.clone();
            let connected = connected.clone();
            tokio::spawn(async move {
                read_responses(server, BufReader::new(stdout), pending, connected).await;
            });
        }

        let client = Arc::new(Self {
            name: config.name.clone(),
            stdin: Mutex::new(stdin),
            child: Mutex::new(child),
            pending,
            next_id: AtomicU64::new(1),
            request_timeout,
            connected,
        });

        if let Err(err) = client.handshake().await {
            client.close().await;
            return Err(err);
        }

        debug!(server = %client.name, "MCP client connected");
        Ok(client)
    }

    async fn handshake(&self) -> anyhow::Result<()> {
        self.request(
            "initialize",
            json!({
                "protocolVersion": MCP_PROTOCOL_VERSION,
                "capabilities": {
                    "tools": {}
                },
                "clientInfo": {
                    "name": "agentd",
                    "version": env!("CARGO_PKG_VERSION"),
                }
            }),
        )
        .await?;

        self.notify("notifications/initialized", json!({})).await
    }

    /// Send a request and wait for its correlated response.
    pub async fn request(&self, method: &str, params: Value) -> anyhow::Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        if let Err(err) = self.write_line(&request).await {
            self.pending.lock().await.remove(&id);
            return Err(err);
        }

        let response = match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => {
                anyhow::bail!("MCP server '{}' closed the connection", self.name);
            }
            Err(_) => {
                self.pending.lock().await.remove(&id);
                anyhow::bail!(
                    "MCP RPC call '{}' timed out after {:?}",
                    method,
                    self.request_timeout
                );
            }
        };

        if let Some(error) = response.get("error") {
            anyhow::bail!("MCP error: {}", error);
        }
        Ok(response["result"].clone())
    }

    /// Fire-and-forget notification (no id, no response).
    async fn notify(&self, method: &str, params: Value) -> anyhow::Result<()> {
        let notification = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });
        self.write_line(&notification).await
    }

    async fn write_line(&self, message: &Value) -> anyhow::Result<()> {
        let mut line = serde_json::to_string(message)?;
        line.push('\n');
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    /// List the tools the server exposes, as raw spec entries.
    pub async fn list_tools(&self) -> anyhow::Result<Vec<Value>> {
        let result = self.request("tools/list", json!({})).await?;
        Ok(result["tools"].as_array().cloned().unwrap_or_default())
    }

    /// Call one tool. MCP returns content as an array of blocks; the text
    /// blocks are joined into the result string.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> anyhow::Result<String> {
        let result = self
            .request(
                "tools/call",
                json!({
                    "name": name,
                    "arguments": arguments,
                }),
            )
            .await?;

        if let Some(content) = result["content"].as_array() {
            let texts: Vec<&str> = content.iter().filter_map(|c| c["text"].as_str()).collect();
            Ok(texts.join("\n"))
        } else {
            Ok(result.to_string())
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Kill the child and fail every in-flight request.
    pub async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        {
            let mut child = self.child.lock().await;
            if let Err(err) = child.kill().await {
                debug!(server = %self.name, error = %err, "MCP child kill failed");
            }
        }
        // Dropping the waiters wakes their requests with a closed error.
        self.pending.lock().await.clear();
        debug!(server = %self.name, "MCP client closed");
    }
}

/// Reader task: routes response lines to waiters by id, logs
/// server-initiated notifications, and marks the client disconnected at
/// EOF.
async fn read_responses(
    server: String,
    mut reader: BufReader<tokio::process::ChildStdout>,
    pending: PendingMap,
    connected: Arc<AtomicBool>,
) {
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed.len() > MAX_RESPONSE_BYTES {
            warn!(server = %server, bytes = trimmed.len(), "Dropping oversized MCP response line");
            continue;
        }

        let message: Value = match serde_json::from_str(trimmed) {
            Ok(message) => message,
            Err(err) => {
                warn!(server = %server, error = %err, "Failed to parse MCP response line");
                continue;
            }
        };

        if let Some(id) = message["id"].as_u64() {
            if let Some(waiter) = pending.lock().await.remove(&id) {
                let _ = waiter.send(message);
            } else {
                debug!(server = %server, id, "MCP response with no waiter");
            }
        } else if let Some(method) = message["method"].as_str() {
            debug!(server = %server, method, "MCP server notification");
        }
    }

    connected.store(false, Ordering::SeqCst);
    // Wake anything still waiting; the child is gone.
    pending.lock().await.clear();
    debug!(server = %server, "MCP reader ended, connection closed");
}
