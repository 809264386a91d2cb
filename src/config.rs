use serde::Deserialize;
use tracing::warn;

use crate::store::DocumentStore;

/// Store document holding the runtime configuration, owned by the admin
/// account. Missing document or missing keys fall back to defaults;
/// `DEEPSEEK_API_KEY` / `DEEPSEEK_API_URL` env vars override the stored
/// credential fields last.
pub const CONFIG_DOC_TITLE: &str = "agent_config";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub mcp: McpConfig,
    #[serde(default)]
    pub context: ContextConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProviderConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_model")]
    pub model: String,
}

fn default_endpoint() -> String {
    "https://api.deepseek.com/v1/chat/completions".to_string()
}

fn default_model() -> String {
    "deepseek-chat".to_string()
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            endpoint: default_endpoint(),
            model: default_model(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PoolConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_workers() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    100
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
}

fn default_tick_secs() -> u64 {
    1
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_secs: default_tick_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct McpConfig {
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_sweep_interval_secs() -> u64 {
    300
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

/// Character-count caps applied to the conversation before every LLM call.
#[derive(Debug, Deserialize, Clone)]
pub struct ContextConfig {
    #[serde(default = "default_max_message_chars")]
    pub max_message_chars: usize,
    #[serde(default = "default_max_total_chars")]
    pub max_total_chars: usize,
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
    #[serde(default = "default_max_tool_result_chars")]
    pub max_tool_result_chars: usize,
    #[serde(default = "default_max_tool_arg_chars")]
    pub max_tool_arg_chars: usize,
}

fn default_max_message_chars() -> usize {
    8000
}

fn default_max_total_chars() -> usize {
    200_000
}

fn default_max_messages() -> usize {
    60
}

fn default_max_tool_result_chars() -> usize {
    4000
}

fn default_max_tool_arg_chars() -> usize {
    4000
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_message_chars: default_max_message_chars(),
            max_total_chars: default_max_total_chars(),
            max_messages: default_max_messages(),
            max_tool_result_chars: default_max_tool_result_chars(),
            max_tool_arg_chars: default_max_tool_arg_chars(),
        }
    }
}

impl AppConfig {
    /// Load from the admin account's `agent_config` document, then apply
    /// env overrides. A missing or unparsable document yields defaults.
    pub async fn load(store: &dyn DocumentStore, admin_account: &str) -> Self {
        let mut config = match store.get_document(admin_account, CONFIG_DOC_TITLE).await {
            Some(doc) => match serde_json::from_str::<AppConfig>(&doc.content) {
                Ok(c) => c,
                Err(e) => {
                    warn!(error = %e, "Config document is not valid JSON, using defaults");
                    AppConfig::default()
                }
            },
            None => AppConfig::default(),
        };
        config.apply_env_overrides();
        config
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(key) = std::env::var("DEEPSEEK_API_KEY") {
            if !key.is_empty() {
                self.provider.api_key = key;
            }
        }
        if let Ok(url) = std::env::var("DEEPSEEK_API_URL") {
            if !url.is_empty() {
                self.provider.endpoint = url;
            }
        }
    }
}
