//! Daemon bootstrap: builds every subsystem in dependency order, owns
//! the background loops, and runs the ordered shutdown.
//!
//! The process normally holds one daemon behind [`install`]/[`global`];
//! tests construct isolated instances with [`Daemon::build`] and never
//! touch the global.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::AppConfig;
use crate::hub::NotificationHub;
use crate::llm::chat::ChatSession;
use crate::llm::sanitize::ContextLimits;
use crate::mcp::{McpClientPool, McpConfigSet};
use crate::planner::Planner;
use crate::providers::OpenAiCompatibleProvider;
use crate::registry::ToolRegistry;
use crate::reports::ReportGenerator;
use crate::scheduler::Scheduler;
use crate::storage::StorageRegistry;
use crate::store::DocumentStore;
use crate::tools::{docs, reminders};
use crate::traits::ModelProvider;
use crate::worker::WorkerPool;

/// Account that owns the shared configuration documents (`agent_config`,
/// `mcp_config`).
pub const ADMIN_ACCOUNT: &str = "admin";

static GLOBAL: OnceLock<Arc<Daemon>> = OnceLock::new();

/// Installs a daemon as the process-wide instance. The first install
/// wins; later calls return the instance already in place.
pub fn install(daemon: Arc<Daemon>) -> Arc<Daemon> {
    GLOBAL.get_or_init(|| daemon).clone()
}

pub fn global() -> Option<Arc<Daemon>> {
    GLOBAL.get().cloned()
}

pub struct Daemon {
    config: AppConfig,
    store: Arc<dyn DocumentStore>,
    hub: Arc<NotificationHub>,
    storages: Arc<StorageRegistry>,
    registry: Arc<ToolRegistry>,
    mcp_pool: Arc<McpClientPool>,
    mcp_configs: Arc<McpConfigSet>,
    chat: Arc<ChatSession>,
    reports: Arc<ReportGenerator>,
    pool: Arc<WorkerPool>,
    scheduler: Arc<Scheduler>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Daemon {
    /// Builds the full stack over `store`, reading the runtime
    /// configuration from the admin account's config document.
    pub async fn build(store: Arc<dyn DocumentStore>) -> anyhow::Result<Arc<Self>> {
        let config = AppConfig::load(store.as_ref(), ADMIN_ACCOUNT).await;
        Self::build_with(store, config).await
    }

    /// Builds the full stack with an explicit configuration. Nothing is
    /// spawned here besides the hub coordinator and the pool workers; the
    /// scheduler and MCP sweep start in [`Daemon::start`].
    pub async fn build_with(
        store: Arc<dyn DocumentStore>,
        config: AppConfig,
    ) -> anyhow::Result<Arc<Self>> {
        let provider: Arc<dyn ModelProvider> = Arc::new(
            OpenAiCompatibleProvider::new(
                &config.provider.endpoint,
                &config.provider.api_key,
                &config.provider.model,
            )
            .map_err(|e| anyhow::anyhow!(e))?,
        );

        let hub = NotificationHub::new();
        let storages = StorageRegistry::new(Arc::clone(&store));
        let registry = ToolRegistry::new();

        let mcp_pool = McpClientPool::new(Duration::from_secs(config.mcp.request_timeout_secs));
        let mcp_configs =
            McpConfigSet::load(Arc::clone(&store), ADMIN_ACCOUNT, Arc::clone(&mcp_pool)).await;
        registry
            .attach_mcp(Arc::clone(&mcp_configs), Arc::clone(&mcp_pool))
            .await;

        let chat = Arc::new(ChatSession::new(
            provider.clone(),
            Arc::clone(&registry),
            Arc::clone(&store),
            config.provider.model.clone(),
            ContextLimits::from(&config.context),
        ));
        let planner = Arc::new(Planner::new(
            provider.clone(),
            Arc::clone(&registry),
            config.provider.model.clone(),
        ));
        let reports = ReportGenerator::new(
            provider,
            Arc::clone(&registry),
            Arc::clone(&store),
            Arc::clone(&storages),
            Arc::clone(&hub),
            config.provider.model.clone(),
        );
        let pool = WorkerPool::new(
            &config.pool,
            Arc::clone(&storages),
            Arc::clone(&hub),
            Arc::clone(&chat),
            planner,
            Arc::clone(&reports),
        );
        let scheduler = Scheduler::new(
            &config.scheduler,
            Arc::clone(&store),
            Arc::clone(&hub),
            Arc::clone(&pool),
        );

        docs::register_all(&registry, &store).await;
        reminders::register_all(&registry, &scheduler, &hub, &reports).await;

        info!(
            model = %config.provider.model,
            workers = config.pool.workers,
            "daemon built"
        );
        Ok(Arc::new(Self {
            config,
            store,
            hub,
            storages,
            registry,
            mcp_pool,
            mcp_configs,
            chat,
            reports,
            pool,
            scheduler,
            background: Mutex::new(Vec::new()),
        }))
    }

    /// Starts the background loops: scheduler ticks, the MCP connection
    /// sweep, and the registration watcher that activates an account when
    /// its first client connects.
    pub async fn start(self: &Arc<Self>) {
        self.scheduler.start();
        let sweep = self
            .mcp_pool
            .start_sweep(Duration::from_secs(self.config.mcp.sweep_interval_secs));

        let events = self.hub.registration_events().await;
        let daemon = Arc::clone(self);
        let watcher = tokio::spawn(async move {
            daemon.watch_registrations(events).await;
        });

        self.background.lock().await.extend([sweep, watcher]);
        info!("daemon started");
    }

    async fn watch_registrations(&self, mut events: mpsc::Receiver<String>) {
        while let Some(account) = events.recv().await {
            self.activate_account(&account).await;
        }
    }

    /// Per-connection account setup: make sure the standing report
    /// entries exist, push the reminder sync, and re-queue pending tasks
    /// recovered from a previous run. Idempotent.
    pub async fn activate_account(&self, account: &str) {
        self.scheduler.register_report_entries(account).await;
        self.scheduler.sync_reminders(account).await;
        let recovered = self.pool.resubmit_pending(account).await;
        info!(account, recovered, "account activated");
    }

    /// Ordered shutdown: scheduler first so nothing new fires, then the
    /// pool drains its running tasks, then MCP children, then the hub.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
        self.pool.shutdown().await;
        for handle in self.background.lock().await.drain(..) {
            handle.abort();
        }
        self.mcp_pool.shutdown_all().await;
        self.hub.shutdown().await;
        info!("daemon stopped");
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn hub(&self) -> &Arc<NotificationHub> {
        &self.hub
    }

    pub fn storages(&self) -> &Arc<StorageRegistry> {
        &self.storages
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn mcp_configs(&self) -> &Arc<McpConfigSet> {
        &self.mcp_configs
    }

    pub fn chat(&self) -> &Arc<ChatSession> {
        &self.chat
    }

    pub fn reports(&self) -> &Arc<ReportGenerator> {
        &self.reports
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }
}
