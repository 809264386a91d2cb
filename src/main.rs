mod config;
mod daemon;
mod error;
#[allow(dead_code)]
mod graph;
mod hub;
mod llm;
mod mcp;
mod planner;
mod providers;
mod registry;
mod reports;
mod scheduler;
mod storage;
mod store;
mod task;
mod tools;
mod traits;
mod types;
mod worker;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use crate::store::{DocumentStore, MemoryStore};

fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Handle CLI arguments
    let args: Vec<String> = std::env::args().collect();
    if args.len() > 1 {
        match args[1].as_str() {
            "--version" | "-V" => {
                println!("agentd {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            "--help" | "-h" => {
                println!("agentd {}", env!("CARGO_PKG_VERSION"));
                println!("{}\n", env!("CARGO_PKG_DESCRIPTION"));
                println!("Usage: agentd\n");
                println!("Options:");
                println!("  -h, --help       Print help");
                println!("  -V, --version    Print version");
                return Ok(());
            }
            other => {
                eprintln!("Unknown argument: '{}'. Try --help.", other);
                std::process::exit(1);
            }
        }
    }

    // Run async
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run())
}

async fn run() -> anyhow::Result<()> {
    let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
    let daemon = daemon::install(daemon::Daemon::build(store).await?);
    daemon.start().await;
    tracing::info!("agentd {} running, Ctrl-C to stop", env!("CARGO_PKG_VERSION"));

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");
    daemon.shutdown().await;
    Ok(())
}
