use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chunkup_coordinator::{Coordinator, CoordinatorConfig, spawn_sweeper};
use chunkup_data_channel::CoordinatorServer;
use clap::Args;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{DEFAULT_ADDR, load_config};

#[derive(Args)]
pub struct ServeArgs {
    /// Address to listen on.
    #[arg(long, default_value = DEFAULT_ADDR)]
    pub addr: String,

    /// Storage root (overrides the config file).
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// JSON coordinator config.
    #[arg(long)]
    pub config: Option<PathBuf>,
}

pub async fn run(args: ServeArgs) -> Result<()> {
    let mut config = load_config(args.config.as_deref(), CoordinatorConfig::from_file);
    if let Some(root) = args.root {
        config.root_dir = root;
    }

    let coordinator = Arc::new(
        Coordinator::open(config.clone())
            .await
            .with_context(|| format!("opening storage at {}", config.root_dir.display()))?,
    );
    info!(
        root = %config.root_dir.display(),
        tasks = coordinator.active_tasks(),
        retention = ?config.retention,
        "coordinator ready"
    );

    let cancel = CancellationToken::new();
    let sweeper = spawn_sweeper(Arc::clone(&coordinator), cancel.clone());
    let listener = CoordinatorServer::bind(&args.addr)
        .await
        .with_context(|| format!("binding {}", args.addr))?;
    let server = CoordinatorServer::new(coordinator, cancel.clone());

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutting down");
            shutdown.cancel();
        }
    });

    server.serve(listener).await?;
    sweeper.await?;
    Ok(())
}
