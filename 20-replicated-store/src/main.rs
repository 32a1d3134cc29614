use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use replicated_store::{
    cli::{Cli, Command},
    client::StoreClient,
    console,
    coordinator::{CoordinatorService, RemoteCoordinator},
    node::NodeHandle,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

async fn ctrl_c() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = ?err, "failed to install ctrl-c handler");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Node(args) => {
            let listener = TcpListener::bind(args.listen)
                .await
                .with_context(|| format!("failed to bind {}", args.listen))?;
            let coordinator = Arc::new(RemoteCoordinator::new(args.coordinator.clone()));
            let handle = NodeHandle::start(args.config(), listener, coordinator).await?;
            info!(
                "store node {} listening on {}",
                handle.node().address(),
                handle.local_addr()
            );
            ctrl_c().await;
            handle.shutdown().await?;
        }
        Command::Coordinator(args) => {
            let listener = TcpListener::bind(args.listen).await?;
            info!("coordinator listening on {}", listener.local_addr()?);
            if let Err(err) = CoordinatorService::new().serve(listener, ctrl_c()).await {
                warn!("coordinator exited with error: {err:?}");
                return Err(err);
            }
        }
        Command::Client(args) => {
            let coordinator = RemoteCoordinator::new(args.coordinator);
            let client = StoreClient::from_coordinator(&coordinator).await?;
            console::run(client).await?;
        }
    }

    Ok(())
}
