use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use mini_dfs::{
    cli::{Cli, Command},
    client,
    coordinator::Coordinator,
    storage::StorageNode,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Coordinator(args) => {
            let coordinator = Coordinator::bind(args.into_config()).await?;
            info!("coordinator listening on {}", coordinator.local_addr()?);
            if let Err(err) = coordinator.run_until_ctrl_c().await {
                warn!("coordinator exited with error: {err:?}");
                return Err(err);
            }
        }
        Command::Storage(args) => {
            let node = StorageNode::bind(args.into_config()).await?;
            info!("storage node listening on {}", node.local_addr()?);
            if let Err(err) = node.run_until_ctrl_c().await {
                warn!("storage node exited with error: {err:?}");
                return Err(err);
            }
        }
        Command::Client(args) => client::run(args).await?,
    }

    Ok(())
}
