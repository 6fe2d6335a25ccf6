//! Canopy server entry point.

use canopy::config::CanopyConfig;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "canopy", version, about = "A replicated coordination store")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a coordination server.
    Server {
        /// Path to the JSON configuration file.
        #[arg(long)]
        config: PathBuf,

        /// Override the node id from the config file.
        #[arg(long)]
        node_id: Option<u64>,

        /// Override the bind address from the config file.
        #[arg(long)]
        bind: Option<String>,

        /// Override the data directory from the config file.
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Run a single-node development server with throwaway storage.
    Dev {
        /// Data directory (defaults to /tmp/canopy-dev).
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Server {
            config,
            node_id,
            bind,
            data_dir,
        } => {
            let mut config = CanopyConfig::from_file(&config)?;
            if let Some(id) = node_id {
                config.node.id = id;
            }
            if let Some(bind) = bind {
                config.cluster.bind_addr = bind.parse()?;
            }
            if let Some(dir) = data_dir {
                config.storage.data_dir = dir;
            }
            config.observability.log_level = cli.log_level;
            config.validate()?;

            canopy::observability::init(&config.observability)?;
            canopy::run(config).await?;
        }

        Commands::Dev { data_dir } => {
            let mut config = CanopyConfig::development();
            if let Some(dir) = data_dir {
                config.storage.data_dir = dir;
            }
            config.observability.log_level = cli.log_level;

            canopy::observability::init(&config.observability)?;
            canopy::run(config).await?;
        }
    }

    Ok(())
}
