use std::path::PathBuf;

use clap::Parser;
use tracing::info;

use tx_dispatcher::{app, config, logging, shutdown::Shutdown};

#[derive(Debug, Parser)]
#[clap(version, about = "Single-sender Ethereum transaction dispatch service")]
struct Args {
    /// Env file loaded before reading the environment.
    #[clap(long)]
    env_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    match &args.env_file {
        Some(path) => {
            dotenvy::from_path(path)?;
        }
        None => {
            dotenvy::dotenv().ok();
        }
    }

    let config = config::load_config()?;
    logging::init(&config);

    info!("Starting tx-dispatcher");
    info!("Configuration:\n{}", config);

    let shutdown = Shutdown::new();
    shutdown.watch_signals();

    app::run(config, shutdown).await
}
