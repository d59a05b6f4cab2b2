use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use shopkeep::cli::{load_config, run_command, Cli};

#[tokio::main]
async fn main() -> Result<()> {
    // Values from .env must be visible before clap reads env-backed flags
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let config = load_config(&cli)?;

    // An explicit --log-level wins over RUST_LOG; SHOPKEEP_LOG is already in the config
    let filter = match &cli.log_level {
        Some(level) => tracing_subscriber::EnvFilter::new(level),
        None => tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level)),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::debug!("shopkeep v{}", env!("CARGO_PKG_VERSION"));

    run_command(&cli, config).await
}
