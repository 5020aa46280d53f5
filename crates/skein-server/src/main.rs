use anyhow::Result;
use clap::Parser;
use skein_server::cli::Cli;
use skein_server::{Server, ServerConfig};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn main() -> Result<()> {
    let cli = Cli::parse();
    let found = cli.config.exists();
    let mut config = if found {
        ServerConfig::from_file(&cli.config)?
    } else {
        ServerConfig::default()
    };
    cli.apply(&mut config);

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    if !found {
        tracing::warn!("Config file not found, using defaults: {}", cli.config.display());
    }
    config.validate()?;

    tracing::info!("skeind starting...");
    Server::new(config).spawn()?.wait()
}
