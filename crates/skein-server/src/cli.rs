use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

use crate::config::ServerConfig;

#[derive(Parser, Debug)]
#[command(name = "skeind")]
#[command(about = "Skein multi-worker TCP/HTTP server", long_about = None)]
pub struct Cli {
    #[arg(short, long, env = "SKEIN_CONFIG", default_value = "/etc/skein/skeind.toml")]
    pub config: PathBuf,

    /// Overrides `bind_addr` from the config file.
    #[arg(short, long)]
    pub bind: Option<SocketAddr>,

    /// Overrides `workers` from the config file.
    #[arg(short, long)]
    pub workers: Option<usize>,
}

impl Cli {
    /// Applies command-line overrides on top of a loaded config.
    pub fn apply(&self, config: &mut ServerConfig) {
        if let Some(bind) = self.bind {
            config.bind_addr = bind;
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
    }
}
