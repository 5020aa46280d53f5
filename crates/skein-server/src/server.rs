//! Process wiring: binds the listener, then starts one thread per worker,
//! the optional membership feed and the acceptor.

use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Context;
use skein_cluster::{CoordinationBridge, MembershipFile, MembershipHandle};
use skein_transport::channel_pair;
use tracing::{error, info};

use crate::acceptor::Acceptor;
use crate::config::ServerConfig;
use crate::worker::Worker;

/// Wires the listener, worker threads and membership feed together.
pub struct Server {
    config: ServerConfig,
}

/// A running server.
pub struct ServerHandle {
    local_addr: SocketAddr,
    acceptor: JoinHandle<crate::error::Result<()>>,
    workers: Vec<JoinHandle<()>>,
    _membership: Option<MembershipHandle>,
}

impl Server {
    /// Server for `config`. Nothing is bound until [`spawn`](Self::spawn).
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    /// Binds, starts every thread and returns immediately.
    pub fn spawn(self) -> anyhow::Result<ServerHandle> {
        let listener = TcpListener::bind(self.config.bind_addr)
            .with_context(|| format!("failed to bind {}", self.config.bind_addr))?;
        let local_addr = listener.local_addr()?;
        let self_record = self.config.self_record(local_addr.port());
        let config = Arc::new(self.config);

        let mut senders = Vec::with_capacity(config.workers);
        let mut bridges = Vec::with_capacity(config.workers);
        let mut workers = Vec::with_capacity(config.workers);
        for index in 0..config.workers {
            let (tx, rx) = channel_pair()?;
            let bridge = CoordinationBridge::new();
            let worker = Worker::new(
                index,
                Arc::clone(&config),
                rx,
                bridge.clone(),
                self_record.clone(),
            );
            let handle = thread::Builder::new()
                .name(format!("skein-worker-{index}"))
                .spawn(move || {
                    if let Err(e) = worker.run() {
                        error!(worker = index, error = %e, "worker failed");
                    }
                })?;
            senders.push(tx);
            bridges.push(bridge);
            workers.push(handle);
        }

        let membership = match &config.membership_file {
            Some(path) => {
                let mut feed = MembershipFile::new(
                    path.clone(),
                    Duration::from_secs(config.membership_poll_secs),
                );
                for bridge in &bridges {
                    feed.subscribe(bridge.clone());
                }
                Some(feed.spawn()?)
            }
            None => None,
        };

        let acceptor = Acceptor::new(listener, senders, config.codec);
        let acceptor = thread::Builder::new()
            .name("skein-acceptor".to_string())
            .spawn(move || acceptor.run())?;

        info!(
            addr = %local_addr,
            workers = config.workers,
            codec = config.codec.name(),
            identity = %self_record.identity(1),
            "skeind listening"
        );
        Ok(ServerHandle {
            local_addr,
            acceptor,
            workers,
            _membership: membership,
        })
    }
}

impl ServerHandle {
    /// Address the listener is bound to; the real port when configured with 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of worker threads still running.
    pub fn live_workers(&self) -> usize {
        self.workers.iter().filter(|w| !w.is_finished()).count()
    }

    /// Blocks until the acceptor stops, which only happens when a worker
    /// has died.
    pub fn wait(self) -> anyhow::Result<()> {
        match self.acceptor.join() {
            Ok(result) => result.context("acceptor stopped"),
            Err(_) => anyhow::bail!("acceptor thread panicked"),
        }
    }
}
