use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use skein_cluster::{NodeRecord, RegistryConfig};
use skein_transport::{CodecKind, ConnectionConfig, SchedulerConfig};

/// Daemon configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub workers: usize,
    pub codec: CodecKind,
    pub keep_alive_secs: u64,
    pub max_tasks: usize,
    pub node_type: String,
    pub node_host: String,
    /// Advertised port; 0 advertises the bound port.
    pub node_port: u16,
    pub registry: RegistryConfig,
    pub membership_file: Option<PathBuf>,
    pub membership_poll_secs: u64,
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 7400)),
            workers: 4,
            codec: CodecKind::Binary,
            keep_alive_secs: 60,
            max_tasks: 100_000,
            node_type: String::from("logic"),
            node_host: String::from("127.0.0.1"),
            node_port: 0,
            registry: RegistryConfig::default(),
            membership_file: None,
            membership_poll_secs: 5,
            log_level: String::from("info"),
        }
    }
}

impl ServerConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => Ok(toml::from_str(&contents)?),
            "json" => Ok(serde_json::from_str(&contents)?),
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.workers == 0 {
            anyhow::bail!("workers must be at least 1");
        }
        if self.workers > u32::MAX as usize {
            anyhow::bail!("workers out of range: {}", self.workers);
        }
        if self.max_tasks == 0 {
            anyhow::bail!("max_tasks must be at least 1");
        }
        if self.node_type.is_empty() {
            anyhow::bail!("node_type must not be empty");
        }
        if self.node_host.is_empty() {
            anyhow::bail!("node_host must not be empty");
        }
        if self.registry.vnode_count == 0 {
            anyhow::bail!("registry.vnode_count must be at least 1");
        }
        if self.membership_file.is_some() && self.membership_poll_secs == 0 {
            anyhow::bail!("membership_poll_secs must be at least 1");
        }
        Ok(())
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            keep_alive: Duration::from_secs(self.keep_alive_secs),
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_tasks: self.max_tasks,
        }
    }

    /// The record this daemon registers for itself, one worker per
    /// scheduler thread.
    pub fn self_record(&self, bound_port: u16) -> NodeRecord {
        let port = if self.node_port == 0 {
            bound_port
        } else {
            self.node_port
        };
        let active_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(1, |d| d.as_millis().max(1) as u64);
        NodeRecord {
            path: format!("/skein/{}/{}:{}", self.node_type, self.node_host, port),
            host: self.node_host.clone(),
            port,
            node_type: self.node_type.clone(),
            worker_cnt: self.workers as u32,
            active_time,
        }
    }
}
