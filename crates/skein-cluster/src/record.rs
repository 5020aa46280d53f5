//! Authoritative node records as published by the coordination service.

use serde::{Deserialize, Serialize};

use crate::error::{RegistryError, Result};

/// One registration from the coordination service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Unique registration path.
    pub path: String,
    /// Host the node listens on.
    pub host: String,
    /// Port the node listens on.
    pub port: u16,
    /// Node type tag.
    #[serde(rename = "type")]
    pub node_type: String,
    /// Number of worker processes; workers are numbered `1..=worker_cnt`.
    pub worker_cnt: u32,
    /// When the registration became active; larger is newer.
    pub active_time: u64,
}

impl NodeRecord {
    /// Checks that every required field is present.
    pub fn validate(&self) -> Result<()> {
        let reason = if self.path.is_empty() {
            "path is empty"
        } else if self.host.is_empty() {
            "host is empty"
        } else if self.port == 0 {
            "port is zero"
        } else if self.node_type.is_empty() {
            "type is empty"
        } else if self.worker_cnt == 0 {
            "worker_cnt is zero"
        } else if self.active_time == 0 {
            "active_time is zero"
        } else {
            return Ok(());
        };
        Err(RegistryError::InvalidRecord {
            path: self.path.clone(),
            reason,
        })
    }

    /// `host:port`, the key under which at most one record may be live.
    pub fn host_port(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Identity of one worker of this node.
    pub fn identity(&self, worker_index: u32) -> String {
        node_identity(&self.host, self.port, worker_index)
    }
}

/// `"<host>:<port>.<worker_index>"`.
pub fn node_identity(host: &str, port: u16, worker_index: u32) -> String {
    format!("{host}:{port}.{worker_index}")
}
