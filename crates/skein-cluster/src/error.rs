//! Error types for the cluster registry.

use thiserror::Error;

/// Registry and coordination-feed errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// An authoritative record is missing a required field.
    #[error("invalid node record {path:?}: {reason}")]
    InvalidRecord {
        /// Registration path of the record (may be empty).
        path: String,
        /// Which field failed validation.
        reason: &'static str,
    },

    /// A record is not newer than the live record already held for its
    /// host:port.
    #[error("stale node record {path} for {host_port}: active_time {active_time} <= {current_active_time} of {current_path}")]
    StaleRecord {
        /// Rejected record's path.
        path: String,
        /// Contended host:port.
        host_port: String,
        /// Rejected record's active time.
        active_time: u64,
        /// Path of the record that stays live.
        current_path: String,
        /// Its active time.
        current_active_time: u64,
    },

    /// Every virtual node of a new physical node collided with an existing one.
    #[error("all virtual nodes of {identity} collide with existing entries")]
    VnodeCollision {
        /// Node identity.
        identity: String,
    },

    /// An unrecognised hash algorithm name.
    #[error("unknown hash algorithm: {0}")]
    UnknownAlgorithm(String),

    /// Reading a membership source failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A membership source was not valid JSON.
    #[error("membership parse error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;
