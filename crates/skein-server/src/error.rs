use skein_cluster::RegistryError;
use skein_transport::{ChannelError, SchedulerError, TransportError};
use thiserror::Error;

/// Failures that stop a worker or the acceptor.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("descriptor channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("worker {index} is gone")]
    WorkerGone { index: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ServerError>;
