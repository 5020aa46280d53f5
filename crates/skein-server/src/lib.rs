//! Skein server: configuration, acceptor, worker loops and request routing
//! behind the `skeind` binary.

pub mod acceptor;
pub mod cli;
pub mod config;
pub mod error;
pub mod router;
pub mod server;
pub mod worker;

pub use config::ServerConfig;
pub use error::{Result, ServerError};
pub use router::Router;
pub use server::{Server, ServerHandle};
