#![warn(missing_docs)]

//! Skein cluster: consistent-hash node registry fed by an external
//! coordination service.

pub mod bridge;
pub mod error;
pub mod hash;
pub mod membership;
pub mod record;
pub mod registry;

pub use bridge::{CoordinationBridge, CoordinationEvent};
pub use error::{RegistryError, Result};
pub use hash::HashAlgorithm;
pub use membership::{MembershipFile, MembershipHandle};
pub use record::{node_identity, NodeRecord};
pub use registry::{MembershipDiff, NodeRegistry, PhysicalNode, RegistryConfig};
