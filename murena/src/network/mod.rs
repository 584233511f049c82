//! Connections to nodes and per-node connection pools.

pub(crate) mod connection;
pub(crate) mod pool;

pub use connection::VerifiedKeyspaceName;
pub use pool::{PoolSize, ReconnectBackoff};
