//! Cluster topology: known nodes, their health, and token ownership.

pub mod metadata;
pub mod node;
pub mod state;

pub use node::{HealthState, KnownNode, Node, NodeRef};
pub use state::ClusterState;

use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use arc_swap::ArcSwap;
use futures::future::join_all;
use tracing::debug;

use crate::errors::{ConnectionPoolError, MetadataError, UseKeyspaceError};
use crate::network::connection::VerifiedKeyspaceName;
use crate::network::pool::PoolConfig;

/// Owner of the topology registry: publishes [ClusterState] snapshots
/// and applies refreshes and keyspace changes to them.
pub(crate) struct Cluster {
    state: ArcSwap<ClusterState>,
    pool_config: PoolConfig,
    // Keyspace applied to pools of nodes discovered in future refreshes.
    keyspace: RwLock<Option<VerifiedKeyspaceName>>,
}

impl Cluster {
    pub(crate) fn new(
        contact_points: &[SocketAddr],
        pool_config: PoolConfig,
        keyspace: Option<VerifiedKeyspaceName>,
    ) -> Self {
        let initial = ClusterState::new_initial(contact_points, &pool_config, &keyspace);
        Cluster {
            state: ArcSwap::from_pointee(initial),
            pool_config,
            keyspace: RwLock::new(keyspace),
        }
    }

    pub(crate) fn get_state(&self) -> Arc<ClusterState> {
        self.state.load_full()
    }

    /// Waits until every contact-point pool finished its first connection
    /// round, then checks that at least one node is reachable.
    pub(crate) async fn wait_for_initial_connection(&self) -> Result<(), ConnectionPoolError> {
        let state = self.get_state();
        join_all(
            state
                .nodes()
                .iter()
                .map(|node| node.wait_until_pool_initialized()),
        )
        .await;

        let mut last_error = None;
        for node in state.nodes() {
            match node.get_random_connection() {
                Ok(_) => return Ok(()),
                Err(err) => last_error = Some(err),
            }
        }
        Err(last_error.unwrap_or(ConnectionPoolError::Initializing))
    }

    /// Fetches peers and token ownership over any working connection and
    /// publishes a new state snapshot. Pools of surviving nodes are kept.
    pub(crate) async fn refresh_metadata(&self) -> Result<(), MetadataError> {
        let state = self.get_state();

        let mut last_error: Option<MetadataError> = None;
        for node in state.nodes() {
            let connection = match node.get_random_connection() {
                Ok(connection) => connection,
                Err(err) => {
                    last_error = Some(err.into());
                    continue;
                }
            };

            match metadata::fetch_peers(&connection).await {
                Ok(peers) => {
                    debug!("Refreshed metadata, {} peers known", peers.len());
                    let keyspace = self.keyspace.read().unwrap().clone();
                    let new_state = state.with_peers(peers, &self.pool_config, &keyspace);
                    self.state.store(Arc::new(new_state));
                    return Ok(());
                }
                Err(err) => last_error = Some(err),
            }
        }

        Err(last_error.unwrap_or(MetadataError::ConnectionPoolError(
            ConnectionPoolError::Initializing,
        )))
    }

    /// Switches every node pool, present and future, to the keyspace.
    pub(crate) async fn use_keyspace(
        &self,
        keyspace: VerifiedKeyspaceName,
    ) -> Result<(), UseKeyspaceError> {
        *self.keyspace.write().unwrap() = Some(keyspace.clone());

        let state = self.get_state();
        let switches = state
            .nodes()
            .iter()
            .map(|node| node.use_keyspace(keyspace.clone()));
        join_all(switches)
            .await
            .into_iter()
            .collect::<Result<(), _>>()
    }
}
