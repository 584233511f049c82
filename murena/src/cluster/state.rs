//! An immutable snapshot of the known cluster topology.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tracing::debug;

use crate::cluster::metadata::PeerInfo;
use crate::cluster::node::{HealthState, Node};
use crate::network::connection::VerifiedKeyspaceName;
use crate::network::pool::PoolConfig;
use crate::routing::{Token, TokenRing};

/// Nodes known to the driver plus token ownership, published as an
/// immutable snapshot behind an `ArcSwap`.
///
/// Node *identity* is immutable in a snapshot; node *health* lives inside
/// each [Node] and changes without a snapshot swap.
#[derive(Debug, Default)]
pub struct ClusterState {
    nodes: Vec<Arc<Node>>,
    ring: TokenRing,
}

impl ClusterState {
    /// The state right after session creation: contact points only,
    /// no token information yet.
    pub(crate) fn new_initial(
        contact_points: &[SocketAddr],
        pool_config: &PoolConfig,
        keyspace: &Option<VerifiedKeyspaceName>,
    ) -> Self {
        let nodes = contact_points
            .iter()
            .map(|address| {
                Arc::new(Node::new(
                    PeerInfo::contact_point(*address),
                    pool_config,
                    keyspace.clone(),
                ))
            })
            .collect();

        ClusterState {
            nodes,
            ring: TokenRing::default(),
        }
    }

    /// Builds the next snapshot from freshly fetched peers, keeping the
    /// pools of nodes that are still present.
    pub(crate) fn with_peers(
        &self,
        peers: Vec<PeerInfo>,
        pool_config: &PoolConfig,
        keyspace: &Option<VerifiedKeyspaceName>,
    ) -> Self {
        let known: HashMap<SocketAddr, &Arc<Node>> = self
            .nodes
            .iter()
            .map(|node| (node.address, node))
            .collect();

        let mut ring_entries = Vec::new();
        let mut nodes = Vec::with_capacity(peers.len());
        for peer in peers {
            ring_entries.extend(peer.tokens.iter().map(|token| (*token, peer.host_id)));

            let node = match known.get(&peer.address) {
                Some(node) => Node::inherit_with_metadata(node, peer),
                None => {
                    debug!(address = %peer.address, "New peer discovered");
                    Node::new(peer, pool_config, keyspace.clone())
                }
            };
            nodes.push(Arc::new(node));
        }

        ClusterState {
            nodes,
            ring: TokenRing::new(ring_entries),
        }
    }

    /// All known nodes, regardless of health.
    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    pub(crate) fn node_by_host_id(&self, host_id: uuid::Uuid) -> Option<&Arc<Node>> {
        self.nodes.iter().find(|node| node.host_id == host_id)
    }

    pub(crate) fn node_by_address(&self, address: SocketAddr) -> Option<&Arc<Node>> {
        self.nodes.iter().find(|node| node.address == address)
    }

    /// The primary replica of the given token, if token ownership
    /// is known.
    pub(crate) fn token_owner(&self, token: Token) -> Option<&Arc<Node>> {
        let host_id = self.ring.owner(token)?;
        self.node_by_host_id(host_id)
    }

    pub(crate) fn has_token_information(&self) -> bool {
        !self.ring.is_empty()
    }

    /// Registry operation: mark the given node unreachable. No-op for
    /// unknown addresses.
    pub fn mark_down(&self, address: SocketAddr) {
        if let Some(node) = self.node_by_address(address) {
            node.mark_down();
        }
    }

    /// Registry operation: mark the given node reachable again.
    pub fn mark_up(&self, address: SocketAddr) {
        if let Some(node) = self.node_by_address(address) {
            node.mark_up();
        }
    }

    /// Nodes currently worth contacting: everything not marked DOWN.
    /// A node of unknown health has not proven unreachable, so it is
    /// a candidate.
    pub(crate) fn live_nodes(&self) -> impl Iterator<Item = &Arc<Node>> {
        self.nodes
            .iter()
            .filter(|node| node.health() != HealthState::Down)
    }
}

#[cfg(test)]
impl ClusterState {
    pub(crate) fn new_for_test(nodes: Vec<Arc<Node>>) -> Self {
        let ring_entries = nodes
            .iter()
            .flat_map(|node| node.tokens.iter().map(|t| (*t, node.host_id)))
            .collect();
        ClusterState {
            nodes,
            ring: TokenRing::new(ring_entries),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn test_state(node_tokens: &[(Uuid, &[i64])]) -> ClusterState {
        let nodes = node_tokens
            .iter()
            .enumerate()
            .map(|(i, (host_id, tokens))| {
                let address: SocketAddr = format!("10.0.0.{}:9042", i + 1).parse().unwrap();
                let tokens: Vec<Token> = tokens.iter().copied().map(Token::new).collect();
                Arc::new(Node::new_for_test(*host_id, address, tokens))
            })
            .collect();

        ClusterState::new_for_test(nodes)
    }

    #[test]
    fn token_owner_resolves_to_node() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let state = test_state(&[(a, &[0, 200]), (b, &[100])]);

        assert_eq!(state.token_owner(Token::new(-1)).unwrap().host_id, a);
        assert_eq!(state.token_owner(Token::new(50)).unwrap().host_id, b);
        assert_eq!(state.token_owner(Token::new(150)).unwrap().host_id, a);
        assert_eq!(state.token_owner(Token::new(201)).unwrap().host_id, a);
    }

    #[test]
    fn mark_down_excludes_node_from_live_set() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let state = test_state(&[(a, &[0]), (b, &[100])]);
        let down_addr = state.nodes()[0].address;

        assert_eq!(state.live_nodes().count(), 2);
        state.mark_down(down_addr);
        let live: Vec<_> = state.live_nodes().collect();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].host_id, b);

        state.mark_up(down_addr);
        assert_eq!(state.live_nodes().count(), 2);
    }
}
