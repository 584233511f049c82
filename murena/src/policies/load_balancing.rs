//! Coordinator selection: turning the cluster state into an ordered
//! list of candidate nodes for a request.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use murena_cql::frame::types::{Consistency, SerialConsistency};

use crate::cluster::node::Node;
use crate::cluster::state::ClusterState;
use crate::routing::Token;

/// Routing information of a single request.
#[derive(Debug, Clone, Copy, Default)]
pub struct RoutingInfo {
    pub consistency: Consistency,
    pub serial_consistency: Option<SerialConsistency>,
    /// Token of the partition the request touches, when computable.
    pub token: Option<Token>,
}

/// Produces an ordered candidate plan for a request. The execution
/// engine walks the plan front to back, advancing on retryable errors.
pub trait LoadBalancingPolicy: std::fmt::Debug + Send + Sync {
    fn plan(&self, routing: &RoutingInfo, cluster: &ClusterState) -> Vec<Arc<Node>>;
}

/// The default policy: round-robin over nodes not marked DOWN, with the
/// owning replica moved to the front when the routing token and the
/// token ring are known.
#[derive(Debug, Default)]
pub struct DefaultPolicy {
    round_robin_index: AtomicUsize,
}

impl DefaultPolicy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancingPolicy for DefaultPolicy {
    fn plan(&self, routing: &RoutingInfo, cluster: &ClusterState) -> Vec<Arc<Node>> {
        let live: Vec<Arc<Node>> = cluster.live_nodes().cloned().collect();
        if live.is_empty() {
            return Vec::new();
        }

        let start = self.round_robin_index.fetch_add(1, Ordering::Relaxed) % live.len();
        let mut plan: Vec<Arc<Node>> = live[start..]
            .iter()
            .chain(live[..start].iter())
            .cloned()
            .collect();

        if let Some(token) = routing.token {
            if let Some(owner) = cluster.token_owner(token) {
                if let Some(pos) = plan.iter().position(|node| node.host_id == owner.host_id) {
                    plan[..=pos].rotate_right(1);
                } else if !owner.is_down() {
                    plan.insert(0, Arc::clone(owner));
                }
            }
        }

        plan
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::net::SocketAddr;

    use uuid::Uuid;

    use super::*;
    use crate::routing::Token;

    fn make_cluster(n: usize, tokens_per_node: &[&[i64]]) -> ClusterState {
        let nodes = (0..n)
            .map(|i| {
                let address: SocketAddr = format!("10.0.0.{}:9042", i + 1).parse().unwrap();
                let tokens = tokens_per_node
                    .get(i)
                    .map(|ts| ts.iter().copied().map(Token::new).collect())
                    .unwrap_or_default();
                Arc::new(Node::new_for_test(Uuid::new_v4(), address, tokens))
            })
            .collect::<Vec<_>>();
        ClusterState::new_for_test(nodes)
    }

    #[test]
    fn round_robin_rotates_over_all_nodes() {
        let cluster = make_cluster(3, &[]);
        let policy = DefaultPolicy::new();
        let routing = RoutingInfo::default();

        let mut first_candidates = HashSet::new();
        for _ in 0..3 {
            let plan = policy.plan(&routing, &cluster);
            assert_eq!(plan.len(), 3);
            first_candidates.insert(plan[0].address);
        }

        // Each of the three consecutive plans starts at a different node.
        assert_eq!(first_candidates.len(), 3);
    }

    #[test]
    fn down_nodes_are_not_planned() {
        let cluster = make_cluster(3, &[]);
        let down_address = cluster.nodes()[1].address;
        cluster.mark_down(down_address);

        let policy = DefaultPolicy::new();
        let routing = RoutingInfo::default();
        for _ in 0..4 {
            let plan = policy.plan(&routing, &cluster);
            assert_eq!(plan.len(), 2);
            assert!(plan.iter().all(|node| node.address != down_address));
        }
    }

    #[test]
    fn token_owner_is_preferred_coordinator() {
        let cluster = make_cluster(3, &[&[0], &[100], &[200]]);
        let owner_id = cluster.nodes()[1].host_id;

        let policy = DefaultPolicy::new();
        let routing = RoutingInfo {
            token: Some(Token::new(50)),
            ..Default::default()
        };

        // Regardless of where round-robin starts, the replica owning
        // token 50 must come first and no candidate may be lost.
        for _ in 0..5 {
            let plan = policy.plan(&routing, &cluster);
            assert_eq!(plan[0].host_id, owner_id);
            assert_eq!(plan.len(), 3);
            assert_eq!(
                plan.iter().map(|n| n.host_id).collect::<HashSet<_>>().len(),
                3
            );
        }
    }

    #[test]
    fn empty_cluster_produces_empty_plan() {
        let cluster = ClusterState::new_for_test(Vec::new());
        let policy = DefaultPolicy::new();
        assert!(policy.plan(&RoutingInfo::default(), &cluster).is_empty());
    }
}
