//! A single cluster node, its reachability state and its connection pool.

use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::net::{lookup_host, ToSocketAddrs};
use tracing::warn;
use uuid::Uuid;

use crate::cluster::metadata::PeerInfo;
use crate::errors::{ConnectionPoolError, UseKeyspaceError};
use crate::network::connection::{Connection, VerifiedKeyspaceName};
use crate::network::pool::{NodeConnectionPool, PoolConfig};
use crate::routing::Token;

/// Reachability of a node as observed by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    /// At least one connection to the node is open.
    Up,
    /// The last round of connection attempts failed. The pool keeps
    /// probing the node with exponential backoff.
    Down,
    /// Nothing is known yet - the node was just added.
    Unknown,
}

#[derive(Debug)]
struct Health {
    state: HealthState,
    since: Instant,
}

/// Health flag shared between a [Node] and its pool refiller.
#[derive(Debug)]
pub(crate) struct SharedHealth {
    inner: RwLock<Health>,
}

impl SharedHealth {
    pub(crate) fn new() -> Self {
        SharedHealth {
            inner: RwLock::new(Health {
                state: HealthState::Unknown,
                since: Instant::now(),
            }),
        }
    }

    pub(crate) fn state(&self) -> HealthState {
        self.inner.read().unwrap().state
    }

    pub(crate) fn since(&self) -> Instant {
        self.inner.read().unwrap().since
    }

    pub(crate) fn transition(&self, new_state: HealthState) {
        let mut health = self.inner.write().unwrap();
        if health.state != new_state {
            health.state = new_state;
            health.since = Instant::now();
        }
    }
}

/// A cluster node along with its health and connections.
///
/// Nodes are never removed for being unreachable; a down node keeps its
/// entry and its pool keeps probing it with backoff, since failures are
/// frequently transient.
#[derive(Debug)]
pub struct Node {
    /// Unique identifier of the node, from system tables. Contact nodes
    /// get a placeholder until metadata is fetched.
    pub host_id: Uuid,
    /// Address the driver connects to.
    pub address: SocketAddr,
    /// Datacenter of the node, if known.
    pub datacenter: Option<String>,
    /// Rack of the node, if known.
    pub rack: Option<String>,
    /// Tokens owned by this node, if known.
    pub(crate) tokens: Vec<Token>,

    health: Arc<SharedHealth>,

    /// Connection pool for this node. `None` only in unit tests.
    pool: Option<NodeConnectionPool>,
}

/// A way that Nodes are often passed and accessed in the driver's code.
pub type NodeRef<'a> = &'a Arc<Node>;

impl Node {
    /// Creates a new node which starts connecting in the background.
    pub(crate) fn new(peer: PeerInfo, pool_config: &PoolConfig, keyspace_name: Option<VerifiedKeyspaceName>) -> Self {
        let health = Arc::new(SharedHealth::new());
        let pool = NodeConnectionPool::new(
            peer.address,
            pool_config.clone(),
            keyspace_name,
            Arc::clone(&health),
        );

        Node {
            host_id: peer.host_id,
            address: peer.address,
            datacenter: peer.datacenter,
            rack: peer.rack,
            tokens: peer.tokens,
            health,
            pool: Some(pool),
        }
    }

    /// Recreates a Node with fresh metadata, preserving its pool and
    /// health history.
    pub(crate) fn inherit_with_metadata(node: &Node, peer: PeerInfo) -> Self {
        Self {
            host_id: peer.host_id,
            address: node.address,
            datacenter: peer.datacenter,
            rack: peer.rack,
            tokens: peer.tokens,
            health: Arc::clone(&node.health),
            pool: node.pool.clone(),
        }
    }

    /// Current health state of the node.
    pub fn health(&self) -> HealthState {
        self.health.state()
    }

    /// When the node last changed health state. For an UP node this is
    /// a lower bound of the last successful contact.
    pub fn last_transition(&self) -> Instant {
        self.health.since()
    }

    pub fn is_down(&self) -> bool {
        self.health() == HealthState::Down
    }

    /// Returns true if the driver has any open connection to this node.
    pub fn is_connected(&self) -> bool {
        self.pool.as_ref().is_some_and(|pool| pool.is_connected())
    }

    pub(crate) fn mark_up(&self) {
        self.health.transition(HealthState::Up);
    }

    pub(crate) fn mark_down(&self) {
        self.health.transition(HealthState::Down);
    }

    pub(crate) fn get_random_connection(&self) -> Result<Arc<Connection>, ConnectionPoolError> {
        self.pool().random_connection()
    }

    pub(crate) fn get_working_connections(
        &self,
    ) -> Result<Vec<Arc<Connection>>, ConnectionPoolError> {
        self.pool().get_working_connections()
    }

    pub(crate) async fn use_keyspace(
        &self,
        keyspace_name: VerifiedKeyspaceName,
    ) -> Result<(), UseKeyspaceError> {
        if let Some(pool) = &self.pool {
            pool.use_keyspace(keyspace_name).await?;
        }
        Ok(())
    }

    pub(crate) async fn wait_until_pool_initialized(&self) {
        if let Some(pool) = &self.pool {
            pool.wait_until_initialized().await;
        }
    }

    fn pool(&self) -> &NodeConnectionPool {
        // Nodes without a pool exist only in unit tests, which never
        // request connections.
        self.pool
            .as_ref()
            .expect("node has no connection pool")
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.host_id == other.host_id
    }
}

impl Eq for Node {}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host_id.hash(state);
    }
}

/// Describes a database server known on `Session` startup.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
#[non_exhaustive]
pub enum KnownNode {
    /// A node identified by its hostname.
    Hostname(String),
    /// A node identified by its IP address + a port.
    Address(SocketAddr),
}

/// Performs a DNS lookup with the provided optional timeout.
async fn lookup_host_with_timeout(
    host: impl ToSocketAddrs,
    timeout: Option<Duration>,
) -> std::io::Result<impl Iterator<Item = SocketAddr>> {
    if let Some(timeout) = timeout {
        match tokio::time::timeout(timeout, lookup_host(host)).await {
            Ok(res) => res,
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "DNS lookup timed out",
            )),
        }
    } else {
        lookup_host(host).await
    }
}

// Resolve the given hostname using a DNS lookup if necessary.
// The resolution may return multiple IPs and the function returns one of them.
// It prefers to return IPv4s first, and only if there are none, IPv6s.
async fn resolve_hostname(
    hostname: &str,
    timeout: Option<Duration>,
) -> std::io::Result<SocketAddr> {
    // `lookup_host` expects a "hostname:port" form; if the port is missing,
    // retry with the default CQL port.
    let addrs: Vec<SocketAddr> = match lookup_host_with_timeout(hostname, timeout).await {
        Ok(addrs) => addrs.collect(),
        Err(e) => lookup_host_with_timeout((hostname, 9042), timeout)
            .await
            .map_err(|_| e)?
            .collect(),
    };

    addrs
        .iter()
        .find(|addr| matches!(addr, SocketAddr::V4(_)))
        .or(addrs.first())
        .copied()
        .ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("Empty address list returned by DNS for {}", hostname),
            )
        })
}

/// Transforms the known nodes into resolved contact addresses.
/// Returns the resolved addresses and the list of hostnames that were
/// attempted (for error reporting).
pub(crate) async fn resolve_contact_points(
    known_nodes: &[KnownNode],
    timeout: Option<Duration>,
) -> (Vec<SocketAddr>, Vec<String>) {
    let mut contact_points: Vec<SocketAddr> = Vec::with_capacity(known_nodes.len());
    let mut to_resolve: Vec<&String> = Vec::new();
    let mut hostnames: Vec<String> = Vec::new();

    for node in known_nodes.iter() {
        match node {
            KnownNode::Hostname(hostname) => {
                to_resolve.push(hostname);
                hostnames.push(hostname.clone());
            }
            KnownNode::Address(address) => contact_points.push(*address),
        };
    }

    let resolve_futures = to_resolve
        .into_iter()
        .map(|hostname| async move {
            match resolve_hostname(hostname, timeout).await {
                Ok(address) => Some(address),
                Err(e) => {
                    warn!("Hostname resolution failed for {}: {}", hostname, &e);
                    None
                }
            }
        });
    let resolved: Vec<_> = join_all(resolve_futures).await;
    contact_points.extend(resolved.into_iter().flatten());

    (contact_points, hostnames)
}
