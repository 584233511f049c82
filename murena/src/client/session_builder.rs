//! Builder of [`Session`], gathering configuration before the initial
//! contact nodes are resolved.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use murena_cql::frame::Compression;
use murena_cql::{Consistency, SerialConsistency};

use crate::client::session::{Session, SessionConfig};
use crate::cluster::node::KnownNode;
use crate::errors::NewSessionError;
use crate::network::pool::{PoolSize, ReconnectBackoff};
use crate::policies::load_balancing::LoadBalancingPolicy;
use crate::policies::retry::RetryPolicy;

/// Builds a [`Session`].
///
/// ```rust,no_run
/// # use murena::client::session_builder::SessionBuilder;
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let session = SessionBuilder::new()
///     .known_node("127.0.0.1:9042")
///     .compression(Some(murena::Compression::Lz4))
///     .tcp_nodelay(true)
///     .build()
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct SessionBuilder {
    /// The configuration accumulated so far.
    pub config: SessionConfig,
}

impl SessionBuilder {
    /// Creates a new SessionBuilder with default configuration.
    pub fn new() -> Self {
        SessionBuilder {
            config: SessionConfig::new(),
        }
    }

    /// Adds a known node with a hostname (which may carry a port,
    /// defaulting to 9042) or an address literal.
    pub fn known_node(mut self, hostname: impl AsRef<str>) -> Self {
        self.config
            .known_nodes
            .push(KnownNode::Hostname(hostname.as_ref().to_string()));
        self
    }

    /// Adds a known node with an already-resolved address.
    pub fn known_node_addr(mut self, node_addr: SocketAddr) -> Self {
        self.config.known_nodes.push(KnownNode::Address(node_addr));
        self
    }

    /// Adds a list of known nodes with hostnames.
    pub fn known_nodes(mut self, hostnames: impl IntoIterator<Item = impl AsRef<str>>) -> Self {
        for hostname in hostnames {
            self = self.known_node(hostname);
        }
        self
    }

    /// Adds a list of known nodes with resolved addresses.
    pub fn known_nodes_addr(
        mut self,
        node_addrs: impl IntoIterator<Item = SocketAddr>,
    ) -> Self {
        for address in node_addrs {
            self = self.known_node_addr(address);
        }
        self
    }

    /// Sets the wire compression, negotiated once per connection.
    /// `None` disables compression.
    pub fn compression(mut self, compression: Option<Compression>) -> Self {
        self.config.compression = compression;
        self
    }

    /// Sets the TCP_NODELAY option of every connection.
    pub fn tcp_nodelay(mut self, nodelay: bool) -> Self {
        self.config.tcp_nodelay = nodelay;
        self
    }

    /// Enables TCP-level keepalive with the given idle time.
    pub fn tcp_keepalive_interval(mut self, interval: Duration) -> Self {
        self.config.tcp_keepalive_interval = Some(interval);
        self
    }

    /// Bound on establishing a single connection, including the protocol
    /// negotiation.
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Sets the per-node connection pool size.
    pub fn pool_size(mut self, size: PoolSize) -> Self {
        self.config.connection_pool_size = size;
        self
    }

    /// Sets the reconnect backoff of unreachable nodes.
    pub fn reconnect_backoff(mut self, backoff: ReconnectBackoff) -> Self {
        self.config.reconnect_backoff = backoff;
        self
    }

    /// Interval of driver-level keepalive requests; `None` disables
    /// them.
    pub fn keepalive_interval(mut self, interval: Option<Duration>) -> Self {
        self.config.keepalive_interval = interval;
        self
    }

    /// Sets the session-default request timeout. `None` waits
    /// indefinitely; per-statement timeouts still apply.
    pub fn request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Sets the consistency used by statements that do not override it.
    pub fn default_consistency(mut self, consistency: Consistency) -> Self {
        self.config.default_consistency = consistency;
        self
    }

    /// Sets the serial consistency used by conditional statements that
    /// do not override it.
    pub fn default_serial_consistency(
        mut self,
        serial_consistency: Option<SerialConsistency>,
    ) -> Self {
        self.config.default_serial_consistency = serial_consistency;
        self
    }

    /// Bounds `await_schema_agreement`.
    pub fn schema_agreement_timeout(mut self, timeout: Duration) -> Self {
        self.config.schema_agreement_timeout = timeout;
        self
    }

    /// Interval between schema agreement polls.
    pub fn schema_agreement_interval(mut self, interval: Duration) -> Self {
        self.config.schema_agreement_interval = interval;
        self
    }

    /// Sets the session-wide retry policy.
    pub fn retry_policy(mut self, retry_policy: Arc<dyn RetryPolicy>) -> Self {
        self.config.retry_policy = retry_policy;
        self
    }

    /// Sets the session-wide load balancing policy.
    pub fn load_balancing_policy(mut self, policy: Arc<dyn LoadBalancingPolicy>) -> Self {
        self.config.load_balancing_policy = policy;
        self
    }

    /// Keyspace to set right after the session is created.
    pub fn use_keyspace(mut self, keyspace_name: impl Into<String>, case_sensitive: bool) -> Self {
        self.config.used_keyspace = Some((keyspace_name.into(), case_sensitive));
        self
    }

    /// Builds the session: resolves contact nodes, opens the initial
    /// pools and fetches topology metadata.
    pub async fn build(&self) -> Result<Session, NewSessionError> {
        Session::connect(self.config.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::SessionBuilder;
    use crate::cluster::node::KnownNode;
    use std::net::SocketAddr;

    #[test]
    fn builder_accumulates_known_nodes() {
        let addr: SocketAddr = "127.0.0.1:9042".parse().unwrap();
        let builder = SessionBuilder::new()
            .known_node("db1.example.com")
            .known_nodes(["db2.example.com:19042", "db3.example.com"])
            .known_node_addr(addr);

        assert_eq!(
            builder.config.known_nodes,
            vec![
                KnownNode::Hostname("db1.example.com".to_string()),
                KnownNode::Hostname("db2.example.com:19042".to_string()),
                KnownNode::Hostname("db3.example.com".to_string()),
                KnownNode::Address(addr),
            ]
        );
    }

    #[test]
    fn builder_records_keyspace_with_case_sensitivity() {
        let builder = SessionBuilder::new().use_keyspace("Library", true);
        assert_eq!(
            builder.config.used_keyspace,
            Some(("Library".to_string(), true))
        );
    }
}
