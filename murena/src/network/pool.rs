//! Per-node connection pool.
//!
//! A background refiller task keeps the pool at its target size. Connect
//! failures put the node into DOWN state and are retried on exponential
//! backoff; a successful handshake brings the node UP again. The current
//! set of usable connections is published through an `ArcSwap` so that
//! picking a connection never blocks on pool maintenance.

use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use futures::future::{join_all, RemoteHandle};
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use rand::Rng;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, trace, warn};

use crate::cluster::node::{HealthState, SharedHealth};
use crate::errors::{ConnectionError, ConnectionPoolError, UseKeyspaceError};
use crate::network::connection::{
    open_connection, Connection, ConnectionConfig, ErrorReceiver, VerifiedKeyspaceName,
};

/// The target size of a per-node connection pool.
#[derive(Debug, Clone, Copy)]
pub enum PoolSize {
    /// Establish the given number of connections to each node.
    PerHost(NonZeroUsize),
}

impl Default for PoolSize {
    fn default() -> Self {
        PoolSize::PerHost(NonZeroUsize::new(1).unwrap())
    }
}

impl PoolSize {
    fn target(&self) -> usize {
        match self {
            PoolSize::PerHost(n) => n.get(),
        }
    }
}

/// Reconnect backoff constants; operationally tunable.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectBackoff {
    /// Delay before the first reconnect attempt.
    pub base: Duration,
    /// Upper bound of the doubling delay.
    pub cap: Duration,
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(60),
        }
    }
}

impl ReconnectBackoff {
    /// Next delay after `delay`: doubled, capped.
    pub(crate) fn next_delay(&self, delay: Duration) -> Duration {
        std::cmp::min(delay * 2, self.cap)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct PoolConfig {
    pub(crate) connection_config: ConnectionConfig,
    pub(crate) pool_size: PoolSize,
    pub(crate) reconnect_backoff: ReconnectBackoff,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connection_config: ConnectionConfig::default(),
            pool_size: PoolSize::default(),
            reconnect_backoff: ReconnectBackoff::default(),
        }
    }
}

enum MaybePoolConnections {
    // The pool is being filled for the first time.
    Initializing,

    // The pool is empty because initial filling failed or all
    // connections broke; being refilled with backoff. Contains the error
    // from the last connection attempt.
    Broken(ConnectionError),

    // The pool has some usable connections.
    Ready(Vec<Arc<Connection>>),
}

impl std::fmt::Debug for MaybePoolConnections {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MaybePoolConnections::Initializing => write!(f, "Initializing"),
            MaybePoolConnections::Broken(err) => write!(f, "Broken({err:?})"),
            MaybePoolConnections::Ready(conns) => write!(f, "Ready({} conns)", conns.len()),
        }
    }
}

struct UseKeyspaceRequest {
    keyspace_name: VerifiedKeyspaceName,
    response_sender: oneshot::Sender<Result<(), UseKeyspaceError>>,
}

/// Handle to a node's pool. Cheap to clone; all clones drive the same
/// refiller.
#[derive(Clone)]
pub(crate) struct NodeConnectionPool {
    conns: Arc<ArcSwap<MaybePoolConnections>>,
    use_keyspace_request_sender: mpsc::Sender<UseKeyspaceRequest>,
    pool_updated_notify: Arc<Notify>,
    _refiller_handle: Arc<RemoteHandle<()>>,
}

impl std::fmt::Debug for NodeConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeConnectionPool")
            .field("conns", &self.conns)
            .finish_non_exhaustive()
    }
}

impl NodeConnectionPool {
    pub(crate) fn new(
        endpoint: SocketAddr,
        config: PoolConfig,
        current_keyspace: Option<VerifiedKeyspaceName>,
        health: Arc<SharedHealth>,
    ) -> Self {
        let conns = Arc::new(ArcSwap::from_pointee(MaybePoolConnections::Initializing));
        let pool_updated_notify = Arc::new(Notify::new());
        let (use_keyspace_request_sender, use_keyspace_request_receiver) = mpsc::channel(1);

        let refiller = PoolRefiller {
            endpoint,
            config,
            conns: Vec::new(),
            next_conn_id: 0,
            shared_conns: Arc::clone(&conns),
            pool_updated_notify: Arc::clone(&pool_updated_notify),
            health,
            current_keyspace,
        };

        let (fut, handle) = refiller.run(use_keyspace_request_receiver).remote_handle();
        tokio::spawn(fut);

        Self {
            conns,
            use_keyspace_request_sender,
            pool_updated_notify,
            _refiller_handle: Arc::new(handle),
        }
    }

    /// A randomly chosen connection from the pool.
    pub(crate) fn random_connection(&self) -> Result<Arc<Connection>, ConnectionPoolError> {
        self.with_connections(|conns| {
            let idx = rand::rng().random_range(0..conns.len());
            Arc::clone(&conns[idx])
        })
    }

    pub(crate) fn get_working_connections(
        &self,
    ) -> Result<Vec<Arc<Connection>>, ConnectionPoolError> {
        self.with_connections(|conns| conns.to_vec())
    }

    pub(crate) fn is_connected(&self) -> bool {
        matches!(&**self.conns.load(), MaybePoolConnections::Ready(conns) if !conns.is_empty())
    }

    /// Waits until the pool leaves the `Initializing` state, i.e. the
    /// first connection round has either succeeded or failed.
    pub(crate) async fn wait_until_initialized(&self) {
        loop {
            let notified = self.pool_updated_notify.notified();
            if !matches!(&**self.conns.load(), MaybePoolConnections::Initializing) {
                return;
            }
            notified.await;
        }
    }

    /// Switches every current and future connection of this pool to the
    /// given keyspace.
    pub(crate) async fn use_keyspace(
        &self,
        keyspace_name: VerifiedKeyspaceName,
    ) -> Result<(), UseKeyspaceError> {
        let (response_sender, response_receiver) = oneshot::channel();
        // The refiller outlives every pool handle, so both sends
        // can only fail if it panicked.
        self.use_keyspace_request_sender
            .send(UseKeyspaceRequest {
                keyspace_name,
                response_sender,
            })
            .await
            .expect("pool refiller is gone");

        response_receiver.await.expect("pool refiller is gone")
    }

    fn with_connections<T>(
        &self,
        f: impl FnOnce(&[Arc<Connection>]) -> T,
    ) -> Result<T, ConnectionPoolError> {
        let conns = self.conns.load();
        match &**conns {
            MaybePoolConnections::Ready(conns) if !conns.is_empty() => Ok(f(conns)),
            MaybePoolConnections::Ready(_) | MaybePoolConnections::Initializing => {
                Err(ConnectionPoolError::Initializing)
            }
            MaybePoolConnections::Broken(err) => Err(ConnectionPoolError::Broken {
                last_connection_error: err.clone(),
            }),
        }
    }
}

struct PoolRefiller {
    endpoint: SocketAddr,
    config: PoolConfig,
    conns: Vec<(u64, Arc<Connection>)>,
    next_conn_id: u64,
    shared_conns: Arc<ArcSwap<MaybePoolConnections>>,
    pool_updated_notify: Arc<Notify>,
    health: Arc<SharedHealth>,
    current_keyspace: Option<VerifiedKeyspaceName>,
}

impl PoolRefiller {
    async fn run(mut self, mut use_keyspace_rx: mpsc::Receiver<UseKeyspaceRequest>) {
        // Futures resolving when a connection reports a fatal error,
        // tagged with the connection's id in `conns`.
        let mut error_futures: FuturesUnordered<_> = FuturesUnordered::new();
        let mut backoff = self.config.reconnect_backoff.base;

        loop {
            // Fill phase: open connections until the target size
            // is reached.
            while self.conns.len() < self.config.pool_size.target() {
                match self.open_one().await {
                    Ok((conn, error_receiver)) => {
                        let id = self.next_conn_id;
                        self.next_conn_id += 1;
                        self.conns.push((id, conn));
                        error_futures.push(watch_for_error(id, error_receiver));
                        backoff = self.config.reconnect_backoff.base;
                        self.health.transition(HealthState::Up);
                        self.publish();
                    }
                    Err(err) => {
                        warn!(
                            endpoint = %self.endpoint,
                            error = %err,
                            "Failed to open a connection, scheduling retry in {:?}",
                            backoff,
                        );
                        if self.conns.is_empty() {
                            self.health.transition(HealthState::Down);
                            self.shared_conns
                                .store(Arc::new(MaybePoolConnections::Broken(err)));
                            self.pool_updated_notify.notify_waiters();
                        }
                        // Keyspace changes must not be stalled by
                        // an unreachable node.
                        tokio::select! {
                            _ = tokio::time::sleep(backoff) => {}
                            Some(request) = use_keyspace_rx.recv() => {
                                self.handle_use_keyspace(request).await;
                            }
                        }
                        backoff = self.config.reconnect_backoff.next_delay(backoff);
                    }
                }
            }

            self.health.transition(HealthState::Up);
            self.publish();

            // Steady phase: wait for a connection to break or for
            // a keyspace change.
            tokio::select! {
                Some(broken_id) = error_futures.next(), if !error_futures.is_empty() => {
                    self.conns.retain(|(id, _)| *id != broken_id);
                    debug!(
                        endpoint = %self.endpoint,
                        "Connection broke, {} left in pool",
                        self.conns.len(),
                    );
                    if self.conns.is_empty() {
                        self.health.transition(HealthState::Down);
                    }
                    self.publish();
                }
                Some(request) = use_keyspace_rx.recv() => {
                    self.handle_use_keyspace(request).await;
                }
            }
        }
    }

    async fn open_one(&self) -> Result<(Arc<Connection>, ErrorReceiver), ConnectionError> {
        trace!(endpoint = %self.endpoint, "Opening a new connection");
        let (connection, error_receiver) =
            open_connection(self.endpoint, &self.config.connection_config).await?;

        if let Some(keyspace) = &self.current_keyspace {
            connection
                .use_keyspace(keyspace)
                .await
                .map_err(|err| match err {
                    UseKeyspaceError::RequestError(attempt_error) => {
                        ConnectionError::SetupRequestError(Arc::new(attempt_error))
                    }
                    other => ConnectionError::SetupRequestError(Arc::new(
                        crate::errors::RequestAttemptError::UnexpectedResponse(match other {
                            UseKeyspaceError::KeyspaceNameMismatch { .. } => {
                                "SetKeyspace with mismatched name"
                            }
                            _ => "USE failed during connection setup",
                        }),
                    )),
                })?;
        }

        Ok((Arc::new(connection), error_receiver))
    }

    async fn handle_use_keyspace(&mut self, request: UseKeyspaceRequest) {
        self.current_keyspace = Some(request.keyspace_name.clone());

        let switches = self
            .conns
            .iter()
            .map(|(_, conn)| conn.use_keyspace(&request.keyspace_name));
        let results = join_all(switches).await;
        let result = results.into_iter().collect::<Result<(), _>>();

        // The requester may have given up; ignore send failure.
        let _ = request.response_sender.send(result);
    }

    fn publish(&self) {
        let conns: Vec<Arc<Connection>> =
            self.conns.iter().map(|(_, conn)| Arc::clone(conn)).collect();
        self.shared_conns
            .store(Arc::new(MaybePoolConnections::Ready(conns)));
        self.pool_updated_notify.notify_waiters();
    }
}

async fn watch_for_error(id: u64, error_receiver: ErrorReceiver) -> u64 {
    match error_receiver.await {
        Ok(err) => {
            debug!("Connection {} reported an error: {}", id, err);
        }
        Err(_) => {
            // The router ended without an error; treat as broken anyway.
        }
    }
    id
}

#[cfg(test)]
mod tests {
    use super::ReconnectBackoff;
    use std::time::Duration;

    #[test]
    fn reconnect_backoff_doubles_up_to_cap() {
        let backoff = ReconnectBackoff {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(60),
        };

        let mut delay = backoff.base;
        let mut observed = vec![delay];
        for _ in 0..8 {
            delay = backoff.next_delay(delay);
            observed.push(delay);
        }

        assert_eq!(
            observed,
            [1u64, 2, 4, 8, 16, 32, 60, 60, 60]
                .into_iter()
                .map(Duration::from_secs)
                .collect::<Vec<_>>()
        );
    }
}
