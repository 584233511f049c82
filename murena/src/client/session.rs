//! `Session` manages connections to the cluster and allows to execute
//! CQL requests on it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use futures::future::join_all;
use tracing::{debug, trace, trace_span, warn, Instrument};
use uuid::Uuid;

use murena_cql::frame::request::query::QueryParameters;
use murena_cql::frame::Compression;
use murena_cql::value::QueryValues;
use murena_cql::{Consistency, SerialConsistency};

use crate::client::pager::Pager;
use crate::cluster::node::{resolve_contact_points, KnownNode, Node};
use crate::cluster::{Cluster, ClusterState};
use crate::errors::{
    BadQuery, ExecutionError, MetadataError, NewSessionError, RequestAttemptError,
    SchemaAgreementError, UseKeyspaceError,
};
use crate::network::connection::{Connection, ConnectionConfig, VerifiedKeyspaceName};
use crate::network::pool::{PoolConfig, PoolSize, ReconnectBackoff};
use crate::policies::load_balancing::{DefaultPolicy, LoadBalancingPolicy, RoutingInfo};
use crate::policies::retry::{
    DefaultRetryPolicy, RequestInfo, RetryDecision, RetryPolicy,
};
use crate::response::query_result::QueryResult;
use crate::response::QueryResponse;
use crate::statement::batch::{Batch, BatchStatement};
use crate::statement::cache::StatementCache;
use crate::statement::prepared::PreparedStatement;
use crate::statement::unprepared::Statement;
use crate::statement::{PageSize, StatementConfig};

/// Configuration options for [`Session`], accumulated by
/// [`SessionBuilder`](crate::client::session_builder::SessionBuilder).
#[derive(Clone)]
#[non_exhaustive]
pub struct SessionConfig {
    /// Initial contact nodes used to bootstrap the topology registry.
    pub known_nodes: Vec<KnownNode>,

    /// Wire compression negotiated for every connection.
    pub compression: Option<Compression>,
    pub tcp_nodelay: bool,
    pub tcp_keepalive_interval: Option<Duration>,

    /// Bound on establishing a single connection, including the
    /// OPTIONS/STARTUP negotiation and hostname resolution.
    pub connect_timeout: Duration,

    /// Per-node connection pool size.
    pub connection_pool_size: PoolSize,

    /// Reconnect backoff of unreachable nodes.
    pub reconnect_backoff: ReconnectBackoff,

    /// Interval of driver-level keepalive requests; `None` disables them.
    pub keepalive_interval: Option<Duration>,
    pub keepalive_timeout: Option<Duration>,

    /// Session-default request timeout; `None` waits indefinitely.
    pub request_timeout: Option<Duration>,

    /// Consistency applied when a statement does not override it.
    pub default_consistency: Consistency,
    /// Serial consistency applied when a statement does not override it.
    pub default_serial_consistency: Option<SerialConsistency>,

    pub schema_agreement_timeout: Duration,
    pub schema_agreement_interval: Duration,

    pub retry_policy: Arc<dyn RetryPolicy>,
    pub load_balancing_policy: Arc<dyn LoadBalancingPolicy>,

    /// Keyspace set right after the session is created, with its
    /// case-sensitivity flag.
    pub used_keyspace: Option<(String, bool)>,
}

impl SessionConfig {
    /// Creates a [SessionConfig] with default configuration.
    ///
    /// `known_nodes` is empty and has to be filled before connecting.
    pub fn new() -> Self {
        SessionConfig {
            known_nodes: Vec::new(),
            compression: None,
            tcp_nodelay: true,
            tcp_keepalive_interval: None,
            connect_timeout: Duration::from_secs(5),
            connection_pool_size: PoolSize::default(),
            reconnect_backoff: ReconnectBackoff::default(),
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_timeout: Some(Duration::from_secs(30)),
            request_timeout: Some(Duration::from_secs(30)),
            default_consistency: Consistency::LocalQuorum,
            default_serial_consistency: Some(SerialConsistency::LocalSerial),
            schema_agreement_timeout: Duration::from_secs(60),
            schema_agreement_interval: Duration::from_millis(200),
            retry_policy: Arc::new(DefaultRetryPolicy::new()),
            load_balancing_policy: Arc::new(DefaultPolicy::new()),
            used_keyspace: None,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// The result of running a request through the engine's state machine.
enum RunRequestResult {
    /// The retry policy decided the failed write should be treated as
    /// applied; there is no server response to show.
    IgnoredWriteError,
    Completed(QueryResponse),
}

/// The root handle to the cluster: owns the topology registry, the
/// connection pools and the statement cache.
///
/// `Session` is designed to be shared: all methods take `&self` and
/// requests issued concurrently never block each other. The current
/// keyspace is session-global mutable state; callers sharing a session
/// must coordinate their `use_keyspace` calls themselves.
pub struct Session {
    cluster: Cluster,
    statement_cache: StatementCache,
    keyspace_name: ArcSwapOption<String>,

    default_consistency: Consistency,
    default_serial_consistency: Option<SerialConsistency>,
    default_request_timeout: Option<Duration>,
    schema_agreement_timeout: Duration,
    schema_agreement_interval: Duration,
    retry_policy: Arc<dyn RetryPolicy>,
    load_balancing_policy: Arc<dyn LoadBalancingPolicy>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("keyspace", &self.keyspace_name.load())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Establishes a session with the cluster described by `config`:
    /// resolves the contact nodes, opens the first pools and fetches
    /// topology metadata.
    pub async fn connect(config: SessionConfig) -> Result<Session, NewSessionError> {
        if config.known_nodes.is_empty() {
            return Err(NewSessionError::EmptyKnownNodesList);
        }

        let (contact_points, hostnames) =
            resolve_contact_points(&config.known_nodes, Some(config.connect_timeout)).await;
        if contact_points.is_empty() {
            return Err(NewSessionError::FailedToResolveAnyHostname(hostnames));
        }

        let keyspace = config
            .used_keyspace
            .clone()
            .map(|(name, case_sensitive)| VerifiedKeyspaceName::new(name, case_sensitive))
            .transpose()
            .map_err(|err| NewSessionError::UseKeyspaceError(err.into()))?;

        let pool_config = PoolConfig {
            connection_config: ConnectionConfig {
                compression: config.compression,
                connect_timeout: config.connect_timeout,
                tcp_nodelay: config.tcp_nodelay,
                tcp_keepalive_interval: config.tcp_keepalive_interval,
                keepalive_interval: config.keepalive_interval,
                keepalive_timeout: config.keepalive_timeout,
            },
            pool_size: config.connection_pool_size,
            reconnect_backoff: config.reconnect_backoff,
        };

        let cluster = Cluster::new(&contact_points, pool_config, keyspace);
        cluster.wait_for_initial_connection().await?;

        let session = Session {
            cluster,
            statement_cache: StatementCache::new(),
            keyspace_name: ArcSwapOption::from_pointee(
                config.used_keyspace.map(|(name, _)| name),
            ),
            default_consistency: config.default_consistency,
            default_serial_consistency: config.default_serial_consistency,
            default_request_timeout: config.request_timeout,
            schema_agreement_timeout: config.schema_agreement_timeout,
            schema_agreement_interval: config.schema_agreement_interval,
            retry_policy: config.retry_policy,
            load_balancing_policy: config.load_balancing_policy,
        };

        // Learning peers and token ownership improves routing but is not
        // a precondition for serving requests through the contact nodes.
        if let Err(err) = session.refresh_metadata().await {
            warn!(
                error = %err,
                "Failed to fetch cluster metadata on session creation; \
                 proceeding with contact nodes only"
            );
        }

        Ok(session)
    }

    /// Executes an unprepared statement without paging: the whole result
    /// set is fetched in one round-trip.
    pub async fn query(
        &self,
        statement: impl Into<Statement>,
        values: impl Into<QueryValues>,
    ) -> Result<QueryResult, ExecutionError> {
        let statement = statement.into();
        self.do_query(&statement, &values.into(), None, None).await
    }

    /// Executes an unprepared statement, fetching at most one page of
    /// the statement's page size. Pass the previous page's
    /// [paging state](QueryResult::paging_state) to resume.
    pub async fn query_paged(
        &self,
        statement: impl Into<Statement>,
        values: impl Into<QueryValues>,
        paging_state: Option<Bytes>,
    ) -> Result<QueryResult, ExecutionError> {
        let statement = statement.into();
        let page_size = statement.get_page_size();
        self.do_query(&statement, &values.into(), Some(page_size), paging_state)
            .await
    }

    /// A pager lazily walking all pages of the given statement.
    pub fn query_pager(
        &self,
        statement: impl Into<Statement>,
        values: impl Into<QueryValues>,
    ) -> Pager<'_> {
        Pager::for_statement(self, statement.into(), values.into())
    }

    /// Prepares a statement on the cluster, caching the result by exact
    /// statement text.
    pub async fn prepare(
        &self,
        statement: impl Into<Statement>,
    ) -> Result<PreparedStatement, ExecutionError> {
        let statement = statement.into();
        let text = statement.get_contents();

        self.statement_cache
            .get_or_prepare(text, || async {
                let state = self.cluster.get_state();
                let plan = self
                    .load_balancing_policy
                    .plan(&RoutingInfo::default(), &state);

                let mut last_error: Option<ExecutionError> = None;
                for node in plan {
                    let connection = match node.get_random_connection() {
                        Ok(connection) => connection,
                        Err(err) => {
                            last_error = Some(err.into());
                            continue;
                        }
                    };
                    match connection.prepare_raw(text).await {
                        Ok(prepared) => {
                            debug!(
                                node = %connection.get_connect_address(),
                                statement = text,
                                "Prepared statement"
                            );
                            return Ok(PreparedStatement::new(
                                text.to_owned(),
                                prepared,
                                connection.get_connect_address(),
                                statement.config.clone(),
                                PageSize::new(statement.get_page_size()),
                            ));
                        }
                        Err(err) => last_error = Some(err.into()),
                    }
                }
                Err(last_error.unwrap_or(ExecutionError::EmptyPlan))
            })
            .await
    }

    /// Executes a prepared statement without paging.
    pub async fn execute(
        &self,
        prepared: &PreparedStatement,
        values: impl Into<QueryValues>,
    ) -> Result<QueryResult, ExecutionError> {
        self.do_execute(prepared, &values.into(), None, None).await
    }

    /// Executes a prepared statement, fetching at most one page.
    pub async fn execute_paged(
        &self,
        prepared: &PreparedStatement,
        values: impl Into<QueryValues>,
        paging_state: Option<Bytes>,
    ) -> Result<QueryResult, ExecutionError> {
        self.do_execute(
            prepared,
            &values.into(),
            Some(prepared.get_page_size()),
            paging_state,
        )
        .await
    }

    /// A pager lazily walking all pages of the given prepared statement.
    pub fn execute_pager(
        &self,
        prepared: PreparedStatement,
        values: impl Into<QueryValues>,
    ) -> Pager<'_> {
        Pager::for_prepared(self, prepared, values.into())
    }

    /// Executes a batch of statements as a single round-trip. One value
    /// list per statement must be supplied.
    pub async fn batch(
        &self,
        batch: &Batch,
        values: Vec<QueryValues>,
    ) -> Result<QueryResult, ExecutionError> {
        self.do_batch(batch, values).await
    }

    /// Sets the session-global keyspace. Affects every subsequent
    /// request of this session that uses unqualified table names.
    pub async fn use_keyspace(
        &self,
        keyspace_name: impl Into<String>,
        case_sensitive: bool,
    ) -> Result<(), UseKeyspaceError> {
        let keyspace_name = keyspace_name.into();
        let verified = VerifiedKeyspaceName::new(keyspace_name.clone(), case_sensitive)?;

        self.keyspace_name.store(Some(Arc::new(keyspace_name)));
        self.cluster.use_keyspace(verified).await
    }

    /// The name of the keyspace currently set, or `None`.
    ///
    /// The value may be stale if `use_keyspace` runs concurrently or
    /// previously failed halfway.
    pub fn get_keyspace(&self) -> Option<Arc<String>> {
        self.keyspace_name.load_full()
    }

    /// Access the cluster state visible to the driver.
    pub fn get_cluster_state(&self) -> Arc<ClusterState> {
        self.cluster.get_state()
    }

    /// Manually refreshes the topology registry from the system tables.
    pub async fn refresh_metadata(&self) -> Result<(), MetadataError> {
        self.cluster.refresh_metadata().await
    }

    /// Waits until all reachable nodes report the same schema version.
    ///
    /// Returns `Ok(true)` once they agree, `Ok(false)` when the
    /// configured timeout elapses first. DDL propagation is asynchronous
    /// across the cluster, so this should be called after DDL statements
    /// before relying on the new schema on other coordinators.
    pub async fn await_schema_agreement(&self) -> Result<bool, ExecutionError> {
        let polling = async {
            loop {
                if self.check_schema_agreement().await?.is_some() {
                    return Ok(());
                }
                tokio::time::sleep(self.schema_agreement_interval).await;
            }
        };

        match tokio::time::timeout(self.schema_agreement_timeout, polling).await {
            Ok(Ok(())) => Ok(true),
            Ok(Err(err)) => Err(err),
            Err(_elapsed) => Ok(false),
        }
    }

    /// Checks once whether all reachable nodes report the same schema
    /// version; returns it if so.
    pub async fn check_schema_agreement(&self) -> Result<Option<Uuid>, ExecutionError> {
        let state = self.cluster.get_state();
        let fetches = state
            .nodes()
            .iter()
            .filter(|node| !node.is_down())
            .map(|node| Self::node_schema_version(node));
        let results = join_all(fetches).await;

        let mut versions = Vec::with_capacity(results.len());
        for result in results {
            if let Some(version) = result? {
                versions.push(version);
            }
        }

        let Some(first) = versions.first().copied() else {
            return Err(ExecutionError::SchemaAgreementError(
                SchemaAgreementError::NoReachableNodes,
            ));
        };

        let in_agreement = versions.iter().all(|version| *version == first);
        trace!(
            versions = versions.len(),
            in_agreement,
            "Schema agreement check"
        );
        Ok(in_agreement.then_some(first))
    }

    // Reads the node's schema version over any of its working
    // connections. An unreachable node reads as None - it cannot hold
    // agreement hostage while its pool reconnects.
    async fn node_schema_version(node: &Arc<Node>) -> Result<Option<Uuid>, ExecutionError> {
        let connections = match node.get_working_connections() {
            Ok(connections) => connections,
            Err(_) => return Ok(None),
        };

        let mut last_error: Option<SchemaAgreementError> = None;
        for connection in connections {
            match connection.fetch_schema_version().await {
                Ok(version) => return Ok(Some(version)),
                Err(SchemaAgreementError::RequestError(
                    RequestAttemptError::BrokenConnectionError(err),
                )) => {
                    trace!(error = %err, "Connection broke during schema version fetch");
                    continue;
                }
                Err(err) => last_error = Some(err),
            }
        }

        match last_error {
            Some(err) => Err(err.into()),
            None => Ok(None),
        }
    }

    /// Terminates the session.
    ///
    /// No new requests can be issued afterwards. Requests already in
    /// flight own their connection handles and complete (or fail with
    /// a typed error) independently; once the last of them finishes,
    /// its connection is closed too.
    pub fn close(self) {
        debug!("Session closed");
    }

    pub(crate) async fn do_query(
        &self,
        statement: &Statement,
        values: &QueryValues,
        page_size: Option<i32>,
        paging_state: Option<Bytes>,
    ) -> Result<QueryResult, ExecutionError> {
        let serialized = values.to_serialized().map_err(BadQuery::from)?;
        let serialized = &serialized;

        let consistency = statement.config.determine_consistency(self.default_consistency);
        let serial_consistency = statement
            .config
            .serial_consistency
            .unwrap_or(self.default_serial_consistency);
        let routing = RoutingInfo {
            consistency,
            serial_consistency,
            token: None,
        };

        let paging_state = &paging_state;
        let run_result = self
            .run_request(routing, &statement.config, |connection, consistency| {
                let parameters = QueryParameters {
                    consistency,
                    serial_consistency,
                    timestamp: statement.config.timestamp,
                    page_size,
                    paging_state: paging_state.clone(),
                    values: std::borrow::Cow::Borrowed(serialized),
                };
                async move {
                    connection
                        .query_with_params(
                            statement.get_contents(),
                            parameters,
                            statement.config.tracing,
                        )
                        .await
                }
            })
            .await?;

        Ok(Self::into_query_result(run_result))
    }

    pub(crate) async fn do_execute(
        &self,
        prepared: &PreparedStatement,
        values: &QueryValues,
        page_size: Option<i32>,
        paging_state: Option<Bytes>,
    ) -> Result<QueryResult, ExecutionError> {
        let bound = prepared.bind(values)?;
        let bound = &bound;
        let token = prepared.compute_token(bound);

        let consistency = prepared.config.determine_consistency(self.default_consistency);
        let serial_consistency = prepared
            .config
            .serial_consistency
            .unwrap_or(self.default_serial_consistency);
        let routing = RoutingInfo {
            consistency,
            serial_consistency,
            token,
        };

        let paging_state = &paging_state;
        let run_result = self
            .run_request(routing, &prepared.config, |connection, consistency| {
                let paging_state = paging_state.clone();
                async move {
                    // Fill the per-node id lazily, coalescing concurrent
                    // PREPAREs for this (node, text) pair.
                    let node_addr = connection.get_connect_address();
                    let prepare_conn = Arc::clone(&connection);
                    self.statement_cache
                        .ensure_prepared_on(node_addr, prepared, || async move {
                            prepare_conn
                                .prepare_raw(prepared.get_statement())
                                .await
                                .map(|raw| raw.id)
                        })
                        .await?;

                    connection
                        .execute_with_params(
                            prepared,
                            bound,
                            consistency,
                            serial_consistency,
                            page_size,
                            paging_state,
                            prepared.config.timestamp,
                            prepared.config.tracing,
                        )
                        .await
                }
            })
            .await?;

        Ok(Self::into_query_result(run_result))
    }

    async fn do_batch(
        &self,
        batch: &Batch,
        values: Vec<QueryValues>,
    ) -> Result<QueryResult, ExecutionError> {
        if batch.statements.len() > u16::MAX as usize {
            return Err(
                BadQuery::TooManyQueriesInBatchStatement(batch.statements.len()).into(),
            );
        }
        if batch.statements.len() != values.len() {
            return Err(BadQuery::ValueCountMismatch {
                got: values.len(),
                expected: batch.statements.len(),
            }
            .into());
        }

        let mut serialized_lists = Vec::with_capacity(values.len());
        for (statement, value_list) in batch.statements.iter().zip(values.iter()) {
            let serialized = match statement {
                BatchStatement::Prepared(prepared) => prepared.bind(value_list)?,
                BatchStatement::Query(_) => match value_list {
                    QueryValues::Positional(_) => value_list
                        .to_serialized()
                        .map_err(BadQuery::SerializeValuesError)?,
                    QueryValues::Named(_) => {
                        return Err(BadQuery::NamedValuesInBatch.into());
                    }
                },
            };
            serialized_lists.push(serialized);
        }
        let serialized_lists = &serialized_lists;

        // Route by the first prepared statement's partition, the way
        // single statements are routed.
        let token = match (batch.statements.first(), serialized_lists.first()) {
            (Some(BatchStatement::Prepared(prepared)), Some(first_bound)) => {
                prepared.compute_token(first_bound)
            }
            _ => None,
        };

        let consistency = batch.config.determine_consistency(self.default_consistency);
        let serial_consistency = batch
            .config
            .serial_consistency
            .unwrap_or(self.default_serial_consistency);
        let routing = RoutingInfo {
            consistency,
            serial_consistency,
            token,
        };

        let run_result = self
            .run_request(routing, &batch.config, |connection, consistency| async move {
                connection
                    .batch_with_params(
                        batch,
                        serialized_lists,
                        consistency,
                        serial_consistency,
                        batch.config.timestamp,
                        batch.config.tracing,
                    )
                    .await
            })
            .await?;

        Ok(Self::into_query_result(run_result))
    }

    fn into_query_result(run_result: RunRequestResult) -> QueryResult {
        match run_result {
            RunRequestResult::Completed(response) => QueryResult::from_response(response),
            RunRequestResult::IgnoredWriteError => QueryResult::mock_empty(),
        }
    }

    /// The per-request state machine: walk the coordinator candidate
    /// plan, run one attempt per step, and let the retry policy decide
    /// between retrying on the same node, advancing to the next one, or
    /// surfacing the error. The whole walk shares one effective timeout.
    async fn run_request<Fut>(
        &self,
        routing: RoutingInfo,
        statement_config: &StatementConfig,
        run_attempt: impl Fn(Arc<Connection>, Consistency) -> Fut,
    ) -> Result<RunRequestResult, ExecutionError>
    where
        Fut: Future<Output = Result<QueryResponse, RequestAttemptError>>,
    {
        let runner = async {
            let cluster_state = self.cluster.get_state();
            let plan = self.load_balancing_policy.plan(&routing, &cluster_state);

            let retry_policy = statement_config
                .retry_policy
                .as_deref()
                .unwrap_or(&*self.retry_policy);
            let mut retry_session = retry_policy.new_session();

            let mut current_consistency = routing.consistency;
            let mut last_error: Option<ExecutionError> = None;

            'nodes_in_plan: for node in plan {
                let span =
                    trace_span!("Executing request", node = %node.address);
                'same_node_retries: loop {
                    trace!(parent: &span, "Attempt started");
                    let connection = match node.get_random_connection() {
                        Ok(connection) => connection,
                        Err(err) => {
                            trace!(
                                parent: &span,
                                error = %err,
                                "Choosing connection failed"
                            );
                            last_error = Some(err.into());
                            // No connection is not a failed attempt;
                            // it does not consume a retry.
                            continue 'nodes_in_plan;
                        }
                    };

                    let attempt_error: RequestAttemptError = match run_attempt(
                        connection,
                        current_consistency,
                    )
                    .instrument(span.clone())
                    .await
                    {
                        Ok(response) => {
                            trace!(parent: &span, "Request succeeded");
                            return Ok(RunRequestResult::Completed(response));
                        }
                        Err(err) => {
                            trace!(
                                parent: &span,
                                error = %err,
                                "Request failed"
                            );
                            err
                        }
                    };

                    let request_info = RequestInfo {
                        error: &attempt_error,
                        is_idempotent: statement_config.is_idempotent,
                        consistency: routing.consistency,
                    };
                    let retry_decision = retry_session.decide_should_retry(request_info);
                    trace!(
                        parent: &span,
                        retry_decision = ?retry_decision
                    );

                    last_error = Some(attempt_error.into());

                    match retry_decision {
                        RetryDecision::RetrySameTarget(new_cl) => {
                            current_consistency = new_cl.unwrap_or(current_consistency);
                            continue 'same_node_retries;
                        }
                        RetryDecision::RetryNextTarget(new_cl) => {
                            current_consistency = new_cl.unwrap_or(current_consistency);
                            continue 'nodes_in_plan;
                        }
                        RetryDecision::DontRetry => break 'nodes_in_plan,
                        RetryDecision::IgnoreWriteError => {
                            return Ok(RunRequestResult::IgnoredWriteError);
                        }
                    };
                }
            }

            Err(last_error.unwrap_or(ExecutionError::EmptyPlan))
        };

        let effective_timeout = statement_config
            .request_timeout
            .or(self.default_request_timeout);
        match effective_timeout {
            Some(timeout) => tokio::time::timeout(timeout, runner)
                .await
                .unwrap_or(Err(ExecutionError::RequestTimeout(timeout))),
            None => runner.await,
        }
    }
}
