//! A single connection to a node, multiplexing concurrent requests
//! over stream ids.
//!
//! The connection is driven by a router task split into four cooperating
//! futures: `reader` dispatches response frames to waiting callers by
//! stream id, `writer` assigns stream ids and sends queued frames,
//! `orphaner` frees stream ids of cancelled requests, and `keepaliver`
//! issues periodic OPTIONS requests. If any of them fails, every request
//! in flight on the connection completes with a `BrokenConnectionError`.

use std::borrow::Cow;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::future::RemoteHandle;
use futures::FutureExt;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{split, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

use murena_cql::frame::request::{self, batch, options, query, SerializableRequest};
use murena_cql::frame::response::error::DbError;
use murena_cql::frame::response::{Response, ResponseOpcode};
use murena_cql::frame::types::{Consistency, SerialConsistency};
use murena_cql::frame::{self, Compression, FrameParams, SerializedRequest};
use murena_cql::value::{CqlValue, SerializedValues};

use crate::errors::{
    BadKeyspaceName, BrokenConnectionError, BrokenConnectionErrorKind, ConnectionError,
    RequestAttemptError, SchemaAgreementError, UseKeyspaceError,
};
use crate::response::QueryResponse;
use crate::statement::batch::{Batch, BatchStatement};
use crate::statement::prepared::PreparedStatement;

// An orphaned stream id counts as old after this long; a connection
// hoarding too many old orphans is cycled.
const OLD_ORPHAN_AGE: Duration = Duration::from_secs(1);
const OLD_ORPHAN_COUNT_THRESHOLD: usize = 1024;

const SCHEMA_VERSION_QUERY: &str =
    "SELECT schema_version FROM system.local WHERE key='local'";

/// Configuration of a single connection, fixed at connect time.
#[derive(Debug, Clone)]
pub(crate) struct ConnectionConfig {
    pub(crate) compression: Option<Compression>,
    pub(crate) connect_timeout: Duration,
    pub(crate) tcp_nodelay: bool,
    pub(crate) tcp_keepalive_interval: Option<Duration>,
    /// Interval of driver-level keepalive OPTIONS requests.
    pub(crate) keepalive_interval: Option<Duration>,
    pub(crate) keepalive_timeout: Option<Duration>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            compression: None,
            connect_timeout: Duration::from_secs(5),
            tcp_nodelay: true,
            tcp_keepalive_interval: None,
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_timeout: Some(Duration::from_secs(30)),
        }
    }
}

type RequestId = u64;

/// Receiving half of the channel a broken connection reports itself on.
pub(crate) type ErrorReceiver = oneshot::Receiver<ConnectionError>;

pub(crate) struct Connection {
    _worker_handle: RemoteHandle<()>,

    connect_address: SocketAddr,
    config: ConnectionConfig,
    router_handle: Arc<RouterHandle>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("connect_address", &self.connect_address)
            .finish_non_exhaustive()
    }
}

struct RouterHandle {
    submit_channel: mpsc::Sender<Task>,

    // Each request sent by `Connection::send_request` needs a unique
    // request id; this is a monotonic generator of such ids.
    request_id_generator: AtomicU64,
    // If a `Connection::send_request` future is dropped before its
    // response arrives, it notifies the router via this sender so that
    // the stream id can be freed. Unbounded because `Drop` cannot await.
    orphan_notification_sender: mpsc::UnboundedSender<RequestId>,
}

impl RouterHandle {
    fn allocate_request_id(&self) -> RequestId {
        self.request_id_generator
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }

    async fn send_request(
        &self,
        request: &impl SerializableRequest,
        compression: Option<Compression>,
        tracing: bool,
    ) -> Result<TaskResponse, RequestAttemptError> {
        let serialized_request = SerializedRequest::make(request, compression, tracing)?;
        let request_id = self.allocate_request_id();

        let (response_sender, receiver) = oneshot::channel();
        let response_handler = ResponseHandler {
            response_sender,
            request_id,
        };

        // Dropping `notifier` before `disable()` marks the stream id
        // associated with this request as orphaned, freeing it for reuse
        // without touching the router's dispatch table from this side.
        let notifier = OrphanhoodNotifier::new(request_id, &self.orphan_notification_sender);

        self.submit_channel
            .send(Task {
                serialized_request,
                response_handler,
            })
            .await
            .map_err(|_| -> BrokenConnectionError {
                BrokenConnectionErrorKind::ChannelError.into()
            })?;

        let task_response = receiver.await.map_err(|_| -> BrokenConnectionError {
            BrokenConnectionErrorKind::ChannelError.into()
        })?;

        // The response arrived, no need to notify about orphaning.
        notifier.disable();

        task_response
    }
}

struct ResponseHandler {
    response_sender: oneshot::Sender<Result<TaskResponse, RequestAttemptError>>,
    request_id: RequestId,
}

// Notifies the router about a `send_request` future being dropped before
// it received its response.
struct OrphanhoodNotifier<'a> {
    enabled: bool,
    request_id: RequestId,
    notification_sender: &'a mpsc::UnboundedSender<RequestId>,
}

impl<'a> OrphanhoodNotifier<'a> {
    fn new(
        request_id: RequestId,
        notification_sender: &'a mpsc::UnboundedSender<RequestId>,
    ) -> Self {
        Self {
            enabled: true,
            request_id,
            notification_sender,
        }
    }

    fn disable(mut self) {
        self.enabled = false;
    }
}

impl Drop for OrphanhoodNotifier<'_> {
    fn drop(&mut self) {
        if self.enabled {
            let _ = self.notification_sender.send(self.request_id);
        }
    }
}

struct Task {
    serialized_request: SerializedRequest,
    response_handler: ResponseHandler,
}

struct TaskResponse {
    params: FrameParams,
    opcode: ResponseOpcode,
    body: Bytes,
}

impl Connection {
    /// Opens a TCP connection and starts its router, but does not yet
    /// perform the OPTIONS/STARTUP handshake.
    async fn new(
        connect_address: SocketAddr,
        config: ConnectionConfig,
    ) -> Result<(Self, ErrorReceiver), ConnectionError> {
        let stream_connector = tokio::time::timeout(
            config.connect_timeout,
            TcpStream::connect(connect_address),
        )
        .await;
        let stream = match stream_connector {
            Ok(stream) => stream?,
            Err(_) => {
                return Err(ConnectionError::ConnectTimeout);
            }
        };
        stream.set_nodelay(config.tcp_nodelay)?;

        if let Some(tcp_keepalive_interval) = config.tcp_keepalive_interval {
            Self::setup_tcp_keepalive(&stream, tcp_keepalive_interval)?;
        }

        let (sender, receiver) = mpsc::channel(1024);
        let (error_sender, error_receiver) = oneshot::channel();
        // Unbounded because it allows for synchronous pushes from Drop.
        let (orphan_notification_sender, orphan_notification_receiver) =
            mpsc::unbounded_channel();

        let router_handle = Arc::new(RouterHandle {
            submit_channel: sender,
            request_id_generator: AtomicU64::new(0),
            orphan_notification_sender,
        });

        let (task, _worker_handle) = Self::router(
            config.clone(),
            stream,
            receiver,
            error_sender,
            orphan_notification_receiver,
            Arc::clone(&router_handle),
        )
        .remote_handle();
        tokio::task::spawn(task);

        let connection = Connection {
            _worker_handle,
            config,
            connect_address,
            router_handle,
        };

        Ok((connection, error_receiver))
    }

    fn setup_tcp_keepalive(
        stream: &TcpStream,
        tcp_keepalive_interval: Duration,
    ) -> std::io::Result<()> {
        // `with_time` is the time until an idle connection begins sending
        // keepalive probes; `with_interval` is the gap between probes.
        let mut tcp_keepalive = TcpKeepalive::new().with_time(tcp_keepalive_interval);

        #[cfg(any(
            target_os = "android",
            target_os = "dragonfly",
            target_os = "freebsd",
            target_os = "fuchsia",
            target_os = "illumos",
            target_os = "ios",
            target_os = "linux",
            target_os = "macos",
            target_os = "netbsd",
            target_os = "tvos",
            target_os = "watchos",
            target_os = "windows",
        ))]
        {
            tcp_keepalive = tcp_keepalive.with_interval(Duration::from_secs(1));
        }

        let sf = SockRef::from(&stream);
        sf.set_tcp_keepalive(&tcp_keepalive)
    }

    pub(crate) fn get_connect_address(&self) -> SocketAddr {
        self.connect_address
    }

    async fn send_request_raw(
        &self,
        request: &impl SerializableRequest,
        compress: bool,
        tracing: bool,
    ) -> Result<(Response, Option<Uuid>, Vec<String>), RequestAttemptError> {
        let compression = if compress {
            self.config.compression
        } else {
            None
        };

        let task_response = self
            .router_handle
            .send_request(request, compression, tracing)
            .await?;

        let body_with_ext = frame::parse_response_body_extensions(
            task_response.params.flags,
            self.config.compression,
            task_response.body,
        )?;

        for warn_description in &body_with_ext.warnings {
            warn!(
                warning = warn_description.as_str(),
                "Response from the database contains a warning",
            );
        }

        let response =
            Response::deserialize(task_response.opcode, &mut &*body_with_ext.body)?;

        Ok((response, body_with_ext.trace_id, body_with_ext.warnings))
    }

    /// Sends a request which may only be answered with RESULT or ERROR
    /// (QUERY, PREPARE, EXECUTE, BATCH).
    async fn send_queryish_request(
        &self,
        request: &impl SerializableRequest,
        tracing: bool,
    ) -> Result<QueryResponse, RequestAttemptError> {
        let (response, tracing_id, warnings) =
            self.send_request_raw(request, true, tracing).await?;

        match response {
            Response::Error(error) => Err(error.into()),
            Response::Result(result) => Ok(QueryResponse {
                result,
                tracing_id,
                warnings,
            }),
            other => Err(RequestAttemptError::UnexpectedResponse(other.kind())),
        }
    }

    async fn get_options(
        &self,
    ) -> Result<murena_cql::frame::response::Supported, RequestAttemptError> {
        let (response, _, _) = self
            .send_request_raw(&request::Options, false, false)
            .await?;
        match response {
            Response::Supported(supported) => Ok(supported),
            Response::Error(error) => Err(error.into()),
            other => Err(RequestAttemptError::UnexpectedResponse(other.kind())),
        }
    }

    /// Performs the STARTUP exchange. On `Ok(None)` the connection is
    /// ready; `Ok(Some(authenticator))` means the server demands
    /// authentication.
    async fn startup(
        &self,
        startup_options: HashMap<Cow<'_, str>, Cow<'_, str>>,
    ) -> Result<Option<String>, RequestAttemptError> {
        let (response, _, _) = self
            .send_request_raw(
                &request::Startup {
                    options: startup_options,
                },
                false,
                false,
            )
            .await?;
        match response {
            Response::Ready => Ok(None),
            Response::Authenticate(authenticator) => Ok(Some(authenticator)),
            Response::Error(error) => Err(error.into()),
            other => Err(RequestAttemptError::UnexpectedResponse(other.kind())),
        }
    }

    /// Prepares a statement on this connection's node and returns the
    /// raw server response.
    pub(crate) async fn prepare_raw(
        &self,
        statement_text: &str,
    ) -> Result<murena_cql::frame::response::result::Prepared, RequestAttemptError> {
        let response = self
            .send_queryish_request(
                &request::Prepare {
                    query: statement_text,
                },
                false,
            )
            .await?;

        match response.result {
            murena_cql::frame::response::result::Result::Prepared(prepared) => Ok(prepared),
            _ => Err(RequestAttemptError::UnexpectedResponse(
                "RESULT, but not Prepared",
            )),
        }
    }

    /// Prepares the statement on this node and records the node-local id
    /// in the statement's id map.
    async fn reprepare(
        &self,
        prepared: &PreparedStatement,
    ) -> Result<Bytes, RequestAttemptError> {
        let raw = self.prepare_raw(prepared.get_statement()).await?;
        prepared.set_id_for(self.connect_address, raw.id.clone());
        Ok(raw.id)
    }

    /// Executes an unprepared QUERY with the given parameters.
    pub(crate) async fn query_with_params(
        &self,
        contents: &str,
        parameters: query::QueryParameters<'_>,
        tracing: bool,
    ) -> Result<QueryResponse, RequestAttemptError> {
        let query = query::Query {
            contents: Cow::Borrowed(contents),
            parameters,
        };

        self.send_queryish_request(&query, tracing).await
    }

    /// A single-page QUERY with default parameters, used by internal
    /// metadata and schema-version reads.
    pub(crate) async fn query_single_page_raw(
        &self,
        contents: &str,
    ) -> Result<QueryResponse, RequestAttemptError> {
        let parameters = query::QueryParameters {
            consistency: Consistency::One,
            ..Default::default()
        };
        self.query_with_params(contents, parameters, false).await
    }

    /// Executes a prepared statement, transparently handling a node-side
    /// eviction: on UNPREPARED, the statement is re-prepared on this node
    /// and the execution is retried exactly once. A second UNPREPARED is
    /// a fatal protocol error.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn execute_with_params(
        &self,
        prepared: &PreparedStatement,
        values: &SerializedValues,
        consistency: Consistency,
        serial_consistency: Option<SerialConsistency>,
        page_size: Option<i32>,
        paging_state: Option<Bytes>,
        timestamp: Option<i64>,
        tracing: bool,
    ) -> Result<QueryResponse, RequestAttemptError> {
        let id = match prepared.id_for(self.connect_address) {
            Some(id) => id,
            None => self.reprepare(prepared).await?,
        };

        let make_execute = |id: Bytes| request::Execute {
            id,
            parameters: query::QueryParameters {
                consistency,
                serial_consistency,
                timestamp,
                page_size,
                paging_state: paging_state.clone(),
                values: Cow::Borrowed(values),
            },
        };

        let result = self
            .send_queryish_request(&make_execute(id), tracing)
            .await;

        let reprepare_reason = match result {
            Err(RequestAttemptError::DbError(DbError::Unprepared { statement_id }, _)) => {
                statement_id
            }
            other => return other,
        };

        debug!(
            node = %self.connect_address,
            statement_id = ?reprepare_reason,
            "Statement evicted on node, re-preparing"
        );
        let new_id = self.reprepare(prepared).await?;

        match self
            .send_queryish_request(&make_execute(new_id), tracing)
            .await
        {
            Err(RequestAttemptError::DbError(DbError::Unprepared { .. }, _)) => {
                Err(RequestAttemptError::RepreparedStatementStillUnprepared)
            }
            other => other,
        }
    }

    /// Sends a BATCH. Prepared entries not yet known to this node are
    /// prepared first; an UNPREPARED response triggers one
    /// re-prepare-and-retry cycle for the evicted entry.
    pub(crate) async fn batch_with_params(
        &self,
        batch: &Batch,
        serialized_value_lists: &[SerializedValues],
        consistency: Consistency,
        serial_consistency: Option<SerialConsistency>,
        timestamp: Option<i64>,
        tracing: bool,
    ) -> Result<QueryResponse, RequestAttemptError> {
        for statement in &batch.statements {
            if let BatchStatement::Prepared(prepared) = statement {
                if prepared.id_for(self.connect_address).is_none() {
                    self.reprepare(prepared).await?;
                }
            }
        }

        let result = self
            .send_batch_frame(
                batch,
                serialized_value_lists,
                consistency,
                serial_consistency,
                timestamp,
                tracing,
            )
            .await;

        let evicted_id = match result {
            Err(RequestAttemptError::DbError(DbError::Unprepared { statement_id }, _)) => {
                statement_id
            }
            other => return other,
        };

        let mut reprepared_any = false;
        for statement in &batch.statements {
            if let BatchStatement::Prepared(prepared) = statement {
                if prepared.id_for(self.connect_address).as_ref() == Some(&evicted_id) {
                    self.reprepare(prepared).await?;
                    reprepared_any = true;
                }
            }
        }
        if !reprepared_any {
            return Err(RequestAttemptError::RepreparedStatementStillUnprepared);
        }

        match self
            .send_batch_frame(
                batch,
                serialized_value_lists,
                consistency,
                serial_consistency,
                timestamp,
                tracing,
            )
            .await
        {
            Err(RequestAttemptError::DbError(DbError::Unprepared { .. }, _)) => {
                Err(RequestAttemptError::RepreparedStatementStillUnprepared)
            }
            other => other,
        }
    }

    async fn send_batch_frame(
        &self,
        batch: &Batch,
        serialized_value_lists: &[SerializedValues],
        consistency: Consistency,
        serial_consistency: Option<SerialConsistency>,
        timestamp: Option<i64>,
        tracing: bool,
    ) -> Result<QueryResponse, RequestAttemptError> {
        let mut statements = Vec::with_capacity(batch.statements.len());
        for statement in &batch.statements {
            let frame_statement = match statement {
                BatchStatement::Query(statement) => batch::BatchStatement::Query {
                    text: Cow::Borrowed(statement.get_contents()),
                },
                BatchStatement::Prepared(prepared) => {
                    let id = prepared
                        .id_for(self.connect_address)
                        .ok_or(RequestAttemptError::MissingPreparedId)?;
                    batch::BatchStatement::Prepared {
                        id: Cow::Owned(id.to_vec()),
                    }
                }
            };
            statements.push(frame_statement);
        }

        let frame_batch = batch::Batch {
            batch_type: batch.get_type(),
            statements,
            values: serialized_value_lists.to_vec(),
            consistency,
            serial_consistency,
            timestamp,
        };

        self.send_queryish_request(&frame_batch, tracing).await
    }

    /// Switches the connection to the given keyspace with a `USE` request.
    pub(crate) async fn use_keyspace(
        &self,
        keyspace_name: &VerifiedKeyspaceName,
    ) -> Result<(), UseKeyspaceError> {
        // Trying to pass the keyspace as a bound value in "USE ?" does not
        // work, so the name is glued into the statement text; the name is
        // validated on construction to rule out injection.
        let query_text = format!("USE {}", keyspace_name.cql_form());
        let response = self.query_single_page_raw(&query_text).await?;

        match response.result {
            murena_cql::frame::response::result::Result::SetKeyspace(set_keyspace) => {
                let matches = if keyspace_name.is_case_sensitive() {
                    set_keyspace.keyspace_name == keyspace_name.as_str()
                } else {
                    set_keyspace.keyspace_name.eq_ignore_ascii_case(keyspace_name.as_str())
                };
                if matches {
                    Ok(())
                } else {
                    Err(UseKeyspaceError::KeyspaceNameMismatch {
                        expected: keyspace_name.as_str().to_owned(),
                        actual: set_keyspace.keyspace_name,
                    })
                }
            }
            _ => Err(UseKeyspaceError::RequestError(
                RequestAttemptError::UnexpectedResponse("RESULT, but not SetKeyspace"),
            )),
        }
    }

    /// Reads the schema version this node currently reports.
    pub(crate) async fn fetch_schema_version(&self) -> Result<Uuid, SchemaAgreementError> {
        let response = self.query_single_page_raw(SCHEMA_VERSION_QUERY).await?;

        match response.result {
            murena_cql::frame::response::result::Result::Rows(rows) => rows
                .rows
                .first()
                .and_then(|row| row.columns.first())
                .and_then(|cell| cell.as_ref())
                .and_then(CqlValue::as_uuid)
                .ok_or(SchemaAgreementError::MissingSchemaVersion),
            _ => Err(SchemaAgreementError::MissingSchemaVersion),
        }
    }

    async fn router(
        config: ConnectionConfig,
        stream: TcpStream,
        receiver: mpsc::Receiver<Task>,
        error_sender: oneshot::Sender<ConnectionError>,
        orphan_notification_receiver: mpsc::UnboundedReceiver<RequestId>,
        router_handle: Arc<RouterHandle>,
    ) {
        let (read_half, write_half) = split(stream);

        // The handler map is shared between the reader and writer futures,
        // which run on the same task; the mutex is never contended and no
        // lock is held across an await point, hence try_lock().unwrap().
        let handler_map = StdMutex::new(ResponseHandlerMap::new());

        let k = Self::keepaliver(
            router_handle,
            config.keepalive_interval,
            config.keepalive_timeout,
        );
        let r = Self::reader(BufReader::with_capacity(8192, read_half), &handler_map);
        let w = Self::writer(
            BufWriter::with_capacity(8192, write_half),
            &handler_map,
            receiver,
        );
        let o = Self::orphaner(&handler_map, orphan_notification_receiver);

        let result = futures::try_join!(r, w, o, k);

        let error: BrokenConnectionError = match result {
            Ok(_) => return, // Connection was dropped, we can return
            Err(err) => err,
        };

        // Respond to all pending requests with the error.
        let response_handlers: HashMap<i16, ResponseHandler> =
            handler_map.into_inner().unwrap().into_handlers();

        for (_, handler) in response_handlers {
            // Ignore sending error, request was dropped.
            let _ = handler
                .response_sender
                .send(Err(RequestAttemptError::BrokenConnectionError(
                    error.clone(),
                )));
        }

        // If someone is listening for connection errors, notify them.
        let _ = error_sender.send(error.into());
    }

    async fn reader(
        mut read_half: impl AsyncRead + Unpin,
        handler_map: &StdMutex<ResponseHandlerMap>,
    ) -> Result<(), BrokenConnectionError> {
        loop {
            let (params, opcode, body) = frame::read_response_frame(&mut read_half)
                .await
                .map_err(BrokenConnectionErrorKind::FrameHeaderParseError)?;
            let response = TaskResponse {
                params,
                opcode,
                body,
            };

            match params.stream.cmp(&-1) {
                Ordering::Less => {
                    // The protocol reserves negative streams for
                    // server-generated frames; none other than -1 exist.
                    continue;
                }
                Ordering::Equal => {
                    // Server events. This driver never sends REGISTER,
                    // so nothing to dispatch.
                    continue;
                }
                _ => {}
            }

            let handler_lookup_res = {
                let mut handler_map_guard = handler_map.try_lock().unwrap();
                handler_map_guard.lookup(params.stream)
            };

            match handler_lookup_res {
                HandlerLookupResult::Handler(handler) => {
                    // The receiver may have given up waiting; that is fine.
                    let _ = handler.response_sender.send(Ok(response));
                }
                HandlerLookupResult::Missing => {
                    // Unsolicited frame, indicates a bug on either side.
                    debug!(
                        "Received response with unexpected stream id {}",
                        params.stream
                    );
                    return Err(
                        BrokenConnectionErrorKind::UnexpectedStreamId(params.stream).into()
                    );
                }
                HandlerLookupResult::Orphaned => {
                    // The waiter is long gone; the stream id was freed
                    // during lookup.
                }
            }
        }
    }

    fn alloc_stream_id(
        handler_map: &StdMutex<ResponseHandlerMap>,
        response_handler: ResponseHandler,
    ) -> Option<i16> {
        let mut handler_map_guard = handler_map.try_lock().unwrap();
        match handler_map_guard.allocate(response_handler) {
            Ok(stream_id) => Some(stream_id),
            Err(response_handler) => {
                error!("Could not allocate stream id");
                let _ = response_handler
                    .response_sender
                    .send(Err(RequestAttemptError::UnableToAllocStreamId));
                None
            }
        }
    }

    async fn writer(
        mut write_half: impl AsyncWrite + Unpin,
        handler_map: &StdMutex<ResponseHandlerMap>,
        mut task_receiver: mpsc::Receiver<Task>,
    ) -> Result<(), BrokenConnectionError> {
        // When the Connection object is dropped, the sender half of the
        // channel is dropped too, ending this loop and the whole router.
        while let Some(mut task) = task_receiver.recv().await {
            let mut num_requests = 0;
            let mut total_sent = 0;
            while let Some(stream_id) = Self::alloc_stream_id(handler_map, task.response_handler)
            {
                let mut req = task.serialized_request;
                req.set_stream(stream_id);
                let req_data: &[u8] = req.get_data();
                total_sent += req_data.len();
                num_requests += 1;
                write_half
                    .write_all(req_data)
                    .await
                    .map_err(BrokenConnectionErrorKind::WriteError)?;
                task = match task_receiver.try_recv() {
                    Ok(t) => t,
                    Err(_) => break,
                }
            }
            trace!("Sending {} requests; {} bytes", num_requests, total_sent);
            write_half
                .flush()
                .await
                .map_err(BrokenConnectionErrorKind::WriteError)?;
        }

        Ok(())
    }

    // Receives notifications from `OrphanhoodNotifier`s and marks streams
    // as orphaned. Also periodically checks the count of old orphans;
    // a connection exceeding the threshold is broken, as its stream ids
    // are leaking.
    async fn orphaner(
        handler_map: &StdMutex<ResponseHandlerMap>,
        mut orphan_receiver: mpsc::UnboundedReceiver<RequestId>,
    ) -> Result<(), BrokenConnectionError> {
        let mut interval = tokio::time::interval(OLD_ORPHAN_AGE);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let handler_map_guard = handler_map.try_lock().unwrap();
                    let old_orphan_count = handler_map_guard.old_orphans_count();
                    if old_orphan_count > OLD_ORPHAN_COUNT_THRESHOLD {
                        warn!(
                            "Too many old orphaned stream ids: {}",
                            old_orphan_count,
                        );
                        return Err(BrokenConnectionErrorKind::TooManyOrphanedStreamIds(old_orphan_count).into());
                    }
                }
                Some(request_id) = orphan_receiver.recv() => {
                    trace!(
                        "Trying to orphan stream id associated with request_id = {}",
                        request_id,
                    );
                    let mut handler_map_guard = handler_map.try_lock().unwrap();
                    handler_map_guard.orphan(request_id);
                }
                else => { break }
            }
        }

        Ok(())
    }

    async fn keepaliver(
        router_handle: Arc<RouterHandle>,
        keepalive_interval: Option<Duration>,
        keepalive_timeout: Option<Duration>,
    ) -> Result<(), BrokenConnectionError> {
        let Some(keepalive_interval) = keepalive_interval else {
            // Keepalives are disabled, nothing to do forever.
            return futures::future::pending().await;
        };

        let mut interval = tokio::time::interval(keepalive_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; the connection was just
        // opened, so skip it.
        interval.tick().await;

        loop {
            interval.tick().await;

            let keepalive_query = router_handle.send_request(&request::Options, None, false);
            let result = match keepalive_timeout {
                Some(timeout) => match tokio::time::timeout(timeout, keepalive_query).await {
                    Ok(res) => res,
                    Err(_) => {
                        warn!(
                            "Timed out while waiting for response to a keepalive request"
                        );
                        return Err(
                            BrokenConnectionErrorKind::KeepaliveTimeout(timeout).into()
                        );
                    }
                },
                None => keepalive_query.await,
            };
            if let Err(err) = result {
                warn!("Failed to execute a keepalive request: {}", err);
                return Err(BrokenConnectionErrorKind::KeepaliveError(err.to_string()).into());
            }
        }
    }
}

/// Opens a connection and brings it through the OPTIONS/STARTUP
/// negotiation so that it is ready for queries.
pub(crate) async fn open_connection(
    connect_address: SocketAddr,
    config: &ConnectionConfig,
) -> Result<(Connection, ErrorReceiver), ConnectionError> {
    let (connection, error_receiver) = Connection::new(connect_address, config.clone()).await?;

    let supported = connection
        .get_options()
        .await
        .map_err(|err| ConnectionError::SetupRequestError(Arc::new(err)))?;

    let mut startup_options: HashMap<Cow<'_, str>, Cow<'_, str>> = HashMap::new();
    startup_options.insert(
        Cow::Borrowed(options::CQL_VERSION),
        Cow::Borrowed(options::DEFAULT_CQL_PROTOCOL_VERSION),
    );
    startup_options.insert(
        Cow::Borrowed(options::DRIVER_NAME),
        Cow::Borrowed(options::DEFAULT_DRIVER_NAME),
    );
    startup_options.insert(
        Cow::Borrowed(options::DRIVER_VERSION),
        Cow::Borrowed(options::DEFAULT_DRIVER_VERSION),
    );

    if let Some(compression) = config.compression {
        let advertised = supported
            .options
            .get(options::COMPRESSION)
            .is_some_and(|algorithms| {
                algorithms.iter().any(|a| *a == compression.to_string())
            });
        if !advertised {
            return Err(ConnectionError::CompressionNotSupported(compression));
        }
        startup_options.insert(
            Cow::Borrowed(options::COMPRESSION),
            Cow::Owned(compression.to_string()),
        );
    }

    let authenticator = connection
        .startup(startup_options)
        .await
        .map_err(|err| ConnectionError::SetupRequestError(Arc::new(err)))?;
    if let Some(authenticator) = authenticator {
        return Err(ConnectionError::AuthenticationRequired(authenticator));
    }

    Ok((connection, error_receiver))
}

struct OrphanageTracker {
    orphans: HashMap<i16, Instant>,
}

impl OrphanageTracker {
    fn new() -> Self {
        Self {
            orphans: HashMap::new(),
        }
    }

    fn insert(&mut self, stream_id: i16) {
        self.orphans.insert(stream_id, Instant::now());
    }

    fn remove(&mut self, stream_id: i16) {
        self.orphans.remove(&stream_id);
    }

    fn contains(&self, stream_id: i16) -> bool {
        self.orphans.contains_key(&stream_id)
    }

    fn orphans_older_than(&self, age: Duration) -> usize {
        let minimal_age = Instant::now() - age;
        self.orphans
            .values()
            .filter(|&&instant| instant <= minimal_age)
            .count()
    }
}

struct ResponseHandlerMap {
    stream_set: StreamIdSet,
    handlers: HashMap<i16, ResponseHandler>,
    request_to_stream: HashMap<RequestId, i16>,
    orphanage: OrphanageTracker,
}

enum HandlerLookupResult {
    Orphaned,
    Handler(ResponseHandler),
    Missing,
}

impl ResponseHandlerMap {
    fn new() -> Self {
        Self {
            stream_set: StreamIdSet::new(),
            handlers: HashMap::new(),
            request_to_stream: HashMap::new(),
            orphanage: OrphanageTracker::new(),
        }
    }

    fn allocate(&mut self, response_handler: ResponseHandler) -> Result<i16, ResponseHandler> {
        if let Some(stream_id) = self.stream_set.allocate() {
            self.request_to_stream
                .insert(response_handler.request_id, stream_id);
            let prev_handler = self.handlers.insert(stream_id, response_handler);
            debug_assert!(prev_handler.is_none());
            Ok(stream_id)
        } else {
            Err(response_handler)
        }
    }

    fn orphan(&mut self, request_id: RequestId) {
        if let Some(stream_id) = self.request_to_stream.remove(&request_id) {
            self.orphanage.insert(stream_id);
            self.handlers.remove(&stream_id);
        }
    }

    fn old_orphans_count(&self) -> usize {
        self.orphanage.orphans_older_than(OLD_ORPHAN_AGE)
    }

    fn lookup(&mut self, stream_id: i16) -> HandlerLookupResult {
        if self.orphanage.contains(stream_id) {
            // The reply to an orphaned request finally came;
            // the stream id can be reused.
            self.orphanage.remove(stream_id);
            self.stream_set.free(stream_id);
            return HandlerLookupResult::Orphaned;
        }

        if let Some(handler) = self.handlers.remove(&stream_id) {
            self.request_to_stream.remove(&handler.request_id);
            self.stream_set.free(stream_id);
            HandlerLookupResult::Handler(handler)
        } else {
            HandlerLookupResult::Missing
        }
    }

    // Consumes the map into handlers of all pending requests,
    // used when the connection breaks.
    fn into_handlers(self) -> HashMap<i16, ResponseHandler> {
        self.handlers
    }
}

/// Bitmap of the 32768 protocol stream ids of a connection.
struct StreamIdSet {
    used_bitmap: Box<[u64]>,
}

impl StreamIdSet {
    const STREAM_COUNT: usize = (i16::MAX as usize) + 1;

    fn new() -> Self {
        let streams_number = Self::STREAM_COUNT;
        let words_number = streams_number / 64;
        Self {
            used_bitmap: vec![0; words_number].into_boxed_slice(),
        }
    }

    fn allocate(&mut self) -> Option<i16> {
        for (block_id, block) in self.used_bitmap.iter_mut().enumerate() {
            if *block != !0 {
                let off = block.trailing_ones();
                *block |= 1u64 << off;
                let stream_id = off as i16 + (block_id * 64) as i16;
                return Some(stream_id);
            }
        }
        None
    }

    fn free(&mut self, stream_id: i16) {
        let block_id = stream_id as usize / 64;
        let off = stream_id as usize % 64;
        self.used_bitmap[block_id] &= !(1 << off);
    }
}

/// A keyspace name which went through validation, safe to glue into
/// a `USE` statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedKeyspaceName {
    name: Arc<String>,
    case_sensitive: bool,
}

impl VerifiedKeyspaceName {
    pub fn new(keyspace_name: String, case_sensitive: bool) -> Result<Self, BadKeyspaceName> {
        Self::verify_keyspace_name_is_valid(&keyspace_name)?;

        Ok(VerifiedKeyspaceName {
            name: Arc::new(keyspace_name),
            case_sensitive,
        })
    }

    pub fn as_str(&self) -> &str {
        self.name.as_str()
    }

    pub fn is_case_sensitive(&self) -> bool {
        self.case_sensitive
    }

    /// The form to splice into a `USE` statement: quoted when
    /// case sensitive.
    pub(crate) fn cql_form(&self) -> String {
        if self.case_sensitive {
            format!("\"{}\"", self.name)
        } else {
            self.name.to_string()
        }
    }

    // Keyspace name can have up to 48 alphanumeric characters and
    // contain underscores.
    fn verify_keyspace_name_is_valid(keyspace_name: &str) -> Result<(), BadKeyspaceName> {
        if keyspace_name.is_empty() {
            return Err(BadKeyspaceName::Empty);
        }

        // Verify that length <= 48
        let keyspace_name_len = keyspace_name.chars().count();
        if keyspace_name_len > 48 {
            return Err(BadKeyspaceName::TooLong(
                keyspace_name.to_string(),
                keyspace_name_len,
            ));
        }

        // Verify all chars are alphanumeric or underscore
        for character in keyspace_name.chars() {
            match character {
                'a'..='z' | 'A'..='Z' | '0'..='9' | '_' => {}
                _ => {
                    return Err(BadKeyspaceName::IllegalCharacter(
                        keyspace_name.to_string(),
                        character,
                    ));
                }
            };
        }

        Ok(())
    }
}
