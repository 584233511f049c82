//! Errors surfaced by the driver.
//!
//! The layering follows the request path: [`RequestAttemptError`] describes
//! one failed attempt on one connection, [`ExecutionError`] is what a caller
//! sees once retries are exhausted, and the connection/pool error types
//! describe why a node could not be reached at all.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use murena_cql::frame::frame_errors::{FrameError, ParseError};
use murena_cql::frame::Compression;
use murena_cql::value::SerializeValuesError;

pub use murena_cql::frame::response::error::{DbError, WriteType};

/// An error that occurred during request execution, after all internal
/// recovery (retries, re-preparation) has been exhausted.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ExecutionError {
    /// Caller passed an invalid query or invalid bound values.
    #[error(transparent)]
    BadQuery(#[from] BadQuery),

    /// The load balancing policy produced no coordinator candidates.
    /// Either the cluster is empty or every node is marked down.
    #[error("No nodes available to execute the request")]
    EmptyPlan,

    /// All candidate coordinators were exhausted; carries the error
    /// of the last attempt.
    #[error(transparent)]
    LastAttemptError(#[from] RequestAttemptError),

    /// Selected node's connection pool is in invalid state.
    #[error("No connections in the pool: {0}")]
    ConnectionPoolError(#[from] ConnectionPoolError),

    /// Request exceeded its effective timeout before any response arrived.
    /// The server may still apply the request.
    #[error("Request timeout after {0:?}")]
    RequestTimeout(Duration),

    /// `USE keyspace` failed.
    #[error(transparent)]
    UseKeyspaceError(#[from] UseKeyspaceError),

    /// A schema agreement check failed with a hard error.
    #[error(transparent)]
    SchemaAgreementError(#[from] SchemaAgreementError),
}

/// An error of a single attempt of a QUERY, PREPARE, EXECUTE or BATCH
/// request on a single connection.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RequestAttemptError {
    /// Database sent a response containing some error with a message.
    #[error("Database returned an error: {0}, Error message: {1}")]
    DbError(DbError, String),

    /// Failed to serialize the request frame.
    #[error("Failed to serialize a frame: {0}")]
    FrameError(#[from] FrameError),

    /// Received a server response, but failed to deserialize it.
    #[error("Failed to deserialize a response: {0}")]
    ParseError(#[from] ParseError),

    /// Received an unexpected response kind.
    #[error("Received unexpected response from the server: {0}. Expected RESULT or ERROR response")]
    UnexpectedResponse(&'static str),

    /// The connection died while the request was in flight.
    #[error(transparent)]
    BrokenConnectionError(#[from] BrokenConnectionError),

    /// All 32768 stream ids of the connection are taken.
    #[error("Unable to allocate stream id")]
    UnableToAllocStreamId,

    /// Bound values could not be serialized.
    #[error(transparent)]
    SerializationError(#[from] SerializeValuesError),

    /// A second UNPREPARED response arrived right after re-preparing
    /// the statement on the node; treated as fatal per the execution
    /// state machine.
    #[error("Statement reported unprepared again right after re-preparation")]
    RepreparedStatementStillUnprepared,

    /// The statement has no id recorded for the target node although
    /// it was just prepared there.
    #[error("Prepared statement has no id recorded for the target node")]
    MissingPreparedId,
}

impl From<murena_cql::frame::response::error::Error> for RequestAttemptError {
    fn from(error: murena_cql::frame::response::error::Error) -> Self {
        RequestAttemptError::DbError(error.error, error.reason)
    }
}

/// Caller misuse detected before any frame was sent.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum BadQuery {
    /// Failed to serialize values passed to a request.
    #[error("Serializing values failed: {0}")]
    SerializeValuesError(#[from] SerializeValuesError),

    /// Number of bound values does not match the statement's bind markers.
    #[error("Expected {expected} values for the statement, got {got}")]
    ValueCountMismatch { got: usize, expected: usize },

    /// A named value does not match any bind marker of the statement.
    #[error("No bind marker with name {0} in the statement")]
    UnknownNamedParameter(String),

    /// A bind marker was given no value.
    #[error("Missing value for bind marker {0}")]
    MissingNamedParameter(String),

    /// Batch entries carry no per-statement names-for-values flag, so
    /// named values only work for prepared entries, where the driver
    /// can reorder them.
    #[error("Named values in a batch require a prepared statement")]
    NamedValuesInBatch,

    /// Passed invalid keyspace name to use.
    #[error("Passed invalid keyspace name to use: {0}")]
    BadKeyspaceName(#[from] BadKeyspaceName),

    /// Batches can carry at most u16::MAX statements.
    #[error("Too many statements in the batch: {0}")]
    TooManyQueriesInBatchStatement(usize),
}

/// Invalid keyspace name given to `use_keyspace()`.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum BadKeyspaceName {
    /// Keyspace name is empty.
    #[error("Keyspace name is empty")]
    Empty,

    /// Keyspace name too long, must be up to 48 characters.
    #[error("Keyspace name too long, must be up to 48 characters, found {1} characters. Bad keyspace name: {0}")]
    TooLong(String, usize),

    /// Illegal character - only alphanumeric and underscores allowed.
    #[error("Illegal character found: {1}, only alphanumeric and underscores allowed. Bad keyspace name: {0}")]
    IllegalCharacter(String, char),
}

/// An error that occurred during `Session` creation.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum NewSessionError {
    /// List of known nodes passed to the builder is empty.
    /// There needs to be at least one node to connect to.
    #[error("Empty known nodes list")]
    EmptyKnownNodesList,

    /// Failed to resolve any of the hostnames passed in Session creation.
    #[error("Couldn't resolve any hostname: {0:?}")]
    FailedToResolveAnyHostname(Vec<String>),

    /// None of the contact nodes could be connected to.
    #[error("Could not connect to any contact node: {0}")]
    FailedToConnect(#[from] ConnectionPoolError),

    /// A request issued during session setup failed.
    #[error(transparent)]
    ExecutionError(#[from] ExecutionError),

    /// Setting the initial keyspace failed.
    #[error(transparent)]
    UseKeyspaceError(#[from] UseKeyspaceError),
}

/// An error that occurred when opening a single connection.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ConnectionError {
    #[error("Connect timeout elapsed")]
    ConnectTimeout,

    #[error("IO Error: {0}")]
    IoError(Arc<std::io::Error>),

    /// The OPTIONS/STARTUP negotiation failed.
    #[error("Could not set up the connection: {0}")]
    SetupRequestError(Arc<RequestAttemptError>),

    /// The server demands authentication, which the driver does not
    /// implement.
    #[error("The server requires authentication with {0}, which is not supported")]
    AuthenticationRequired(String),

    /// The configured compression algorithm was not advertised
    /// by the server.
    #[error("Compression {0} is not supported by the server")]
    CompressionNotSupported(Compression),

    #[error(transparent)]
    BrokenConnection(#[from] BrokenConnectionError),
}

impl From<std::io::Error> for ConnectionError {
    fn from(err: std::io::Error) -> Self {
        ConnectionError::IoError(Arc::new(err))
    }
}

/// An error that caused a connection to break. Every request in flight
/// on the connection completes with this error.
#[derive(Error, Debug, Clone)]
#[error("Connection broken, reason: {0}")]
pub struct BrokenConnectionError(Arc<BrokenConnectionErrorKind>);

impl BrokenConnectionError {
    pub fn kind(&self) -> &BrokenConnectionErrorKind {
        &self.0
    }
}

impl From<BrokenConnectionErrorKind> for BrokenConnectionError {
    fn from(kind: BrokenConnectionErrorKind) -> Self {
        BrokenConnectionError(Arc::new(kind))
    }
}

/// The reason a connection broke.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BrokenConnectionErrorKind {
    #[error("Failed to read a response frame: {0}")]
    FrameHeaderParseError(FrameError),

    #[error("Failed to write a request frame: {0}")]
    WriteError(std::io::Error),

    #[error("Keepalive request failed: {0}")]
    KeepaliveError(String),

    #[error("Keepalive request timed out after {0:?}")]
    KeepaliveTimeout(Duration),

    #[error("Router task channel closed")]
    ChannelError,

    #[error("Received a response with unexpected stream id {0}")]
    UnexpectedStreamId(i16),

    #[error("Too many orphaned stream ids: {0}")]
    TooManyOrphanedStreamIds(usize),
}

/// Selected node's connection pool cannot provide a connection.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ConnectionPoolError {
    /// The pool is still opening its first connection.
    #[error("The pool is still being initialized")]
    Initializing,

    /// Every connection attempt failed; the node is marked down
    /// and reconnects are scheduled with backoff.
    #[error("The node is unreachable: {last_connection_error}")]
    Broken {
        last_connection_error: ConnectionError,
    },
}

/// `USE keyspace` failed.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum UseKeyspaceError {
    #[error(transparent)]
    BadKeyspaceName(#[from] BadKeyspaceName),

    #[error("The USE request failed: {0}")]
    RequestError(#[from] RequestAttemptError),

    /// The server confirmed a different keyspace than requested.
    #[error("Keyspace name mismatch after USE; expected {expected}, got {actual}")]
    KeyspaceNameMismatch { expected: String, actual: String },
}

/// A hard failure while polling for schema agreement.
///
/// An agreement check which merely timed out is not an error -
/// `await_schema_agreement` reports that by returning `false`.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum SchemaAgreementError {
    #[error(transparent)]
    ConnectionPoolError(#[from] ConnectionPoolError),

    #[error("The schema version request failed: {0}")]
    RequestError(#[from] RequestAttemptError),

    #[error("The schema version query returned no usable schema_version column")]
    MissingSchemaVersion,

    #[error("No node is reachable to poll schema versions from")]
    NoReachableNodes,
}

/// An error that occurred when fetching cluster metadata.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum MetadataError {
    #[error(transparent)]
    ConnectionPoolError(#[from] ConnectionPoolError),

    #[error("A metadata query failed: {0}")]
    RequestError(#[from] RequestAttemptError),

    #[error("Metadata query returned rows of unexpected shape: {0}")]
    MalformedRow(&'static str),
}
