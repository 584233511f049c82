//! A batch of statements executed in a single round-trip.

use std::sync::Arc;
use std::time::Duration;

use super::{Consistency, SerialConsistency, StatementConfig};
use crate::policies::retry::RetryPolicy;
use crate::statement::prepared::PreparedStatement;
use crate::statement::unprepared::Statement;

pub use murena_cql::frame::request::batch::BatchType;

/// One entry of a batch.
#[derive(Debug, Clone)]
pub enum BatchStatement {
    Query(Statement),
    Prepared(PreparedStatement),
}

/// An ordered sequence of statements sent as one frame.
///
/// A LOGGED batch asks the coordinator for best-effort atomicity across
/// partitions; UNLOGGED batches carry no atomicity expectation and exist
/// to reduce round-trips for same-partition writes. COUNTER batches may
/// only contain counter mutations and LOGGED/UNLOGGED ones may not -
/// the server enforces this and reports violations as an Invalid error.
#[derive(Debug, Clone)]
pub struct Batch {
    pub(crate) config: StatementConfig,

    batch_type: BatchType,
    /// The statements of the batch, in execution order.
    pub statements: Vec<BatchStatement>,
}

impl Batch {
    /// Creates a new, empty batch of the given kind.
    pub fn new(batch_type: BatchType) -> Self {
        Self {
            batch_type,
            statements: Vec::new(),
            config: Default::default(),
        }
    }

    /// Appends a statement to the batch.
    pub fn append_statement(&mut self, statement: impl Into<BatchStatement>) {
        self.statements.push(statement.into());
    }

    pub fn get_type(&self) -> BatchType {
        self.batch_type
    }

    /// Sets the consistency applied to all statements of this batch.
    pub fn with_consistency(mut self, consistency: Consistency) -> Self {
        self.config.consistency = Some(consistency);
        self
    }

    pub fn get_consistency(&self) -> Option<Consistency> {
        self.config.consistency
    }

    /// Sets the serial consistency of conditional writes in this batch.
    pub fn with_serial_consistency(
        mut self,
        serial_consistency: Option<SerialConsistency>,
    ) -> Self {
        self.config.serial_consistency = Some(serial_consistency);
        self
    }

    /// Sets the client-side timestamp, in microseconds, applied to the
    /// whole batch.
    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.config.timestamp = Some(timestamp);
        self
    }

    /// Sets the per-request timeout, overriding the session default.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = Some(timeout);
        self
    }

    /// Requests tracing of this batch's executions.
    pub fn with_tracing(mut self, tracing: bool) -> Self {
        self.config.tracing = tracing;
        self
    }

    /// Marks this batch as idempotent, making it eligible for automatic
    /// retries after errors where the writes could plausibly have been
    /// applied.
    pub fn set_idempotent(&mut self, is_idempotent: bool) {
        self.config.is_idempotent = is_idempotent;
    }

    /// Builder-style variant of [`Batch::set_idempotent`].
    pub fn with_idempotent(mut self, is_idempotent: bool) -> Self {
        self.config.is_idempotent = is_idempotent;
        self
    }

    /// Sets a batch-specific retry policy, overriding the session's.
    pub fn with_retry_policy(mut self, retry_policy: Arc<dyn RetryPolicy>) -> Self {
        self.config.retry_policy = Some(retry_policy);
        self
    }

    pub fn is_idempotent(&self) -> bool {
        self.config.is_idempotent
    }
}

impl Default for Batch {
    fn default() -> Self {
        Batch::new(BatchType::Logged)
    }
}

impl From<Statement> for BatchStatement {
    fn from(statement: Statement) -> Self {
        BatchStatement::Query(statement)
    }
}

impl From<&str> for BatchStatement {
    fn from(contents: &str) -> Self {
        BatchStatement::Query(Statement::new(contents))
    }
}

impl From<PreparedStatement> for BatchStatement {
    fn from(prepared: PreparedStatement) -> Self {
        BatchStatement::Prepared(prepared)
    }
}
