//! An unprepared CQL statement: raw text plus execution options.

use std::sync::Arc;
use std::time::Duration;

use super::{Consistency, PageSize, SerialConsistency, StatementConfig};
use crate::policies::retry::RetryPolicy;

/// Raw CQL text plus the execution-options overlay. Carries no
/// cross-node identifier; the server parses the text on every execution.
#[derive(Debug, Clone, Default)]
pub struct Statement {
    pub(crate) config: StatementConfig,

    contents: String,
    page_size: PageSize,
}

impl Statement {
    /// Creates a new [`Statement`] from a CQL statement string.
    pub fn new(contents: impl Into<String>) -> Self {
        Self {
            contents: contents.into(),
            page_size: PageSize::default(),
            config: Default::default(),
        }
    }

    /// The statement text.
    pub fn get_contents(&self) -> &str {
        &self.contents
    }

    /// Returns self with the page size set to the given value.
    ///
    /// Panics if the given number is nonpositive.
    pub fn with_page_size(mut self, page_size: i32) -> Self {
        self.page_size = PageSize::new(page_size);
        self
    }

    pub fn get_page_size(&self) -> i32 {
        self.page_size.inner()
    }

    /// Sets the consistency to be used when executing this statement.
    pub fn with_consistency(mut self, consistency: Consistency) -> Self {
        self.config.consistency = Some(consistency);
        self
    }

    pub fn get_consistency(&self) -> Option<Consistency> {
        self.config.consistency
    }

    /// Sets the serial consistency of this statement.
    /// (Ignored unless the statement is a conditional write.)
    pub fn with_serial_consistency(
        mut self,
        serial_consistency: Option<SerialConsistency>,
    ) -> Self {
        self.config.serial_consistency = Some(serial_consistency);
        self
    }

    /// Sets the client-side timestamp, in microseconds, overriding the
    /// server-assigned one.
    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.config.timestamp = Some(timestamp);
        self
    }

    /// Sets the per-request timeout, overriding the session default.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = Some(timeout);
        self
    }

    /// Requests tracing of this statement's execution; the resulting
    /// tracing id is available on the query result.
    pub fn with_tracing(mut self, tracing: bool) -> Self {
        self.config.tracing = tracing;
        self
    }

    /// Marks this statement as idempotent.
    ///
    /// Idempotent statements can be retried after errors where a write
    /// could plausibly have been applied; non-idempotent ones cannot,
    /// to avoid duplicate application.
    pub fn set_idempotent(&mut self, is_idempotent: bool) {
        self.config.is_idempotent = is_idempotent;
    }

    /// Builder-style variant of [`Statement::set_idempotent`].
    pub fn with_idempotent(mut self, is_idempotent: bool) -> Self {
        self.config.is_idempotent = is_idempotent;
        self
    }

    /// Sets a statement-specific retry policy, overriding the session's.
    pub fn with_retry_policy(mut self, retry_policy: Arc<dyn RetryPolicy>) -> Self {
        self.config.retry_policy = Some(retry_policy);
        self
    }

    pub fn is_idempotent(&self) -> bool {
        self.config.is_idempotent
    }
}

impl From<String> for Statement {
    fn from(contents: String) -> Statement {
        Statement::new(contents)
    }
}

impl From<&str> for Statement {
    fn from(contents: &str) -> Statement {
        Statement::new(contents)
    }
}
