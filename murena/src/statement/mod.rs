//! Statements: unprepared text, prepared statements and batches, plus
//! the per-statement execution options overlay.

pub mod batch;
pub(crate) mod cache;
pub mod prepared;
pub mod unprepared;

use std::sync::Arc;
use std::time::Duration;

pub use murena_cql::frame::types::{Consistency, SerialConsistency};

use crate::policies::retry::RetryPolicy;

/// Per-statement execution options. Every field overrides the session
/// default when set.
#[derive(Debug, Clone, Default)]
pub(crate) struct StatementConfig {
    pub(crate) consistency: Option<Consistency>,
    pub(crate) serial_consistency: Option<Option<SerialConsistency>>,

    pub(crate) is_idempotent: bool,

    pub(crate) tracing: bool,
    pub(crate) timestamp: Option<i64>,
    pub(crate) request_timeout: Option<Duration>,

    pub(crate) retry_policy: Option<Arc<dyn RetryPolicy>>,
}

impl StatementConfig {
    /// Determines the consistency of a request.
    pub(crate) fn determine_consistency(&self, default_consistency: Consistency) -> Consistency {
        self.consistency.unwrap_or(default_consistency)
    }
}

/// A validated, positive page size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageSize(i32);

impl PageSize {
    /// Creates a page size; panics if the argument is not positive.
    pub fn new(size: i32) -> Self {
        assert!(size > 0, "page size must be positive, got {}", size);
        Self(size)
    }

    pub fn inner(self) -> i32 {
        self.0
    }
}

impl Default for PageSize {
    fn default() -> Self {
        Self(5000)
    }
}

#[cfg(test)]
mod tests {
    use super::PageSize;

    #[test]
    fn default_page_size_is_positive() {
        assert!(PageSize::default().inner() > 0);
    }

    #[test]
    #[should_panic(expected = "page size must be positive")]
    fn nonpositive_page_size_is_rejected() {
        PageSize::new(0);
    }
}
