//! Responses of the driver: the internal per-request response wrapper
//! and the caller-facing query result.

pub mod query_result;

use uuid::Uuid;

use murena_cql::frame::response::result;

/// A deserialized RESULT response plus its frame-level extensions.
pub(crate) struct QueryResponse {
    pub(crate) result: result::Result,
    pub(crate) tracing_id: Option<Uuid>,
    pub(crate) warnings: Vec<String>,
}
