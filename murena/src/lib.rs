//! Async CQL driver core for clusters speaking the CQL binary protocol
//! (Apache Cassandra™ and ScyllaDB compatible).
//!
//! The entry point is [`client::session_builder::SessionBuilder`], which
//! resolves the initial contact nodes and produces a
//! [`client::session::Session`]. The session owns the topology registry,
//! the per-node connection pools and the prepared statement cache, and
//! drives every request through coordinator selection, retries and paging.
//!
//! ```rust,no_run
//! # use murena::client::session_builder::SessionBuilder;
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let session = SessionBuilder::new()
//!     .known_node("127.0.0.1:9042")
//!     .build()
//!     .await?;
//!
//! let result = session
//!     .query("SELECT host_id FROM system.local", ())
//!     .await?;
//! for row in result.rows() {
//!     println!("{:?}", row.columns());
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod cluster;
pub mod errors;
pub mod network;
pub mod policies;
pub mod response;
pub mod routing;
pub mod statement;

pub use client::session::Session;
pub use client::session_builder::SessionBuilder;
pub use response::query_result::{QueryResult, Row};
pub use statement::batch::{Batch, BatchStatement, BatchType};
pub use statement::prepared::PreparedStatement;
pub use statement::unprepared::Statement;

pub use murena_cql::frame::Compression;
pub use murena_cql::value::{CqlValue, QueryValues};
pub use murena_cql::{Consistency, SerialConsistency};

#[cfg(test)]
pub(crate) mod test_utils {
    /// Enables test log output when RUST_LOG is set.
    pub(crate) fn setup_tracing() {
        let _ = tracing_subscriber::fmt::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }
}
