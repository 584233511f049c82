//! The session-wide prepared statement cache.
//!
//! Keyed by exact statement text (not by semantic equivalence). The
//! cache also coalesces PREPARE round-trips: at most one PREPARE per
//! (node, text) pair is in flight at a time; concurrent callers await
//! the same result instead of issuing duplicates.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::OnceCell;

use crate::errors::{ExecutionError, RequestAttemptError};
use crate::statement::prepared::PreparedStatement;

#[derive(Default)]
pub(crate) struct StatementCache {
    // Statement text -> the (possibly still in-flight) preparation.
    by_text: DashMap<String, Arc<OnceCell<PreparedStatement>>>,
    // Rendezvous of lazy per-node preparations of already-cached
    // statements.
    node_cells: DashMap<(SocketAddr, String), Arc<OnceCell<Bytes>>>,
}

impl StatementCache {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// The cached statement for this exact text, preparing it through
    /// `prepare` if absent. Concurrent callers with the same text share
    /// one preparation; a failed one leaves the slot empty for the next
    /// caller to retry.
    pub(crate) async fn get_or_prepare<F, Fut>(
        &self,
        text: &str,
        prepare: F,
    ) -> Result<PreparedStatement, ExecutionError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<PreparedStatement, ExecutionError>>,
    {
        let cell = self
            .by_text
            .entry(text.to_owned())
            .or_default()
            .clone();

        let prepared = cell.get_or_try_init(prepare).await?.clone();
        Ok(prepared)
    }

    /// Makes sure the statement is prepared on the given node, issuing
    /// at most one PREPARE round-trip per (node, text) no matter how
    /// many callers arrive concurrently.
    pub(crate) async fn ensure_prepared_on<F, Fut>(
        &self,
        node: SocketAddr,
        statement: &PreparedStatement,
        prepare: F,
    ) -> Result<Bytes, RequestAttemptError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Bytes, RequestAttemptError>>,
    {
        if let Some(id) = statement.id_for(node) {
            return Ok(id);
        }

        let cell = self
            .node_cells
            .entry((node, statement.get_statement().to_owned()))
            .or_default()
            .clone();

        let id = cell.get_or_try_init(prepare).await?.clone();
        statement.set_id_for(node, id.clone());
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::statement::{PageSize, StatementConfig};
    use murena_cql::frame::response::result::{Prepared, PreparedMetadata, ResultMetadata};

    fn addr(last_octet: u8) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, last_octet], 9042))
    }

    fn make_prepared(text: &str) -> PreparedStatement {
        let prepared = Prepared {
            id: Bytes::from_static(b"\x01"),
            prepared_metadata: PreparedMetadata {
                col_count: 0,
                pk_indexes: Vec::new(),
                col_specs: Vec::new(),
            },
            result_metadata: ResultMetadata::default(),
        };
        PreparedStatement::new(
            text.to_owned(),
            prepared,
            addr(1),
            StatementConfig::default(),
            PageSize::default(),
        )
    }

    #[tokio::test]
    async fn concurrent_preparations_of_same_text_coalesce() {
        let cache = Arc::new(StatementCache::new());
        let round_trips = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let round_trips = Arc::clone(&round_trips);
                tokio::spawn(async move {
                    cache
                        .get_or_prepare("SELECT a FROM t WHERE k = ?", move || async move {
                            round_trips.fetch_add(1, Ordering::SeqCst);
                            // Keep the round-trip in flight long enough
                            // for all callers to pile up on it.
                            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                            Ok(make_prepared("SELECT a FROM t WHERE k = ?"))
                        })
                        .await
                })
            })
            .collect();

        for task in tasks {
            let prepared = task.await.unwrap().unwrap();
            assert_eq!(prepared.get_statement(), "SELECT a FROM t WHERE k = ?");
        }
        assert_eq!(round_trips.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn per_node_preparation_runs_once_per_node() {
        let cache = StatementCache::new();
        let statement = make_prepared("SELECT a FROM t");
        let round_trips = AtomicUsize::new(0);

        // The node the statement was prepared on needs no round-trip.
        let id = cache
            .ensure_prepared_on(addr(1), &statement, || async {
                round_trips.fetch_add(1, Ordering::SeqCst);
                Ok(Bytes::from_static(b"\xff"))
            })
            .await
            .unwrap();
        assert_eq!(id, Bytes::from_static(b"\x01"));
        assert_eq!(round_trips.load(Ordering::SeqCst), 0);

        // A new node requires one, and exactly one, round-trip.
        for _ in 0..3 {
            let id = cache
                .ensure_prepared_on(addr(2), &statement, || async {
                    round_trips.fetch_add(1, Ordering::SeqCst);
                    Ok(Bytes::from_static(b"\x02"))
                })
                .await
                .unwrap();
            assert_eq!(id, Bytes::from_static(b"\x02"));
        }
        assert_eq!(round_trips.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_preparation_is_retried_by_next_caller() {
        let cache = StatementCache::new();
        let attempts = AtomicUsize::new(0);

        let failed = cache
            .get_or_prepare("SELECT a FROM t", || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(ExecutionError::EmptyPlan)
            })
            .await;
        assert!(failed.is_err());

        let prepared = cache
            .get_or_prepare("SELECT a FROM t", || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Ok(make_prepared("SELECT a FROM t"))
            })
            .await
            .unwrap();

        assert_eq!(prepared.get_statement(), "SELECT a FROM t");
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }
}
