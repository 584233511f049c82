//! A prepared statement: immutable text, bind metadata and the map of
//! node-local identifiers.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;

use murena_cql::frame::response::result::{Prepared, PreparedMetadata, ResultMetadata};
use murena_cql::value::{QueryValues, SerializedValues};

use super::{Consistency, PageSize, SerialConsistency, StatementConfig};
use crate::errors::BadQuery;
use crate::policies::retry::RetryPolicy;
use crate::routing::{Murmur3PartitionerHasher, Token};

/// A statement prepared on the cluster.
///
/// The server-assigned identifier is node-local: the id map may cover
/// only part of the cluster. Missing entries are filled lazily on first
/// execution against a node, and a node which evicted the statement
/// answers UNPREPARED and gets it re-prepared transparently.
///
/// Clones share the id map, so re-preparation through any clone is
/// visible to all of them.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    pub(crate) config: StatementConfig,

    contents: String,
    page_size: PageSize,
    metadata: PreparedMetadata,
    result_metadata: ResultMetadata,
    // Node-local statement ids, keyed by node address.
    ids: Arc<DashMap<SocketAddr, Bytes>>,
}

impl PreparedStatement {
    pub(crate) fn new(
        contents: String,
        prepared: Prepared,
        prepared_on: SocketAddr,
        config: StatementConfig,
        page_size: PageSize,
    ) -> Self {
        let ids = Arc::new(DashMap::new());
        ids.insert(prepared_on, prepared.id);
        Self {
            config,
            contents,
            page_size,
            metadata: prepared.prepared_metadata,
            result_metadata: prepared.result_metadata,
            ids,
        }
    }

    /// The statement text this statement was prepared from.
    pub fn get_statement(&self) -> &str {
        &self.contents
    }

    /// Bind-marker metadata: names, types and order of the parameters.
    pub fn get_prepared_metadata(&self) -> &PreparedMetadata {
        &self.metadata
    }

    /// Metadata of the result set this statement produces.
    pub fn get_result_metadata(&self) -> &ResultMetadata {
        &self.result_metadata
    }

    /// The statement id assigned by the given node, if known there.
    pub(crate) fn id_for(&self, node: SocketAddr) -> Option<Bytes> {
        self.ids.get(&node).map(|id| id.clone())
    }

    pub(crate) fn set_id_for(&self, node: SocketAddr, id: Bytes) {
        self.ids.insert(node, id);
    }

    /// Binds caller values to the statement's markers, producing the
    /// wire form. Named values are reordered to the marker order from
    /// the bind metadata.
    pub(crate) fn bind(&self, values: &QueryValues) -> Result<SerializedValues, BadQuery> {
        match values {
            QueryValues::Positional(positional) => {
                if positional.len() != self.metadata.col_specs.len() {
                    return Err(BadQuery::ValueCountMismatch {
                        got: positional.len(),
                        expected: self.metadata.col_specs.len(),
                    });
                }
                let mut serialized = SerializedValues::new();
                for value in positional {
                    serialized.add_value(value.as_ref())?;
                }
                Ok(serialized)
            }
            QueryValues::Named(named) => {
                let mut by_name: HashMap<&str, &Option<murena_cql::CqlValue>> = named
                    .iter()
                    .map(|(name, value)| (name.as_str(), value))
                    .collect();

                let mut serialized = SerializedValues::new();
                for spec in &self.metadata.col_specs {
                    let value = by_name
                        .remove(spec.name.as_str())
                        .ok_or_else(|| BadQuery::MissingNamedParameter(spec.name.clone()))?;
                    serialized.add_value(value.as_ref())?;
                }

                if let Some(extra) = by_name.keys().next() {
                    return Err(BadQuery::UnknownNamedParameter((*extra).to_string()));
                }
                Ok(serialized)
            }
        }
    }

    /// Computes the partition token of the bound values, when the bind
    /// metadata covers the full partition key. Used for token-aware
    /// routing; `None` simply disables it for this request.
    pub(crate) fn compute_token(&self, bound: &SerializedValues) -> Option<Token> {
        let pk_indexes = &self.metadata.pk_indexes;
        if pk_indexes.is_empty() {
            return None;
        }

        let raw_values: Vec<&[u8]> = {
            let all: Vec<_> = bound.iter().collect();
            let mut raw = Vec::with_capacity(pk_indexes.len());
            for index in pk_indexes {
                let value = all.get(*index as usize)?.as_value()?;
                raw.push(value);
            }
            raw
        };

        let mut hasher = Murmur3PartitionerHasher::new();
        if let [single] = raw_values.as_slice() {
            hasher.write(single);
        } else {
            // Composite partition key: each component is length-prefixed
            // and zero-terminated before hashing.
            for value in raw_values {
                let len: u16 = value.len().try_into().ok()?;
                hasher.write(&len.to_be_bytes());
                hasher.write(value);
                hasher.write(&[0u8]);
            }
        }
        Some(hasher.finish())
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

    /// Requests tracing of this statement's executions.
    pub fn with_tracing(mut self, tracing: bool) -> Self {
        self.config.tracing = tracing;
        self
    }

    /// Marks this statement as idempotent, making it eligible for
    /// automatic retries after errors where a write could plausibly
    /// have been applied.
    pub fn set_idempotent(&mut self, is_idempotent: bool) {
        self.config.is_idempotent = is_idempotent;
    }

    /// Builder-style variant of [`PreparedStatement::set_idempotent`].
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

#[cfg(test)]
mod tests {
    use super::*;
    use murena_cql::frame::response::result::{ColumnSpec, ColumnType, TableSpec};
    use murena_cql::value::CqlValue;

    fn col_spec(name: &str, typ: ColumnType) -> ColumnSpec {
        ColumnSpec {
            table_spec: TableSpec {
                ks_name: "ks".to_owned(),
                table_name: "t".to_owned(),
            },
            name: name.to_owned(),
            typ,
        }
    }

    fn prepared_with_markers(names: &[&str], pk_indexes: Vec<u16>) -> PreparedStatement {
        let col_specs: Vec<_> = names
            .iter()
            .map(|name| col_spec(name, ColumnType::Text))
            .collect();
        let prepared = Prepared {
            id: Bytes::from_static(b"\x01"),
            prepared_metadata: PreparedMetadata {
                col_count: col_specs.len(),
                pk_indexes,
                col_specs,
            },
            result_metadata: ResultMetadata::default(),
        };
        PreparedStatement::new(
            "INSERT INTO ks.t (a, b) VALUES (:a, :b)".to_owned(),
            prepared,
            "127.0.0.1:9042".parse().unwrap(),
            StatementConfig::default(),
            PageSize::default(),
        )
    }

    fn text(value: &str) -> Option<CqlValue> {
        Some(CqlValue::Text(value.to_owned()))
    }

    #[test]
    fn named_values_are_reordered_to_marker_order() {
        let stmt = prepared_with_markers(&["a", "b"], vec![]);

        let named = QueryValues::Named(vec![
            ("b".to_owned(), text("second")),
            ("a".to_owned(), text("first")),
        ]);
        let positional = QueryValues::Positional(vec![text("first"), text("second")]);

        assert_eq!(stmt.bind(&named).unwrap(), stmt.bind(&positional).unwrap());
    }

    #[test]
    fn missing_and_unknown_named_values_are_rejected() {
        let stmt = prepared_with_markers(&["a", "b"], vec![]);

        let missing = QueryValues::Named(vec![("a".to_owned(), text("x"))]);
        assert!(matches!(
            stmt.bind(&missing),
            Err(BadQuery::MissingNamedParameter(name)) if name == "b"
        ));

        let unknown = QueryValues::Named(vec![
            ("a".to_owned(), text("x")),
            ("b".to_owned(), text("y")),
            ("c".to_owned(), text("z")),
        ]);
        assert!(matches!(
            stmt.bind(&unknown),
            Err(BadQuery::UnknownNamedParameter(name)) if name == "c"
        ));
    }

    #[test]
    fn positional_arity_is_checked() {
        let stmt = prepared_with_markers(&["a", "b"], vec![]);
        let too_few = QueryValues::Positional(vec![text("x")]);
        assert!(matches!(
            stmt.bind(&too_few),
            Err(BadQuery::ValueCountMismatch {
                got: 1,
                expected: 2
            })
        ));
    }

    #[test]
    fn single_component_token_matches_plain_hash() {
        let stmt = prepared_with_markers(&["a", "b"], vec![0]);
        let bound = stmt
            .bind(&QueryValues::Positional(vec![text("test"), text("other")]))
            .unwrap();

        let token = stmt.compute_token(&bound).unwrap();
        assert_eq!(token.value(), -6017608668500074083);
    }

    #[test]
    fn null_partition_key_component_disables_routing() {
        let stmt = prepared_with_markers(&["a", "b"], vec![0]);
        let bound = stmt
            .bind(&QueryValues::Positional(vec![None, text("other")]))
            .unwrap();
        assert!(stmt.compute_token(&bound).is_none());
    }

    #[test]
    fn clones_share_the_id_map() {
        let stmt = prepared_with_markers(&["a"], vec![]);
        let clone = stmt.clone();

        let addr: SocketAddr = "10.0.0.9:9042".parse().unwrap();
        stmt.set_id_for(addr, Bytes::from_static(b"\x07"));
        assert_eq!(clone.id_for(addr), Some(Bytes::from_static(b"\x07")));
    }
}
