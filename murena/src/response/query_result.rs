//! The result of a request: rows, column specifications, warnings and
//! the paging state.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use uuid::Uuid;

use murena_cql::frame::response::result::{self, ColumnSpec};
use murena_cql::value::CqlValue;

use crate::response::QueryResponse;

/// `single_row()` was called on a result without exactly one row.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SingleRowError {
    /// The result carries more than one row.
    #[error("Expected a single row, but the result has {0} rows")]
    MultipleRows(usize),

    /// The result carries no rows at all.
    #[error("Expected a single row, but the result is empty")]
    NoRows,
}

/// Positional access with an index outside of the row.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Column index {index} out of range, the row has {len} columns")]
pub struct ColumnIndexOutOfRange {
    pub index: isize,
    pub len: usize,
}

/// One page of a result set, immutable once returned.
///
/// A present [paging state](QueryResult::paging_state) means the server
/// has more pages; fetching them is another full round-trip through the
/// execution engine, not a local operation (see
/// [`Pager`](crate::client::pager::Pager)).
#[derive(Debug, Default)]
pub struct QueryResult {
    rows: Option<Vec<Row>>,
    col_specs: Arc<[ColumnSpec]>,
    warnings: Vec<String>,
    tracing_id: Option<Uuid>,
    paging_state: Option<Bytes>,
}

impl QueryResult {
    pub(crate) fn from_response(response: QueryResponse) -> Self {
        let (rows, col_specs, paging_state) = match response.result {
            result::Result::Rows(rows) => {
                let col_specs: Arc<[ColumnSpec]> = rows.metadata.col_specs.into();
                let wrapped = rows
                    .rows
                    .into_iter()
                    .map(|row| Row {
                        columns: row.columns,
                        col_specs: Arc::clone(&col_specs),
                    })
                    .collect();
                (Some(wrapped), col_specs, rows.paging_state)
            }
            _ => (None, Arc::default(), None),
        };

        QueryResult {
            rows,
            col_specs,
            warnings: response.warnings,
            tracing_id: response.tracing_id,
            paging_state,
        }
    }

    /// An empty result standing in for a response the retry policy told
    /// us to ignore.
    pub(crate) fn mock_empty() -> Self {
        QueryResult::default()
    }

    /// Whether the response was of Rows kind. False for Void results
    /// (INSERT/UPDATE/DDL).
    pub fn is_rows(&self) -> bool {
        self.rows.is_some()
    }

    /// The rows of the current page. Empty for non-Rows results.
    pub fn rows(&self) -> &[Row] {
        self.rows.as_deref().unwrap_or(&[])
    }

    /// Number of rows in the current page.
    pub fn rows_num(&self) -> usize {
        self.rows().len()
    }

    /// The first row of the page, if any.
    pub fn first_row(&self) -> Option<&Row> {
        self.rows().first()
    }

    /// The only row of the page. Fails when the page does not contain
    /// exactly one row.
    pub fn single_row(&self) -> Result<&Row, SingleRowError> {
        match self.rows() {
            [single] => Ok(single),
            [] => Err(SingleRowError::NoRows),
            rows => Err(SingleRowError::MultipleRows(rows.len())),
        }
    }

    /// Every row of the page as a column-name-to-value map.
    pub fn rows_as_maps(&self) -> Vec<HashMap<String, Option<CqlValue>>> {
        self.rows().iter().map(Row::as_map).collect()
    }

    /// Column specifications of the result, verbatim from the server.
    pub fn col_specs(&self) -> &[ColumnSpec] {
        &self.col_specs
    }

    /// Warnings the server attached to the response.
    pub fn warnings(&self) -> impl Iterator<Item = &str> {
        self.warnings.iter().map(String::as_str)
    }

    /// Tracing id of the request, present when tracing was requested.
    pub fn tracing_id(&self) -> Option<Uuid> {
        self.tracing_id
    }

    /// Token to resume the result set from, present when the server has
    /// more pages.
    pub fn paging_state(&self) -> Option<&Bytes> {
        self.paging_state.as_ref()
    }
}

impl<'a> IntoIterator for &'a QueryResult {
    type Item = &'a Row;
    type IntoIter = std::slice::Iter<'a, Row>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows().iter()
    }
}

/// A row of cells aligned with the result's column specifications.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Vec<Option<CqlValue>>,
    col_specs: Arc<[ColumnSpec]>,
}

impl Row {
    /// The cells of the row in column order; `None` is a NULL cell.
    pub fn columns(&self) -> &[Option<CqlValue>] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Positional access. Negative indices wrap around from the end,
    /// `-1` being the last column.
    pub fn get(&self, index: isize) -> Result<&Option<CqlValue>, ColumnIndexOutOfRange> {
        let len = self.columns.len();
        let wrapped = if index < 0 {
            index + len as isize
        } else {
            index
        };

        usize::try_from(wrapped)
            .ok()
            .and_then(|idx| self.columns.get(idx))
            .ok_or(ColumnIndexOutOfRange {
                index,
                len,
            })
    }

    /// The cell under the given column name.
    pub fn get_by_name(&self, name: &str) -> Option<&Option<CqlValue>> {
        let index = self.col_specs.iter().position(|spec| spec.name == name)?;
        self.columns.get(index)
    }

    /// The row as a column-name-to-value map.
    pub fn as_map(&self) -> HashMap<String, Option<CqlValue>> {
        self.col_specs
            .iter()
            .zip(self.columns.iter())
            .map(|(spec, value)| (spec.name.clone(), value.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use murena_cql::frame::response::result::{ColumnType, ResultMetadata, Rows, TableSpec};

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

    fn result_with_rows(rows: Vec<Vec<Option<CqlValue>>>) -> QueryResult {
        let col_specs = vec![
            col_spec("a", ColumnType::Int),
            col_spec("b", ColumnType::Text),
        ];
        let response = QueryResponse {
            result: result::Result::Rows(Rows {
                metadata: ResultMetadata {
                    col_count: col_specs.len(),
                    col_specs,
                },
                paging_state: None,
                rows_count: rows.len(),
                rows: rows
                    .into_iter()
                    .map(|columns| murena_cql::value::Row { columns })
                    .collect(),
            }),
            tracing_id: None,
            warnings: vec!["beware".to_owned()],
        };
        QueryResult::from_response(response)
    }

    fn three_row_result() -> QueryResult {
        result_with_rows(vec![
            vec![Some(CqlValue::Int(1)), Some(CqlValue::Text("x".to_owned()))],
            vec![Some(CqlValue::Int(2)), None],
            vec![Some(CqlValue::Int(3)), Some(CqlValue::Text("z".to_owned()))],
        ])
    }

    #[test]
    fn first_and_single_row_semantics() {
        let result = three_row_result();
        assert_eq!(result.rows_num(), 3);

        let first = result.first_row().unwrap();
        assert_eq!(first.get(0).unwrap(), &Some(CqlValue::Int(1)));

        assert_eq!(
            result.single_row().unwrap_err(),
            SingleRowError::MultipleRows(3)
        );

        let single = result_with_rows(vec![vec![Some(CqlValue::Int(9)), None]]);
        assert_eq!(
            single.single_row().unwrap().get(0).unwrap(),
            &Some(CqlValue::Int(9))
        );

        let empty = result_with_rows(vec![]);
        assert!(empty.first_row().is_none());
        assert_eq!(empty.single_row().unwrap_err(), SingleRowError::NoRows);
    }

    #[test]
    fn negative_indices_wrap_around() {
        let result = three_row_result();
        let row = result.first_row().unwrap();

        assert_eq!(row.get(-1).unwrap(), &Some(CqlValue::Text("x".to_owned())));
        assert_eq!(row.get(-2).unwrap(), row.get(0).unwrap());

        assert_eq!(
            row.get(2).unwrap_err(),
            ColumnIndexOutOfRange { index: 2, len: 2 }
        );
        assert_eq!(
            row.get(-3).unwrap_err(),
            ColumnIndexOutOfRange { index: -3, len: 2 }
        );
    }

    #[test]
    fn lookup_by_name_and_map_view() {
        let result = three_row_result();
        let row = &result.rows()[1];

        assert_eq!(row.get_by_name("a"), Some(&Some(CqlValue::Int(2))));
        // A NULL cell is present in the row, as an explicit None.
        assert_eq!(row.get_by_name("b"), Some(&None));
        assert_eq!(row.get_by_name("missing"), None);

        let map = row.as_map();
        assert_eq!(map.len(), 2);
        assert_eq!(map["a"], Some(CqlValue::Int(2)));
        assert_eq!(map["b"], None);
    }

    #[test]
    fn iteration_visits_every_row_of_the_page() {
        let result = three_row_result();
        let firsts: Vec<_> = (&result)
            .into_iter()
            .map(|row| row.get(0).unwrap().clone())
            .collect();
        assert_eq!(
            firsts,
            vec![
                Some(CqlValue::Int(1)),
                Some(CqlValue::Int(2)),
                Some(CqlValue::Int(3))
            ]
        );
    }

    #[test]
    fn void_result_has_no_rows() {
        let response = QueryResponse {
            result: result::Result::Void,
            tracing_id: None,
            warnings: Vec::new(),
        };
        let result = QueryResult::from_response(response);
        assert!(!result.is_rows());
        assert_eq!(result.rows_num(), 0);
        assert!(result.paging_state().is_none());
    }

    #[test]
    fn warnings_are_passed_through() {
        let result = three_row_result();
        assert_eq!(result.warnings().collect::<Vec<_>>(), vec!["beware"]);
    }
}
