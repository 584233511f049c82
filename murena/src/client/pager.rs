//! Lazy page-at-a-time traversal of a result set.

use bytes::Bytes;

use murena_cql::value::QueryValues;

use crate::client::session::Session;
use crate::errors::ExecutionError;
use crate::response::query_result::QueryResult;
use crate::statement::prepared::PreparedStatement;
use crate::statement::unprepared::Statement;

enum PagerTarget {
    Query(Statement),
    Prepared(PreparedStatement),
}

/// Walks a result set page by page.
///
/// Every page is a fresh round-trip through the execution engine -
/// the same statement is reissued with the previous page's paging-state
/// token attached, going through coordinator selection and retries like
/// any other request. Pages are yielded until the server stops returning
/// a paging state.
pub struct Pager<'session> {
    session: &'session Session,
    target: PagerTarget,
    values: QueryValues,
    paging_state: Option<Bytes>,
    finished: bool,
}

impl<'session> Pager<'session> {
    pub(crate) fn for_statement(
        session: &'session Session,
        statement: Statement,
        values: QueryValues,
    ) -> Self {
        Pager {
            session,
            target: PagerTarget::Query(statement),
            values,
            paging_state: None,
            finished: false,
        }
    }

    pub(crate) fn for_prepared(
        session: &'session Session,
        prepared: PreparedStatement,
        values: QueryValues,
    ) -> Self {
        Pager {
            session,
            target: PagerTarget::Prepared(prepared),
            values,
            paging_state: None,
            finished: false,
        }
    }

    /// Fetches the next page, or `None` once the result set is
    /// exhausted.
    pub async fn next_page(&mut self) -> Result<Option<QueryResult>, ExecutionError> {
        if self.finished {
            return Ok(None);
        }

        let paging_state = self.paging_state.take();
        let result = match &self.target {
            PagerTarget::Query(statement) => {
                let page_size = statement.get_page_size();
                self.session
                    .do_query(statement, &self.values, Some(page_size), paging_state)
                    .await?
            }
            PagerTarget::Prepared(prepared) => {
                let page_size = prepared.get_page_size();
                self.session
                    .do_execute(prepared, &self.values, Some(page_size), paging_state)
                    .await?
            }
        };

        self.paging_state = result.paging_state().cloned();
        self.finished = self.paging_state.is_none();
        Ok(Some(result))
    }

    /// Whether the result set has been fully consumed.
    pub fn is_finished(&self) -> bool {
        self.finished
    }
}
