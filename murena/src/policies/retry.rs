//! Request retry configuration.
//!
//! To decide when to retry a request the session consults an object
//! implementing the [RetryPolicy] trait.

use murena_cql::frame::response::error::{DbError, WriteType};
use murena_cql::frame::types::Consistency;

use crate::errors::RequestAttemptError;

/// Information about a failed request.
pub struct RequestInfo<'a> {
    /// The error with which the request failed.
    pub error: &'a RequestAttemptError,
    /// A request is idempotent if it can be applied multiple times without
    /// changing the result of the initial application.
    /// If set to `true` we can be sure that it is idempotent.
    /// If set to `false` it is unknown whether it is idempotent.
    pub is_idempotent: bool,
    /// Consistency with which the request failed.
    pub consistency: Consistency,
}

/// What to do about a failed request attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry on the same coordinator. `None` means the same consistency
    /// should be used as before.
    RetrySameTarget(Option<Consistency>),
    /// Advance to the next coordinator candidate. `None` as above.
    RetryNextTarget(Option<Consistency>),
    DontRetry,
    /// Treat the write as complete despite the error.
    IgnoreWriteError,
}

/// Specifies a policy used to decide when to retry a request.
pub trait RetryPolicy: std::fmt::Debug + Send + Sync {
    /// Called for each new request, starts a session of deciding about
    /// retries.
    fn new_session(&self) -> Box<dyn RetrySession>;
}

/// Used throughout a single request to decide when to retry it.
pub trait RetrySession: Send + Sync {
    /// Called after the request failed - decide what to do next.
    fn decide_should_retry(&mut self, request_info: RequestInfo) -> RetryDecision;
}

/// Default retry policy - retries when there is a high chance that
/// a retry might help, bounded to one retry per error class.
#[derive(Debug, Default)]
pub struct DefaultRetryPolicy;

impl DefaultRetryPolicy {
    pub fn new() -> DefaultRetryPolicy {
        DefaultRetryPolicy
    }
}

impl RetryPolicy for DefaultRetryPolicy {
    fn new_session(&self) -> Box<dyn RetrySession> {
        Box::new(DefaultRetrySession::new())
    }
}

/// Implementation of [RetrySession] for [DefaultRetryPolicy].
struct DefaultRetrySession {
    was_unavailable_retry: bool,
    was_read_timeout_retry: bool,
    was_write_timeout_retry: bool,
}

impl DefaultRetrySession {
    fn new() -> DefaultRetrySession {
        DefaultRetrySession {
            was_unavailable_retry: false,
            was_read_timeout_retry: false,
            was_write_timeout_retry: false,
        }
    }
}

impl RetrySession for DefaultRetrySession {
    fn decide_should_retry(&mut self, request_info: RequestInfo) -> RetryDecision {
        if request_info.consistency.is_serial() {
            return RetryDecision::DontRetry;
        };
        match request_info.error {
            // Basic errors - there are some problems on this node.
            // Retry on a different one if possible.
            RequestAttemptError::BrokenConnectionError(_)
            | RequestAttemptError::DbError(DbError::Overloaded, _)
            | RequestAttemptError::DbError(DbError::ServerError, _)
            | RequestAttemptError::DbError(DbError::TruncateError, _) => {
                if request_info.is_idempotent {
                    RetryDecision::RetryNextTarget(None)
                } else {
                    RetryDecision::DontRetry
                }
            }
            // Unavailable - the current node believes that not enough
            // nodes are alive to satisfy the specified consistency.
            // Maybe this node has network problems - try a different one.
            // Perform at most one retry - it's unlikely that two nodes
            // have network problems at the same time.
            RequestAttemptError::DbError(DbError::Unavailable { .. }, _) => {
                if !self.was_unavailable_retry {
                    self.was_unavailable_retry = true;
                    RetryDecision::RetryNextTarget(None)
                } else {
                    RetryDecision::DontRetry
                }
            }
            // ReadTimeout - coordinator didn't receive enough replies
            // in time. Retry at most once and only if there were actually
            // enough replies to satisfy consistency but they were all
            // just checksums (data_present == false). The retried request
            // should have a useful response because the node will detect
            // the dead replicas.
            RequestAttemptError::DbError(
                DbError::ReadTimeout {
                    received,
                    required,
                    data_present,
                    ..
                },
                _,
            ) => {
                if !self.was_read_timeout_retry && received >= required && !*data_present {
                    self.was_read_timeout_retry = true;
                    RetryDecision::RetrySameTarget(None)
                } else {
                    RetryDecision::DontRetry
                }
            }
            // WriteTimeout - coordinator didn't receive enough replies
            // in time. Retry at most once and only for an idempotent
            // BatchLog write; the batch log write could plausibly not
            // have been applied anywhere yet.
            RequestAttemptError::DbError(DbError::WriteTimeout { write_type, .. }, _) => {
                if !self.was_write_timeout_retry
                    && request_info.is_idempotent
                    && *write_type == WriteType::BatchLog
                {
                    self.was_write_timeout_retry = true;
                    RetryDecision::RetrySameTarget(None)
                } else {
                    RetryDecision::DontRetry
                }
            }
            // The node is still bootstrapping and can't execute the
            // request; try another one.
            RequestAttemptError::DbError(DbError::IsBootstrapping, _) => {
                RetryDecision::RetryNextTarget(None)
            }
            // This connection is overloaded with in-flight requests;
            // try another node.
            RequestAttemptError::UnableToAllocStreamId => RetryDecision::RetryNextTarget(None),
            // In all other cases propagate the error to the caller.
            _ => RetryDecision::DontRetry,
        }
    }
}

/// A retry policy which never retries - every error is propagated
/// directly to the caller.
#[derive(Debug, Default)]
pub struct FallthroughRetryPolicy;

impl FallthroughRetryPolicy {
    pub fn new() -> FallthroughRetryPolicy {
        FallthroughRetryPolicy
    }
}

impl RetryPolicy for FallthroughRetryPolicy {
    fn new_session(&self) -> Box<dyn RetrySession> {
        Box::new(FallthroughRetrySession)
    }
}

struct FallthroughRetrySession;

impl RetrySession for FallthroughRetrySession {
    fn decide_should_retry(&mut self, _request_info: RequestInfo) -> RetryDecision {
        RetryDecision::DontRetry
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::{DefaultRetryPolicy, RequestInfo, RetryDecision, RetryPolicy};
    use crate::errors::{
        BrokenConnectionErrorKind, DbError, RequestAttemptError, WriteType,
    };
    use crate::test_utils::setup_tracing;
    use murena_cql::frame::types::Consistency;

    fn make_request_info(error: &RequestAttemptError, is_idempotent: bool) -> RequestInfo<'_> {
        RequestInfo {
            error,
            is_idempotent,
            consistency: Consistency::One,
        }
    }

    // Asserts that the default policy never retries for this error.
    fn default_policy_assert_never_retries(error: RequestAttemptError) {
        let mut policy = DefaultRetryPolicy::new().new_session();
        assert_eq!(
            policy.decide_should_retry(make_request_info(&error, false)),
            RetryDecision::DontRetry
        );

        let mut policy = DefaultRetryPolicy::new().new_session();
        assert_eq!(
            policy.decide_should_retry(make_request_info(&error, true)),
            RetryDecision::DontRetry
        );
    }

    #[test]
    fn default_never_retries() {
        setup_tracing();
        let never_retried_dberrors = vec![
            DbError::SyntaxError,
            DbError::Invalid,
            DbError::AlreadyExists {
                keyspace: String::new(),
                table: String::new(),
            },
            DbError::FunctionFailure {
                keyspace: String::new(),
                function: String::new(),
                arg_types: vec![],
            },
            DbError::AuthenticationError,
            DbError::Unauthorized,
            DbError::ConfigError,
            DbError::ReadFailure {
                consistency: Consistency::Two,
                received: 2,
                required: 1,
                numfailures: 1,
                data_present: false,
            },
            DbError::WriteFailure {
                consistency: Consistency::Two,
                received: 1,
                required: 2,
                numfailures: 1,
                write_type: WriteType::BatchLog,
            },
            DbError::Unprepared {
                statement_id: Bytes::from_static(b"deadbeef"),
            },
            DbError::ProtocolError,
            DbError::Other(0x124816),
        ];

        for dberror in never_retried_dberrors {
            default_policy_assert_never_retries(RequestAttemptError::DbError(
                dberror,
                String::new(),
            ));
        }
    }

    #[test]
    fn default_idempotent_next_retries() {
        setup_tracing();
        let idempotent_next_errors = vec![
            RequestAttemptError::DbError(DbError::Overloaded, String::new()),
            RequestAttemptError::DbError(DbError::TruncateError, String::new()),
            RequestAttemptError::DbError(DbError::ServerError, String::new()),
            RequestAttemptError::BrokenConnectionError(
                BrokenConnectionErrorKind::ChannelError.into(),
            ),
        ];

        for error in idempotent_next_errors {
            // Not idempotent - never retried.
            let mut policy = DefaultRetryPolicy::new().new_session();
            assert_eq!(
                policy.decide_should_retry(make_request_info(&error, false)),
                RetryDecision::DontRetry
            );

            // Idempotent - retried on another node.
            let mut policy = DefaultRetryPolicy::new().new_session();
            assert_eq!(
                policy.decide_should_retry(make_request_info(&error, true)),
                RetryDecision::RetryNextTarget(None)
            );
        }
    }

    #[test]
    fn default_bootstrapping_node_always_skipped() {
        setup_tracing();
        let error = RequestAttemptError::DbError(DbError::IsBootstrapping, String::new());

        for is_idempotent in [false, true] {
            let mut policy = DefaultRetryPolicy::new().new_session();
            assert_eq!(
                policy.decide_should_retry(make_request_info(&error, is_idempotent)),
                RetryDecision::RetryNextTarget(None)
            );
        }
    }

    #[test]
    fn default_unavailable_retried_once() {
        setup_tracing();
        let error = RequestAttemptError::DbError(
            DbError::Unavailable {
                consistency: Consistency::Two,
                required: 2,
                alive: 1,
            },
            String::new(),
        );

        let mut policy = DefaultRetryPolicy::new().new_session();
        assert_eq!(
            policy.decide_should_retry(make_request_info(&error, false)),
            RetryDecision::RetryNextTarget(None)
        );
        assert_eq!(
            policy.decide_should_retry(make_request_info(&error, false)),
            RetryDecision::DontRetry
        );
    }

    #[test]
    fn default_read_timeout_retried_once_when_replies_sufficed() {
        setup_tracing();
        let retryable = RequestAttemptError::DbError(
            DbError::ReadTimeout {
                consistency: Consistency::Two,
                received: 2,
                required: 2,
                data_present: false,
            },
            String::new(),
        );

        let mut policy = DefaultRetryPolicy::new().new_session();
        assert_eq!(
            policy.decide_should_retry(make_request_info(&retryable, false)),
            RetryDecision::RetrySameTarget(None)
        );
        assert_eq!(
            policy.decide_should_retry(make_request_info(&retryable, false)),
            RetryDecision::DontRetry
        );

        // Data was present - the replicas are fine; retry won't help.
        let data_present = RequestAttemptError::DbError(
            DbError::ReadTimeout {
                consistency: Consistency::Two,
                received: 2,
                required: 2,
                data_present: true,
            },
            String::new(),
        );
        let mut policy = DefaultRetryPolicy::new().new_session();
        assert_eq!(
            policy.decide_should_retry(make_request_info(&data_present, false)),
            RetryDecision::DontRetry
        );
    }

    #[test]
    fn default_write_timeout_retried_only_for_idempotent_batch_log() {
        setup_tracing();
        let batch_log = RequestAttemptError::DbError(
            DbError::WriteTimeout {
                consistency: Consistency::Two,
                received: 1,
                required: 2,
                write_type: WriteType::BatchLog,
            },
            String::new(),
        );

        let mut policy = DefaultRetryPolicy::new().new_session();
        assert_eq!(
            policy.decide_should_retry(make_request_info(&batch_log, true)),
            RetryDecision::RetrySameTarget(None)
        );
        assert_eq!(
            policy.decide_should_retry(make_request_info(&batch_log, true)),
            RetryDecision::DontRetry
        );

        // A non-idempotent write timeout must never be retried - the
        // write may have been applied.
        let mut policy = DefaultRetryPolicy::new().new_session();
        assert_eq!(
            policy.decide_should_retry(make_request_info(&batch_log, false)),
            RetryDecision::DontRetry
        );

        let simple = RequestAttemptError::DbError(
            DbError::WriteTimeout {
                consistency: Consistency::Two,
                received: 1,
                required: 2,
                write_type: WriteType::Simple,
            },
            String::new(),
        );
        let mut policy = DefaultRetryPolicy::new().new_session();
        assert_eq!(
            policy.decide_should_retry(make_request_info(&simple, true)),
            RetryDecision::DontRetry
        );
    }

    #[test]
    fn default_serial_consistency_never_retried() {
        setup_tracing();
        let error = RequestAttemptError::DbError(DbError::IsBootstrapping, String::new());
        let mut policy = DefaultRetryPolicy::new().new_session();
        let info = RequestInfo {
            error: &error,
            is_idempotent: true,
            consistency: Consistency::Serial,
        };
        assert_eq!(policy.decide_should_retry(info), RetryDecision::DontRetry);
    }
}
