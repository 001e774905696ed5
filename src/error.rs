//! Error types for query execution.
//!
//! Every failure a query can run into is one variant of the closed [`Error`]
//! type. Each variant carries its own retry classification through
//! [`Error::should_retry`], which the default query runner consults before
//! deciding whether another attempt makes sense.

use crate::response::QueryResponse;
use http::{HeaderMap, StatusCode};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// A shareable, type-erased transport error.
pub type BoxError = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// The main error type for query execution.
///
/// Errors are recorded on the [`Query`](crate::Query) that produced them and,
/// unless the query opted out, also returned to the caller. That is why the
/// type is `Clone`: the same value lives in both places.
///
/// # Examples
///
/// ```no_run
/// use overpass_engine::{Client, Error, Query};
///
/// # async fn example() -> Result<(), Error> {
/// let client = Client::builder().build()?;
/// let mut query = Query::new("node(1);out;");
///
/// match client.run_query(&mut query).await {
///     Ok(()) => println!("{} elements", query.result_set().map_or(0, |e| e.len())),
///     Err(Error::QueryLanguage { messages }) => eprintln!("bad query: {:?}", messages),
///     Err(Error::Giveup { cause, after, .. }) => eprintln!("gave up after {:?}: {}", after, cause),
///     Err(e) => eprintln!("other error: {}", e),
/// }
/// # Ok(())
/// # }
/// ```
#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    /// The transport failed before any response was received
    /// (connection refused, DNS lookup failed, connection reset, ...).
    #[error("Call failed: {source}")]
    Client {
        /// The underlying transport error.
        source: BoxError,
    },

    /// The request-level timeout elapsed before a response was received.
    #[error("Request timed out after {after:?}")]
    CallTimeout {
        /// The request timeout that elapsed.
        after: Duration,
    },

    /// The service answered with a status or body we cannot turn into a result.
    ///
    /// # Fields
    ///
    /// * `status` - The HTTP status code
    /// * `body` - The raw response body
    /// * `headers` - The response headers
    /// * `retry_after` - Server-advertised wait, parsed from `Retry-After`
    #[error("Unexpected response {status}: {body}")]
    Response {
        /// The HTTP status code
        status: StatusCode,
        /// The raw response body
        body: String,
        /// The response headers
        headers: HeaderMap,
        /// How long the server asked us to wait, if it said so
        retry_after: Option<Duration>,
    },

    /// The query program failed to parse or compile on the server.
    ///
    /// Retrying is pointless when encountering this error.
    #[error("Query language error: {}", .messages.join("; "))]
    QueryLanguage {
        /// The error messages reported by the service.
        messages: Vec<String>,
    },

    /// The service rejected the query, or aborted its execution.
    #[error("Query rejected: {cause}")]
    QueryReject {
        /// Why the query was rejected or cancelled.
        cause: QueryRejectCause,
        /// The error messages reported by the service.
        messages: Vec<String>,
        /// Whatever the service had produced before it gave up, if anything.
        partial: Option<Box<QueryResponse>>,
    },

    /// The service reported some other runtime error.
    #[error("Query failed: {}", .messages.join("; "))]
    Query {
        /// The error messages reported by the service.
        messages: Vec<String>,
        /// Whatever the service had produced before the error, if anything.
        partial: Option<Box<QueryResponse>>,
    },

    /// The client stopped trying, because a budget or the try ceiling was hit.
    #[error("Gave up after {after:?}: {cause}")]
    Giveup {
        /// Which limit was hit.
        cause: GiveupCause,
        /// Total time spent on the query so far.
        after: Duration,
        /// The error of the last attempt, if there was one.
        last_error: Option<Box<Error>>,
    },

    /// Invalid configuration was provided.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// An invalid URL was provided.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

/// Discriminant of [`Error`], convenient for matching and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// See [`Error::Client`].
    Client,
    /// See [`Error::CallTimeout`].
    CallTimeout,
    /// See [`Error::Response`].
    Response,
    /// See [`Error::QueryLanguage`].
    QueryLanguage,
    /// See [`Error::QueryReject`].
    QueryReject,
    /// See [`Error::Query`].
    Query,
    /// See [`Error::Giveup`].
    Giveup,
    /// See [`Error::Configuration`].
    Configuration,
    /// See [`Error::InvalidUrl`].
    InvalidUrl,
}

/// Details why a query was rejected or cancelled by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryRejectCause {
    /// Gateway rejection: the server is under too much load to accept the query.
    TooBusy,

    /// Gateway rejection: no slot is open for this client. Retrying is fine
    /// once the cooldown reported by the status endpoint has elapsed.
    TooManyQueries,

    /// Runtime rejection: the query ran longer than its `[timeout:*]` setting.
    ExceededTimeout {
        /// Elapsed execution time reported by the service.
        timed_out_after_secs: Option<u32>,
    },

    /// Runtime rejection: the query needed more memory than its `[maxsize:*]` setting.
    ExceededMaxsize {
        /// Memory usage reported by the service.
        oom_using_mib: Option<u32>,
    },
}

impl QueryRejectCause {
    /// Returns `true` if the query was turned away before execution.
    ///
    /// Gateway rejections depend on server load, so trying again later can
    /// succeed. Runtime rejections depend on the query's own budget, so
    /// trying again under the same budget cannot.
    pub fn is_gateway_rejection(&self) -> bool {
        matches!(
            self,
            QueryRejectCause::TooBusy | QueryRejectCause::TooManyQueries
        )
    }
}

impl fmt::Display for QueryRejectCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryRejectCause::TooBusy => write!(f, "server too busy"),
            QueryRejectCause::TooManyQueries => write!(f, "too many queries"),
            QueryRejectCause::ExceededTimeout {
                timed_out_after_secs: Some(secs),
            } => write!(f, "exceeded 'timeout' after {}s", secs),
            QueryRejectCause::ExceededTimeout { .. } => write!(f, "exceeded 'timeout'"),
            QueryRejectCause::ExceededMaxsize {
                oom_using_mib: Some(mib),
            } => write!(f, "exceeded 'maxsize' using {} MiB", mib),
            QueryRejectCause::ExceededMaxsize { .. } => write!(f, "exceeded 'maxsize'"),
        }
    }
}

/// Explains which limit caused the client to give up on a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GiveupCause {
    /// The run timeout elapsed before the next request could be sent.
    RunTimeoutBeforeQueryCall,
    /// The server-reported cooldown ends after the run timeout.
    RunTimeoutByCooldown,
    /// The run timeout elapsed while a request was in flight.
    RunTimeoutDuringQueryCall,
    /// An earlier attempt exceeded a `[timeout:*]` at least as large as the
    /// one the next attempt could use.
    ExpectingQueryTimeout,
    /// The error was retryable, but the query runner declined another try.
    RetriesExhausted,
}

impl fmt::Display for GiveupCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            GiveupCause::RunTimeoutBeforeQueryCall => "run timeout elapsed before query call",
            GiveupCause::RunTimeoutByCooldown => "cooldown ends after run timeout",
            GiveupCause::RunTimeoutDuringQueryCall => "run timeout elapsed during query call",
            GiveupCause::ExpectingQueryTimeout => "query is expected to time out",
            GiveupCause::RetriesExhausted => "retries exhausted",
        };
        f.write_str(text)
    }
}

impl Error {
    /// Wraps a transport error.
    pub fn client(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Error::Client {
            source: Arc::new(source),
        }
    }

    /// Returns the discriminant of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Client { .. } => ErrorKind::Client,
            Error::CallTimeout { .. } => ErrorKind::CallTimeout,
            Error::Response { .. } => ErrorKind::Response,
            Error::QueryLanguage { .. } => ErrorKind::QueryLanguage,
            Error::QueryReject { .. } => ErrorKind::QueryReject,
            Error::Query { .. } => ErrorKind::Query,
            Error::Giveup { .. } => ErrorKind::Giveup,
            Error::Configuration(_) => ErrorKind::Configuration,
            Error::InvalidUrl(_) => ErrorKind::InvalidUrl,
        }
    }

    /// Returns `true` if another attempt could plausibly succeed.
    ///
    /// Transport failures, timeouts, 5xx and 429 responses, and gateway
    /// rejections are retryable. Everything caused by the query itself is not.
    ///
    /// # Examples
    ///
    /// ```
    /// use overpass_engine::{Error, QueryRejectCause};
    /// use http::StatusCode;
    ///
    /// let err = Error::Response {
    ///     status: StatusCode::SERVICE_UNAVAILABLE,
    ///     body: "try later".to_string(),
    ///     headers: http::HeaderMap::new(),
    ///     retry_after: None,
    /// };
    /// assert!(err.should_retry());
    ///
    /// let err = Error::QueryReject {
    ///     cause: QueryRejectCause::ExceededTimeout { timed_out_after_secs: Some(30) },
    ///     messages: vec![],
    ///     partial: None,
    /// };
    /// assert!(!err.should_retry());
    /// ```
    pub fn should_retry(&self) -> bool {
        match self {
            Error::Client { .. } => true,
            Error::CallTimeout { .. } => true,
            Error::Response { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Error::QueryReject { cause, .. } => cause.is_gateway_rejection(),
            Error::QueryLanguage { .. } => false,
            Error::Query { .. } => false,
            Error::Giveup { .. } => false,
            Error::Configuration(_) => false,
            Error::InvalidUrl(_) => false,
        }
    }

    /// Returns `true` if the service told us to slow down.
    ///
    /// This is the signal the client answers with a status probe to learn the
    /// cooldown period.
    pub fn is_rate_limited(&self) -> bool {
        match self {
            Error::Response { status, .. } => *status == StatusCode::TOO_MANY_REQUESTS,
            Error::QueryReject { cause, .. } => *cause == QueryRejectCause::TooManyQueries,
            _ => false,
        }
    }

    /// Returns `true` if the service aborted the query for running past its `[timeout:*]`.
    pub fn is_exceeding_timeout(&self) -> bool {
        matches!(
            self,
            Error::QueryReject {
                cause: QueryRejectCause::ExceededTimeout { .. },
                ..
            }
        )
    }

    /// Returns `true` for a 5xx response.
    pub fn is_server_error(&self) -> bool {
        matches!(self, Error::Response { status, .. } if status.is_server_error())
    }

    /// Returns the HTTP status code if this error has one.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Error::Response { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Returns the server-advertised `Retry-After` delay, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::Response { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Returns the messages reported by the service, if any.
    pub fn messages(&self) -> &[String] {
        match self {
            Error::QueryLanguage { messages }
            | Error::QueryReject { messages, .. }
            | Error::Query { messages, .. } => messages,
            _ => &[],
        }
    }

    /// Returns the reject cause for a [`Error::QueryReject`].
    pub fn reject_cause(&self) -> Option<QueryRejectCause> {
        match self {
            Error::QueryReject { cause, .. } => Some(*cause),
            _ => None,
        }
    }

    /// Returns the give-up cause for a [`Error::Giveup`].
    pub fn giveup_cause(&self) -> Option<GiveupCause> {
        match self {
            Error::Giveup { cause, .. } => Some(*cause),
            _ => None,
        }
    }

    /// Returns the partial result the service sent alongside its error.
    pub fn partial_response(&self) -> Option<&QueryResponse> {
        match self {
            Error::QueryReject { partial, .. } | Error::Query { partial, .. } => partial.as_deref(),
            _ => None,
        }
    }
}

/// A specialized `Result` type for query execution.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    fn response_error(status: StatusCode) -> Error {
        Error::Response {
            status,
            body: String::new(),
            headers: HeaderMap::new(),
            retry_after: None,
        }
    }

    #[test]
    fn test_retry_classification() {
        assert!(response_error(StatusCode::BAD_GATEWAY).should_retry());
        assert!(response_error(StatusCode::TOO_MANY_REQUESTS).should_retry());
        assert!(!response_error(StatusCode::BAD_REQUEST).should_retry());
        assert!(Error::CallTimeout {
            after: Duration::from_secs(1)
        }
        .should_retry());
        assert!(!Error::QueryLanguage { messages: vec![] }.should_retry());
        assert!(!Error::Configuration("nope".into()).should_retry());
    }

    #[test]
    fn test_gateway_rejections_are_retryable() {
        let busy = Error::QueryReject {
            cause: QueryRejectCause::TooBusy,
            messages: vec![],
            partial: None,
        };
        assert!(busy.should_retry());
        assert!(!busy.is_rate_limited());

        let oom = Error::QueryReject {
            cause: QueryRejectCause::ExceededMaxsize {
                oom_using_mib: Some(541),
            },
            messages: vec![],
            partial: None,
        };
        assert!(!oom.should_retry());
        assert_eq!(oom.kind(), ErrorKind::QueryReject);
    }

    #[test]
    fn test_rate_limit_signals() {
        assert!(response_error(StatusCode::TOO_MANY_REQUESTS).is_rate_limited());
        assert!(Error::QueryReject {
            cause: QueryRejectCause::TooManyQueries,
            messages: vec![],
            partial: None,
        }
        .is_rate_limited());
        assert!(!response_error(StatusCode::SERVICE_UNAVAILABLE).is_rate_limited());
    }

    #[test]
    fn test_display() {
        let err = Error::Giveup {
            cause: GiveupCause::RunTimeoutByCooldown,
            after: Duration::from_secs(3),
            last_error: None,
        };
        assert_eq!(err.to_string(), "Gave up after 3s: cooldown ends after run timeout");

        let err = Error::QueryReject {
            cause: QueryRejectCause::ExceededTimeout {
                timed_out_after_secs: Some(30),
            },
            messages: vec![],
            partial: None,
        };
        assert_eq!(err.to_string(), "Query rejected: exceeded 'timeout' after 30s");
    }
}
