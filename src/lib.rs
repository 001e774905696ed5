//! # overpass-engine - Resilient query execution for rate-limited services
//!
//! overpass-engine runs long-running queries against an Overpass-style query
//! service: a single endpoint that executes a query program under memory and
//! time budgets, and that may reject, throttle, or partially fail requests.
//! The client turns that into a predictable contract: submit a query, get
//! back either a parsed result or a well-classified failure.
//!
//! ## Quick Start
//!
//! ```no_run
//! use overpass_engine::{Client, Query};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), overpass_engine::Error> {
//!     let client = Client::builder()
//!         .user_agent("my-app/1.0")
//!         .build()?;
//!
//!     let mut query = Query::new("[timeout:60]; node[amenity=cafe](52.5,13.3,52.6,13.5); out;")
//!         .with_label("name", "berlin cafes")
//!         .with_run_timeout(Some(Duration::from_secs(300)));
//!
//!     client.run_query(&mut query).await?;
//!
//!     println!("{}", query);
//!     println!("{} elements as of {:?}", query.result_set().map_or(0, |e| e.len()), query.timestamp_osm());
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - **Automatic retries** - Transient failures are retried with fibonacci backoff, up to a try ceiling
//! - **Cooldowns** - Rate limited queries wait until the service grants a new slot
//! - **Concurrency shaping** - Query requests never exceed the slots the service grants
//! - **Time budgets** - A run timeout bounds all tries, and lowers the `[timeout:*]` setting as it runs out
//! - **Caching** - Results can be cached on disk for a configurable duration
//! - **Classified errors** - Every failure is one variant of a closed error type with a retry classification
//! - **Pluggable policy** - Implement [`QueryRunner`] to change how queries are retried and cached
//! - **Structured logging** - `tracing` events, emitted in each query's own span
//!
//! ## Error Handling
//!
//! Errors are recorded on the query, and returned unless the query opted out:
//!
//! ```no_run
//! use overpass_engine::{Client, Error, Query};
//!
//! # async fn example() -> Result<(), Error> {
//! # let client = Client::builder().build()?;
//! let mut query = Query::new("node(1); out;").with_raise_on_failure(false);
//! client.run_query(&mut query).await?;
//!
//! match query.error() {
//!     None => println!("Success: {}", query),
//!     Some(Error::QueryReject { cause, partial, .. }) => {
//!         eprintln!("Rejected: {}", cause);
//!         if let Some(partial) = partial {
//!             eprintln!("  Partial result of {} bytes", partial.size_bytes);
//!         }
//!     }
//!     Some(Error::Giveup { cause, after, last_error }) => {
//!         eprintln!("Gave up after {:?}: {}", after, cause);
//!         eprintln!("  Last error: {:?}", last_error);
//!     }
//!     Some(e) => eprintln!("Other error: {}", e),
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Retry Policy
//!
//! Configure how the client handles transient failures:
//!
//! ```no_run
//! use overpass_engine::{Backoff, Client, DefaultQueryRunner};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # fn example() -> Result<(), overpass_engine::Error> {
//! let runner = DefaultQueryRunner::builder()
//!     .max_tries(10)?
//!     .backoff(Backoff::Exponential {
//!         initial_delay: Duration::from_secs(1),
//!         max_delay: Duration::from_secs(60),
//!         jitter: true,
//!     })
//!     .cache_ttl(Duration::from_secs(24 * 60 * 60))
//!     .build();
//!
//! let client = Client::builder().runner(Arc::new(runner)).build()?;
//! # Ok(())
//! # }
//! ```

mod cache;
mod classify;
mod client;
mod error;
mod query;
pub mod rate_limit;
mod response;
pub mod retry;
mod status;
pub mod transport;

pub use client::{Client, ClientBuilder, DEFAULT_BASE_URL, DEFAULT_USER_AGENT};
pub use error::{BoxError, Error, ErrorKind, GiveupCause, QueryRejectCause, Result};
pub use query::{Query, RequestTimeout, DEFAULT_MAXSIZE_MIB, DEFAULT_TIMEOUT_SECS};
pub use response::{QueryResponse, COPYRIGHT};
pub use retry::{Backoff, DefaultQueryRunner, DefaultQueryRunnerBuilder, QueryRunner};
pub use status::Status;
pub use transport::{Call, Endpoint, HttpTransport, RawResponse, Transport};
