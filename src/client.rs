//! Query client with concurrency control and retry logic.
//!
//! The [`Client`] type is the main entry point for running queries.
//! Use [`ClientBuilder`] to configure and create clients.

use crate::classify::{classify, response_error};
use crate::error::GiveupCause;
use crate::retry::{DefaultQueryRunner, QueryRunner};
use crate::transport::{Call, Endpoint, HttpTransport, Transport};
use crate::{Error, Query, Result, Status};
use http::Method;
use regex::Regex;
use std::collections::HashSet;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{OnceCell, Semaphore};
use tokio::time::Instant;
use tracing::Instrument;
use url::Url;

/// The default base URL of the service.
pub const DEFAULT_BASE_URL: &str = "https://overpass-api.de/api/";

/// The default `User-Agent` header.
pub const DEFAULT_USER_AGENT: &str = concat!("overpass-engine/", env!("CARGO_PKG_VERSION"));

const DEFAULT_CONCURRENCY: usize = 32;
const DEFAULT_STATUS_TIMEOUT: Duration = Duration::from_secs(10);

/// A client for a rate-limited query service.
///
/// The client is designed to be shared: clones are cheap and use the same
/// connection pool and the same query slots.
///
/// # Examples
///
/// ```no_run
/// use overpass_engine::{Client, DefaultQueryRunner, Query};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), overpass_engine::Error> {
/// let runner = DefaultQueryRunner::builder()
///     .max_tries(3)?
///     .cache_ttl(Duration::from_secs(600))
///     .build();
///
/// let client = Client::builder()
///     .user_agent("my-app/1.0")
///     .concurrency(4)?
///     .runner(Arc::new(runner))
///     .build()?;
///
/// let mut query = Query::new("[timeout:60]; node[amenity=cafe](52.5,13.3,52.6,13.5); out;")
///     .with_run_timeout(Some(Duration::from_secs(300)));
///
/// client.run_query(&mut query).await?;
/// println!("{} cafes", query.result_set().map_or(0, |e| e.len()));
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    transport: Arc<dyn Transport>,
    runner: Arc<dyn QueryRunner>,
    concurrency: usize,
    status_timeout: Duration,
    limiter: OnceCell<Semaphore>,
}

impl Client {
    /// Creates a new builder for configuring a `Client`.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use overpass_engine::Client;
    ///
    /// let client = Client::builder()
    ///     .base_url("https://overpass.kumi.systems/api/")?
    ///     .build()?;
    /// # Ok::<(), overpass_engine::Error>(())
    /// ```
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Runs a query until it succeeds or the query runner stops retrying.
    ///
    /// Running entails waiting for a query slot, the query requests
    /// themselves (which may be retried), status requests when the service is
    /// rate limiting us, and cooldown periods. A query that was tried before
    /// is reset first.
    ///
    /// The outcome is recorded on the query. If the query failed and
    /// [`Query::raise_on_failure`] is set, its error is also returned.
    ///
    /// # Errors
    ///
    /// Returns the error of the last try, or [`Error::Giveup`] if a time
    /// budget or the try ceiling was hit.
    pub async fn run_query(&self, query: &mut Query) -> Result<()> {
        let span = query.span().clone();
        self.run(query).instrument(span).await
    }

    async fn run(&self, query: &mut Query) -> Result<()> {
        if query.nb_tries() > 0 || query.done() || query.error().is_some() {
            tracing::info!(query = %query, "Resetting query before running it again");
            query.reset();
        }

        let runner = &self.inner.runner;

        if let Some(payload) = runner.before_run(query).await {
            query.succeed_from_cache(payload);
            tracing::info!(query = %query, "Using cached result");
            return Ok(());
        }

        let result = self.run_tries(query).await;
        query.finish();

        match result {
            Ok(()) => {
                tracing::info!(query = %query, "Query succeeded");
                runner.after_run(query).await;
                Ok(())
            }
            Err(e) => {
                tracing::error!(query = %query, error = %e, "Query failed");
                query.fail_try(e.clone());
                if query.raise_on_failure() {
                    Err(e)
                } else {
                    Ok(())
                }
            }
        }
    }

    async fn run_tries(&self, query: &mut Query) -> Result<()> {
        let runner = &self.inner.runner;

        loop {
            query.begin_try();
            let attempt = query.nb_tries() + 1;

            let code = query.next_code()?;

            let Some(limiter) = self.limiter(query.remaining_run_time()).await else {
                return Err(query.giveup(GiveupCause::RunTimeoutBeforeQueryCall));
            };
            if limiter.available_permits() == 0 {
                tracing::info!(attempt = attempt, "Waiting for a query slot");
            }

            let acquire = limiter.acquire();
            let permit = match query.remaining_run_time() {
                None => acquire.await,
                Some(remaining) => match tokio::time::timeout(remaining, acquire).await {
                    Ok(permit) => permit,
                    Err(_) => return Err(query.giveup(GiveupCause::RunTimeoutBeforeQueryCall)),
                },
            }
            .map_err(|e| Error::Configuration(format!("Query slots unavailable: {}", e)))?;

            let remaining = query.remaining_run_time();
            if remaining.is_some_and(|r| r.is_zero()) {
                return Err(query.giveup(GiveupCause::RunTimeoutBeforeQueryCall));
            }

            let timeout_secs = query.last_timeout_secs_used().unwrap_or(query.timeout_secs());
            let request_timeout = Duration::from_secs(u64::from(timeout_secs))
                .saturating_add(query.request_timeout().total_without_query);

            let call = Call::new(Method::POST, Endpoint::Interpreter)
                .with_form_param("data", code)
                .with_timeout(Some(request_timeout))
                .with_connect_timeout(query.request_timeout().connect);

            query.begin_request();
            tracing::info!(attempt = attempt, timeout_secs = timeout_secs, "Sending query");

            let sent = match remaining {
                Some(budget) if budget < request_timeout => {
                    match tokio::time::timeout(budget, self.inner.transport.send(call)).await {
                        Ok(sent) => sent,
                        Err(_) => {
                            drop(permit);
                            query.end_try();
                            return Err(query.giveup(GiveupCause::RunTimeoutDuringQueryCall));
                        }
                    }
                }
                _ => self.inner.transport.send(call).await,
            };

            drop(permit);
            query.end_try();

            let e = match sent.and_then(classify) {
                Ok(response) => {
                    tracing::debug!(
                        attempt = attempt,
                        size_bytes = response.size_bytes,
                        "Query try succeeded"
                    );
                    query.succeed_try(response);
                    return Ok(());
                }
                Err(e) => e,
            };

            tracing::warn!(error = %e, attempt = attempt, "Query try failed");

            query.fail_try(e.clone());

            if e.is_rate_limited() {
                let cooldown_until = match self.probe_status(query.remaining_run_time()).await {
                    None => return Err(query.giveup(GiveupCause::RunTimeoutBeforeQueryCall)),
                    Some(Ok(status)) => {
                        tracing::info!(
                            cooldown_secs = status.cooldown.as_secs(),
                            status = %status,
                            "Rate limited"
                        );
                        status.cooldown_until
                    }
                    Some(Err(status_error)) => {
                        tracing::warn!(error = %status_error, "Failed to look up cooldown");
                        None
                    }
                };
                query.set_cooldown_until(cooldown_until);
            }

            if !runner.should_retry(query, &e) {
                if e.should_retry() {
                    return Err(query.giveup(GiveupCause::RetriesExhausted));
                }
                return Err(e);
            }

            let delay = runner.wait_before_retry(query, &e);

            if let Some(remaining) = query.remaining_run_time() {
                if delay >= remaining {
                    let cause = if e.is_rate_limited() {
                        GiveupCause::RunTimeoutByCooldown
                    } else {
                        GiveupCause::RunTimeoutBeforeQueryCall
                    };
                    return Err(query.giveup(cause));
                }
            }

            if !delay.is_zero() {
                tracing::info!(
                    delay_ms = delay.as_millis(),
                    attempt = attempt,
                    "Retrying query after delay"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }

    /// The query slots, sized by the first status probe.
    ///
    /// Returns `None` if the run budget ran out during the probe. The slots
    /// are then left for the next query to size.
    async fn limiter(&self, budget: Option<Duration>) -> Option<&Semaphore> {
        self.inner
            .limiter
            .get_or_try_init(|| async {
                let concurrency = match self.probe_status(budget).await.ok_or(())? {
                    Ok(status) => status.concurrency,
                    Err(e) => {
                        tracing::warn!(
                            error = %e,
                            concurrency = self.inner.concurrency,
                            "Failed to look up query slots, using configured concurrency"
                        );
                        self.inner.concurrency
                    }
                };
                tracing::debug!(concurrency = concurrency, "Initialized query slots");
                Ok::<_, ()>(Semaphore::new(concurrency))
            })
            .await
            .ok()
    }

    /// Checks the status on behalf of a running query.
    ///
    /// Returns `None` if the remaining run `budget` elapsed first.
    async fn probe_status(&self, budget: Option<Duration>) -> Option<Result<Status>> {
        match budget {
            Some(budget) if budget < self.inner.status_timeout => {
                tokio::time::timeout(budget, self.status()).await.ok()
            }
            _ => Some(self.status().await),
        }
    }

    /// Checks the current rate limit status of this client.
    ///
    /// Status requests do not need a query slot.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the report cannot be parsed.
    pub async fn status(&self) -> Result<Status> {
        let call = Call::new(Method::GET, Endpoint::Status)
            .with_timeout(Some(self.inner.status_timeout));

        let response = match tokio::time::timeout(
            self.inner.status_timeout,
            self.inner.transport.send(call),
        )
        .await
        {
            Ok(response) => response?,
            Err(_) => {
                return Err(Error::CallTimeout {
                    after: self.inner.status_timeout,
                })
            }
        };

        if !response.status.is_success() {
            return Err(response_error(response));
        }

        match Status::parse(&response.body, self.inner.concurrency, Instant::now()) {
            Some(status) => Ok(status),
            None => {
                tracing::error!(body = %response.body, "Failed to parse status report");
                Err(response_error(response))
            }
        }
    }

    /// Cancels all queries this client is running.
    ///
    /// This can be used to terminate runaway queries that prevent new ones
    /// from getting a slot. It does not need a query slot. Failure is logged
    /// and yields `None`; otherwise the number of terminated queries is
    /// returned.
    pub async fn cancel_queries(&self, timeout: Duration) -> Option<usize> {
        let call = Call::new(Method::POST, Endpoint::KillMyQueries).with_timeout(Some(timeout));

        let response = match tokio::time::timeout(timeout, self.inner.transport.send(call)).await {
            Ok(Ok(response)) if response.status.is_success() => response,
            Ok(Ok(response)) => {
                tracing::warn!(status = response.status.as_u16(), "Failed to cancel queries");
                return None;
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Failed to cancel queries");
                return None;
            }
            Err(_) => {
                tracing::warn!(timeout_ms = timeout.as_millis(), "Cancelling queries timed out");
                return None;
            }
        };

        let killed: HashSet<&str> = pid_pattern()
            .captures_iter(&response.body)
            .filter_map(|c| c.get(1))
            .map(|m| m.as_str())
            .collect();

        tracing::info!(killed = killed.len(), "Cancelled queries");
        Some(killed.len())
    }

    /// Removes a result cached by the query runner.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache entry exists but cannot be removed.
    pub async fn cache_delete(&self, query: &Query) -> std::io::Result<()> {
        self.inner.runner.cache_delete(&query.cache_key()).await
    }
}

fn pid_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\(pid (\d+)\)").expect("valid regex"))
}

/// Builder for configuring and creating a [`Client`].
///
/// # Examples
///
/// ```no_run
/// use overpass_engine::Client;
/// use std::time::Duration;
///
/// # fn example() -> Result<(), overpass_engine::Error> {
/// let client = Client::builder()
///     .base_url("https://overpass-api.de/api/")?
///     .user_agent("my-app/1.0")
///     .concurrency(2)?
///     .status_timeout(Duration::from_secs(5))
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct ClientBuilder {
    base_url: Option<Url>,
    user_agent: String,
    concurrency: usize,
    status_timeout: Duration,
    runner: Option<Arc<dyn QueryRunner>>,
    transport: Option<Arc<dyn Transport>>,
}

impl ClientBuilder {
    /// Creates a new `ClientBuilder` with default settings.
    pub fn new() -> Self {
        Self {
            base_url: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            concurrency: DEFAULT_CONCURRENCY,
            status_timeout: DEFAULT_STATUS_TIMEOUT,
            runner: None,
            transport: None,
        }
    }

    /// Sets the base URL the service endpoints are resolved against.
    ///
    /// A missing trailing slash is added, so that `https://host/api` and
    /// `https://host/api/` both resolve to `https://host/api/interpreter`.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid.
    pub fn base_url(mut self, url: impl AsRef<str>) -> Result<Self> {
        let url = url.as_ref();
        let url = if url.ends_with('/') {
            Url::parse(url)?
        } else {
            Url::parse(&format!("{}/", url))?
        };
        self.base_url = Some(url);
        Ok(self)
    }

    /// Sets the `User-Agent` header.
    ///
    /// The service identifies clients by address and user agent, so this
    /// also scopes which queries [`Client::cancel_queries`] terminates.
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Sets the maximum number of concurrent query requests.
    ///
    /// The effective limit is the smaller of this and the number of slots
    /// the service grants.
    ///
    /// # Errors
    ///
    /// Returns an error if `concurrency` is zero.
    pub fn concurrency(mut self, concurrency: usize) -> Result<Self> {
        if concurrency == 0 {
            return Err(Error::Configuration("concurrency must be > 0".to_string()));
        }
        self.concurrency = concurrency;
        Ok(self)
    }

    /// Sets the timeout for status requests.
    pub fn status_timeout(mut self, timeout: Duration) -> Self {
        self.status_timeout = timeout;
        self
    }

    /// Sets the query runner.
    ///
    /// By default, a [`DefaultQueryRunner`] without caching is used.
    pub fn runner(mut self, runner: Arc<dyn QueryRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    /// Sets the transport, replacing the HTTP client.
    ///
    /// The base URL and user agent are not used with a custom transport.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Builds the configured `Client`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn build(self) -> Result<Client> {
        let transport = match self.transport {
            Some(transport) => transport,
            None => {
                let base_url = match self.base_url {
                    Some(url) => url,
                    None => Url::parse(DEFAULT_BASE_URL)?,
                };
                Arc::new(HttpTransport::new(base_url, self.user_agent)?)
            }
        };

        let runner = self
            .runner
            .unwrap_or_else(|| Arc::new(DefaultQueryRunner::default()));

        Ok(Client {
            inner: Arc::new(ClientInner {
                transport,
                runner,
                concurrency: self.concurrency,
                status_timeout: self.status_timeout,
                limiter: OnceCell::new(),
            }),
        })
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}
