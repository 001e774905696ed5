//! Retry policy and result caching.
//!
//! The client asks a [`QueryRunner`] whether and when to try a failed query
//! again, and gives it a chance to answer a query from a cache before the
//! first try. [`DefaultQueryRunner`] is the policy used unless another one is
//! configured.

use crate::cache::ResponseCache;
use crate::{Error, Query, Result};
use async_trait::async_trait;
use rand::Rng;
use serde_json::Value;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

/// How long to wait between tries of a failed query.
///
/// # Examples
///
/// ```
/// use overpass_engine::Backoff;
/// use std::time::Duration;
///
/// // Fibonacci backoff: 1s, 2s, 3s, 5s, 8s...
/// let fibonacci = Backoff::default();
/// assert_eq!(fibonacci.delay_for_try(1), Duration::from_secs(1));
/// assert_eq!(fibonacci.delay_for_try(4), Duration::from_secs(5));
///
/// // Exponential backoff: 100ms, 200ms, 400ms, 800ms...
/// let exponential = Backoff::Exponential {
///     initial_delay: Duration::from_millis(100),
///     max_delay: Duration::from_secs(30),
///     jitter: true,
/// };
///
/// // Linear backoff: 1s, 1s, 1s...
/// let linear = Backoff::Linear {
///     delay: Duration::from_secs(1),
/// };
/// ```
#[derive(Debug, Clone)]
pub enum Backoff {
    /// Retry immediately.
    None,

    /// Wait `base` times the Fibonacci number of the try count (1, 1, 2,
    /// 3, 5, ...), so the delay after the first try is `base`, after the
    /// second `2 * base`, and so on (capped at `max_delay`).
    Fibonacci {
        /// The unit of the sequence.
        base: Duration,
        /// The maximum delay between tries.
        max_delay: Duration,
        /// Whether to add random jitter to delays.
        jitter: bool,
    },

    /// Each retry waits for `initial_delay * 2^(tries - 1)` (capped at `max_delay`).
    Exponential {
        /// The delay after the first try.
        initial_delay: Duration,
        /// The maximum delay between tries.
        max_delay: Duration,
        /// Whether to add random jitter to delays.
        jitter: bool,
    },

    /// Wait a fixed delay between tries.
    Linear {
        /// The delay between tries.
        delay: Duration,
    },

    /// Custom backoff.
    Custom {
        /// Takes the number of tries so far and returns the delay before the next one.
        delay_fn: fn(tries: u32) -> Duration,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Fibonacci {
            base: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            jitter: false,
        }
    }
}

impl Backoff {
    /// Returns the delay before the next try, after `tries` tries.
    pub fn delay_for_try(&self, tries: u32) -> Duration {
        match self {
            Backoff::None => Duration::ZERO,
            Backoff::Fibonacci {
                base,
                max_delay,
                jitter,
            } => {
                let factor = u32::try_from(fibonacci(tries)).unwrap_or(u32::MAX);
                with_jitter(base.saturating_mul(factor).min(*max_delay), *jitter)
            }
            Backoff::Exponential {
                initial_delay,
                max_delay,
                jitter,
            } => {
                let multiplier = 2u64.saturating_pow(tries.saturating_sub(1));
                let base_delay =
                    initial_delay.saturating_mul(multiplier.try_into().unwrap_or(u32::MAX));
                with_jitter(base_delay.min(*max_delay), *jitter)
            }
            Backoff::Linear { delay } => *delay,
            Backoff::Custom { delay_fn } => delay_fn(tries),
        }
    }
}

fn with_jitter(delay: Duration, jitter: bool) -> Duration {
    if jitter {
        // random value between 50% and 100% of the delay
        let jitter_factor = rand::thread_rng().gen_range(0.5..=1.0);
        delay.mul_f64(jitter_factor)
    } else {
        delay
    }
}

/// Fibonacci sequence without zero: 1, 1, 2, 3, 5, 8, ...
fn fibonacci(n: u32) -> u64 {
    let (mut a, mut b) = (1u64, 1u64);
    for _ in 0..n {
        (a, b) = (b, a.saturating_add(b));
    }
    a
}

/// Decides how the client handles a query before, between, and after tries.
///
/// The client keeps the time budgets and counts tries on its own; a runner
/// only has to answer the questions below. Caching hooks have no-op defaults.
///
/// # Examples
///
/// ```
/// use overpass_engine::{Error, Query, QueryRunner};
/// use async_trait::async_trait;
/// use std::time::Duration;
///
/// /// Tries every query once, never retries.
/// struct TryOnce;
///
/// #[async_trait]
/// impl QueryRunner for TryOnce {
///     fn should_retry(&self, _query: &Query, _error: &Error) -> bool {
///         false
///     }
///
///     fn wait_before_retry(&self, _query: &Query, _error: &Error) -> Duration {
///         Duration::ZERO
///     }
/// }
/// ```
#[async_trait]
pub trait QueryRunner: Send + Sync {
    /// Returns `true` if the query should be tried again after `error`.
    fn should_retry(&self, query: &Query, error: &Error) -> bool;

    /// Returns how long to wait before trying again after `error`.
    fn wait_before_retry(&self, query: &Query, error: &Error) -> Duration;

    /// Called before the first try. Returning a payload finishes the query
    /// with that payload without sending a request.
    async fn before_run(&self, _query: &Query) -> Option<Value> {
        None
    }

    /// Called after a query finished successfully.
    async fn after_run(&self, _query: &Query) {}

    /// Removes whatever is cached under `key`.
    async fn cache_delete(&self, _key: &str) -> io::Result<()> {
        Ok(())
    }
}

/// The default query runner.
///
/// - Retries errors that are retryable, up to `max_tries` tries.
/// - Waits until the cooldown ends when rate limited, and backs off otherwise.
/// - Caches results on disk for `cache_ttl`, if set.
///
/// # Examples
///
/// ```
/// use overpass_engine::{Backoff, DefaultQueryRunner};
/// use std::time::Duration;
///
/// # fn example() -> Result<(), overpass_engine::Error> {
/// let runner = DefaultQueryRunner::builder()
///     .max_tries(3)?
///     .cache_ttl(Duration::from_secs(3600))
///     .backoff(Backoff::Linear { delay: Duration::from_secs(5) })
///     .build();
///
/// assert_eq!(runner.max_tries(), 3);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct DefaultQueryRunner {
    max_tries: u32,
    cache_ttl: Option<Duration>,
    cache: ResponseCache,
    backoff: Backoff,
}

impl DefaultQueryRunner {
    /// Creates a new builder for configuring a `DefaultQueryRunner`.
    pub fn builder() -> DefaultQueryRunnerBuilder {
        DefaultQueryRunnerBuilder::new()
    }

    /// The maximum number of tries per query.
    pub fn max_tries(&self) -> u32 {
        self.max_tries
    }

    /// How long results stay cached, or `None` if caching is disabled.
    pub fn cache_ttl(&self) -> Option<Duration> {
        self.cache_ttl
    }
}

impl Default for DefaultQueryRunner {
    fn default() -> Self {
        DefaultQueryRunnerBuilder::new().build()
    }
}

#[async_trait]
impl QueryRunner for DefaultQueryRunner {
    fn should_retry(&self, query: &Query, error: &Error) -> bool {
        if let Error::Response { status, body, .. } = error {
            if status.is_server_error() {
                tracing::error!(status = status.as_u16(), body = %body, "Unexpected response body");
            }
        }

        error.should_retry() && query.nb_tries() < self.max_tries
    }

    fn wait_before_retry(&self, query: &Query, error: &Error) -> Duration {
        if query.nb_tries() == 0 {
            return Duration::ZERO;
        }

        if error.is_rate_limited() {
            if let Some(cooldown) = query.cooldown() {
                return cooldown;
            }
            if let Some(retry_after) = error.retry_after() {
                return retry_after;
            }
        }

        self.backoff.delay_for_try(query.nb_tries())
    }

    async fn before_run(&self, query: &Query) -> Option<Value> {
        if self.cache_ttl.is_none() {
            tracing::debug!("Caching is disabled");
            return None;
        }

        let key = query.cache_key();

        match self.cache.get(&key).await {
            Ok(Some(payload)) => {
                tracing::info!(cache_key = %key, "Result was cached");
                Some(payload)
            }
            Ok(None) => {
                tracing::info!(cache_key = %key, "Result was not cached");
                None
            }
            Err(e) => {
                tracing::warn!(cache_key = %key, error = %e, "Failed to read cached result");
                None
            }
        }
    }

    async fn after_run(&self, query: &Query) {
        let Some(ttl) = self.cache_ttl else {
            return;
        };
        if query.was_cached() {
            return;
        }
        let Some(response) = query.response() else {
            return;
        };

        let key = query.cache_key();
        tracing::debug!(cache_key = %key, dir = %self.cache.dir().display(), "Caching result");
        if let Err(e) = self.cache.put(&key, &response.data, ttl).await {
            tracing::warn!(cache_key = %key, error = %e, "Failed to cache result");
        }
    }

    async fn cache_delete(&self, key: &str) -> io::Result<()> {
        self.cache.delete(key).await
    }
}

/// Builder for [`DefaultQueryRunner`].
#[derive(Debug, Clone)]
pub struct DefaultQueryRunnerBuilder {
    max_tries: u32,
    cache_ttl: Option<Duration>,
    cache_dir: Option<PathBuf>,
    backoff: Backoff,
}

impl DefaultQueryRunnerBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self {
            max_tries: 5,
            cache_ttl: None,
            cache_dir: None,
            backoff: Backoff::default(),
        }
    }

    /// Sets the maximum number of tries per query.
    ///
    /// # Errors
    ///
    /// Returns an error if `max_tries` is zero.
    pub fn max_tries(mut self, max_tries: u32) -> Result<Self> {
        if max_tries < 1 {
            return Err(Error::Configuration("max_tries must be >= 1".to_string()));
        }
        self.max_tries = max_tries;
        Ok(self)
    }

    /// Enables caching of results for the given duration. A zero duration
    /// disables caching.
    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = (!ttl.is_zero()).then_some(ttl);
        self
    }

    /// Sets the directory cached results are stored in.
    ///
    /// Defaults to `overpass-engine` in the system's temp directory.
    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    /// Sets the backoff between tries.
    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Builds the configured `DefaultQueryRunner`.
    pub fn build(self) -> DefaultQueryRunner {
        let dir = self.cache_dir.unwrap_or_else(ResponseCache::default_dir);
        DefaultQueryRunner {
            max_tries: self.max_tries,
            cache_ttl: self.cache_ttl,
            cache: ResponseCache::new(dir),
            backoff: self.backoff,
        }
    }
}

impl Default for DefaultQueryRunnerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
