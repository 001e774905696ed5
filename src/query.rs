//! Query state.
//!
//! A [`Query`] holds a query program together with everything that happens to
//! it while the client runs it: the number of tries, timing of each try, and
//! finally either a response or an error. It is owned by the caller and only
//! mutated by the client while [`Client::run_query`](crate::Client::run_query)
//! holds it.

use crate::error::GiveupCause;
use crate::response::{QueryResponse, COPYRIGHT};
use crate::{Error, Result};
use regex::Regex;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::time::Instant;
use tracing::Span;

/// Default `[maxsize:*]` setting in mebibytes.
pub const DEFAULT_MAXSIZE_MIB: u64 = 512;

/// Default `[timeout:*]` setting in seconds.
pub const DEFAULT_TIMEOUT_SECS: u32 = 180;

const DEFAULT_TOTAL_WITHOUT_QUERY: Duration = Duration::from_secs(20);

/// Request timeout settings.
///
/// The timeout of a whole interpreter request is the query's `[timeout:*]`
/// plus `total_without_query`, so the transport never cuts off a query the
/// service is still allowed to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestTimeout {
    /// Added to the `[timeout:*]` setting to get the request timeout.
    pub total_without_query: Duration,

    /// Timeout for establishing a connection, if any.
    pub connect: Option<Duration>,
}

impl Default for RequestTimeout {
    fn default() -> Self {
        Self {
            total_without_query: DEFAULT_TOTAL_WITHOUT_QUERY,
            connect: None,
        }
    }
}

impl RequestTimeout {
    fn validate(&self) -> Result<()> {
        if self.total_without_query.is_zero() {
            return Err(Error::Configuration(
                "total_without_query must be > 0".to_string(),
            ));
        }
        if self.connect.is_some_and(|d| d.is_zero()) {
            return Err(Error::Configuration(
                "connect timeout must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// State of a query that is either pending, running, successful, or failed.
///
/// # Examples
///
/// ```
/// use overpass_engine::Query;
/// use std::time::Duration;
///
/// let query = Query::new("[timeout:60][out:xml]; node(1); out;")
///     .with_label("name", "first node")
///     .with_run_timeout(Some(Duration::from_secs(300)));
///
/// assert_eq!(query.timeout_secs(), 60);
/// assert!(query.code().starts_with("[timeout:60][out:json][maxsize:536870912];"));
/// assert_eq!(query.nb_tries(), 0);
/// assert!(!query.done());
/// ```
#[derive(Debug, Clone)]
pub struct Query {
    input_code: String,
    settings: Vec<(String, String)>,
    labels: Vec<(String, String)>,
    span: Span,

    run_timeout: Option<Duration>,
    request_timeout: RequestTimeout,
    raise_on_failure: bool,

    nb_tries: u32,
    response: Option<QueryResponse>,
    error: Option<Error>,
    was_cached: bool,

    started_at: Option<Instant>,
    try_started_at: Option<Instant>,
    request_started_at: Option<Instant>,
    ended_at: Option<Instant>,

    last_timeout_secs_used: Option<u32>,
    max_timeout_secs_exceeded: Option<u32>,
    cooldown_until: Option<Instant>,
}

impl Query {
    /// Creates a query for the given program.
    ///
    /// Leading `[key:value]` settings are kept, except that `out` is always
    /// `json`. Missing `timeout` and `maxsize` settings get their defaults.
    pub fn new(input_code: impl Into<String>) -> Self {
        let input_code = input_code.into();

        let mut settings: Vec<(String, String)> = Vec::new();
        for captures in setting_pattern().captures_iter(&input_code) {
            put_setting(&mut settings, &captures[1], captures[2].to_string());
        }

        put_setting(&mut settings, "out", "json".to_string());

        if !settings.iter().any(|(k, _)| k == "maxsize") {
            let bytes = DEFAULT_MAXSIZE_MIB * 1024 * 1024;
            put_setting(&mut settings, "maxsize", bytes.to_string());
        }

        if !settings.iter().any(|(k, _)| k == "timeout") {
            put_setting(&mut settings, "timeout", DEFAULT_TIMEOUT_SECS.to_string());
        }

        Self {
            input_code,
            settings,
            labels: Vec::new(),
            span: Span::none(),
            run_timeout: None,
            request_timeout: RequestTimeout::default(),
            raise_on_failure: true,
            nb_tries: 0,
            response: None,
            error: None,
            was_cached: false,
            started_at: None,
            try_started_at: None,
            request_started_at: None,
            ended_at: None,
            last_timeout_secs_used: None,
            max_timeout_secs_exceeded: None,
            cooldown_until: None,
        }
    }

    /// Adds a label that identifies this query in logs.
    pub fn with_label(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.labels.push((key.into(), value.to_string()));
        self
    }

    /// Sets the span that log events of this query are emitted in.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Sets the total time limit for running this query, across all tries.
    ///
    /// `Some(Duration::ZERO)` means the budget is already spent, so the query
    /// gives up without sending a request.
    pub fn with_run_timeout(mut self, run_timeout: Option<Duration>) -> Self {
        self.run_timeout = run_timeout;
        self
    }

    /// Sets whether [`Client::run_query`](crate::Client::run_query) returns
    /// the error of a failed query, in addition to recording it.
    pub fn with_raise_on_failure(mut self, raise_on_failure: bool) -> Self {
        self.raise_on_failure = raise_on_failure;
        self
    }

    /// Sets the request timeout settings.
    ///
    /// # Errors
    ///
    /// Returns an error if any of the durations is zero.
    pub fn with_request_timeout(mut self, request_timeout: RequestTimeout) -> Result<Self> {
        self.set_request_timeout(request_timeout)?;
        Ok(self)
    }

    /// See [`Query::with_request_timeout`].
    pub fn set_request_timeout(&mut self, request_timeout: RequestTimeout) -> Result<()> {
        request_timeout.validate()?;
        self.request_timeout = request_timeout;
        Ok(())
    }

    /// See [`Query::with_run_timeout`].
    pub fn set_run_timeout(&mut self, run_timeout: Option<Duration>) {
        self.run_timeout = run_timeout;
    }

    /// Changes the `[timeout:*]` setting.
    ///
    /// # Errors
    ///
    /// Returns an error if `secs` is zero.
    pub fn set_timeout_secs(&mut self, secs: u32) -> Result<()> {
        if secs == 0 {
            return Err(Error::Configuration("timeout_secs must be >= 1".to_string()));
        }
        put_setting(&mut self.settings, "timeout", secs.to_string());
        Ok(())
    }

    /// Changes the `[maxsize:*]` setting.
    ///
    /// # Errors
    ///
    /// Returns an error unless `mib` is a positive number.
    pub fn set_maxsize_mib(&mut self, mib: f64) -> Result<()> {
        if !mib.is_finite() || mib <= 0.0 {
            return Err(Error::Configuration("maxsize_mib must be > 0".to_string()));
        }
        let bytes = (mib * 1024.0 * 1024.0) as u64;
        put_setting(&mut self.settings, "maxsize", bytes.to_string());
        Ok(())
    }

    /// Resets the query to its initial state, ignoring previous tries.
    ///
    /// The program, its settings, labels, span and budgets are kept.
    pub fn reset(&mut self) {
        let fresh = Query {
            settings: std::mem::take(&mut self.settings),
            labels: std::mem::take(&mut self.labels),
            span: self.span.clone(),
            run_timeout: self.run_timeout,
            request_timeout: self.request_timeout,
            raise_on_failure: self.raise_on_failure,
            ..Query::new(std::mem::take(&mut self.input_code))
        };
        *self = fresh;
    }

    /// The original program, as given.
    pub fn input_code(&self) -> &str {
        &self.input_code
    }

    /// The settings in the order they are sent.
    pub fn settings(&self) -> &[(String, String)] {
        &self.settings
    }

    /// The labels that identify this query.
    pub fn labels(&self) -> &[(String, String)] {
        &self.labels
    }

    /// The span that log events of this query are emitted in.
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// The current `[timeout:*]` setting in seconds.
    pub fn timeout_secs(&self) -> u32 {
        self.setting("timeout")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(DEFAULT_TIMEOUT_SECS)
    }

    /// The current `[maxsize:*]` setting in mebibytes.
    pub fn maxsize_mib(&self) -> f64 {
        let bytes: f64 = self
            .setting("maxsize")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or((DEFAULT_MAXSIZE_MIB * 1024 * 1024) as f64);
        bytes / 1024.0 / 1024.0
    }

    /// The total time limit for running this query, if any.
    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout
    }

    /// The request timeout settings.
    pub fn request_timeout(&self) -> RequestTimeout {
        self.request_timeout
    }

    /// Whether a failure is returned as `Err` in addition to being recorded.
    pub fn raise_on_failure(&self) -> bool {
        self.raise_on_failure
    }

    /// The number of tries that sent a request so far.
    pub fn nb_tries(&self) -> u32 {
        self.nb_tries
    }

    /// The error of the most recent try, or `None` if the query was not
    /// tried or has not failed.
    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    /// The response, or `None` if the query has not successfully finished.
    pub fn response(&self) -> Option<&QueryResponse> {
        self.response.as_ref()
    }

    /// Returns `true` if the result came from the cache instead of the service.
    pub fn was_cached(&self) -> bool {
        self.was_cached
    }

    /// Returns `true` if the result set was received.
    pub fn done(&self) -> bool {
        self.response.is_some()
    }

    /// The elements of the result set.
    ///
    /// This is open data, licensed under the Open Data Commons Open Database
    /// License (ODbL). You are free to copy, distribute, transmit and adapt
    /// this data, as long as you credit OpenStreetMap and its contributors.
    pub fn result_set(&self) -> Option<&[Value]> {
        self.response.as_ref()?.elements()
    }

    /// The size of the response in mebibytes.
    pub fn response_size_mib(&self) -> Option<f64> {
        self.response.as_ref().map(QueryResponse::size_mib)
    }

    /// The API version of the instance that answered.
    pub fn api_version(&self) -> Option<&str> {
        self.response.as_ref()?.api_version()
    }

    /// All edits uploaded before this date are included in the result.
    pub fn timestamp_osm(&self) -> Option<&str> {
        self.response.as_ref()?.timestamp_osm()
    }

    /// The date of the latest edit included in the area data, if the query used it.
    pub fn timestamp_areas(&self) -> Option<&str> {
        self.response.as_ref()?.timestamp_areas()
    }

    /// The copyright notice that comes with the result set.
    pub fn copyright(&self) -> &str {
        self.response
            .as_ref()
            .map_or(COPYRIGHT, QueryResponse::copyright)
    }

    /// How long it took to fetch the result, from sending the request to
    /// receiving the response. `None` before success, or for cached results.
    pub fn request_duration(&self) -> Option<Duration> {
        if self.response.is_none() || self.was_cached {
            return None;
        }
        let start = self.request_started_at?;
        Some(self.ended_at?.saturating_duration_since(start))
    }

    /// The total time spent on this query so far.
    pub fn run_duration(&self) -> Option<Duration> {
        let start = self.started_at?;
        let end = self.ended_at.unwrap_or_else(Instant::now);
        Some(end.saturating_duration_since(start))
    }

    /// How long the most recent try took, or has taken so far.
    pub fn try_duration(&self) -> Option<Duration> {
        let start = self.try_started_at?;
        let end = self.ended_at.unwrap_or_else(Instant::now);
        Some(end.saturating_duration_since(start))
    }

    /// Returns `true` if a run timeout is set and has elapsed.
    pub fn run_timeout_elapsed(&self) -> bool {
        match (self.run_timeout, self.run_duration()) {
            (Some(limit), Some(elapsed)) => limit <= elapsed,
            _ => false,
        }
    }

    /// The time left of the run timeout, or `None` if there is none.
    pub fn remaining_run_time(&self) -> Option<Duration> {
        let limit = self.run_timeout?;
        Some(limit.saturating_sub(self.run_duration().unwrap_or_default()))
    }

    /// When the service's cooldown for this client ends, as learned from the
    /// last status probe after a rate limit error.
    pub fn cooldown_until(&self) -> Option<Instant> {
        self.cooldown_until
    }

    /// How long the cooldown recorded for this query still lasts.
    pub fn cooldown(&self) -> Option<Duration> {
        let until = self.cooldown_until?;
        let now = Instant::now();
        (until > now).then(|| until - now)
    }

    /// A key that identifies the query program, ignoring its settings.
    ///
    /// The default query runner uses this as cache key.
    pub fn cache_key(&self) -> String {
        let code = setting_pattern().replace_all(&self.input_code, "");
        let digest = Sha256::digest(code.as_bytes());
        digest[..8].iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// The program as it is sent to the service, with the current settings.
    pub fn code(&self) -> String {
        self.render(None)
    }

    /// Renders the program for the next try.
    ///
    /// The `[timeout:*]` setting is lowered to what is left of the run
    /// timeout, never raised.
    pub(crate) fn next_code(&mut self) -> Result<String> {
        let setting = self.timeout_secs();
        let mut max_timeout = setting;

        if let Some(limit) = self.run_timeout {
            let elapsed = self.run_duration().unwrap_or_default();
            let remaining = limit.saturating_sub(elapsed);
            if remaining.is_zero() {
                return Err(self.giveup(GiveupCause::RunTimeoutBeforeQueryCall));
            }
            let remaining_secs = remaining.as_secs_f64().ceil() as u64;
            max_timeout = max_timeout.min(u32::try_from(remaining_secs).unwrap_or(u32::MAX));
        }

        if self
            .max_timeout_secs_exceeded
            .is_some_and(|exceeded| exceeded >= max_timeout)
        {
            tracing::error!(query = %self, "Giving up since query will likely time out");
            return Err(self.giveup(GiveupCause::ExpectingQueryTimeout));
        }

        if max_timeout != setting {
            tracing::info!(timeout_secs = max_timeout, "Adjusting query timeout");
        }

        self.last_timeout_secs_used = Some(max_timeout);
        Ok(self.render(Some(max_timeout)))
    }

    /// The `[timeout:*]` used by the latest try.
    pub(crate) fn last_timeout_secs_used(&self) -> Option<u32> {
        self.last_timeout_secs_used
    }

    /// Builds a give-up error carrying the elapsed time and last error.
    pub(crate) fn giveup(&self, cause: GiveupCause) -> Error {
        Error::Giveup {
            cause,
            after: self.run_duration().unwrap_or_default(),
            last_error: self.error.clone().map(Box::new),
        }
    }

    pub(crate) fn begin_try(&mut self) {
        let now = Instant::now();
        self.started_at.get_or_insert(now);
        self.try_started_at = Some(now);
        self.request_started_at = None;
        self.ended_at = None;
    }

    pub(crate) fn begin_request(&mut self) {
        self.request_started_at = Some(Instant::now());
    }

    pub(crate) fn succeed_try(&mut self, response: QueryResponse) {
        self.response = Some(response);
        self.error = None;
    }

    pub(crate) fn fail_try(&mut self, err: Error) {
        if err.is_exceeding_timeout() {
            if let Some(used) = self.last_timeout_secs_used {
                let exceeded = self.max_timeout_secs_exceeded.map_or(used, |m| m.max(used));
                self.max_timeout_secs_exceeded = Some(exceeded);
            }
        }
        self.error = Some(err);
    }

    pub(crate) fn end_try(&mut self) {
        self.nb_tries += 1;
    }

    pub(crate) fn succeed_from_cache(&mut self, payload: Value) {
        let now = Instant::now();
        self.started_at.get_or_insert(now);
        self.response = Some(QueryResponse::from_payload(payload));
        self.error = None;
        self.was_cached = true;
        self.ended_at = Some(now);
    }

    pub(crate) fn set_cooldown_until(&mut self, until: Option<Instant>) {
        self.cooldown_until = until;
    }

    pub(crate) fn finish(&mut self) {
        self.ended_at = Some(Instant::now());
    }

    fn setting(&self, key: &str) -> Option<&str> {
        self.settings
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn render(&self, timeout_secs: Option<u32>) -> String {
        let settings: String = self
            .settings
            .iter()
            .map(|(k, v)| match timeout_secs {
                Some(secs) if k == "timeout" => format!("[{}:{}]", k, secs),
                _ => format!("[{}:{}]", k, v),
            })
            .collect();
        let code = setting_pattern().replace_all(&self.input_code, "");
        format!("{};\n{}", settings, code)
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.labels.is_empty() {
            write!(f, "query <no labels>")?;
        } else {
            let labels: Vec<String> = self
                .labels
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            write!(f, "query{{{}}}", labels.join(", "))?;
        }

        let total = self.run_duration().unwrap_or_default().as_secs_f64();

        match (&self.response, self.nb_tries) {
            (Some(response), _) if self.was_cached => {
                write!(f, " (cached, {:.2}mb)", response.size_mib())
            }
            (Some(response), 1) => {
                let request = self.request_duration().unwrap_or_default().as_secs_f64();
                write!(f, " ({:.2}mb in {:.1}s)", response.size_mib(), request)
            }
            (Some(response), _) => {
                let request = self.request_duration().unwrap_or_default().as_secs_f64();
                write!(
                    f,
                    " ({:.2}mb in {:.1}s ({:.1}s))",
                    response.size_mib(),
                    request,
                    total
                )
            }
            (None, 0) => write!(f, " (pending)"),
            (None, 1) => write!(f, " (failing after 1 try, {:.1}s)", total),
            (None, n) => write!(f, " (failing after {} tries, {:.1}s)", n, total),
        }
    }
}

fn put_setting(settings: &mut Vec<(String, String)>, key: &str, value: String) {
    match settings.iter_mut().find(|(k, _)| k == key) {
        Some((_, v)) => *v = value,
        None => settings.push((key.to_string(), value)),
    }
}

/// Matches one setting declaration, not the entire settings statement.
fn setting_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\[(\w+?):(.+?)\]\s*;?").expect("valid regex"))
}
