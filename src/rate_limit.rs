//! Rate limit hints carried in response headers.
//!
//! The authoritative cooldown comes from the status endpoint, but a server
//! may also answer a throttled request with a `Retry-After` header. The
//! default query runner falls back to it when no status probe succeeded.

use http::HeaderMap;
use std::time::{Duration, SystemTime};

/// Parses the `Retry-After` header.
///
/// Supports both delay-seconds (integer) and HTTP-date formats. A date in
/// the past yields `None`.
///
/// # Examples
///
/// ```
/// use overpass_engine::rate_limit::retry_after;
/// use http::HeaderMap;
/// use std::time::Duration;
///
/// let mut headers = HeaderMap::new();
/// headers.insert("retry-after", "60".parse().unwrap());
///
/// assert_eq!(retry_after(&headers), Some(Duration::from_secs(60)));
/// ```
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let header = headers.get(http::header::RETRY_AFTER)?.to_str().ok()?;
    let header = header.trim();

    if let Ok(seconds) = header.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    // RFC 7231 date
    let date_time = httpdate::parse_http_date(header).ok()?;
    date_time.duration_since(SystemTime::now()).ok()
}
