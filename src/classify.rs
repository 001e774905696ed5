//! Classify raw service responses into results or errors.
//!
//! The service reports failures in three places: the HTTP status, HTML error
//! pages, and a `remark` field in otherwise well-formed JSON. The checks run
//! from the most to the least specific source of detail.

use crate::error::QueryRejectCause;
use crate::rate_limit;
use crate::response::QueryResponse;
use crate::transport::RawResponse;
use crate::{Error, Result};
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

/// Turns a response to an interpreter call into a result or an error.
pub(crate) fn classify(response: RawResponse) -> Result<QueryResponse> {
    if looks_like_html(&response) {
        let messages = html_errors(&response.body);
        if !messages.is_empty() {
            return Err(classify_messages(messages, None));
        }
    }

    let data = match serde_json::from_str::<Value>(&response.body) {
        Ok(data) => data,
        Err(e) => {
            if response.status.is_success() {
                tracing::error!(
                    error = %e,
                    status = response.status.as_u16(),
                    "Failed to parse response body"
                );
            }
            return Err(response_error(response));
        }
    };

    let has_remark = data.get("remark").is_some_and(Value::is_string);
    if !has_remark && !response.status.is_success() {
        return Err(response_error(response));
    }

    let size_bytes = response.body.len();
    let result = QueryResponse::new(data, size_bytes, response.status, response.headers);

    // A remark takes precedence over the status.
    if let Some(remark) = result.remark() {
        let messages = vec![remark.to_string()];
        return Err(classify_messages(messages, Some(result)));
    }

    Ok(result)
}

/// Builds a [`Error::Response`] from a response we could not use.
pub(crate) fn response_error(response: RawResponse) -> Error {
    let status = response.status;

    if status.is_client_error() {
        tracing::error!(status = status.as_u16(), response = %response.body, "Client error (4xx)");
    } else if status.is_server_error() {
        tracing::warn!(status = status.as_u16(), response = %response.body, "Server error (5xx)");
    }

    Error::Response {
        status,
        retry_after: rate_limit::retry_after(&response.headers),
        headers: response.headers,
        body: response.body,
    }
}

fn classify_messages(messages: Vec<String>, partial: Option<QueryResponse>) -> Error {
    let partial = partial.map(Box::new);

    if messages.iter().any(|msg| is_language_error(msg)) {
        return Error::QueryLanguage { messages };
    }

    if let Some(cause) = messages.iter().find_map(|msg| match_reject_cause(msg)) {
        return Error::QueryReject {
            cause,
            messages,
            partial,
        };
    }

    Error::Query { messages, partial }
}

fn looks_like_html(response: &RawResponse) -> bool {
    match response.content_type() {
        Some(content_type) => content_type == "text/html",
        None => response.body.trim_start().starts_with('<'),
    }
}

/// Extracts the messages of an HTML error page.
fn html_errors(body: &str) -> Vec<String> {
    patterns()
        .html_error
        .captures_iter(body)
        .filter_map(|c| c.get(1))
        .map(|m| unescape_html(m.as_str().trim()))
        .collect()
}

fn is_language_error(message: &str) -> bool {
    message.contains("parse error:") || message.contains("static error:")
}

/// Checks whether an error message says the query was rejected or cancelled.
///
/// The service does not document its messages; matching this small set has
/// proven enough to identify the recoverable ones.
fn match_reject_cause(message: &str) -> Option<QueryRejectCause> {
    let patterns = patterns();

    if message.contains("Please check /api/status for the quota of your IP address")
        || message.contains("rate_limited")
    {
        return Some(QueryRejectCause::TooManyQueries);
    }

    if message.contains("The server is probably too busy to handle your request") {
        return Some(QueryRejectCause::TooBusy);
    }

    if message.contains("Query timed out") {
        let timed_out_after_secs = patterns
            .timed_out_after
            .captures(message)
            .and_then(|c| c.get(1)?.as_str().parse().ok());
        return Some(QueryRejectCause::ExceededTimeout {
            timed_out_after_secs,
        });
    }

    if message.contains("out of memory") {
        let oom_using_mib = patterns
            .oom_using
            .captures(message)
            .and_then(|c| c.get(1)?.as_str().parse().ok());
        return Some(QueryRejectCause::ExceededMaxsize { oom_using_mib });
    }

    None
}

fn unescape_html(text: &str) -> String {
    text.replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

struct Patterns {
    html_error: Regex,
    timed_out_after: Regex,
    oom_using: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        html_error: Regex::new(r"(?s)Error</strong>: (.+?)</p>").expect("valid regex"),
        timed_out_after: Regex::new(r"after (\d+) seconds").expect("valid regex"),
        oom_using: Regex::new(r"using about (\d+) MB").expect("valid regex"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;

    fn html(status: StatusCode, errors: &[&str]) -> RawResponse {
        let paragraphs: String = errors
            .iter()
            .map(|e| format!("<p><strong style=\"color:#FF0000\">Error</strong>: {} </p>\n", e))
            .collect();
        let body = format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<html><head><title>OSM3S Response</title></head>\n<body>\n<p>The data included in this document is from www.openstreetmap.org.</p>\n{}</body></html>",
            paragraphs
        );
        RawResponse::new(status, body)
            .with_header("content-type", "text/html; charset=utf-8")
            .unwrap()
    }

    fn json(status: StatusCode, remark: Option<&str>) -> RawResponse {
        let mut payload = serde_json::json!({
            "version": 0.6,
            "generator": "Overpass API 0.7.56.3 eb200aeb",
            "osm3s": { "timestamp_osm_base": "2020-07-10T02:51:02Z" },
            "elements": [{ "type": "node", "id": 1 }],
        });
        if let Some(remark) = remark {
            payload["remark"] = Value::from(remark);
        }
        RawResponse::new(status, payload.to_string())
            .with_header("content-type", "application/json")
            .unwrap()
    }

    #[test]
    fn test_success() {
        let result = classify(json(StatusCode::OK, None)).unwrap();
        assert_eq!(result.elements().map(|e| e.len()), Some(1));
        assert!(result.size_bytes > 0);
    }

    #[test]
    fn test_too_many_queries_page() {
        let err = classify(html(
            StatusCode::TOO_MANY_REQUESTS,
            &["runtime error: open64: 0 Success /osm3s_v0.7.54_osm_base Dispatcher_Client::request_read_and_idx::rate_limited. Please check /api/status for the quota of your IP address."],
        ))
        .unwrap_err();

        assert_eq!(err.reject_cause(), Some(QueryRejectCause::TooManyQueries));
        assert!(err.is_rate_limited());
        assert!(err.should_retry());
        assert_eq!(err.messages().len(), 1);
    }

    #[test]
    fn test_too_busy_page() {
        let err = classify(html(
            StatusCode::OK,
            &["runtime error: open64: 0 Success /osm3s_v0.7.54_osm_base Dispatcher_Client::request_read_and_idx::timeout. The server is probably too busy to handle your request."],
        ))
        .unwrap_err();

        assert_eq!(err.reject_cause(), Some(QueryRejectCause::TooBusy));
        assert!(err.should_retry());
    }

    #[test]
    fn test_syntax_errors() {
        let err = classify(html(
            StatusCode::BAD_REQUEST,
            &[
                "line 1: parse error: Key expected - &#39;%&#39; found.",
                "line 1: static error: For the attribute &quot;k&quot; of the element &quot;has-kv&quot; the only allowed values are non-empty strings.",
            ],
        ))
        .unwrap_err();

        assert!(matches!(err, Error::QueryLanguage { .. }));
        assert_eq!(
            err.messages(),
            &[
                "line 1: parse error: Key expected - '%' found.".to_string(),
                "line 1: static error: For the attribute \"k\" of the element \"has-kv\" the only allowed values are non-empty strings.".to_string(),
            ]
        );
        assert!(!err.should_retry());
    }

    #[test]
    fn test_other_runtime_error_page() {
        let err = classify(html(
            StatusCode::OK,
            &["runtime error: open64: 2 No such file or directory /osm3s_v0.7.54_osm_base Dispatcher_Client::1"],
        ))
        .unwrap_err();

        assert!(matches!(err, Error::Query { .. }));
        assert!(!err.should_retry());
    }

    #[test]
    fn test_exceeded_timeout_remark_keeps_partial() {
        let err = classify(json(
            StatusCode::OK,
            Some("runtime error: Query timed out in \"query\" at line 3 after 30 seconds."),
        ))
        .unwrap_err();

        assert_eq!(
            err.reject_cause(),
            Some(QueryRejectCause::ExceededTimeout {
                timed_out_after_secs: Some(30)
            })
        );
        assert!(err.is_exceeding_timeout());
        assert!(!err.should_retry());

        let partial = err.partial_response().unwrap();
        assert_eq!(partial.elements().map(|e| e.len()), Some(1));
    }

    #[test]
    fn test_remark_outranks_error_status() {
        let err = classify(json(
            StatusCode::GATEWAY_TIMEOUT,
            Some("runtime error: Query timed out in \"query\" at line 3 after 30 seconds."),
        ))
        .unwrap_err();

        assert!(err.is_exceeding_timeout());
        assert!(!err.should_retry());
        let partial = err.partial_response().unwrap();
        assert_eq!(partial.status, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(partial.elements().map(|e| e.len()), Some(1));
    }

    #[test]
    fn test_error_status_with_json_body() {
        let err = classify(json(StatusCode::SERVICE_UNAVAILABLE, None)).unwrap_err();
        assert_eq!(err.status(), Some(StatusCode::SERVICE_UNAVAILABLE));
        assert!(err.should_retry());
    }

    #[test]
    fn test_exceeded_maxsize_remark() {
        let err = classify(json(
            StatusCode::OK,
            Some("runtime error: Query run out of memory in \"recurse\" at line 1 using about 541 MB of RAM."),
        ))
        .unwrap_err();

        assert_eq!(
            err.reject_cause(),
            Some(QueryRejectCause::ExceededMaxsize {
                oom_using_mib: Some(541)
            })
        );
    }

    #[test]
    fn test_other_remark() {
        let err = classify(json(
            StatusCode::OK,
            Some("runtime error: Way 547230203 cannot be expanded at timestamp 2018-05-08T15:48:01Z."),
        ))
        .unwrap_err();

        assert!(matches!(err, Error::Query { .. }));
        assert!(err.partial_response().is_some());
    }

    #[test]
    fn test_status_without_body() {
        let err = classify(RawResponse::new(StatusCode::SERVICE_UNAVAILABLE, "")).unwrap_err();
        assert!(err.is_server_error());
        assert!(err.should_retry());

        let err = classify(
            RawResponse::new(StatusCode::TOO_MANY_REQUESTS, "slow down")
                .with_header("retry-after", "5")
                .unwrap(),
        )
        .unwrap_err();
        assert!(err.is_rate_limited());
        assert_eq!(err.retry_after(), Some(std::time::Duration::from_secs(5)));

        let err = classify(RawResponse::new(StatusCode::BAD_REQUEST, "no")).unwrap_err();
        assert_eq!(err.status(), Some(StatusCode::BAD_REQUEST));
        assert!(!err.should_retry());
    }

    #[test]
    fn test_unparseable_success() {
        let err = classify(RawResponse::new(StatusCode::OK, "{\"elements\": [")).unwrap_err();
        assert_eq!(err.status(), Some(StatusCode::OK));
        assert!(!err.should_retry());
    }

    #[test]
    fn test_html_without_errors_falls_back_to_status() {
        let response = RawResponse::new(StatusCode::GATEWAY_TIMEOUT, "<html>Gateway Timeout</html>");
        let err = classify(response).unwrap_err();
        assert_eq!(err.status(), Some(StatusCode::GATEWAY_TIMEOUT));
        assert!(err.should_retry());
    }
}
