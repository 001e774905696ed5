//! A scripted transport for tests that run on tokio's paused clock.

#![allow(dead_code)]

use async_trait::async_trait;
use http::StatusCode;
use overpass_engine::{Call, Endpoint, Error, RawResponse, Result, Transport};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

pub const UNLIMITED_STATUS: &str = "Connected as: 1807920285\n\
     Current time: 2020-07-10T14:56:19Z\n\
     Rate limit: 0\n\
     Currently running queries (pid, space limit, time limit, start time):\n";

/// Answers interpreter calls from a queue, and status calls with a fixed report.
pub struct ScriptedTransport {
    status: Option<String>,
    replies: Mutex<VecDeque<Result<RawResponse>>>,
    delay: Duration,
    status_delay: Duration,
    sent: Mutex<Vec<(Instant, String)>>,
    status_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self {
            status: Some(UNLIMITED_STATUS.to_string()),
            replies: Mutex::new(VecDeque::new()),
            delay: Duration::ZERO,
            status_delay: Duration::ZERO,
            sent: Mutex::new(Vec::new()),
            status_calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Answers status calls with this report. `None` answers with a 503.
    pub fn with_status(mut self, report: Option<&str>) -> Self {
        self.status = report.map(str::to_string);
        self
    }

    /// Delays every interpreter response.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Delays every status response.
    pub fn with_status_delay(mut self, delay: Duration) -> Self {
        self.status_delay = delay;
        self
    }

    /// Queues a response. Once the queue is empty, calls succeed.
    pub fn reply(self, response: RawResponse) -> Self {
        self.replies.lock().unwrap().push_back(Ok(response));
        self
    }

    /// Queues a transport failure.
    pub fn fail(self, error: Error) -> Self {
        self.replies.lock().unwrap().push_back(Err(error));
        self
    }

    pub fn nb_sent(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn send_times(&self) -> Vec<Instant> {
        self.sent.lock().unwrap().iter().map(|(t, _)| *t).collect()
    }

    pub fn sent_codes(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|(_, c)| c.clone()).collect()
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, call: Call) -> Result<RawResponse> {
        match call.endpoint {
            Endpoint::Status => {
                self.status_calls.fetch_add(1, Ordering::SeqCst);
                if !self.status_delay.is_zero() {
                    tokio::time::sleep(self.status_delay).await;
                }
                Ok(match &self.status {
                    Some(report) => RawResponse::new(StatusCode::OK, report.clone()),
                    None => RawResponse::new(StatusCode::SERVICE_UNAVAILABLE, ""),
                })
            }
            Endpoint::KillMyQueries => Ok(RawResponse::new(StatusCode::OK, "")),
            Endpoint::Interpreter => {
                let code = call.form_param("data").unwrap_or_default().to_string();
                self.sent.lock().unwrap().push((Instant::now(), code));

                let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);
                let _guard = InFlight(&self.in_flight);

                if !self.delay.is_zero() {
                    tokio::time::sleep(self.delay).await;
                }

                let reply = self.replies.lock().unwrap().pop_front();
                reply.unwrap_or_else(|| Ok(success()))
            }
        }
    }
}

pub fn json(status: StatusCode, payload: serde_json::Value) -> RawResponse {
    RawResponse::new(status, payload.to_string())
        .with_header("content-type", "application/json")
        .unwrap()
}

pub fn html_error(status: StatusCode, message: &str) -> RawResponse {
    let body = format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<html>\n<body>\n\
         <p>The data included in this document is from www.openstreetmap.org.</p>\n\
         <p><strong style=\"color:#FF0000\">Error</strong>: {} </p>\n\
         </body>\n</html>",
        message
    );
    RawResponse::new(status, body)
        .with_header("content-type", "text/html; charset=utf-8")
        .unwrap()
}

pub fn success() -> RawResponse {
    json(
        StatusCode::OK,
        serde_json::json!({
            "version": 0.6,
            "generator": "Overpass API 0.7.62.1 084b4234",
            "osm3s": { "timestamp_osm_base": "2024-07-21T21:09:02Z" },
            "elements": [{ "type": "node", "id": 1, "lat": 52.5, "lon": 13.4 }],
        }),
    )
}

pub fn status_error(status: StatusCode) -> RawResponse {
    RawResponse::new(status, "")
}

pub fn too_many_queries() -> RawResponse {
    html_error(
        StatusCode::TOO_MANY_REQUESTS,
        "runtime error: open64: 0 Success /osm3s_v0.7.54_osm_base Dispatcher_Client::request_read_and_idx::rate_limited. Please check /api/status for the quota of your IP address.",
    )
}

pub fn exceeded_timeout(after_secs: u32) -> RawResponse {
    json(
        StatusCode::OK,
        serde_json::json!({
            "generator": "Overpass API 0.7.62.1 084b4234",
            "osm3s": { "timestamp_osm_base": "2024-07-21T21:09:02Z" },
            "elements": [],
            "remark": format!(
                "runtime error: Query timed out in \"query\" at line 1 after {} seconds.",
                after_secs
            ),
        }),
    )
}

/// A status report without open slots, where the next one opens after `secs`.
pub fn cooldown_status(secs: u32) -> String {
    format!(
        "Connected as: 1807920285\n\
         Current time: 2020-11-21T12:45:45Z\n\
         Rate limit: 2\n\
         Slot available after: 2020-11-21T12:46:05Z, in {} seconds.\n\
         Slot available after: 2020-11-21T12:50:26Z, in {} seconds.\n\
         Currently running queries (pid, space limit, time limit, start time):\n",
        secs,
        secs + 100
    )
}
