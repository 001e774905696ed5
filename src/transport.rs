//! The HTTP seam between the client and the service.
//!
//! [`Transport`] is deliberately small: it sends one [`Call`] and hands back
//! the raw status, headers and body. Classifying that response is the
//! client's job. [`HttpTransport`] is the `reqwest`-backed implementation.

use crate::{Error, Result};
use async_trait::async_trait;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use url::Url;

/// The service endpoints, relative to the base URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// Accepts query programs.
    Interpreter,
    /// Reports the client's rate limit status.
    Status,
    /// Terminates all queries of the calling client.
    KillMyQueries,
}

impl Endpoint {
    /// The path of this endpoint relative to the base URL.
    pub fn path(&self) -> &'static str {
        match self {
            Endpoint::Interpreter => "interpreter",
            Endpoint::Status => "status",
            Endpoint::KillMyQueries => "kill_my_queries",
        }
    }
}

/// A single request to the service.
#[derive(Debug, Clone)]
pub struct Call {
    /// The HTTP method.
    pub method: Method,

    /// The endpoint to call.
    pub endpoint: Endpoint,

    /// Form-encoded body parameters.
    pub form: Vec<(String, String)>,

    /// Timeout for the whole request, including reading the body.
    pub timeout: Option<Duration>,

    /// Timeout for establishing the connection.
    pub connect_timeout: Option<Duration>,
}

impl Call {
    /// Creates a new `Call` with the given method and endpoint.
    pub fn new(method: Method, endpoint: Endpoint) -> Self {
        Self {
            method,
            endpoint,
            form: Vec::new(),
            timeout: None,
            connect_timeout: None,
        }
    }

    /// Adds a form parameter to the request body.
    pub fn with_form_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.form.push((key.into(), value.into()));
        self
    }

    /// Sets the request timeout.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Returns the value of a form parameter.
    pub fn form_param(&self, key: &str) -> Option<&str> {
        self.form
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// A response as received, before classification.
#[derive(Debug, Clone)]
pub struct RawResponse {
    /// The HTTP status code.
    pub status: StatusCode,

    /// The response headers.
    pub headers: HeaderMap,

    /// The response body.
    pub body: String,
}

impl RawResponse {
    /// Creates a new `RawResponse` without headers.
    pub fn new(status: StatusCode, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    /// Adds a header to the response.
    ///
    /// # Errors
    ///
    /// Returns an error if the header name or value is invalid.
    pub fn with_header(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Result<Self> {
        let name = HeaderName::try_from(name.as_ref())
            .map_err(|e| Error::Configuration(format!("Invalid header name: {}", e)))?;
        let value = HeaderValue::try_from(value.as_ref())
            .map_err(|e| Error::Configuration(format!("Invalid header value: {}", e)))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    /// The media type of the body, without parameters.
    pub fn content_type(&self) -> Option<&str> {
        let value = self.headers.get(http::header::CONTENT_TYPE)?.to_str().ok()?;
        value.split(';').next().map(str::trim)
    }
}

/// Sends calls to the service.
///
/// Implementations must map a request that ran out of time to
/// [`Error::CallTimeout`] and any other failure to receive a response to
/// [`Error::Client`]. Any response that did arrive, whatever its status, is
/// returned as `Ok`.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends one call and waits for the complete response.
    async fn send(&self, call: Call) -> Result<RawResponse>;
}

/// A [`Transport`] backed by `reqwest`.
///
/// Connection pooling happens per connect timeout: calls that share one reuse
/// the same underlying client.
pub struct HttpTransport {
    base_url: Url,
    user_agent: String,
    clients: Mutex<HashMap<Option<Duration>, reqwest::Client>>,
}

impl HttpTransport {
    /// Creates a transport for the given base URL.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built, f.e. because
    /// the user agent is not a valid header value.
    pub fn new(base_url: Url, user_agent: impl Into<String>) -> Result<Self> {
        let transport = Self {
            base_url,
            user_agent: user_agent.into(),
            clients: Mutex::new(HashMap::new()),
        };
        transport.http_client(None)?;
        Ok(transport)
    }

    /// The base URL all endpoints are resolved against.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn http_client(&self, connect_timeout: Option<Duration>) -> Result<reqwest::Client> {
        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(client) = clients.get(&connect_timeout) {
            return Ok(client.clone());
        }

        let mut builder = reqwest::Client::builder().user_agent(self.user_agent.as_str());
        if let Some(timeout) = connect_timeout {
            builder = builder.connect_timeout(timeout);
        }

        let client = builder.build().map_err(|e| {
            Error::Configuration(format!("Failed to build HTTP client: {}", e))
        })?;
        clients.insert(connect_timeout, client.clone());
        Ok(client)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, call: Call) -> Result<RawResponse> {
        let url = self.base_url.join(call.endpoint.path())?;

        tracing::debug!(
            method = %call.method,
            url = %url,
            "Executing HTTP request"
        );

        let mut request = self
            .http_client(call.connect_timeout)?
            .request(call.method.clone(), url);

        if !call.form.is_empty() {
            request = request.form(&call.form);
        }

        if let Some(timeout) = call.timeout {
            request = request.timeout(timeout);
        }

        let to_error = |e: reqwest::Error| {
            if e.is_timeout() {
                Error::CallTimeout {
                    after: call.timeout.unwrap_or_default(),
                }
            } else {
                Error::client(e)
            }
        };

        let response = request.send().await.map_err(to_error)?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.text().await.map_err(to_error)?;

        Ok(RawResponse {
            status,
            headers,
            body,
        })
    }
}
