//! Successful query results.
//!
//! The [`QueryResponse`] type wraps the parsed JSON payload along with the
//! HTTP details of the attempt that produced it, and offers accessors for the
//! metadata the service includes in every result.

use http::{HeaderMap, StatusCode};
use serde_json::Value;

/// The copyright notice included in result sets.
pub const COPYRIGHT: &str = "The data included in this document is from www.openstreetmap.org. \
     The data is made available under ODbL.";

/// A successful (or partially successful) query result.
///
/// # Examples
///
/// ```
/// use overpass_engine::QueryResponse;
/// use serde_json::json;
///
/// let response = QueryResponse::from_payload(json!({
///     "generator": "Overpass API 0.7.62.1 084b4234",
///     "osm3s": { "timestamp_osm_base": "2024-07-21T21:09:02Z" },
///     "elements": [{ "type": "node", "id": 1 }],
/// }));
///
/// assert_eq!(response.elements().map(|e| e.len()), Some(1));
/// assert_eq!(response.api_version(), Some("Overpass API 0.7.62.1 084b4234"));
/// assert_eq!(response.timestamp_osm(), Some("2024-07-21T21:09:02Z"));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResponse {
    /// The parsed JSON payload.
    pub data: Value,

    /// The size of the response body in bytes.
    pub size_bytes: usize,

    /// The HTTP status code of the response.
    pub status: StatusCode,

    /// The response headers.
    pub headers: HeaderMap,
}

impl QueryResponse {
    /// Creates a new `QueryResponse`.
    pub fn new(data: Value, size_bytes: usize, status: StatusCode, headers: HeaderMap) -> Self {
        Self {
            data,
            size_bytes,
            status,
            headers,
        }
    }

    /// Creates a response for a payload that did not come off the wire,
    /// such as one read back from a cache.
    pub fn from_payload(data: Value) -> Self {
        let size_bytes = data.to_string().len();
        Self::new(data, size_bytes, StatusCode::OK, HeaderMap::new())
    }

    /// The elements of the result set.
    ///
    /// This is open data, licensed under the Open Data Commons Open Database
    /// License (ODbL). See [`COPYRIGHT`].
    pub fn elements(&self) -> Option<&[Value]> {
        self.data
            .get("elements")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
    }

    /// A remark the service attached to the result, usually describing an error.
    pub fn remark(&self) -> Option<&str> {
        self.data.get("remark").and_then(Value::as_str)
    }

    /// The API version of the service that answered, f.e. `"Overpass API 0.7.56.8 7d656e78"`.
    pub fn api_version(&self) -> Option<&str> {
        self.data.get("generator").and_then(Value::as_str)
    }

    /// All edits uploaded before this date are included in the result.
    pub fn timestamp_osm(&self) -> Option<&str> {
        self.osm3s("timestamp_osm_base")
    }

    /// For queries that use area data, the date of the latest edit included
    /// in the most recent area generation.
    pub fn timestamp_areas(&self) -> Option<&str> {
        self.osm3s("timestamp_areas_base")
    }

    /// The copyright notice that came with the result.
    pub fn copyright(&self) -> &str {
        self.osm3s("copyright").unwrap_or(COPYRIGHT)
    }

    /// The size of the response body in mebibytes.
    pub fn size_mib(&self) -> f64 {
        self.size_bytes as f64 / 1024.0 / 1024.0
    }

    /// Returns a reference to a header value by name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)?.to_str().ok()
    }

    fn osm3s(&self, key: &str) -> Option<&str> {
        self.data.get("osm3s")?.get(key)?.as_str()
    }
}

impl AsRef<Value> for QueryResponse {
    fn as_ref(&self) -> &Value {
        &self.data
    }
}

impl std::ops::Deref for QueryResponse {
    type Target = Value;

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}
