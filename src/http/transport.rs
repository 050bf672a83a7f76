//! Wire-level request/response types and the transport that sends them.

use serde_json::Value;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }

    /// Safe to send twice: a replay cannot create a second resource
    pub fn is_idempotent(&self) -> bool {
        matches!(self, Self::Get | Self::Put | Self::Delete)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request as the interceptors see it, relative to the API base URL
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
    pub timeout: Option<Duration>,
}

impl ApiRequest {
    pub fn new(method: Method, path: &str) -> Self {
        Self {
            method,
            path: path.to_string(),
            query: Vec::new(),
            headers: Vec::new(),
            body: None,
            timeout: None,
        }
    }

    pub fn get(path: &str) -> Self {
        Self::new(Method::Get, path)
    }

    pub fn post(path: &str, body: Value) -> Self {
        Self::new(Method::Post, path).with_body(body)
    }

    pub fn with_query(mut self, key: &str, value: &str) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Set a header, replacing any existing value (case-insensitive name)
    pub fn set_header(&mut self, name: &str, value: &str) {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value.to_string()));
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn remove_header(&mut self, name: &str) {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }
}

/// A received HTTP response, any status
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub body: String,
    pub retry_after: Option<Duration>,
}

impl ApiResponse {
    pub fn new(status: u16, body: &str) -> Self {
        Self {
            status,
            body: body.to_string(),
            retry_after: None,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// No response was received
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    Timeout,
    Connect(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "request timed out"),
            Self::Connect(msg) => write!(f, "{}", msg),
        }
    }
}

/// Trait for HTTP transports to allow mocking and abstraction
pub trait HttpTransport: Send + Sync {
    /// Send `request` to `url` (already joined with the base URL).
    /// Any HTTP status is an `Ok`; only a missing response is an `Err`.
    fn send(&self, url: &str, request: &ApiRequest) -> Result<ApiResponse, TransportError>;
}

pub struct UreqTransport {
    agent: ureq::Agent,
}

impl Default for UreqTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl UreqTransport {
    pub fn new() -> Self {
        Self {
            agent: ureq::AgentBuilder::new().build(),
        }
    }
}

impl HttpTransport for UreqTransport {
    fn send(&self, url: &str, request: &ApiRequest) -> Result<ApiResponse, TransportError> {
        let mut req = self.agent.request(request.method.as_str(), url);
        if let Some(timeout) = request.timeout {
            req = req.timeout(timeout);
        }
        for (key, value) in &request.query {
            req = req.query(key, value);
        }
        for (name, value) in &request.headers {
            req = req.set(name, value);
        }

        let resp = match &request.body {
            Some(body) => req.send_json(body.clone()),
            None => req.call(),
        };

        let resp = match resp {
            Ok(r) => r,
            Err(ureq::Error::Status(_, r)) => r,
            Err(ureq::Error::Transport(t)) => {
                let message = t.to_string();
                return Err(if message.to_lowercase().contains("timed out") {
                    TransportError::Timeout
                } else {
                    TransportError::Connect(message)
                });
            }
        };

        let status = resp.status();
        let retry_after = resp
            .header("retry-after")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = resp.into_string().unwrap_or_default();

        Ok(ApiResponse {
            status,
            body,
            retry_after,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{StubResponse, StubServer};
    use serde_json::json;
    use std::net::TcpListener;

    #[test]
    fn test_get_sends_query_and_headers() {
        let server = StubServer::start(vec![StubResponse::json(200, json!([{ "id": "a" }]))]);
        let mut request = ApiRequest::get("/api/spots").with_query("location", "Yosemite");
        request.set_header("X-Request-Id", "req-1");

        let resp = UreqTransport::new()
            .send(&format!("{}/api/spots", server.url), &request)
            .unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.retry_after, None);
        let body: serde_json::Value = serde_json::from_str(&resp.body).unwrap();
        assert_eq!(body[0]["id"], "a");

        let sent = &server.requests()[0];
        assert_eq!(sent.method, "GET");
        assert_eq!(sent.target, "/api/spots?location=Yosemite");
        assert_eq!(sent.header("X-Request-Id"), Some("req-1"));
    }

    #[test]
    fn test_post_sends_json_body() {
        let server = StubServer::start(vec![StubResponse::json(201, json!({ "id": "b-1" }))]);
        let request = ApiRequest::post("/api/bookings", json!({ "spot_id": "lakeside" }));

        let resp = UreqTransport::new()
            .send(&format!("{}/api/bookings", server.url), &request)
            .unwrap();
        assert_eq!(resp.status, 201);
        assert_eq!(server.requests()[0].json()["spot_id"], "lakeside");
    }

    #[test]
    fn test_error_status_is_a_response() {
        let server = StubServer::start(vec![StubResponse::json(
            429,
            json!({ "message": "slow down" }),
        )
        .with_header("Retry-After", "7")]);

        let resp = UreqTransport::new()
            .send(&format!("{}/api/spots", server.url), &ApiRequest::get("/api/spots"))
            .unwrap();
        assert_eq!(resp.status, 429);
        assert_eq!(resp.retry_after, Some(Duration::from_secs(7)));
        assert!(resp.body.contains("slow down"));
    }

    #[test]
    fn test_refused_connection_is_transport_error() {
        let addr = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
        let err = UreqTransport::new()
            .send(&format!("http://{}/api/spots", addr), &ApiRequest::get("/api/spots"))
            .unwrap_err();
        assert!(matches!(err, TransportError::Connect(_)));
    }

    #[test]
    fn test_idempotent_methods() {
        assert!(Method::Get.is_idempotent());
        assert!(Method::Delete.is_idempotent());
        assert!(!Method::Post.is_idempotent());
        assert!(!Method::Patch.is_idempotent());
    }
}
