//! Endpoint classification for the request phase.
//!
//! A request is either public (a GET on the anonymous allowlist) or protected.
//! Protected requests carry the bearer token; public ones never do. Auth
//! endpoints get their own, shorter timeout.

use super::transport::{ApiRequest, Method};
use crate::config::ApiConfig;
use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;

/// GET paths the backend serves without authentication
const DEFAULT_PUBLIC_PATTERNS: &[&str] = &[
    r"^(/api)?/spots/?$",
    r"^(/api)?/spots/search/?$",
    r"^(/api)?/spots/[^/]+/?$",
    r"^(/api)?/spots/[^/]+/reviews/?$",
    r"^(/api)?/spots/[^/]+/availability/?$",
    r"^(/api)?/amenities/?$",
    r"^(/api)?/health/?$",
];

static AUTH_PATH_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(/api)?/auth(/|$)").expect("valid regex"));

/// How a request is treated by the interceptors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointClass {
    Public,
    Protected,
}

/// Per-request state carried through both interceptor phases
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub class: EndpointClass,
    /// Set once the single replay has been spent
    pub retried: bool,
    /// Set once the legacy-path fallback has been tried
    pub legacy_tried: bool,
    pub request_id: String,
}

impl RequestContext {
    pub fn is_protected(&self) -> bool {
        self.class == EndpointClass::Protected
    }
}

pub struct EndpointRules {
    public: Vec<Regex>,
    timeout: Duration,
    auth_timeout: Duration,
}

impl EndpointRules {
    /// Built-in public patterns plus the configured ones. Invalid extra
    /// patterns are skipped (config validation reports them).
    pub fn new(config: &ApiConfig) -> Self {
        let public = DEFAULT_PUBLIC_PATTERNS
            .iter()
            .map(|p| p.to_string())
            .chain(config.public_paths.iter().cloned())
            .filter_map(|p| match Regex::new(&p) {
                Ok(re) => Some(re),
                Err(e) => {
                    tracing::warn!(pattern = %p, error = %e, "ignoring invalid public path pattern");
                    None
                }
            })
            .collect();

        Self {
            public,
            timeout: config.timeout(),
            auth_timeout: config.auth_timeout(),
        }
    }

    /// Public means GET on an allowlisted path; everything else is protected
    pub fn classify(&self, method: Method, path: &str) -> EndpointClass {
        let path = path.split('?').next().unwrap_or(path);
        if method == Method::Get && self.public.iter().any(|re| re.is_match(path)) {
            EndpointClass::Public
        } else {
            EndpointClass::Protected
        }
    }

    pub fn is_auth_endpoint(path: &str) -> bool {
        AUTH_PATH_RE.is_match(path)
    }

    /// Timeout for `path` unless the request already set its own
    pub fn timeout_for(&self, path: &str) -> Duration {
        if Self::is_auth_endpoint(path) {
            self.auth_timeout
        } else {
            self.timeout
        }
    }

    /// Request phase: classify, strip or attach the bearer header, set the timeout
    pub fn prepare(&self, request: &mut ApiRequest, token: Option<&str>) -> EndpointClass {
        let class = self.classify(request.method, &request.path);
        request.remove_header("Authorization");
        if class == EndpointClass::Protected {
            if let Some(token) = token {
                request.set_header("Authorization", &format!("Bearer {}", token));
            }
        }
        if request.timeout.is_none() {
            request.timeout = Some(self.timeout_for(&request.path));
        }
        class
    }
}
