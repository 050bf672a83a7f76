//! Error kinds surfaced by the HTTP layer and the auth provider.

use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;
use thiserror::Error;

/// Failure of a backend API call
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ApiError {
    /// No response was received
    #[error("Network error: {0}")]
    Network(String),

    /// 401 or 403
    #[error("Authentication failed ({status}): {message}")]
    Auth { status: u16, message: String },

    #[error("Not found: {path}")]
    NotFound { path: String },

    /// 429 from the backend
    #[error("Rate limited by server")]
    RateLimited { retry_after: Option<Duration> },

    /// 5xx
    #[error("Server error {status}: {message}")]
    Server { status: u16, message: String },

    /// Any other 4xx
    #[error("Request rejected {status}: {message}")]
    Client { status: u16, message: String },

    /// Rejected locally by the request throttle
    #[error("Too many requests for {key}, retry in {}ms", .wait.as_millis())]
    Throttled { key: String, wait: Duration },

    #[error("Invalid response body: {0}")]
    Decode(String),
}

impl ApiError {
    /// Map a non-success HTTP status to an error kind
    pub fn from_status(status: u16, path: &str, body: &str, retry_after: Option<Duration>) -> Self {
        let message = extract_message(body);
        match status {
            401 | 403 => ApiError::Auth { status, message },
            404 => ApiError::NotFound {
                path: path.to_string(),
            },
            429 => ApiError::RateLimited { retry_after },
            500..=599 => ApiError::Server { status, message },
            _ => ApiError::Client { status, message },
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, ApiError::Auth { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::NotFound { .. })
    }

    /// Message safe to show to an end user. Only server-supplied text is sanitized.
    pub fn user_message(&self) -> String {
        match self {
            ApiError::Network(_) => "Could not reach the server. Check your connection.".to_string(),
            ApiError::Auth { .. } => "Your session has expired. Please log in again.".to_string(),
            ApiError::NotFound { .. } => "The requested item could not be found.".to_string(),
            ApiError::RateLimited { .. } | ApiError::Throttled { .. } => {
                "Too many requests. Please wait a moment and try again.".to_string()
            }
            ApiError::Server { .. } => "The server ran into a problem. Try again later.".to_string(),
            ApiError::Client { message, .. } => sanitize_message(message),
            ApiError::Decode(_) => "The server sent an unexpected response.".to_string(),
        }
    }
}

/// Failure reported by the auth provider
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AuthError {
    #[error("Invalid email or password")]
    InvalidCredentials,

    #[error("No active session")]
    NoSession,

    #[error("Auth provider error {status}: {message}")]
    Provider { status: u16, message: String },

    #[error("Auth provider unreachable: {0}")]
    Network(String),

    #[error("Invalid auth provider response: {0}")]
    Decode(String),
}

impl AuthError {
    /// Message safe to show to an end user
    pub fn user_message(&self) -> String {
        match self {
            AuthError::Provider { message, .. } => {
                format!("Sign-in failed: {}", sanitize_message(message))
            }
            AuthError::Network(_) => "Could not reach the sign-in service.".to_string(),
            AuthError::Decode(_) => "The sign-in service sent an unexpected response.".to_string(),
            other => other.to_string(),
        }
    }
}

static BEARER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)bearer\s+[A-Za-z0-9\-._~+/]+=*").expect("valid regex"));
static JWT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"eyJ[A-Za-z0-9_\-]+\.[A-Za-z0-9_\-]+\.[A-Za-z0-9_\-]*").expect("valid regex")
});
static SECRET_PAIR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)"?(password|passwd|access_token|refresh_token|token|apikey|api_key|secret|authorization)"?\s*[:=]\s*"?[^\s",}]+"?"#,
    )
    .expect("valid regex")
});
static SENSITIVE_WORD_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(password|credentials?|access[_ ]token|refresh[_ ]token|jwt|api[_ ]?key|secret)\b")
        .expect("valid regex")
});

/// Strip credentials, tokens and secret-bearing terms from a message
pub fn sanitize_message(message: &str) -> String {
    let out = BEARER_RE.replace_all(message, "[redacted]");
    let out = JWT_RE.replace_all(&out, "[redacted]");
    let out = SECRET_PAIR_RE.replace_all(&out, "[redacted]");
    let out = SENSITIVE_WORD_RE.replace_all(&out, "[redacted]");
    out.trim().to_string()
}

/// Pull a human message out of a JSON error body, falling back to the raw text
fn extract_message(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        for field in ["message", "error_description", "error", "msg"] {
            if let Some(text) = value.get(field).and_then(|v| v.as_str()) {
                return text.to_string();
            }
        }
    }
    let trimmed = body.trim();
    if trimmed.len() > 200 {
        let cut = trimmed
            .char_indices()
            .nth(200)
            .map(|(i, _)| i)
            .unwrap_or(trimmed.len());
        format!("{}...", &trimmed[..cut])
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_status_kinds() {
        assert!(ApiError::from_status(401, "/api/x", "", None).is_auth());
        assert!(ApiError::from_status(403, "/api/x", "", None).is_auth());
        assert!(ApiError::from_status(404, "/api/x", "", None).is_not_found());
        assert_eq!(
            ApiError::from_status(429, "/api/x", "", Some(Duration::from_secs(2))),
            ApiError::RateLimited {
                retry_after: Some(Duration::from_secs(2))
            }
        );
        assert!(matches!(
            ApiError::from_status(502, "/api/x", "", None),
            ApiError::Server { status: 502, .. }
        ));
        assert!(matches!(
            ApiError::from_status(422, "/api/x", "", None),
            ApiError::Client { status: 422, .. }
        ));
    }

    #[test]
    fn test_extract_message_from_json() {
        let err = ApiError::from_status(400, "/api/bookings", r#"{"message":"Dates unavailable"}"#, None);
        assert_eq!(err.user_message(), "Dates unavailable");
    }

    #[test]
    fn test_sanitize_strips_bearer_and_jwt() {
        let msg = "failed with Bearer abc.def-123 and eyJhbGciOiJIUzI1NiJ9.eyJzdWIiOiIxIn0.sig";
        let clean = sanitize_message(msg);
        assert!(!clean.contains("abc.def-123"));
        assert!(!clean.contains("eyJ"));
        assert!(clean.contains("[redacted]"));
    }

    #[test]
    fn test_sanitize_strips_secret_pairs() {
        let clean = sanitize_message(r#"bad request {"password":"hunter22","email":"a@b.c"}"#);
        assert!(!clean.contains("hunter22"));
        assert!(clean.contains("a@b.c"));
    }

    #[test]
    fn test_sanitize_strips_sensitive_words() {
        let clean = sanitize_message("Invalid credentials supplied");
        assert_eq!(clean, "Invalid [redacted] supplied");
    }

    #[test]
    fn test_fixed_messages_are_not_redacted() {
        assert_eq!(
            AuthError::InvalidCredentials.user_message(),
            "Invalid email or password"
        );
        assert_eq!(AuthError::NoSession.user_message(), "No active session");
        assert_eq!(
            ApiError::Auth {
                status: 401,
                message: "jwt expired".to_string()
            }
            .user_message(),
            "Your session has expired. Please log in again."
        );
    }

    #[test]
    fn test_provider_message_is_sanitized() {
        let err = AuthError::Provider {
            status: 400,
            message: "bad refresh_token: abc123".to_string(),
        };
        let msg = err.user_message();
        assert!(msg.starts_with("Sign-in failed: "));
        assert!(!msg.contains("abc123"));
        assert!(!AuthError::Network("10.0.0.5 refused".to_string())
            .user_message()
            .contains("10.0.0.5"));
    }

    #[test]
    fn test_client_message_is_sanitized() {
        let err = ApiError::Client {
            status: 400,
            message: "refresh_token=xyz expired".to_string(),
        };
        assert!(!err.user_message().contains("xyz"));
    }
}
