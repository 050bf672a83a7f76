//! GoTrue-compatible auth provider over HTTP.
//!
//! The provider keeps its own session under `auth.provider_session`; the
//! token service reconciles against it when its mirror disagrees.

use super::provider::{AuthProvider, ProviderSession, ProviderUser, SignUpData};
use crate::clock::Clock;
use crate::error::AuthError;
use crate::storage::{self, KeyValueStore, PROVIDER_SESSION_KEY};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

/// Token endpoint response
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    expires_at: Option<i64>,
    user: ProviderUser,
}

impl TokenResponse {
    fn into_session(self, now: i64) -> ProviderSession {
        let expires_at = self
            .expires_at
            .or_else(|| self.expires_in.map(|secs| now + secs))
            .unwrap_or(now + 3600);
        ProviderSession {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at,
            user: self.user,
        }
    }
}

pub struct GoTrueProvider {
    base_url: String,
    anon_key: Option<String>,
    agent: ureq::Agent,
    timeout: Duration,
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
}

impl GoTrueProvider {
    pub fn new(
        base_url: &str,
        anon_key: Option<String>,
        timeout: Duration,
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            anon_key,
            agent: ureq::Agent::new(),
            timeout,
            store,
            clock,
        }
    }

    fn request(&self, path: &str, bearer: Option<&str>) -> ureq::Request {
        let url = format!("{}/auth/v1/{}", self.base_url, path);
        let mut req = self
            .agent
            .post(&url)
            .timeout(self.timeout)
            .set("Content-Type", "application/json");
        if let Some(key) = &self.anon_key {
            req = req.set("apikey", key);
        }
        if let Some(token) = bearer.or(self.anon_key.as_deref()) {
            req = req.set("Authorization", &format!("Bearer {}", token));
        }
        req
    }

    fn post_token(&self, path: &str, body: Value) -> Result<ProviderSession, AuthError> {
        match self.request(path, None).send_json(body) {
            Ok(r) => {
                let body: TokenResponse = r
                    .into_json()
                    .map_err(|e| AuthError::Decode(e.to_string()))?;
                let session = body.into_session(self.clock.unix());
                self.persist(Some(&session));
                Ok(session)
            }
            Err(ureq::Error::Status(code, resp)) => {
                let body = resp.into_string().unwrap_or_default();
                Err(map_status(code, &body))
            }
            Err(e) => Err(AuthError::Network(e.to_string())),
        }
    }

    fn stored(&self) -> Option<ProviderSession> {
        storage::load_json(self.store.as_ref(), PROVIDER_SESSION_KEY)
    }

    fn persist(&self, session: Option<&ProviderSession>) {
        let result = match session {
            Some(s) => storage::save_json(self.store.as_ref(), PROVIDER_SESSION_KEY, s),
            None => self.store.remove(PROVIDER_SESSION_KEY),
        };
        if let Err(e) = result {
            tracing::warn!(error = %e, "failed to persist provider session");
        }
    }
}

/// Error codes meaning the refresh token or its session no longer exists
const SESSION_GONE_CODES: &[&str] = &[
    "refresh_token_not_found",
    "refresh_token_already_used",
    "session_not_found",
    "session_expired",
];

/// Map a provider error status to an `AuthError`
fn map_status(code: u16, body: &str) -> AuthError {
    let parsed: Value = serde_json::from_str(body).unwrap_or(Value::Null);
    let error_code = parsed
        .get("error")
        .or_else(|| parsed.get("error_code"))
        .and_then(|v| v.as_str())
        .unwrap_or("");
    let message = parsed
        .get("error_description")
        .or_else(|| parsed.get("msg"))
        .or_else(|| parsed.get("message"))
        .and_then(|v| v.as_str())
        .unwrap_or(body)
        .to_string();

    if error_code == "invalid_grant" || error_code == "invalid_credentials" {
        return AuthError::InvalidCredentials;
    }
    if SESSION_GONE_CODES.contains(&error_code) {
        return AuthError::NoSession;
    }
    if code == 400 && message.to_lowercase().contains("invalid login") {
        return AuthError::InvalidCredentials;
    }
    AuthError::Provider {
        status: code,
        message,
    }
}

impl AuthProvider for GoTrueProvider {
    fn get_session(&self) -> Result<Option<ProviderSession>, AuthError> {
        let Some(session) = self.stored() else {
            return Ok(None);
        };
        if session.expires_at > self.clock.unix() {
            return Ok(Some(session));
        }
        // Expired: renew transparently when possible
        if session.refresh_token.is_some() {
            return self.refresh_session().map(Some);
        }
        self.persist(None);
        Ok(None)
    }

    fn sign_in(&self, email: &str, password: &str) -> Result<ProviderSession, AuthError> {
        self.post_token(
            "token?grant_type=password",
            json!({ "email": email, "password": password }),
        )
    }

    fn sign_up(
        &self,
        email: &str,
        password: &str,
        data: &SignUpData,
    ) -> Result<ProviderSession, AuthError> {
        self.post_token(
            "signup",
            json!({ "email": email, "password": password, "data": data }),
        )
    }

    fn sign_out(&self) -> Result<(), AuthError> {
        let session = self.stored();
        // Local session is dropped even if the revoke call fails
        self.persist(None);
        let Some(session) = session else {
            return Ok(());
        };

        match self
            .request("logout", Some(&session.access_token))
            .send_string("")
        {
            Ok(_) => Ok(()),
            Err(ureq::Error::Status(code, resp)) => {
                let body = resp.into_string().unwrap_or_default();
                Err(map_status(code, &body))
            }
            Err(e) => Err(AuthError::Network(e.to_string())),
        }
    }

    fn refresh_session(&self) -> Result<ProviderSession, AuthError> {
        let refresh_token = self
            .stored()
            .and_then(|s| s.refresh_token)
            .ok_or(AuthError::NoSession)?;
        let result = self.post_token(
            "token?grant_type=refresh_token",
            json!({ "refresh_token": refresh_token }),
        );
        if let Err(AuthError::InvalidCredentials | AuthError::NoSession) = &result {
            // Refresh token revoked or reused
            self.persist(None);
            return Err(AuthError::NoSession);
        }
        result
    }
}
