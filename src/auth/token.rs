//! Token lifecycle service.
//!
//! The one place that knows where the bearer token lives. It mirrors the
//! token to persistent storage, decides when it must be refreshed, coalesces
//! concurrent refreshes, and reconciles a disagreeing mirror against the auth
//! provider's own session.

use super::provider::{AuthProvider, ProviderSession};
use crate::clock::Clock;
use crate::error::AuthError;
use crate::journal::Journal;
use crate::singleflight::SingleFlight;
use crate::storage::{self, lock, KeyValueStore, TOKEN_KEY};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

const REFRESH_KEY: &str = "token-refresh";

/// The authoritative bearer token and its expiry (unix seconds)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredToken {
    pub access_token: String,
    pub expires_at: i64,
}

impl StoredToken {
    /// Build from a raw JWT, reading expiry from its `exp` claim
    pub fn from_jwt(token: &str) -> Option<Self> {
        let expires_at = decode_jwt_expiry(token)?;
        Some(Self {
            access_token: token.to_string(),
            expires_at,
        })
    }
}

/// Read the `exp` claim of a JWT without verifying it
pub fn decode_jwt_expiry(token: &str) -> Option<i64> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    claims.get("exp").and_then(|v| v.as_i64())
}

pub struct TokenService {
    provider: Arc<dyn AuthProvider>,
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    journal: Arc<Journal>,
    margin_secs: i64,
    current: Mutex<Option<StoredToken>>,
    refresh_flight: SingleFlight<Result<StoredToken, AuthError>>,
}

impl TokenService {
    pub fn new(
        provider: Arc<dyn AuthProvider>,
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        journal: Arc<Journal>,
        margin_secs: i64,
    ) -> Self {
        Self {
            provider,
            store,
            clock,
            journal,
            margin_secs,
            current: Mutex::new(None),
            refresh_flight: SingleFlight::new(),
        }
    }

    pub fn provider(&self) -> &Arc<dyn AuthProvider> {
        &self.provider
    }

    /// True when `token` is expired or expires within the refresh margin
    pub fn should_refresh_token(&self, token: &StoredToken) -> bool {
        self.clock.unix() + self.margin_secs >= token.expires_at
    }

    fn is_expired(&self, token: &StoredToken) -> bool {
        self.clock.unix() >= token.expires_at
    }

    /// Whether any token is held, without contacting the provider
    pub fn has_token(&self) -> bool {
        lock(&self.current).is_some() || self.load_persisted().is_some()
    }

    /// Make `session` the authoritative token and mirror it
    pub fn adopt(&self, session: &ProviderSession) -> StoredToken {
        let expires_at = if session.expires_at > 0 {
            session.expires_at
        } else {
            decode_jwt_expiry(&session.access_token).unwrap_or(0)
        };
        let token = StoredToken {
            access_token: session.access_token.clone(),
            expires_at,
        };
        self.set_current(Some(token.clone()));
        token
    }

    /// Drop the token from memory and storage
    pub fn clear(&self) {
        self.set_current(None);
    }

    fn set_current(&self, token: Option<StoredToken>) {
        let result = match &token {
            Some(t) => storage::save_json(self.store.as_ref(), TOKEN_KEY, t),
            None => self.store.remove(TOKEN_KEY),
        };
        if let Err(e) = result {
            tracing::warn!(error = %e, "failed to mirror token to storage");
        }
        *lock(&self.current) = token;
    }

    /// Read the mirror; a bare JWT string from older clients is accepted too
    fn load_persisted(&self) -> Option<StoredToken> {
        let raw = self.store.get(TOKEN_KEY)?;
        if let Ok(token) = serde_json::from_str::<StoredToken>(&raw) {
            return Some(token);
        }
        StoredToken::from_jwt(raw.trim().trim_matches('"'))
    }

    /// The current token after reconciling memory with the mirror
    pub fn current(&self) -> Option<StoredToken> {
        let memory = lock(&self.current).clone();
        let persisted = self.load_persisted();

        match (memory, persisted) {
            (None, None) => None,
            (Some(m), Some(p)) if m == p => Some(m),
            // Fresh process: the mirror is the only copy
            (None, Some(p)) => {
                *lock(&self.current) = Some(p.clone());
                Some(p)
            }
            (_, persisted) => {
                tracing::info!("token mirror disagrees with memory, reconciling with provider");
                match self.provider.get_session() {
                    Ok(Some(session)) => Some(self.adopt(&session)),
                    Ok(None) => {
                        self.clear();
                        let _ = self.journal.session_cleared("provider has no session");
                        None
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "provider unavailable, trusting stored token");
                        *lock(&self.current) = persisted.clone();
                        persisted
                    }
                }
            }
        }
    }

    /// A token fit for use, refreshing first when forced or near expiry.
    /// `Ok(None)` means there is no session.
    pub fn get_valid_token(&self, force_refresh: bool) -> Result<Option<String>, AuthError> {
        let Some(token) = self.current() else {
            return Ok(None);
        };
        if !force_refresh && !self.should_refresh_token(&token) {
            return Ok(Some(token.access_token));
        }

        match self.refresh() {
            Ok(fresh) => Ok(Some(fresh.access_token)),
            Err(AuthError::NoSession) => {
                self.clear();
                let _ = self.journal.session_cleared("refresh impossible");
                Ok(None)
            }
            // Still inside its lifetime: usable even though the refresh failed
            Err(e) if !self.is_expired(&token) => {
                tracing::warn!(error = %e, "token refresh failed, using unexpired token");
                Ok(Some(token.access_token))
            }
            Err(e) => Err(e),
        }
    }

    /// Obtain a new token from the provider. Concurrent callers share one refresh.
    pub fn refresh(&self) -> Result<StoredToken, AuthError> {
        self.refresh_flight.run(REFRESH_KEY, || {
            let result = self.provider.refresh_session().map(|s| self.adopt(&s));
            let expires_at = result.as_ref().ok().map(|t| t.expires_at);
            let _ = self.journal.token_refresh(result.is_ok(), expires_at);
            match &result {
                Ok(_) => tracing::debug!("token refreshed"),
                Err(e) => tracing::warn!(error = %e, "token refresh failed"),
            }
            result
        })
    }
}
