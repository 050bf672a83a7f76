//! Session store: login state, the user's profile and derived flags.
//!
//! The token itself belongs to the token service. This store keeps the
//! profile next to it and always asks the token service whether a session
//! exists, so a session cleared by the HTTP layer is visible here at once.

use crate::auth::provider::{ProviderSession, ProviderUser, SignUpData};
use crate::auth::token::TokenService;
use crate::error::AuthError;
use crate::http::client::ApiClient;
use crate::journal::Journal;
use crate::navigation::Navigator;
use crate::storage::{self, lock, KeyValueStore, PROFILE_KEY};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

/// Landing route after logout
const LANDING_ROUTE: &str = "/";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default, alias = "fullName")]
    pub full_name: String,
    #[serde(default, alias = "isOwner")]
    pub is_owner: bool,
}

impl UserProfile {
    /// Minimal profile built from the provider's user metadata
    pub fn from_provider_user(user: &ProviderUser) -> Self {
        let meta = &user.user_metadata;
        let text = |keys: &[&str]| {
            keys.iter()
                .find_map(|k| meta.get(*k).and_then(Value::as_str))
                .map(str::to_string)
        };
        let full_name = text(&["full_name", "fullName", "name"])
            .or_else(|| {
                user.email
                    .as_deref()
                    .and_then(|e| e.split('@').next())
                    .map(str::to_string)
            })
            .unwrap_or_default();
        let is_owner = ["is_owner", "isOwner"]
            .iter()
            .find_map(|k| meta.get(*k).and_then(Value::as_bool))
            .unwrap_or(false);

        Self {
            id: user.id.clone(),
            email: user.email.clone(),
            full_name,
            is_owner,
        }
    }
}

/// Where a profile came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileSource {
    Backend,
    Cache,
    Metadata,
}

impl ProfileSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Backend => "backend",
            Self::Cache => "cache",
            Self::Metadata => "metadata",
        }
    }
}

pub struct SessionStore {
    tokens: Arc<TokenService>,
    api: Arc<ApiClient>,
    store: Arc<dyn KeyValueStore>,
    navigator: Arc<dyn Navigator>,
    journal: Arc<Journal>,
    profile: Mutex<Option<UserProfile>>,
    max_init_attempts: u32,
    init_attempts: AtomicU32,
    initialized: AtomicBool,
}

impl SessionStore {
    pub fn new(
        tokens: Arc<TokenService>,
        api: Arc<ApiClient>,
        store: Arc<dyn KeyValueStore>,
        navigator: Arc<dyn Navigator>,
        journal: Arc<Journal>,
        max_init_attempts: u32,
    ) -> Self {
        Self {
            tokens,
            api,
            store,
            navigator,
            journal,
            profile: Mutex::new(None),
            max_init_attempts,
            init_attempts: AtomicU32::new(0),
            initialized: AtomicBool::new(false),
        }
    }

    pub fn login(&self, email: &str, password: &str) -> Result<UserProfile, AuthError> {
        let session = self.tokens.provider().sign_in(email, password)?;
        Ok(self.establish(&session))
    }

    pub fn register(
        &self,
        email: &str,
        password: &str,
        full_name: &str,
        is_owner: bool,
    ) -> Result<UserProfile, AuthError> {
        let data = SignUpData {
            full_name: full_name.to_string(),
            is_owner,
        };
        let session = self.tokens.provider().sign_up(email, password, &data)?;
        self.tokens.adopt(&session);

        let body = json!({ "email": email, "full_name": full_name, "is_owner": is_owner });
        if let Err(e) = self.api.post_json::<_, Value>("/api/users/profile", &body) {
            tracing::warn!(error = %e, "backend profile creation failed");
        }
        Ok(self.establish(&session))
    }

    /// Adopt a fresh session, load its profile and start a clean redirect history
    fn establish(&self, session: &ProviderSession) -> UserProfile {
        self.tokens.adopt(session);
        self.api.redirects().breaker().reset();
        let (profile, source) = match self.fetch_backend_profile() {
            Some(p) => (p, ProfileSource::Backend),
            None => (
                UserProfile::from_provider_user(&session.user),
                ProfileSource::Metadata,
            ),
        };
        self.set_profile(Some(profile.clone()));
        self.initialized.store(true, Ordering::SeqCst);
        let _ = self.journal.login(&profile.id, source.as_str());
        tracing::info!(user_id = %profile.id, source = source.as_str(), "logged in");
        profile
    }

    fn fetch_backend_profile(&self) -> Option<UserProfile> {
        match self.api.get_json::<UserProfile>("/api/users/me") {
            Ok(profile) => Some(profile),
            Err(e) => {
                tracing::warn!(error = %e, "profile fetch failed, using provider metadata");
                None
            }
        }
    }

    pub fn get_auth_token(&self, force_refresh: bool) -> Result<Option<String>, AuthError> {
        self.tokens.get_valid_token(force_refresh)
    }

    /// Restore the session at startup. Repeated calls are no-ops once it
    /// succeeds, and attempts past the cap only serve the cached profile.
    pub fn init_auth(&self) -> Result<Option<UserProfile>, AuthError> {
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(self.current_profile());
        }
        let attempt = self.init_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt > self.max_init_attempts {
            tracing::warn!(attempt, cap = self.max_init_attempts, "init attempts exhausted");
            let _ = self.journal.init_auth(attempt, "capped");
            return Ok(self.current_profile());
        }

        let session = match self.tokens.provider().get_session() {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!(error = %e, attempt, "provider session unavailable");
                let _ = self.journal.init_auth(attempt, "fallback");
                return Ok(self.current_profile());
            }
        };

        let Some(session) = session else {
            self.tokens.clear();
            self.set_profile(None);
            self.initialized.store(true, Ordering::SeqCst);
            let _ = self.journal.init_auth(attempt, "anonymous");
            return Ok(None);
        };

        self.tokens.adopt(&session);
        let (profile, source) = match self.fetch_backend_profile() {
            Some(p) => (p, ProfileSource::Backend),
            None => match self.cached_profile().filter(|p| p.id == session.user.id) {
                Some(p) => (p, ProfileSource::Cache),
                None => (
                    UserProfile::from_provider_user(&session.user),
                    ProfileSource::Metadata,
                ),
            },
        };
        self.set_profile(Some(profile.clone()));
        self.initialized.store(true, Ordering::SeqCst);
        let _ = self.journal.init_auth(attempt, source.as_str());
        Ok(Some(profile))
    }

    /// Revoke the session and clear local state. Never fails.
    pub fn logout(&self) {
        let revoke_ok = match self.tokens.provider().sign_out() {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "provider sign-out failed");
                false
            }
        };
        self.tokens.clear();
        self.set_profile(None);
        self.initialized.store(false, Ordering::SeqCst);
        self.init_attempts.store(0, Ordering::SeqCst);
        let _ = self.journal.logout(revoke_ok);
        self.navigator.navigate(LANDING_ROUTE);
    }

    pub fn is_logged_in(&self) -> bool {
        self.tokens.has_token()
    }

    pub fn is_seller(&self) -> bool {
        self.current_profile().map(|p| p.is_owner).unwrap_or(false)
    }

    pub fn current_profile(&self) -> Option<UserProfile> {
        if !self.is_logged_in() {
            return None;
        }
        if let Some(profile) = lock(&self.profile).clone() {
            return Some(profile);
        }
        let cached = self.cached_profile();
        *lock(&self.profile) = cached.clone();
        cached
    }

    fn cached_profile(&self) -> Option<UserProfile> {
        storage::load_json(self.store.as_ref(), PROFILE_KEY)
    }

    fn set_profile(&self, profile: Option<UserProfile>) {
        let result = match &profile {
            Some(p) => storage::save_json(self.store.as_ref(), PROFILE_KEY, p),
            None => self.store.remove(PROFILE_KEY),
        };
        if let Err(e) = result {
            tracing::warn!(error = %e, "failed to persist profile");
        }
        *lock(&self.profile) = profile;
    }
}
