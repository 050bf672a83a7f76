use crate::error::AuthError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// User record as the auth provider reports it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderUser {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    /// Free-form metadata set at sign-up (full_name, is_owner, ...)
    #[serde(default)]
    pub user_metadata: Value,
}

/// Session issued by the auth provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderSession {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Expiry as unix seconds
    pub expires_at: i64,
    pub user: ProviderUser,
}

/// Extra profile data sent along with a sign-up
#[derive(Debug, Clone, Serialize)]
pub struct SignUpData {
    pub full_name: String,
    pub is_owner: bool,
}

/// Trait for auth providers to allow mocking and abstraction
pub trait AuthProvider: Send + Sync {
    /// The provider's persisted session, if any
    fn get_session(&self) -> Result<Option<ProviderSession>, AuthError>;

    fn sign_in(&self, email: &str, password: &str) -> Result<ProviderSession, AuthError>;

    fn sign_up(&self, email: &str, password: &str, data: &SignUpData)
        -> Result<ProviderSession, AuthError>;

    /// Revoke the current session
    fn sign_out(&self) -> Result<(), AuthError>;

    /// Exchange the stored refresh token for a new session
    fn refresh_session(&self) -> Result<ProviderSession, AuthError>;
}
