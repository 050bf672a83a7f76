//! Backend API client.
//!
//! Wraps a transport with the request and response interceptors: throttle,
//! default headers, bearer attachment for protected endpoints, one replay on a
//! network failure (idempotent methods only) or 401 (after a token refresh),
//! the legacy-path fallback, and session expiry with a guarded redirect to
//! login.

use super::interceptor::{EndpointClass, EndpointRules, RequestContext};
use super::transport::{ApiRequest, ApiResponse, HttpTransport};
use crate::auth::token::TokenService;
use crate::clock::Clock;
use crate::config::Config;
use crate::error::{ApiError, AuthError};
use crate::journal::Journal;
use crate::navigation::RedirectGuard;
use crate::storage::{KeyValueStore, PROFILE_KEY};
use crate::throttle::{request_key, RequestThrottle};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

/// Redirect source label used when the API rejects the session
const UNAUTHORIZED_SOURCE: &str = "api-401";

pub struct ApiClient {
    transport: Arc<dyn HttpTransport>,
    base_url: String,
    anon_key: Option<String>,
    legacy_fallback: bool,
    rules: EndpointRules,
    throttle: RequestThrottle,
    tokens: Arc<TokenService>,
    redirects: Arc<RedirectGuard>,
    store: Arc<dyn KeyValueStore>,
    journal: Arc<Journal>,
}

impl ApiClient {
    pub fn new(
        config: &Config,
        transport: Arc<dyn HttpTransport>,
        tokens: Arc<TokenService>,
        redirects: Arc<RedirectGuard>,
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        journal: Arc<Journal>,
    ) -> Self {
        Self {
            transport,
            base_url: config.api.base_url.trim_end_matches('/').to_string(),
            anon_key: config.auth.resolve_anon_key(),
            legacy_fallback: config.api.legacy_fallback,
            rules: EndpointRules::new(&config.api),
            throttle: RequestThrottle::new(config.throttle.clone(), clock),
            tokens,
            redirects,
            store,
            journal,
        }
    }

    pub fn tokens(&self) -> &Arc<TokenService> {
        &self.tokens
    }

    pub fn redirects(&self) -> &Arc<RedirectGuard> {
        &self.redirects
    }

    fn url_for(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Token for a protected request. No session is not an error here: the
    /// request goes out bare and the backend decides. An expired token the
    /// provider refuses to renew ends the session.
    fn bearer_for(&self, class: EndpointClass) -> Result<Option<String>, ApiError> {
        if class == EndpointClass::Public {
            return Ok(None);
        }
        match self.tokens.get_valid_token(false) {
            Ok(token) => Ok(token),
            Err(AuthError::Network(msg)) => Err(ApiError::Network(msg)),
            Err(e) => {
                tracing::warn!(error = %e, "expired token could not be renewed");
                self.expire_session();
                Err(ApiError::Auth {
                    status: 401,
                    message: e.to_string(),
                })
            }
        }
    }

    /// Drop every trace of the session and head for the login route
    fn expire_session(&self) {
        self.tokens.clear();
        if let Err(e) = self.store.remove(PROFILE_KEY) {
            tracing::warn!(error = %e, "failed to clear cached profile");
        }
        let _ = self.journal.session_cleared("unauthorized");
        self.redirects.redirect_to_login(UNAUTHORIZED_SOURCE);
    }

    /// Send a request through both interceptor phases
    pub fn send(&self, mut request: ApiRequest) -> Result<ApiResponse, ApiError> {
        let key = request_key(request.method, &request.path, &request.query);
        if let Err(rejection) = self.throttle.check(&key, &request.path) {
            let wait = rejection.wait();
            tracing::debug!(key = %key, wait_ms = wait.as_millis() as u64, "request throttled");
            let _ = self.journal.throttled(&key, wait.as_millis() as u64);
            return Err(ApiError::Throttled { key, wait });
        }

        let class = self.rules.classify(request.method, &request.path);
        let token = self.bearer_for(class)?;
        let mut ctx = RequestContext {
            class: self.rules.prepare(&mut request, token.as_deref()),
            retried: false,
            legacy_tried: false,
            request_id: uuid::Uuid::new_v4().to_string(),
        };
        request.set_header("X-Request-Id", &ctx.request_id);
        request.set_header("Accept", "application/json");
        if request.body.is_some() {
            request.set_header("Content-Type", "application/json");
        }
        if let Some(key) = &self.anon_key {
            request.set_header("apikey", key);
        }

        loop {
            tracing::debug!(
                method = %request.method,
                path = %request.path,
                request_id = %ctx.request_id,
                "api request"
            );
            let resp = match self.transport.send(&self.url_for(&request.path), &request) {
                Ok(resp) => resp,
                Err(e) if !ctx.retried && request.method.is_idempotent() => {
                    ctx.retried = true;
                    tracing::info!(path = %request.path, error = %e, "network failure, replaying once");
                    let _ = self
                        .journal
                        .request_retry(&ctx.request_id, &request.path, "network");
                    continue;
                }
                Err(e) => return Err(ApiError::Network(e.to_string())),
            };

            if resp.is_success() {
                return Ok(resp);
            }

            if resp.status == 401
                && ctx.is_protected()
                && !EndpointRules::is_auth_endpoint(&request.path)
            {
                if !ctx.retried {
                    ctx.retried = true;
                    match self.tokens.get_valid_token(true) {
                        Ok(Some(token)) => {
                            request.set_header("Authorization", &format!("Bearer {}", token));
                            let _ = self
                                .journal
                                .request_retry(&ctx.request_id, &request.path, "unauthorized");
                            continue;
                        }
                        Ok(None) => {}
                        Err(e) => tracing::warn!(error = %e, "refresh after 401 failed"),
                    }
                }
                self.expire_session();
                return Err(ApiError::from_status(
                    resp.status,
                    &request.path,
                    &resp.body,
                    resp.retry_after,
                ));
            }

            if resp.status == 404 && self.legacy_fallback && !ctx.legacy_tried {
                if let Some(legacy) = request.path.strip_prefix("/api").filter(|p| p.starts_with('/')) {
                    ctx.legacy_tried = true;
                    tracing::debug!(path = %request.path, legacy, "retrying on legacy path");
                    request.path = legacy.to_string();
                    continue;
                }
            }

            return Err(ApiError::from_status(
                resp.status,
                &request.path,
                &resp.body,
                resp.retry_after,
            ));
        }
    }

    pub fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        decode(&self.send(ApiRequest::get(path))?)
    }

    pub fn get_json_with_query<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(String, String)],
    ) -> Result<T, ApiError> {
        let mut request = ApiRequest::get(path);
        request.query = query.to_vec();
        decode(&self.send(request)?)
    }

    pub fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let body = serde_json::to_value(body).map_err(|e| ApiError::Decode(e.to_string()))?;
        decode(&self.send(ApiRequest::post(path, body))?)
    }
}

/// Parse a response body; an empty body reads as JSON `null`
pub fn decode<T: DeserializeOwned>(resp: &ApiResponse) -> Result<T, ApiError> {
    let body = if resp.body.trim().is_empty() {
        "null"
    } else {
        resp.body.as_str()
    };
    serde_json::from_str(body).map_err(|e| ApiError::Decode(e.to_string()))
}
