//! Test doubles shared by the unit tests.

use crate::auth::provider::{AuthProvider, ProviderSession, ProviderUser, SignUpData};
use crate::auth::token::TokenService;
use crate::clock::Clock;
use crate::config::Config;
use crate::error::AuthError;
use crate::http::client::ApiClient;
use crate::http::transport::{ApiRequest, ApiResponse, HttpTransport, Method, TransportError};
use crate::journal::Journal;
use crate::navigation::{Navigator, RedirectGuard};
use crate::redirect::RedirectLoopBreaker;
use crate::storage::{lock, MemoryStore};
use std::sync::Arc;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

/// Clock that only moves when told to
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self {
            now: Mutex::new(Utc.with_ymd_and_hms(2026, 7, 1, 12, 0, 0).unwrap()),
        }
    }
}

impl ManualClock {
    pub fn advance(&self, by: chrono::Duration) {
        *lock(&self.now) += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *lock(&self.now)
    }
}

/// A provider session for the standard test user, expiring `ttl_secs` from now
pub fn session_for(clock: &dyn Clock, token: &str, ttl_secs: i64) -> ProviderSession {
    ProviderSession {
        access_token: token.to_string(),
        refresh_token: Some("refresh-1".to_string()),
        expires_at: clock.unix() + ttl_secs,
        user: ProviderUser {
            id: "user-1".to_string(),
            email: Some("camper@example.com".to_string()),
            user_metadata: json!({ "full_name": "Casey Camper", "is_owner": false }),
        },
    }
}

/// Scriptable in-memory auth provider
pub struct MockProvider {
    clock: Arc<dyn Clock>,
    session: Mutex<Option<ProviderSession>>,
    refresh_tokens: Mutex<VecDeque<String>>,
    refresh_error: Mutex<Option<AuthError>>,
    refresh_delay: Mutex<Duration>,
    get_session_error: Mutex<Option<AuthError>>,
    sign_out_error: Mutex<Option<AuthError>>,
    pub refresh_calls: AtomicUsize,
    pub get_session_calls: AtomicUsize,
    pub sign_in_calls: AtomicUsize,
    pub sign_out_calls: AtomicUsize,
}

impl MockProvider {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            session: Mutex::new(None),
            refresh_tokens: Mutex::new(VecDeque::new()),
            refresh_error: Mutex::new(None),
            refresh_delay: Mutex::new(Duration::ZERO),
            get_session_error: Mutex::new(None),
            sign_out_error: Mutex::new(None),
            refresh_calls: AtomicUsize::new(0),
            get_session_calls: AtomicUsize::new(0),
            sign_in_calls: AtomicUsize::new(0),
            sign_out_calls: AtomicUsize::new(0),
        }
    }

    pub fn set_session(&self, session: Option<ProviderSession>) {
        *lock(&self.session) = session;
    }

    pub fn session(&self) -> Option<ProviderSession> {
        lock(&self.session).clone()
    }

    pub fn queue_refresh_token(&self, token: &str) {
        lock(&self.refresh_tokens).push_back(token.to_string());
    }

    pub fn fail_refresh_with(&self, error: AuthError) {
        *lock(&self.refresh_error) = Some(error);
    }

    pub fn set_refresh_delay(&self, delay: Duration) {
        *lock(&self.refresh_delay) = delay;
    }

    pub fn fail_get_session_with(&self, error: AuthError) {
        *lock(&self.get_session_error) = Some(error);
    }

    pub fn fail_sign_out_with(&self, error: AuthError) {
        *lock(&self.sign_out_error) = Some(error);
    }

    fn issue(&self, token: &str, email: &str, metadata: Value) -> ProviderSession {
        let mut session = session_for(self.clock.as_ref(), token, 3600);
        session.user.email = Some(email.to_string());
        session.user.user_metadata = metadata;
        self.set_session(Some(session.clone()));
        session
    }
}

impl AuthProvider for MockProvider {
    fn get_session(&self) -> Result<Option<ProviderSession>, AuthError> {
        self.get_session_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = lock(&self.get_session_error).clone() {
            return Err(e);
        }
        Ok(self.session())
    }

    fn sign_in(&self, email: &str, password: &str) -> Result<ProviderSession, AuthError> {
        self.sign_in_calls.fetch_add(1, Ordering::SeqCst);
        if password == "wrong-password" {
            return Err(AuthError::InvalidCredentials);
        }
        Ok(self.issue(
            "signin-token",
            email,
            json!({ "full_name": "Casey Camper", "is_owner": true }),
        ))
    }

    fn sign_up(
        &self,
        email: &str,
        _password: &str,
        data: &SignUpData,
    ) -> Result<ProviderSession, AuthError> {
        Ok(self.issue(
            "signup-token",
            email,
            json!({ "full_name": data.full_name, "is_owner": data.is_owner }),
        ))
    }

    fn sign_out(&self) -> Result<(), AuthError> {
        self.sign_out_calls.fetch_add(1, Ordering::SeqCst);
        self.set_session(None);
        match lock(&self.sign_out_error).clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn refresh_session(&self) -> Result<ProviderSession, AuthError> {
        let n = self.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = *lock(&self.refresh_delay);
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        if let Some(e) = lock(&self.refresh_error).clone() {
            return Err(e);
        }
        let Some(current) = self.session() else {
            return Err(AuthError::NoSession);
        };
        let token = lock(&self.refresh_tokens)
            .pop_front()
            .unwrap_or_else(|| format!("refreshed-{}", n));
        let mut session = session_for(self.clock.as_ref(), &token, 3600);
        session.user = current.user;
        self.set_session(Some(session.clone()));
        Ok(session)
    }
}

type Scripted = Result<ApiResponse, TransportError>;

/// Scriptable transport keyed by "METHOD /path"
#[derive(Default)]
pub struct MockTransport {
    queued: Mutex<HashMap<String, VecDeque<Scripted>>>,
    repeat: Mutex<HashMap<String, Scripted>>,
    requests: Mutex<Vec<ApiRequest>>,
    delay: Mutex<Duration>,
}

fn route_key(method: Method, path: &str) -> String {
    format!("{} {}", method, path)
}

/// Strip scheme and host from a full URL
fn url_path(url: &str) -> &str {
    let rest = url.split_once("://").map(|(_, r)| r).unwrap_or(url);
    match rest.find('/') {
        Some(i) => &rest[i..],
        None => "/",
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Respond once with `status`/`body`; queued responses are served in order
    pub fn push(&self, method: Method, path: &str, status: u16, body: Value) {
        lock(&self.queued)
            .entry(route_key(method, path))
            .or_default()
            .push_back(Ok(ApiResponse::new(status, &body.to_string())));
    }

    pub fn push_error(&self, method: Method, path: &str, error: TransportError) {
        lock(&self.queued)
            .entry(route_key(method, path))
            .or_default()
            .push_back(Err(error));
    }

    /// Respond with `status`/`body` whenever nothing is queued
    pub fn always(&self, method: Method, path: &str, status: u16, body: Value) {
        lock(&self.repeat).insert(
            route_key(method, path),
            Ok(ApiResponse::new(status, &body.to_string())),
        );
    }

    pub fn set_delay(&self, delay: Duration) {
        *lock(&self.delay) = delay;
    }

    pub fn requests(&self) -> Vec<ApiRequest> {
        lock(&self.requests).clone()
    }

    pub fn calls_to(&self, method: Method, path: &str) -> usize {
        lock(&self.requests)
            .iter()
            .filter(|r| r.method == method && r.path == path)
            .count()
    }
}

impl HttpTransport for MockTransport {
    fn send(&self, url: &str, request: &ApiRequest) -> Result<ApiResponse, TransportError> {
        let path = url_path(url).to_string();
        let mut recorded = request.clone();
        recorded.path = path.clone();
        lock(&self.requests).push(recorded);

        let delay = *lock(&self.delay);
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        let key = route_key(request.method, &path);
        if let Some(next) = lock(&self.queued).get_mut(&key).and_then(|q| q.pop_front()) {
            return next;
        }
        if let Some(resp) = lock(&self.repeat).get(&key) {
            return resp.clone();
        }
        Ok(ApiResponse::new(404, r#"{"message":"no route"}"#))
    }
}

/// A canned reply served by [`StubServer`]
#[derive(Debug, Clone)]
pub struct StubResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl StubResponse {
    pub fn json(status: u16, body: Value) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.to_string(),
        }
    }

    pub fn empty(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }
}

/// A request as it arrived at [`StubServer`]
#[derive(Debug, Clone)]
pub struct StubRequest {
    pub method: String,
    /// Path plus query string
    pub target: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl StubRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn json(&self) -> Value {
        serde_json::from_str(&self.body).unwrap_or(Value::Null)
    }
}

/// HTTP server on localhost answering one connection per canned response
pub struct StubServer {
    pub url: String,
    requests: Arc<Mutex<Vec<StubRequest>>>,
}

impl StubServer {
    pub fn start(responses: Vec<StubResponse>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let requests = Arc::new(Mutex::new(Vec::new()));
        let seen = requests.clone();
        thread::spawn(move || {
            for response in responses {
                let Ok((stream, _)) = listener.accept() else {
                    return;
                };
                if let Some(request) = read_request(&stream) {
                    lock(&seen).push(request);
                }
                let _ = write_response(stream, &response);
            }
        });
        Self { url, requests }
    }

    pub fn requests(&self) -> Vec<StubRequest> {
        lock(&self.requests).clone()
    }
}

fn read_request(stream: &TcpStream) -> Option<StubRequest> {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line).ok()?;
    let mut parts = line.split_whitespace();
    let method = parts.next()?.to_string();
    let target = parts.next()?.to_string();

    let mut headers = Vec::new();
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).ok()?;
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    let length = headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.parse::<usize>().ok())
        .unwrap_or(0);
    let mut body = vec![0; length];
    reader.read_exact(&mut body).ok()?;

    Some(StubRequest {
        method,
        target,
        headers,
        body: String::from_utf8_lossy(&body).into_owned(),
    })
}

fn write_response(mut stream: TcpStream, response: &StubResponse) -> std::io::Result<()> {
    let mut head = format!(
        "HTTP/1.1 {} Stub\r\nContent-Length: {}\r\nConnection: close\r\n",
        response.status,
        response.body.len()
    );
    if !response.body.is_empty() {
        head.push_str("Content-Type: application/json\r\n");
    }
    for (name, value) in &response.headers {
        head.push_str(&format!("{}: {}\r\n", name, value));
    }
    head.push_str("\r\n");
    stream.write_all(head.as_bytes())?;
    stream.write_all(response.body.as_bytes())?;
    stream.flush()
}

/// Navigator that remembers where it was sent
#[derive(Default)]
pub struct RecordingNavigator {
    pub routes: Mutex<Vec<String>>,
    pub external: Mutex<Vec<String>>,
}

impl RecordingNavigator {
    pub fn routes(&self) -> Vec<String> {
        lock(&self.routes).clone()
    }

    pub fn external(&self) -> Vec<String> {
        lock(&self.external).clone()
    }
}

impl Navigator for RecordingNavigator {
    fn navigate(&self, route: &str) {
        lock(&self.routes).push(route.to_string());
    }

    fn open_external(&self, url: &str) {
        lock(&self.external).push(url.to_string());
    }
}

/// Fully wired client stack over mocks
pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub store: Arc<MemoryStore>,
    pub provider: Arc<MockProvider>,
    pub transport: Arc<MockTransport>,
    pub navigator: Arc<RecordingNavigator>,
    pub journal: Arc<Journal>,
    pub tokens: Arc<TokenService>,
    pub api: Arc<ApiClient>,
}

/// Defaults with a fixed base URL and the throttle off
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.api.base_url = "http://api.test".to_string();
    config.auth.anon_key = Some("anon-key".to_string());
    config.throttle.enabled = false;
    config
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: Config) -> Self {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(MemoryStore::new());
        let session_store = Arc::new(MemoryStore::new());
        let provider = Arc::new(MockProvider::new(clock.clone()));
        let transport = Arc::new(MockTransport::new());
        let navigator = Arc::new(RecordingNavigator::default());
        let journal = Arc::new(Journal::disabled());
        let tokens = Arc::new(TokenService::new(
            provider.clone(),
            store.clone(),
            clock.clone(),
            journal.clone(),
            config.auth.refresh_margin_secs,
        ));
        let breaker = Arc::new(RedirectLoopBreaker::new(
            session_store,
            clock.clone(),
            config.redirect.clone(),
        ));
        let redirects = Arc::new(RedirectGuard::new(
            breaker,
            navigator.clone(),
            journal.clone(),
            &config.redirect.login_route,
        ));
        let api = Arc::new(ApiClient::new(
            &config,
            transport.clone(),
            tokens.clone(),
            redirects,
            store.clone(),
            clock.clone(),
            journal.clone(),
        ));
        Self {
            clock,
            store,
            provider,
            transport,
            navigator,
            journal,
            tokens,
            api,
        }
    }

    /// Install a provider session and adopt its token
    pub fn log_in(&self, token: &str) -> ProviderSession {
        let session = session_for(self.clock.as_ref(), token, 3600);
        self.provider.set_session(Some(session.clone()));
        self.tokens.adopt(&session);
        session
    }
}
