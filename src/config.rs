use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// A validation error in the configuration
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]: {}", self.field, self.message)
    }
}

/// Backend REST API settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_url")]
    pub base_url: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Timeout for auth endpoints (login, refresh, signup)
    #[serde(default = "default_auth_timeout_ms")]
    pub auth_timeout_ms: u64,
    /// Retry a 404 on `/api/...` against the legacy non-prefixed path
    #[serde(default = "default_true")]
    pub legacy_fallback: bool,
    /// Extra public GET path patterns (regex), added to the built-in list
    #[serde(default)]
    pub public_paths: Vec<String>,
}

fn default_api_url() -> String {
    "http://localhost:3000".to_string()
}
fn default_timeout_ms() -> u64 {
    15_000
}
fn default_auth_timeout_ms() -> u64 {
    8_000
}
fn default_true() -> bool {
    true
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_api_url(),
            timeout_ms: default_timeout_ms(),
            auth_timeout_ms: default_auth_timeout_ms(),
            legacy_fallback: default_true(),
            public_paths: Vec::new(),
        }
    }
}

impl ApiConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.auth_timeout_ms)
    }
}

/// Auth provider settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthConfig {
    #[serde(default = "default_auth_url")]
    pub url: String,
    #[serde(default)]
    pub anon_key: Option<String>,
    #[serde(default = "default_anon_key_env")]
    pub anon_key_env: Option<String>,
    /// Tokens expiring within this many seconds are refreshed before use
    #[serde(default = "default_refresh_margin")]
    pub refresh_margin_secs: i64,
    #[serde(default = "default_max_init_attempts")]
    pub max_init_attempts: u32,
}

fn default_auth_url() -> String {
    "http://localhost:54321".to_string()
}
fn default_anon_key_env() -> Option<String> {
    Some("CAMPSITE_ANON_KEY".to_string())
}
fn default_refresh_margin() -> i64 {
    60
}
fn default_max_init_attempts() -> u32 {
    3
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            url: default_auth_url(),
            anon_key: None,
            anon_key_env: default_anon_key_env(),
            refresh_margin_secs: default_refresh_margin(),
            max_init_attempts: default_max_init_attempts(),
        }
    }
}

impl AuthConfig {
    /// Resolve the provider's public key from config or environment
    pub fn resolve_anon_key(&self) -> Option<String> {
        if let Some(key) = &self.anon_key {
            return Some(key.clone());
        }
        self.anon_key_env
            .as_ref()
            .and_then(|var| std::env::var(var).ok())
    }
}

/// Redirect-loop breaker thresholds
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RedirectConfig {
    #[serde(default = "default_short_window_ms")]
    pub short_window_ms: u64,
    #[serde(default = "default_short_limit")]
    pub short_limit: u32,
    #[serde(default = "default_long_window_ms")]
    pub long_window_ms: u64,
    #[serde(default = "default_long_limit")]
    pub long_limit: u32,
    #[serde(default = "default_login_route")]
    pub login_route: String,
}

fn default_short_window_ms() -> u64 {
    5_000
}
fn default_short_limit() -> u32 {
    2
}
fn default_long_window_ms() -> u64 {
    30_000
}
fn default_long_limit() -> u32 {
    5
}
fn default_login_route() -> String {
    "/login".to_string()
}

impl Default for RedirectConfig {
    fn default() -> Self {
        Self {
            short_window_ms: default_short_window_ms(),
            short_limit: default_short_limit(),
            long_window_ms: default_long_window_ms(),
            long_limit: default_long_limit(),
            login_route: default_login_route(),
        }
    }
}

/// Per-key request throttle
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ThrottleConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
    #[serde(default = "default_throttle_window_ms")]
    pub window_ms: u64,
    #[serde(default = "default_max_per_window")]
    pub max_per_window: usize,
    /// Path prefixes that bypass throttling
    #[serde(default = "default_throttle_allow")]
    pub allow: Vec<String>,
}

fn default_min_interval_ms() -> u64 {
    250
}
fn default_throttle_window_ms() -> u64 {
    10_000
}
fn default_max_per_window() -> usize {
    8
}
fn default_throttle_allow() -> Vec<String> {
    vec!["/auth/".to_string(), "/api/auth/".to_string(), "/health".to_string()]
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            min_interval_ms: default_min_interval_ms(),
            window_ms: default_throttle_window_ms(),
            max_per_window: default_max_per_window(),
            allow: default_throttle_allow(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DashboardConfig {
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
}

fn default_ttl_secs() -> u64 {
    300
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BookingConfig {
    #[serde(default = "default_service_fee_rate")]
    pub service_fee_rate: f64,
}

fn default_service_fee_rate() -> f64 {
    0.10
}

impl Default for BookingConfig {
    fn default() -> Self {
        Self {
            service_fee_rate: default_service_fee_rate(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct StorageConfig {
    /// Directory for storage.json, session.json and the journal
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

impl StorageConfig {
    /// Resolve the storage directory (~/.campsite by default)
    pub fn resolve_dir(&self) -> PathBuf {
        if let Some(dir) = &self.dir {
            return dir.clone();
        }
        dirs::home_dir()
            .map(|home| home.join(".campsite"))
            .unwrap_or_else(|| PathBuf::from(".campsite"))
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub redirect: RedirectConfig,
    #[serde(default)]
    pub throttle: ThrottleConfig,
    #[serde(default)]
    pub dashboard: DashboardConfig,
    #[serde(default)]
    pub booking: BookingConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Keys whose arrays accumulate across layers instead of being replaced
const ACCUMULATED_KEYS: &[&str] = &["api.public_paths"];

/// Overlay `layer` onto `base` field by field. Nested tables merge, arrays
/// listed in `ACCUMULATED_KEYS` are appended, everything else is replaced.
fn merge_tables(base: &mut toml::Table, layer: toml::Table, path: &str) {
    for (key, incoming) in layer {
        let key_path = if path.is_empty() {
            key.clone()
        } else {
            format!("{}.{}", path, key)
        };
        match base.get_mut(&key) {
            Some(existing) => merge_value(existing, incoming, &key_path),
            None => {
                base.insert(key, incoming);
            }
        }
    }
}

fn merge_value(existing: &mut toml::Value, incoming: toml::Value, path: &str) {
    match (existing, incoming) {
        (toml::Value::Table(base), toml::Value::Table(layer)) => merge_tables(base, layer, path),
        (toml::Value::Array(base), toml::Value::Array(layer)) if ACCUMULATED_KEYS.contains(&path) => {
            base.extend(layer)
        }
        (existing, incoming) => *existing = incoming,
    }
}

impl Config {
    /// Load configuration from default paths
    /// Priority: local (.campsite/config.local.toml) > project (.campsite/config.toml) > user (~/.campsite/config.toml)
    pub fn load() -> Result<Self> {
        let mut layers = Vec::new();
        if let Some(home) = dirs::home_dir() {
            layers.push(home.join(".campsite").join("config.toml"));
        }
        layers.push(Path::new(".campsite").join("config.toml"));
        // Local config overrides project-level and should be gitignored
        layers.push(Path::new(".campsite").join("config.local.toml"));

        let mut merged = toml::Table::new();
        for path in layers.iter().filter(|p| p.exists()) {
            merge_tables(&mut merged, Self::load_layer(path)?, "");
        }
        Self::from_table(merged)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        Self::from_table(Self::load_layer(path)?)
    }

    fn load_layer(path: &Path) -> Result<toml::Table> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    fn from_table(table: toml::Table) -> Result<Self> {
        Ok(toml::Value::Table(table).try_into()?)
    }

    /// Apply command-line / environment overrides
    pub fn apply_overrides(
        &mut self,
        api_url: Option<&str>,
        auth_url: Option<&str>,
        anon_key: Option<&str>,
    ) {
        if let Some(url) = api_url {
            self.api.base_url = url.to_string();
        }
        if let Some(url) = auth_url {
            self.auth.url = url.to_string();
        }
        if let Some(key) = anon_key {
            self.auth.anon_key = Some(key.to_string());
        }
    }

    /// Validate configuration and return any errors found
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        for (field, url) in [("api.base_url", &self.api.base_url), ("auth.url", &self.auth.url)] {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                errors.push(ValidationError {
                    field: field.to_string(),
                    message: format!("Expected an http(s) URL, got '{}'", url),
                });
            }
        }

        if self.api.timeout_ms == 0 || self.api.auth_timeout_ms == 0 {
            errors.push(ValidationError {
                field: "api.timeout_ms".to_string(),
                message: "Timeouts must be greater than 0".to_string(),
            });
        }

        for (i, pattern) in self.api.public_paths.iter().enumerate() {
            if regex::Regex::new(pattern).is_err() {
                errors.push(ValidationError {
                    field: format!("api.public_paths[{}]", i),
                    message: format!("Invalid regex pattern '{}'", pattern),
                });
            }
        }

        if self.auth.max_init_attempts == 0 {
            errors.push(ValidationError {
                field: "auth.max_init_attempts".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        let r = &self.redirect;
        if r.short_window_ms == 0 || r.long_window_ms == 0 {
            errors.push(ValidationError {
                field: "redirect".to_string(),
                message: "Windows must be greater than 0".to_string(),
            });
        }
        if r.short_limit == 0 || r.long_limit == 0 {
            errors.push(ValidationError {
                field: "redirect".to_string(),
                message: "Limits must be greater than 0".to_string(),
            });
        }
        if r.short_window_ms > r.long_window_ms {
            errors.push(ValidationError {
                field: "redirect.short_window_ms".to_string(),
                message: "Short window must not exceed the long window".to_string(),
            });
        }

        if self.throttle.enabled && (self.throttle.window_ms == 0 || self.throttle.max_per_window == 0) {
            errors.push(ValidationError {
                field: "throttle".to_string(),
                message: "window_ms and max_per_window must be greater than 0".to_string(),
            });
        }

        if !(0.0..=1.0).contains(&self.booking.service_fee_rate) {
            errors.push(ValidationError {
                field: "booking.service_fee_rate".to_string(),
                message: format!(
                    "Must be between 0.0 and 1.0, got {}",
                    self.booking.service_fee_rate
                ),
            });
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_validate_default_config() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_validate_bad_url() {
        let mut config = Config::default();
        config.api.base_url = "localhost:3000".to_string();
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].field.contains("api.base_url"));
    }

    #[test]
    fn test_validate_invalid_public_path() {
        let mut config = Config::default();
        config.api.public_paths.push("[unclosed".to_string());
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("Invalid regex"));
    }

    #[test]
    fn test_validate_fee_rate() {
        let mut config = Config::default();
        config.booking.service_fee_rate = 1.5;
        let errors = config.validate().unwrap_err();
        assert!(errors[0].message.contains("between 0.0 and 1.0"));
    }

    #[test]
    fn test_validate_redirect_windows() {
        let mut config = Config::default();
        config.redirect.short_window_ms = 60_000;
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].field.contains("short_window_ms"));
    }

    #[test]
    fn test_load_partial_layer_keeps_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[api]
base_url = "https://api.campsite.test"

[dashboard]
ttl_secs = 60
"#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.api.base_url, "https://api.campsite.test");
        assert_eq!(config.api.timeout_ms, 15_000);
        assert_eq!(config.dashboard.ttl_secs, 60);
        assert_eq!(config.redirect.short_limit, 2);
    }

    fn layered(layers: &[&str]) -> Config {
        let mut merged = toml::Table::new();
        for layer in layers {
            merge_tables(&mut merged, toml::from_str(layer).unwrap(), "");
        }
        Config::from_table(merged).unwrap()
    }

    #[test]
    fn test_merge_accumulates_public_paths() {
        let config = layered(&[
            "[api]\npublic_paths = [\"^/api/a$\"]",
            "[api]\npublic_paths = [\"^/api/b$\"]",
        ]);
        assert_eq!(config.api.public_paths, vec!["^/api/a$", "^/api/b$"]);
    }

    #[test]
    fn test_layers_merge_per_field() {
        let config = layered(&[
            "[api]\ntimeout_ms = 30000\n[throttle]\nallow = [\"/a\"]\n[auth]\nmax_init_attempts = 5",
            "[api]\nbase_url = \"https://api.campsite.test\"\n[throttle]\nallow = [\"/b\"]",
        ]);
        assert_eq!(config.api.base_url, "https://api.campsite.test");
        assert_eq!(config.api.timeout_ms, 30_000);
        assert_eq!(config.throttle.allow, vec!["/b"]);
        assert_eq!(config.auth.max_init_attempts, 5);
        assert_eq!(config.auth.anon_key_env.as_deref(), Some("CAMPSITE_ANON_KEY"));
    }

    #[test]
    fn test_empty_layers_are_defaults() {
        let config = layered(&[]);
        assert_eq!(config.api.base_url, "http://localhost:3000");
        assert!(config.throttle.enabled);
    }

    #[test]
    fn test_apply_overrides() {
        let mut config = Config::default();
        config.apply_overrides(Some("https://api.x"), None, Some("anon"));
        assert_eq!(config.api.base_url, "https://api.x");
        assert_eq!(config.auth.url, "http://localhost:54321");
        assert_eq!(config.auth.resolve_anon_key().as_deref(), Some("anon"));
    }
}
