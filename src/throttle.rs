//! Per-key request throttle.
//!
//! Each logical request key keeps the timestamps of its recent calls. A call is
//! rejected when it follows the previous one too closely, or when the sliding
//! window already holds the maximum number of calls. Allowlisted path
//! prefixes are never throttled.

use crate::clock::Clock;
use crate::config::ThrottleConfig;
use crate::http::transport::Method;
use crate::storage::lock;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Query parameters that only bust caches and never change the result
const INSIGNIFICANT_PARAMS: &[&str] = &["_", "t", "ts", "timestamp", "nocache", "cache_bust"];

/// Why a call was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    TooSoon { wait: Duration },
    WindowFull { wait: Duration },
}

impl Rejection {
    pub fn wait(&self) -> Duration {
        match self {
            Self::TooSoon { wait } | Self::WindowFull { wait } => *wait,
        }
    }
}

/// Derive the logical key for a request from method, path and significant params
pub fn request_key(method: Method, path: &str, params: &[(String, String)]) -> String {
    let path = path.split('?').next().unwrap_or(path).trim_end_matches('/');
    let mut significant: Vec<(&str, &str)> = params
        .iter()
        .filter(|(k, _)| !INSIGNIFICANT_PARAMS.contains(&k.as_str()))
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();
    if significant.is_empty() {
        return format!("{} {}", method, path);
    }
    significant.sort();

    let mut hasher = Sha256::new();
    for (k, v) in significant {
        hasher.update(k.as_bytes());
        hasher.update(b"=");
        hasher.update(v.as_bytes());
        hasher.update(b"&");
    }
    let digest = format!("{:x}", hasher.finalize());
    format!("{} {}#{}", method, path, &digest[..12])
}

pub struct RequestThrottle {
    config: ThrottleConfig,
    clock: Arc<dyn Clock>,
    registry: Mutex<HashMap<String, VecDeque<DateTime<Utc>>>>,
}

impl RequestThrottle {
    pub fn new(config: ThrottleConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            registry: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_allowlisted(&self, path: &str) -> bool {
        self.config.allow.iter().any(|prefix| path.starts_with(prefix))
    }

    /// Admit a call for `key` (recording it) or say how long to wait
    pub fn check(&self, key: &str, path: &str) -> Result<(), Rejection> {
        if !self.config.enabled || self.is_allowlisted(path) {
            return Ok(());
        }

        let now = self.clock.now();
        let window = chrono::Duration::milliseconds(self.config.window_ms as i64);
        let min_interval = chrono::Duration::milliseconds(self.config.min_interval_ms as i64);

        let mut registry = lock(&self.registry);
        let calls = registry.entry(key.to_string()).or_default();
        while calls.front().is_some_and(|t| now - *t >= window) {
            calls.pop_front();
        }

        if let Some(last) = calls.back() {
            let since = now - *last;
            if since < min_interval {
                return Err(Rejection::TooSoon {
                    wait: to_std(min_interval - since),
                });
            }
        }

        if calls.len() >= self.config.max_per_window {
            let oldest = calls.front().copied().unwrap_or(now);
            return Err(Rejection::WindowFull {
                wait: to_std(window - (now - oldest)),
            });
        }

        calls.push_back(now);
        Ok(())
    }

    /// Forget the history of one key
    pub fn clear(&self, key: &str) {
        lock(&self.registry).remove(key);
    }

    /// Number of calls currently counted for `key`
    pub fn recent_calls(&self, key: &str) -> usize {
        lock(&self.registry).get(key).map(|c| c.len()).unwrap_or(0)
    }
}

fn to_std(d: chrono::Duration) -> Duration {
    d.to_std().unwrap_or_default()
}
