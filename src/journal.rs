use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::storage::lock;

/// Append-only JSONL record of session lifecycle events
pub struct Journal {
    pub path: Option<PathBuf>,
    session_id: String,
    file: Mutex<Option<File>>,
}

#[derive(Serialize)]
struct Event<'a> {
    ts: DateTime<Utc>,
    session_id: &'a str,
    #[serde(rename = "type")]
    event_type: &'a str,
    #[serde(flatten)]
    data: serde_json::Value,
}

impl Journal {
    pub fn new(path: &Path, session_id: &str) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Self {
            path: Some(path.to_path_buf()),
            session_id: session_id.to_string(),
            file: Mutex::new(Some(file)),
        })
    }

    /// A journal that drops every event
    pub fn disabled() -> Self {
        Self {
            path: None,
            session_id: String::new(),
            file: Mutex::new(None),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn log(&self, event_type: &str, data: serde_json::Value) -> Result<()> {
        let mut file = lock(&self.file);
        let Some(file) = file.as_mut() else {
            return Ok(());
        };
        let event = Event {
            ts: Utc::now(),
            session_id: &self.session_id,
            event_type,
            data,
        };
        let line = serde_json::to_string(&event)?;
        writeln!(file, "{}", line)?;
        file.flush()?;
        Ok(())
    }

    pub fn login(&self, user_id: &str, profile_source: &str) -> Result<()> {
        self.log(
            "login",
            serde_json::json!({ "user_id": user_id, "profile_source": profile_source }),
        )
    }

    pub fn logout(&self, revoke_ok: bool) -> Result<()> {
        self.log("logout", serde_json::json!({ "revoke_ok": revoke_ok }))
    }

    pub fn init_auth(&self, attempt: u32, outcome: &str) -> Result<()> {
        self.log(
            "init_auth",
            serde_json::json!({ "attempt": attempt, "outcome": outcome }),
        )
    }

    pub fn token_refresh(&self, ok: bool, expires_at: Option<i64>) -> Result<()> {
        self.log(
            "token_refresh",
            serde_json::json!({ "ok": ok, "expires_at": expires_at }),
        )
    }

    pub fn session_cleared(&self, reason: &str) -> Result<()> {
        self.log("session_cleared", serde_json::json!({ "reason": reason }))
    }

    /// Log a replayed request
    pub fn request_retry(&self, request_id: &str, path: &str, reason: &str) -> Result<()> {
        self.log(
            "request_retry",
            serde_json::json!({
                "request_id": request_id,
                "path": path,
                "reason": reason,
            }),
        )
    }

    pub fn redirect(&self, source: &str, route: &str, broken: bool) -> Result<()> {
        self.log(
            if broken { "redirect_break" } else { "redirect" },
            serde_json::json!({ "source": source, "route": route }),
        )
    }

    pub fn throttled(&self, key: &str, wait_ms: u64) -> Result<()> {
        self.log(
            "throttled",
            serde_json::json!({ "key": key, "wait_ms": wait_ms }),
        )
    }

    /// Log serving stale data after a failed refresh
    pub fn cache_fallback(&self, cache: &str, age_secs: i64, error: &str) -> Result<()> {
        self.log(
            "cache_fallback",
            serde_json::json!({
                "cache": cache,
                "age_secs": age_secs,
                "error": error,
            }),
        )
    }
}
