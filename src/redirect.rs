//! Redirect-loop breaker.
//!
//! Every redirect to the login view is recorded against a source label. Two
//! sliding counters per source (a short and a long window) decide whether the
//! redirect may proceed. Counters live in session-scoped storage so they
//! survive the reload a redirect usually causes.

use crate::clock::Clock;
use crate::config::RedirectConfig;
use crate::storage::{self, KeyValueStore, LOOP_BROKEN_KEY, REDIRECT_COUNTERS_KEY};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Query marker that signals a loop was broken and counters should be reset
pub const LOOP_BROKEN_MARKER: &str = "loop_broken=1";

/// Outcome of recording a redirect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Proceed,
    /// Terminal: the caller must not navigate
    Break,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
struct Window {
    started_ms: i64,
    count: u32,
}

impl Window {
    fn bump(&mut self, now_ms: i64, length_ms: i64) -> u32 {
        if self.count == 0 || now_ms - self.started_ms >= length_ms {
            self.started_ms = now_ms;
            self.count = 0;
        }
        self.count += 1;
        self.count
    }

    fn current(&self, now_ms: i64, length_ms: i64) -> u32 {
        if now_ms - self.started_ms >= length_ms {
            0
        } else {
            self.count
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct SourceCounters {
    short: Window,
    long: Window,
}

pub struct RedirectLoopBreaker {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    config: RedirectConfig,
}

impl RedirectLoopBreaker {
    pub fn new(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>, config: RedirectConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    fn load(&self) -> BTreeMap<String, SourceCounters> {
        storage::load_json(self.store.as_ref(), REDIRECT_COUNTERS_KEY).unwrap_or_default()
    }

    fn save(&self, counters: &BTreeMap<String, SourceCounters>) {
        if let Err(e) = storage::save_json(self.store.as_ref(), REDIRECT_COUNTERS_KEY, counters) {
            tracing::warn!(error = %e, "failed to persist redirect counters");
        }
    }

    /// Count one redirect from `source` and decide whether it may go ahead
    pub fn record(&self, source: &str) -> Verdict {
        let now_ms = self.clock.now().timestamp_millis();
        let mut counters = self.load();
        let entry = counters.entry(source.to_string()).or_default();

        let short = entry.short.bump(now_ms, self.config.short_window_ms as i64);
        let long = entry.long.bump(now_ms, self.config.long_window_ms as i64);
        self.save(&counters);

        if short >= self.config.short_limit || long >= self.config.long_limit {
            tracing::warn!(source, short, long, "redirect loop detected");
            if let Err(e) = self.store.set(LOOP_BROKEN_KEY, source) {
                tracing::warn!(error = %e, "failed to persist loop-broken marker");
            }
            Verdict::Break
        } else {
            Verdict::Proceed
        }
    }

    /// Current (short, long) counts for `source`, honoring elapsed windows
    pub fn counts(&self, source: &str) -> (u32, u32) {
        let now_ms = self.clock.now().timestamp_millis();
        self.load()
            .get(source)
            .map(|c| {
                (
                    c.short.current(now_ms, self.config.short_window_ms as i64),
                    c.long.current(now_ms, self.config.long_window_ms as i64),
                )
            })
            .unwrap_or((0, 0))
    }

    /// Source label of the last broken loop, if one is still flagged
    pub fn broken_source(&self) -> Option<String> {
        self.store.get(LOOP_BROKEN_KEY)
    }

    /// Clear every counter and the broken-loop flag
    pub fn reset(&self) {
        for key in [REDIRECT_COUNTERS_KEY, LOOP_BROKEN_KEY] {
            if let Err(e) = self.store.remove(key) {
                tracing::warn!(key, error = %e, "failed to clear redirect state");
            }
        }
    }

    /// Reset when `url` carries the loop-broken marker. Returns whether it did.
    pub fn reset_if_marked(&self, url: &str) -> bool {
        let marked = url
            .split_once('?')
            .map(|(_, query)| query.split('&').any(|pair| pair == LOOP_BROKEN_MARKER))
            .unwrap_or(false);
        if marked {
            self.reset();
        }
        marked
    }
}
