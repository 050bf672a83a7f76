//! Owner dashboard analytics: payload sanitizing and a single-slot TTL cache.

use crate::clock::Clock;
use crate::error::ApiError;
use crate::http::client::ApiClient;
use crate::journal::Journal;
use crate::singleflight::SingleFlight;
use crate::storage::{self, lock, KeyValueStore, ANALYTICS_KEY};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex};

const ANALYTICS_PATH: &str = "/api/dashboard/analytics";
const FLIGHT_KEY: &str = "GET /api/dashboard/analytics";
const SNAPSHOT_VERSION: u32 = 1;

/// Coerce an arbitrary JSON value to a finite number.
///
/// Missing, null, non-numeric and non-finite values yield `default`; numeric
/// strings are parsed.
pub fn sanitize_number(value: Option<&Value>, default: f64) -> f64 {
    let parsed = match value {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match parsed {
        Some(n) if n.is_finite() => n,
        _ => default,
    }
}

/// First present field among `keys`, sanitized
fn field(payload: &Value, keys: &[&str]) -> f64 {
    let value = keys.iter().find_map(|k| payload.get(*k));
    sanitize_number(value, 0.0)
}

fn count(payload: &Value, keys: &[&str]) -> u64 {
    field(payload, keys).max(0.0).round() as u64
}

fn money(n: f64) -> f64 {
    (n * 100.0).round() / 100.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsSnapshot {
    pub version: u32,
    pub revenue: f64,
    pub bookings: u64,
    /// Percentage, 0 to 100
    pub occupancy: f64,
    pub average_rating: f64,
    pub active_spots: u64,
    pub upcoming_bookings: u64,
    pub fetched_at: DateTime<Utc>,
}

impl AnalyticsSnapshot {
    /// Project a backend payload (bare or wrapped in `data`) onto sanitized numbers
    pub fn from_payload(payload: &Value, fetched_at: DateTime<Utc>) -> Self {
        let payload = match payload.get("data") {
            Some(inner) if inner.is_object() => inner,
            _ => payload,
        };
        Self {
            version: SNAPSHOT_VERSION,
            revenue: money(field(payload, &["totalRevenue", "total_revenue", "revenue"]).max(0.0)),
            bookings: count(payload, &["totalBookings", "total_bookings", "bookings"]),
            occupancy: field(payload, &["occupancyRate", "occupancy_rate", "occupancy"])
                .clamp(0.0, 100.0),
            average_rating: field(payload, &["averageRating", "average_rating"]).clamp(0.0, 5.0),
            active_spots: count(payload, &["activeSpots", "active_spots", "spots"]),
            upcoming_bookings: count(payload, &["upcomingBookings", "upcoming_bookings"]),
            fetched_at,
        }
    }

    pub fn age_secs(&self, now: DateTime<Utc>) -> i64 {
        now.signed_duration_since(self.fetched_at).num_seconds()
    }
}

/// One cached snapshot with a fixed time-to-live
pub struct AnalyticsCache {
    ttl: chrono::Duration,
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    slot: Mutex<Option<AnalyticsSnapshot>>,
}

impl AnalyticsCache {
    pub fn new(ttl_secs: u64, store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
        let persisted: Option<AnalyticsSnapshot> =
            storage::load_json(store.as_ref(), ANALYTICS_KEY);
        Self {
            ttl: chrono::Duration::seconds(ttl_secs as i64),
            store,
            clock,
            slot: Mutex::new(persisted.filter(|s| s.version == SNAPSHOT_VERSION)),
        }
    }

    /// The snapshot if still inside its TTL
    pub fn fresh(&self) -> Option<AnalyticsSnapshot> {
        let now = self.clock.now();
        lock(&self.slot)
            .as_ref()
            .filter(|s| now.signed_duration_since(s.fetched_at) < self.ttl)
            .cloned()
    }

    /// The snapshot regardless of age
    pub fn stale(&self) -> Option<AnalyticsSnapshot> {
        lock(&self.slot).clone()
    }

    pub fn put(&self, snapshot: AnalyticsSnapshot) {
        if let Err(e) = storage::save_json(self.store.as_ref(), ANALYTICS_KEY, &snapshot) {
            tracing::warn!(error = %e, "failed to persist analytics snapshot");
        }
        *lock(&self.slot) = Some(snapshot);
    }

    pub fn clear(&self) {
        if let Err(e) = self.store.remove(ANALYTICS_KEY) {
            tracing::warn!(error = %e, "failed to clear analytics snapshot");
        }
        *lock(&self.slot) = None;
    }
}

pub struct DashboardService {
    api: Arc<ApiClient>,
    cache: AnalyticsCache,
    clock: Arc<dyn Clock>,
    journal: Arc<Journal>,
    flight: SingleFlight<Result<AnalyticsSnapshot, ApiError>>,
}

impl DashboardService {
    pub fn new(
        api: Arc<ApiClient>,
        cache: AnalyticsCache,
        clock: Arc<dyn Clock>,
        journal: Arc<Journal>,
    ) -> Self {
        Self {
            api,
            cache,
            clock,
            journal,
            flight: SingleFlight::new(),
        }
    }

    pub fn cache(&self) -> &AnalyticsCache {
        &self.cache
    }

    /// Cached analytics within the TTL, else one shared fetch. A failed
    /// fetch that is not an auth error serves the stale snapshot if any.
    pub fn fetch_analytics(&self, force: bool) -> Result<AnalyticsSnapshot, ApiError> {
        if !force {
            if let Some(snapshot) = self.cache.fresh() {
                tracing::debug!("analytics served from cache");
                return Ok(snapshot);
            }
        }
        self.flight.run(FLIGHT_KEY, || self.load())
    }

    fn load(&self) -> Result<AnalyticsSnapshot, ApiError> {
        match self.api.get_json::<Value>(ANALYTICS_PATH) {
            Ok(payload) => {
                let snapshot = AnalyticsSnapshot::from_payload(&payload, self.clock.now());
                self.cache.put(snapshot.clone());
                Ok(snapshot)
            }
            Err(e) if !e.is_auth() => match self.cache.stale() {
                Some(stale) => {
                    let age = stale.age_secs(self.clock.now());
                    tracing::warn!(error = %e, age_secs = age, "analytics refresh failed, serving stale data");
                    let _ = self.journal.cache_fallback("analytics", age, &e.to_string());
                    Ok(stale)
                }
                None => Err(e),
            },
            Err(e) => Err(e),
        }
    }
}
