//! Booking draft and checkout.
//!
//! A draft is created when the user picks dates and is mirrored to storage so
//! it survives the trip to the external payment page. It is cleared once the
//! payment is confirmed or the user cancels.

use crate::clock::Clock;
use crate::config::BookingConfig;
use crate::error::ApiError;
use crate::http::client::ApiClient;
use crate::marketplace::Spot;
use crate::navigation::Navigator;
use crate::storage::{self, lock, KeyValueStore, BOOKING_DRAFT_KEY};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum BookingError {
    #[error("Check-out must be after check-in")]
    InvalidDates,

    #[error("Check-in date is in the past")]
    PastDate,

    #[error("Guest count must be between 1 and {max}")]
    InvalidGuests { max: u32 },

    #[error("No booking in progress")]
    NoDraft,

    #[error("Checkout has not been started")]
    CheckoutNotStarted,

    #[error("Payment was not completed ({0})")]
    PaymentFailed(String),

    #[error(transparent)]
    Api(#[from] ApiError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceBreakdown {
    pub nightly_rate: f64,
    pub nights: u32,
    pub subtotal: f64,
    pub service_fee: f64,
    pub total: f64,
}

fn cents(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}

impl PriceBreakdown {
    pub fn compute(nightly_rate: f64, nights: u32, fee_rate: f64) -> Self {
        let subtotal = cents(nightly_rate * nights as f64);
        let service_fee = cents(subtotal * fee_rate);
        Self {
            nightly_rate,
            nights,
            subtotal,
            service_fee,
            total: cents(subtotal + service_fee),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookingDraft {
    pub spot_id: String,
    pub spot_title: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub guest_count: u32,
    pub price: PriceBreakdown,
    /// Set once the backend has accepted the booking
    #[serde(default)]
    pub booking_id: Option<String>,
    #[serde(default)]
    pub checkout_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// What the backend hands back when a booking is created
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CheckoutSession {
    #[serde(alias = "bookingId", alias = "id")]
    pub booking_id: String,
    #[serde(alias = "checkoutUrl", alias = "url")]
    pub checkout_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Paid,
    Pending,
    Failed,
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize)]
struct PaymentStatusBody {
    status: PaymentStatus,
}

pub struct BookingStore {
    config: BookingConfig,
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    draft: Mutex<Option<BookingDraft>>,
}

impl BookingStore {
    pub fn new(config: BookingConfig, store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            store,
            clock,
            draft: Mutex::new(None),
        }
    }

    /// Validate the stay and start a fresh draft for it
    pub fn select_dates(
        &self,
        spot: &Spot,
        start: NaiveDate,
        end: NaiveDate,
        guests: u32,
    ) -> Result<BookingDraft, BookingError> {
        if end <= start {
            return Err(BookingError::InvalidDates);
        }
        if start < self.clock.now().date_naive() {
            return Err(BookingError::PastDate);
        }
        if guests == 0 || guests > spot.capacity {
            return Err(BookingError::InvalidGuests { max: spot.capacity });
        }

        let nights = (end - start).num_days() as u32;
        let draft = BookingDraft {
            spot_id: spot.id.clone(),
            spot_title: spot.title.clone(),
            start_date: start,
            end_date: end,
            guest_count: guests,
            price: PriceBreakdown::compute(spot.nightly_rate, nights, self.config.service_fee_rate),
            booking_id: None,
            checkout_url: None,
            created_at: self.clock.now(),
        };
        self.set_draft(Some(draft.clone()));
        Ok(draft)
    }

    /// The current draft, reloading it from storage after a restart
    pub fn draft(&self) -> Option<BookingDraft> {
        let mut slot = lock(&self.draft);
        if slot.is_none() {
            *slot = storage::load_json(self.store.as_ref(), BOOKING_DRAFT_KEY);
        }
        slot.clone()
    }

    pub fn cancel(&self) {
        self.set_draft(None);
    }

    fn set_draft(&self, draft: Option<BookingDraft>) {
        let result = match &draft {
            Some(d) => storage::save_json(self.store.as_ref(), BOOKING_DRAFT_KEY, d),
            None => self.store.remove(BOOKING_DRAFT_KEY),
        };
        if let Err(e) = result {
            tracing::warn!(error = %e, "failed to persist booking draft");
        }
        *lock(&self.draft) = draft;
    }

    /// Create the booking and send the user to the payment page. A draft the
    /// backend already accepted goes back to its payment page instead.
    pub fn begin_checkout(
        &self,
        api: &ApiClient,
        navigator: &dyn Navigator,
    ) -> Result<CheckoutSession, BookingError> {
        let mut draft = self.draft().ok_or(BookingError::NoDraft)?;
        if let (Some(booking_id), Some(checkout_url)) = (&draft.booking_id, &draft.checkout_url) {
            tracing::info!(booking_id = %booking_id, "booking already created, resuming checkout");
            navigator.open_external(checkout_url);
            return Ok(CheckoutSession {
                booking_id: booking_id.clone(),
                checkout_url: checkout_url.clone(),
            });
        }
        let body = json!({
            "spot_id": draft.spot_id,
            "start_date": draft.start_date,
            "end_date": draft.end_date,
            "guest_count": draft.guest_count,
            "total": draft.price.total,
        });
        let session: CheckoutSession = api.post_json("/api/bookings", &body)?;
        tracing::info!(booking_id = %session.booking_id, "booking created, redirecting to checkout");

        draft.booking_id = Some(session.booking_id.clone());
        draft.checkout_url = Some(session.checkout_url.clone());
        self.set_draft(Some(draft));
        navigator.open_external(&session.checkout_url);
        Ok(session)
    }

    /// Ask the backend how the payment went; a paid booking clears the draft
    pub fn complete_checkout(&self, api: &ApiClient) -> Result<PaymentStatus, BookingError> {
        let draft = self.draft().ok_or(BookingError::NoDraft)?;
        let booking_id = draft.booking_id.ok_or(BookingError::CheckoutNotStarted)?;
        let body: PaymentStatusBody =
            api.get_json(&format!("/api/bookings/{}/payment-status", booking_id))?;

        match body.status {
            PaymentStatus::Paid => {
                tracing::info!(booking_id = %booking_id, "payment confirmed");
                self.cancel();
                Ok(PaymentStatus::Paid)
            }
            PaymentStatus::Failed => Err(BookingError::PaymentFailed(booking_id)),
            other => Ok(other),
        }
    }
}
