//! Typed marketplace endpoints.

use crate::error::ApiError;
use crate::http::client::ApiClient;
use crate::session::UserProfile;
use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spot {
    pub id: String,
    #[serde(alias = "name")]
    pub title: String,
    #[serde(default)]
    pub location: String,
    #[serde(alias = "pricePerNight", alias = "price_per_night")]
    pub nightly_rate: f64,
    #[serde(alias = "maxGuests", alias = "max_guests")]
    pub capacity: u32,
    #[serde(default, alias = "ownerId")]
    pub owner_id: Option<String>,
    #[serde(default)]
    pub amenities: Vec<String>,
    #[serde(default)]
    pub rating: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Booking {
    pub id: String,
    #[serde(alias = "spotId")]
    pub spot_id: String,
    #[serde(alias = "startDate")]
    pub start_date: NaiveDate,
    #[serde(alias = "endDate")]
    pub end_date: NaiveDate,
    #[serde(alias = "guestCount", alias = "guests")]
    pub guest_count: u32,
    #[serde(default)]
    pub status: String,
    #[serde(default, alias = "totalPrice")]
    pub total: f64,
}

/// Search filters for the spot listing; unset fields are not sent
#[derive(Debug, Clone, Default)]
pub struct SpotFilter {
    pub location: Option<String>,
    pub guests: Option<u32>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

impl SpotFilter {
    fn to_query(&self) -> Vec<(String, String)> {
        let mut query = Vec::new();
        if let Some(location) = &self.location {
            query.push(("location".to_string(), location.clone()));
        }
        if let Some(guests) = self.guests {
            query.push(("guests".to_string(), guests.to_string()));
        }
        if let Some(start) = self.start_date {
            query.push(("start_date".to_string(), start.to_string()));
        }
        if let Some(end) = self.end_date {
            query.push(("end_date".to_string(), end.to_string()));
        }
        query
    }
}

/// List responses come bare or wrapped
#[derive(Deserialize)]
#[serde(untagged)]
enum ListBody<T> {
    Bare(Vec<T>),
    Wrapped {
        #[serde(alias = "spots", alias = "bookings", alias = "items")]
        data: Vec<T>,
    },
}

impl<T> ListBody<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            Self::Bare(items) | Self::Wrapped { data: items } => items,
        }
    }
}

/// A missing collection endpoint means "nothing yet"
fn list_or_empty<T: DeserializeOwned>(
    result: Result<ListBody<T>, ApiError>,
) -> Result<Vec<T>, ApiError> {
    match result {
        Ok(body) => Ok(body.into_vec()),
        Err(ApiError::NotFound { path }) => {
            tracing::debug!(path = %path, "collection not found, treating as empty");
            Ok(Vec::new())
        }
        Err(e) => Err(e),
    }
}

pub struct MarketplaceApi {
    api: Arc<ApiClient>,
}

impl MarketplaceApi {
    pub fn new(api: Arc<ApiClient>) -> Self {
        Self { api }
    }

    pub fn list_spots(&self, filter: &SpotFilter) -> Result<Vec<Spot>, ApiError> {
        list_or_empty(self.api.get_json_with_query("/api/spots", &filter.to_query()))
    }

    pub fn get_spot(&self, id: &str) -> Result<Spot, ApiError> {
        self.api.get_json(&format!("/api/spots/{}", id))
    }

    pub fn my_bookings(&self) -> Result<Vec<Booking>, ApiError> {
        list_or_empty(self.api.get_json("/api/bookings/mine"))
    }

    pub fn fetch_profile(&self) -> Result<UserProfile, ApiError> {
        self.api.get_json("/api/users/me")
    }
}
