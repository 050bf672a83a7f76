//! Client-side session and request plumbing for the campsite marketplace.

pub mod analytics;
pub mod auth;
pub mod booking;
pub mod clock;
pub mod config;
pub mod error;
pub mod http;
pub mod journal;
pub mod marketplace;
pub mod navigation;
pub mod redirect;
pub mod session;
pub mod singleflight;
pub mod storage;
pub mod throttle;

#[cfg(test)]
mod testing;
