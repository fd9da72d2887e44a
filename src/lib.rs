// wecare-sync: caching, auto-refreshing data-fetch layer for the WeCare dashboard API.

pub mod api;
pub mod auth;
pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod perf;
pub mod query;
pub mod retry;
pub mod signal;

#[cfg(test)]
mod test_support;

pub use error::{Result, WeCareError};
