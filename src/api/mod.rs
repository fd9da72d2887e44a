// WeCare API module.
// Provides the authenticated client, dashboard endpoints, and payload types.

pub mod client;
pub mod endpoints;
pub mod types;

pub use client::{ApiClient, build_http_client, check_response};
pub use types::*;
