// WeCare API payload types.
// Business payloads stay opaque JSON; only envelopes this crate inspects are typed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Body posted to the credential-renewal endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct RefreshRequest<'a> {
    pub token: &'a str,
}

/// Credential-renewal response. Accepts either `token` or `access_token`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RefreshResponse {
    pub token: Option<String>,
    pub access_token: Option<String>,
}

impl RefreshResponse {
    pub fn into_token(self) -> Option<String> {
        self.token
            .or(self.access_token)
            .filter(|t| !t.trim().is_empty())
    }
}

/// Error envelope returned by the API.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiMessage {
    pub message: Option<String>,
}

/// Response of `/api/dashboardCharts`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DashboardCharts {
    #[serde(default)]
    pub revenue_stats: Value,
    #[serde(default)]
    pub sources_activity: Value,
    #[serde(default)]
    pub occupancy_stats: Value,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

/// Stats and charts fetched together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardSnapshot {
    pub stats: Value,
    pub charts: DashboardCharts,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}
