// Observable state of a query subscription.

use serde_json::Value;

/// Where a subscription is in its fetch lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryStatus {
    #[default]
    Idle,
    Loading,
    Success,
    Error,
}

/// Snapshot published to subscribers after every transition.
///
/// `is_refetching` overlays `Success` during a background revalidation without
/// passing back through `Loading`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryState {
    pub status: QueryStatus,
    pub data: Option<Value>,
    pub loading: bool,
    pub error: Option<String>,
    pub is_refetching: bool,
}

impl QueryState {
    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, QueryStatus::Success)
    }

    pub fn is_error(&self) -> bool {
        matches!(self.status, QueryStatus::Error)
    }

    pub fn data(&self) -> Option<&Value> {
        self.data.as_ref()
    }

    /// True while any fetch for this subscription is outstanding.
    pub fn is_fetching(&self) -> bool {
        self.loading || self.is_refetching
    }
}
