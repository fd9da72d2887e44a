// Query execution module.
// Cached, self-revalidating bindings between cache keys and fetch functions.

pub mod executor;
pub mod options;
pub mod presets;
pub mod state;

pub use executor::{FetchFn, Query};
pub use options::{ErrorCallback, QueryOptions, SuccessCallback};
pub use presets::{DashboardQuery, dashboard_queries};
pub use state::{QueryState, QueryStatus};
