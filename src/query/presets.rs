// Dashboard query presets.
// Cache keys of the dashboard and how often each one is revalidated.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::api::ApiClient;
use crate::cache::QueryCache;
use crate::error::Result;

use super::executor::Query;
use super::options::QueryOptions;

const fn minutes(n: u64) -> Duration {
    Duration::from_secs(n * 60)
}

/// Dashboard resource backed by one API call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DashboardQuery {
    Stats,
    RevenueStats,
    SourcesActivity,
    OccupancyData,
    ExpiringContracts,
    AccountManagersPerformance,
    AllDashboardData,
}

impl DashboardQuery {
    pub const ALL: [DashboardQuery; 7] = [
        DashboardQuery::Stats,
        DashboardQuery::RevenueStats,
        DashboardQuery::SourcesActivity,
        DashboardQuery::OccupancyData,
        DashboardQuery::ExpiringContracts,
        DashboardQuery::AccountManagersPerformance,
        DashboardQuery::AllDashboardData,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            DashboardQuery::Stats => "dashboard-stats",
            DashboardQuery::RevenueStats => "revenue-stats",
            DashboardQuery::SourcesActivity => "sources-activity",
            DashboardQuery::OccupancyData => "occupancy-data",
            DashboardQuery::ExpiringContracts => "expiring-contracts",
            DashboardQuery::AccountManagersPerformance => "account-managers-performance",
            DashboardQuery::AllDashboardData => "all-dashboard-data",
        }
    }

    /// Stale time, cache time and refetch interval.
    fn timings(&self) -> (Duration, Duration, Duration) {
        match self {
            DashboardQuery::Stats => (minutes(2), minutes(10), minutes(5)),
            DashboardQuery::RevenueStats | DashboardQuery::SourcesActivity => {
                (minutes(3), minutes(15), minutes(10))
            }
            DashboardQuery::OccupancyData | DashboardQuery::AccountManagersPerformance => {
                (minutes(5), minutes(20), minutes(15))
            }
            DashboardQuery::ExpiringContracts => (minutes(1), minutes(5), minutes(3)),
            DashboardQuery::AllDashboardData => (minutes(1), minutes(10), minutes(5)),
        }
    }

    pub fn options(&self) -> QueryOptions {
        let (stale_time, cache_time, interval) = self.timings();
        QueryOptions::new()
            .with_stale_time(stale_time)
            .with_cache_time(cache_time)
            .with_refetch_interval(interval)
            .with_retry(3)
    }

    async fn fetch(self, client: &ApiClient) -> Result<Value> {
        match self {
            DashboardQuery::Stats => client.get_dashboard_stats().await,
            DashboardQuery::RevenueStats => client.get_revenue_stats().await,
            DashboardQuery::SourcesActivity => client.get_sources_activity().await,
            DashboardQuery::OccupancyData => client.get_occupancy_data().await,
            DashboardQuery::ExpiringContracts => client.get_expiring_contracts().await,
            DashboardQuery::AccountManagersPerformance => {
                client.get_account_managers_performance().await
            }
            DashboardQuery::AllDashboardData => {
                let snapshot = client.get_all_dashboard_data().await?;
                Ok(serde_json::to_value(snapshot)?)
            }
        }
    }

    /// Bind this resource to `client` and `cache` with its preset options.
    pub fn query(self, client: Arc<ApiClient>, cache: Arc<QueryCache>) -> Query {
        self.query_with(client, cache, self.options())
    }

    pub fn query_with(
        self,
        client: Arc<ApiClient>,
        cache: Arc<QueryCache>,
        options: QueryOptions,
    ) -> Query {
        Query::new(self.key(), cache, options, move || {
            let client = Arc::clone(&client);
            async move { self.fetch(&client).await }
        })
    }
}

/// Every dashboard query, ready to start.
pub fn dashboard_queries(client: Arc<ApiClient>, cache: Arc<QueryCache>) -> Vec<Arc<Query>> {
    DashboardQuery::ALL
        .iter()
        .map(|preset| Arc::new(preset.query(client.clone(), cache.clone())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{MemoryBackend, PersistentStore};
    use crate::clock::{SharedClock, SystemClock};
    use crate::test_support::TestApi;
    use axum::Router;
    use axum::routing::get;
    use serde_json::json;

    fn cache() -> Arc<QueryCache> {
        let clock: SharedClock = Arc::new(SystemClock);
        let store = Arc::new(PersistentStore::new(Arc::new(MemoryBackend::new()), clock.clone()));
        Arc::new(QueryCache::new(store, clock))
    }

    #[test]
    fn test_preset_timings() {
        let stats = DashboardQuery::Stats.options();
        assert_eq!(stats.stale_time, minutes(2));
        assert_eq!(stats.cache_time, minutes(10));
        assert_eq!(stats.refetch_interval, Some(minutes(5)));
        assert_eq!(stats.retry, 3);

        let contracts = DashboardQuery::ExpiringContracts.options();
        assert_eq!(contracts.stale_time, minutes(1));
        assert_eq!(contracts.refetch_interval, Some(minutes(3)));

        for preset in DashboardQuery::ALL {
            let options = preset.options();
            assert!(options.stale_time <= options.cache_time, "{}", preset.key());
        }
    }

    #[tokio::test]
    async fn test_preset_queries_fill_cache() {
        let router = Router::new()
            .route("/api/dashboard", get(|| async { axum::Json(json!({"customers": 5})) }))
            .route(
                "/api/dashboardCharts",
                get(|| async { axum::Json(json!({"occupancy_stats": {"rate": 0.5}})) }),
            );
        let api = TestApi::spawn(router).await;
        let client = Arc::new(api.client());
        let cache = cache();

        let queries = dashboard_queries(client, cache.clone());
        assert_eq!(queries.len(), 7);

        let occupancy = queries
            .iter()
            .find(|q| q.key() == "occupancy-data")
            .unwrap();
        occupancy.execute(false).await;
        assert_eq!(cache.get("occupancy-data"), Some(json!({"rate": 0.5})));

        let all = queries
            .iter()
            .find(|q| q.key() == "all-dashboard-data")
            .unwrap();
        all.execute(false).await;
        let snapshot = all.state().data.unwrap();
        assert_eq!(snapshot["stats"], json!({"customers": 5}));
        assert_eq!(snapshot["charts"]["revenue_stats"], Value::Null);
    }
}
