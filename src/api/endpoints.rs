// WeCare dashboard endpoints.
// Typed calls for the dashboard aggregates, each retried on transient failures.

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{Result, WeCareError};
use crate::retry::{RetryPolicy, with_retry_notify};

use super::client::ApiClient;
use super::types::{DashboardCharts, DashboardSnapshot};

const DASHBOARD_PATH: &str = "/api/dashboard";
const CHARTS_PATH: &str = "/api/dashboardCharts";
const EXPIRING_CONTRACTS_PATH: &str = "/api/dashboard/expiring-contracts";
const ACCOUNT_MANAGERS_PATH: &str = "/api/dashboard/account-managers";

impl ApiClient {
    fn policy(&self, max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(max_retries, self.retry_delay())
    }

    /// Timed GET retried under `max_retries`.
    async fn get_retried<T: DeserializeOwned>(
        &self,
        name: &str,
        endpoint: &str,
        max_retries: u32,
    ) -> Result<T> {
        with_retry_notify(
            || self.get_timed(name, endpoint),
            &self.policy(max_retries),
            |error, attempt, max| {
                debug!(endpoint, attempt, max, error = %error, "Dashboard call failed");
            },
        )
        .await
    }

    /// Get the dashboard headline statistics.
    pub async fn get_dashboard_stats(&self) -> Result<Value> {
        self.get_retried("dashboard-stats", DASHBOARD_PATH, 3).await
    }

    /// Get every dashboard chart series.
    pub async fn get_chart_data(&self) -> Result<DashboardCharts> {
        self.get_retried("chart-data", CHARTS_PATH, 3).await
    }

    /// Get the revenue series of the dashboard charts.
    pub async fn get_revenue_stats(&self) -> Result<Value> {
        let charts: DashboardCharts = self.get_retried("revenue-stats", CHARTS_PATH, 2).await?;
        Ok(charts.revenue_stats)
    }

    pub async fn get_sources_activity(&self) -> Result<Value> {
        let charts: DashboardCharts = self.get_retried("sources-activity", CHARTS_PATH, 2).await?;
        Ok(charts.sources_activity)
    }

    pub async fn get_occupancy_data(&self) -> Result<Value> {
        let charts: DashboardCharts = self.get_retried("occupancy-data", CHARTS_PATH, 2).await?;
        Ok(charts.occupancy_stats)
    }

    /// Get contracts that are about to expire.
    pub async fn get_expiring_contracts(&self) -> Result<Value> {
        self.get_retried("expiring-contracts", EXPIRING_CONTRACTS_PATH, 2)
            .await
    }

    /// Get per account manager performance figures.
    pub async fn get_account_managers_performance(&self) -> Result<Value> {
        self.get_retried("account-managers-performance", ACCOUNT_MANAGERS_PATH, 2)
            .await
    }

    /// Get stats and charts together; fails if either call fails.
    pub async fn get_all_dashboard_data(&self) -> Result<DashboardSnapshot> {
        with_retry_notify(
            || async {
                let (stats, charts) = futures_util::try_join!(
                    self.get_timed::<Value>("dashboard-stats", DASHBOARD_PATH),
                    self.get_timed::<DashboardCharts>("chart-data", CHARTS_PATH),
                )?;
                Ok::<_, WeCareError>(DashboardSnapshot {
                    stats,
                    charts,
                    timestamp: Utc::now(),
                })
            },
            &self.policy(2),
            |error, attempt, max| {
                debug!(attempt, max, error = %error, "Dashboard snapshot failed");
            },
        )
        .await
    }

    /// Warm the dashboard data; failures are logged and swallowed.
    pub async fn prefetch_dashboard_data(&self) {
        if let Err(e) = self.get_all_dashboard_data().await {
            warn!(error = %e, "Failed to prefetch dashboard data");
        }
    }
}
