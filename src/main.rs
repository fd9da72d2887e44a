// wecare-sync: headless driver for the dashboard data layer.
// Keeps the dashboard queries and the credential fresh until interrupted.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use wecare_sync::Result;
use wecare_sync::api::{ApiClient, build_http_client};
use wecare_sync::auth::{CredentialStore, TokenManager};
use wecare_sync::cache::{FileBackend, PersistentStore, QueryCache, StorageBackend};
use wecare_sync::clock::{SharedClock, SystemClock};
use wecare_sync::config::Config;
use wecare_sync::perf::PerformanceMonitor;
use wecare_sync::query::{QueryState, dashboard_queries};
use wecare_sync::signal::Signals;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let clock: SharedClock = Arc::new(SystemClock);
    let store_dir = config.store_dir()?;
    let backend: Arc<dyn StorageBackend> = Arc::new(FileBackend::open(&store_dir)?);
    info!(dir = %store_dir.display(), "Opened durable store");

    let store = Arc::new(
        PersistentStore::new(backend.clone(), clock.clone())
            .with_prefix(config.cache.prefix.clone())
            .with_max_bytes(config.cache.max_bytes),
    );
    let cache = Arc::new(QueryCache::new(store, clock.clone()).with_default_ttl(config.default_ttl()));

    let http = build_http_client(&config)?;
    let auth = Arc::new(TokenManager::from_config(
        &config,
        http.clone(),
        CredentialStore::new(backend),
        clock,
    ));
    let monitor = Arc::new(PerformanceMonitor::new());
    let client = Arc::new(ApiClient::new(
        http,
        config.api_base_url.clone(),
        auth.clone(),
        monitor.clone(),
    ));
    let signals = Signals::new();

    if let Ok(token) = std::env::var("WECARE_TOKEN") {
        auth.login(&token)?;
    }
    if !auth.is_authenticated() {
        warn!("No credential stored, requests will be unauthenticated");
    }
    auth.start(&signals);

    let queries = dashboard_queries(client, cache.clone());
    let mut tasks = Vec::new();
    for query in &queries {
        tasks.push(tokio::spawn(log_changes(
            query.key().to_string(),
            query.subscribe(),
        )));

        let query = Arc::clone(query);
        let signals = signals.clone();
        tasks.push(tokio::spawn(async move { query.start(&signals).await }));
    }

    info!(base_url = %config.api_base_url, queries = queries.len(), "Running, Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    for query in &queries {
        query.stop();
    }
    auth.stop();
    for task in tasks {
        task.abort();
    }
    cache.shutdown();

    let report = monitor.report();
    let stats = cache.stats();
    info!(
        operations = report.total_operations,
        api_calls = report.api_calls.len(),
        slow = report.slow_operations.len(),
        cached_entries = stats.count,
        cached_size = %stats.size_formatted(),
        "Session summary"
    );
    Ok(())
}

async fn log_changes(key: String, mut receiver: watch::Receiver<QueryState>) {
    while receiver.changed().await.is_ok() {
        let state = receiver.borrow_and_update().clone();
        match &state.error {
            Some(error) => warn!(key = %key, error = %error, "Query errored"),
            None => info!(
                key = %key,
                status = ?state.status,
                loading = state.loading,
                refetching = state.is_refetching,
                has_data = state.data.is_some(),
                "Query state changed"
            ),
        }
    }
}
