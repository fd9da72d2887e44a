// Cached query execution.
// Binds a cache key to a fetch function and keeps a subscription's state current.

use std::future::Future;
use std::sync::{Arc, Weak};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::cache::QueryCache;
use crate::error::Result;
use crate::signal::{LifecycleEvent, Signals, next_event};

use super::options::QueryOptions;
use super::state::{QueryState, QueryStatus};

pub type FetchFn = Arc<dyn Fn() -> BoxFuture<'static, Result<Value>> + Send + Sync>;

#[derive(Debug, Default)]
struct Progress {
    retry_count: u32,
    first_load_done: bool,
}

/// One subscription to a cached resource.
///
/// Subscriptions sharing a key share the cache but nothing else; each one fetches
/// on its own when its own checks call for it.
pub struct Query {
    key: String,
    fetch: FetchFn,
    cache: Arc<QueryCache>,
    options: QueryOptions,
    state: watch::Sender<QueryState>,
    progress: Mutex<Progress>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Query {
    pub fn new<F, Fut>(
        key: impl Into<String>,
        cache: Arc<QueryCache>,
        options: QueryOptions,
        fetch: F,
    ) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let (state, _) = watch::channel(QueryState::default());
        Self {
            key: key.into(),
            fetch: Arc::new(move || fetch().boxed()),
            cache,
            options,
            state,
            progress: Mutex::new(Progress::default()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn options(&self) -> &QueryOptions {
        &self.options
    }

    pub fn state(&self) -> QueryState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<QueryState> {
        self.state.subscribe()
    }

    pub fn retry_count(&self) -> u32 {
        self.progress.lock().retry_count
    }

    /// Fetch, retrying linearly, and settle the subscription.
    ///
    /// A background fetch raises `is_refetching` instead of `loading`; only the first
    /// foreground fetch shows `loading`. Pending retries keep those flags raised.
    pub async fn execute(&self, background: bool) {
        if !self.options.enabled {
            return;
        }

        let first_load = !self.progress.lock().first_load_done;
        self.state.send_modify(|state| {
            if background {
                state.is_refetching = true;
            } else if first_load {
                state.loading = true;
                state.status = QueryStatus::Loading;
            }
            state.error = None;
        });

        loop {
            let epoch = self.cache.epoch(&self.key);
            let error = match (self.fetch)().await {
                Ok(value) => {
                    self.progress.lock().retry_count = 0;
                    // The subscription takes the result even if the key was invalidated meanwhile
                    self.cache
                        .set_if_current(&self.key, epoch, value.clone(), self.options.cache_time);

                    self.settle(|state| {
                        state.data = Some(value.clone());
                        state.status = QueryStatus::Success;
                    });
                    if let Some(on_success) = &self.options.on_success {
                        on_success(&value);
                    }
                    return;
                }
                Err(error) => error,
            };

            let retry = {
                let mut progress = self.progress.lock();
                if progress.retry_count < self.options.retry {
                    progress.retry_count += 1;
                    Some(progress.retry_count)
                } else {
                    progress.retry_count = 0;
                    None
                }
            };

            if let Some(retry) = retry {
                let delay = self.options.retry_delay * retry;
                info!(
                    key = %self.key,
                    retry,
                    max = self.options.retry,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Query failed, retrying"
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            error!(key = %self.key, error = %error, "Query failed");
            self.settle(|state| {
                state.error = Some(error.to_string());
                state.status = QueryStatus::Error;
            });
            if let Some(on_error) = &self.options.on_error {
                on_error(&error);
            }
            return;
        }
    }

    /// Apply the outcome and clear the fetch flags in one transition.
    fn settle(&self, outcome: impl FnOnce(&mut QueryState)) {
        self.progress.lock().first_load_done = true;
        self.state.send_modify(|state| {
            outcome(state);
            state.loading = false;
            state.is_refetching = false;
        });
    }

    /// Initial load: serve the cache if it has the key, fetch otherwise.
    ///
    /// Returns the background refresh started for a stale cached entry, if any.
    pub async fn mount(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if !self.options.enabled {
            self.state.send_modify(|state| state.loading = false);
            return None;
        }

        match self.cache.get(&self.key) {
            Some(value) => {
                debug!(key = %self.key, "Serving cached data");
                self.progress.lock().first_load_done = true;
                self.state.send_modify(|state| {
                    state.data = Some(value);
                    state.status = QueryStatus::Success;
                    state.loading = false;
                });
                if self.cache.is_stale(&self.key, self.options.stale_time) {
                    return Some(self.spawn_fetch());
                }
                None
            }
            None => {
                self.execute(false).await;
                None
            }
        }
    }

    /// Drop the cached entry and fetch again in the foreground.
    pub async fn refetch(&self) {
        self.cache.invalidate(&self.key);
        self.execute(false).await;
    }

    /// Background fetch, only if the cache holds nothing for the key.
    pub async fn prefetch(&self) {
        if !self.options.enabled || self.cache.get(&self.key).is_some() {
            return;
        }
        debug!(key = %self.key, "Prefetching");
        self.execute(true).await;
    }

    /// Background refresh detached from the caller; never cancelled by [`Query::stop`].
    fn spawn_fetch(self: &Arc<Self>) -> JoinHandle<()> {
        let query = Arc::clone(self);
        tokio::spawn(async move { query.execute(true).await })
    }

    fn refetch_if_stale(self: &Arc<Self>, trigger: &'static str) {
        if self.cache.is_stale(&self.key, self.options.stale_time) {
            debug!(key = %self.key, trigger, "Data stale, refetching");
            self.spawn_fetch();
        }
    }

    /// Mount, then refetch stale data on the interval and on window focus.
    pub async fn start(self: &Arc<Self>, signals: &Signals) {
        let events = signals.subscribe();
        self.mount().await;

        let mut tasks = Vec::new();
        if let Some(period) = self.options.refetch_interval {
            let first_tick = Instant::now() + period;
            tasks.push(tokio::spawn(interval_loop(Arc::downgrade(self), first_tick, period)));
        }
        if self.options.refetch_on_window_focus {
            tasks.push(tokio::spawn(focus_loop(Arc::downgrade(self), events)));
        }

        let previous = std::mem::replace(&mut *self.tasks.lock(), tasks);
        for handle in previous {
            handle.abort();
        }
    }

    /// Stop the interval and focus triggers. Fetches already under way still complete.
    pub fn stop(&self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.tasks.lock().iter().any(|h| !h.is_finished())
    }
}

impl Drop for Query {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn interval_loop(query: Weak<Query>, first_tick: Instant, period: std::time::Duration) {
    let mut ticker = tokio::time::interval_at(first_tick, period);
    loop {
        ticker.tick().await;
        let Some(query) = query.upgrade() else {
            return;
        };
        query.refetch_if_stale("interval");
    }
}

async fn focus_loop(query: Weak<Query>, mut events: broadcast::Receiver<LifecycleEvent>) {
    while next_event(&mut events, LifecycleEvent::Focus).await.is_some() {
        let Some(query) = query.upgrade() else {
            return;
        };
        query.refetch_if_stale("focus");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{MemoryBackend, PersistentStore};
    use crate::clock::{SharedClock, TokioClock};
    use crate::error::WeCareError;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    fn cache() -> Arc<QueryCache> {
        let clock: SharedClock = Arc::new(TokioClock::new());
        let store = Arc::new(PersistentStore::new(Arc::new(MemoryBackend::new()), clock.clone()));
        Arc::new(QueryCache::new(store, clock))
    }

    fn counting_query(
        cache: &Arc<QueryCache>,
        options: QueryOptions,
        calls: &Arc<AtomicUsize>,
    ) -> Arc<Query> {
        let calls = calls.clone();
        Arc::new(Query::new("stats", cache.clone(), options, move || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Ok(json!({ "fetch": n })) }
        }))
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_then_settles_with_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let errors = Arc::new(AtomicUsize::new(0));
        let fetch_calls = calls.clone();
        let error_calls = errors.clone();
        let options = QueryOptions::new()
            .with_retry(2)
            .with_retry_delay(Duration::from_millis(100))
            .on_error(move |_| {
                error_calls.fetch_add(1, Ordering::SeqCst);
            });
        let query = Arc::new(Query::new("stats", cache(), options, move || {
            fetch_calls.fetch_add(1, Ordering::SeqCst);
            async { Err(WeCareError::Other("network down".into())) }
        }));

        let started = Instant::now();
        let handle = tokio::spawn({
            let query = query.clone();
            async move { query.execute(false).await }
        });

        tokio::time::advance(Duration::from_millis(50)).await;
        settle().await;
        let pending = query.state();
        assert!(pending.loading);
        assert_eq!(pending.error, None);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        handle.await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(errors.load(Ordering::SeqCst), 1);

        let state = query.state();
        assert_eq!(state.status, QueryStatus::Error);
        assert_eq!(state.error.as_deref(), Some("network down"));
        assert!(!state.loading);
        assert!(!state.is_refetching);
        assert_eq!(query.retry_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_writes_cache_and_notifies() {
        let cache = cache();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        let options = QueryOptions::new().on_success(move |value| {
            *sink.lock() = Some(value.clone());
        });
        let query = counting_query(&cache, options, &calls);

        query.execute(false).await;

        let state = query.state();
        assert_eq!(state.status, QueryStatus::Success);
        assert_eq!(state.data, Some(json!({"fetch": 1})));
        assert!(!state.is_fetching());
        assert_eq!(cache.get("stats"), Some(json!({"fetch": 1})));
        assert_eq!(*seen.lock(), Some(json!({"fetch": 1})));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_retry() {
        let calls = Arc::new(AtomicUsize::new(0));
        let fetch_calls = calls.clone();
        let options = QueryOptions::new().with_retry_delay(Duration::from_millis(10));
        let query = Query::new("stats", cache(), options, move || {
            let n = fetch_calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(WeCareError::Other("flaky".into()))
                } else {
                    Ok(json!("ok"))
                }
            }
        });

        query.execute(false).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(query.state().data, Some(json!("ok")));
        assert_eq!(query.state().error, None);
        assert_eq!(query.retry_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_first_foreground_fetch_shows_loading() {
        let cache = cache();
        let calls = Arc::new(AtomicUsize::new(0));
        let query = counting_query(&cache, QueryOptions::new(), &calls);
        let mut receiver = query.subscribe();

        query.execute(false).await;
        assert!(receiver.has_changed().unwrap());
        receiver.borrow_and_update();

        query.execute(true).await;
        assert!(!query.state().loading);
        assert_eq!(query.state().data, Some(json!({"fetch": 2})));
        assert!(receiver.has_changed().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_mount_serves_fresh_cache_without_fetching() {
        let cache = cache();
        cache.set("stats", json!("cached"), Duration::from_secs(300));
        let calls = Arc::new(AtomicUsize::new(0));
        let query = counting_query(&cache, QueryOptions::new(), &calls);

        assert!(query.mount().await.is_none());
        let state = query.state();
        assert_eq!(state.data, Some(json!("cached")));
        assert!(!state.loading);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mount_revalidates_stale_cache_in_background() {
        let cache = cache();
        cache.set("stats", json!("cached"), Duration::from_secs(300));
        tokio::time::advance(Duration::from_secs(31)).await;
        let calls = Arc::new(AtomicUsize::new(0));
        let query = counting_query(&cache, QueryOptions::new(), &calls);

        let refresh = query.mount().await.unwrap();
        assert_eq!(query.state().data, Some(json!("cached")));
        assert!(!query.state().loading);

        refresh.await.unwrap();
        let state = query.state();
        assert_eq!(state.data, Some(json!({"fetch": 1})));
        assert!(!state.is_refetching);
        assert_eq!(cache.get("stats"), Some(json!({"fetch": 1})));
    }

    #[tokio::test(start_paused = true)]
    async fn test_mount_without_cache_fetches() {
        let cache = cache();
        let calls = Arc::new(AtomicUsize::new(0));
        let query = counting_query(&cache, QueryOptions::new(), &calls);

        assert!(query.mount().await.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(query.state().status, QueryStatus::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_query_never_fetches() {
        let cache = cache();
        let calls = Arc::new(AtomicUsize::new(0));
        let query = counting_query(&cache, QueryOptions::new().with_enabled(false), &calls);

        query.mount().await;
        query.execute(false).await;
        query.prefetch().await;

        let state = query.state();
        assert!(!state.loading);
        assert_eq!(state.data, None);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refetch_invalidates_before_fetching() {
        let cache = cache();
        cache.set("stats", json!("old"), Duration::from_secs(300));
        let saw_empty_cache = Arc::new(AtomicBool::new(false));
        let observed = saw_empty_cache.clone();
        let shared = cache.clone();
        let query = Query::new("stats", cache.clone(), QueryOptions::new(), move || {
            observed.store(shared.get("stats").is_none(), Ordering::SeqCst);
            async { Ok(json!("new")) }
        });

        query.refetch().await;
        assert!(saw_empty_cache.load(Ordering::SeqCst));
        assert_eq!(cache.get("stats"), Some(json!("new")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_outlived_by_invalidation_still_settles() {
        let cache = cache();
        let successes = Arc::new(AtomicUsize::new(0));
        let success_calls = successes.clone();
        let slow = Arc::new(Query::new(
            "stats",
            cache.clone(),
            QueryOptions::new().on_success(move |_| {
                success_calls.fetch_add(1, Ordering::SeqCst);
            }),
            || async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(json!("slow"))
            },
        ));
        let sibling = Query::new("stats", cache.clone(), QueryOptions::new(), || async {
            Ok(json!("sibling"))
        });

        let handle = tokio::spawn({
            let slow = slow.clone();
            async move { slow.execute(false).await }
        });
        settle().await;
        assert!(slow.state().loading);

        sibling.refetch().await;
        handle.await.unwrap();

        // The cache keeps the newer write; the subscription still settles
        assert_eq!(cache.get("stats"), Some(json!("sibling")));
        let state = slow.state();
        assert_eq!(state.status, QueryStatus::Success);
        assert_eq!(state.data, Some(json!("slow")));
        assert_eq!(state.error, None);
        assert!(!state.is_fetching());
        assert_eq!(successes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prefetch_fills_cold_cache_only() {
        let cache = cache();
        let calls = Arc::new(AtomicUsize::new(0));
        let query = counting_query(&cache, QueryOptions::new(), &calls);

        query.prefetch().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.get("stats"), Some(json!({"fetch": 1})));
        let state = query.state();
        assert_eq!(state.data, Some(json!({"fetch": 1})));
        assert!(!state.is_refetching);
        assert!(!state.loading);

        // Stale but present still counts as warm
        tokio::time::advance(Duration::from_secs(60)).await;
        query.prefetch().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prefetch_retries_and_notifies() {
        let cache = cache();
        let calls = Arc::new(AtomicUsize::new(0));
        let successes = Arc::new(AtomicUsize::new(0));
        let fetch_calls = calls.clone();
        let success_calls = successes.clone();
        let options = QueryOptions::new()
            .with_retry(2)
            .with_retry_delay(Duration::from_millis(10))
            .on_success(move |_| {
                success_calls.fetch_add(1, Ordering::SeqCst);
            });
        let query = Query::new("stats", cache.clone(), options, move || {
            let n = fetch_calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(WeCareError::Other("flaky".into()))
                } else {
                    Ok(json!("warm"))
                }
            }
        });

        query.prefetch().await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.get("stats"), Some(json!("warm")));
        assert_eq!(query.state().data, Some(json!("warm")));
        assert_eq!(successes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscriptions_do_not_share_fetches() {
        let cache = cache();
        let calls = Arc::new(AtomicUsize::new(0));
        let first = counting_query(&cache, QueryOptions::new(), &calls);
        let second = counting_query(&cache, QueryOptions::new(), &calls);

        tokio::join!(first.execute(false), second.execute(false));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(first.state().is_success());
        assert!(second.state().is_success());
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_keeps_last_good_data() {
        let calls = Arc::new(AtomicUsize::new(0));
        let fetch_calls = calls.clone();
        let options = QueryOptions::new().with_retry(0);
        let query = Query::new("stats", cache(), options, move || {
            let n = fetch_calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Ok(json!("good"))
                } else {
                    Err(WeCareError::Unauthorized)
                }
            }
        });

        query.execute(false).await;
        query.execute(true).await;

        let state = query.state();
        assert!(state.is_error());
        assert!(state.error.is_some());
        assert!(!state.is_fetching());
        assert_eq!(state.data, Some(json!("good")));

        // A later success clears the error
        let recovered = Query::new("stats", cache(), QueryOptions::new(), || async {
            Ok(json!("again"))
        });
        recovered.execute(false).await;
        assert_eq!(recovered.state().error, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_refetches_only_when_stale() {
        let cache = cache();
        let calls = Arc::new(AtomicUsize::new(0));
        let options = QueryOptions::new()
            .with_refetch_on_window_focus(false)
            .with_refetch_interval(Duration::from_secs(10));
        let query = counting_query(&cache, options, &calls);
        let signals = Signals::new();

        query.start(&signals).await;
        assert!(query.is_running());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        for _ in 0..2 {
            tokio::time::advance(Duration::from_secs(10)).await;
            settle().await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(10)).await;
        settle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        query.stop();
        assert!(!query.is_running());
        tokio::time::advance(Duration::from_secs(60)).await;
        settle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_focus_refetches_only_when_stale() {
        let cache = cache();
        let calls = Arc::new(AtomicUsize::new(0));
        let query = counting_query(&cache, QueryOptions::new(), &calls);
        let signals = Signals::new();

        query.start(&signals).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        signals.focus();
        settle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        signals.visible();
        signals.focus();
        settle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        query.stop();
        tokio::time::advance(Duration::from_secs(31)).await;
        signals.focus();
        settle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
