// Per-query configuration.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::error::WeCareError;

pub type SuccessCallback = Arc<dyn Fn(&Value) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&WeCareError) + Send + Sync>;

pub const DEFAULT_STALE_TIME: Duration = Duration::from_secs(30);
pub const DEFAULT_CACHE_TIME: Duration = Duration::from_secs(5 * 60);

/// How a query caches, revalidates and retries.
#[derive(Clone)]
pub struct QueryOptions {
    /// Age after which cached data is refreshed in the background.
    pub stale_time: Duration,
    /// TTL of the cache entry written on success.
    pub cache_time: Duration,
    pub refetch_on_window_focus: bool,
    pub refetch_interval: Option<Duration>,
    /// Retries after the first failed attempt.
    pub retry: u32,
    /// Linear step between retries: the n-th retry waits `retry_delay * n`.
    pub retry_delay: Duration,
    pub enabled: bool,
    pub on_success: Option<SuccessCallback>,
    pub on_error: Option<ErrorCallback>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            stale_time: DEFAULT_STALE_TIME,
            cache_time: DEFAULT_CACHE_TIME,
            refetch_on_window_focus: true,
            refetch_interval: None,
            retry: 3,
            retry_delay: Duration::from_secs(1),
            enabled: true,
            on_success: None,
            on_error: None,
        }
    }
}

impl fmt::Debug for QueryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryOptions")
            .field("stale_time", &self.stale_time)
            .field("cache_time", &self.cache_time)
            .field("refetch_on_window_focus", &self.refetch_on_window_focus)
            .field("refetch_interval", &self.refetch_interval)
            .field("retry", &self.retry)
            .field("retry_delay", &self.retry_delay)
            .field("enabled", &self.enabled)
            .field("on_success", &self.on_success.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = stale_time;
        self
    }

    pub fn with_cache_time(mut self, cache_time: Duration) -> Self {
        self.cache_time = cache_time;
        self
    }

    pub fn with_refetch_on_window_focus(mut self, enabled: bool) -> Self {
        self.refetch_on_window_focus = enabled;
        self
    }

    pub fn with_refetch_interval(mut self, interval: Duration) -> Self {
        self.refetch_interval = Some(interval);
        self
    }

    pub fn with_retry(mut self, retry: u32) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn on_success(mut self, callback: impl Fn(&Value) + Send + Sync + 'static) -> Self {
        self.on_success = Some(Arc::new(callback));
        self
    }

    pub fn on_error(mut self, callback: impl Fn(&WeCareError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(callback));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = QueryOptions::default();
        assert_eq!(options.stale_time, Duration::from_secs(30));
        assert_eq!(options.cache_time, Duration::from_secs(300));
        assert!(options.refetch_on_window_focus);
        assert_eq!(options.refetch_interval, None);
        assert_eq!(options.retry, 3);
        assert!(options.enabled);
    }

    #[test]
    fn test_builder() {
        let options = QueryOptions::new()
            .with_stale_time(Duration::from_secs(60))
            .with_refetch_interval(Duration::from_secs(120))
            .with_enabled(false)
            .on_error(|_| {});

        assert_eq!(options.stale_time, Duration::from_secs(60));
        assert_eq!(options.refetch_interval, Some(Duration::from_secs(120)));
        assert!(!options.enabled);
        assert!(format!("{:?}", options).contains("on_error: true"));
    }
}
