// Performance monitor.
// Times API calls and flags slow operations.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Operations slower than this are logged as warnings.
pub const SLOW_THRESHOLD: Duration = Duration::from_secs(1);

/// Metrics kept after cleanup.
const MAX_METRICS: usize = 100;

#[derive(Debug, Clone)]
struct Timing {
    started: Instant,
    recorded_at: DateTime<Utc>,
    duration: Option<Duration>,
}

/// A completed timing.
#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    pub duration: Duration,
    pub recorded_at: DateTime<Utc>,
}

/// Summary of completed timings.
#[derive(Debug, Clone, Default)]
pub struct PerformanceReport {
    pub total_operations: usize,
    /// API call timings keyed by operation name (without the `api-` prefix).
    pub api_calls: BTreeMap<String, Metric>,
    pub slow_operations: Vec<String>,
}

#[derive(Debug)]
pub struct PerformanceMonitor {
    timings: Mutex<HashMap<String, Timing>>,
    enabled: AtomicBool,
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        Self {
            timings: Mutex::new(HashMap::new()),
            enabled: AtomicBool::new(true),
        }
    }
}

impl PerformanceMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Start timing `key`, replacing any unfinished timing with the same key.
    pub fn start(&self, key: &str) {
        if !self.is_enabled() {
            return;
        }
        self.timings.lock().insert(
            key.to_string(),
            Timing {
                started: Instant::now(),
                recorded_at: Utc::now(),
                duration: None,
            },
        );
    }

    /// Finish timing `key`, returning how long it took.
    pub fn end(&self, key: &str) -> Option<Duration> {
        if !self.is_enabled() {
            return None;
        }

        let duration = {
            let mut timings = self.timings.lock();
            let timing = timings.get_mut(key)?;
            let duration = timing.started.elapsed();
            timing.duration = Some(duration);
            duration
        };

        if duration > SLOW_THRESHOLD {
            warn!(
                operation = key,
                duration_ms = duration.as_millis() as u64,
                "Slow operation detected"
            );
        } else {
            debug!(operation = key, duration_ms = duration.as_millis() as u64, "Operation timed");
        }
        Some(duration)
    }

    /// Time an API call as `api-<name>`, whether it succeeds or fails.
    pub async fn time<F, T>(&self, name: &str, call: F) -> T
    where
        F: Future<Output = T>,
    {
        let key = format!("api-{}", name);
        self.start(&key);
        let result = call.await;
        self.end(&key);
        result
    }

    /// Completed timings by key.
    pub fn metrics(&self) -> BTreeMap<String, Metric> {
        self.timings
            .lock()
            .iter()
            .filter_map(|(key, timing)| {
                timing.duration.map(|duration| {
                    (
                        key.clone(),
                        Metric {
                            duration,
                            recorded_at: timing.recorded_at,
                        },
                    )
                })
            })
            .collect()
    }

    /// Mean duration of completed timings whose key starts with `prefix`.
    pub fn average(&self, prefix: &str) -> Option<Duration> {
        let durations: Vec<Duration> = self
            .timings
            .lock()
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .filter_map(|(_, timing)| timing.duration)
            .collect();

        if durations.is_empty() {
            return None;
        }
        let total: Duration = durations.iter().sum();
        Some(total / durations.len() as u32)
    }

    /// Drop all but the newest timings.
    pub fn cleanup(&self) {
        let mut timings = self.timings.lock();
        if timings.len() <= MAX_METRICS {
            return;
        }

        let mut entries: Vec<(String, Timing)> = timings.drain().collect();
        entries.sort_by(|a, b| b.1.recorded_at.cmp(&a.1.recorded_at));
        timings.extend(entries.into_iter().take(MAX_METRICS));
    }

    pub fn report(&self) -> PerformanceReport {
        let metrics = self.metrics();
        let mut report = PerformanceReport {
            total_operations: metrics.len(),
            ..PerformanceReport::default()
        };

        for (key, metric) in metrics {
            if metric.duration > SLOW_THRESHOLD {
                report.slow_operations.push(key.clone());
            }
            if let Some(name) = key.strip_prefix("api-") {
                report.api_calls.insert(name.to_string(), metric);
            }
        }
        report
    }
}
