//! In-process performance monitoring.
//!
//! A bounded, time-windowed event log of operation durations plus a cumulative
//! aggregate for persistence-layer calls. Writes are O(1) (ring buffer append);
//! time-window filtering is paid only when a summary is computed, since reads
//! are far rarer than writes in a live request-serving process.

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use crate::time::now_ms;

/// Ring buffer capacity; oldest metrics are evicted first.
pub const MAX_METRICS: usize = 1000;
/// Operations slower than this emit a warning diagnostic.
pub const SLOW_OPERATION_MS: f64 = 1000.0;
/// Database queries slower than this are kept in the slow-query log.
pub const SLOW_QUERY_MS: f64 = 100.0;
/// Maximum number of retained slow-query records.
pub const MAX_SLOW_QUERIES: usize = 50;
/// Default summary window: trailing 5 minutes.
pub const DEFAULT_SUMMARY_WINDOW_MS: u64 = 5 * 60 * 1000;
/// Slow-query text is truncated to this many characters.
const SLOW_QUERY_TEXT_LEN: usize = 200;
/// Number of slowest operations listed in a summary.
const SUMMARY_SLOWEST_LIMIT: usize = 10;

/// Optional key/value annotations attached to a metric.
pub type Metadata = HashMap<String, Value>;

/// A single recorded operation duration. Never mutated after creation.
#[derive(Debug, Clone, Serialize)]
pub struct Metric {
    pub name: String,
    #[serde(rename = "durationMs")]
    pub duration_ms: f64,
    #[serde(rename = "timestampMs")]
    pub timestamp_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

/// A truncated record of a slow persistence-layer call.
#[derive(Debug, Clone, Serialize)]
pub struct SlowQuery {
    pub query: String,
    #[serde(rename = "durationMs")]
    pub duration_ms: f64,
    #[serde(rename = "timestampMs")]
    pub timestamp_ms: u64,
}

/// Cumulative persistence-layer aggregate for the process lifetime.
#[derive(Debug, Clone, Default)]
struct DatabaseMetrics {
    query_count: u64,
    total_duration_ms: f64,
    slow_queries: VecDeque<SlowQuery>,
}

/// Serializable snapshot of [`DatabaseMetrics`].
#[derive(Debug, Clone, Serialize)]
pub struct DatabaseSnapshot {
    #[serde(rename = "queryCount")]
    pub query_count: u64,
    #[serde(rename = "totalDurationMs")]
    pub total_duration_ms: f64,
    #[serde(rename = "avgDurationMs")]
    pub avg_duration_ms: f64,
    #[serde(rename = "slowQueries")]
    pub slow_queries: Vec<SlowQuery>,
}

/// Per-name aggregation inside a summary window.
#[derive(Debug, Clone, Serialize)]
pub struct OperationStats {
    pub count: usize,
    #[serde(rename = "avgDurationMs")]
    pub avg_duration_ms: f64,
}

/// Result of [`PerformanceMonitor::summary`].
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceSummary {
    #[serde(rename = "windowMs")]
    pub window_ms: u64,
    #[serde(rename = "totalOperations")]
    pub total_operations: usize,
    #[serde(rename = "avgDurationMs")]
    pub avg_duration_ms: f64,
    #[serde(rename = "slowestOperations")]
    pub slowest_operations: Vec<Metric>,
    pub operations: HashMap<String, OperationStats>,
    pub database: DatabaseSnapshot,
}

#[derive(Default)]
struct MonitorState {
    metrics: VecDeque<Metric>,
    database: DatabaseMetrics,
}

/// Shared, thread-safe performance monitor.
///
/// Constructed once at process start and threaded through application state;
/// there is deliberately no global instance.
#[derive(Default)]
pub struct PerformanceMonitor {
    state: Mutex<MonitorState>,
}

impl PerformanceMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start timing an operation. The returned handle records a metric when
    /// stopped; if it is dropped without an explicit stop (early return,
    /// panic unwind), the metric is recorded at drop time instead.
    pub fn start_timing(
        self: &Arc<Self>,
        name: impl Into<String>,
        metadata: Option<Metadata>,
    ) -> Timing {
        Timing {
            monitor: Arc::clone(self),
            name: name.into(),
            metadata,
            started: Instant::now(),
            finished: false,
        }
    }

    /// Time a synchronous unit of work. The result (including an `Err`) is
    /// returned unchanged; the metric is recorded either way.
    pub fn time_fn<T>(self: &Arc<Self>, name: &str, f: impl FnOnce() -> T) -> T {
        let timing = self.start_timing(name, None);
        let out = f();
        timing.stop();
        out
    }

    /// Time a future to completion. Like [`Self::time_fn`] but async.
    pub async fn time_async<T, F>(self: &Arc<Self>, name: &str, fut: F) -> T
    where
        F: Future<Output = T>,
    {
        let timing = self.start_timing(name, None);
        let out = fut.await;
        timing.stop();
        out
    }

    /// Append a metric to the ring buffer, evicting the oldest entry once the
    /// buffer is at capacity.
    pub fn add_metric(&self, name: impl Into<String>, duration_ms: f64, metadata: Option<Metadata>) {
        let metric = Metric {
            name: name.into(),
            duration_ms,
            timestamp_ms: now_ms(),
            metadata,
        };
        if duration_ms > SLOW_OPERATION_MS {
            tracing::warn!(name = %metric.name, duration_ms, "slow operation detected");
        }
        self.record(metric);
    }

    fn record(&self, metric: Metric) {
        let mut state = self.state.lock();
        if state.metrics.len() >= MAX_METRICS {
            state.metrics.pop_front();
        }
        state.metrics.push_back(metric);
    }

    /// Report a persistence-layer call. Counted cumulatively; slow queries
    /// keep a truncated copy of the query text.
    pub fn track_database_query(&self, query: &str, duration_ms: f64) {
        let mut state = self.state.lock();
        state.database.query_count += 1;
        state.database.total_duration_ms += duration_ms;

        if duration_ms > SLOW_QUERY_MS {
            if state.database.slow_queries.len() >= MAX_SLOW_QUERIES {
                state.database.slow_queries.pop_front();
            }
            state.database.slow_queries.push_back(SlowQuery {
                query: query.chars().take(SLOW_QUERY_TEXT_LEN).collect(),
                duration_ms,
                timestamp_ms: now_ms(),
            });
            tracing::warn!(duration_ms, "slow database query detected");
        }
    }

    /// Summarize metrics within the trailing window (default 5 minutes).
    ///
    /// The database aggregate is cumulative for the process lifetime and is
    /// not windowed.
    pub fn summary(&self, window_ms: Option<u64>) -> PerformanceSummary {
        let window_ms = window_ms.unwrap_or(DEFAULT_SUMMARY_WINDOW_MS);
        let cutoff = now_ms().saturating_sub(window_ms);
        let state = self.state.lock();

        let recent: Vec<&Metric> = state
            .metrics
            .iter()
            .filter(|m| m.timestamp_ms >= cutoff)
            .collect();

        let total_operations = recent.len();
        let avg_duration_ms = if total_operations == 0 {
            0.0
        } else {
            recent.iter().map(|m| m.duration_ms).sum::<f64>() / total_operations as f64
        };

        let mut slowest: Vec<Metric> = recent.iter().map(|m| (*m).clone()).collect();
        slowest.sort_by(|a, b| {
            b.duration_ms
                .partial_cmp(&a.duration_ms)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        slowest.truncate(SUMMARY_SLOWEST_LIMIT);

        let mut operations: HashMap<String, OperationStats> = HashMap::new();
        let mut totals: HashMap<&str, f64> = HashMap::new();
        for m in &recent {
            let stats = operations.entry(m.name.clone()).or_insert(OperationStats {
                count: 0,
                avg_duration_ms: 0.0,
            });
            stats.count += 1;
            *totals.entry(m.name.as_str()).or_insert(0.0) += m.duration_ms;
        }
        for (name, stats) in operations.iter_mut() {
            stats.avg_duration_ms = totals[name.as_str()] / stats.count as f64;
        }

        let db = &state.database;
        let database = DatabaseSnapshot {
            query_count: db.query_count,
            total_duration_ms: db.total_duration_ms,
            avg_duration_ms: if db.query_count == 0 {
                0.0
            } else {
                db.total_duration_ms / db.query_count as f64
            },
            slow_queries: db.slow_queries.iter().cloned().collect(),
        };

        PerformanceSummary {
            window_ms,
            total_operations,
            avg_duration_ms,
            slowest_operations: slowest,
            operations,
            database,
        }
    }

    /// Clear all recorded metrics and the database aggregate.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.metrics.clear();
        state.database = DatabaseMetrics::default();
    }
}

/// In-flight timing handle returned by [`PerformanceMonitor::start_timing`].
pub struct Timing {
    monitor: Arc<PerformanceMonitor>,
    name: String,
    metadata: Option<Metadata>,
    started: Instant,
    finished: bool,
}

impl Timing {
    /// Stop the timer and record the metric. Returns the elapsed milliseconds.
    pub fn stop(mut self) -> f64 {
        self.finish(None)
    }

    /// Stop the timer, merging extra metadata gathered after the timer
    /// started (e.g. a response status) into the recorded metric.
    pub fn stop_with(mut self, extra: Metadata) -> f64 {
        self.finish(Some(extra))
    }

    fn finish(&mut self, extra: Option<Metadata>) -> f64 {
        self.finished = true;
        let elapsed_ms = self.started.elapsed().as_secs_f64() * 1000.0;
        let mut metadata = self.metadata.take();
        if let Some(extra) = extra {
            metadata.get_or_insert_with(Metadata::new).extend(extra);
        }
        self.monitor
            .add_metric(std::mem::take(&mut self.name), elapsed_ms, metadata);
        elapsed_ms
    }
}

impl Drop for Timing {
    fn drop(&mut self) {
        if !self.finished {
            self.finish(None);
        }
    }
}
