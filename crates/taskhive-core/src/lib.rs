pub mod monitoring;
pub mod time;

pub use monitoring::{
    DatabaseSnapshot, Metadata, Metric, OperationStats, PerformanceMonitor, PerformanceSummary,
    SlowQuery, Timing, DEFAULT_SUMMARY_WINDOW_MS, MAX_METRICS, MAX_SLOW_QUERIES,
    SLOW_OPERATION_MS, SLOW_QUERY_MS,
};
pub use time::{now_ms, now_secs};
