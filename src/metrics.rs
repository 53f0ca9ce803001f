// src/metrics.rs
//! Metric names used across the harvest core.
//!
//! The library only emits through the `metrics` facade; whoever embeds it
//! installs a recorder (the integration tests use the Prometheus one).

use metrics::{describe_counter, describe_gauge, describe_histogram};
use once_cell::sync::OnceCell;

pub const TASKS_TOTAL: &str = "harvest_tasks_total";
pub const TASK_FAILURES_TOTAL: &str = "harvest_task_failures_total";
pub const RETRIES_TOTAL: &str = "harvest_retries_total";
pub const FETCH_MS: &str = "harvest_fetch_ms";
pub const RECORDS_REJECTED_TOTAL: &str = "harvest_records_rejected_total";
pub const MERGE_TOTAL: &str = "harvest_merge_total";
pub const RUN_LAST_TS: &str = "harvest_run_last_ts";

/// One-time metrics registration (so series carry help text once a recorder exists).
pub fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!(TASKS_TOTAL, "Fetch tasks that reached a terminal outcome.");
        describe_counter!(
            TASK_FAILURES_TOTAL,
            "Fetch tasks that ended failed or timed out."
        );
        describe_counter!(RETRIES_TOTAL, "Fetch attempts retried after a transient error.");
        describe_histogram!(FETCH_MS, "Single adapter fetch attempt time in milliseconds.");
        describe_counter!(
            RECORDS_REJECTED_TOTAL,
            "Raw records dropped by validation."
        );
        describe_counter!(MERGE_TOTAL, "Merge results by outcome.");
        describe_gauge!(RUN_LAST_TS, "Unix ts when a harvest run last finished.");
    });
}
