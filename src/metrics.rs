//! Metrics for observability.
//!
//! Emits metrics through the `metrics` facade for:
//! - Tick outcomes and skipped (overlapping) ticks
//! - Task outcomes
//! - Tags replicated, skipped and failed per task
//! - Auth refreshes per registry
//! - Registry API latency
//!
//! No exporter is installed here; the binary or embedding application
//! decides where metrics go.
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `registry_mirror_`:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track durations in seconds
//!
//! # Usage
//!
//! ```rust,no_run
//! use registry_mirror::metrics;
//! use std::time::Duration;
//!
//! metrics::record_tags_replicated("mirror-app", 3, 1, 0);
//! metrics::record_tick("succeeded", Duration::from_secs(12));
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record a completed tick.
pub fn record_tick(status: &str, duration: Duration) {
    counter!("registry_mirror_ticks_total", "status" => status.to_string()).increment(1);
    histogram!("registry_mirror_tick_duration_seconds").record(duration.as_secs_f64());
}

/// Record a tick skipped because the previous one was still running.
pub fn record_tick_skipped() {
    counter!("registry_mirror_ticks_skipped_total").increment(1);
}

/// Record the outcome of one task execution.
pub fn record_task(task: &str, status: &str, duration: Duration) {
    counter!(
        "registry_mirror_tasks_total",
        "task" => task.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!("registry_mirror_task_duration_seconds", "task" => task.to_string())
        .record(duration.as_secs_f64());
}

/// Record per-tag results of a mapping.
pub fn record_tags_replicated(task: &str, succeeded: usize, skipped: usize, failed: usize) {
    counter!("registry_mirror_tags_replicated_total", "task" => task.to_string())
        .increment(succeeded as u64);
    counter!("registry_mirror_tags_skipped_total", "task" => task.to_string())
        .increment(skipped as u64);
    if failed > 0 {
        counter!("registry_mirror_tags_failed_total", "task" => task.to_string())
            .increment(failed as u64);
    }
}

/// Record an auth refresh attempt.
pub fn record_auth_refresh(registry: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "registry_mirror_auth_refreshes_total",
        "registry" => registry.to_string(),
        "status" => status
    )
    .increment(1);
}

/// Record registry API request latency.
pub fn record_registry_request(registry: &str, operation: &str, duration: Duration) {
    histogram!(
        "registry_mirror_registry_request_duration_seconds",
        "registry" => registry.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record errors by kind (see [`SyncError::kind`](crate::SyncError::kind)).
pub fn record_error(task: &str, kind: &str) {
    counter!(
        "registry_mirror_errors_total",
        "task" => task.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
}

/// Record a tag list served from cache.
pub fn record_tag_cache_hit(registry: &str) {
    counter!("registry_mirror_tag_cache_hits_total", "registry" => registry.to_string())
        .increment(1);
}

/// Gauge for orchestrator state.
pub fn set_orchestrator_state(state: &str) {
    let value = match state {
        "Created" => 0.0,
        "Running" => 1.0,
        "ShuttingDown" => 2.0,
        "Stopped" => 3.0,
        _ => -1.0,
    };
    gauge!("registry_mirror_orchestrator_state").set(value);
}

#[cfg(test)]
mod tests {
    use super::*;

    // Without a recorder installed these are no-ops; the tests make sure
    // label construction does not panic.

    #[test]
    fn test_record_tick() {
        record_tick("succeeded", Duration::from_secs(3));
        record_tick("failed", Duration::ZERO);
        record_tick_skipped();
    }

    #[test]
    fn test_record_task() {
        record_task("mirror-app", "succeeded", Duration::from_millis(250));
        record_task("mirror-app", "interrupted", Duration::from_secs(30));
    }

    #[test]
    fn test_record_tags_replicated() {
        record_tags_replicated("mirror-app", 3, 1, 0);
        record_tags_replicated("mirror-app", 0, 0, 2);
    }

    #[test]
    fn test_record_auth_and_registry() {
        record_auth_refresh("ghcr.io", true);
        record_auth_refresh("ghcr.io", false);
        record_registry_request("ghcr.io", "list_tags", Duration::from_millis(80));
        record_tag_cache_hit("ghcr.io");
        record_error("mirror-app", "auth");
    }

    #[test]
    fn test_set_orchestrator_state_all_states() {
        set_orchestrator_state("Created");
        set_orchestrator_state("Running");
        set_orchestrator_state("ShuttingDown");
        set_orchestrator_state("Stopped");
        set_orchestrator_state("Unknown");
    }
}
