//! Prometheus metrics for task processing.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Duration;

/// Metric names.
pub mod names {
    /// Total tasks enqueued.
    pub const TASKS_ENQUEUED_TOTAL: &str = "courier_tasks_enqueued_total";
    /// Total tasks completed successfully.
    pub const TASKS_PROCESSED_TOTAL: &str = "courier_tasks_processed_total";
    /// Total failed attempts.
    pub const TASKS_FAILED_TOTAL: &str = "courier_tasks_failed_total";
    /// Total tasks scheduled for retry.
    pub const TASKS_RETRIED_TOTAL: &str = "courier_tasks_retried_total";
    /// Total tasks moved to the dead set.
    pub const TASKS_DEAD_TOTAL: &str = "courier_tasks_dead_total";
    /// Total attempts that timed out.
    pub const TASKS_TIMED_OUT_TOTAL: &str = "courier_tasks_timed_out_total";
    /// Total tasks promoted from scheduled/retry to pending.
    pub const TASKS_FORWARDED_TOTAL: &str = "courier_tasks_forwarded_total";
    /// Total expired leases returned to pending.
    pub const TASKS_RECOVERED_TOTAL: &str = "courier_tasks_recovered_total";

    /// Handler duration in seconds.
    pub const TASK_DURATION_SECONDS: &str = "courier_task_duration_seconds";

    /// Slots currently running a handler.
    pub const WORKERS_ACTIVE: &str = "courier_workers_active";
    /// Configured slot count.
    pub const WORKERS_CONCURRENCY: &str = "courier_workers_concurrency";
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!(names::TASKS_ENQUEUED_TOTAL, "Total number of tasks enqueued");
    describe_counter!(
        names::TASKS_PROCESSED_TOTAL,
        "Total number of tasks completed successfully"
    );
    describe_counter!(names::TASKS_FAILED_TOTAL, "Total number of failed attempts");
    describe_counter!(names::TASKS_RETRIED_TOTAL, "Total number of tasks scheduled for retry");
    describe_counter!(names::TASKS_DEAD_TOTAL, "Total number of tasks moved to the dead set");
    describe_counter!(names::TASKS_TIMED_OUT_TOTAL, "Total number of attempts that timed out");
    describe_counter!(
        names::TASKS_FORWARDED_TOTAL,
        "Total number of scheduled or retry tasks promoted to pending"
    );
    describe_counter!(
        names::TASKS_RECOVERED_TOTAL,
        "Total number of expired leases returned to pending"
    );

    describe_histogram!(names::TASK_DURATION_SECONDS, "Task handler duration in seconds");

    describe_gauge!(names::WORKERS_ACTIVE, "Number of slots running a handler");
    describe_gauge!(names::WORKERS_CONCURRENCY, "Worker pool concurrency setting");
}

/// Task metrics recorder.
#[derive(Clone)]
pub struct TaskMetrics;

impl TaskMetrics {
    /// Record a task enqueued.
    pub fn task_enqueued(queue: &str, task_type: &str) {
        counter!(
            names::TASKS_ENQUEUED_TOTAL,
            "queue" => queue.to_string(),
            "task_type" => task_type.to_string()
        )
        .increment(1);
    }

    /// Record a task completed.
    pub fn task_processed(queue: &str, task_type: &str, duration: Duration) {
        counter!(
            names::TASKS_PROCESSED_TOTAL,
            "queue" => queue.to_string(),
            "task_type" => task_type.to_string()
        )
        .increment(1);

        histogram!(
            names::TASK_DURATION_SECONDS,
            "queue" => queue.to_string(),
            "task_type" => task_type.to_string(),
            "status" => "processed"
        )
        .record(duration.as_secs_f64());
    }

    /// Record a failed attempt.
    pub fn task_failed(queue: &str, task_type: &str, error_kind: &'static str, duration: Duration) {
        counter!(
            names::TASKS_FAILED_TOTAL,
            "queue" => queue.to_string(),
            "task_type" => task_type.to_string(),
            "error_kind" => error_kind
        )
        .increment(1);

        histogram!(
            names::TASK_DURATION_SECONDS,
            "queue" => queue.to_string(),
            "task_type" => task_type.to_string(),
            "status" => "failed"
        )
        .record(duration.as_secs_f64());

        if error_kind == "timeout" {
            counter!(
                names::TASKS_TIMED_OUT_TOTAL,
                "queue" => queue.to_string(),
                "task_type" => task_type.to_string()
            )
            .increment(1);
        }
    }

    /// Record a task scheduled for retry.
    pub fn task_retried(queue: &str, task_type: &str) {
        counter!(
            names::TASKS_RETRIED_TOTAL,
            "queue" => queue.to_string(),
            "task_type" => task_type.to_string()
        )
        .increment(1);
    }

    /// Record a task moved to the dead set.
    pub fn task_dead(queue: &str, task_type: &str) {
        counter!(
            names::TASKS_DEAD_TOTAL,
            "queue" => queue.to_string(),
            "task_type" => task_type.to_string()
        )
        .increment(1);
    }

    /// Record tasks promoted by the forwarder.
    pub fn tasks_forwarded(count: u64) {
        counter!(names::TASKS_FORWARDED_TOTAL).increment(count);
    }

    /// Record leases recovered.
    pub fn tasks_recovered(count: u64) {
        counter!(names::TASKS_RECOVERED_TOTAL).increment(count);
    }
}

/// Worker metrics recorder.
#[derive(Clone)]
pub struct WorkerMetrics;

impl WorkerMetrics {
    /// Update active slot count.
    pub fn update_active(active: u64) {
        gauge!(names::WORKERS_ACTIVE).set(active as f64);
    }

    /// Record the configured concurrency.
    pub fn set_concurrency(concurrency: usize) {
        gauge!(names::WORKERS_CONCURRENCY).set(concurrency as f64);
    }
}
