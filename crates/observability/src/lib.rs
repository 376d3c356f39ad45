//! Tracing setup and workflow metrics shared by the engine and the worker.

/// Initialize process-wide observability (tracing/logging).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

/// Tracing configuration (filters, layers).
pub mod tracing;

/// Stage/job outcome recording.
pub mod metrics;

pub use metrics::{
    FanoutRecorder, InMemoryRecorder, MetricsSnapshot, NoopRecorder, StageMetrics, StageOutcome,
    TracingRecorder, WorkflowRecorder,
};
