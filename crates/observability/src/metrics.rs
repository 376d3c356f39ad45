//! Workflow metrics.
//!
//! ## Design
//! The state machine reports every stage attempt and every terminal job to a
//! [`WorkflowRecorder`]. Recorders must be cheap and must never fail the
//! workflow; they take `&self` and return nothing.
//!
//! ## Components
//! - [`TracingRecorder`]: one structured event per call.
//! - [`InMemoryRecorder`]: aggregates counts/durations, exposes a snapshot.
//! - [`FanoutRecorder`]: forwards to several recorders.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use clinflow_core::{ErrorKind, JobId, JobState, Stage};

/// How one stage attempt ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StageOutcome {
    Completed,
    /// Transient failure, the same stage is scheduled again.
    Retrying { error_code: String },
    Failed { kind: ErrorKind, error_code: String },
}

impl StageOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageOutcome::Completed => "completed",
            StageOutcome::Retrying { .. } => "retrying",
            StageOutcome::Failed { .. } => "failed",
        }
    }

    pub fn error_code(&self) -> Option<&str> {
        match self {
            StageOutcome::Completed => None,
            StageOutcome::Retrying { error_code } | StageOutcome::Failed { error_code, .. } => {
                Some(error_code)
            }
        }
    }
}

pub trait WorkflowRecorder: Send + Sync + 'static {
    fn stage_finished(&self, job_id: JobId, stage: Stage, duration: Duration, outcome: &StageOutcome);

    fn job_finished(
        &self,
        job_id: JobId,
        state: JobState,
        error_code: Option<&str>,
        total: Duration,
    );
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRecorder;

impl WorkflowRecorder for NoopRecorder {
    fn stage_finished(&self, _: JobId, _: Stage, _: Duration, _: &StageOutcome) {}

    fn job_finished(&self, _: JobId, _: JobState, _: Option<&str>, _: Duration) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TracingRecorder;

impl WorkflowRecorder for TracingRecorder {
    fn stage_finished(&self, job_id: JobId, stage: Stage, duration: Duration, outcome: &StageOutcome) {
        ::tracing::info!(
            job_id = %job_id,
            stage = %stage,
            outcome = outcome.as_str(),
            error_code = outcome.error_code().unwrap_or(""),
            duration_ms = duration.as_millis() as u64,
            "stage finished"
        );
    }

    fn job_finished(
        &self,
        job_id: JobId,
        state: JobState,
        error_code: Option<&str>,
        total: Duration,
    ) {
        ::tracing::info!(
            job_id = %job_id,
            state = %state,
            error_code = error_code.unwrap_or(""),
            total_ms = total.as_millis() as u64,
            "job finished"
        );
    }
}

/// Aggregated numbers for one stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageMetrics {
    pub completed: u64,
    pub retried: u64,
    pub failed: u64,
    pub total_duration_ms: u64,
    pub max_duration_ms: u64,
}

impl StageMetrics {
    pub fn attempts(&self) -> u64 {
        self.completed + self.retried + self.failed
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub stages: BTreeMap<Stage, StageMetrics>,
    /// Terminal job count keyed by state name.
    pub jobs_by_state: BTreeMap<String, u64>,
    /// Failure count keyed by error code (stage failures and retries).
    pub errors_by_code: BTreeMap<String, u64>,
}

#[derive(Debug, Default)]
pub struct InMemoryRecorder {
    inner: Mutex<MetricsSnapshot>,
}

impl InMemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner
            .lock()
            .map(|m| m.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}

impl WorkflowRecorder for InMemoryRecorder {
    fn stage_finished(&self, _job_id: JobId, stage: Stage, duration: Duration, outcome: &StageOutcome) {
        let mut m = match self.inner.lock() {
            Ok(m) => m,
            Err(poisoned) => poisoned.into_inner(),
        };
        let ms = duration.as_millis() as u64;
        let entry = m.stages.entry(stage).or_default();
        match outcome {
            StageOutcome::Completed => entry.completed += 1,
            StageOutcome::Retrying { .. } => entry.retried += 1,
            StageOutcome::Failed { .. } => entry.failed += 1,
        }
        entry.total_duration_ms += ms;
        entry.max_duration_ms = entry.max_duration_ms.max(ms);
        if let Some(code) = outcome.error_code() {
            *m.errors_by_code.entry(code.to_string()).or_default() += 1;
        }
    }

    fn job_finished(&self, _job_id: JobId, state: JobState, _: Option<&str>, _: Duration) {
        let mut m = match self.inner.lock() {
            Ok(m) => m,
            Err(poisoned) => poisoned.into_inner(),
        };
        *m.jobs_by_state.entry(state.as_str().to_string()).or_default() += 1;
    }
}

impl WorkflowRecorder for Arc<InMemoryRecorder> {
    fn stage_finished(&self, job_id: JobId, stage: Stage, duration: Duration, outcome: &StageOutcome) {
        (**self).stage_finished(job_id, stage, duration, outcome)
    }

    fn job_finished(
        &self,
        job_id: JobId,
        state: JobState,
        error_code: Option<&str>,
        total: Duration,
    ) {
        (**self).job_finished(job_id, state, error_code, total)
    }
}

#[derive(Default)]
pub struct FanoutRecorder {
    recorders: Vec<Arc<dyn WorkflowRecorder>>,
}

impl FanoutRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, recorder: Arc<dyn WorkflowRecorder>) -> Self {
        self.recorders.push(recorder);
        self
    }
}

impl WorkflowRecorder for FanoutRecorder {
    fn stage_finished(&self, job_id: JobId, stage: Stage, duration: Duration, outcome: &StageOutcome) {
        for r in &self.recorders {
            r.stage_finished(job_id, stage, duration, outcome);
        }
    }

    fn job_finished(
        &self,
        job_id: JobId,
        state: JobState,
        error_code: Option<&str>,
        total: Duration,
    ) {
        for r in &self.recorders {
            r.job_finished(job_id, state, error_code, total);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_recorder_aggregates_by_stage_and_state() {
        let rec = InMemoryRecorder::new();
        let job = JobId::new();
        rec.stage_finished(job, Stage::Infer, Duration::from_millis(30), &StageOutcome::Retrying {
            error_code: "timeout".into(),
        });
        rec.stage_finished(job, Stage::Infer, Duration::from_millis(50), &StageOutcome::Completed);
        rec.job_finished(job, JobState::Succeeded, None, Duration::from_millis(90));

        let snap = rec.snapshot();
        let infer = &snap.stages[&Stage::Infer];
        assert_eq!(infer.attempts(), 2);
        assert_eq!(infer.retried, 1);
        assert_eq!(infer.total_duration_ms, 80);
        assert_eq!(infer.max_duration_ms, 50);
        assert_eq!(snap.jobs_by_state["succeeded"], 1);
        assert_eq!(snap.errors_by_code["timeout"], 1);
    }

    #[test]
    fn fanout_reaches_every_recorder() {
        let a = Arc::new(InMemoryRecorder::new());
        let b = Arc::new(InMemoryRecorder::new());
        let fanout = FanoutRecorder::new()
            .with(Arc::new(a.clone()))
            .with(Arc::new(b.clone()))
            .with(Arc::new(TracingRecorder));

        fanout.job_finished(JobId::new(), JobState::DeadLettered, Some("transient_exhausted"), Duration::ZERO);
        assert_eq!(a.snapshot().jobs_by_state["dead_lettered"], 1);
        assert_eq!(b.snapshot().jobs_by_state["dead_lettered"], 1);
    }

    #[test]
    fn outcome_serializes_with_tag() {
        let json = serde_json::to_value(StageOutcome::Failed {
            kind: ErrorKind::Fatal,
            error_code: "schema_violation".into(),
        })
        .unwrap();
        assert_eq!(json["outcome"], "failed");
        assert_eq!(json["kind"], "fatal");
    }
}
