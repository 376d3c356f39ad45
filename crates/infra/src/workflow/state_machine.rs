//! Advances one job by one stage per step.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, info, warn};

use clinflow_core::{Artifact, Case, JobId, JobState, Stage};
use clinflow_observability::{StageOutcome, TracingRecorder, WorkflowRecorder};

use crate::jobs::{
    Decision, Failure, Job, JobStore, JobStoreError, RetryController, StageRecord, Transition,
    TRANSIENT_EXHAUSTED,
};
use crate::stages::{StageContext, StageError, StageSet};

pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(300);

/// What one step did to its job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// The stage succeeded and the job moved one state forward.
    Advanced,
    RetryScheduled { delay: Duration },
    Failed { error_code: String },
    DeadLettered { error_code: String },
    /// Cancellation was requested; no stage ran.
    Cancelled,
    /// Another worker took the job over; nothing was written.
    LeaseLost,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepReport {
    pub job_id: JobId,
    pub stage: Stage,
    /// State after the step.
    pub state: JobState,
    pub outcome: StepOutcome,
}

impl StepReport {
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Drives jobs through the pipeline.
///
/// Each [`step`](Self::step) claims the oldest runnable job, runs the
/// executor for its current state, asks the retry controller what a failure
/// means, and commits the result under the claim's lease.
pub struct StateMachine<S> {
    store: S,
    stages: StageSet,
    retry: RetryController,
    recorder: Arc<dyn WorkflowRecorder>,
    lease_ttl: Duration,
}

impl<S: JobStore> StateMachine<S> {
    pub fn new(store: S, stages: StageSet, retry: RetryController) -> Self {
        Self {
            store,
            stages,
            retry,
            recorder: Arc::new(TracingRecorder),
            lease_ttl: DEFAULT_LEASE_TTL,
        }
    }

    pub fn with_recorder(mut self, recorder: Arc<dyn WorkflowRecorder>) -> Self {
        self.recorder = recorder;
        self
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Run one stage of one job. `Ok(None)` means nothing was runnable.
    pub fn step(&self, worker_id: &str) -> Result<Option<StepReport>, JobStoreError> {
        let Some(job) = self.store.claim_next(worker_id, self.lease_ttl)? else {
            return Ok(None);
        };
        let lease_id = job
            .lease
            .as_ref()
            .map(|l| l.lease_id)
            .ok_or_else(|| JobStoreError::Storage(format!("claimed job {} has no lease", job.id)))?;
        let stage = job.state.stage().ok_or_else(|| {
            JobStoreError::InvalidTransition(format!("claimed job {} is {}", job.id, job.state))
        })?;

        debug!(worker = worker_id, job_id = %job.id, stage = %stage, "job claimed");

        if job.cancel_requested {
            let transition = Transition::Fail {
                record: None,
                failure: Failure::cancelled(),
            };
            return self.commit(&job, lease_id, stage, transition, StepOutcome::Cancelled, None);
        }

        let (case, artifacts, history) = match self.load_inputs(&job, stage) {
            Ok(inputs) => inputs,
            Err(e) => {
                let release = Transition::Release {
                    next_attempt_at: Utc::now(),
                };
                if let Err(release_err) = self.store.commit(job.id, lease_id, release) {
                    warn!(job_id = %job.id, error = %release_err, "failed to release lease");
                }
                return Err(e);
            }
        };

        let executor = self.stages.for_stage(stage);
        let started_at = Utc::now();
        let timer = Instant::now();
        let result = executor.execute(&StageContext {
            job: &job,
            case: &case,
            artifacts: &artifacts,
            history: &history,
        });
        let elapsed = timer.elapsed();
        let finished_at = Utc::now();
        let attempt = job.next_attempt();

        let (transition, outcome, recorded) = match result {
            Ok(output) => (
                Transition::Advance {
                    record: StageRecord::success(stage, attempt, started_at, finished_at),
                    output,
                },
                StepOutcome::Advanced,
                StageOutcome::Completed,
            ),
            Err(err) => {
                let record = StageRecord::failure(
                    stage,
                    attempt,
                    started_at,
                    finished_at,
                    err.kind,
                    err.code.clone(),
                    err.message.clone(),
                );
                self.route_failure(&job, stage, err, record)
            }
        };

        self.commit(&job, lease_id, stage, transition, outcome, Some((elapsed, recorded)))
    }

    /// Step until nothing is runnable. Returns the number of steps taken.
    pub fn drain(&self, worker_id: &str) -> Result<usize, JobStoreError> {
        let mut steps = 0;
        while self.step(worker_id)?.is_some() {
            steps += 1;
        }
        Ok(steps)
    }

    /// Case, artifacts and, for QC, findings of the case's other jobs.
    fn load_inputs(
        &self,
        job: &Job,
        stage: Stage,
    ) -> Result<(Case, Vec<Artifact>, Vec<String>), JobStoreError> {
        let case = self
            .store
            .get_case(job.case_id)?
            .ok_or_else(|| JobStoreError::Storage(format!("job {} has no case {}", job.id, job.case_id)))?;
        let artifacts = self.store.artifacts(job.case_id)?;
        let history = if stage == Stage::Qc {
            self.store
                .case_jobs(job.case_id)?
                .into_iter()
                .filter(|other| other.id != job.id)
                .filter_map(|other| other.outputs.inference)
                .flat_map(|inference| inference.findings)
                .collect()
        } else {
            Vec::new()
        };
        Ok((case, artifacts, history))
    }

    fn route_failure(
        &self,
        job: &Job,
        stage: Stage,
        err: StageError,
        record: StageRecord,
    ) -> (Transition, StepOutcome, StageOutcome) {
        let failed = |error_code: String| StageOutcome::Failed {
            kind: err.kind,
            error_code,
        };

        match self.retry.decide(stage, err.kind, job.retry_count) {
            Decision::Retry { delay } => {
                let next_attempt_at = record.finished_at
                    + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
                (
                    Transition::Retry {
                        record,
                        next_attempt_at,
                    },
                    StepOutcome::RetryScheduled { delay },
                    StageOutcome::Retrying {
                        error_code: err.code.clone(),
                    },
                )
            }
            Decision::Fail => {
                let mut failure = Failure::new(err.code.clone(), err.message.clone()).for_review();
                if let Some(verdict) = err.verdict.clone() {
                    failure = failure.with_blocked_verdict(verdict);
                }
                (
                    Transition::Fail {
                        record: Some(record),
                        failure,
                    },
                    StepOutcome::Failed {
                        error_code: err.code.clone(),
                    },
                    failed(err.code.clone()),
                )
            }
            Decision::DeadLetter { exhausted } => {
                let (code, message) = if exhausted {
                    (
                        TRANSIENT_EXHAUSTED.to_string(),
                        format!(
                            "{stage} failed after {} retries: {}",
                            job.retry_count, err.message
                        ),
                    )
                } else {
                    (err.code.clone(), err.message.clone())
                };
                (
                    Transition::DeadLetter {
                        record,
                        failure: Failure::new(code.clone(), message),
                    },
                    StepOutcome::DeadLettered {
                        error_code: code.clone(),
                    },
                    failed(code),
                )
            }
        }
    }

    fn commit(
        &self,
        job: &Job,
        lease_id: clinflow_core::LeaseId,
        stage: Stage,
        transition: Transition,
        outcome: StepOutcome,
        attempt: Option<(Duration, StageOutcome)>,
    ) -> Result<Option<StepReport>, JobStoreError> {
        let name = transition.name();
        let committed = match self.store.commit(job.id, lease_id, transition) {
            Ok(committed) => committed,
            Err(JobStoreError::LeaseLost(job_id)) => {
                warn!(job_id = %job_id, stage = %stage, transition = name, "lease lost before commit");
                return Ok(Some(StepReport {
                    job_id,
                    stage,
                    state: job.state,
                    outcome: StepOutcome::LeaseLost,
                }));
            }
            Err(e) => return Err(e),
        };

        if let Some((elapsed, stage_outcome)) = &attempt {
            self.recorder
                .stage_finished(committed.id, stage, *elapsed, stage_outcome);
        }

        debug!(
            job_id = %committed.id,
            stage = %stage,
            state = %committed.state,
            transition = name,
            retry_count = committed.retry_count,
            "transition committed"
        );

        if committed.is_terminal() {
            let total = (committed.updated_at - committed.created_at)
                .to_std()
                .unwrap_or_default();
            self.recorder.job_finished(
                committed.id,
                committed.state,
                committed.error_code.as_deref(),
                total,
            );
            info!(
                job_id = %committed.id,
                case_id = %committed.case_id,
                state = %committed.state,
                error_code = committed.error_code.as_deref().unwrap_or(""),
                "job reached terminal state"
            );
        }

        Ok(Some(StepReport {
            job_id: committed.id,
            stage,
            state: committed.state,
            outcome,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{
        DeadLetterEntry, DeadLetterFilter, FixedJitter, IdempotencyKey, IdempotencyLedger,
        InMemoryJobStore, JobStats, NewSubmission, RetryPolicy, SignOff, StagePolicies,
    };
    use crate::stages::StageExecutor;
    use clinflow_core::{ErrorKind, PatientRef};
    use clinflow_observability::InMemoryRecorder;
    use clinflow_providers::{InMemoryKnowledgeBase, MockProvider};

    struct AlwaysFails(Stage, ErrorKind);

    impl StageExecutor for AlwaysFails {
        fn stage(&self) -> Stage {
            self.0
        }

        fn execute(&self, _: &StageContext<'_>) -> Result<crate::jobs::StageOutput, StageError> {
            Err(StageError::new(self.1, "boom", "always fails"))
        }
    }

    fn machine(store: Arc<InMemoryJobStore>) -> StateMachine<Arc<InMemoryJobStore>> {
        let stages = StageSet::new(
            Arc::new(InMemoryKnowledgeBase::new()),
            Arc::new(MockProvider::new()),
            3,
            1.0,
        );
        let policies = StagePolicies::with_delays(Duration::ZERO, Duration::ZERO);
        let retry = RetryController::new(policies).with_jitter(Arc::new(FixedJitter(1.0)));
        StateMachine::new(store, stages, retry)
    }

    fn submit(store: &InMemoryJobStore, notes: &str) -> JobId {
        let key = IdempotencyKey::generate();
        let case = Case::open(PatientRef::parse("anon-001").unwrap());
        let artifacts = Artifact::notes(case.id, notes).unwrap().into_iter().collect();
        let job = Job::new(case.id, key.as_str(), "medgemma-4b-it");
        store
            .resolve(&key, NewSubmission { case, artifacts, job })
            .unwrap()
            .job_id
    }

    #[test]
    fn five_steps_take_a_job_to_succeeded() {
        let store = InMemoryJobStore::arc();
        let job_id = submit(&store, "Follow-up CT: 8mm nodule in right upper lobe.");
        let recorder = Arc::new(InMemoryRecorder::new());
        let sm = machine(store.clone()).with_recorder(recorder.clone());

        let states: Vec<JobState> = (0..5)
            .map(|_| sm.step("w1").unwrap().unwrap().state)
            .collect();
        assert_eq!(
            states,
            vec![
                JobState::Retrieving,
                JobState::Inferring,
                JobState::QcChecking,
                JobState::Composing,
                JobState::Succeeded,
            ]
        );
        assert!(sm.step("w1").unwrap().is_none());

        let job = store.get(job_id).unwrap().unwrap();
        assert_eq!(job.history.len(), 5);
        assert!(job.outputs.report.is_some());
        let snapshot = recorder.snapshot();
        assert_eq!(snapshot.jobs_by_state.get("succeeded"), Some(&1));
    }

    #[test]
    fn fatal_failure_dead_letters_immediately() {
        let store = InMemoryJobStore::arc();
        let job_id = submit(&store, "nodule");
        let sm = machine(store.clone());
        let sm = StateMachine {
            stages: sm.stages.clone().with_executor(Arc::new(AlwaysFails(Stage::Preprocess, ErrorKind::Fatal))),
            ..sm
        };

        let report = sm.step("w1").unwrap().unwrap();
        assert_eq!(
            report.outcome,
            StepOutcome::DeadLettered {
                error_code: "boom".into()
            }
        );
        assert_eq!(report.state, JobState::DeadLettered);
        assert!(store.dead_letter(job_id).unwrap().is_some());
    }

    #[test]
    fn transient_failure_retries_then_exhausts() {
        let store = InMemoryJobStore::arc();
        let job_id = submit(&store, "nodule");
        let sm = machine(store.clone());
        let mut policies = *sm.retry.policies();
        *policies.for_stage_mut(Stage::Preprocess) = RetryPolicy::exponential(1, Duration::ZERO, Duration::ZERO);
        let sm = StateMachine {
            stages: sm.stages.clone().with_executor(Arc::new(AlwaysFails(Stage::Preprocess, ErrorKind::Transient))),
            retry: RetryController::new(policies),
            ..sm
        };

        let first = sm.step("w1").unwrap().unwrap();
        assert!(matches!(first.outcome, StepOutcome::RetryScheduled { .. }));
        let second = sm.step("w1").unwrap().unwrap();
        assert_eq!(
            second.outcome,
            StepOutcome::DeadLettered {
                error_code: TRANSIENT_EXHAUSTED.into()
            }
        );
        let job = store.get(job_id).unwrap().unwrap();
        assert_eq!(job.retry_count, 1);
        assert_eq!(job.history.len(), 2);
    }

    #[test]
    fn cancelled_job_runs_no_stage() {
        let store = InMemoryJobStore::arc();
        let job_id = submit(&store, "nodule");
        store.request_cancel(job_id).unwrap();
        let sm = machine(store.clone());

        let report = sm.step("w1").unwrap().unwrap();
        assert_eq!(report.outcome, StepOutcome::Cancelled);
        let job = store.get(job_id).unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.error_code.as_deref(), Some(crate::jobs::CANCELLED));
        assert!(job.history.is_empty());
    }

    /// Delegates to the in-memory store but cannot read cases.
    struct CaseReadFails(Arc<InMemoryJobStore>);

    impl JobStore for CaseReadFails {
        fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
            self.0.get(job_id)
        }

        fn get_case(&self, _: clinflow_core::CaseId) -> Result<Option<Case>, JobStoreError> {
            Err(JobStoreError::Storage("connection reset".into()))
        }

        fn artifacts(&self, case_id: clinflow_core::CaseId) -> Result<Vec<Artifact>, JobStoreError> {
            self.0.artifacts(case_id)
        }

        fn case_jobs(&self, case_id: clinflow_core::CaseId) -> Result<Vec<Job>, JobStoreError> {
            self.0.case_jobs(case_id)
        }

        fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError> {
            self.0.enqueue(job)
        }

        fn claim_next(&self, worker_id: &str, ttl: Duration) -> Result<Option<Job>, JobStoreError> {
            self.0.claim_next(worker_id, ttl)
        }

        fn commit(
            &self,
            job_id: JobId,
            lease_id: clinflow_core::LeaseId,
            transition: Transition,
        ) -> Result<Job, JobStoreError> {
            self.0.commit(job_id, lease_id, transition)
        }

        fn request_cancel(&self, job_id: JobId) -> Result<Job, JobStoreError> {
            self.0.request_cancel(job_id)
        }

        fn record_sign_off(&self, sign_off: SignOff) -> Result<(), JobStoreError> {
            self.0.record_sign_off(sign_off)
        }

        fn sign_offs(&self, job_id: JobId) -> Result<Vec<SignOff>, JobStoreError> {
            self.0.sign_offs(job_id)
        }

        fn dead_letter(&self, job_id: JobId) -> Result<Option<DeadLetterEntry>, JobStoreError> {
            self.0.dead_letter(job_id)
        }

        fn list_dead_letters(&self, filter: &DeadLetterFilter) -> Result<Vec<DeadLetterEntry>, JobStoreError> {
            self.0.list_dead_letters(filter)
        }

        fn stats(&self) -> Result<JobStats, JobStoreError> {
            self.0.stats()
        }
    }

    #[test]
    fn failed_input_load_releases_the_lease() {
        let store = InMemoryJobStore::arc();
        let job_id = submit(&store, "nodule");
        let stages = machine(store.clone()).stages.clone();
        let sm = StateMachine::new(
            CaseReadFails(store.clone()),
            stages,
            RetryController::new(StagePolicies::default()),
        );

        let err = sm.step("w1").unwrap_err();
        assert!(matches!(err, JobStoreError::Storage(_)));

        let job = store.get(job_id).unwrap().unwrap();
        assert!(job.lease.is_none());
        assert_eq!(job.state, JobState::Preprocessing);
        assert_eq!(job.retry_count, 0);
        assert!(job.history.is_empty());

        // Another worker picks it up straight away.
        assert!(store.claim_next("w2", DEFAULT_LEASE_TTL).unwrap().is_some());
    }
}
