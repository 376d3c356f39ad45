//! Job record, leases, stage outputs and the commit transition.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use clinflow_core::{
    CaseId, CaseStatus, Citation, ErrorKind, JobId, JobState, LeaseId, QcVerdict, Stage,
};
use clinflow_providers::{
    InferenceOutput, NormalizedInput, ProviderMode, ReportDocument, RetrievalHit,
    REPORT_SCHEMA_VERSION,
};

use super::store::JobStoreError;

/// Error code recorded when a transient failure outlives the stage's retries.
pub const TRANSIENT_EXHAUSTED: &str = "transient_exhausted";
/// Error code recorded when a job is cancelled between stages.
pub const CANCELLED: &str = "cancelled";
/// Error code recorded when QC blocks the output.
pub const QC_BLOCKED: &str = "qc_blocked";

/// Exclusive, time-bounded claim on a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub worker_id: String,
    pub lease_id: LeaseId,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn grant(worker_id: impl Into<String>, ttl: Duration, now: DateTime<Utc>) -> Self {
        Self {
            worker_id: worker_id.into(),
            lease_id: LeaseId::new(),
            expires_at: now + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(365)),
        }
    }

    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Record of one stage attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: Stage,
    /// 1-based attempt number within the stage.
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub success: bool,
    pub error_kind: Option<ErrorKind>,
    pub error_code: Option<String>,
    pub error: Option<String>,
}

impl StageRecord {
    pub fn success(stage: Stage, attempt: u32, started_at: DateTime<Utc>, finished_at: DateTime<Utc>) -> Self {
        Self {
            stage,
            attempt,
            started_at,
            finished_at,
            duration_ms: (finished_at - started_at).num_milliseconds().max(0) as u64,
            success: true,
            error_kind: None,
            error_code: None,
            error: None,
        }
    }

    pub fn failure(
        stage: Stage,
        attempt: u32,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        kind: ErrorKind,
        code: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            error_kind: Some(kind),
            error_code: Some(code.into()),
            error: Some(error.into()),
            success: false,
            ..Self::success(stage, attempt, started_at, finished_at)
        }
    }
}

/// Output of the Retrieve stage, including the exact context string handed
/// to inference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalOutput {
    pub query: String,
    pub hits: Vec<RetrievalHit>,
    pub citations: Vec<Citation>,
    pub insufficient_evidence: bool,
    pub context: String,
}

/// Typed payload of one successful stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", content = "output", rename_all = "snake_case")]
pub enum StageOutput {
    Preprocess(NormalizedInput),
    Retrieve(RetrievalOutput),
    Infer(InferenceOutput),
    Qc(QcVerdict),
    Compose(ReportDocument),
}

impl StageOutput {
    pub fn stage(&self) -> Stage {
        match self {
            StageOutput::Preprocess(_) => Stage::Preprocess,
            StageOutput::Retrieve(_) => Stage::Retrieve,
            StageOutput::Infer(_) => Stage::Infer,
            StageOutput::Qc(_) => Stage::Qc,
            StageOutput::Compose(_) => Stage::Compose,
        }
    }
}

/// Recorded stage results. Each slot is written once.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageOutputs {
    pub preprocess: Option<NormalizedInput>,
    pub retrieval: Option<RetrievalOutput>,
    pub inference: Option<InferenceOutput>,
    pub qc: Option<QcVerdict>,
    pub report: Option<ReportDocument>,
}

impl StageOutputs {
    fn record(&mut self, output: StageOutput) -> Result<(), String> {
        fn put<T>(slot: &mut Option<T>, value: T, stage: Stage) -> Result<(), String> {
            if slot.is_some() {
                return Err(format!("{stage} output already recorded"));
            }
            *slot = Some(value);
            Ok(())
        }
        match output {
            StageOutput::Preprocess(v) => put(&mut self.preprocess, v, Stage::Preprocess),
            StageOutput::Retrieve(v) => put(&mut self.retrieval, v, Stage::Retrieve),
            StageOutput::Infer(v) => put(&mut self.inference, v, Stage::Infer),
            StageOutput::Qc(v) => put(&mut self.qc, v, Stage::Qc),
            StageOutput::Compose(v) => put(&mut self.report, v, Stage::Compose),
        }
    }
}

/// A workflow job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub case_id: CaseId,
    pub idempotency_key: String,
    pub state: JobState,
    /// Stage of the current (or failing) state.
    pub stage: Stage,
    /// Retries of the current stage; reset when the job advances.
    pub retry_count: u32,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub model_version: String,
    pub schema_version: String,
    pub cancel_requested: bool,
    pub lease: Option<Lease>,
    /// Not claimable before this instant.
    pub next_attempt_at: DateTime<Utc>,
    pub replay_of: Option<JobId>,
    pub replayed_by: Option<String>,
    pub review_required: bool,
    pub human_review: bool,
    pub conclusions_suppressed: bool,
    pub history: Vec<StageRecord>,
    pub outputs: StageOutputs,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(case_id: CaseId, idempotency_key: impl Into<String>, model_version: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            case_id,
            idempotency_key: idempotency_key.into(),
            state: JobState::Queued,
            stage: Stage::Preprocess,
            retry_count: 0,
            error_code: None,
            error_message: None,
            model_version: model_version.into(),
            schema_version: REPORT_SCHEMA_VERSION.to_string(),
            cancel_requested: false,
            lease: None,
            next_attempt_at: now,
            replay_of: None,
            replayed_by: None,
            review_required: false,
            human_review: false,
            conclusions_suppressed: false,
            history: Vec::new(),
            outputs: StageOutputs::default(),
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    /// A fresh job for the same case, created by a DLQ replay.
    pub fn replay(source: &Job, operator: impl Into<String>) -> Self {
        let key = format!("{}:replay:{}", source.idempotency_key, uuid::Uuid::new_v4());
        Self {
            replay_of: Some(source.id),
            replayed_by: Some(operator.into()),
            ..Self::new(source.case_id, key, source.model_version.clone())
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Claimable by a worker at `now`.
    pub fn is_runnable(&self, now: DateTime<Utc>) -> bool {
        !self.is_terminal()
            && self.next_attempt_at <= now
            && self.lease.as_ref().is_none_or(|l| !l.is_live(now))
    }

    /// Grant a lease; a queued job moves to `preprocessing` in the same step.
    pub fn grant_lease(&mut self, worker_id: &str, ttl: Duration, now: DateTime<Utc>) -> Result<Lease, JobStoreError> {
        if self.is_terminal() {
            return Err(JobStoreError::Terminal(self.id));
        }
        if self.state == JobState::Queued {
            let next = JobState::Preprocessing;
            self.state
                .check_transition(next)
                .map_err(|e| JobStoreError::InvalidTransition(e.to_string()))?;
            self.state = next;
            self.stage = Stage::Preprocess;
        }
        let lease = Lease::grant(worker_id, ttl, now);
        self.lease = Some(lease.clone());
        self.updated_at = now;
        Ok(lease)
    }

    /// Stage run attempt number for the next execution (1-based).
    pub fn next_attempt(&self) -> u32 {
        self.retry_count + 1
    }

    /// Summed attempt durations per stage.
    pub fn stage_durations_ms(&self) -> BTreeMap<Stage, u64> {
        let mut out = BTreeMap::new();
        for record in &self.history {
            *out.entry(record.stage).or_insert(0) += record.duration_ms;
        }
        out
    }

    pub fn provider_mode(&self) -> Option<ProviderMode> {
        self.outputs.inference.as_ref().map(|o| o.run_mode)
    }

    pub fn used_fallback(&self) -> bool {
        self.outputs.inference.as_ref().is_some_and(|o| o.used_fallback)
    }

    /// Case status implied by this job once terminal.
    pub fn case_status(&self) -> Option<CaseStatus> {
        match self.state {
            JobState::Succeeded if self.review_required => Some(CaseStatus::NeedsReview),
            JobState::Succeeded => Some(CaseStatus::Closed),
            JobState::Failed if self.human_review => Some(CaseStatus::NeedsReview),
            JobState::Failed | JobState::DeadLettered => Some(CaseStatus::Failed),
            _ => None,
        }
    }
}

/// Why a job stops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    pub code: String,
    pub message: String,
    pub human_review: bool,
    pub conclusions_suppressed: bool,
    /// QC verdict to keep visible when QC blocked the output.
    pub verdict: Option<QcVerdict>,
}

impl Failure {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            human_review: false,
            conclusions_suppressed: false,
            verdict: None,
        }
    }

    pub fn cancelled() -> Self {
        Self::new(CANCELLED, "cancelled before stage execution")
    }

    pub fn for_review(mut self) -> Self {
        self.human_review = true;
        self
    }

    pub fn with_blocked_verdict(mut self, verdict: QcVerdict) -> Self {
        self.conclusions_suppressed = verdict.is_blocked();
        self.human_review = true;
        self.verdict = Some(verdict);
        self
    }
}

/// One atomic state change presented with a lease.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Stage succeeded: record output, move one state forward.
    Advance { record: StageRecord, output: StageOutput },
    /// Transient failure within budget: same state, retry later.
    Retry { record: StageRecord, next_attempt_at: DateTime<Utc> },
    /// Stop in `failed`.
    Fail { record: Option<StageRecord>, failure: Failure },
    /// Stop in `failed`, promoted to `dead_lettered` in the same commit.
    DeadLetter { record: StageRecord, failure: Failure },
    /// Give the lease back without running the stage; nothing else changes.
    Release { next_attempt_at: DateTime<Utc> },
}

impl Transition {
    pub fn name(&self) -> &'static str {
        match self {
            Transition::Advance { .. } => "advance",
            Transition::Retry { .. } => "retry",
            Transition::Fail { .. } => "fail",
            Transition::DeadLetter { .. } => "dead_letter",
            Transition::Release { .. } => "release",
        }
    }
}

/// Entry in the dead-letter queue. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// The job as it was dead-lettered, with its full stage history.
    pub job: Job,
    pub stage: Stage,
    pub error_code: String,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn new(job: Job, reason: String) -> Self {
        Self {
            stage: job.stage,
            error_code: job.error_code.clone().unwrap_or_default(),
            dead_lettered_at: job.finished_at.unwrap_or_else(Utc::now),
            job,
            reason,
        }
    }
}

/// A reviewer's acknowledgement of a review-required job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignOff {
    pub job_id: JobId,
    pub reviewer: String,
    pub signed_at: DateTime<Utc>,
}

/// Apply `transition` to `job` under `lease_id`.
///
/// Works on the caller's copy; stores write the result back only on `Ok`, so
/// a rejected transition writes nothing. Every successful commit releases the
/// lease. Returns the DLQ entry to persist when the job was dead-lettered.
pub fn apply_transition(
    job: &mut Job,
    lease_id: LeaseId,
    transition: Transition,
    now: DateTime<Utc>,
) -> Result<Option<DeadLetterEntry>, JobStoreError> {
    if job.is_terminal() {
        return Err(JobStoreError::Terminal(job.id));
    }
    match &job.lease {
        Some(lease) if lease.lease_id == lease_id => {}
        _ => return Err(JobStoreError::LeaseLost(job.id)),
    }

    let check = |from: JobState, to: JobState| {
        from.check_transition(to)
            .map_err(|e| JobStoreError::InvalidTransition(e.to_string()))
    };

    let mut dead_letter = None;
    match transition {
        Transition::Advance { record, output } => {
            let Some(current) = job.state.stage() else {
                return Err(JobStoreError::InvalidTransition(format!(
                    "{} runs no stage",
                    job.state
                )));
            };
            if output.stage() != current {
                return Err(JobStoreError::InvalidTransition(format!(
                    "{} output committed while {}",
                    output.stage(),
                    job.state
                )));
            }
            let next = job.state.next().ok_or_else(|| {
                JobStoreError::InvalidTransition(format!("{} has no successor", job.state))
            })?;
            check(job.state, next)?;

            if let StageOutput::Qc(verdict) = &output {
                job.review_required |= verdict.requires_review();
            }
            job.outputs
                .record(output)
                .map_err(JobStoreError::InvalidTransition)?;
            job.history.push(record);
            job.state = next;
            if let Some(stage) = next.stage() {
                job.stage = stage;
            }
            job.retry_count = 0;
            job.next_attempt_at = now;
            if next.is_terminal() {
                job.finished_at = Some(now);
            }
        }
        Transition::Retry { record, next_attempt_at } => {
            job.history.push(record);
            job.retry_count += 1;
            job.next_attempt_at = next_attempt_at;
        }
        Transition::Fail { record, failure } => {
            check(job.state, JobState::Failed)?;
            if let Some(record) = record {
                job.history.push(record);
            }
            fail(job, failure, now)?;
        }
        Transition::DeadLetter { record, failure } => {
            check(job.state, JobState::Failed)?;
            check(JobState::Failed, JobState::DeadLettered)?;
            job.history.push(record);
            let reason = failure.message.clone();
            fail(job, failure, now)?;
            job.state = JobState::DeadLettered;
            dead_letter = Some(reason);
        }
        Transition::Release { next_attempt_at } => {
            job.next_attempt_at = next_attempt_at;
        }
    }

    job.lease = None;
    job.updated_at = now;
    Ok(dead_letter.map(|reason| DeadLetterEntry::new(job.clone(), reason)))
}

fn fail(job: &mut Job, failure: Failure, now: DateTime<Utc>) -> Result<(), JobStoreError> {
    job.state = JobState::Failed;
    job.error_code = Some(failure.code);
    job.error_message = Some(failure.message);
    job.human_review |= failure.human_review;
    job.conclusions_suppressed |= failure.conclusions_suppressed;
    if let Some(verdict) = failure.verdict {
        job.outputs
            .record(StageOutput::Qc(verdict))
            .map_err(JobStoreError::InvalidTransition)?;
    }
    job.finished_at = Some(now);
    Ok(())
}
