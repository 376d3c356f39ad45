//! Caller-facing facade: submit, poll, fetch output, and the operator
//! actions (cancel, sign-off, DLQ replay).

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;

use clinflow_core::{
    Artifact, Case, CaseId, Citation, DomainError, JobId, JobState, PatientRef, QcVerdict, Stage,
};
use clinflow_providers::{InferenceOutput, InferenceProvider, PingStatus, ProviderMode, ReportDocument};

use crate::jobs::{
    DeadLetterEntry, DeadLetterFilter, IdempotencyKey, IdempotencyLedger, Job, JobStats, JobStore,
    JobStoreError, NewSubmission, SignOff,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub patient_ref: String,
    #[serde(default)]
    pub notes: String,
    /// Image object references (paths or URIs).
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitReceipt {
    pub job_id: JobId,
    pub case_id: CaseId,
    pub idempotency_key: String,
    /// False when the key was already bound and the existing job is returned.
    pub created: bool,
}

/// Status reported to callers.
///
/// Differs from the internal state only for review-required jobs, which
/// stay `awaiting_review` until a reviewer signs off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallerStatus {
    Pending,
    Running,
    AwaitingReview,
    Succeeded,
    Failed,
    DeadLettered,
}

impl CallerStatus {
    pub fn of(job: &Job, signed_off: bool) -> Self {
        match job.state {
            JobState::Queued => CallerStatus::Pending,
            JobState::Succeeded if job.review_required && !signed_off => CallerStatus::AwaitingReview,
            JobState::Succeeded => CallerStatus::Succeeded,
            JobState::Failed => CallerStatus::Failed,
            JobState::DeadLettered => CallerStatus::DeadLettered,
            _ => CallerStatus::Running,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CallerStatus::Pending => "pending",
            CallerStatus::Running => "running",
            CallerStatus::AwaitingReview => "awaiting_review",
            CallerStatus::Succeeded => "succeeded",
            CallerStatus::Failed => "failed",
            CallerStatus::DeadLettered => "dead_lettered",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobView {
    pub job_id: JobId,
    pub case_id: CaseId,
    pub caller_status: CallerStatus,
    pub stage: Stage,
    pub retry_count: u32,
    pub error_code: Option<String>,
    pub human_review: bool,
    pub conclusions_suppressed: bool,
    pub review_required: bool,
    pub signed_off: bool,
}

/// Structured result of a terminal job.
///
/// Carries the caller status, never the stored state: a review-required job
/// reads `awaiting_review` here until it is signed off.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputBundle {
    pub job_id: JobId,
    pub case_id: CaseId,
    pub caller_status: CallerStatus,
    pub signed_off: bool,
    pub error_code: Option<String>,
    /// Withheld when QC suppressed automatic conclusions.
    pub inference: Option<InferenceOutput>,
    pub qc: Option<QcVerdict>,
    pub citations: Vec<Citation>,
    pub insufficient_evidence: bool,
    /// Exact context string handed to the inference call.
    pub context: Option<String>,
    pub report: Option<ReportDocument>,
    pub stage_durations_ms: BTreeMap<Stage, u64>,
    pub provider_mode: Option<ProviderMode>,
    pub used_fallback: bool,
    pub model_version: String,
    pub schema_version: String,
    pub conclusions_suppressed: bool,
}

impl OutputBundle {
    pub fn from_job(job: &Job, signed_off: bool) -> Self {
        let retrieval = job.outputs.retrieval.as_ref();
        Self {
            job_id: job.id,
            case_id: job.case_id,
            caller_status: CallerStatus::of(job, signed_off),
            signed_off,
            error_code: job.error_code.clone(),
            inference: if job.conclusions_suppressed {
                None
            } else {
                job.outputs.inference.clone()
            },
            qc: job.outputs.qc.clone(),
            citations: retrieval.map(|r| r.citations.clone()).unwrap_or_default(),
            insufficient_evidence: retrieval.is_some_and(|r| r.insufficient_evidence),
            context: retrieval.map(|r| r.context.clone()),
            report: job.outputs.report.clone(),
            stage_durations_ms: job.stage_durations_ms(),
            provider_mode: job.provider_mode(),
            used_fallback: job.used_fallback(),
            model_version: job.model_version.clone(),
            schema_version: job.schema_version.clone(),
            conclusions_suppressed: job.conclusions_suppressed,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("invalid request: {0}")]
    Validation(#[from] DomainError),
    #[error(transparent)]
    Store(#[from] JobStoreError),
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job {0} is not awaiting review")]
    NotAwaitingReview(JobId),
    #[error("job {0} is not dead-lettered")]
    NotDeadLettered(JobId),
}

/// Entry point for callers (a gateway, the worker binary, tests).
pub struct WorkflowService<S> {
    store: S,
    provider: Arc<dyn InferenceProvider>,
    model_version: String,
}

impl<S> WorkflowService<S>
where
    S: JobStore + IdempotencyLedger,
{
    pub fn new(store: S, provider: Arc<dyn InferenceProvider>, model_version: impl Into<String>) -> Self {
        Self {
            store,
            provider,
            model_version: model_version.into(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Create a job for new case inputs, or return the job already bound to
    /// the request's idempotency key.
    pub fn submit(&self, request: SubmitRequest) -> Result<SubmitReceipt, ServiceError> {
        let key = match request.idempotency_key {
            Some(key) => IdempotencyKey::parse(key)?,
            None => IdempotencyKey::generate(),
        };

        if let Some(existing) = self.store.lookup(&key)? {
            info!(job_id = %existing.job_id, key = %key, "duplicate submission");
            return Ok(SubmitReceipt {
                job_id: existing.job_id,
                case_id: existing.case_id,
                idempotency_key: key.to_string(),
                created: false,
            });
        }

        let case = Case::open(PatientRef::parse(request.patient_ref)?);
        let mut artifacts: Vec<Artifact> = Artifact::notes(case.id, &request.notes)?.into_iter().collect();
        for image in &request.images {
            artifacts.push(Artifact::image(case.id, image)?);
        }
        let job = Job::new(case.id, key.as_str(), self.model_version.clone());

        let resolution = self.store.resolve(&key, NewSubmission { case, artifacts, job })?;
        info!(
            job_id = %resolution.job_id,
            case_id = %resolution.case_id,
            key = %key,
            created = resolution.created,
            "submission resolved"
        );
        Ok(SubmitReceipt {
            job_id: resolution.job_id,
            case_id: resolution.case_id,
            idempotency_key: key.to_string(),
            created: resolution.created,
        })
    }

    pub fn poll(&self, job_id: JobId) -> Result<JobView, ServiceError> {
        let job = self.job(job_id)?;
        let signed_off = !self.store.sign_offs(job_id)?.is_empty();
        Ok(JobView {
            job_id: job.id,
            case_id: job.case_id,
            caller_status: CallerStatus::of(&job, signed_off),
            stage: job.stage,
            retry_count: job.retry_count,
            error_code: job.error_code.clone(),
            human_review: job.human_review,
            conclusions_suppressed: job.conclusions_suppressed,
            review_required: job.review_required,
            signed_off,
        })
    }

    /// Output bundle of a terminal job; `None` while the job is in flight.
    pub fn output(&self, job_id: JobId) -> Result<Option<OutputBundle>, ServiceError> {
        let job = self.job(job_id)?;
        if !job.is_terminal() {
            return Ok(None);
        }
        let signed_off = !self.store.sign_offs(job_id)?.is_empty();
        Ok(Some(OutputBundle::from_job(&job, signed_off)))
    }

    /// Request cooperative cancellation; takes effect before the next stage.
    pub fn cancel(&self, job_id: JobId) -> Result<JobView, ServiceError> {
        match self.store.request_cancel(job_id) {
            Ok(_) => {}
            Err(JobStoreError::NotFound(id)) => return Err(ServiceError::NotFound(id)),
            Err(e) => return Err(e.into()),
        }
        info!(job_id = %job_id, "cancellation requested");
        self.poll(job_id)
    }

    /// Record a reviewer's sign-off on a review-required job.
    pub fn sign_off(&self, job_id: JobId, reviewer: &str) -> Result<JobView, ServiceError> {
        let reviewer = reviewer.trim();
        if reviewer.is_empty() {
            return Err(DomainError::validation("reviewer must not be empty").into());
        }
        let job = self.job(job_id)?;
        let signed_off = !self.store.sign_offs(job_id)?.is_empty();
        if CallerStatus::of(&job, signed_off) != CallerStatus::AwaitingReview {
            return Err(ServiceError::NotAwaitingReview(job_id));
        }

        match self.store.record_sign_off(SignOff {
            job_id,
            reviewer: reviewer.to_string(),
            signed_at: Utc::now(),
        }) {
            Ok(()) => {}
            Err(JobStoreError::AlreadyExists(_)) => return Err(ServiceError::NotAwaitingReview(job_id)),
            Err(e) => return Err(e.into()),
        }
        info!(job_id = %job_id, reviewer, "review signed off");
        self.poll(job_id)
    }

    /// Enqueue a fresh job for a dead-lettered job's case.
    ///
    /// The DLQ entry and the original job are left as they are.
    pub fn replay(&self, job_id: JobId, operator: &str) -> Result<SubmitReceipt, ServiceError> {
        let operator = operator.trim();
        if operator.is_empty() {
            return Err(DomainError::validation("operator must not be empty").into());
        }
        let entry = self
            .store
            .dead_letter(job_id)?
            .ok_or(ServiceError::NotDeadLettered(job_id))?;

        let replay = Job::replay(&entry.job, operator);
        let receipt = SubmitReceipt {
            job_id: replay.id,
            case_id: replay.case_id,
            idempotency_key: replay.idempotency_key.clone(),
            created: true,
        };
        self.store.enqueue(replay)?;
        info!(
            job_id = %receipt.job_id,
            replay_of = %job_id,
            operator,
            "dead-lettered job replayed"
        );
        Ok(receipt)
    }

    pub fn dead_letters(&self, filter: &DeadLetterFilter) -> Result<Vec<DeadLetterEntry>, ServiceError> {
        Ok(self.store.list_dead_letters(filter)?)
    }

    pub fn ping_provider(&self) -> PingStatus {
        self.provider.ping()
    }

    pub fn stats(&self) -> Result<JobStats, ServiceError> {
        Ok(self.store.stats()?)
    }

    fn job(&self, job_id: JobId) -> Result<Job, ServiceError> {
        self.store.get(job_id)?.ok_or(ServiceError::NotFound(job_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::InMemoryJobStore;
    use clinflow_providers::MockProvider;

    fn service() -> WorkflowService<Arc<InMemoryJobStore>> {
        WorkflowService::new(InMemoryJobStore::arc(), Arc::new(MockProvider::new()), "medgemma-4b-it")
    }

    fn request(key: Option<&str>) -> SubmitRequest {
        SubmitRequest {
            patient_ref: "anon-001".into(),
            notes: "8mm nodule, follow-up".into(),
            images: vec!["scans/ct-01.dcm".into()],
            idempotency_key: key.map(str::to_string),
        }
    }

    #[test]
    fn submit_creates_case_artifacts_and_pending_job() {
        let svc = service();
        let receipt = svc.submit(request(Some("submit-key-1"))).unwrap();
        assert!(receipt.created);

        let view = svc.poll(receipt.job_id).unwrap();
        assert_eq!(view.caller_status, CallerStatus::Pending);
        assert_eq!(svc.store().artifacts(receipt.case_id).unwrap().len(), 2);
        assert!(svc.output(receipt.job_id).unwrap().is_none());
    }

    #[test]
    fn missing_key_is_generated() {
        let svc = service();
        let receipt = svc.submit(request(None)).unwrap();
        assert!(receipt.idempotency_key.starts_with("workflow-"));
    }

    #[test]
    fn invalid_inputs_are_rejected() {
        let svc = service();
        assert!(matches!(
            svc.submit(request(Some("two words"))),
            Err(ServiceError::Store(JobStoreError::InvalidKey(_)))
        ));
        let mut bad = request(Some("submit-key-2"));
        bad.patient_ref = String::new();
        assert!(matches!(svc.submit(bad), Err(ServiceError::Validation(_))));
        assert_eq!(svc.stats().unwrap().cases, 0);
    }

    #[test]
    fn unknown_job_is_not_found() {
        let svc = service();
        let id = JobId::new();
        assert!(matches!(svc.poll(id), Err(ServiceError::NotFound(_))));
        assert!(matches!(svc.cancel(id), Err(ServiceError::NotFound(_))));
        assert!(matches!(svc.replay(id, "ops"), Err(ServiceError::NotDeadLettered(_))));
    }

    #[test]
    fn sign_off_requires_awaiting_review() {
        let svc = service();
        let receipt = svc.submit(request(Some("submit-key-3"))).unwrap();
        assert!(matches!(
            svc.sign_off(receipt.job_id, "dr-who"),
            Err(ServiceError::NotAwaitingReview(_))
        ));
        assert!(matches!(
            svc.sign_off(receipt.job_id, "  "),
            Err(ServiceError::Validation(_))
        ));
    }

    #[test]
    fn ping_reports_mock_mode() {
        let status = service().ping_provider();
        assert!(status.reachable);
        assert_eq!(status.mode, ProviderMode::Mock);
    }
}
