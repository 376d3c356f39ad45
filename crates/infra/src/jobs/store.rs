//! Job storage implementations.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;

use clinflow_core::{Artifact, Case, CaseId, CaseStatus, JobId, JobState, LeaseId};

use super::dlq::DeadLetterFilter;
use super::ledger::{IdempotencyKey, IdempotencyLedger, NewSubmission, Resolution};
use super::types::{DeadLetterEntry, Job, SignOff, Transition, apply_transition};

/// Job store abstraction.
///
/// Every mutation of a job's state, stage or retry count goes through
/// [`JobStore::commit`] under a lease, as one atomic write.
pub trait JobStore: Send + Sync {
    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    fn get_case(&self, case_id: CaseId) -> Result<Option<Case>, JobStoreError>;

    fn artifacts(&self, case_id: CaseId) -> Result<Vec<Artifact>, JobStoreError>;

    /// Every job of a case, oldest first.
    fn case_jobs(&self, case_id: CaseId) -> Result<Vec<Job>, JobStoreError>;

    /// Insert a job for an existing case, binding its key in the ledger.
    fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError>;

    /// Lease the oldest runnable job.
    ///
    /// Skips terminal jobs, jobs under a live lease and jobs whose backoff has
    /// not elapsed. Returns `None` if nothing is runnable.
    fn claim_next(&self, worker_id: &str, ttl: Duration) -> Result<Option<Job>, JobStoreError>;

    /// Apply `transition` if `lease_id` is the job's current lease.
    fn commit(&self, job_id: JobId, lease_id: LeaseId, transition: Transition) -> Result<Job, JobStoreError>;

    /// Flag a job for cooperative cancellation.
    fn request_cancel(&self, job_id: JobId) -> Result<Job, JobStoreError>;

    /// Record the job's sign-off. A job takes one sign-off; a second one is
    /// rejected with `AlreadyExists` and nothing is written.
    fn record_sign_off(&self, sign_off: SignOff) -> Result<(), JobStoreError>;

    fn sign_offs(&self, job_id: JobId) -> Result<Vec<SignOff>, JobStoreError>;

    fn dead_letter(&self, job_id: JobId) -> Result<Option<DeadLetterEntry>, JobStoreError>;

    fn list_dead_letters(&self, filter: &DeadLetterFilter) -> Result<Vec<DeadLetterEntry>, JobStoreError>;

    fn stats(&self) -> Result<JobStats, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(String),
    #[error("lease lost on job {0}")]
    LeaseLost(JobId),
    #[error("job {0} is terminal")]
    Terminal(JobId),
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
    #[error("invalid idempotency key: {0}")]
    InvalidKey(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Job statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub queued: usize,
    pub in_progress: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub dead_lettered: usize,
    pub dead_letter_entries: usize,
    pub cases: usize,
}

impl JobStats {
    pub(crate) fn count(&mut self, state: JobState, n: usize) {
        match state {
            JobState::Queued => self.queued += n,
            JobState::Succeeded => self.succeeded += n,
            JobState::Failed => self.failed += n,
            JobState::DeadLettered => self.dead_lettered += n,
            _ => self.in_progress += n,
        }
    }
}

#[derive(Debug, Default)]
struct Tables {
    jobs: HashMap<JobId, Job>,
    cases: HashMap<CaseId, Case>,
    artifacts: HashMap<CaseId, Vec<Artifact>>,
    ledger: HashMap<String, JobId>,
    dead_letters: Vec<DeadLetterEntry>,
    sign_offs: HashMap<JobId, Vec<SignOff>>,
}

impl Tables {
    fn set_case_status(&mut self, case_id: CaseId, status: CaseStatus) {
        if let Some(case) = self.cases.get_mut(&case_id) {
            *case = case.with_status(status);
        }
    }
}

/// In-memory store for tests/dev.
///
/// All tables sit behind one lock, so ledger resolution, claims and commits
/// are each a single critical section.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    tables: RwLock<Tables>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>, JobStoreError> {
        self.tables
            .read()
            .map_err(|_| JobStoreError::Storage("job store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>, JobStoreError> {
        self.tables
            .write()
            .map_err(|_| JobStoreError::Storage("job store lock poisoned".to_string()))
    }
}

impl JobStore for InMemoryJobStore {
    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.read()?.jobs.get(&job_id).cloned())
    }

    fn get_case(&self, case_id: CaseId) -> Result<Option<Case>, JobStoreError> {
        Ok(self.read()?.cases.get(&case_id).cloned())
    }

    fn artifacts(&self, case_id: CaseId) -> Result<Vec<Artifact>, JobStoreError> {
        Ok(self.read()?.artifacts.get(&case_id).cloned().unwrap_or_default())
    }

    fn case_jobs(&self, case_id: CaseId) -> Result<Vec<Job>, JobStoreError> {
        let mut jobs: Vec<Job> = self
            .read()?
            .jobs
            .values()
            .filter(|j| j.case_id == case_id)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| (j.created_at, j.id));
        Ok(jobs)
    }

    fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError> {
        let mut t = self.write()?;
        if !t.cases.contains_key(&job.case_id) {
            return Err(JobStoreError::Storage(format!("unknown case {}", job.case_id)));
        }
        if t.jobs.contains_key(&job.id) || t.ledger.contains_key(&job.idempotency_key) {
            return Err(JobStoreError::AlreadyExists(job.idempotency_key));
        }
        let id = job.id;
        t.ledger.insert(job.idempotency_key.clone(), id);
        t.set_case_status(job.case_id, CaseStatus::Open);
        t.jobs.insert(id, job);
        Ok(id)
    }

    fn claim_next(&self, worker_id: &str, ttl: Duration) -> Result<Option<Job>, JobStoreError> {
        let mut t = self.write()?;
        let now = Utc::now();

        let next = t
            .jobs
            .values()
            .filter(|j| j.is_runnable(now))
            .min_by_key(|j| (j.created_at, j.id))
            .map(|j| j.id);

        let Some(job_id) = next else {
            return Ok(None);
        };
        let Some(job) = t.jobs.get_mut(&job_id) else {
            return Ok(None);
        };
        job.grant_lease(worker_id, ttl, now)?;
        Ok(Some(job.clone()))
    }

    fn commit(&self, job_id: JobId, lease_id: LeaseId, transition: Transition) -> Result<Job, JobStoreError> {
        let mut t = self.write()?;
        let mut job = t
            .jobs
            .get(&job_id)
            .cloned()
            .ok_or(JobStoreError::NotFound(job_id))?;

        let dead_letter = apply_transition(&mut job, lease_id, transition, Utc::now())?;

        if let Some(status) = job.case_status() {
            t.set_case_status(job.case_id, status);
        }
        if let Some(entry) = dead_letter {
            t.dead_letters.push(entry);
        }
        t.jobs.insert(job_id, job.clone());
        Ok(job)
    }

    fn request_cancel(&self, job_id: JobId) -> Result<Job, JobStoreError> {
        let mut t = self.write()?;
        let job = t.jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
        if job.is_terminal() {
            return Err(JobStoreError::Terminal(job_id));
        }
        job.cancel_requested = true;
        job.updated_at = Utc::now();
        Ok(job.clone())
    }

    fn record_sign_off(&self, sign_off: SignOff) -> Result<(), JobStoreError> {
        let mut t = self.write()?;
        if !t.jobs.contains_key(&sign_off.job_id) {
            return Err(JobStoreError::NotFound(sign_off.job_id));
        }
        let entries = t.sign_offs.entry(sign_off.job_id).or_default();
        if !entries.is_empty() {
            return Err(JobStoreError::AlreadyExists(format!("sign-off for job {}", sign_off.job_id)));
        }
        entries.push(sign_off);
        Ok(())
    }

    fn sign_offs(&self, job_id: JobId) -> Result<Vec<SignOff>, JobStoreError> {
        Ok(self.read()?.sign_offs.get(&job_id).cloned().unwrap_or_default())
    }

    fn dead_letter(&self, job_id: JobId) -> Result<Option<DeadLetterEntry>, JobStoreError> {
        Ok(self
            .read()?
            .dead_letters
            .iter()
            .find(|e| e.job.id == job_id)
            .cloned())
    }

    fn list_dead_letters(&self, filter: &DeadLetterFilter) -> Result<Vec<DeadLetterEntry>, JobStoreError> {
        Ok(filter.apply(&self.read()?.dead_letters))
    }

    fn stats(&self) -> Result<JobStats, JobStoreError> {
        let t = self.read()?;
        let mut stats = JobStats {
            dead_letter_entries: t.dead_letters.len(),
            cases: t.cases.len(),
            ..JobStats::default()
        };
        for job in t.jobs.values() {
            stats.count(job.state, 1);
        }
        Ok(stats)
    }
}

impl IdempotencyLedger for InMemoryJobStore {
    fn resolve(&self, key: &IdempotencyKey, submission: NewSubmission) -> Result<Resolution, JobStoreError> {
        submission.validate(key)?;
        let mut t = self.write()?;

        if let Some(job_id) = t.ledger.get(key.as_str()).copied() {
            let job = t.jobs.get(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
            return Ok(Resolution {
                job_id,
                case_id: job.case_id,
                created: false,
            });
        }

        let NewSubmission { case, artifacts, job } = submission;
        let resolution = Resolution {
            job_id: job.id,
            case_id: case.id,
            created: true,
        };
        t.ledger.insert(key.as_str().to_string(), job.id);
        t.artifacts.insert(case.id, artifacts);
        t.cases.insert(case.id, case);
        t.jobs.insert(job.id, job);
        Ok(resolution)
    }

    fn lookup(&self, key: &IdempotencyKey) -> Result<Option<Resolution>, JobStoreError> {
        let t = self.read()?;
        Ok(t.ledger.get(key.as_str()).and_then(|id| {
            t.jobs.get(id).map(|job| Resolution {
                job_id: job.id,
                case_id: job.case_id,
                created: false,
            })
        }))
    }
}

impl JobStore for Arc<InMemoryJobStore> {
    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get(job_id)
    }

    fn get_case(&self, case_id: CaseId) -> Result<Option<Case>, JobStoreError> {
        (**self).get_case(case_id)
    }

    fn artifacts(&self, case_id: CaseId) -> Result<Vec<Artifact>, JobStoreError> {
        (**self).artifacts(case_id)
    }

    fn case_jobs(&self, case_id: CaseId) -> Result<Vec<Job>, JobStoreError> {
        (**self).case_jobs(case_id)
    }

    fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError> {
        (**self).enqueue(job)
    }

    fn claim_next(&self, worker_id: &str, ttl: Duration) -> Result<Option<Job>, JobStoreError> {
        (**self).claim_next(worker_id, ttl)
    }

    fn commit(&self, job_id: JobId, lease_id: LeaseId, transition: Transition) -> Result<Job, JobStoreError> {
        (**self).commit(job_id, lease_id, transition)
    }

    fn request_cancel(&self, job_id: JobId) -> Result<Job, JobStoreError> {
        (**self).request_cancel(job_id)
    }

    fn record_sign_off(&self, sign_off: SignOff) -> Result<(), JobStoreError> {
        (**self).record_sign_off(sign_off)
    }

    fn sign_offs(&self, job_id: JobId) -> Result<Vec<SignOff>, JobStoreError> {
        (**self).sign_offs(job_id)
    }

    fn dead_letter(&self, job_id: JobId) -> Result<Option<DeadLetterEntry>, JobStoreError> {
        (**self).dead_letter(job_id)
    }

    fn list_dead_letters(&self, filter: &DeadLetterFilter) -> Result<Vec<DeadLetterEntry>, JobStoreError> {
        (**self).list_dead_letters(filter)
    }

    fn stats(&self) -> Result<JobStats, JobStoreError> {
        (**self).stats()
    }
}

impl IdempotencyLedger for Arc<InMemoryJobStore> {
    fn resolve(&self, key: &IdempotencyKey, submission: NewSubmission) -> Result<Resolution, JobStoreError> {
        (**self).resolve(key, submission)
    }

    fn lookup(&self, key: &IdempotencyKey) -> Result<Option<Resolution>, JobStoreError> {
        (**self).lookup(key)
    }
}
