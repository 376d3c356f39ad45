//! Postgres-backed job store.
//!
//! Persists cases, artifacts, jobs, dead letters and sign-offs. Each job row
//! carries the full [`Job`] as JSONB plus the scalar columns claims filter on.
//!
//! ## Concurrency
//!
//! - Claims use `FOR UPDATE SKIP LOCKED`, so concurrent workers never block
//!   on, or double-lease, the same row
//! - Commits re-read the row `FOR UPDATE` and validate the lease before
//!   writing the job, its case status and any DLQ entry in one transaction
//! - The ledger relies on the unique index over `idempotency_key`
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError |
//! |------------|----------------------|---------------|
//! | Database (unique violation) | `23505` | `AlreadyExists` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / RowNotFound / Other | N/A | `Storage` |
//!
//! ## Runtime
//!
//! [`JobStore`] is synchronous. The store holds a handle to a multi-thread
//! tokio runtime and blocks on it, so it must be called from plain threads
//! (the worker pool), never from inside an async task.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tokio::runtime::Handle;
use tracing::{debug, instrument};

use clinflow_core::{Artifact, Case, CaseId, CaseStatus, JobId, JobState, LeaseId};

use super::dlq::DeadLetterFilter;
use super::ledger::{IdempotencyKey, IdempotencyLedger, NewSubmission, Resolution};
use super::store::{JobStats, JobStore, JobStoreError};
use super::types::{DeadLetterEntry, Job, SignOff, Transition, apply_transition};

const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
    runtime: Handle,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool, runtime: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            runtime,
        }
    }

    /// Create the tables if they do not exist.
    pub async fn migrate(&self) -> Result<(), JobStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    fn block_on<F: Future>(&self, fut: F) -> F::Output {
        self.runtime.block_on(fut)
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, JobStoreError> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))
    }

    pub async fn fetch_job(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query("SELECT body FROM jobs WHERE job_id = $1")
            .bind(*job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("fetch_job", e))?;
        row.map(|r| decode_body(&r, "job")).transpose()
    }

    pub async fn fetch_case(&self, case_id: CaseId) -> Result<Option<Case>, JobStoreError> {
        let row = sqlx::query("SELECT body FROM cases WHERE case_id = $1")
            .bind(*case_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("fetch_case", e))?;
        row.map(|r| decode_body(&r, "case")).transpose()
    }

    pub async fn fetch_artifacts(&self, case_id: CaseId) -> Result<Vec<Artifact>, JobStoreError> {
        let rows = sqlx::query(
            "SELECT body FROM artifacts WHERE case_id = $1 ORDER BY created_at, artifact_id",
        )
        .bind(*case_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fetch_artifacts", e))?;
        rows.iter().map(|r| decode_body(r, "artifact")).collect()
    }

    pub async fn fetch_case_jobs(&self, case_id: CaseId) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query("SELECT body FROM jobs WHERE case_id = $1 ORDER BY created_at, job_id")
            .bind(*case_id.as_uuid())
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("fetch_case_jobs", e))?;
        rows.iter().map(|r| decode_body(r, "job")).collect()
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, case_id = %job.case_id), err)]
    pub async fn insert_job(&self, job: Job) -> Result<JobId, JobStoreError> {
        let mut tx = self.begin().await?;
        let case = lock_case(&mut tx, job.case_id)
            .await?
            .ok_or_else(|| JobStoreError::Storage(format!("unknown case {}", job.case_id)))?;

        insert_job_row(&mut tx, &job).await.map_err(|e| match e {
            JobStoreError::AlreadyExists(_) => JobStoreError::AlreadyExists(job.idempotency_key.clone()),
            other => other,
        })?;
        write_case(&mut tx, &case.with_status(CaseStatus::Open)).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(job.id)
    }

    #[instrument(skip(self, ttl), err)]
    pub async fn claim(&self, worker_id: &str, ttl: Duration) -> Result<Option<Job>, JobStoreError> {
        let now = Utc::now();
        let mut tx = self.begin().await?;

        let row = sqlx::query(
            r#"
            SELECT body
            FROM jobs
            WHERE state NOT IN ('succeeded', 'failed', 'dead_lettered')
                AND next_attempt_at <= $1
                AND (lease_expires_at IS NULL OR lease_expires_at <= $1)
            ORDER BY created_at, job_id
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("claim", e))?;

        let Some(row) = row else {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Ok(None);
        };

        let mut job: Job = decode_body(&row, "job")?;
        job.grant_lease(worker_id, ttl, now)?;
        update_job_row(&mut tx, &job).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        debug!(job_id = %job.id, state = %job.state, "job claimed");
        Ok(Some(job))
    }

    #[instrument(skip(self, transition), fields(transition = transition.name()), err)]
    pub async fn commit_transition(
        &self,
        job_id: JobId,
        lease_id: LeaseId,
        transition: Transition,
    ) -> Result<Job, JobStoreError> {
        let mut tx = self.begin().await?;
        let mut job = lock_job(&mut tx, job_id)
            .await?
            .ok_or(JobStoreError::NotFound(job_id))?;

        // Nothing has been written yet, so dropping `tx` on error rolls back.
        let dead_letter = apply_transition(&mut job, lease_id, transition, Utc::now())?;
        update_job_row(&mut tx, &job).await?;

        if let Some(status) = job.case_status() {
            if let Some(case) = lock_case(&mut tx, job.case_id).await? {
                write_case(&mut tx, &case.with_status(status)).await?;
            }
        }
        if let Some(entry) = dead_letter {
            insert_dead_letter(&mut tx, &entry).await?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(job)
    }

    pub async fn cancel(&self, job_id: JobId) -> Result<Job, JobStoreError> {
        let mut tx = self.begin().await?;
        let mut job = lock_job(&mut tx, job_id)
            .await?
            .ok_or(JobStoreError::NotFound(job_id))?;
        if job.is_terminal() {
            return Err(JobStoreError::Terminal(job_id));
        }
        job.cancel_requested = true;
        job.updated_at = Utc::now();
        update_job_row(&mut tx, &job).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(job)
    }

    /// `signoffs_one_per_job` turns a second sign-off into `AlreadyExists`.
    pub async fn insert_sign_off(&self, sign_off: &SignOff) -> Result<(), JobStoreError> {
        sqlx::query("INSERT INTO signoffs (job_id, reviewer, signed_at) VALUES ($1, $2, $3)")
            .bind(*sign_off.job_id.as_uuid())
            .bind(&sign_off.reviewer)
            .bind(sign_off.signed_at)
            .execute(&*self.pool)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(ref db) if db.code().as_deref() == Some("23503") => {
                    JobStoreError::NotFound(sign_off.job_id)
                }
                other => map_sqlx_error("insert_sign_off", other),
            })?;
        Ok(())
    }

    pub async fn fetch_sign_offs(&self, job_id: JobId) -> Result<Vec<SignOff>, JobStoreError> {
        let rows = sqlx::query(
            "SELECT reviewer, signed_at FROM signoffs WHERE job_id = $1 ORDER BY signed_at, id",
        )
        .bind(*job_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fetch_sign_offs", e))?;

        rows.iter()
            .map(|row| {
                Ok(SignOff {
                    job_id,
                    reviewer: row.try_get("reviewer").map_err(|e| decode_error("reviewer", e))?,
                    signed_at: row.try_get("signed_at").map_err(|e| decode_error("signed_at", e))?,
                })
            })
            .collect()
    }

    pub async fn fetch_dead_letter(&self, job_id: JobId) -> Result<Option<DeadLetterEntry>, JobStoreError> {
        let row = sqlx::query("SELECT body FROM dead_letters WHERE job_id = $1")
            .bind(*job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("fetch_dead_letter", e))?;
        row.map(|r| decode_body(&r, "dead letter")).transpose()
    }

    pub async fn query_dead_letters(&self, filter: &DeadLetterFilter) -> Result<Vec<DeadLetterEntry>, JobStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT body
            FROM dead_letters
            WHERE ($1::uuid IS NULL OR case_id = $1)
                AND ($2::text IS NULL OR stage = $2)
                AND ($3::text IS NULL OR error_code = $3)
            ORDER BY dead_lettered_at, job_id
            LIMIT $4
            "#,
        )
        .bind(filter.case_id.map(|id| *id.as_uuid()))
        .bind(filter.stage.map(|s| s.as_str()))
        .bind(filter.error_code.as_deref())
        .bind(i64::try_from(filter.limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("query_dead_letters", e))?;
        rows.iter().map(|r| decode_body(r, "dead letter")).collect()
    }

    pub async fn load_stats(&self) -> Result<JobStats, JobStoreError> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM jobs GROUP BY state")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("load_stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let state: String = row.try_get("state").map_err(|e| decode_error("state", e))?;
            let n: i64 = row.try_get("n").map_err(|e| decode_error("n", e))?;
            let state: JobState = state
                .parse()
                .map_err(|e| JobStoreError::Storage(format!("bad job state in database: {e}")))?;
            stats.count(state, n.max(0) as usize);
        }

        let row = sqlx::query(
            "SELECT (SELECT COUNT(*) FROM dead_letters) AS dlq, (SELECT COUNT(*) FROM cases) AS cases",
        )
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_stats", e))?;
        let dlq: i64 = row.try_get("dlq").map_err(|e| decode_error("dlq", e))?;
        let cases: i64 = row.try_get("cases").map_err(|e| decode_error("cases", e))?;
        stats.dead_letter_entries = dlq.max(0) as usize;
        stats.cases = cases.max(0) as usize;
        Ok(stats)
    }

    /// Insert the case, artifacts and job unless the key is already bound.
    ///
    /// Concurrent inserts of the same key serialize on the unique index; the
    /// loser's `ON CONFLICT DO NOTHING` returns no row and it rolls back.
    #[instrument(skip(self, key, submission), fields(key = %key), err)]
    pub async fn resolve_submission(
        &self,
        key: &IdempotencyKey,
        submission: NewSubmission,
    ) -> Result<Resolution, JobStoreError> {
        submission.validate(key)?;
        if let Some(existing) = self.lookup_key(key).await? {
            return Ok(existing);
        }

        let NewSubmission { case, artifacts, job } = submission;
        let mut tx = self.begin().await?;

        insert_case(&mut tx, &case).await?;
        for artifact in &artifacts {
            insert_artifact(&mut tx, artifact).await?;
        }
        let inserted = sqlx::query(
            r#"
            INSERT INTO jobs (
                job_id, case_id, idempotency_key, state, lease_id, lease_owner,
                lease_expires_at, next_attempt_at, body, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, NULL, NULL, NULL, $5, $6, $7, $8)
            ON CONFLICT (idempotency_key) DO NOTHING
            RETURNING job_id
            "#,
        )
        .bind(*job.id.as_uuid())
        .bind(*job.case_id.as_uuid())
        .bind(&job.idempotency_key)
        .bind(job.state.as_str())
        .bind(job.next_attempt_at)
        .bind(Json(&job))
        .bind(job.created_at)
        .bind(job.updated_at)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("resolve_submission", e))?;

        if inserted.is_none() {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            debug!(key = %key, "idempotency key bound concurrently");
            return self
                .lookup_key(key)
                .await?
                .ok_or_else(|| JobStoreError::Storage(format!("key {key} conflicted but is unbound")));
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(Resolution {
            job_id: job.id,
            case_id: case.id,
            created: true,
        })
    }

    pub async fn lookup_key(&self, key: &IdempotencyKey) -> Result<Option<Resolution>, JobStoreError> {
        let row = sqlx::query("SELECT job_id, case_id FROM jobs WHERE idempotency_key = $1")
            .bind(key.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("lookup_key", e))?;
        row.map(|row| {
            let job_id: uuid::Uuid = row.try_get("job_id").map_err(|e| decode_error("job_id", e))?;
            let case_id: uuid::Uuid = row.try_get("case_id").map_err(|e| decode_error("case_id", e))?;
            Ok(Resolution {
                job_id: JobId::from_uuid(job_id),
                case_id: CaseId::from_uuid(case_id),
                created: false,
            })
        })
        .transpose()
    }
}

async fn lock_job(tx: &mut Transaction<'_, Postgres>, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
    let row = sqlx::query("SELECT body FROM jobs WHERE job_id = $1 FOR UPDATE")
        .bind(*job_id.as_uuid())
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("lock_job", e))?;
    row.map(|r| decode_body(&r, "job")).transpose()
}

async fn lock_case(tx: &mut Transaction<'_, Postgres>, case_id: CaseId) -> Result<Option<Case>, JobStoreError> {
    let row = sqlx::query("SELECT body FROM cases WHERE case_id = $1 FOR UPDATE")
        .bind(*case_id.as_uuid())
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("lock_case", e))?;
    row.map(|r| decode_body(&r, "case")).transpose()
}

async fn insert_case(tx: &mut Transaction<'_, Postgres>, case: &Case) -> Result<(), JobStoreError> {
    sqlx::query(
        r#"
        INSERT INTO cases (case_id, patient_ref, status, body, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(*case.id.as_uuid())
    .bind(case.patient_ref.as_str())
    .bind(case.status.as_str())
    .bind(Json(case))
    .bind(case.created_at)
    .bind(case.updated_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("insert_case", e))?;
    Ok(())
}

async fn write_case(tx: &mut Transaction<'_, Postgres>, case: &Case) -> Result<(), JobStoreError> {
    sqlx::query("UPDATE cases SET status = $2, body = $3, updated_at = $4 WHERE case_id = $1")
        .bind(*case.id.as_uuid())
        .bind(case.status.as_str())
        .bind(Json(case))
        .bind(case.updated_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("write_case", e))?;
    Ok(())
}

async fn insert_artifact(tx: &mut Transaction<'_, Postgres>, artifact: &Artifact) -> Result<(), JobStoreError> {
    sqlx::query(
        "INSERT INTO artifacts (artifact_id, case_id, kind, body, created_at) VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(*artifact.id.as_uuid())
    .bind(*artifact.case_id.as_uuid())
    .bind(artifact.kind.as_str())
    .bind(Json(artifact))
    .bind(artifact.created_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("insert_artifact", e))?;
    Ok(())
}

async fn insert_job_row(tx: &mut Transaction<'_, Postgres>, job: &Job) -> Result<(), JobStoreError> {
    let (lease_id, lease_owner, lease_expires_at) = lease_columns(job);
    sqlx::query(
        r#"
        INSERT INTO jobs (
            job_id, case_id, idempotency_key, state, lease_id, lease_owner,
            lease_expires_at, next_attempt_at, body, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        "#,
    )
    .bind(*job.id.as_uuid())
    .bind(*job.case_id.as_uuid())
    .bind(&job.idempotency_key)
    .bind(job.state.as_str())
    .bind(lease_id)
    .bind(lease_owner)
    .bind(lease_expires_at)
    .bind(job.next_attempt_at)
    .bind(Json(job))
    .bind(job.created_at)
    .bind(job.updated_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("insert_job", e))?;
    Ok(())
}

async fn update_job_row(tx: &mut Transaction<'_, Postgres>, job: &Job) -> Result<(), JobStoreError> {
    let (lease_id, lease_owner, lease_expires_at) = lease_columns(job);
    sqlx::query(
        r#"
        UPDATE jobs
        SET state = $2,
            lease_id = $3,
            lease_owner = $4,
            lease_expires_at = $5,
            next_attempt_at = $6,
            body = $7,
            updated_at = $8
        WHERE job_id = $1
        "#,
    )
    .bind(*job.id.as_uuid())
    .bind(job.state.as_str())
    .bind(lease_id)
    .bind(lease_owner)
    .bind(lease_expires_at)
    .bind(job.next_attempt_at)
    .bind(Json(job))
    .bind(job.updated_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("update_job", e))?;
    Ok(())
}

async fn insert_dead_letter(tx: &mut Transaction<'_, Postgres>, entry: &DeadLetterEntry) -> Result<(), JobStoreError> {
    sqlx::query(
        r#"
        INSERT INTO dead_letters (job_id, case_id, stage, error_code, dead_lettered_at, body)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(*entry.job.id.as_uuid())
    .bind(*entry.job.case_id.as_uuid())
    .bind(entry.stage.as_str())
    .bind(&entry.error_code)
    .bind(entry.dead_lettered_at)
    .bind(Json(entry))
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("insert_dead_letter", e))?;
    Ok(())
}

fn lease_columns(job: &Job) -> (Option<uuid::Uuid>, Option<String>, Option<DateTime<Utc>>) {
    match &job.lease {
        Some(lease) => (
            Some(*lease.lease_id.as_uuid()),
            Some(lease.worker_id.clone()),
            Some(lease.expires_at),
        ),
        None => (None, None, None),
    }
}

fn decode_body<T>(row: &sqlx::postgres::PgRow, what: &str) -> Result<T, JobStoreError>
where
    T: serde::de::DeserializeOwned,
{
    row.try_get::<Json<T>, _>("body")
        .map(|Json(value)| value)
        .map_err(|e| JobStoreError::Storage(format!("failed to decode {what} row: {e}")))
}

fn decode_error(column: &str, err: sqlx::Error) -> JobStoreError {
    JobStoreError::Storage(format!("failed to read {column}: {err}"))
}

/// Map SQLx errors to JobStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => JobStoreError::AlreadyExists(msg),
                _ => JobStoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::RowNotFound => {
            JobStoreError::Storage(format!("unexpected row not found in {}", operation))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

impl JobStore for PostgresJobStore {
    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        self.block_on(self.fetch_job(job_id))
    }

    fn get_case(&self, case_id: CaseId) -> Result<Option<Case>, JobStoreError> {
        self.block_on(self.fetch_case(case_id))
    }

    fn artifacts(&self, case_id: CaseId) -> Result<Vec<Artifact>, JobStoreError> {
        self.block_on(self.fetch_artifacts(case_id))
    }

    fn case_jobs(&self, case_id: CaseId) -> Result<Vec<Job>, JobStoreError> {
        self.block_on(self.fetch_case_jobs(case_id))
    }

    fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError> {
        self.block_on(self.insert_job(job))
    }

    fn claim_next(&self, worker_id: &str, ttl: Duration) -> Result<Option<Job>, JobStoreError> {
        self.block_on(self.claim(worker_id, ttl))
    }

    fn commit(&self, job_id: JobId, lease_id: LeaseId, transition: Transition) -> Result<Job, JobStoreError> {
        self.block_on(self.commit_transition(job_id, lease_id, transition))
    }

    fn request_cancel(&self, job_id: JobId) -> Result<Job, JobStoreError> {
        self.block_on(self.cancel(job_id))
    }

    fn record_sign_off(&self, sign_off: SignOff) -> Result<(), JobStoreError> {
        self.block_on(self.insert_sign_off(&sign_off))
    }

    fn sign_offs(&self, job_id: JobId) -> Result<Vec<SignOff>, JobStoreError> {
        self.block_on(self.fetch_sign_offs(job_id))
    }

    fn dead_letter(&self, job_id: JobId) -> Result<Option<DeadLetterEntry>, JobStoreError> {
        self.block_on(self.fetch_dead_letter(job_id))
    }

    fn list_dead_letters(&self, filter: &DeadLetterFilter) -> Result<Vec<DeadLetterEntry>, JobStoreError> {
        self.block_on(self.query_dead_letters(filter))
    }

    fn stats(&self) -> Result<JobStats, JobStoreError> {
        self.block_on(self.load_stats())
    }
}

impl IdempotencyLedger for PostgresJobStore {
    fn resolve(&self, key: &IdempotencyKey, submission: NewSubmission) -> Result<Resolution, JobStoreError> {
        self.block_on(self.resolve_submission(key, submission))
    }

    fn lookup(&self, key: &IdempotencyKey) -> Result<Option<Resolution>, JobStoreError> {
        self.block_on(self.lookup_key(key))
    }
}
