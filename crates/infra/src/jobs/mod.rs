//! Workflow job persistence: the job table, idempotency ledger, retry policy
//! and dead-letter queue.
//!
//! ## Design
//!
//! - One job per idempotency key, created atomically with its case
//! - Workers lease jobs; every state change is one commit under a lease
//! - Transient failures retry with exponential backoff and jitter
//! - Dead-letter entries are written in the commit that dead-letters the job
//!
//! ## Components
//!
//! - `Job`: the unit the state machine advances
//! - `JobStore`: leases and transactional commits (in-memory or Postgres)
//! - `IdempotencyLedger`: key → job binding
//! - `RetryController`: transient/business/fatal routing and backoff
//! - `DeadLetterFilter`: DLQ queries

pub mod dlq;
pub mod ledger;
pub mod postgres;
pub mod retry;
pub mod store;
pub mod types;

pub use dlq::DeadLetterFilter;
pub use ledger::{IdempotencyKey, IdempotencyLedger, NewSubmission, Resolution};
pub use postgres::PostgresJobStore;
pub use retry::{
    Decision, FixedJitter, JitterSource, RandomJitter, RetryController, RetryPolicy,
    StagePolicies,
};
pub use store::{InMemoryJobStore, JobStats, JobStore, JobStoreError};
pub use types::{
    apply_transition, DeadLetterEntry, Failure, Job, Lease, RetrievalOutput, SignOff,
    StageOutput, StageOutputs, StageRecord, Transition, CANCELLED, QC_BLOCKED,
    TRANSIENT_EXHAUSTED,
};
