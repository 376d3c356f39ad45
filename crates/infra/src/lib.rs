//! Infrastructure layer: job persistence, stage executors, the workflow
//! state machine, worker pool and configuration.

pub mod config;
pub mod jobs;
pub mod stages;
pub mod workers;
pub mod workflow;


pub use config::{ConfigError, OrchestratorConfig};
pub use jobs::{
    DeadLetterEntry, DeadLetterFilter, IdempotencyKey, IdempotencyLedger, InMemoryJobStore, Job,
    JobStats, JobStore, JobStoreError, PostgresJobStore, RetryController, RetryPolicy,
    StagePolicies,
};
pub use stages::{StageContext, StageError, StageExecutor, StageSet};
pub use workers::{PoolStats, WorkerPool, WorkerPoolConfig, WorkerPoolHandle};
pub use workflow::{
    CallerStatus, JobView, OutputBundle, ServiceError, StateMachine, StepOutcome, StepReport,
    SubmitReceipt, SubmitRequest, WorkflowService,
};
