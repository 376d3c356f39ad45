//! Workflow engine: the state machine that advances jobs and the facade
//! callers use to submit and inspect them.
//!
//! ## Design
//!
//! - A job's state names the stage in progress; one step runs one stage
//! - Executors classify failures, the retry controller routes them, the
//!   store commits the outcome under the claim's lease
//! - `WorkflowService` never runs stages; it only reads and enqueues
//!
//! ## Components
//!
//! - `StateMachine`: claim, execute, route, commit
//! - `WorkflowService`: submit, poll, output, cancel, sign-off, replay

pub mod service;
pub mod state_machine;

pub use service::{
    CallerStatus, JobView, OutputBundle, ServiceError, SubmitReceipt, SubmitRequest,
    WorkflowService,
};
pub use state_machine::{DEFAULT_LEASE_TTL, StateMachine, StepOutcome, StepReport};
