//! Pipeline stages, job states, and the transition table.
//!
//! ```text
//! queued -> preprocessing -> retrieving -> inferring -> qc_checking -> composing -> succeeded
//!   \            \               \             \             \             \
//!    +------------+---------------+-------------+-------------+-------------+--> failed -> dead_lettered
//! ```
//!
//! A job's state names the stage in progress. Stage success moves exactly one
//! state forward; retries keep the state unchanged.

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// One step of the fixed pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Preprocess,
    Retrieve,
    Infer,
    Qc,
    Compose,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Preprocess,
        Stage::Retrieve,
        Stage::Infer,
        Stage::Qc,
        Stage::Compose,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Preprocess => "preprocess",
            Stage::Retrieve => "retrieve",
            Stage::Infer => "infer",
            Stage::Qc => "qc",
            Stage::Compose => "compose",
        }
    }

    /// The state a job is in while this stage runs.
    pub fn state(&self) -> JobState {
        match self {
            Stage::Preprocess => JobState::Preprocessing,
            Stage::Retrieve => JobState::Retrieving,
            Stage::Infer => JobState::Inferring,
            Stage::Qc => JobState::QcChecking,
            Stage::Compose => JobState::Composing,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for Stage {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown stage: {s}")))
    }
}

/// Workflow state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Preprocessing,
    Retrieving,
    Inferring,
    QcChecking,
    Composing,
    Succeeded,
    Failed,
    DeadLettered,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Preprocessing => "preprocessing",
            JobState::Retrieving => "retrieving",
            JobState::Inferring => "inferring",
            JobState::QcChecking => "qc_checking",
            JobState::Composing => "composing",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::DeadLettered => "dead_lettered",
        }
    }

    /// Terminal states accept no further mutation.
    ///
    /// `failed` is terminal because retries never pass through it: a retried
    /// stage keeps its state. The only exit from `failed` is the dead-letter
    /// promotion committed together with the failure.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::DeadLettered
        )
    }

    /// The stage that runs while the job is in this state.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            JobState::Preprocessing => Some(Stage::Preprocess),
            JobState::Retrieving => Some(Stage::Retrieve),
            JobState::Inferring => Some(Stage::Infer),
            JobState::QcChecking => Some(Stage::Qc),
            JobState::Composing => Some(Stage::Compose),
            _ => None,
        }
    }

    /// The state reached when the current stage succeeds.
    pub fn next(&self) -> Option<JobState> {
        match self {
            JobState::Queued => Some(JobState::Preprocessing),
            JobState::Preprocessing => Some(JobState::Retrieving),
            JobState::Retrieving => Some(JobState::Inferring),
            JobState::Inferring => Some(JobState::QcChecking),
            JobState::QcChecking => Some(JobState::Composing),
            JobState::Composing => Some(JobState::Succeeded),
            JobState::Succeeded | JobState::Failed | JobState::DeadLettered => None,
        }
    }

    pub fn can_transition_to(&self, target: JobState) -> bool {
        if self.next() == Some(target) {
            return true;
        }
        match (self, target) {
            (JobState::Failed, JobState::DeadLettered) => true,
            (from, JobState::Failed) => !from.is_terminal(),
            _ => false,
        }
    }

    pub fn check_transition(&self, target: JobState) -> DomainResult<()> {
        if self.can_transition_to(target) {
            Ok(())
        } else {
            Err(DomainError::invalid_transition(self, target))
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for JobState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let state = match s {
            "queued" => JobState::Queued,
            "preprocessing" => JobState::Preprocessing,
            "retrieving" => JobState::Retrieving,
            "inferring" => JobState::Inferring,
            "qc_checking" => JobState::QcChecking,
            "composing" => JobState::Composing,
            "succeeded" => JobState::Succeeded,
            "failed" => JobState::Failed,
            "dead_lettered" => JobState::DeadLettered,
            other => return Err(DomainError::validation(format!("unknown job state: {other}"))),
        };
        Ok(state)
    }
}

/// Classification of a stage failure.
///
/// Stage executors classify their own failures; retry policy only consumes
/// the classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Network, timeout, or resource exhaustion at a collaborator. Retried.
    Transient,
    /// Invalid input or policy rejection. Fails fast, routed to human review.
    Business,
    /// Contract or schema violation. Fails fast, always dead-lettered.
    Fatal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Business => "business",
            ErrorKind::Fatal => "fatal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
