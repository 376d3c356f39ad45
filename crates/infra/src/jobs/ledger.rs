//! Idempotency ledger: one job per submission key.

use serde::{Deserialize, Serialize};

use clinflow_core::{Artifact, Case, CaseId, JobId};

use super::store::JobStoreError;
use super::types::Job;

pub const MAX_KEY_LEN: usize = 128;

/// Caller-supplied submission token. Global scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn parse(value: impl Into<String>) -> Result<Self, JobStoreError> {
        let value = value.into();
        let len = value.chars().count();
        if len == 0 || len > MAX_KEY_LEN {
            return Err(JobStoreError::InvalidKey(format!(
                "idempotency key must be 1..={MAX_KEY_LEN} characters, got {len}"
            )));
        }
        if value.chars().any(char::is_whitespace) {
            return Err(JobStoreError::InvalidKey(
                "idempotency key must not contain whitespace".to_string(),
            ));
        }
        Ok(Self(value))
    }

    /// Key for a submission that did not bring one.
    pub fn generate() -> Self {
        Self(format!("workflow-{}", uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything a fresh submission creates, persisted in one step.
#[derive(Debug, Clone)]
pub struct NewSubmission {
    pub case: Case,
    pub artifacts: Vec<Artifact>,
    pub job: Job,
}

impl NewSubmission {
    pub(crate) fn validate(&self, key: &IdempotencyKey) -> Result<(), JobStoreError> {
        if self.job.idempotency_key != key.as_str() {
            return Err(JobStoreError::InvalidKey(format!(
                "job carries key {} but was resolved under {key}",
                self.job.idempotency_key
            )));
        }
        if self.job.case_id != self.case.id || self.artifacts.iter().any(|a| a.case_id != self.case.id) {
            return Err(JobStoreError::Storage(
                "submission mixes case identifiers".to_string(),
            ));
        }
        Ok(())
    }
}

/// Job identity bound to a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub job_id: JobId,
    pub case_id: CaseId,
    /// `false` when the key was already bound and nothing was written.
    pub created: bool,
}

pub trait IdempotencyLedger: Send + Sync {
    /// Bind `key` to the submission's job, or return the existing binding.
    ///
    /// Check-and-create is one atomic step: concurrent callers with the same
    /// key all observe the same job, and only one of them sees `created`.
    fn resolve(&self, key: &IdempotencyKey, submission: NewSubmission) -> Result<Resolution, JobStoreError>;

    fn lookup(&self, key: &IdempotencyKey) -> Result<Option<Resolution>, JobStoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_length_is_bounded() {
        assert_eq!(IdempotencyKey::parse("k1").unwrap().as_str(), "k1");
        assert!(IdempotencyKey::parse("").is_err());
        assert!(IdempotencyKey::parse("x".repeat(128)).is_ok());
        assert!(IdempotencyKey::parse("x".repeat(129)).is_err());
        assert!(IdempotencyKey::parse("case-42 retry").is_err());
        assert_eq!(IdempotencyKey::parse("k1-abcdef").unwrap().as_str(), "k1-abcdef");
    }

    #[test]
    fn generated_key_is_valid() {
        let key = IdempotencyKey::generate();
        assert!(key.as_str().starts_with("workflow-"));
        assert!(IdempotencyKey::parse(key.as_str()).is_ok());
    }
}
