//! Clinical case and its write-once input artifacts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::{ArtifactId, CaseId};

/// Maximum length of a pseudonymized patient reference.
pub const MAX_PATIENT_REF_LEN: usize = 128;

/// Maximum length of free-text notes accepted on submission.
pub const MAX_NOTES_LEN: usize = 4000;

/// Pseudonymized patient reference.
///
/// Never a real patient identifier; the gateway pseudonymizes before submission.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PatientRef(String);

impl PatientRef {
    pub fn parse(value: impl Into<String>) -> DomainResult<Self> {
        let value = value.into();
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(DomainError::validation("patient reference must not be empty"));
        }
        if trimmed.chars().count() > MAX_PATIENT_REF_LEN {
            return Err(DomainError::validation(format!(
                "patient reference exceeds {MAX_PATIENT_REF_LEN} characters"
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Lifecycle status of a case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    /// A job for the case is in flight.
    Open,
    /// The latest job succeeded without a review flag.
    Closed,
    /// The latest job needs a human (review-required output or business failure).
    NeedsReview,
    /// The latest job was dead-lettered or cancelled.
    Failed,
}

impl CaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaseStatus::Open => "open",
            CaseStatus::Closed => "closed",
            CaseStatus::NeedsReview => "needs_review",
            CaseStatus::Failed => "failed",
        }
    }
}

impl core::str::FromStr for CaseStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(CaseStatus::Open),
            "closed" => Ok(CaseStatus::Closed),
            "needs_review" => Ok(CaseStatus::NeedsReview),
            "failed" => Ok(CaseStatus::Failed),
            other => Err(DomainError::validation(format!("unknown case status: {other}"))),
        }
    }
}

/// A clinical case.
///
/// Identity is fixed at creation. Only the orchestrator updates `status` and
/// `updated_at`, when one of the case's jobs reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Case {
    pub id: CaseId,
    pub patient_ref: PatientRef,
    pub status: CaseStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Case {
    pub fn open(patient_ref: PatientRef) -> Self {
        let now = Utc::now();
        Self {
            id: CaseId::new(),
            patient_ref,
            status: CaseStatus::Open,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_status(&self, status: CaseStatus) -> Self {
        Self {
            status,
            updated_at: Utc::now(),
            ..self.clone()
        }
    }
}

/// Kind tag of an input artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    InputNotes,
    InputImage,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::InputNotes => "input_notes",
            ArtifactKind::InputImage => "input_image",
        }
    }
}

/// An input unit attached to a case. Write-once.
///
/// Notes carry their text in `content`; images carry an opaque object
/// reference (path or URI) in `object_ref`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: ArtifactId,
    pub case_id: CaseId,
    pub kind: ArtifactKind,
    pub file_name: String,
    pub content: Option<String>,
    pub object_ref: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    /// Build a notes artifact. Returns `None` for blank notes.
    pub fn notes(case_id: CaseId, text: &str) -> DomainResult<Option<Self>> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        if trimmed.chars().count() > MAX_NOTES_LEN {
            return Err(DomainError::validation(format!(
                "notes exceed {MAX_NOTES_LEN} characters"
            )));
        }
        Ok(Some(Self {
            id: ArtifactId::new(),
            case_id,
            kind: ArtifactKind::InputNotes,
            file_name: "notes.txt".to_string(),
            content: Some(trimmed.to_string()),
            object_ref: None,
            created_at: Utc::now(),
        }))
    }

    /// Build an image artifact from an object reference.
    pub fn image(case_id: CaseId, object_ref: &str) -> DomainResult<Self> {
        let object_ref = object_ref.trim();
        if object_ref.is_empty() {
            return Err(DomainError::validation("image reference must not be empty"));
        }
        let file_name = object_ref
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(object_ref)
            .to_string();
        Ok(Self {
            id: ArtifactId::new(),
            case_id,
            kind: ArtifactKind::InputImage,
            file_name,
            content: None,
            object_ref: Some(object_ref.to_string()),
            created_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patient_ref_is_trimmed_and_bounded() {
        assert_eq!(PatientRef::parse("  p-001 ").unwrap().as_str(), "p-001");
        assert!(PatientRef::parse("   ").is_err());
        assert!(PatientRef::parse("x".repeat(MAX_PATIENT_REF_LEN + 1)).is_err());
    }

    #[test]
    fn blank_notes_produce_no_artifact() {
        let case_id = CaseId::new();
        assert!(Artifact::notes(case_id, "  \n ").unwrap().is_none());

        let notes = Artifact::notes(case_id, " nodule stable ").unwrap().unwrap();
        assert_eq!(notes.kind, ArtifactKind::InputNotes);
        assert_eq!(notes.content.as_deref(), Some("nodule stable"));
    }

    #[test]
    fn image_file_name_is_last_path_segment() {
        let img = Artifact::image(CaseId::new(), "s3://bucket/case/ct_001.dcm").unwrap();
        assert_eq!(img.file_name, "ct_001.dcm");
        assert_eq!(img.object_ref.as_deref(), Some("s3://bucket/case/ct_001.dcm"));
    }

    #[test]
    fn status_update_keeps_identity() {
        let case = Case::open(PatientRef::parse("p-1").unwrap());
        let closed = case.with_status(CaseStatus::Closed);
        assert_eq!(closed.id, case.id);
        assert_eq!(closed.created_at, case.created_at);
        assert_eq!(closed.status, CaseStatus::Closed);
    }
}
