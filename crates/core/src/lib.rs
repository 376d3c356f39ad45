//! `clinflow-core`: clinical workflow domain building blocks.
//!
//! This crate contains **pure domain** types (no infrastructure concerns): the
//! case/artifact model, the stage pipeline and its state machine table, the QC
//! verdict model and retrieval citations.

pub mod case;
pub mod citation;
pub mod error;
pub mod id;
pub mod qc;
pub mod workflow;

pub use case::{Artifact, ArtifactKind, Case, CaseStatus, PatientRef};
pub use citation::Citation;
pub use error::{DomainError, DomainResult};
pub use id::{ArtifactId, CaseId, DocId, JobId, LeaseId};
pub use qc::{QcIssues, QcStatus, QcVerdict};
pub use workflow::{ErrorKind, JobState, Stage};
