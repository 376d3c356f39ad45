//! Retrieval citations attached to a job's report.

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::DocId;

/// A retrieval hit that backs part of a report.
///
/// A citation always names the exact source version it was drawn from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub doc_id: DocId,
    pub title: String,
    pub source: String,
    pub source_version: String,
    pub section_ref: Option<String>,
    pub score: f64,
}

impl Citation {
    /// Reject citations without a traceable source version.
    pub fn validate(&self) -> DomainResult<()> {
        if self.source.trim().is_empty() {
            return Err(DomainError::invariant(format!(
                "citation {} has no source",
                self.doc_id
            )));
        }
        if self.source_version.trim().is_empty() {
            return Err(DomainError::invariant(format!(
                "citation {} has no source version",
                self.doc_id
            )));
        }
        Ok(())
    }

    /// One line of the context string handed to inference.
    pub fn context_line(&self, index: usize) -> String {
        let section = self
            .section_ref
            .as_deref()
            .map(|s| format!(" §{s}"))
            .unwrap_or_default();
        format!(
            "[{}] {} ({}@{}{}) score={:.2}",
            index + 1,
            self.title,
            self.source,
            self.source_version,
            section,
            self.score
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn citation(version: &str) -> Citation {
        Citation {
            doc_id: DocId::new(),
            title: "Nodule follow-up".into(),
            source: "hospital_sop".into(),
            source_version: version.into(),
            section_ref: Some("4.2".into()),
            score: 2.0,
        }
    }

    #[test]
    fn versionless_citation_is_rejected() {
        assert!(citation("2026.01").validate().is_ok());
        assert!(citation(" ").validate().is_err());
    }

    #[test]
    fn context_line_names_source_version() {
        let line = citation("2026.01").context_line(0);
        assert_eq!(line, "[1] Nodule follow-up (hospital_sop@2026.01 §4.2) score=2.00");
    }
}
