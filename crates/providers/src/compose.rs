use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use clinflow_core::{CaseId, Citation, JobId, QcIssues, QcStatus};

use crate::inference::ProviderMode;

pub const REPORT_SCHEMA_VERSION: &str = "report.v1";

/// The final report. Unknown fields are a schema violation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReportDocument {
    pub job_id: JobId,
    pub case_id: CaseId,
    pub schema_version: String,
    pub model_version: String,
    pub summary: String,
    pub findings: Vec<String>,
    pub confidence: f64,
    pub qc_status: QcStatus,
    pub qc_issues: QcIssues,
    pub citations: Vec<Citation>,
    pub insufficient_evidence: bool,
    pub provider_mode: ProviderMode,
    pub used_fallback: bool,
    pub review_required: bool,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ComposeError {
    #[error("report schema violation: {0}")]
    SchemaViolation(String),
}

impl ComposeError {
    fn violation(msg: impl Into<String>) -> Self {
        Self::SchemaViolation(msg.into())
    }
}

pub trait ReportComposer: Send + Sync + 'static {
    fn compose(&self, payload: &JsonValue) -> Result<ReportDocument, ComposeError>;
}

/// Validates the assembled payload against [`ReportDocument`] and its
/// invariants.
#[derive(Debug, Clone, Default)]
pub struct SchemaComposer;

impl SchemaComposer {
    pub fn new() -> Self {
        Self
    }

    fn check_invariants(doc: &ReportDocument) -> Result<(), ComposeError> {
        if doc.schema_version != REPORT_SCHEMA_VERSION {
            return Err(ComposeError::violation(format!(
                "unsupported schema_version {}",
                doc.schema_version
            )));
        }
        if doc.summary.trim().is_empty() {
            return Err(ComposeError::violation("summary is empty"));
        }
        if doc.model_version.trim().is_empty() {
            return Err(ComposeError::violation("model_version is empty"));
        }
        if !(0.0..=1.0).contains(&doc.confidence) {
            return Err(ComposeError::violation("confidence outside [0, 1]"));
        }
        if doc.qc_status == QcStatus::Blocked {
            return Err(ComposeError::violation("blocked output cannot be composed"));
        }
        if doc.qc_status == QcStatus::ReviewRequired && !doc.review_required {
            return Err(ComposeError::violation(
                "review_required verdict without review flag",
            ));
        }
        for citation in &doc.citations {
            citation
                .validate()
                .map_err(|e| ComposeError::violation(e.to_string()))?;
        }
        if doc.insufficient_evidence != doc.citations.is_empty() {
            return Err(ComposeError::violation(
                "insufficient_evidence disagrees with citations",
            ));
        }
        Ok(())
    }
}

impl ReportComposer for SchemaComposer {
    fn compose(&self, payload: &JsonValue) -> Result<ReportDocument, ComposeError> {
        let doc: ReportDocument = serde_json::from_value(payload.clone())
            .map_err(|e| ComposeError::violation(e.to_string()))?;
        Self::check_invariants(&doc)?;
        Ok(doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clinflow_core::DocId;
    use serde_json::json;

    fn payload() -> JsonValue {
        json!({
            "job_id": JobId::new(),
            "case_id": CaseId::new(),
            "schema_version": REPORT_SCHEMA_VERSION,
            "model_version": "medgemma-4b-it",
            "summary": "Mock inference: nodule",
            "findings": ["Lesion change is stable."],
            "confidence": 0.72,
            "qc_status": "pass",
            "qc_issues": {},
            "citations": [],
            "insufficient_evidence": true,
            "provider_mode": "mock",
            "used_fallback": false,
            "review_required": false,
            "generated_at": Utc::now(),
        })
    }

    #[test]
    fn valid_payload_composes() {
        let doc = SchemaComposer.compose(&payload()).unwrap();
        assert_eq!(doc.provider_mode, ProviderMode::Mock);
        assert!(doc.insufficient_evidence);
    }

    #[test]
    fn unknown_and_missing_fields_are_violations() {
        let mut extra = payload();
        extra["diagnosis"] = json!("malignant");
        assert!(SchemaComposer.compose(&extra).is_err());

        let mut missing = payload();
        missing.as_object_mut().unwrap().remove("used_fallback");
        assert!(SchemaComposer.compose(&missing).is_err());
    }

    #[test]
    fn blocked_or_unflagged_review_is_rejected() {
        let mut blocked = payload();
        blocked["qc_status"] = json!("blocked");
        assert!(SchemaComposer.compose(&blocked).is_err());

        let mut review = payload();
        review["qc_status"] = json!("review_required");
        assert!(SchemaComposer.compose(&review).is_err());
        review["review_required"] = json!(true);
        assert!(SchemaComposer.compose(&review).is_ok());
    }

    #[test]
    fn versionless_citation_is_rejected() {
        let mut p = payload();
        p["insufficient_evidence"] = json!(false);
        p["citations"] = json!([{
            "doc_id": DocId::new(),
            "title": "SOP",
            "source": "hospital_sop",
            "source_version": "",
            "section_ref": null,
            "score": 2.0,
        }]);
        let err = SchemaComposer.compose(&p).unwrap_err();
        assert!(err.to_string().contains("source version"));
    }
}
