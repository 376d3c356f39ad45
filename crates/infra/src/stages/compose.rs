use std::sync::Arc;

use chrono::Utc;
use serde_json::json;

use clinflow_core::Stage;
use clinflow_providers::{ComposeError, ReportComposer};

use super::{StageContext, StageError, StageExecutor};
use crate::jobs::StageOutput;

/// Assembles the report payload from upstream outputs and validates it.
/// Any schema violation is fatal.
pub struct ComposeStage {
    composer: Arc<dyn ReportComposer>,
}

impl ComposeStage {
    pub fn new(composer: Arc<dyn ReportComposer>) -> Self {
        Self { composer }
    }
}

impl StageExecutor for ComposeStage {
    fn stage(&self) -> Stage {
        Stage::Compose
    }

    fn execute(&self, ctx: &StageContext<'_>) -> Result<StageOutput, StageError> {
        let job = ctx.job;
        let retrieval = job
            .outputs
            .retrieval
            .as_ref()
            .ok_or_else(|| StageError::missing_upstream(Stage::Compose, Stage::Retrieve))?;
        let inference = job
            .outputs
            .inference
            .as_ref()
            .ok_or_else(|| StageError::missing_upstream(Stage::Compose, Stage::Infer))?;
        let verdict = job
            .outputs
            .qc
            .as_ref()
            .ok_or_else(|| StageError::missing_upstream(Stage::Compose, Stage::Qc))?;

        let payload = json!({
            "job_id": job.id,
            "case_id": job.case_id,
            "schema_version": job.schema_version,
            "model_version": job.model_version,
            "summary": inference.summary,
            "findings": inference.findings,
            "confidence": inference.confidence,
            "qc_status": verdict.status,
            "qc_issues": verdict.issues,
            "citations": retrieval.citations,
            "insufficient_evidence": retrieval.insufficient_evidence,
            "provider_mode": inference.run_mode,
            "used_fallback": inference.used_fallback,
            "review_required": job.review_required || verdict.requires_review(),
            "generated_at": Utc::now(),
        });

        self.composer
            .compose(&payload)
            .map(StageOutput::Compose)
            .map_err(|ComposeError::SchemaViolation(msg)| StageError::fatal("schema_violation", msg))
    }
}
