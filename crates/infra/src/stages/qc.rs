use std::sync::Arc;

use clinflow_core::Stage;
use clinflow_providers::{QcContext, QcEngine};

use super::{StageContext, StageError, StageExecutor};
use crate::jobs::{QC_BLOCKED, StageOutput};

/// Runs the QC gate over the inference output, checked against the notes,
/// image names and findings of earlier jobs on the case.
///
/// `blocked` is returned as a business failure that carries the verdict;
/// `review_required` is a normal output and the pipeline continues.
pub struct QcStage {
    engine: Arc<dyn QcEngine>,
}

impl QcStage {
    pub fn new(engine: Arc<dyn QcEngine>) -> Self {
        Self { engine }
    }
}

impl StageExecutor for QcStage {
    fn stage(&self) -> Stage {
        Stage::Qc
    }

    fn execute(&self, ctx: &StageContext<'_>) -> Result<StageOutput, StageError> {
        let outputs = &ctx.job.outputs;
        let inference = outputs
            .inference
            .as_ref()
            .ok_or_else(|| StageError::missing_upstream(Stage::Qc, Stage::Infer))?;
        let (notes, images) = outputs
            .preprocess
            .as_ref()
            .map(|p| (p.notes.clone(), p.image_names.clone()))
            .unwrap_or_default();
        let context = QcContext::from_inference(inference, notes)
            .with_history(ctx.history.to_vec())
            .with_images(images);

        let verdict = self
            .engine
            .check(&context)
            .map_err(|e| StageError::fatal("qc_engine_error", e.to_string()))?;

        if verdict.is_blocked() {
            let mut err = StageError::business(
                QC_BLOCKED,
                format!("qc blocked the output with {} issue(s)", verdict.issues.len()),
            );
            err.verdict = Some(verdict);
            return Err(err);
        }
        Ok(StageOutput::Qc(verdict))
    }
}
