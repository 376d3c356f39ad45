use std::sync::Arc;

use clinflow_core::Stage;
use clinflow_providers::{InferenceProvider, InferenceRequest, ProviderError};

use super::{StageContext, StageError, StageExecutor};
use crate::jobs::StageOutput;

/// Calls the inference provider with the normalized input and the retrieval
/// context string.
pub struct InferStage {
    provider: Arc<dyn InferenceProvider>,
}

impl InferStage {
    pub fn new(provider: Arc<dyn InferenceProvider>) -> Self {
        Self { provider }
    }
}

fn classify(err: ProviderError) -> StageError {
    match err {
        ProviderError::Unreachable(msg) => StageError::transient("provider_unreachable", msg),
        ProviderError::Timeout(msg) => StageError::transient("provider_timeout", msg),
        ProviderError::OutOfMemory(msg) => StageError::transient("provider_out_of_memory", msg),
        ProviderError::MalformedResponse(msg) => StageError::fatal("malformed_response", msg),
        ProviderError::Config(msg) => StageError::fatal("provider_config", msg),
    }
}

impl StageExecutor for InferStage {
    fn stage(&self) -> Stage {
        Stage::Infer
    }

    fn execute(&self, ctx: &StageContext<'_>) -> Result<StageOutput, StageError> {
        let outputs = &ctx.job.outputs;
        let input = outputs
            .preprocess
            .as_ref()
            .ok_or_else(|| StageError::missing_upstream(Stage::Infer, Stage::Preprocess))?;
        let retrieval = outputs
            .retrieval
            .as_ref()
            .ok_or_else(|| StageError::missing_upstream(Stage::Infer, Stage::Retrieve))?;

        let request = InferenceRequest {
            case_id: ctx.case.id,
            notes: input.notes.clone(),
            context: retrieval.context.clone(),
            tensor_ref: input.tensor_ref.clone(),
        };
        let output = self.provider.infer(&request).map_err(classify)?;
        tracing::debug!(
            job_id = %ctx.job.id,
            mode = %output.run_mode,
            used_fallback = output.used_fallback,
            "inference finished"
        );
        Ok(StageOutput::Infer(output))
    }
}
