use std::sync::Arc;

use clinflow_core::Stage;
use clinflow_providers::{PreprocessError, Preprocessor};

use super::{StageContext, StageError, StageExecutor};
use crate::jobs::StageOutput;

/// Normalizes the case's artifacts. Malformed input is a business failure.
pub struct PreprocessStage {
    preprocessor: Arc<dyn Preprocessor>,
}

impl PreprocessStage {
    pub fn new(preprocessor: Arc<dyn Preprocessor>) -> Self {
        Self { preprocessor }
    }
}

impl StageExecutor for PreprocessStage {
    fn stage(&self) -> Stage {
        Stage::Preprocess
    }

    fn execute(&self, ctx: &StageContext<'_>) -> Result<StageOutput, StageError> {
        self.preprocessor
            .normalize(ctx.case.id, ctx.artifacts)
            .map(StageOutput::Preprocess)
            .map_err(|err| match err {
                PreprocessError::MalformedInput { code, message } => {
                    StageError::business(code, message)
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::test_support::fixture;
    use clinflow_core::ErrorKind;
    use clinflow_providers::ArtifactNormalizer;

    #[test]
    fn missing_input_is_business_failure() {
        let (case, _, job) = fixture("ignored");
        let stage = PreprocessStage::new(Arc::new(ArtifactNormalizer::new()));
        let err = stage
            .execute(&StageContext {
                job: &job,
                case: &case,
                artifacts: &[],
                history: &[],
            })
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Business);
        assert_eq!(err.code, "missing_input");
    }

    #[test]
    fn notes_normalize() {
        let (case, artifacts, job) = fixture("nodule 8mm");
        let stage = PreprocessStage::new(Arc::new(ArtifactNormalizer::new()));
        let out = stage
            .execute(&StageContext {
                job: &job,
                case: &case,
                artifacts: &artifacts,
                history: &[],
            })
            .unwrap();
        assert!(matches!(out, StageOutput::Preprocess(n) if n.notes == "nodule 8mm"));
    }
}
