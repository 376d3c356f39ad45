//! Stage executors: one adapter per external collaborator.
//!
//! Each executor reads the job's upstream outputs, calls its collaborator
//! and classifies its own failures as transient, business or fatal. None of
//! them touch the store.

use std::sync::Arc;

use clinflow_core::{Artifact, Case, ErrorKind, QcVerdict, Stage};
use clinflow_providers::{
    ArtifactNormalizer, InferenceProvider, QcEngine, ReportComposer, Retriever, RuleQcEngine,
    SchemaComposer,
};

use crate::jobs::{Job, StageOutput};

pub mod compose;
pub mod infer;
pub mod preprocess;
pub mod qc;
pub mod retrieve;

pub use compose::ComposeStage;
pub use infer::InferStage;
pub use preprocess::PreprocessStage;
pub use qc::QcStage;
pub use retrieve::{INSUFFICIENT_EVIDENCE, RetrieveStage};

/// Inputs of one stage run.
#[derive(Debug, Clone, Copy)]
pub struct StageContext<'a> {
    pub job: &'a Job,
    pub case: &'a Case,
    pub artifacts: &'a [Artifact],
    /// Findings from earlier jobs on the same case; filled for QC only.
    pub history: &'a [String],
}

/// Classified stage failure.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind} failure ({code}): {message}")]
pub struct StageError {
    pub kind: ErrorKind,
    pub code: String,
    pub message: String,
    /// Set by QC when it blocks the output.
    pub verdict: Option<QcVerdict>,
}

impl StageError {
    pub fn new(kind: ErrorKind, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: code.into(),
            message: message.into(),
            verdict: None,
        }
    }

    pub fn transient(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, code, message)
    }

    pub fn business(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Business, code, message)
    }

    pub fn fatal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Fatal, code, message)
    }

    /// A stage ran before its upstream output exists.
    pub fn missing_upstream(stage: Stage, upstream: Stage) -> Self {
        Self::fatal(
            "missing_upstream_output",
            format!("{stage} needs the {upstream} output"),
        )
    }
}

pub trait StageExecutor: Send + Sync {
    fn stage(&self) -> Stage;

    fn execute(&self, ctx: &StageContext<'_>) -> Result<StageOutput, StageError>;
}

/// The five executors, one per stage.
#[derive(Clone)]
pub struct StageSet {
    preprocess: Arc<dyn StageExecutor>,
    retrieve: Arc<dyn StageExecutor>,
    infer: Arc<dyn StageExecutor>,
    qc: Arc<dyn StageExecutor>,
    compose: Arc<dyn StageExecutor>,
}

impl StageSet {
    /// Default executors over the given retriever and provider.
    pub fn new(
        retriever: Arc<dyn Retriever>,
        provider: Arc<dyn InferenceProvider>,
        top_k: usize,
        min_score: f64,
    ) -> Self {
        Self {
            preprocess: Arc::new(PreprocessStage::new(Arc::new(ArtifactNormalizer::new()))),
            retrieve: Arc::new(RetrieveStage::new(retriever, top_k, min_score)),
            infer: Arc::new(InferStage::new(provider)),
            qc: Arc::new(QcStage::new(Arc::new(RuleQcEngine::default()))),
            compose: Arc::new(ComposeStage::new(Arc::new(SchemaComposer::new()))),
        }
    }

    pub fn with_qc_engine(mut self, engine: Arc<dyn QcEngine>) -> Self {
        self.qc = Arc::new(QcStage::new(engine));
        self
    }

    pub fn with_composer(mut self, composer: Arc<dyn ReportComposer>) -> Self {
        self.compose = Arc::new(ComposeStage::new(composer));
        self
    }

    /// Replace the executor for its own stage.
    pub fn with_executor(mut self, executor: Arc<dyn StageExecutor>) -> Self {
        match executor.stage() {
            Stage::Preprocess => self.preprocess = executor,
            Stage::Retrieve => self.retrieve = executor,
            Stage::Infer => self.infer = executor,
            Stage::Qc => self.qc = executor,
            Stage::Compose => self.compose = executor,
        }
        self
    }

    pub fn for_stage(&self, stage: Stage) -> &dyn StageExecutor {
        match stage {
            Stage::Preprocess => self.preprocess.as_ref(),
            Stage::Retrieve => self.retrieve.as_ref(),
            Stage::Infer => self.infer.as_ref(),
            Stage::Qc => self.qc.as_ref(),
            Stage::Compose => self.compose.as_ref(),
        }
    }
}
