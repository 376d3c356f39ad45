//! `clinflow-providers`
//!
//! **Responsibility:** boundary to the external collaborators the workflow
//! drives: preprocessing, retrieval, inference, QC and report composition.
//!
//! This crate is intentionally **not** part of the workflow engine:
//! - It must not know about jobs, leases, or retries.
//! - Each collaborator reports failures in its own error type; the stage
//!   executors in `clinflow-infra` classify them.
//! - Default implementations here are what the worker wires at startup.

pub mod compose;
pub mod inference;
pub mod preprocess;
pub mod qc;
pub mod retrieval;

pub use compose::{ComposeError, ReportComposer, ReportDocument, SchemaComposer, REPORT_SCHEMA_VERSION};
pub use inference::{
    build_provider, InferenceConfig, InferenceOutput, InferenceProvider, InferenceRequest,
    MockProvider, PingStatus, ProviderError, ProviderMode, RealProvider,
};
pub use preprocess::{ArtifactNormalizer, NormalizedInput, PreprocessError, Preprocessor};
pub use qc::{QcContext, QcEngine, QcError, QcRules, RuleQcEngine};
pub use retrieval::{InMemoryKnowledgeBase, KnowledgeDoc, RetrievalHit, RetrieveError, Retriever};
