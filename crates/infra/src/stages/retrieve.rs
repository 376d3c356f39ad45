use std::sync::Arc;

use clinflow_core::Stage;
use clinflow_providers::{RetrieveError, Retriever};

use super::{StageContext, StageError, StageExecutor};
use crate::jobs::{RetrievalOutput, StageOutput};

/// Context marker used when no hit passes the threshold.
pub const INSUFFICIENT_EVIDENCE: &str = "NO_CITATION: insufficient evidence";

/// Queries the retriever with the case notes.
///
/// A miss is data, not an error: the output carries the insufficient-evidence
/// marker and the job moves on to inference.
pub struct RetrieveStage {
    retriever: Arc<dyn Retriever>,
    top_k: usize,
    min_score: f64,
}

impl RetrieveStage {
    pub fn new(retriever: Arc<dyn Retriever>, top_k: usize, min_score: f64) -> Self {
        Self {
            retriever,
            top_k,
            min_score,
        }
    }
}

impl StageExecutor for RetrieveStage {
    fn stage(&self) -> Stage {
        Stage::Retrieve
    }

    fn execute(&self, ctx: &StageContext<'_>) -> Result<StageOutput, StageError> {
        let input = ctx
            .job
            .outputs
            .preprocess
            .as_ref()
            .ok_or_else(|| StageError::missing_upstream(Stage::Retrieve, Stage::Preprocess))?;

        let query = if input.notes.trim().is_empty() {
            input.image_names.join(" ")
        } else {
            input.notes.clone()
        };

        let hits = self
            .retriever
            .query(&query, self.top_k)
            .map_err(|err| match err {
                RetrieveError::Unavailable(msg) => StageError::transient("retriever_unavailable", msg),
                RetrieveError::InvalidQuery(msg) | RetrieveError::InvalidDocument(msg) => {
                    StageError::fatal("retrieval_contract", msg)
                }
            })?;

        let mut lines = Vec::new();
        let mut citations = Vec::new();
        for hit in hits.iter().filter(|h| h.score >= self.min_score) {
            let Some(citation) = hit.to_citation() else {
                tracing::debug!(job_id = %ctx.job.id, doc_id = %hit.doc_id, "dropping hit without source version");
                continue;
            };
            lines.push(format!("{}\n{}", citation.context_line(citations.len()), hit.snippet));
            citations.push(citation);
        }

        let insufficient_evidence = citations.is_empty();
        let context = if insufficient_evidence {
            INSUFFICIENT_EVIDENCE.to_string()
        } else {
            lines.join("\n")
        };

        Ok(StageOutput::Retrieve(RetrievalOutput {
            query,
            hits,
            citations,
            insufficient_evidence,
            context,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::PreprocessStage;
    use crate::stages::test_support::{fixture, run};
    use clinflow_core::ErrorKind;
    use clinflow_providers::{ArtifactNormalizer, InMemoryKnowledgeBase, RetrievalHit};

    struct Down;

    impl Retriever for Down {
        fn query(&self, _: &str, _: usize) -> Result<Vec<RetrievalHit>, RetrieveError> {
            Err(RetrieveError::Unavailable("connection refused".into()))
        }
    }

    fn retrieve(retriever: Arc<dyn Retriever>, min_score: f64, notes: &str) -> Result<RetrievalOutput, StageError> {
        let (case, artifacts, mut job) = fixture(notes);
        run(&PreprocessStage::new(Arc::new(ArtifactNormalizer::new())), &case, &artifacts, &mut job)?;
        run(&RetrieveStage::new(retriever, 3, min_score), &case, &artifacts, &mut job)?;
        Ok(job.outputs.retrieval.unwrap())
    }

    fn kb() -> Arc<InMemoryKnowledgeBase> {
        let kb = InMemoryKnowledgeBase::new();
        kb.ingest("hospital_sop", "2026.01", "Nodule follow-up", Some("4.2".into()), "nodule follow-up interval")
            .unwrap();
        kb.ingest("draft", "", "Unversioned", None, "nodule nodule nodule").unwrap();
        Arc::new(kb)
    }

    #[test]
    fn hits_become_numbered_context_lines() {
        let out = retrieve(kb(), 1.0, "nodule 8mm").unwrap();
        assert!(!out.insufficient_evidence);
        assert_eq!(out.citations.len(), 1);
        assert_eq!(out.hits.len(), 2);
        assert!(out.context.starts_with("[1] Nodule follow-up (hospital_sop@2026.01 §4.2)"));
    }

    #[test]
    fn low_scores_yield_marker() {
        let out = retrieve(kb(), 10.0, "nodule").unwrap();
        assert!(out.insufficient_evidence);
        assert_eq!(out.context, INSUFFICIENT_EVIDENCE);
    }

    #[test]
    fn unreachable_retriever_is_transient() {
        let err = retrieve(Arc::new(Down), 1.0, "nodule").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Transient);
    }
}
