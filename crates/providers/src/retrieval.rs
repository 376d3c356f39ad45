use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use clinflow_core::{Citation, DocId};

/// Upper bound on `top_k` accepted by retrievers.
pub const MAX_TOP_K: usize = 10;

const MAX_DOC_CONTENT_LEN: usize = 8000;
const SNIPPET_CHARS: usize = 160;

/// A reference document served by the retriever.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgeDoc {
    pub id: DocId,
    pub source: String,
    pub source_version: String,
    pub title: String,
    pub section_ref: Option<String>,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// One retrieval result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalHit {
    pub doc_id: DocId,
    pub title: String,
    pub source: String,
    pub source_version: String,
    pub section_ref: Option<String>,
    pub score: f64,
    pub snippet: String,
}

impl RetrievalHit {
    /// Convert to a citation. `None` when the hit has no traceable version.
    pub fn to_citation(&self) -> Option<Citation> {
        let citation = Citation {
            doc_id: self.doc_id,
            title: self.title.clone(),
            source: self.source.clone(),
            source_version: self.source_version.clone(),
            section_ref: self.section_ref.clone(),
            score: self.score,
        };
        citation.validate().ok().map(|_| citation)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RetrieveError {
    /// The retrieval backend could not be reached or timed out.
    #[error("retriever unavailable: {0}")]
    Unavailable(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("invalid document: {0}")]
    InvalidDocument(String),
}

/// Retrieval collaborator.
///
/// An empty or low-score result is valid output, never an error.
pub trait Retriever: Send + Sync + 'static {
    fn query(&self, text: &str, top_k: usize) -> Result<Vec<RetrievalHit>, RetrieveError>;
}

/// One entry of a knowledge file: a JSON array of these objects.
#[derive(Debug, Clone, Deserialize)]
struct KnowledgeEntry {
    source: String,
    source_version: String,
    title: String,
    #[serde(default)]
    section_ref: Option<String>,
    content: String,
}

/// Keyword-scored in-memory knowledge base for tests/dev.
///
/// Score is the total number of occurrences of the query terms in
/// `title + content`; a document matching none of the terms but containing
/// the whole query scores 1.0.
#[derive(Debug, Default)]
pub struct InMemoryKnowledgeBase {
    docs: RwLock<Vec<KnowledgeDoc>>,
}

impl InMemoryKnowledgeBase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ingest(
        &self,
        source: impl Into<String>,
        source_version: impl Into<String>,
        title: impl Into<String>,
        section_ref: Option<String>,
        content: impl Into<String>,
    ) -> Result<KnowledgeDoc, RetrieveError> {
        let doc = KnowledgeDoc {
            id: DocId::new(),
            source: source.into(),
            source_version: source_version.into(),
            title: title.into(),
            section_ref,
            content: content.into(),
            created_at: Utc::now(),
        };
        if doc.source.trim().is_empty() || doc.title.trim().is_empty() {
            return Err(RetrieveError::InvalidDocument(
                "document source and title are required".to_string(),
            ));
        }
        if doc.content.is_empty() || doc.content.chars().count() > MAX_DOC_CONTENT_LEN {
            return Err(RetrieveError::InvalidDocument(format!(
                "document content must be 1..={MAX_DOC_CONTENT_LEN} characters"
            )));
        }

        self.docs
            .write()
            .map_err(|_| RetrieveError::Unavailable("lock poisoned".to_string()))?
            .push(doc.clone());
        Ok(doc)
    }

    /// Build a knowledge base from a JSON array of documents.
    ///
    /// Each object carries `source`, `source_version`, `title`, `content`
    /// and an optional `section_ref`. One bad entry rejects the whole file.
    pub fn from_json_reader<R: std::io::Read>(reader: R) -> Result<Self, RetrieveError> {
        let entries: Vec<KnowledgeEntry> = serde_json::from_reader(reader)
            .map_err(|e| RetrieveError::InvalidDocument(format!("malformed knowledge file: {e}")))?;
        let kb = Self::new();
        for (n, entry) in entries.into_iter().enumerate() {
            kb.ingest(
                entry.source,
                entry.source_version,
                entry.title,
                entry.section_ref,
                entry.content,
            )
            .map_err(|e| RetrieveError::InvalidDocument(format!("entry {n}: {e}")))?;
        }
        Ok(kb)
    }

    pub fn len(&self) -> usize {
        self.docs.read().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Retriever for InMemoryKnowledgeBase {
    fn query(&self, text: &str, top_k: usize) -> Result<Vec<RetrievalHit>, RetrieveError> {
        if top_k == 0 || top_k > MAX_TOP_K {
            return Err(RetrieveError::InvalidQuery(format!(
                "top_k must be 1..={MAX_TOP_K}"
            )));
        }

        let query = text.trim().to_lowercase();
        if query.is_empty() {
            return Ok(Vec::new());
        }
        let terms: Vec<&str> = query.split_whitespace().collect();

        let docs = self
            .docs
            .read()
            .map_err(|_| RetrieveError::Unavailable("lock poisoned".to_string()))?;

        let mut hits: Vec<RetrievalHit> = docs
            .iter()
            .filter_map(|doc| {
                let haystack = format!("{} {}", doc.title, doc.content).to_lowercase();
                let mut score: f64 = terms
                    .iter()
                    .map(|term| haystack.matches(term).count() as f64)
                    .sum();
                if score == 0.0 && haystack.contains(&query) {
                    score = 1.0;
                }
                (score > 0.0).then(|| RetrievalHit {
                    doc_id: doc.id,
                    title: doc.title.clone(),
                    source: doc.source.clone(),
                    source_version: doc.source_version.clone(),
                    section_ref: doc.section_ref.clone(),
                    score,
                    snippet: doc.content.chars().take(SNIPPET_CHARS).collect(),
                })
            })
            .collect();

        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(top_k);
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kb() -> InMemoryKnowledgeBase {
        let kb = InMemoryKnowledgeBase::new();
        kb.ingest(
            "hospital_sop",
            "2026.01",
            "Pulmonary nodule follow-up",
            Some("3.1".into()),
            "Assess lesion change against prior imaging. Lesion growth warrants CT.",
        )
        .unwrap();
        kb.ingest(
            "guideline",
            "v2",
            "Fleischner summary",
            None,
            "Solid nodule under 6mm needs no routine follow-up.",
        )
        .unwrap();
        kb
    }

    #[test]
    fn hits_are_scored_by_term_occurrences() {
        let hits = kb().query("lesion change", 3).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].source, "hospital_sop");
        assert_eq!(hits[0].score, 3.0);
    }

    #[test]
    fn results_are_ordered_and_truncated() {
        let hits = kb().query("nodule", 1).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title, "Fleischner summary");
    }

    #[test]
    fn miss_is_empty_not_error() {
        assert!(kb().query("cardiac troponin", 3).unwrap().is_empty());
        assert!(kb().query("   ", 3).unwrap().is_empty());
    }

    #[test]
    fn top_k_is_bounded() {
        assert!(kb().query("nodule", 0).is_err());
        assert!(kb().query("nodule", MAX_TOP_K + 1).is_err());
    }

    #[test]
    fn hit_without_version_yields_no_citation() {
        let kb = InMemoryKnowledgeBase::new();
        kb.ingest("sop", "", "Untracked", None, "nodule policy").unwrap();
        let hits = kb.query("nodule", 3).unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].to_citation().is_none());
    }

    #[test]
    fn knowledge_file_is_loaded() {
        let json = r#"[
            {"source": "hospital_sop", "source_version": "2026.01", "title": "Pulmonary nodule follow-up",
             "section_ref": "3.1", "content": "Lesion growth warrants CT."},
            {"source": "guideline", "source_version": "v2", "title": "Fleischner summary",
             "content": "Solid nodule under 6mm needs no routine follow-up."}
        ]"#;
        let kb = InMemoryKnowledgeBase::from_json_reader(json.as_bytes()).unwrap();
        assert_eq!(kb.len(), 2);
        let hits = kb.query("lesion growth", 3).unwrap();
        assert_eq!(hits[0].section_ref.as_deref(), Some("3.1"));
        assert!(hits[0].to_citation().is_some());
    }

    #[test]
    fn bad_knowledge_file_is_rejected() {
        assert!(matches!(
            InMemoryKnowledgeBase::from_json_reader("{\"source\": 1}".as_bytes()),
            Err(RetrieveError::InvalidDocument(_))
        ));
        let blank_title = r#"[{"source": "sop", "source_version": "1", "title": " ", "content": "x"}]"#;
        let err = InMemoryKnowledgeBase::from_json_reader(blank_title.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("entry 0"));
    }
}
