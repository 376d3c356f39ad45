//! Dead-letter queries.

use serde::{Deserialize, Serialize};

use clinflow_core::{CaseId, Stage};

use super::types::DeadLetterEntry;

const DEFAULT_LIMIT: usize = 100;

/// Filter for listing DLQ entries. Results are ordered by dead-letter time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterFilter {
    pub case_id: Option<CaseId>,
    pub stage: Option<Stage>,
    pub error_code: Option<String>,
    pub limit: usize,
}

impl Default for DeadLetterFilter {
    fn default() -> Self {
        Self {
            case_id: None,
            stage: None,
            error_code: None,
            limit: DEFAULT_LIMIT,
        }
    }
}

impl DeadLetterFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn case(mut self, case_id: CaseId) -> Self {
        self.case_id = Some(case_id);
        self
    }

    pub fn stage(mut self, stage: Stage) -> Self {
        self.stage = Some(stage);
        self
    }

    pub fn error_code(mut self, code: impl Into<String>) -> Self {
        self.error_code = Some(code.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn matches(&self, entry: &DeadLetterEntry) -> bool {
        self.case_id.is_none_or(|id| entry.job.case_id == id)
            && self.stage.is_none_or(|s| entry.stage == s)
            && self
                .error_code
                .as_deref()
                .is_none_or(|c| entry.error_code == c)
    }

    /// Filter, order and truncate an unordered set of entries.
    pub fn apply<'a, I>(&self, entries: I) -> Vec<DeadLetterEntry>
    where
        I: IntoIterator<Item = &'a DeadLetterEntry>,
    {
        let mut out: Vec<_> = entries
            .into_iter()
            .filter(|e| self.matches(e))
            .cloned()
            .collect();
        out.sort_by_key(|e| e.dead_lettered_at);
        out.truncate(self.limit);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::Job;

    fn entry(stage: Stage, code: &str) -> DeadLetterEntry {
        let mut job = Job::new(CaseId::new(), "key-00000001", "m");
        job.stage = stage;
        job.error_code = Some(code.to_string());
        DeadLetterEntry::new(job, "reason".to_string())
    }

    #[test]
    fn filters_compose() {
        let a = entry(Stage::Infer, "transient_exhausted");
        let b = entry(Stage::Compose, "schema_violation");
        let entries = vec![a.clone(), b.clone()];

        assert_eq!(DeadLetterFilter::new().apply(&entries).len(), 2);
        let by_stage = DeadLetterFilter::new().stage(Stage::Infer).apply(&entries);
        assert_eq!(by_stage, vec![a.clone()]);
        let by_code = DeadLetterFilter::new()
            .error_code("schema_violation")
            .apply(&entries);
        assert_eq!(by_code, vec![b.clone()]);
        let by_case = DeadLetterFilter::new()
            .case(a.job.case_id)
            .stage(Stage::Compose)
            .apply(&entries);
        assert!(by_case.is_empty());
        assert_eq!(DeadLetterFilter::new().limit(1).apply(&entries).len(), 1);
    }
}
