//! QC verdict model.
//!
//! Collaborators have reported issues both as a flat list and as a
//! categorized map; both normalize to [`QcIssues`] here so the wire shape
//! never leaks into the workflow.

use serde::{Deserialize, Serialize};

/// Outcome of the safety/quality gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QcStatus {
    Pass,
    ReviewRequired,
    Blocked,
}

impl QcStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QcStatus::Pass => "pass",
            QcStatus::ReviewRequired => "review_required",
            QcStatus::Blocked => "blocked",
        }
    }

    /// The stricter of two statuses.
    pub fn max(self, other: QcStatus) -> QcStatus {
        fn rank(s: QcStatus) -> u8 {
            match s {
                QcStatus::Pass => 0,
                QcStatus::ReviewRequired => 1,
                QcStatus::Blocked => 2,
            }
        }
        if rank(other) > rank(self) { other } else { self }
    }
}

/// QC issues partitioned by category.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QcIssues {
    #[serde(default)]
    pub format: Vec<String>,
    #[serde(default)]
    pub completeness: Vec<String>,
    #[serde(default)]
    pub safety: Vec<String>,
}

impl QcIssues {
    pub fn is_empty(&self) -> bool {
        self.format.is_empty() && self.completeness.is_empty() && self.safety.is_empty()
    }

    pub fn len(&self) -> usize {
        self.format.len() + self.completeness.len() + self.safety.len()
    }

    /// Classify a flat issue list.
    ///
    /// `format:` and `completeness:` prefixes are honored and stripped;
    /// `missing*` and `*too_short` codes are completeness issues; anything
    /// else is treated as a safety issue.
    pub fn from_flat<I, S>(issues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut out = QcIssues::default();
        for issue in issues {
            let issue = issue.as_ref().trim();
            if issue.is_empty() {
                continue;
            }
            if let Some(rest) = issue.strip_prefix("format:") {
                out.format.push(rest.trim().to_string());
            } else if let Some(rest) = issue.strip_prefix("completeness:") {
                out.completeness.push(rest.trim().to_string());
            } else if let Some(rest) = issue.strip_prefix("safety:") {
                out.safety.push(rest.trim().to_string());
            } else if issue.starts_with("missing") || issue.ends_with("too_short") {
                out.completeness.push(issue.to_string());
            } else {
                out.safety.push(issue.to_string());
            }
        }
        out
    }
}

/// The QC gate verdict for a job's candidate output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QcVerdict {
    pub status: QcStatus,
    pub issues: QcIssues,
}

impl QcVerdict {
    pub fn pass() -> Self {
        Self {
            status: QcStatus::Pass,
            issues: QcIssues::default(),
        }
    }

    pub fn new(status: QcStatus, issues: QcIssues) -> Self {
        Self { status, issues }
    }

    pub fn is_blocked(&self) -> bool {
        self.status == QcStatus::Blocked
    }

    pub fn requires_review(&self) -> bool {
        self.status == QcStatus::ReviewRequired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_issues_are_categorized() {
        let issues = QcIssues::from_flat([
            "findings_too_short",
            "missing_required_token:lesion",
            "format: empty summary",
            "red_flag:uncertain",
            "  ",
        ]);
        assert_eq!(
            issues.completeness,
            vec!["findings_too_short", "missing_required_token:lesion"]
        );
        assert_eq!(issues.format, vec!["empty summary"]);
        assert_eq!(issues.safety, vec!["red_flag:uncertain"]);
        assert_eq!(issues.len(), 4);
    }

    #[test]
    fn categorized_wire_shape_deserializes_with_missing_keys() {
        let issues: QcIssues =
            serde_json::from_value(serde_json::json!({"safety": ["contradicts history"]})).unwrap();
        assert!(issues.format.is_empty());
        assert_eq!(issues.safety, vec!["contradicts history"]);
    }

    #[test]
    fn status_max_prefers_stricter() {
        assert_eq!(QcStatus::Pass.max(QcStatus::ReviewRequired), QcStatus::ReviewRequired);
        assert_eq!(QcStatus::Blocked.max(QcStatus::Pass), QcStatus::Blocked);
        assert_eq!(QcStatus::ReviewRequired.max(QcStatus::Pass), QcStatus::ReviewRequired);
    }
}
