use serde::{Deserialize, Serialize};
use thiserror::Error;

use clinflow_core::{QcIssues, QcStatus, QcVerdict};

use crate::inference::InferenceOutput;

/// Everything the QC gate looks at for one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QcContext {
    pub summary: String,
    pub findings: Vec<String>,
    pub confidence: f64,
    pub used_fallback: bool,
    /// Case notes, the reference the findings are checked against.
    pub notes: String,
    /// Prior history lines for the case, if any.
    #[serde(default)]
    pub history: Vec<String>,
    /// Image file names attached to the case.
    #[serde(default)]
    pub images: Vec<String>,
}

impl QcContext {
    pub fn from_inference(output: &InferenceOutput, notes: impl Into<String>) -> Self {
        Self {
            summary: output.summary.clone(),
            findings: output.findings.clone(),
            confidence: output.confidence,
            used_fallback: output.used_fallback,
            notes: notes.into(),
            history: Vec::new(),
            images: Vec::new(),
        }
    }

    pub fn with_history(mut self, history: Vec<String>) -> Self {
        self.history = history;
        self
    }

    pub fn with_images(mut self, images: Vec<String>) -> Self {
        self.images = images;
        self
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QcError {
    #[error("invalid qc rules: {0}")]
    InvalidRules(String),

    #[error("qc engine failure: {0}")]
    Engine(String),
}

/// Deterministic QC gate. Never performs network I/O.
pub trait QcEngine: Send + Sync + 'static {
    fn check(&self, context: &QcContext) -> Result<QcVerdict, QcError>;
}

/// Term lists and thresholds for [`RuleQcEngine`]. Matching is
/// case-insensitive substring matching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QcRules {
    pub min_findings_len: usize,
    pub required_tokens: Vec<String>,
    /// Format and completeness issues block the job. When off they only
    /// require review.
    pub incomplete_blocks: bool,
    /// Blocking.
    pub forbidden_terms: Vec<String>,
    /// Non-blocking; the output needs a reviewer.
    pub hedge_terms: Vec<String>,
    /// `(claim, counter)`: blocking when the findings assert `claim` while
    /// the notes, history or image names contain `counter`.
    pub contradiction_pairs: Vec<(String, String)>,
}

impl Default for QcRules {
    fn default() -> Self {
        Self {
            min_findings_len: 20,
            required_tokens: vec!["lesion".into(), "change".into()],
            incomplete_blocks: true,
            forbidden_terms: vec![
                "definitive diagnosis".into(),
                "no follow-up needed".into(),
                "guaranteed benign".into(),
            ],
            hedge_terms: vec![
                "cannot determine".into(),
                "uncertain".into(),
                "correlate clinically".into(),
            ],
            contradiction_pairs: vec![
                ("stable".into(), "rapid growth".into()),
                ("benign".into(), "malignant".into()),
            ],
        }
    }
}

impl QcRules {
    fn validate(&self) -> Result<(), QcError> {
        let blank = |t: &String| t.trim().is_empty();
        if self.required_tokens.iter().any(blank)
            || self.forbidden_terms.iter().any(blank)
            || self.hedge_terms.iter().any(blank)
            || self.contradiction_pairs.iter().any(|(a, b)| blank(a) || blank(b))
        {
            return Err(QcError::InvalidRules("blank term in rule list".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct RuleQcEngine {
    rules: QcRules,
}

impl RuleQcEngine {
    pub fn new(rules: QcRules) -> Result<Self, QcError> {
        rules.validate()?;
        Ok(Self { rules })
    }

    pub fn rules(&self) -> &QcRules {
        &self.rules
    }
}

impl QcEngine for RuleQcEngine {
    fn check(&self, context: &QcContext) -> Result<QcVerdict, QcError> {
        let rules = &self.rules;
        let mut issues = QcIssues::default();
        let mut blocking = false;

        if context.summary.trim().is_empty() {
            issues.format.push("empty_summary".to_string());
        }
        if context.findings.iter().all(|f| f.trim().is_empty()) {
            issues.format.push("no_findings".to_string());
        }
        if !(0.0..=1.0).contains(&context.confidence) {
            issues.format.push("confidence_out_of_range".to_string());
        }

        let findings = context.findings.join("\n");
        let findings_lc = findings.to_lowercase();
        if findings.trim().chars().count() < rules.min_findings_len {
            issues.completeness.push("findings_too_short".to_string());
        }
        for token in &rules.required_tokens {
            if !findings_lc.contains(&token.to_lowercase()) {
                issues
                    .completeness
                    .push(format!("missing_required_token:{token}"));
            }
        }

        let output_lc = format!("{}\n{}", context.summary, findings).to_lowercase();
        for term in &rules.forbidden_terms {
            if output_lc.contains(&term.to_lowercase()) {
                issues.safety.push(format!("forbidden_term:{term}"));
                blocking = true;
            }
        }
        for term in &rules.hedge_terms {
            if output_lc.contains(&term.to_lowercase()) {
                issues.safety.push(format!("red_flag:{term}"));
            }
        }

        if rules.incomplete_blocks && !(issues.format.is_empty() && issues.completeness.is_empty()) {
            blocking = true;
        }

        let reference_lc = std::iter::once(context.notes.as_str())
            .chain(context.history.iter().map(String::as_str))
            .chain(context.images.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join("\n")
            .to_lowercase();
        for (claim, counter) in &rules.contradiction_pairs {
            if findings_lc.contains(&claim.to_lowercase())
                && reference_lc.contains(&counter.to_lowercase())
            {
                issues
                    .safety
                    .push(format!("contradicts history: {claim} vs {counter}"));
                blocking = true;
            }
        }

        let mut status = if blocking {
            QcStatus::Blocked
        } else if issues.is_empty() {
            QcStatus::Pass
        } else {
            QcStatus::ReviewRequired
        };
        if context.used_fallback {
            issues.safety.push("fallback_output".to_string());
            status = status.max(QcStatus::ReviewRequired);
        }

        Ok(QcVerdict::new(status, issues))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::{InferenceProvider, InferenceRequest, MockProvider};
    use clinflow_core::CaseId;

    fn mock_context(notes: &str) -> QcContext {
        let out = MockProvider
            .infer(&InferenceRequest {
                case_id: CaseId::new(),
                notes: notes.to_string(),
                context: String::new(),
                tensor_ref: String::new(),
            })
            .unwrap();
        QcContext::from_inference(&out, notes)
    }

    #[test]
    fn mock_output_passes_default_rules() {
        let verdict = RuleQcEngine::default()
            .check(&mock_context("nodule 8mm"))
            .unwrap();
        assert_eq!(verdict, QcVerdict::pass());
    }

    #[test]
    fn hedge_term_requires_review() {
        let mut ctx = mock_context("nodule");
        ctx.findings
            .push("Lesion change uncertain, correlate clinically.".into());
        let verdict = RuleQcEngine::default().check(&ctx).unwrap();
        assert_eq!(verdict.status, QcStatus::ReviewRequired);
        assert_eq!(verdict.issues.safety.len(), 2);
    }

    #[test]
    fn contradiction_with_history_blocks() {
        let ctx = mock_context("nodule")
            .with_history(vec!["2025-11: rapid growth noted on CT".into()]);
        let verdict = RuleQcEngine::default().check(&ctx).unwrap();
        assert!(verdict.is_blocked());
        assert!(verdict.issues.safety[0].starts_with("contradicts history"));
    }

    #[test]
    fn forbidden_term_blocks() {
        let mut ctx = mock_context("nodule");
        ctx.summary = "Definitive diagnosis: benign".into();
        assert!(RuleQcEngine::default().check(&ctx).unwrap().is_blocked());
    }

    #[test]
    fn structural_problems_are_format_and_completeness_issues() {
        let ctx = QcContext {
            summary: " ".into(),
            findings: vec![],
            confidence: 1.5,
            used_fallback: false,
            notes: String::new(),
            history: vec![],
            images: vec![],
        };
        let verdict = RuleQcEngine::default().check(&ctx).unwrap();
        assert_eq!(verdict.status, QcStatus::Blocked);
        assert_eq!(
            verdict.issues.format,
            vec!["empty_summary", "no_findings", "confidence_out_of_range"]
        );
        assert_eq!(verdict.issues.completeness.len(), 3);
    }

    #[test]
    fn missing_mandatory_fields_block() {
        let mut ctx = mock_context("nodule");
        ctx.findings = vec!["ok".into()];
        let verdict = RuleQcEngine::default().check(&ctx).unwrap();
        assert_eq!(verdict.status, QcStatus::Blocked);
        assert_eq!(
            verdict.issues.completeness,
            vec![
                "findings_too_short",
                "missing_required_token:lesion",
                "missing_required_token:change"
            ]
        );
    }

    #[test]
    fn lenient_rules_send_incomplete_output_to_review() {
        let engine = RuleQcEngine::new(QcRules {
            incomplete_blocks: false,
            ..QcRules::default()
        })
        .unwrap();
        let mut ctx = mock_context("nodule");
        ctx.findings = vec!["ok".into()];
        assert_eq!(engine.check(&ctx).unwrap().status, QcStatus::ReviewRequired);
    }

    #[test]
    fn contradiction_with_image_name_blocks() {
        let ctx = mock_context("nodule").with_images(vec!["ct-rapid-growth-2025.dcm".into()]);
        let mut rules = QcRules::default();
        rules.contradiction_pairs = vec![("stable".into(), "rapid-growth".into())];
        let verdict = RuleQcEngine::new(rules).unwrap().check(&ctx).unwrap();
        assert!(verdict.is_blocked());
    }

    #[test]
    fn fallback_output_never_passes() {
        let mut ctx = mock_context("nodule");
        ctx.used_fallback = true;
        let verdict = RuleQcEngine::default().check(&ctx).unwrap();
        assert_eq!(verdict.status, QcStatus::ReviewRequired);
    }

    #[test]
    fn blank_rule_terms_are_rejected() {
        let rules = QcRules {
            hedge_terms: vec![" ".into()],
            ..QcRules::default()
        };
        assert!(RuleQcEngine::new(rules).is_err());
    }
}
