//! Outbound content filtering
//!
//! PII spans at or above the PII threshold are redacted in place. Content
//! categories come from the injected [`ContentClassifier`]: harmful
//! instructions at or above the block threshold replace the whole text with
//! the policy message; other categories warn below the redact threshold and
//! have their spans redacted at or above it.
//!
//! Filtering is idempotent: placeholders never match a detector, so running
//! the filter over its own output changes nothing.

pub mod classifier;
pub mod pii;

pub use classifier::{CategoryScore, ContentCategory, ContentClassifier, HeuristicClassifier};
pub use pii::{PiiKind, PiiMatch};

use crate::config::OutputFilterConfig;
use crate::types::{Finding, Severity};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const CONTENT_PLACEHOLDER: &str = "[REDACTED]";
const CODE_PLACEHOLDER: &str = "[CODE REDACTED]";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterAction {
    Warn,
    Redact,
    Block,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputViolation {
    pub category: String,
    pub action: FilterAction,
    pub score: f64,
}

impl OutputViolation {
    fn severity(&self) -> Severity {
        match self.action {
            FilterAction::Block => Severity::Critical,
            FilterAction::Redact => Severity::Medium,
            FilterAction::Warn => Severity::Low,
        }
    }
}

/// Result of [`OutputFilter::filter`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterOutcome {
    pub allowed: bool,
    pub filtered: String,
    pub violations: Vec<OutputViolation>,
}

impl FilterOutcome {
    pub fn is_blocked(&self) -> bool {
        !self.allowed
    }

    /// Violations as findings for the caller's metadata
    pub fn findings(&self) -> Vec<Finding> {
        self.violations
            .iter()
            .map(|v| {
                Finding::new(
                    "output",
                    v.category.clone(),
                    v.severity(),
                    format!("{:?} at score {:.2}", v.action, v.score),
                )
            })
            .collect()
    }
}

struct Redaction {
    start: usize,
    end: usize,
    replacement: &'static str,
}

pub struct OutputFilter {
    classifier: Arc<dyn ContentClassifier>,
    config: OutputFilterConfig,
}

impl OutputFilter {
    pub fn new(classifier: Arc<dyn ContentClassifier>, config: OutputFilterConfig) -> Self {
        Self { classifier, config }
    }

    pub fn filter(&self, text: &str) -> FilterOutcome {
        let mut violations = Vec::new();
        let mut redactions = Vec::new();

        for m in pii::scan(text) {
            if m.confidence < self.config.pii_threshold {
                continue;
            }
            violations.push(OutputViolation {
                category: m.kind.as_str().to_string(),
                action: FilterAction::Redact,
                score: m.confidence,
            });
            redactions.push(Redaction {
                start: m.start,
                end: m.end,
                replacement: m.kind.replacement(),
            });
        }

        for score in self.classifier.classify(text) {
            let score_value = score.score.clamp(0.0, 1.0);
            if score_value <= 0.0 {
                continue;
            }
            let action = self.action_for(score.category, score_value);
            if action == FilterAction::Redact {
                let replacement = match score.category {
                    ContentCategory::MaliciousCode => CODE_PLACEHOLDER,
                    _ => CONTENT_PLACEHOLDER,
                };
                redactions.extend(score.spans.iter().map(|&(start, end)| Redaction {
                    start,
                    end,
                    replacement,
                }));
            }
            violations.push(OutputViolation {
                category: score.category.as_str().to_string(),
                action,
                score: score_value,
            });
        }

        if violations.iter().any(|v| v.action == FilterAction::Block) {
            tracing::warn!(
                categories = ?violations.iter().map(|v| v.category.as_str()).collect::<Vec<_>>(),
                "Output blocked"
            );
            return FilterOutcome {
                allowed: false,
                filtered: self.config.policy_message.clone(),
                violations,
            };
        }

        if !redactions.is_empty() {
            tracing::debug!(redactions = redactions.len(), "Output redacted");
        }
        FilterOutcome {
            allowed: true,
            filtered: apply_redactions(text, redactions),
            violations,
        }
    }

    fn action_for(&self, category: ContentCategory, score: f64) -> FilterAction {
        match category {
            ContentCategory::HarmfulInstructions if score >= self.config.block_threshold => FilterAction::Block,
            ContentCategory::HarmfulInstructions => FilterAction::Warn,
            _ if score >= self.config.redact_threshold => FilterAction::Redact,
            _ => FilterAction::Warn,
        }
    }
}

impl Default for OutputFilter {
    fn default() -> Self {
        Self::new(Arc::new(HeuristicClassifier), OutputFilterConfig::default())
    }
}

/// Replace ranges left to right; a range overlapping an earlier one is
/// merged into it
fn apply_redactions(text: &str, mut redactions: Vec<Redaction>) -> String {
    redactions.sort_by_key(|r| (r.start, std::cmp::Reverse(r.end)));
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for r in redactions {
        if r.end <= cursor {
            continue;
        }
        if r.start < cursor {
            // Overlap: widen the previous replacement to cover it
            cursor = r.end;
            continue;
        }
        out.push_str(&text[cursor..r.start]);
        out.push_str(r.replacement);
        cursor = r.end;
    }
    out.push_str(&text[cursor..]);
    out
}
