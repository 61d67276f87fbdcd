//! Core types shared across pipeline stages
//!
//! All wire-facing types serialize with snake_case enums and camelCase
//! struct fields so audit records stay stable across versions.

use crate::tools::permissions::Permission;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Subscription tier of the calling actor, selects quota ceilings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Free,
    Pro,
    Enterprise,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Free => write!(f, "free"),
            Tier::Pro => write!(f, "pro"),
            Tier::Enterprise => write!(f, "enterprise"),
        }
    }
}

/// Severity of a detection or violation (ordered low → critical)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Risk-score contribution of a lexical detection at this severity
    pub fn weight(&self) -> u32 {
        match self {
            Severity::Low => 5,
            Severity::Medium => 15,
            Severity::High | Severity::Critical => 30,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// Declared danger of a tool; drives sandbox limits and call budgets
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskTier {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for RiskTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskTier::Low => write!(f, "low"),
            RiskTier::Medium => write!(f, "medium"),
            RiskTier::High => write!(f, "high"),
            RiskTier::Critical => write!(f, "critical"),
        }
    }
}

/// Byte range of a match in the text it was found in
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchedSpan {
    pub start: usize,
    pub end: usize,
    pub text: String,
}

/// A single lexical threat found by the sanitizer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreatDetection {
    pub category: String,
    pub span: MatchedSpan,
    pub severity: Severity,
}

/// Ordered detections plus an aggregate score in `[0, 100]`
///
/// The score only grows: every push adds a non-negative weight and the
/// total is clamped at 100.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskAssessment {
    detections: Vec<ThreatDetection>,
    risk_score: u32,
}

/// Upper bound of [`RiskAssessment::risk_score`]
pub const MAX_RISK_SCORE: u32 = 100;

impl RiskAssessment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a detection, adding its severity weight to the score
    pub fn push(&mut self, detection: ThreatDetection) {
        let weight = detection.severity.weight();
        self.detections.push(detection);
        self.add_penalty(weight);
    }

    /// Add points not tied to a detection (e.g. oversized input)
    pub fn add_penalty(&mut self, points: u32) {
        self.risk_score = self.risk_score.saturating_add(points).min(MAX_RISK_SCORE);
    }

    pub fn detections(&self) -> &[ThreatDetection] {
        &self.detections
    }

    pub fn risk_score(&self) -> u32 {
        self.risk_score
    }

    pub fn is_clean(&self) -> bool {
        self.detections.is_empty() && self.risk_score == 0
    }

    /// Distinct categories in first-seen order
    pub fn categories(&self) -> Vec<&str> {
        let mut seen: Vec<&str> = Vec::new();
        for d in &self.detections {
            if !seen.contains(&d.category.as_str()) {
                seen.push(&d.category);
            }
        }
        seen
    }
}

/// Speaker of a conversation turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    User,
    Assistant,
}

/// One prior turn of the conversation, used for multi-turn analysis
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Turn {
    pub role: TurnRole,
    pub content: String,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Assistant,
            content: content.into(),
        }
    }
}

/// Who is calling and under which entitlements
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestContext {
    pub actor_id: String,
    pub tier: Tier,
    pub session_id: String,
    #[serde(default)]
    pub permissions: Vec<Permission>,
    /// Prior turns of this session, oldest first
    #[serde(default)]
    pub history: Vec<Turn>,
}

impl RequestContext {
    pub fn new(actor_id: impl Into<String>, tier: Tier, session_id: impl Into<String>) -> Self {
        Self {
            actor_id: actor_id.into(),
            tier,
            session_id: session_id.into(),
            permissions: Vec::new(),
            history: Vec::new(),
        }
    }

    pub fn with_permission(mut self, permission: Permission) -> Self {
        self.permissions.push(permission);
        self
    }

    pub fn with_history(mut self, history: Vec<Turn>) -> Self {
        self.history = history;
        self
    }
}

/// An inbound request; immutable once received
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    id: String,
    text: String,
    actor_id: String,
    tier: Tier,
    session_id: String,
    received_at: u64,
}

impl Request {
    /// Stamp a raw input with a fresh id (`req-<uuid>`) and receive time
    pub fn receive(text: impl Into<String>, ctx: &RequestContext) -> Self {
        Self {
            id: format!("req-{}", uuid::Uuid::new_v4()),
            text: text.into(),
            actor_id: ctx.actor_id.clone(),
            tier: ctx.tier,
            session_id: ctx.session_id.clone(),
            received_at: now_millis(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn actor_id(&self) -> &str {
        &self.actor_id
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn received_at(&self) -> u64 {
        self.received_at
    }
}

/// Non-blocking observation attached to a successful result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Finding {
    pub stage: String,
    pub category: String,
    pub severity: Severity,
    pub detail: String,
}

impl Finding {
    pub fn new(
        stage: impl Into<String>,
        category: impl Into<String>,
        severity: Severity,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            stage: stage.into(),
            category: category.into(),
            severity,
            detail: detail.into(),
        }
    }
}

/// Rough token estimate used for quota accounting (4 chars per token)
pub fn estimate_tokens(text: &str) -> u64 {
    let chars = text.chars().count() as u64;
    chars.div_ceil(4).max(1)
}

pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detection(category: &str, severity: Severity) -> ThreatDetection {
        ThreatDetection {
            category: category.to_string(),
            span: MatchedSpan {
                start: 0,
                end: 4,
                text: "test".to_string(),
            },
            severity,
        }
    }

    #[test]
    fn test_risk_score_is_monotonic_and_clamped() {
        let mut assessment = RiskAssessment::new();
        let mut last = 0;
        for _ in 0..6 {
            assessment.push(detection("role_hijack", Severity::High));
            assert!(assessment.risk_score() >= last);
            last = assessment.risk_score();
        }
        assert_eq!(assessment.risk_score(), MAX_RISK_SCORE);
        assert_eq!(assessment.detections().len(), 6);
    }

    #[test]
    fn test_severity_weights() {
        assert_eq!(Severity::High.weight(), 30);
        assert_eq!(Severity::Medium.weight(), 15);
        assert_eq!(Severity::Low.weight(), 5);
        assert!(Severity::Critical > Severity::High);
    }

    #[test]
    fn test_categories_deduplicated() {
        let mut assessment = RiskAssessment::new();
        assessment.push(detection("a", Severity::Low));
        assessment.push(detection("b", Severity::Low));
        assessment.push(detection("a", Severity::Low));
        assert_eq!(assessment.categories(), vec!["a", "b"]);
        assert_eq!(assessment.risk_score(), 15);
    }

    #[test]
    fn test_request_receive_stamps_id() {
        let ctx = RequestContext::new("user-1", Tier::Pro, "s-1");
        let req = Request::receive("hello", &ctx);
        assert!(req.id().starts_with("req-"));
        assert_eq!(req.actor_id(), "user-1");
        assert_eq!(req.tier(), Tier::Pro);
        assert!(req.received_at() > 0);
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn test_tier_serde() {
        let json = serde_json::to_string(&Tier::Enterprise).unwrap();
        assert_eq!(json, "\"enterprise\"");
        let tier: Tier = serde_json::from_str("\"free\"").unwrap();
        assert_eq!(tier, Tier::Free);
    }
}
