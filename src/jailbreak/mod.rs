//! Jailbreak detection
//!
//! Advisory classifier run on sanitized text. Four independent signals are
//! combined by taking the strongest:
//!
//! - **patterns**: per-category regex sets, confidence `0.7 + 0.3 × match/text`
//! - **embeddings**: optional cosine similarity against known attacks
//! - **multi-turn**: weighted escalation score over the conversation
//! - **decoding**: base64 / ROT13 / URL-decoded variants re-scanned one level deep
//!
//! The detector reports; the orchestrator decides whether to block.

pub mod decode;
pub mod embedding;
pub mod multi_turn;

use crate::config::{CustomPattern, JailbreakConfig};
use crate::error::{GuardError, Result};
use crate::sanitizer::compile_builtin;
use crate::types::Turn;
use decode::{decode_variants, Transform};
use embedding::{AttackEmbeddingStore, EmbeddingModel};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Decoded variants are scanned at this depth and never decoded again
const MAX_DECODE_DEPTH: usize = 1;
/// Floor for confidence of a hit found only after decoding
const ENCODED_HIT_CONFIDENCE: f64 = 0.9;
/// Base confidence of any pattern hit
const PATTERN_BASE_CONFIDENCE: f64 = 0.7;
/// `is_jailbreak` is set above this confidence
const JAILBREAK_CONFIDENCE: f64 = 0.5;
/// Longest matched excerpt kept in evidence
const EXCERPT_CHARS: usize = 80;

/// Kind of jailbreak attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JailbreakCategory {
    RoleOverride,
    InstructionBypass,
    ContextInjection,
    EncodingAttack,
    MultiTurnAttack,
    SocialEngineering,
}

impl JailbreakCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            JailbreakCategory::RoleOverride => "role_override",
            JailbreakCategory::InstructionBypass => "instruction_bypass",
            JailbreakCategory::ContextInjection => "context_injection",
            JailbreakCategory::EncodingAttack => "encoding_attack",
            JailbreakCategory::MultiTurnAttack => "multi_turn_attack",
            JailbreakCategory::SocialEngineering => "social_engineering",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "role_override" => Some(JailbreakCategory::RoleOverride),
            "instruction_bypass" => Some(JailbreakCategory::InstructionBypass),
            "context_injection" => Some(JailbreakCategory::ContextInjection),
            "encoding_attack" => Some(JailbreakCategory::EncodingAttack),
            "multi_turn_attack" => Some(JailbreakCategory::MultiTurnAttack),
            "social_engineering" => Some(JailbreakCategory::SocialEngineering),
            _ => None,
        }
    }
}

impl std::fmt::Display for JailbreakCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

const BUILTIN_PATTERNS: &[(JailbreakCategory, &[&str])] = &[
    (
        JailbreakCategory::RoleOverride,
        &[
            r"(?i)\byou\s+are\s+(?:now\s+)?(?:dan|stan|dude|aim|jailbroken|an?\s+unrestricted\s+(?:ai|assistant|model))\b",
            r"(?i)\bdo\s+anything\s+now\b",
            r"(?i)\b(?:developer|god|jailbreak|dan)\s+mode\b",
            r"(?i)\bpretend\s+(?:you\s+(?:are|have)|to\s+be)\b.{0,40}\b(?:no|without)\s+(?:restrictions|limits|filters|rules)",
            r"(?i)\bfrom\s+now\s+on\s+you\s+(?:are|will\s+act\s+as)\b",
        ],
    ),
    (
        JailbreakCategory::InstructionBypass,
        &[
            r"(?i)\b(?:ignore|disregard|forget|bypass|override)\s+(?:all\s+)?(?:of\s+)?(?:your|the|any|previous|prior)\s+(?:previous\s+|prior\s+)?(?:instructions|rules|guidelines|restrictions|filters|safety)",
            r"(?i)\bwithout\s+(?:any\s+)?(?:restrictions|filters|censorship|limitations)\b",
            r"(?i)\b(?:no|without)\s+(?:ethical|moral|safety)\s+(?:guidelines|constraints|restrictions)",
        ],
    ),
    (
        JailbreakCategory::ContextInjection,
        &[
            r"(?i)\b(?:system|admin|developer)\s+(?:note|message|override|notice)\s*:",
            r"(?i)\bthe\s+(?:above|previous)\s+(?:was|were)\s+(?:just\s+)?(?:a\s+)?(?:test|example|joke)\b",
            r"(?i)\bend\s+of\s+(?:system\s+)?(?:prompt|instructions|context)\b",
            r"(?i)\bbegin\s+new\s+(?:session|conversation|instructions)\b",
        ],
    ),
    (
        JailbreakCategory::EncodingAttack,
        &[
            r"(?i)\b(?:decode|decipher)\s+(?:this|the\s+following)\s+(?:from\s+)?(?:base64|rot13|hex|binary)\b.{0,40}\b(?:follow|execute|obey)\b",
        ],
    ),
    (
        JailbreakCategory::SocialEngineering,
        &[
            r"(?i)\bmy\s+(?:late\s+|dead\s+|deceased\s+)?(?:grandma|grandmother)\s+used\s+to\s+(?:tell|read|say)",
            r"(?i)\bi\s+am\s+(?:your|an?)\s+(?:developer|creator|administrator|openai\s+employee|anthropic\s+employee)\b",
            r"(?i)\bin\s+a\s+(?:hypothetical|fictional)\s+(?:world|scenario|story)\s+where\b.{0,60}\b(?:no\s+rules|anything\s+is\s+allowed|no\s+laws)",
        ],
    ),
];

/// Immutable per-category regex sets
#[derive(Debug, Clone)]
pub struct JailbreakPatternSet {
    sets: Vec<(JailbreakCategory, Vec<Regex>)>,
}

impl JailbreakPatternSet {
    pub fn builtin() -> Self {
        let sets = BUILTIN_PATTERNS
            .iter()
            .map(|(category, raw)| (*category, compile_builtin(category.as_str(), raw)))
            .collect();
        Self { sets }
    }

    /// Built-in sets extended with configured patterns
    pub fn from_config(config: &JailbreakConfig) -> Result<Self> {
        let mut set = Self::builtin();
        for custom in &config.extra_patterns {
            set.push_custom(custom)?;
        }
        Ok(set)
    }

    /// Add a configured pattern to one of the known categories
    pub fn push_custom(&mut self, custom: &CustomPattern) -> Result<()> {
        let category = JailbreakCategory::parse(&custom.category).ok_or_else(|| {
            GuardError::Config(format!(
                "Unknown jailbreak category '{}'",
                custom.category
            ))
        })?;
        let regex = Regex::new(&custom.pattern).map_err(|e| {
            GuardError::Config(format!(
                "Invalid jailbreak pattern for '{}': {}",
                custom.category, e
            ))
        })?;
        match self.sets.iter_mut().find(|(c, _)| *c == category) {
            Some((_, patterns)) => patterns.push(regex),
            None => self.sets.push((category, vec![regex])),
        }
        Ok(())
    }
}

impl Default for JailbreakPatternSet {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Where a piece of evidence came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EvidenceSource {
    Pattern,
    Embedding,
    MultiTurn,
    Decoded { transform: Transform },
}

/// One signal supporting a verdict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Evidence {
    pub source: EvidenceSource,
    pub category: JailbreakCategory,
    pub confidence: f64,
    pub detail: String,
}

/// Result of [`JailbreakDetector::analyze`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JailbreakVerdict {
    pub is_jailbreak: bool,
    pub confidence: f64,
    pub category: Option<JailbreakCategory>,
    pub evidence: Vec<Evidence>,
}

impl JailbreakVerdict {
    fn from_evidence(evidence: Vec<Evidence>) -> Self {
        let strongest = evidence
            .iter()
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence));
        let (confidence, category) = match strongest {
            Some(e) => (e.confidence.clamp(0.0, 1.0), Some(e.category)),
            None => (0.0, None),
        };
        Self {
            is_jailbreak: confidence > JAILBREAK_CONFIDENCE,
            confidence,
            category,
            evidence,
        }
    }
}

/// Heuristic jailbreak classifier
pub struct JailbreakDetector {
    patterns: Arc<JailbreakPatternSet>,
    embeddings: Option<(Arc<dyn EmbeddingModel>, Arc<AttackEmbeddingStore>)>,
    similarity_threshold: f64,
    escalation_threshold: f64,
}

impl JailbreakDetector {
    pub fn new(patterns: Arc<JailbreakPatternSet>) -> Self {
        let defaults = JailbreakConfig::default();
        Self {
            patterns,
            embeddings: None,
            similarity_threshold: defaults.similarity_threshold,
            escalation_threshold: defaults.escalation_threshold,
        }
    }

    /// Take similarity and escalation thresholds from configuration
    pub fn with_config(mut self, config: &JailbreakConfig) -> Self {
        self.similarity_threshold = config.similarity_threshold;
        self.escalation_threshold = config.escalation_threshold;
        self
    }

    /// Enable the embedding-similarity signal
    pub fn with_embeddings(
        mut self,
        model: Arc<dyn EmbeddingModel>,
        store: Arc<AttackEmbeddingStore>,
    ) -> Self {
        self.embeddings = Some((model, store));
        self
    }

    /// Classify `text` in the context of prior `history`
    pub fn analyze(&self, text: &str, history: &[Turn]) -> JailbreakVerdict {
        let mut evidence = self.scan_with_decoding(text);

        if let Some(e) = self.embedding_evidence(text) {
            evidence.push(e);
        }

        if let Some(score) = multi_turn::escalation(history, text) {
            if score.score >= self.escalation_threshold {
                evidence.push(Evidence {
                    source: EvidenceSource::MultiTurn,
                    category: JailbreakCategory::MultiTurnAttack,
                    confidence: score.score,
                    detail: format!(
                        "escalation {:.2} (length {:.2}, drift {:.2}, boundary {:.2})",
                        score.score, score.length_growth, score.topic_drift, score.boundary_testing
                    ),
                });
            }
        }

        let verdict = JailbreakVerdict::from_evidence(evidence);
        if verdict.is_jailbreak {
            tracing::debug!(
                confidence = verdict.confidence,
                category = ?verdict.category,
                signals = verdict.evidence.len(),
                "Jailbreak signals detected"
            );
        }
        verdict
    }

    /// Pattern scan of the text plus every decoded variant, one level deep
    fn scan_with_decoding(&self, text: &str) -> Vec<Evidence> {
        let mut evidence = Vec::new();
        let mut pending: Vec<(String, usize, Option<Transform>)> = vec![(text.to_string(), 0, None)];

        while let Some((candidate, depth, transform)) = pending.pop() {
            let hits = self.pattern_hits(&candidate);
            match transform {
                None => evidence.extend(hits.into_iter().map(|(category, confidence, excerpt)| {
                    Evidence {
                        source: EvidenceSource::Pattern,
                        category,
                        confidence,
                        detail: excerpt,
                    }
                })),
                Some(transform) => {
                    if let Some((category, confidence, excerpt)) = hits
                        .into_iter()
                        .max_by(|a, b| a.1.total_cmp(&b.1))
                    {
                        evidence.push(Evidence {
                            source: EvidenceSource::Decoded { transform },
                            category: JailbreakCategory::EncodingAttack,
                            confidence: confidence.max(ENCODED_HIT_CONFIDENCE),
                            detail: format!("{} after {} decoding: {}", category, transform, excerpt),
                        });
                    }
                }
            }

            if depth < MAX_DECODE_DEPTH {
                for variant in decode_variants(&candidate) {
                    pending.push((variant.text, depth + 1, Some(variant.transform)));
                }
            }
        }
        evidence
    }

    /// Strongest match per category as `(category, confidence, excerpt)`
    fn pattern_hits(&self, text: &str) -> Vec<(JailbreakCategory, f64, String)> {
        let text_len = text.chars().count();
        if text_len == 0 {
            return Vec::new();
        }

        let mut hits = Vec::new();
        for (category, patterns) in &self.patterns.sets {
            let best = patterns
                .iter()
                .flat_map(|p| p.find_iter(text))
                .filter(|m| !m.as_str().is_empty())
                .map(|m| {
                    let ratio = m.as_str().chars().count() as f64 / text_len as f64;
                    (PATTERN_BASE_CONFIDENCE + 0.3 * ratio, m.as_str())
                })
                .max_by(|a, b| a.0.total_cmp(&b.0));
            if let Some((confidence, matched)) = best {
                hits.push((*category, confidence.min(1.0), excerpt(matched)));
            }
        }
        hits
    }

    fn embedding_evidence(&self, text: &str) -> Option<Evidence> {
        let (model, store) = self.embeddings.as_ref()?;
        let vector = model.embed(text)?;
        let (attack, similarity) = store.nearest(&vector)?;
        (similarity > self.similarity_threshold).then(|| Evidence {
            source: EvidenceSource::Embedding,
            category: attack.category,
            confidence: similarity.clamp(0.0, 1.0),
            detail: format!("similar to known attack '{}' ({:.2})", attack.label, similarity),
        })
    }
}

impl Default for JailbreakDetector {
    fn default() -> Self {
        Self::new(Arc::new(JailbreakPatternSet::builtin()))
    }
}

fn excerpt(matched: &str) -> String {
    if matched.chars().count() <= EXCERPT_CHARS {
        return matched.to_string();
    }
    let cut: String = matched.chars().take(EXCERPT_CHARS).collect();
    format!("{}…", cut)
}
