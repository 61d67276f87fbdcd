//! Semantic similarity against known attacks
//!
//! The embedding model is opaque: anything that maps text to a dense
//! vector can plug in. The attack store is a flat list searched linearly,
//! which is fine for the few thousand curated prompts it is meant to hold.

use super::JailbreakCategory;

/// Maps text to a dense vector
pub trait EmbeddingModel: Send + Sync {
    /// `None` when the model cannot embed this text (e.g. too long)
    fn embed(&self, text: &str) -> Option<Vec<f32>>;
}

/// A curated attack prompt and its embedding
#[derive(Debug, Clone)]
pub struct KnownAttack {
    pub label: String,
    pub category: JailbreakCategory,
    pub vector: Vec<f32>,
}

/// Immutable collection of known-attack embeddings
#[derive(Debug, Clone, Default)]
pub struct AttackEmbeddingStore {
    attacks: Vec<KnownAttack>,
}

impl AttackEmbeddingStore {
    pub fn new(attacks: Vec<KnownAttack>) -> Self {
        Self { attacks }
    }

    /// Embed each `(label, category, prompt)` with `model`, skipping failures
    pub fn from_prompts(
        model: &dyn EmbeddingModel,
        prompts: &[(&str, JailbreakCategory, &str)],
    ) -> Self {
        let attacks = prompts
            .iter()
            .filter_map(|(label, category, prompt)| {
                model.embed(prompt).map(|vector| KnownAttack {
                    label: label.to_string(),
                    category: *category,
                    vector,
                })
            })
            .collect();
        Self { attacks }
    }

    pub fn len(&self) -> usize {
        self.attacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attacks.is_empty()
    }

    /// Most similar known attack and its cosine similarity
    pub fn nearest(&self, vector: &[f32]) -> Option<(&KnownAttack, f64)> {
        self.attacks
            .iter()
            .filter_map(|attack| cosine_similarity(vector, &attack.vector).map(|s| (attack, s)))
            .max_by(|a, b| a.1.total_cmp(&b.1))
    }
}

/// Cosine similarity; `None` on length mismatch or zero vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f64> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return None;
    }
    Some(dot / (norm_a.sqrt() * norm_b.sqrt()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_identical_and_orthogonal() {
        assert!((cosine_similarity(&[1.0, 2.0], &[1.0, 2.0]).unwrap() - 1.0).abs() < 1e-9);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).unwrap().abs() < 1e-9);
    }

    #[test]
    fn test_cosine_rejects_mismatch() {
        assert!(cosine_similarity(&[1.0], &[1.0, 2.0]).is_none());
        assert!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]).is_none());
    }

    #[test]
    fn test_nearest() {
        let store = AttackEmbeddingStore::new(vec![
            KnownAttack {
                label: "dan".to_string(),
                category: JailbreakCategory::RoleOverride,
                vector: vec![1.0, 0.0, 0.0],
            },
            KnownAttack {
                label: "grandma".to_string(),
                category: JailbreakCategory::SocialEngineering,
                vector: vec![0.0, 1.0, 0.0],
            },
        ]);
        let (attack, similarity) = store.nearest(&[0.1, 0.9, 0.0]).unwrap();
        assert_eq!(attack.label, "grandma");
        assert!(similarity > 0.9);
    }
}
