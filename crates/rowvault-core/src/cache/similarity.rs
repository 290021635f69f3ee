//! Query-text similarity for "queries like this one" suggestions.
//!
//! Cosine similarity over embeddings when an [`Embedder`] is configured,
//! keyword overlap (Jaccard) otherwise.

use crate::VaultError;
use std::collections::BTreeSet;

/// Optional embedding backend.
pub trait Embedder: Send + Sync {
    /// Embed a query text. Vectors from one embedder share a dimension.
    fn embed(&self, text: &str) -> Result<Vec<f32>, VaultError>;
}

/// Cosine similarity; 0.0 for mismatched dimensions or zero vectors.
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}

/// Lowercased alphanumeric keywords of a query, with one-letter words dropped.
pub fn keywords(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|w| w.chars().count() > 1)
        .map(str::to_lowercase)
        .collect()
}

/// Jaccard index of two keyword sets; 0.0 when both are empty.
#[must_use]
pub fn jaccard_similarity(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f32 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f32 / union as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_basics() {
        assert!((cosine_similarity(&[1.0, 0.0, 0.0], &[1.0, 0.0, 0.0]) - 1.0).abs() < 0.001);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 0.001);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
    }

    #[test]
    fn keyword_overlap() {
        let a = keywords("foreach d in network.devices select d.name");
        let b = keywords("select device names from network.devices");
        let score = jaccard_similarity(&a, &b);
        assert!(score > 0.0 && score < 1.0);
        assert_eq!(jaccard_similarity(&a, &a), 1.0);
        assert_eq!(jaccard_similarity(&BTreeSet::new(), &BTreeSet::new()), 0.0);
    }

    #[test]
    fn keywords_drop_single_letters() {
        let k: Vec<String> = keywords("d in Devices").into_iter().collect();
        assert_eq!(k, vec!["devices", "in"]);
    }
}
