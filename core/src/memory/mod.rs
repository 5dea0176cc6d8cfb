//! Layered memory engine: episodic log, consolidated long-term facts,
//! decay, hybrid retrieval, and the consolidation pass that folds episodes
//! into memories. Grounded on the teacher's `memory/store.rs` (schema and
//! migration patterns, `Arc<Mutex<...>>`-wrapped model handle,
//! `spawn_blocking` for CPU-bound work) and `memory/categorizer.rs`
//! (LLM-prompted categorization, the consolidation engine's closest
//! teacher analogue).

pub mod consolidated;
pub mod consolidation;
pub mod decay;
pub mod embedding;
pub mod episodic;
pub mod retrieval;
pub mod soul;

pub use consolidated::{
    ConsolidatedMemory, ConsolidatedMemoryStore, MemoryCategory, NewConsolidatedMemory, SearchFilter,
};
pub use consolidation::{ConsolidationEngine, ConsolidationOptions, ConsolidationReport};
pub use decay::{DecayConfig, DecayEngine, DecayReport};
pub use embedding::EmbeddingService;
pub use episodic::{Episode, EpisodeRole, EpisodicStore, Importance, NewEpisode, SearchOptions, Tone};
pub use retrieval::{GoalCandidate, RetrievalConfig, RetrievalEntry, RetrievalPipeline, RetrievalResult};
pub use soul::SoulDocument;

/// Cosine similarity between two vectors. Returns 0 for null/zero-norm
/// vectors, per spec.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || b.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// `ceil(len/4) + 4`, the token-cost estimator used throughout retrieval,
/// working memory, and plan-size accounting.
pub fn estimate_tokens(text: &str) -> usize {
    ((text.len() + 3) / 4) + 4
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_of_identical_vectors_is_one() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_of_zero_vector_is_zero() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn cosine_of_empty_is_zero() {
        assert_eq!(cosine_similarity(&[], &[1.0]), 0.0);
    }

    #[test]
    fn token_estimate_matches_formula() {
        assert_eq!(estimate_tokens(""), 4);
        assert_eq!(estimate_tokens("abcd"), 5);
        assert_eq!(estimate_tokens("abcde"), 6);
    }
}
