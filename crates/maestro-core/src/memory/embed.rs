//! Embedding and re-ranking collaborator seams.
//!
//! The memory layer treats embedding production as external: it calls
//! [`Embedder::embed`] and expects L2-normalized vectors. When no real
//! embedder is wired in, [`HashEmbedder`] provides deterministic
//! pseudo-vectors good for id-level deduplication only; it reports itself
//! non-semantic so retrieval falls back to term overlap.

use async_trait::async_trait;
use sha2::{Digest, Sha512};

/// Produces fixed-dimension embeddings for text.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a text. Outputs must be L2-normalized.
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>>;

    /// Whether vectors from this embedder capture semantics. Non-semantic
    /// vectors disable similarity scoring.
    fn is_semantic(&self) -> bool;

    /// Embedding dimension.
    fn dimension(&self) -> usize;
}

/// Optional cross-encoder re-ranking collaborator. Scores (query, candidate)
/// pairs; higher is more relevant.
#[async_trait]
pub trait Reranker: Send + Sync {
    async fn rerank(&self, query: &str, candidates: &[String]) -> anyhow::Result<Vec<f32>>;
}

/// Deterministic hash-chained pseudo-embedder. Last-resort fallback: equal
/// texts map to equal vectors, nothing more.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimension: usize,
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self { dimension: 128 }
    }
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    fn pseudo_vector(&self, text: &str) -> Vec<f32> {
        let mut values = Vec::with_capacity(self.dimension);
        let mut seed = text.as_bytes().to_vec();
        while values.len() < self.dimension {
            let digest = Sha512::digest(&seed);
            for chunk in digest.chunks_exact(8) {
                if values.len() >= self.dimension {
                    break;
                }
                let bits = u64::from_le_bytes(chunk.try_into().expect("8-byte chunk"));
                // Map onto [-1, 1].
                let v = (bits as f64 / u64::MAX as f64) * 2.0 - 1.0;
                values.push(v as f32);
            }
            seed = digest.to_vec();
        }
        l2_normalize(&mut values);
        values
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        Ok(self.pseudo_vector(text))
    }

    fn is_semantic(&self) -> bool {
        false
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Normalize a vector to unit length in place. Zero vectors are left as-is.
pub fn l2_normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Cosine similarity. Mismatched dimensions score zero.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f64 = a.iter().zip(b).map(|(x, y)| (*x as f64) * (*y as f64)).sum();
    let norm_a: f64 = a.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Jaccard overlap of lowercase whitespace-split terms. The retrieval
/// fallback when semantic vectors are unavailable.
pub fn term_similarity(a: &str, b: &str) -> f64 {
    let terms_a: std::collections::HashSet<String> =
        a.to_lowercase().split_whitespace().map(str::to_string).collect();
    let terms_b: std::collections::HashSet<String> =
        b.to_lowercase().split_whitespace().map(str::to_string).collect();
    if terms_a.is_empty() || terms_b.is_empty() {
        return 0.0;
    }
    let intersection = terms_a.intersection(&terms_b).count() as f64;
    let union = terms_a.union(&terms_b).count() as f64;
    intersection / union
}
