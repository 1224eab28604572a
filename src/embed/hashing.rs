use super::{normalize_embedding, Embedder};
use crate::error::Result;
use crate::text;
use async_trait::async_trait;

/// Feature-hashing embedder over stemmed terms
///
/// Each term is hashed with blake3 into a bucket and a sign; the resulting
/// bag-of-terms vector is L2-normalised. Texts sharing vocabulary get high
/// cosine similarity, which is enough for deterministic ranking tests and
/// for running without an embedding service.
pub struct HashEmbedder {
    dimension: usize,
    model: String,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        let dimension = dimension.max(1);
        Self {
            dimension,
            model: format!("blake3-hash-{}", dimension),
        }
    }

    fn embed_one(&self, input: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        for term in text::terms(input) {
            let hash = blake3::hash(term.as_bytes());
            let bytes = hash.as_bytes();
            let mut bucket_bytes = [0u8; 8];
            bucket_bytes.copy_from_slice(&bytes[..8]);
            let bucket = (u64::from_le_bytes(bucket_bytes) % self.dimension as u64) as usize;
            let sign = if bytes[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        normalize_embedding(&vector)
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
