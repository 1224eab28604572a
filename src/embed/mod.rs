//! Embedding generation
//!
//! This module provides an abstraction over embedding models with:
//! - A trait for different embedding backends
//! - An HTTP backend for embedding sidecars
//! - A deterministic hashing backend for tests and offline use
//! - Batched, time-bounded calls

mod hashing;
mod http_backend;

pub use hashing::HashEmbedder;
pub use http_backend::HttpEmbedder;

use crate::config::EmbeddingConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Scale a vector to unit length; zero vectors are returned unchanged
pub fn normalize_embedding(vector: &[f32]) -> Vec<f32> {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm == 0.0 {
        return vector.to_vec();
    }
    vector.iter().map(|v| v / norm).collect()
}

/// Cosine similarity of two equal-length vectors; 0.0 if either is zero
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut na = 0.0f32;
    let mut nb = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

/// Trait for embedding providers
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a batch of texts, one vector per input in input order
    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>>;

    /// Get the embedding dimension
    fn dimension(&self) -> usize;

    /// Get the model name
    fn model_name(&self) -> &str;
}

/// Create an embedder based on configuration
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    match config.backend.to_lowercase().as_str() {
        "http" | "https" => Ok(Arc::new(HttpEmbedder::new(config)?)),
        "hash" => Ok(Arc::new(HashEmbedder::new(config.dimension))),
        other => Err(Error::Config(format!(
            "Unsupported embedding backend '{}'; expected 'http' or 'hash'",
            other
        ))),
    }
}

/// Embed `texts` in chunks of `batch_size`, bounding each call by `timeout`
pub async fn embed_in_batches(
    embedder: &dyn Embedder,
    texts: Vec<String>,
    batch_size: usize,
    timeout: Duration,
) -> Result<Vec<Vec<f32>>> {
    let mut all_embeddings = Vec::with_capacity(texts.len());

    for chunk in texts.chunks(batch_size.max(1)) {
        let batch_texts: Vec<String> = chunk.to_vec();
        let embeddings = tokio::time::timeout(timeout, embedder.embed(batch_texts))
            .await
            .map_err(|_| {
                Error::EmbeddingUnavailable(format!(
                    "model '{}' did not answer within {:?}",
                    embedder.model_name(),
                    timeout
                ))
            })??;
        if embeddings.len() != chunk.len() {
            return Err(Error::EmbeddingUnavailable(format!(
                "expected {} vectors, provider returned {}",
                chunk.len(),
                embeddings.len()
            )));
        }
        debug!("Embedded batch of {} texts", chunk.len());
        all_embeddings.extend(embeddings);
    }

    Ok(all_embeddings)
}

/// Embed a single question
pub async fn embed_query(
    embedder: &dyn Embedder,
    text: &str,
    timeout: Duration,
) -> Result<Vec<f32>> {
    embed_in_batches(embedder, vec![text.to_string()], 1, timeout)
        .await?
        .pop()
        .ok_or_else(|| Error::EmbeddingUnavailable("provider returned no vector".to_string()))
}
