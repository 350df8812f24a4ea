//! Embedding providers and the per-model encoder cache.
//!
//! Collections carry their own embedding model name; the registry hands
//! out one cached encoder per model value. The built-in default is a
//! deterministic feature-hashing encoder so the engine runs with no model
//! downloads; deployments register real encoders per model name.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokenweave_core::embed::Embedder;
use tokenweave_core::error::RagError;
use tracing::debug;

/// Deterministic bag-of-words feature hashing encoder.
///
/// Tokens are lowercased alphanumeric runs; each token is hashed into one
/// of `dimension` buckets with a hash-derived sign, and the result is
/// L2-normalized. Identical texts embed identically; texts sharing tokens
/// land near each other.
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        let lowered = text.to_lowercase();
        for token in lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let digest = Sha256::digest(token.as_bytes());
            let bucket =
                u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]) as usize
                    % self.dimension;
            let sign = if digest[4] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }

        let norm = vector.iter().map(|v| f64::from(*v) * f64::from(*v)).sum::<f64>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v = (f64::from(*v) / norm) as f32;
            }
        }
        vector
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RagError> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

/// One cached encoder per embedding-model name.
pub struct EmbedderRegistry {
    fallback: Arc<dyn Embedder>,
    by_model: std::sync::RwLock<HashMap<String, Arc<dyn Embedder>>>,
}

impl EmbedderRegistry {
    pub fn new(fallback: Arc<dyn Embedder>) -> Self {
        Self {
            fallback,
            by_model: std::sync::RwLock::new(HashMap::new()),
        }
    }

    /// Register an encoder for a specific model name.
    pub fn register(&self, model: impl Into<String>, embedder: Arc<dyn Embedder>) {
        let model = model.into();
        debug!(model = %model, "Registered embedding encoder");
        self.by_model
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(model, embedder);
    }

    /// Get the encoder for a model, falling back to the default. The
    /// resolution is cached so every collection naming the same model
    /// shares one encoder instance.
    pub fn for_model(&self, model: &str) -> Arc<dyn Embedder> {
        {
            let cache = self.by_model.read().unwrap_or_else(|e| e.into_inner());
            if let Some(embedder) = cache.get(model) {
                return embedder.clone();
            }
        }
        let mut cache = self.by_model.write().unwrap_or_else(|e| e.into_inner());
        cache
            .entry(model.to_string())
            .or_insert_with(|| self.fallback.clone())
            .clone()
    }
}

impl Default for EmbedderRegistry {
    fn default() -> Self {
        Self::new(Arc::new(HashingEmbedder::default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::cosine_similarity;

    #[tokio::test]
    async fn embedding_is_deterministic() {
        let embedder = HashingEmbedder::default();
        let texts = vec!["top 10 customers by revenue".to_string()];
        let a = embedder.embed(&texts).await.unwrap();
        let b = embedder.embed(&texts).await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn identical_texts_have_similarity_one() {
        let embedder = HashingEmbedder::default();
        let texts = vec!["show me the sales table".to_string()];
        let vectors = embedder.embed(&texts).await.unwrap();
        assert!((cosine_similarity(&vectors[0], &vectors[0]) - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn overlapping_texts_are_closer_than_disjoint() {
        let embedder = HashingEmbedder::default();
        let texts = vec![
            "top customers by revenue".to_string(),
            "top customers by profit".to_string(),
            "weather forecast tomorrow zurich".to_string(),
        ];
        let v = embedder.embed(&texts).await.unwrap();
        let close = cosine_similarity(&v[0], &v[1]);
        let far = cosine_similarity(&v[0], &v[2]);
        assert!(close > far);
    }

    #[tokio::test]
    async fn vectors_are_normalized() {
        let embedder = HashingEmbedder::default();
        let v = embedder
            .embed(&["some query text".to_string()])
            .await
            .unwrap();
        let norm: f64 = v[0].iter().map(|x| f64::from(*x) * f64::from(*x)).sum();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn registry_caches_per_model() {
        let registry = EmbedderRegistry::default();
        let a = registry.for_model("all-MiniLM-L6-v2");
        let b = registry.for_model("all-MiniLM-L6-v2");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn registered_encoder_takes_precedence() {
        let registry = EmbedderRegistry::default();
        let custom: Arc<dyn Embedder> = Arc::new(HashingEmbedder::new(64));
        registry.register("small", custom.clone());
        assert_eq!(registry.for_model("small").dimension(), 64);
        assert_eq!(registry.for_model("other").dimension(), 256);
    }
}
