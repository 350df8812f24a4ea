//! Embedding service trait.
//!
//! Each collection names its own embedding model; the retriever keeps one
//! encoder per model value and never asks the user to pick one. Encoders
//! are external collaborators — the engine only consumes this trait.

use async_trait::async_trait;

use crate::error::RagError;

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Dimension of the vectors this encoder produces.
    fn dimension(&self) -> usize;

    /// Embed a batch of texts, one vector per input.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RagError>;
}
