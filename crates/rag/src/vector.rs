//! Vector similarity and the in-memory index.
//!
//! Pure-Rust cosine similarity plus a `VectorStore` implementation backed
//! by a map. The in-memory index is rebuilt from the on-disk case files at
//! startup, which keeps it authoritative without its own persistence.

use std::collections::HashMap;

use async_trait::async_trait;
use tokenweave_core::error::RagError;
use tokenweave_core::vector::{MetadataFilter, ScalarMap, VectorMatch, VectorRecord, VectorStore};
use tokio::sync::RwLock;

/// Compute cosine similarity between two vectors.
///
/// Returns a value in [-1, 1] where 1 = identical, 0 = orthogonal.
/// Returns 0.0 if either vector is empty, mismatched, or zero-length.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;

    for (x, y) in a.iter().zip(b.iter()) {
        let x = f64::from(*x);
        let y = f64::from(*y);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < 1e-10 {
        return 0.0;
    }

    (dot / denom) as f32
}

/// An in-memory vector index over cosine distance.
#[derive(Default)]
pub struct InMemoryVectorStore {
    records: RwLock<HashMap<String, VectorRecord>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn upsert(&self, record: VectorRecord) -> Result<(), RagError> {
        self.records.write().await.insert(record.id.clone(), record);
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<VectorMatch>, RagError> {
        let records = self.records.read().await;
        let mut matches: Vec<VectorMatch> = records
            .values()
            .filter(|r| filter.matches(&r.metadata))
            .map(|r| VectorMatch {
                id: r.id.clone(),
                document: r.document.clone(),
                metadata: r.metadata.clone(),
                distance: 1.0 - cosine_similarity(&r.vector, vector),
            })
            .collect();

        matches.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        matches.truncate(k);
        Ok(matches)
    }

    async fn get(&self, filter: &MetadataFilter) -> Result<Vec<VectorRecord>, RagError> {
        let records = self.records.read().await;
        let mut out: Vec<VectorRecord> = records
            .values()
            .filter(|r| filter.matches(&r.metadata))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    async fn get_by_ids(&self, ids: &[String]) -> Result<Vec<VectorRecord>, RagError> {
        let records = self.records.read().await;
        Ok(ids.iter().filter_map(|id| records.get(id).cloned()).collect())
    }

    async fn update_metadata(&self, id: &str, metadata: ScalarMap) -> Result<bool, RagError> {
        let mut records = self.records.write().await;
        match records.get_mut(id) {
            Some(record) => {
                record.metadata = metadata;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, ids: &[String]) -> Result<usize, RagError> {
        let mut records = self.records.write().await;
        let before = records.len();
        for id in ids {
            records.remove(id);
        }
        Ok(before - records.len())
    }

    async fn count(&self) -> Result<usize, RagError> {
        Ok(self.records.read().await.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokenweave_core::vector::Condition;

    fn record(id: &str, vector: Vec<f32>, score: i64) -> VectorRecord {
        let mut metadata = ScalarMap::new();
        metadata.insert("user_feedback_score".into(), score.into());
        VectorRecord {
            id: id.into(),
            document: format!("doc {id}"),
            metadata,
            vector,
        }
    }

    #[test]
    fn identical_vectors_have_similarity_one() {
        let v = vec![0.5, 0.5, 0.7];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn orthogonal_vectors_have_similarity_zero() {
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
    }

    #[test]
    fn zero_vector_yields_zero() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
    }

    #[tokio::test]
    async fn query_orders_by_distance() {
        let store = InMemoryVectorStore::new();
        store.upsert(record("far", vec![0.0, 1.0], 0)).await.unwrap();
        store
            .upsert(record("near", vec![1.0, 0.1], 0))
            .await
            .unwrap();

        let hits = store
            .query(&[1.0, 0.0], 10, &MetadataFilter::new())
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "near");
        assert!(hits[0].distance < hits[1].distance);
    }

    #[tokio::test]
    async fn query_applies_filter_and_limit() {
        let store = InMemoryVectorStore::new();
        for i in 0..5 {
            store
                .upsert(record(&format!("r{i}"), vec![1.0, 0.0], i))
                .await
                .unwrap();
        }
        let filter = MetadataFilter::new().and(Condition::gte("user_feedback_score", 3i64));
        let hits = store.query(&[1.0, 0.0], 1, &filter).await.unwrap();
        assert_eq!(hits.len(), 1);
        let all = store.query(&[1.0, 0.0], 10, &filter).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn upsert_replaces_by_id() {
        let store = InMemoryVectorStore::new();
        store.upsert(record("a", vec![1.0], 0)).await.unwrap();
        store.upsert(record("a", vec![1.0], 1)).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 1);
        let rec = &store.get_by_ids(&["a".into()]).await.unwrap()[0];
        assert_eq!(rec.metadata["user_feedback_score"].as_i64(), Some(1));
    }

    #[tokio::test]
    async fn update_metadata_and_delete() {
        let store = InMemoryVectorStore::new();
        store.upsert(record("a", vec![1.0], 0)).await.unwrap();

        let mut new_meta = ScalarMap::new();
        new_meta.insert("user_feedback_score".into(), 1i64.into());
        assert!(store.update_metadata("a", new_meta).await.unwrap());
        assert!(!store.update_metadata("missing", ScalarMap::new()).await.unwrap());

        assert_eq!(store.delete(&["a".into()]).await.unwrap(), 1);
        assert_eq!(store.count().await.unwrap(), 0);
    }
}
