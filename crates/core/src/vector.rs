//! Vector store trait and the flat scalar metadata model.
//!
//! Per-collection vector indexes are external collaborators. Metadata must
//! be flat scalars — no nested objects, no nulls — which the `ScalarValue`
//! type enforces by construction. The filter language is deliberately
//! small: a conjunction of conditions plus one optional disjunction group,
//! which is all the retrieval and champion paths need.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::RagError;

/// A flat scalar metadata value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScalarValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl ScalarValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ScalarValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ScalarValue::Int(i) => Some(*i),
            ScalarValue::Float(f) => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ScalarValue::Int(i) => Some(*i as f64),
            ScalarValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ScalarValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Ordering used by range filters. Numbers compare numerically across
    /// Int/Float; text compares lexicographically; mixed kinds compare as
    /// unordered.
    fn compare(&self, other: &ScalarValue) -> Option<std::cmp::Ordering> {
        match (self, other) {
            (ScalarValue::Text(a), ScalarValue::Text(b)) => Some(a.cmp(b)),
            (ScalarValue::Bool(a), ScalarValue::Bool(b)) => Some(a.cmp(b)),
            _ => {
                let a = self.as_f64()?;
                let b = other.as_f64()?;
                a.partial_cmp(&b)
            }
        }
    }
}

impl From<bool> for ScalarValue {
    fn from(v: bool) -> Self {
        ScalarValue::Bool(v)
    }
}

impl From<i64> for ScalarValue {
    fn from(v: i64) -> Self {
        ScalarValue::Int(v)
    }
}

impl From<i32> for ScalarValue {
    fn from(v: i32) -> Self {
        ScalarValue::Int(v as i64)
    }
}

impl From<usize> for ScalarValue {
    fn from(v: usize) -> Self {
        ScalarValue::Int(v as i64)
    }
}

impl From<f64> for ScalarValue {
    fn from(v: f64) -> Self {
        ScalarValue::Float(v)
    }
}

impl From<&str> for ScalarValue {
    fn from(v: &str) -> Self {
        ScalarValue::Text(v.to_string())
    }
}

impl From<String> for ScalarValue {
    fn from(v: String) -> Self {
        ScalarValue::Text(v)
    }
}

/// Flat metadata attached to every indexed record.
pub type ScalarMap = BTreeMap<String, ScalarValue>;

/// A record stored in a vector index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorRecord {
    pub id: String,
    pub document: String,
    pub metadata: ScalarMap,
    pub vector: Vec<f32>,
}

/// A query hit: record fields plus cosine distance (1 − similarity).
#[derive(Debug, Clone)]
pub struct VectorMatch {
    pub id: String,
    pub document: String,
    pub metadata: ScalarMap,
    pub distance: f32,
}

/// Comparison operators available to metadata filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Gt,
    Gte,
}

/// One metadata condition.
#[derive(Debug, Clone)]
pub struct Condition {
    pub field: String,
    pub op: FilterOp,
    pub value: ScalarValue,
}

impl Condition {
    pub fn eq(field: impl Into<String>, value: impl Into<ScalarValue>) -> Self {
        Self {
            field: field.into(),
            op: FilterOp::Eq,
            value: value.into(),
        }
    }

    pub fn gt(field: impl Into<String>, value: impl Into<ScalarValue>) -> Self {
        Self {
            field: field.into(),
            op: FilterOp::Gt,
            value: value.into(),
        }
    }

    pub fn gte(field: impl Into<String>, value: impl Into<ScalarValue>) -> Self {
        Self {
            field: field.into(),
            op: FilterOp::Gte,
            value: value.into(),
        }
    }

    fn matches(&self, metadata: &ScalarMap) -> bool {
        let Some(actual) = metadata.get(&self.field) else {
            return false;
        };
        match self.op {
            FilterOp::Eq => actual == &self.value,
            FilterOp::Gt => matches!(
                actual.compare(&self.value),
                Some(std::cmp::Ordering::Greater)
            ),
            FilterOp::Gte => matches!(
                actual.compare(&self.value),
                Some(std::cmp::Ordering::Greater | std::cmp::Ordering::Equal)
            ),
        }
    }
}

/// A metadata filter: every `all` condition must hold, and — when the
/// `any` group is non-empty — at least one of its conditions must hold.
#[derive(Debug, Clone, Default)]
pub struct MetadataFilter {
    pub all: Vec<Condition>,
    pub any: Vec<Condition>,
}

impl MetadataFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn and(mut self, condition: Condition) -> Self {
        self.all.push(condition);
        self
    }

    pub fn or(mut self, condition: Condition) -> Self {
        self.any.push(condition);
        self
    }

    pub fn matches(&self, metadata: &ScalarMap) -> bool {
        let all_ok = self.all.iter().all(|c| c.matches(metadata));
        let any_ok = self.any.is_empty() || self.any.iter().any(|c| c.matches(metadata));
        all_ok && any_ok
    }
}

/// The per-collection vector store interface.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert or replace a record by id.
    async fn upsert(&self, record: VectorRecord) -> Result<(), RagError>;

    /// Nearest-neighbour search, filtered, at most `k` results ordered by
    /// ascending distance.
    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<VectorMatch>, RagError>;

    /// Fetch all records matching a filter.
    async fn get(&self, filter: &MetadataFilter) -> Result<Vec<VectorRecord>, RagError>;

    /// Fetch records by id; missing ids are simply absent from the result.
    async fn get_by_ids(&self, ids: &[String]) -> Result<Vec<VectorRecord>, RagError>;

    /// Replace a record's metadata. Returns false when the id is unknown.
    async fn update_metadata(&self, id: &str, metadata: ScalarMap) -> Result<bool, RagError>;

    /// Delete records by id, returning how many were removed.
    async fn delete(&self, ids: &[String]) -> Result<usize, RagError>;

    /// Number of records in the index.
    async fn count(&self) -> Result<usize, RagError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> ScalarMap {
        let mut m = ScalarMap::new();
        m.insert("strategy_type".into(), "successful".into());
        m.insert("user_feedback_score".into(), 0i64.into());
        m.insert("is_most_efficient".into(), true.into());
        m.insert("output_tokens".into(), 1800i64.into());
        m
    }

    #[test]
    fn eq_condition_matches() {
        assert!(Condition::eq("strategy_type", "successful").matches(&meta()));
        assert!(!Condition::eq("strategy_type", "failed").matches(&meta()));
    }

    #[test]
    fn gte_condition_compares_numbers() {
        assert!(Condition::gte("user_feedback_score", 0i64).matches(&meta()));
        assert!(!Condition::gt("user_feedback_score", 0i64).matches(&meta()));
    }

    #[test]
    fn missing_field_never_matches() {
        assert!(!Condition::eq("nope", 1i64).matches(&meta()));
    }

    #[test]
    fn int_and_float_compare_numerically() {
        let mut m = ScalarMap::new();
        m.insert("confidence".into(), ScalarValue::Float(0.9));
        assert!(Condition::gt("confidence", ScalarValue::Int(0)).matches(&m));
    }

    #[test]
    fn filter_combines_all_and_any() {
        let filter = MetadataFilter::new()
            .and(Condition::eq("strategy_type", "successful"))
            .and(Condition::gte("user_feedback_score", 0i64))
            .or(Condition::eq("is_most_efficient", true))
            .or(Condition::gt("user_feedback_score", 0i64));
        assert!(filter.matches(&meta()));

        let mut not_champion = meta();
        not_champion.insert("is_most_efficient".into(), false.into());
        assert!(!filter.matches(&not_champion));
    }

    #[test]
    fn empty_filter_matches_everything() {
        assert!(MetadataFilter::new().matches(&meta()));
        assert!(MetadataFilter::new().matches(&ScalarMap::new()));
    }
}
