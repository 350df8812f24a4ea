//! # Tokenweave RAG
//!
//! The retrieval and feedback engine: per-collection case indexing,
//! access-scoped semantic retrieval, and transactional champion
//! maintenance.
//!
//! A *case* is one successful (or failed-for-analysis) strategy extracted
//! from a completed turn, persisted as a JSON file under its collection's
//! directory and indexed by the embedding of its user query. Per
//! (collection, query, user) at most one case carries the
//! `is_most_efficient` flag — the *champion* — elected on every new turn
//! and re-elected when feedback demotes the incumbent.

pub mod case;
pub mod catalog;
pub mod embed;
pub mod fewshot;
pub mod retriever;
pub mod vector;

pub use case::{
    CaseStudy, PlanPhase, StrategyType, TraceAction, TraceEntry, TraceResult, TurnSummary,
    extract_case,
};
pub use catalog::{
    ChunkingParams, CollectionCatalog, RagAccessContext, RagCollection, RepositoryType, Visibility,
};
pub use embed::{EmbedderRegistry, HashingEmbedder};
pub use fewshot::{RetrievedCase, format_few_shot_example};
pub use retriever::RagRetriever;
pub use vector::{InMemoryVectorStore, cosine_similarity};
