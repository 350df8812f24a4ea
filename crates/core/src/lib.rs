//! # Tokenweave Core
//!
//! Domain types, traits, and error definitions for the Tokenweave context
//! window and retrieval engine. This crate has **zero framework dependencies**
//! — it defines the domain model that all other crates implement against.
//!
//! ## Design Philosophy
//!
//! Every external collaborator (session store, embedder, vector store, tool
//! source) is defined as a trait here. Implementations live in their
//! respective crates. This enables:
//! - Swapping implementations via configuration
//! - Easy testing with mock/stub implementations
//! - Clean dependency graph (all crates depend inward on core)

pub mod embed;
pub mod error;
pub mod message;
pub mod module;
pub mod profile;
pub mod session;
pub mod token;
pub mod tool;
pub mod vector;

// Re-export key types at crate root for ergonomics
pub use embed::Embedder;
pub use error::{Error, ModuleError, RagError, RegistryError, Result, StoreError};
pub use message::{ChatMessage, MessageContent};
pub use module::{AssemblyContext, ContextModule, Contribution, Dependencies, PurgeOutcome};
pub use profile::ProfileType;
pub use session::SessionStore;
pub use token::{estimate_tokens, estimate_tokens_for_messages, tokens_to_chars};
pub use tool::{PromptDefinition, ToolDefinition, ToolSource};
pub use vector::{
    Condition, FilterOp, MetadataFilter, ScalarMap, ScalarValue, VectorMatch, VectorRecord,
    VectorStore,
};
