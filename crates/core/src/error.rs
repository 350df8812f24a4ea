//! Error types for the Tokenweave domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant.

use thiserror::Error;

/// The top-level error type for all Tokenweave operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Module errors ---
    #[error("Module error: {0}")]
    Module(#[from] ModuleError),

    // --- Registry errors ---
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    // --- RAG errors ---
    #[error("RAG error: {0}")]
    Rag(#[from] RagError),

    // --- Store errors ---
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Cancellation ---
    #[error("Operation cancelled")]
    Cancelled,

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("Module '{module_id}' failed to contribute: {reason}")]
    Contribution { module_id: String, reason: String },

    #[error("Module '{module_id}' failed to condense: {reason}")]
    Condensation { module_id: String, reason: String },

    #[error("Module '{module_id}' timed out after {timeout_secs}s")]
    Timeout { module_id: String, timeout_secs: u64 },

    #[error("Module '{0}' is not purgeable")]
    NotPurgeable(String),

    #[error("Module not found: {0}")]
    NotFound(String),
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("No manifest found at {0}")]
    ManifestMissing(String),

    #[error("Invalid manifest at {path}: {reason}")]
    ManifestInvalid { path: String, reason: String },

    #[error("No handler factory registered for '{factory}' (module '{module_id}')")]
    FactoryNotFound { module_id: String, factory: String },

    #[error("Module '{module_id}' declares capability '{capability}' its handler does not support")]
    UnsupportedCapability {
        module_id: String,
        capability: String,
    },

    #[error("Module '{0}' is already installed")]
    AlreadyInstalled(String),

    #[error("Built-in module '{0}' cannot be uninstalled")]
    BuiltinImmutable(String),

    #[error("Required module '{0}' cannot be uninstalled")]
    RequiredImmutable(String),

    #[error("Module not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(String),
}

#[derive(Debug, Error)]
pub enum RagError {
    #[error("Case not found: {0}")]
    CaseNotFound(String),

    #[error("User '{user_id}' does not have access to collection {collection_id}")]
    AccessDenied { user_id: String, collection_id: i64 },

    #[error("Collection not found: {0}")]
    CollectionNotFound(i64),

    #[error("No default collection for user '{0}'")]
    NoDefaultCollection(String),

    #[error("Invalid collection: {0}")]
    InvalidCollection(String),

    #[error("Invalid case: {0}")]
    InvalidCase(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Embedding generation failed: {0}")]
    Embedding(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_error_displays_correctly() {
        let err = Error::Module(ModuleError::Timeout {
            module_id: "rag_context".into(),
            timeout_secs: 30,
        });
        assert!(err.to_string().contains("rag_context"));
        assert!(err.to_string().contains("30"));
    }

    #[test]
    fn rag_error_displays_correctly() {
        let err = Error::Rag(RagError::AccessDenied {
            user_id: "u-123".into(),
            collection_id: 7,
        });
        assert!(err.to_string().contains("u-123"));
        assert!(err.to_string().contains('7'));
    }
}
