//! Session store trait — persistent per-session documents.
//!
//! The session store is an external collaborator. The engine only requires
//! load/save of a JSON document with atomic write semantics; implementations
//! must serialize load-modify-save cycles per session (concurrent writers
//! for the same session would otherwise clobber each other).

use async_trait::async_trait;
use serde_json::Value;

use crate::error::StoreError;

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Load a session document. Returns `None` when the session does not exist.
    async fn load(&self, user_id: &str, session_id: &str) -> Result<Option<Value>, StoreError>;

    /// Persist a session document atomically.
    async fn save(&self, user_id: &str, session_id: &str, session: &Value)
        -> Result<(), StoreError>;
}
