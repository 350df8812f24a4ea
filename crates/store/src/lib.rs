//! File-backed session store — one JSON document per (user, session).
//!
//! Storage layout: `<root>/<user_id>/<session_id>.json`.
//!
//! Writes are atomic (temp file + rename on the same filesystem) and
//! load-modify-save cycles are serialized per session with an async lock,
//! so concurrent turns for the same session cannot clobber each other.
//! Sessions for different users and sessions proceed independently.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokenweave_core::error::StoreError;
use tokenweave_core::session::SessionStore;
use tokio::sync::Mutex;
use tracing::debug;

/// A file-backed session store.
pub struct FileSessionStore {
    root: PathBuf,
    locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl FileSessionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Load-modify-save under the session's lock. The closure receives the
    /// current document (an empty object for new sessions) and mutates it
    /// in place; the result is persisted atomically.
    pub async fn update<F>(
        &self,
        user_id: &str,
        session_id: &str,
        mutate: F,
    ) -> Result<Value, StoreError>
    where
        F: FnOnce(&mut Value),
    {
        let lock = self.lock_for(user_id, session_id);
        let _guard = lock.lock().await;

        let mut session = self
            .read_document(user_id, session_id)?
            .unwrap_or_else(|| Value::Object(serde_json::Map::new()));
        mutate(&mut session);
        self.write_document(user_id, session_id, &session)?;
        Ok(session)
    }

    fn lock_for(&self, user_id: &str, session_id: &str) -> Arc<Mutex<()>> {
        let key = format!("{user_id}/{session_id}");
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(key).or_default().clone()
    }

    fn session_path(&self, user_id: &str, session_id: &str) -> Result<PathBuf, StoreError> {
        validate_component(user_id)?;
        validate_component(session_id)?;
        Ok(self.root.join(user_id).join(format!("{session_id}.json")))
    }

    fn read_document(&self, user_id: &str, session_id: &str) -> Result<Option<Value>, StoreError> {
        let path = self.session_path(user_id, session_id)?;
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StoreError::Storage(format!(
                    "Failed to read session {}: {e}",
                    path.display()
                )));
            }
        };
        let session = serde_json::from_str(&raw)
            .map_err(|e| StoreError::Serialization(format!("Corrupted session file: {e}")))?;
        Ok(Some(session))
    }

    fn write_document(
        &self,
        user_id: &str,
        session_id: &str,
        session: &Value,
    ) -> Result<(), StoreError> {
        let path = self.session_path(user_id, session_id)?;
        let content = serde_json::to_string_pretty(session)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        write_atomic(&path, &content)?;
        debug!(path = %path.display(), "Session document persisted");
        Ok(())
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn load(&self, user_id: &str, session_id: &str) -> Result<Option<Value>, StoreError> {
        self.read_document(user_id, session_id)
    }

    async fn save(
        &self,
        user_id: &str,
        session_id: &str,
        session: &Value,
    ) -> Result<(), StoreError> {
        let lock = self.lock_for(user_id, session_id);
        let _guard = lock.lock().await;
        self.write_document(user_id, session_id, session)
    }
}

fn validate_component(component: &str) -> Result<(), StoreError> {
    if component.is_empty()
        || component.contains('/')
        || component.contains('\\')
        || component.contains("..")
    {
        return Err(StoreError::Storage(format!(
            "Invalid path component: {component:?}"
        )));
    }
    Ok(())
}

/// Write a file atomically: temp file in the same directory, then rename.
fn write_atomic(path: &Path, content: &str) -> Result<(), StoreError> {
    let parent = path
        .parent()
        .ok_or_else(|| StoreError::Storage(format!("No parent directory for {}", path.display())))?;
    std::fs::create_dir_all(parent)
        .map_err(|e| StoreError::Storage(format!("Failed to create {}: {e}", parent.display())))?;

    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, content)
        .map_err(|e| StoreError::Storage(format!("Failed to write {}: {e}", tmp.display())))?;
    std::fs::rename(&tmp, path)
        .map_err(|e| StoreError::Storage(format!("Failed to rename into {}: {e}", path.display())))
}
