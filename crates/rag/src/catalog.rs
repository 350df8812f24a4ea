//! Collection catalog and the multi-tenant access model.
//!
//! Collections are per-owner containers of indexed cases. The catalog is
//! the in-memory registry of collection records plus subscription edges;
//! it answers the access questions the retriever needs:
//!
//! - readable for user U = admin-owned ∪ owned by U ∪ public/unlisted ∪ subscribed
//! - writable for user U = owned by U only

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tokenweave_core::error::RagError;

/// The two collection kinds. Planner collections index strategy cases and
/// are tied to an MCP server; knowledge collections index document chunks
/// and load unconditionally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepositoryType {
    #[default]
    Planner,
    Knowledge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    #[default]
    Private,
    Unlisted,
    Public,
}

/// Chunking parameters, meaningful for knowledge collections only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingParams {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

/// A collection record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagCollection {
    pub id: i64,
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,

    #[serde(default)]
    pub repository_type: RepositoryType,

    /// `None` marks an admin-owned collection, readable by everyone.
    #[serde(default)]
    pub owner_user_id: Option<String>,

    #[serde(default)]
    pub visibility: Visibility,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Required for planner collections.
    #[serde(default)]
    pub mcp_server_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunking: Option<ChunkingParams>,

    /// Created at user registration; protected from removal.
    #[serde(default)]
    pub is_default: bool,
}

fn default_embedding_model() -> String {
    "all-MiniLM-L6-v2".into()
}

fn default_true() -> bool {
    true
}

impl RagCollection {
    fn validate(&self) -> Result<(), RagError> {
        if self.repository_type == RepositoryType::Planner && self.mcp_server_id.is_none() {
            return Err(RagError::InvalidCollection(format!(
                "Planner collection '{}' (id {}) requires an MCP server id",
                self.name, self.id
            )));
        }
        Ok(())
    }
}

#[derive(Default)]
#[derive(Debug)]
struct CatalogState {
    collections: Vec<RagCollection>,
    /// (user_id, collection_id) subscription edges.
    subscriptions: HashSet<(String, i64)>,
}

/// The in-memory collection registry.
#[derive(Debug, Default)]
pub struct CollectionCatalog {
    state: std::sync::RwLock<CatalogState>,
}

impl CollectionCatalog {
    pub fn new(collections: Vec<RagCollection>) -> Result<Self, RagError> {
        for coll in &collections {
            coll.validate()?;
        }
        Ok(Self {
            state: std::sync::RwLock::new(CatalogState {
                collections,
                subscriptions: HashSet::new(),
            }),
        })
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, CatalogState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, CatalogState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, collection_id: i64) -> Option<RagCollection> {
        self.read()
            .collections
            .iter()
            .find(|c| c.id == collection_id)
            .cloned()
    }

    pub fn all(&self) -> Vec<RagCollection> {
        self.read().collections.clone()
    }

    /// Register a new collection. Ids must be unique; planner collections
    /// must carry an MCP server id.
    pub fn add(&self, collection: RagCollection) -> Result<(), RagError> {
        collection.validate()?;
        let mut state = self.write();
        if state.collections.iter().any(|c| c.id == collection.id) {
            return Err(RagError::InvalidCollection(format!(
                "Collection id {} already exists",
                collection.id
            )));
        }
        state.collections.push(collection);
        Ok(())
    }

    /// Remove a collection. Only the owner may remove it, and default
    /// collections are protected.
    pub fn remove(&self, collection_id: i64, user_id: &str) -> Result<RagCollection, RagError> {
        let mut state = self.write();
        let idx = state
            .collections
            .iter()
            .position(|c| c.id == collection_id)
            .ok_or(RagError::CollectionNotFound(collection_id))?;

        let coll = &state.collections[idx];
        if coll.owner_user_id.as_deref() != Some(user_id) {
            return Err(RagError::AccessDenied {
                user_id: user_id.to_string(),
                collection_id,
            });
        }
        if coll.is_default {
            return Err(RagError::InvalidCollection(format!(
                "Default collection {collection_id} cannot be removed"
            )));
        }
        let removed = state.collections.remove(idx);
        state.subscriptions.retain(|(_, cid)| *cid != collection_id);
        Ok(removed)
    }

    pub fn set_enabled(&self, collection_id: i64, enabled: bool) -> Result<(), RagError> {
        let mut state = self.write();
        let coll = state
            .collections
            .iter_mut()
            .find(|c| c.id == collection_id)
            .ok_or(RagError::CollectionNotFound(collection_id))?;
        coll.enabled = enabled;
        Ok(())
    }

    pub fn subscribe(&self, user_id: &str, collection_id: i64) -> Result<(), RagError> {
        if self.get(collection_id).is_none() {
            return Err(RagError::CollectionNotFound(collection_id));
        }
        self.write()
            .subscriptions
            .insert((user_id.to_string(), collection_id));
        Ok(())
    }

    pub fn unsubscribe(&self, user_id: &str, collection_id: i64) {
        self.write()
            .subscriptions
            .remove(&(user_id.to_string(), collection_id));
    }

    pub fn is_subscribed(&self, collection_id: i64, user_id: &str) -> bool {
        self.read()
            .subscriptions
            .contains(&(user_id.to_string(), collection_id))
    }

    /// Ownership check. Admin-owned collections (owner = None) are owned
    /// by nobody here: they are readable by everyone, writable by no one.
    pub fn is_owner(&self, collection_id: i64, user_id: &str) -> bool {
        self.get(collection_id)
            .is_some_and(|c| c.owner_user_id.as_deref() == Some(user_id))
    }

    /// Collection ids the user may read.
    pub fn accessible_collections(&self, user_id: Option<&str>) -> HashSet<i64> {
        let state = self.read();
        state
            .collections
            .iter()
            .filter(|c| {
                c.owner_user_id.is_none()
                    || matches!(c.visibility, Visibility::Public | Visibility::Unlisted)
                    || user_id.is_some_and(|u| {
                        c.owner_user_id.as_deref() == Some(u)
                            || state.subscriptions.contains(&(u.to_string(), c.id))
                    })
            })
            .map(|c| c.id)
            .collect()
    }

    /// The user's default collection: the one flagged `is_default`, else
    /// the lowest-id collection they own.
    pub fn default_collection_id(&self, user_id: &str) -> Option<i64> {
        let state = self.read();
        let mut owned: Vec<&RagCollection> = state
            .collections
            .iter()
            .filter(|c| c.owner_user_id.as_deref() == Some(user_id))
            .collect();
        owned.sort_by_key(|c| c.id);
        owned
            .iter()
            .find(|c| c.is_default)
            .or_else(|| owned.first())
            .map(|c| c.id)
    }
}

/// Resolved access for one user, computed once per operation.
#[derive(Debug, Clone)]
pub struct RagAccessContext {
    pub user_id: String,
    accessible: HashSet<i64>,
    owned: HashSet<i64>,
}

impl RagAccessContext {
    pub fn for_user(catalog: &CollectionCatalog, user_id: impl Into<String>) -> Self {
        let user_id = user_id.into();
        let accessible = catalog.accessible_collections(Some(&user_id));
        let owned = catalog
            .all()
            .into_iter()
            .filter(|c| c.owner_user_id.as_deref() == Some(user_id.as_str()))
            .map(|c| c.id)
            .collect();
        Self {
            user_id,
            accessible,
            owned,
        }
    }

    pub fn can_read(&self, collection_id: i64) -> bool {
        self.accessible.contains(&collection_id)
    }

    /// Subscribed and public collections do not confer write access.
    pub fn can_write(&self, collection_id: i64) -> bool {
        self.owned.contains(&collection_id)
    }

    pub fn accessible(&self) -> &HashSet<i64> {
        &self.accessible
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn planner(id: i64, owner: Option<&str>) -> RagCollection {
        RagCollection {
            id,
            name: format!("collection-{id}"),
            description: String::new(),
            embedding_model: default_embedding_model(),
            repository_type: RepositoryType::Planner,
            owner_user_id: owner.map(String::from),
            visibility: Visibility::Private,
            enabled: true,
            mcp_server_id: Some("server-1".into()),
            chunking: None,
            is_default: false,
        }
    }

    #[test]
    fn planner_without_server_is_rejected() {
        let mut coll = planner(1, Some("u1"));
        coll.mcp_server_id = None;
        let err = CollectionCatalog::new(vec![coll]).unwrap_err();
        assert!(err.to_string().contains("MCP server"));
    }

    #[test]
    fn knowledge_without_server_is_fine() {
        let mut coll = planner(1, Some("u1"));
        coll.repository_type = RepositoryType::Knowledge;
        coll.mcp_server_id = None;
        assert!(CollectionCatalog::new(vec![coll]).is_ok());
    }

    #[test]
    fn access_set_covers_all_four_rules() {
        let admin_owned = planner(1, None);
        let owned = planner(2, Some("u1"));
        let mut public = planner(3, Some("u2"));
        public.visibility = Visibility::Public;
        let private_other = planner(4, Some("u2"));
        let subscribed = planner(5, Some("u2"));

        let catalog =
            CollectionCatalog::new(vec![admin_owned, owned, public, private_other, subscribed])
                .unwrap();
        catalog.subscribe("u1", 5).unwrap();

        let accessible = catalog.accessible_collections(Some("u1"));
        assert!(accessible.contains(&1), "admin-owned readable");
        assert!(accessible.contains(&2), "owned readable");
        assert!(accessible.contains(&3), "public readable");
        assert!(!accessible.contains(&4), "private foreign not readable");
        assert!(accessible.contains(&5), "subscribed readable");
    }

    #[test]
    fn write_access_is_owner_only() {
        let catalog = CollectionCatalog::new(vec![
            planner(1, None),
            planner(2, Some("u1")),
            planner(3, Some("u2")),
        ])
        .unwrap();
        catalog.subscribe("u1", 3).unwrap();

        let access = RagAccessContext::for_user(&catalog, "u1");
        assert!(access.can_write(2));
        assert!(!access.can_write(1), "admin-owned not writable");
        assert!(!access.can_write(3), "subscribed not writable");
        assert!(access.can_read(3));
    }

    #[test]
    fn default_collection_cannot_be_removed() {
        let mut coll = planner(1, Some("u1"));
        coll.is_default = true;
        let catalog = CollectionCatalog::new(vec![coll]).unwrap();
        let err = catalog.remove(1, "u1").unwrap_err();
        assert!(err.to_string().contains("cannot be removed"));
    }

    #[test]
    fn only_owner_removes() {
        let catalog = CollectionCatalog::new(vec![planner(1, Some("u1"))]).unwrap();
        assert!(catalog.remove(1, "u2").is_err());
        assert!(catalog.remove(1, "u1").is_ok());
        assert!(catalog.get(1).is_none());
    }

    #[test]
    fn default_collection_prefers_flag_then_lowest_id() {
        let mut flagged = planner(9, Some("u1"));
        flagged.is_default = true;
        let catalog =
            CollectionCatalog::new(vec![planner(5, Some("u1")), flagged, planner(2, Some("u2"))])
                .unwrap();
        assert_eq!(catalog.default_collection_id("u1"), Some(9));
        assert_eq!(catalog.default_collection_id("u2"), Some(2));
        assert_eq!(catalog.default_collection_id("nobody"), None);
    }

    #[test]
    fn duplicate_id_rejected_on_add() {
        let catalog = CollectionCatalog::new(vec![planner(1, Some("u1"))]).unwrap();
        assert!(catalog.add(planner(1, Some("u2"))).is_err());
        assert!(catalog.add(planner(2, Some("u2"))).is_ok());
    }
}
