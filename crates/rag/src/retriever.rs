//! The RAG retriever — per-collection indexing, access-scoped retrieval,
//! and champion maintenance.
//!
//! Each collection is a directory of case JSON files plus a vector index
//! keyed on the embedding of each case's user query. The on-disk files are
//! the source of truth; indexes are rebuilt from them when empty. Champion
//! transactions (election, demotion, re-election) are serialized with a
//! per-collection lock, and every case-file write is atomic.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokenweave_core::embed::Embedder;
use tokenweave_core::error::RagError;
use tokenweave_core::vector::{Condition, MetadataFilter, ScalarValue, VectorRecord, VectorStore};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::case::{self, CaseStudy, StrategyType, TurnSummary};
use crate::catalog::{CollectionCatalog, RagAccessContext, RagCollection, RepositoryType};
use crate::embed::EmbedderRegistry;
use crate::fewshot::RetrievedCase;
use crate::vector::InMemoryVectorStore;

/// Penalty subtracted from similarity per mid-flight correction kind, so a
/// clean strategy outranks an equally relevant corrected one without
/// hiding highly relevant cases behind hard filters.
const PENALTY_TACTICAL: f64 = 0.05;
const PENALTY_PLAN: f64 = 0.05;

/// Candidate multiplier: ask the index for `k × 10` before re-ranking.
const CANDIDATE_FACTOR: usize = 10;

/// Produces a fresh vector index for a collection.
pub type StoreFactory = dyn Fn(&RagCollection) -> Arc<dyn VectorStore> + Send + Sync;

#[derive(Clone)]
struct CollectionHandle {
    meta: RagCollection,
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    champion_lock: Arc<Mutex<()>>,
}

pub struct RagRetriever {
    cases_root: PathBuf,
    catalog: Arc<CollectionCatalog>,
    embedders: Arc<EmbedderRegistry>,
    store_factory: Arc<StoreFactory>,
    current_mcp_server_id: Option<String>,
    collections: RwLock<HashMap<i64, CollectionHandle>>,
    /// case_id → feedback score, under both id forms (with and without
    /// the `case_` prefix).
    feedback_cache: std::sync::RwLock<HashMap<String, i32>>,
}

impl RagRetriever {
    /// Open the retriever with in-memory vector indexes (rebuilt from the
    /// case directories at startup).
    pub async fn open(
        cases_root: impl Into<PathBuf>,
        catalog: Arc<CollectionCatalog>,
        embedders: Arc<EmbedderRegistry>,
        current_mcp_server_id: Option<String>,
    ) -> Result<Self, RagError> {
        Self::open_with_store_factory(
            cases_root,
            catalog,
            embedders,
            current_mcp_server_id,
            Arc::new(|_c: &RagCollection| {
                Arc::new(InMemoryVectorStore::new()) as Arc<dyn VectorStore>
            }),
        )
        .await
    }

    /// Open with a custom vector store backend per collection.
    pub async fn open_with_store_factory(
        cases_root: impl Into<PathBuf>,
        catalog: Arc<CollectionCatalog>,
        embedders: Arc<EmbedderRegistry>,
        current_mcp_server_id: Option<String>,
        store_factory: Arc<StoreFactory>,
    ) -> Result<Self, RagError> {
        let cases_root = cases_root.into();
        std::fs::create_dir_all(&cases_root).map_err(|e| {
            RagError::Storage(format!(
                "Cannot create cases root {}: {e}",
                cases_root.display()
            ))
        })?;

        let retriever = Self {
            cases_root,
            catalog,
            embedders,
            store_factory,
            current_mcp_server_id,
            collections: RwLock::new(HashMap::new()),
            feedback_cache: std::sync::RwLock::new(HashMap::new()),
        };

        retriever.migrate_flat_layout()?;
        retriever.load_active_collections().await;
        retriever.rebuild_empty_indexes().await?;
        retriever.hydrate_feedback_cache().await;

        info!(
            collections = retriever.collections.read().await.len(),
            "RAG retriever ready"
        );
        Ok(retriever)
    }

    /// Resolve the access context for a user against the catalog.
    pub fn access_for(&self, user_id: impl Into<String>) -> RagAccessContext {
        RagAccessContext::for_user(&self.catalog, user_id)
    }

    pub fn catalog(&self) -> &CollectionCatalog {
        &self.catalog
    }

    fn collection_dir(&self, collection_id: i64) -> PathBuf {
        self.cases_root.join(format!("collection_{collection_id}"))
    }

    async fn handle(&self, collection_id: i64) -> Result<CollectionHandle, RagError> {
        self.collections
            .read()
            .await
            .get(&collection_id)
            .cloned()
            .ok_or(RagError::CollectionNotFound(collection_id))
    }

    fn should_load(&self, coll: &RagCollection) -> bool {
        if !coll.enabled {
            return false;
        }
        // Knowledge collections are not tied to MCP servers. Planner
        // collections load only for their assigned server, unless no
        // server is configured at all (inspection mode).
        coll.repository_type == RepositoryType::Knowledge
            || self.current_mcp_server_id.is_none()
            || coll.mcp_server_id == self.current_mcp_server_id
    }

    // -------------------------------------------------------------------
    // Startup
    // -------------------------------------------------------------------

    /// One-time migration: move flat case files from the root into their
    /// collection subdirectory, based on each file's own metadata.
    fn migrate_flat_layout(&self) -> Result<(), RagError> {
        let flat_cases: Vec<PathBuf> = case_files_in(&self.cases_root);
        if flat_cases.is_empty() {
            return Ok(());
        }

        info!(count = flat_cases.len(), "Migrating flat case layout into collection directories");
        let mut migrated = 0usize;
        for file in flat_cases {
            match std::fs::read_to_string(&file)
                .ok()
                .and_then(|raw| serde_json::from_str::<serde_json::Value>(&raw).ok())
            {
                Some(mut doc) => {
                    let collection_id = doc
                        .pointer("/metadata/collection_id")
                        .and_then(|v| v.as_i64())
                        .unwrap_or(0);
                    if let Some(meta) = doc.get_mut("metadata").and_then(|m| m.as_object_mut()) {
                        meta.entry("collection_id")
                            .or_insert(serde_json::json!(collection_id));
                    }

                    let dir = self.collection_dir(collection_id);
                    if let Err(e) = std::fs::create_dir_all(&dir) {
                        warn!(error = %e, "Cannot create collection directory during migration");
                        continue;
                    }
                    let target = dir.join(file.file_name().unwrap_or_default());
                    let serialized = match serde_json::to_string_pretty(&doc) {
                        Ok(s) => s,
                        Err(e) => {
                            warn!(error = %e, file = %file.display(), "Cannot serialize case during migration");
                            continue;
                        }
                    };
                    if let Err(e) = write_atomic(&target, &serialized) {
                        warn!(error = %e, file = %file.display(), "Failed to migrate case file");
                        continue;
                    }
                    let _ = std::fs::remove_file(&file);
                    migrated += 1;
                }
                None => warn!(file = %file.display(), "Skipping unreadable case file during migration"),
            }
        }
        info!(migrated, "Flat case migration complete");
        Ok(())
    }

    async fn load_active_collections(&self) {
        for coll in self.catalog.all() {
            if !self.should_load(&coll) {
                debug!(
                    collection_id = coll.id,
                    server = ?coll.mcp_server_id,
                    "Skipping collection (disabled or foreign MCP server)"
                );
                continue;
            }
            self.load_collection(coll).await;
        }
    }

    async fn load_collection(&self, meta: RagCollection) {
        let handle = CollectionHandle {
            embedder: self.embedders.for_model(&meta.embedding_model),
            store: (self.store_factory)(&meta),
            champion_lock: Arc::new(Mutex::new(())),
            meta,
        };
        debug!(
            collection_id = handle.meta.id,
            name = %handle.meta.name,
            model = %handle.meta.embedding_model,
            "Loaded collection"
        );
        self.collections
            .write()
            .await
            .insert(handle.meta.id, handle);
    }

    /// Rebuild any empty index whose collection directory holds case
    /// files. A fresh checkout populates its indexes with no manual step.
    async fn rebuild_empty_indexes(&self) -> Result<(), RagError> {
        let ids: Vec<i64> = self.collections.read().await.keys().copied().collect();
        for collection_id in ids {
            let handle = self.handle(collection_id).await?;
            if handle.meta.repository_type == RepositoryType::Knowledge {
                continue;
            }
            let count = handle.store.count().await?;
            let files = case_files_in(&self.collection_dir(collection_id));
            if count == 0 && !files.is_empty() {
                info!(
                    collection_id,
                    files = files.len(),
                    "Index empty with case files on disk; rebuilding"
                );
                self.maintain_vector_store(collection_id).await?;
            }
        }
        Ok(())
    }

    async fn hydrate_feedback_cache(&self) {
        let ids: Vec<i64> = self.collections.read().await.keys().copied().collect();
        let mut cache = HashMap::new();
        for collection_id in ids {
            for file in case_files_in(&self.collection_dir(collection_id)) {
                let Some(case) = read_case_file(&file) else {
                    continue;
                };
                let score = case.metadata.user_feedback_score;
                cache.insert(case.case_id.clone(), score);
                cache.insert(format!("case_{}", case.case_id), score);
            }
        }
        *self.feedback_cache.write().unwrap_or_else(|e| e.into_inner()) = cache;
    }

    // -------------------------------------------------------------------
    // Index maintenance
    // -------------------------------------------------------------------

    /// Synchronize a collection's index with its case directory: add new
    /// cases, update changed ones, delete orphans.
    async fn maintain_vector_store(&self, collection_id: i64) -> Result<(), RagError> {
        let handle = self.handle(collection_id).await?;
        if handle.meta.repository_type == RepositoryType::Knowledge {
            debug!(collection_id, "Knowledge collections have no file-based cases; skipping maintenance");
            return Ok(());
        }

        let dir = self.collection_dir(collection_id);
        let files = case_files_in(&dir);
        if files.is_empty() {
            debug!(collection_id, "No case files on disk; skipping maintenance");
            return Ok(());
        }

        let disk_cases: HashMap<String, CaseStudy> = files
            .iter()
            .filter_map(|f| {
                let stem = f.file_stem()?.to_str()?.to_string();
                Some((stem, read_case_file(f)?))
            })
            .collect();

        let indexed = handle.store.get(&MetadataFilter::new()).await?;
        let indexed_ids: HashSet<String> = indexed.iter().map(|r| r.id.clone()).collect();
        let indexed_full: HashMap<String, String> = indexed
            .into_iter()
            .filter_map(|r| {
                let full = r.metadata.get("full_case_data")?.as_str()?.to_string();
                Some((r.id, full))
            })
            .collect();

        // Delete index entries whose file is gone.
        let orphans: Vec<String> = indexed_ids
            .iter()
            .filter(|id| !disk_cases.contains_key(*id))
            .cloned()
            .collect();
        if !orphans.is_empty() {
            handle.store.delete(&orphans).await?;
        }

        let mut added = 0usize;
        let mut updated = 0usize;
        for (stem, case) in &disk_cases {
            if case.intent.user_query.is_empty() {
                warn!(case = %stem, "Skipping case without user_query");
                continue;
            }
            let metadata = case::index_metadata(case)?;
            let is_new = !indexed_ids.contains(stem);
            let changed = indexed_full
                .get(stem)
                .is_some_and(|full| full != metadata["full_case_data"].as_str().unwrap_or(""));
            if is_new || changed {
                let vectors = handle
                    .embedder
                    .embed(std::slice::from_ref(&case.intent.user_query))
                    .await?;
                handle
                    .store
                    .upsert(VectorRecord {
                        id: stem.clone(),
                        document: case.intent.user_query.clone(),
                        metadata,
                        vector: vectors.into_iter().next().unwrap_or_default(),
                    })
                    .await?;
                if is_new {
                    added += 1;
                } else {
                    updated += 1;
                }
            }
        }
        debug!(
            collection_id,
            added,
            updated,
            removed = orphans.len(),
            "Vector store maintenance complete"
        );
        Ok(())
    }

    /// Owner-triggered resynchronization of a collection's index.
    /// Subscribers cannot refresh collections they do not own.
    pub async fn refresh_collection(
        &self,
        collection_id: i64,
        access: &RagAccessContext,
    ) -> Result<(), RagError> {
        if !access.can_write(collection_id) {
            return Err(RagError::AccessDenied {
                user_id: access.user_id.clone(),
                collection_id,
            });
        }
        self.maintain_vector_store(collection_id).await
    }

    // -------------------------------------------------------------------
    // Retrieval
    // -------------------------------------------------------------------

    /// Retrieve the top-k most relevant and efficient cases for a query.
    ///
    /// Only collections readable by the caller are consulted; the
    /// `allowed_collection_ids` set (profile-based filtering) is
    /// intersected with the caller's access set. Candidates are ranked by
    /// adjusted score: similarity minus the cleanliness penalty.
    pub async fn retrieve_examples(
        &self,
        query: &str,
        k: usize,
        min_score: f64,
        allowed_collection_ids: Option<&HashSet<i64>>,
        access: &RagAccessContext,
        repository_type: RepositoryType,
    ) -> Result<Vec<RetrievedCase>, RagError> {
        let effective: HashSet<i64> = match allowed_collection_ids {
            Some(allowed) => allowed.intersection(access.accessible()).copied().collect(),
            None => access.accessible().clone(),
        };

        let handles: Vec<CollectionHandle> = self
            .collections
            .read()
            .await
            .values()
            .filter(|h| effective.contains(&h.meta.id) && h.meta.repository_type == repository_type)
            .cloned()
            .collect();

        if handles.is_empty() {
            debug!(query, "No accessible collections for retrieval");
            return Ok(Vec::new());
        }

        let mut candidates: Vec<RetrievedCase> = Vec::new();
        for handle in handles {
            let vectors = handle.embedder.embed(&[query.to_string()]).await?;
            let Some(vector) = vectors.into_iter().next() else {
                continue;
            };

            // Cases that are either the champion or explicitly upvoted are
            // eligible, so a liked plan is never hidden by a lazier one.
            let filter = match repository_type {
                RepositoryType::Knowledge => MetadataFilter::new(),
                RepositoryType::Planner => MetadataFilter::new()
                    .and(Condition::eq("strategy_type", "successful"))
                    .and(Condition::gte("user_feedback_score", 0i64))
                    .or(Condition::eq("is_most_efficient", true))
                    .or(Condition::gt("user_feedback_score", 0i64)),
            };

            let limit = k.saturating_mul(CANDIDATE_FACTOR).max(CANDIDATE_FACTOR);
            let hits = handle.store.query(&vector, limit, &filter).await?;
            debug!(
                collection_id = handle.meta.id,
                hits = hits.len(),
                "Collection queried"
            );

            for hit in hits {
                let similarity = 1.0 - f64::from(hit.distance);
                if similarity < min_score {
                    continue;
                }

                let candidate = match repository_type {
                    RepositoryType::Knowledge => RetrievedCase {
                        case_id: hit.id.clone(),
                        collection_id: handle.meta.id,
                        user_query: query.to_string(),
                        strategy_type: StrategyType::Knowledge,
                        content: hit.document.clone(),
                        case: None,
                        similarity,
                        adjusted_score: similarity,
                        is_most_efficient: true,
                        had_plan_improvements: false,
                        had_tactical_improvements: false,
                        collection_name: Some(handle.meta.name.clone()),
                        mcp_server_id: handle.meta.mcp_server_id.clone(),
                        document_id: hit
                            .metadata
                            .get("document_id")
                            .and_then(|v| v.as_str())
                            .map(String::from)
                            .or_else(|| Some(hit.id.clone())),
                        chunk_index: hit
                            .metadata
                            .get("chunk_index")
                            .and_then(ScalarValue::as_i64)
                            .map(|v| v as u32),
                    },
                    RepositoryType::Planner => {
                        let Some(full) = hit.metadata.get("full_case_data").and_then(|v| v.as_str())
                        else {
                            warn!(case = %hit.id, "Indexed case missing full_case_data");
                            continue;
                        };
                        let case: CaseStudy = match serde_json::from_str(full) {
                            Ok(case) => case,
                            Err(e) => {
                                warn!(case = %hit.id, error = %e, "Corrupted full_case_data");
                                continue;
                            }
                        };

                        let had_plan = case.metadata.had_plan_improvements;
                        let had_tactical = case.metadata.had_tactical_improvements;
                        let mut penalty = 0.0;
                        if had_tactical {
                            penalty += PENALTY_TACTICAL;
                        }
                        if had_plan {
                            penalty += PENALTY_PLAN;
                        }

                        RetrievedCase {
                            case_id: hit.id.clone(),
                            collection_id: handle.meta.id,
                            user_query: case.intent.user_query.clone(),
                            strategy_type: case.strategy_type(),
                            content: hit.document.clone(),
                            similarity,
                            adjusted_score: similarity - penalty,
                            is_most_efficient: hit
                                .metadata
                                .get("is_most_efficient")
                                .and_then(ScalarValue::as_bool)
                                .unwrap_or(false),
                            had_plan_improvements: had_plan,
                            had_tactical_improvements: had_tactical,
                            collection_name: Some(handle.meta.name.clone()),
                            mcp_server_id: handle.meta.mcp_server_id.clone(),
                            document_id: None,
                            chunk_index: None,
                            case: Some(case),
                        }
                    }
                };
                candidates.push(candidate);
            }
        }

        candidates.sort_by(|a, b| {
            b.adjusted_score
                .partial_cmp(&a.adjusted_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.case_id.cmp(&b.case_id))
        });
        candidates.truncate(k);
        debug!(
            query,
            returned = candidates.len(),
            "Retrieval ranked by adjusted score"
        );
        Ok(candidates)
    }

    // -------------------------------------------------------------------
    // Turn ingestion & champion election
    // -------------------------------------------------------------------

    /// Process a completed turn: extract a case, elect the champion for
    /// its query, and persist transactionally.
    ///
    /// Returns the stored case id, or `None` when the turn produced
    /// nothing indexable. Access violations and missing default
    /// collections are hard errors.
    pub async fn process_turn_for_rag(
        &self,
        turn: &TurnSummary,
        collection_id: Option<i64>,
        access: &RagAccessContext,
    ) -> Result<Option<String>, RagError> {
        let user_uuid = access.user_id.clone();

        let collection_id = match collection_id {
            Some(id) => id,
            None => self
                .catalog
                .default_collection_id(&user_uuid)
                .ok_or_else(|| RagError::NoDefaultCollection(user_uuid.clone()))?,
        };

        if !access.can_write(collection_id) {
            return Err(RagError::AccessDenied {
                user_id: user_uuid,
                collection_id,
            });
        }

        let Some(mut case) = case::extract_case(turn, collection_id) else {
            debug!(turn = turn.turn, "Turn produced no indexable case");
            return Ok(None);
        };
        case.metadata.user_uuid = user_uuid.clone();

        let handle = self.handle(collection_id).await?;
        let _guard = handle.champion_lock.lock().await;

        match case.strategy_type() {
            StrategyType::Successful => {
                self.elect_and_store(&handle, collection_id, &mut case)
                    .await?;
            }
            StrategyType::Failed => {
                // Stored for analysis; the retrieval filter excludes it
                // and it never competes for champion.
                self.index_case(&handle, &case).await?;
                self.persist_case(collection_id, &case)?;
                self.cache_feedback(&case.case_id, case.metadata.user_feedback_score);
            }
            _ => return Ok(None),
        }

        Ok(Some(case.case_id.clone()))
    }

    async fn elect_and_store(
        &self,
        handle: &CollectionHandle,
        collection_id: i64,
        case: &mut CaseStudy,
    ) -> Result<(), RagError> {
        let query = case.intent.user_query.clone();
        let new_feedback = case.metadata.user_feedback_score;
        let new_tokens = case.metadata.llm.output_tokens as i64;
        let new_id = prefixed_id(&case.case_id);

        let champion_filter = MetadataFilter::new()
            .and(Condition::eq("user_query", query.clone()))
            .and(Condition::eq("user_uuid", case.metadata.user_uuid.clone()))
            .and(Condition::eq("is_most_efficient", true));
        let incumbents = handle.store.get(&champion_filter).await?;
        let incumbent = incumbents.first();

        // Feedback outranks token efficiency: a downvoted case is never
        // champion, a downvoted incumbent always loses, higher feedback
        // wins, and only equal feedback falls through to fewer tokens.
        let mut demote: Option<String> = None;
        let becomes_champion = if new_feedback < 0 {
            false
        } else {
            match incumbent {
                None => true,
                Some(old) => {
                    let old_feedback = old
                        .metadata
                        .get("user_feedback_score")
                        .and_then(ScalarValue::as_i64)
                        .unwrap_or(0) as i32;
                    let old_tokens = old
                        .metadata
                        .get("output_tokens")
                        .and_then(ScalarValue::as_i64)
                        .unwrap_or(i64::MAX);
                    let wins = if old_feedback < 0 {
                        true
                    } else if new_feedback != old_feedback {
                        new_feedback > old_feedback
                    } else {
                        new_tokens < old_tokens
                    };
                    if wins && old.id != new_id {
                        demote = Some(old.id.clone());
                    }
                    wins
                }
            }
        };
        case.metadata.is_most_efficient = becomes_champion;

        self.index_case(handle, case).await?;

        if let Some(old_id) = demote {
            info!(collection_id, old = %old_id, new = %new_id, "Demoting previous champion");
            self.demote_indexed_case(handle, collection_id, &old_id)
                .await?;
        }

        self.persist_case(collection_id, case)?;
        self.cache_feedback(&case.case_id, new_feedback);

        info!(
            collection_id,
            case_id = %case.case_id,
            champion = becomes_champion,
            tokens = new_tokens,
            "Indexed successful strategy"
        );
        Ok(())
    }

    /// Upsert a case into a collection's index, embedding its user query.
    async fn index_case(
        &self,
        handle: &CollectionHandle,
        case: &CaseStudy,
    ) -> Result<(), RagError> {
        let metadata = case::index_metadata(case)?;
        let vectors = handle
            .embedder
            .embed(std::slice::from_ref(&case.intent.user_query))
            .await?;
        handle
            .store
            .upsert(VectorRecord {
                id: prefixed_id(&case.case_id),
                document: case.intent.user_query.clone(),
                metadata,
                vector: vectors.into_iter().next().unwrap_or_default(),
            })
            .await
    }

    /// Flip a case's champion flag to false in the index and in its JSON file.
    async fn demote_indexed_case(
        &self,
        handle: &CollectionHandle,
        collection_id: i64,
        indexed_id: &str,
    ) -> Result<(), RagError> {
        let records = handle.store.get_by_ids(&[indexed_id.to_string()]).await?;
        match records.into_iter().next() {
            Some(record) => {
                let mut metadata = record.metadata;
                metadata.insert("is_most_efficient".into(), false.into());
                handle.store.update_metadata(indexed_id, metadata).await?;
            }
            None => {
                warn!(case = %indexed_id, "Champion to demote is not in the index");
                return Ok(());
            }
        }
        self.set_case_file_champion(collection_id, indexed_id, false);
        Ok(())
    }

    fn set_case_file_champion(&self, collection_id: i64, indexed_id: &str, value: bool) {
        let path = self
            .collection_dir(collection_id)
            .join(format!("{indexed_id}.json"));
        let Some(mut case) = read_case_file(&path) else {
            debug!(case = %indexed_id, "No JSON file for case (not persisted yet)");
            return;
        };
        case.metadata.is_most_efficient = value;
        if let Err(e) = self.write_case(&path, &case) {
            warn!(case = %indexed_id, error = %e, "Failed to update champion flag on disk");
        }
    }

    fn persist_case(&self, collection_id: i64, case: &CaseStudy) -> Result<(), RagError> {
        let dir = self.collection_dir(collection_id);
        std::fs::create_dir_all(&dir)
            .map_err(|e| RagError::Storage(format!("Cannot create {}: {e}", dir.display())))?;
        let path = dir.join(format!("case_{}.json", case.case_id));
        self.write_case(&path, case)
    }

    fn write_case(&self, path: &Path, case: &CaseStudy) -> Result<(), RagError> {
        let serialized =
            serde_json::to_string_pretty(case).map_err(|e| RagError::Storage(e.to_string()))?;
        write_atomic(path, &serialized)
    }

    fn cache_feedback(&self, case_id: &str, score: i32) {
        let mut cache = self.feedback_cache.write().unwrap_or_else(|e| e.into_inner());
        let normalized = case_id.strip_prefix("case_").unwrap_or(case_id);
        cache.insert(normalized.to_string(), score);
        cache.insert(format!("case_{normalized}"), score);
    }

    /// Cached feedback score for a case, 0 when unknown.
    pub fn feedback_score(&self, case_id: &str) -> i32 {
        self.feedback_cache
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(case_id)
            .copied()
            .unwrap_or(0)
    }

    // -------------------------------------------------------------------
    // Explicit feedback
    // -------------------------------------------------------------------

    /// Record explicit user feedback for a case: rewrite its JSON file,
    /// update the feedback cache and every index containing it, and on a
    /// downvote demote it and re-elect the champion for its query.
    ///
    /// Returns false when no case file exists for the id.
    pub async fn update_case_feedback(
        &self,
        case_id: &str,
        score: i32,
    ) -> Result<bool, RagError> {
        if !(-1..=1).contains(&score) {
            return Err(RagError::InvalidCase(format!(
                "Feedback score must be -1, 0 or +1 (got {score})"
            )));
        }

        let normalized = case_id.strip_prefix("case_").unwrap_or(case_id).to_string();
        let prefixed = format!("case_{normalized}");

        let collection_ids: Vec<i64> = self.collections.read().await.keys().copied().collect();
        let located = collection_ids.iter().find_map(|id| {
            let path = self.collection_dir(*id).join(format!("{prefixed}.json"));
            path.exists().then_some((*id, path))
        });
        let Some((_home_collection, path)) = located else {
            warn!(case = %case_id, "Case file not found for feedback update");
            return Ok(false);
        };

        let Some(mut case) = read_case_file(&path) else {
            return Err(RagError::Storage(format!(
                "Case file {} is unreadable",
                path.display()
            )));
        };
        let old_score = case.metadata.user_feedback_score;
        case.metadata.user_feedback_score = score;
        if score < 0 {
            case.metadata.is_most_efficient = false;
        }
        self.write_case(&path, &case)?;
        info!(case = %normalized, old_score, new_score = score, "Updated case feedback");

        self.cache_feedback(&normalized, score);

        let full_case = serde_json::to_string(&case).map_err(|e| RagError::Storage(e.to_string()))?;

        // Propagate to every index containing the case (forked/subscribed
        // copies included).
        for collection_id in collection_ids {
            let handle = self.handle(collection_id).await?;
            let _guard = handle.champion_lock.lock().await;

            let records = handle.store.get_by_ids(&[prefixed.clone()]).await?;
            let Some(record) = records.into_iter().next() else {
                continue;
            };

            let mut metadata = record.metadata;
            metadata.insert("user_feedback_score".into(), ScalarValue::Int(score as i64));
            metadata.insert("full_case_data".into(), full_case.clone().into());

            let user_query = metadata
                .get("user_query")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let user_uuid = metadata
                .get("user_uuid")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();

            if score < 0 {
                metadata.insert("is_most_efficient".into(), false.into());
                handle.store.update_metadata(&prefixed, metadata).await?;
                info!(
                    case = %normalized,
                    collection_id,
                    "Downvoted case demoted from champion; re-electing"
                );
                self.reelect_champion_locked(&handle, collection_id, &user_query, &user_uuid)
                    .await?;
            } else {
                handle.store.update_metadata(&prefixed, metadata).await?;
            }
        }

        Ok(true)
    }

    /// Re-elect the champion for a query cohort. Caller holds the
    /// collection's champion lock.
    async fn reelect_champion_locked(
        &self,
        handle: &CollectionHandle,
        collection_id: i64,
        user_query: &str,
        user_uuid: &str,
    ) -> Result<(), RagError> {
        let cohort_filter = MetadataFilter::new()
            .and(Condition::eq("user_query", user_query))
            .and(Condition::eq("user_uuid", user_uuid))
            .and(Condition::eq("strategy_type", "successful"))
            .and(Condition::gte("user_feedback_score", 0i64));
        let cohort = handle.store.get(&cohort_filter).await?;

        if cohort.is_empty() {
            info!(
                collection_id,
                query = %user_query,
                "No eligible cases remain; query has no champion"
            );
            return Ok(());
        }

        // Best under (feedback desc, output_tokens asc), id as the final
        // deterministic tie-break.
        let mut best: Option<(&VectorRecord, i64, i64)> = None;
        for record in &cohort {
            let feedback = record
                .metadata
                .get("user_feedback_score")
                .and_then(ScalarValue::as_i64)
                .unwrap_or(0);
            let tokens = record
                .metadata
                .get("output_tokens")
                .and_then(ScalarValue::as_i64)
                .unwrap_or(i64::MAX);
            let better = match best {
                None => true,
                Some((b, bf, bt)) => {
                    feedback > bf
                        || (feedback == bf && tokens < bt)
                        || (feedback == bf && tokens == bt && record.id < b.id)
                }
            };
            if better {
                best = Some((record, feedback, tokens));
            }
        }
        let Some((best_record, best_feedback, best_tokens)) = best else {
            return Ok(());
        };
        let best_id = best_record.id.clone();

        for record in &cohort {
            let desired = record.id == best_id;
            let current = record
                .metadata
                .get("is_most_efficient")
                .and_then(ScalarValue::as_bool)
                .unwrap_or(false);
            if current != desired {
                let mut metadata = record.metadata.clone();
                metadata.insert("is_most_efficient".into(), desired.into());
                handle.store.update_metadata(&record.id, metadata).await?;
                self.set_case_file_champion(collection_id, &record.id, desired);
            }
        }

        info!(
            collection_id,
            query = %user_query,
            champion = %best_id,
            feedback = best_feedback,
            tokens = best_tokens,
            "Champion re-elected"
        );
        Ok(())
    }

    // -------------------------------------------------------------------
    // Knowledge ingestion
    // -------------------------------------------------------------------

    /// Index document chunks into a knowledge collection.
    pub async fn index_knowledge_chunks(
        &self,
        collection_id: i64,
        access: &RagAccessContext,
        document_id: &str,
        chunks: &[String],
    ) -> Result<usize, RagError> {
        if !access.can_write(collection_id) {
            return Err(RagError::AccessDenied {
                user_id: access.user_id.clone(),
                collection_id,
            });
        }
        let handle = self.handle(collection_id).await?;
        if handle.meta.repository_type != RepositoryType::Knowledge {
            return Err(RagError::InvalidCollection(format!(
                "Collection {collection_id} is not a knowledge repository"
            )));
        }

        let vectors = handle.embedder.embed(chunks).await?;
        for (i, (text, vector)) in chunks.iter().zip(vectors).enumerate() {
            let mut metadata = tokenweave_core::vector::ScalarMap::new();
            metadata.insert("document_id".into(), document_id.into());
            metadata.insert("chunk_index".into(), ScalarValue::Int(i as i64));
            metadata.insert("collection_id".into(), collection_id.into());
            handle
                .store
                .upsert(VectorRecord {
                    id: format!("{document_id}_{i}"),
                    document: text.clone(),
                    metadata,
                    vector,
                })
                .await?;
        }
        debug!(collection_id, document_id, chunks = chunks.len(), "Indexed knowledge chunks");
        Ok(chunks.len())
    }

    // -------------------------------------------------------------------
    // Collection management
    // -------------------------------------------------------------------

    /// Register a new collection and load it when eligible.
    pub async fn add_collection(&self, collection: RagCollection) -> Result<(), RagError> {
        self.catalog.add(collection.clone())?;
        if self.should_load(&collection) {
            self.load_collection(collection).await;
        }
        Ok(())
    }

    /// Remove a collection: catalog entry, loaded index, and case
    /// directory. Owner-only; default collections are protected.
    pub async fn remove_collection(
        &self,
        collection_id: i64,
        access: &RagAccessContext,
    ) -> Result<(), RagError> {
        self.catalog.remove(collection_id, &access.user_id)?;
        self.collections.write().await.remove(&collection_id);
        let dir = self.collection_dir(collection_id);
        if dir.exists() {
            std::fs::remove_dir_all(&dir).map_err(|e| {
                RagError::Storage(format!("Cannot remove {}: {e}", dir.display()))
            })?;
        }
        info!(collection_id, "Collection removed");
        Ok(())
    }

    /// Enable or disable a collection, loading or unloading its index.
    pub async fn toggle_collection(
        &self,
        collection_id: i64,
        enabled: bool,
    ) -> Result<(), RagError> {
        self.catalog.set_enabled(collection_id, enabled)?;
        if enabled {
            let coll = self
                .catalog
                .get(collection_id)
                .ok_or(RagError::CollectionNotFound(collection_id))?;
            if self.should_load(&coll) {
                self.load_collection(coll).await;
                self.maintain_vector_store(collection_id).await?;
            }
        } else {
            self.collections.write().await.remove(&collection_id);
        }
        info!(collection_id, enabled, "Collection toggled");
        Ok(())
    }

    /// Drop and reload every collection eligible for the current server.
    pub async fn reload_collections(&self) -> Result<(), RagError> {
        self.collections.write().await.clear();
        self.load_active_collections().await;
        self.rebuild_empty_indexes().await?;
        self.hydrate_feedback_cache().await;
        Ok(())
    }
}

fn prefixed_id(case_id: &str) -> String {
    if case_id.starts_with("case_") {
        case_id.to_string()
    } else {
        format!("case_{case_id}")
    }
}

fn case_files_in(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.is_file()
                && p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("case_") && n.ends_with(".json"))
        })
        .collect();
    files.sort();
    files
}

fn read_case_file(path: &Path) -> Option<CaseStudy> {
    let raw = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&raw) {
        Ok(case) => Some(case),
        Err(e) => {
            warn!(file = %path.display(), error = %e, "Skipping corrupted case file");
            None
        }
    }
}

fn write_atomic(path: &Path, content: &str) -> Result<(), RagError> {
    let parent = path
        .parent()
        .ok_or_else(|| RagError::Storage(format!("No parent directory for {}", path.display())))?;
    std::fs::create_dir_all(parent)
        .map_err(|e| RagError::Storage(format!("Cannot create {}: {e}", parent.display())))?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, content)
        .map_err(|e| RagError::Storage(format!("Cannot write {}: {e}", tmp.display())))?;
    std::fs::rename(&tmp, path)
        .map_err(|e| RagError::Storage(format!("Cannot rename into {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixed_id_is_idempotent() {
        assert_eq!(prefixed_id("abc"), "case_abc");
        assert_eq!(prefixed_id("case_abc"), "case_abc");
    }

    #[test]
    fn case_files_filters_names() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("case_a.json"), "{}").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "x").unwrap();
        std::fs::write(dir.path().join("case_b.json.tmp"), "{}").unwrap();
        let files = case_files_in(dir.path());
        assert_eq!(files.len(), 1);
        assert!(files[0].ends_with("case_a.json"));
    }
}
