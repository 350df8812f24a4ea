//! End-to-end retrieval and champion maintenance flows, against a real
//! temp directory and the in-memory index.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use serde_json::json;
use tokenweave_rag::case::{
    PlanPhase, TraceAction, TraceActionMeta, TraceEntry, TraceResult, TurnSummary,
};
use tokenweave_rag::{
    CaseStudy, CollectionCatalog, EmbedderRegistry, RagCollection, RagRetriever, RepositoryType,
    StrategyType, Visibility,
};

const QUERY: &str = "top 10 customers by revenue";

fn collection(id: i64, owner: &str) -> RagCollection {
    RagCollection {
        id,
        name: format!("collection-{id}"),
        description: String::new(),
        embedding_model: "all-MiniLM-L6-v2".into(),
        repository_type: RepositoryType::Planner,
        owner_user_id: Some(owner.into()),
        visibility: Visibility::Private,
        enabled: true,
        mcp_server_id: Some("srv-1".into()),
        chunking: None,
        is_default: false,
    }
}

fn turn(turn_number: u32, output_tokens: u64, feedback: Option<&str>) -> TurnSummary {
    let trace = vec![TraceEntry {
        action: Some(TraceAction {
            tool_name: "base_readQuery".into(),
            arguments: json!({"sql": "SELECT ..."}),
            metadata: TraceActionMeta {
                phase_number: Some(1),
                kind: None,
            },
        }),
        result: Some(TraceResult {
            status: Some("success".into()),
        }),
    }];
    TurnSummary {
        session_id: "sess-1".into(),
        turn: turn_number,
        user_query: QUERY.into(),
        user_uuid: Some("u1".into()),
        original_plan: vec![PlanPhase {
            phase: 1,
            goal: "Query revenue".into(),
            relevant_tools: vec!["base_readQuery".into()],
            arguments: json!({}),
            phase_type: None,
            loop_over: None,
        }],
        execution_trace: trace,
        feedback: feedback.map(String::from),
        timestamp: None,
        provider: Some("anthropic".into()),
        model: Some("some-model".into()),
        turn_input_tokens: 4000,
        turn_output_tokens: output_tokens,
        final_summary: Some("done".into()),
    }
}

async fn open_retriever(root: &Path, collections: Vec<RagCollection>) -> RagRetriever {
    let catalog = Arc::new(CollectionCatalog::new(collections).unwrap());
    RagRetriever::open(
        root,
        catalog,
        Arc::new(EmbedderRegistry::default()),
        Some("srv-1".into()),
    )
    .await
    .unwrap()
}

fn champion_flags(root: &Path, collection_id: i64) -> Vec<(String, bool)> {
    let dir = root.join(format!("collection_{collection_id}"));
    let mut flags = Vec::new();
    for entry in std::fs::read_dir(dir).unwrap().flatten() {
        let name = entry.file_name().into_string().unwrap();
        if !name.starts_with("case_") || !name.ends_with(".json") {
            continue;
        }
        let case: CaseStudy =
            serde_json::from_str(&std::fs::read_to_string(entry.path()).unwrap()).unwrap();
        flags.push((case.case_id, case.metadata.is_most_efficient));
    }
    flags.sort();
    flags
}

#[tokio::test]
async fn more_efficient_turn_takes_the_champion_flag() {
    let dir = tempfile::tempdir().unwrap();
    let retriever = open_retriever(dir.path(), vec![collection(7, "u1")]).await;
    let access = retriever.access_for("u1");

    let first = retriever
        .process_turn_for_rag(&turn(1, 1800, None), Some(7), &access)
        .await
        .unwrap()
        .unwrap();
    let second = retriever
        .process_turn_for_rag(&turn(2, 1200, None), Some(7), &access)
        .await
        .unwrap()
        .unwrap();
    assert_ne!(first, second);

    // Both JSON files exist; only the cheaper case carries the flag.
    let flags = champion_flags(dir.path(), 7);
    assert_eq!(flags.len(), 2);
    assert_eq!(
        flags.iter().filter(|(_, champion)| *champion).count(),
        1,
        "exactly one champion per (collection, query, user)"
    );
    assert!(
        flags
            .iter()
            .any(|(id, champion)| *id == second && *champion),
        "the 1200-token case is the champion"
    );

    // Retrieval surfaces the champion; the demoted neutral case is
    // filtered out.
    let results = retriever
        .retrieve_examples(QUERY, 3, 0.7, None, &access, RepositoryType::Planner)
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert!(results[0].is_most_efficient);
    assert_eq!(results[0].case_id, format!("case_{second}"));
}

#[tokio::test]
async fn less_efficient_turn_does_not_displace_the_champion() {
    let dir = tempfile::tempdir().unwrap();
    let retriever = open_retriever(dir.path(), vec![collection(7, "u1")]).await;
    let access = retriever.access_for("u1");

    let cheap = retriever
        .process_turn_for_rag(&turn(1, 900, None), Some(7), &access)
        .await
        .unwrap()
        .unwrap();
    retriever
        .process_turn_for_rag(&turn(2, 5000, None), Some(7), &access)
        .await
        .unwrap()
        .unwrap();

    let flags = champion_flags(dir.path(), 7);
    assert!(flags.iter().any(|(id, champion)| *id == cheap && *champion));
    assert_eq!(flags.iter().filter(|(_, c)| *c).count(), 1);
}

#[tokio::test]
async fn feedback_outranks_token_efficiency() {
    let dir = tempfile::tempdir().unwrap();
    let retriever = open_retriever(dir.path(), vec![collection(7, "u1")]).await;
    let access = retriever.access_for("u1");

    // Cheap but neutral, then expensive but upvoted.
    retriever
        .process_turn_for_rag(&turn(1, 500, None), Some(7), &access)
        .await
        .unwrap();
    let upvoted = retriever
        .process_turn_for_rag(&turn(2, 9000, Some("up")), Some(7), &access)
        .await
        .unwrap()
        .unwrap();

    let flags = champion_flags(dir.path(), 7);
    assert!(
        flags
            .iter()
            .any(|(id, champion)| *id == upvoted && *champion)
    );
}

#[tokio::test]
async fn downvoted_turn_is_never_champion() {
    let dir = tempfile::tempdir().unwrap();
    let retriever = open_retriever(dir.path(), vec![collection(7, "u1")]).await;
    let access = retriever.access_for("u1");

    retriever
        .process_turn_for_rag(&turn(1, 100, Some("down")), Some(7), &access)
        .await
        .unwrap();
    let flags = champion_flags(dir.path(), 7);
    assert!(flags.iter().all(|(_, champion)| !champion));
}

#[tokio::test]
async fn downvote_triggers_reelection() {
    let dir = tempfile::tempdir().unwrap();
    let retriever = open_retriever(dir.path(), vec![collection(7, "u1")]).await;
    let access = retriever.access_for("u1");

    let runner_up = retriever
        .process_turn_for_rag(&turn(1, 1800, None), Some(7), &access)
        .await
        .unwrap()
        .unwrap();
    let champion = retriever
        .process_turn_for_rag(&turn(2, 1200, None), Some(7), &access)
        .await
        .unwrap()
        .unwrap();

    assert!(retriever.update_case_feedback(&champion, -1).await.unwrap());

    // The downvoted case lost the flag and the best remaining case in the
    // cohort took it.
    let flags = champion_flags(dir.path(), 7);
    assert!(
        flags
            .iter()
            .any(|(id, is_champion)| *id == runner_up && *is_champion),
        "runner-up becomes champion after downvote"
    );
    assert!(
        flags
            .iter()
            .any(|(id, is_champion)| *id == champion && !is_champion)
    );
    assert_eq!(flags.iter().filter(|(_, c)| *c).count(), 1);

    // The downvoted case no longer surfaces in retrieval.
    let results = retriever
        .retrieve_examples(QUERY, 5, 0.7, None, &access, RepositoryType::Planner)
        .await
        .unwrap();
    assert!(
        results
            .iter()
            .all(|r| r.case_id != format!("case_{champion}"))
    );
}

#[tokio::test]
async fn feedback_propagates_to_file_cache_and_index() {
    let dir = tempfile::tempdir().unwrap();
    let retriever = open_retriever(dir.path(), vec![collection(7, "u1")]).await;
    let access = retriever.access_for("u1");

    let case_id = retriever
        .process_turn_for_rag(&turn(1, 1000, None), Some(7), &access)
        .await
        .unwrap()
        .unwrap();

    assert!(retriever.update_case_feedback(&case_id, 1).await.unwrap());

    // Cache, under both id forms.
    assert_eq!(retriever.feedback_score(&case_id), 1);
    assert_eq!(retriever.feedback_score(&format!("case_{case_id}")), 1);

    // JSON file.
    let path = dir
        .path()
        .join("collection_7")
        .join(format!("case_{case_id}.json"));
    let case: CaseStudy =
        serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
    assert_eq!(case.metadata.user_feedback_score, 1);

    // Index metadata, observable through retrieval.
    let results = retriever
        .retrieve_examples(QUERY, 1, 0.7, None, &access, RepositoryType::Planner)
        .await
        .unwrap();
    assert_eq!(
        results[0]
            .case
            .as_ref()
            .unwrap()
            .metadata
            .user_feedback_score,
        1
    );
}

#[tokio::test]
async fn unknown_case_feedback_returns_false() {
    let dir = tempfile::tempdir().unwrap();
    let retriever = open_retriever(dir.path(), vec![collection(7, "u1")]).await;
    assert!(
        !retriever
            .update_case_feedback("no-such-case", 1)
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn write_access_is_enforced() {
    let dir = tempfile::tempdir().unwrap();
    let retriever = open_retriever(dir.path(), vec![collection(7, "u1")]).await;

    let stranger = retriever.access_for("u2");
    let err = retriever
        .process_turn_for_rag(&turn(1, 1000, None), Some(7), &stranger)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("access"));
}

#[tokio::test]
async fn missing_default_collection_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let retriever = open_retriever(dir.path(), vec![collection(7, "u1")]).await;
    let access = retriever.access_for("u2");
    let err = retriever
        .process_turn_for_rag(&turn(1, 1000, None), None, &access)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("default collection"));
}

#[tokio::test]
async fn retrieval_is_scoped_to_accessible_collections() {
    let dir = tempfile::tempdir().unwrap();
    let retriever =
        open_retriever(dir.path(), vec![collection(1, "u1"), collection(2, "u2")]).await;

    let owner1 = retriever.access_for("u1");
    let owner2 = retriever.access_for("u2");
    retriever
        .process_turn_for_rag(&turn(1, 1000, None), Some(1), &owner1)
        .await
        .unwrap();
    retriever
        .process_turn_for_rag(&turn(2, 1000, None), Some(2), &owner2)
        .await
        .unwrap();

    let results = retriever
        .retrieve_examples(QUERY, 10, 0.7, None, &owner1, RepositoryType::Planner)
        .await
        .unwrap();
    assert!(!results.is_empty());
    assert!(results.iter().all(|r| r.collection_id == 1));

    // Profile-based filtering intersects with the access set rather than
    // widening it.
    let mut wider: HashSet<i64> = HashSet::new();
    wider.insert(1);
    wider.insert(2);
    let filtered = retriever
        .retrieve_examples(QUERY, 10, 0.7, Some(&wider), &owner1, RepositoryType::Planner)
        .await
        .unwrap();
    assert!(filtered.iter().all(|r| r.collection_id == 1));
}

#[tokio::test]
async fn cleanliness_penalty_ranks_clean_strategies_first() {
    let dir = tempfile::tempdir().unwrap();
    let retriever = open_retriever(dir.path(), vec![collection(7, "u1")]).await;
    let access = retriever.access_for("u1");

    // Both upvoted so both stay retrievable; the second needed a
    // tactical workaround mid-flight.
    retriever
        .process_turn_for_rag(&turn(1, 1000, Some("up")), Some(7), &access)
        .await
        .unwrap();

    let mut dirty = turn(2, 900, Some("up"));
    dirty.execution_trace.push(TraceEntry {
        action: Some(TraceAction {
            tool_name: "base_readQuery".into(),
            arguments: json!({}),
            metadata: TraceActionMeta {
                phase_number: Some(1),
                kind: Some("workaround".into()),
            },
        }),
        result: Some(TraceResult {
            status: Some("success".into()),
        }),
    });
    retriever
        .process_turn_for_rag(&dirty, Some(7), &access)
        .await
        .unwrap();

    let results = retriever
        .retrieve_examples(QUERY, 2, 0.5, None, &access, RepositoryType::Planner)
        .await
        .unwrap();
    assert_eq!(results.len(), 2);
    // Identical base similarity (same query text); the clean case must
    // rank strictly higher.
    assert!(!results[0].had_tactical_improvements);
    assert!(results[1].had_tactical_improvements);
    assert!(results[0].adjusted_score > results[1].adjusted_score);
}

#[tokio::test]
async fn flat_layout_migrates_and_index_rebuilds() {
    let dir = tempfile::tempdir().unwrap();

    // Seed a legacy flat-layout case file, then open the retriever.
    let mut case = tokenweave_rag::extract_case(&turn(1, 1000, None), 7).unwrap();
    case.metadata.user_uuid = "u1".into();
    case.metadata.is_most_efficient = true;
    std::fs::create_dir_all(dir.path()).unwrap();
    std::fs::write(
        dir.path().join(format!("case_{}.json", case.case_id)),
        serde_json::to_string_pretty(&case).unwrap(),
    )
    .unwrap();

    let retriever = open_retriever(dir.path(), vec![collection(7, "u1")]).await;
    let access = retriever.access_for("u1");

    // The flat file moved into the collection directory...
    assert!(
        dir.path()
            .join("collection_7")
            .join(format!("case_{}.json", case.case_id))
            .exists()
    );
    assert!(!dir.path().join(format!("case_{}.json", case.case_id)).exists());

    // ...and the empty index was rebuilt from it.
    let results = retriever
        .retrieve_examples(QUERY, 1, 0.7, None, &access, RepositoryType::Planner)
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].case_id, format!("case_{}", case.case_id));
}

#[tokio::test]
async fn knowledge_chunks_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let mut knowledge = collection(9, "u1");
    knowledge.repository_type = RepositoryType::Knowledge;
    knowledge.mcp_server_id = None;
    let retriever = open_retriever(dir.path(), vec![knowledge]).await;
    let access = retriever.access_for("u1");

    retriever
        .index_knowledge_chunks(
            9,
            &access,
            "handbook",
            &[
                "Revenue is recognized at delivery.".to_string(),
                "Customers are ranked by total revenue.".to_string(),
            ],
        )
        .await
        .unwrap();

    let results = retriever
        .retrieve_examples(
            "customers ranked by revenue",
            2,
            0.1,
            None,
            &access,
            RepositoryType::Knowledge,
        )
        .await
        .unwrap();
    assert!(!results.is_empty());
    assert_eq!(results[0].strategy_type, StrategyType::Knowledge);
    assert_eq!(results[0].document_id.as_deref(), Some("handbook"));
}

#[tokio::test]
async fn collection_lifecycle_add_toggle_remove() {
    let dir = tempfile::tempdir().unwrap();
    let retriever = open_retriever(dir.path(), vec![collection(1, "u1")]).await;

    retriever.add_collection(collection(2, "u1")).await.unwrap();
    let access = retriever.access_for("u1");
    retriever
        .process_turn_for_rag(&turn(1, 1000, None), Some(2), &access)
        .await
        .unwrap();

    retriever.toggle_collection(2, false).await.unwrap();
    let results = retriever
        .retrieve_examples(QUERY, 5, 0.7, None, &access, RepositoryType::Planner)
        .await
        .unwrap();
    assert!(results.iter().all(|r| r.collection_id != 2));

    retriever.toggle_collection(2, true).await.unwrap();
    let results = retriever
        .retrieve_examples(QUERY, 5, 0.7, None, &access, RepositoryType::Planner)
        .await
        .unwrap();
    assert!(results.iter().any(|r| r.collection_id == 2));

    retriever.remove_collection(2, &access).await.unwrap();
    assert!(!dir.path().join("collection_2").exists());
}
