//! Full-stack pipeline: built-in modules discovered from manifests on
//! disk, backed by a real file session store and RAG retriever, assembled
//! by the orchestrator and adapted by the prompt builder.

use std::sync::Arc;

use serde_json::json;
use tokenweave_config::{ContextWindowType, ModuleOverride, ModuleOverrides};
use tokenweave_core::module::AssemblyContext;
use tokenweave_core::profile::ProfileType;
use tokenweave_core::session::SessionStore;
use tokenweave_core::tool::{ToolDefinition, ToolSource};
use tokenweave_rag::{
    CollectionCatalog, EmbedderRegistry, RagCollection, RagRetriever, RepositoryType, Visibility,
};
use tokenweave_store::FileSessionStore;
use tokenweave_window::{
    BuiltinModuleDeps, CallType, ContextBuilder, ContextWindowOrchestrator, ModuleRegistry,
    PhaseContext, builtin_factories, install_builtin_manifests,
};

struct DemoTools;

impl ToolSource for DemoTools {
    fn tool_definitions(&self) -> Vec<ToolDefinition> {
        vec![ToolDefinition {
            name: "base_readQuery".into(),
            description: "Run a read-only SQL query".into(),
            parameters: json!({
                "type": "object",
                "properties": {"sql": {"type": "string", "description": "The query"}},
                "required": ["sql"]
            }),
        }]
    }
}

struct Fixture {
    _module_dir: tempfile::TempDir,
    _user_dir: tempfile::TempDir,
    _session_dir: tempfile::TempDir,
    _cases_dir: tempfile::TempDir,
    registry: Arc<ModuleRegistry>,
    orchestrator: ContextWindowOrchestrator,
    store: Arc<FileSessionStore>,
}

async fn fixture() -> Fixture {
    let module_dir = tempfile::tempdir().unwrap();
    let user_dir = tempfile::tempdir().unwrap();
    let session_dir = tempfile::tempdir().unwrap();
    let cases_dir = tempfile::tempdir().unwrap();

    install_builtin_manifests(module_dir.path()).unwrap();

    let store = Arc::new(FileSessionStore::new(session_dir.path()));
    let catalog = Arc::new(
        CollectionCatalog::new(vec![RagCollection {
            id: 1,
            name: "default".into(),
            description: String::new(),
            embedding_model: "all-MiniLM-L6-v2".into(),
            repository_type: RepositoryType::Planner,
            owner_user_id: Some("u1".into()),
            visibility: Visibility::Private,
            enabled: true,
            mcp_server_id: Some("srv-1".into()),
            chunking: None,
            is_default: true,
        }])
        .unwrap(),
    );
    let retriever = Arc::new(
        RagRetriever::open(
            cases_dir.path(),
            catalog,
            Arc::new(EmbedderRegistry::default()),
            Some("srv-1".into()),
        )
        .await
        .unwrap(),
    );

    let deps = BuiltinModuleDeps {
        session_store: Some(store.clone() as Arc<dyn SessionStore>),
        retriever: Some(retriever),
        ..BuiltinModuleDeps::default()
    };
    let registry = Arc::new(ModuleRegistry::new(
        module_dir.path(),
        vec![],
        user_dir.path(),
        builtin_factories(&deps),
    ));
    registry.discover_modules();

    Fixture {
        _module_dir: module_dir,
        _user_dir: user_dir,
        _session_dir: session_dir,
        _cases_dir: cases_dir,
        orchestrator: ContextWindowOrchestrator::new(registry.clone()),
        registry,
        store,
    }
}

fn standard_cwt() -> ContextWindowType {
    let mut modules = ModuleOverrides::default();
    for id in [
        "system_prompt",
        "tool_definitions",
        "conversation_history",
        "workflow_history",
        "rag_context",
        "knowledge_context",
        "document_context",
        "component_instructions",
    ] {
        modules.insert(id, ModuleOverride::default());
    }
    ContextWindowType {
        id: "standard".into(),
        name: "Standard".into(),
        output_reserve_pct: 12.0,
        modules,
        condensation_order: vec![
            "document_context".into(),
            "knowledge_context".into(),
            "rag_context".into(),
            "workflow_history".into(),
            "conversation_history".into(),
            "tool_definitions".into(),
        ],
        dynamic_adjustments: Vec::new(),
    }
}

fn assembly_ctx() -> AssemblyContext {
    let mut ctx = AssemblyContext::new(ProfileType::ToolEnabled, "analyst", "sess-1", "u1");
    ctx.model_context_limit = 200_000;
    ctx.dependencies.tools = Some(Arc::new(DemoTools));
    ctx.session_data.insert(
        "chat_history".into(),
        json!([
            {"role": "user", "content": "show me the revenue table"},
            {"role": "assistant", "content": "Here is the revenue table."}
        ]),
    );
    ctx.session_data
        .insert("user_query".into(), json!("top 10 customers by revenue"));
    ctx.session_data.insert(
        "workflow_history".into(),
        json!({"workflow_history": [
            {"turn": 1, "user_query": "show me the revenue table", "execution_trace": [{}]}
        ]}),
    );
    ctx
}

#[tokio::test]
async fn builtins_assemble_into_a_full_context() {
    let fixture = fixture().await;
    let mut ctx = assembly_ctx();
    let assembled = fixture
        .orchestrator
        .assemble(&standard_cwt(), &mut ctx)
        .await
        .unwrap();

    assert!(assembled.content("system_prompt").contains("data analysis agent"));
    assert!(assembled.content("tool_definitions").contains("base_readQuery"));
    assert!(
        assembled
            .content("conversation_history")
            .contains("show me the revenue table")
    );
    assert!(assembled.content("workflow_history").contains("Turn 1"));

    let snapshot = &assembled.snapshot;
    assert!(snapshot.total_used <= snapshot.available_budget);
    assert!(snapshot.skipped_modules.is_empty());
    assert_eq!(snapshot.active_module_count, 8);

    // Assembly order follows manifest default priorities.
    let order: Vec<&str> = assembled.iter().map(|(id, _)| id).collect();
    assert_eq!(order[0], "system_prompt");
    assert_eq!(*order.last().unwrap(), "component_instructions");
}

#[tokio::test]
async fn llm_only_profile_skips_tool_modules() {
    let fixture = fixture().await;
    let mut ctx = assembly_ctx();
    ctx.profile_type = ProfileType::LlmOnly;
    let assembled = fixture
        .orchestrator
        .assemble(&standard_cwt(), &mut ctx)
        .await
        .unwrap();

    assert!(assembled.snapshot.skipped_modules.contains(&"tool_definitions".to_string()));
    assert!(assembled.snapshot.skipped_modules.contains(&"workflow_history".to_string()));
    assert!(assembled.snapshot.skipped_modules.contains(&"rag_context".to_string()));
    assert!(assembled.contribution("conversation_history").is_some());
}

#[tokio::test]
async fn builder_adapts_the_assembly_for_strategic_calls() {
    let fixture = fixture().await;
    let mut ctx = assembly_ctx();
    let assembled = fixture
        .orchestrator
        .assemble(&standard_cwt(), &mut ctx)
        .await
        .unwrap();

    let mut builder = ContextBuilder::new();
    builder.set_assembled_context(assembled, &ctx);

    let mut pc = PhaseContext::new();
    pc.insert("workflow_goal".into(), json!("rank customers by revenue"));
    let prompt = builder.build(CallType::Strategic, pc);

    assert!(prompt.var("available_tools").contains("base_readQuery"));
    assert_eq!(prompt.var("workflow_goal"), "rank customers by revenue");
    // The strategic adapter re-reads the raw session data as JSON.
    let history: serde_json::Value =
        serde_json::from_str(prompt.var("turn_action_history")).unwrap();
    assert_eq!(history["total_turns"], json!(1));
    assert!(prompt.snapshot.is_some());
}

#[tokio::test]
async fn purge_clears_the_session_slice() {
    let fixture = fixture().await;
    fixture
        .store
        .save(
            "u1",
            "sess-1",
            &json!({"chat_history": [{"role": "user", "content": "hello"}], "other": 1}),
        )
        .await
        .unwrap();

    let outcome = fixture
        .registry
        .purge_module("conversation_history", "sess-1", "u1")
        .await
        .unwrap();
    assert!(outcome.purged);

    let session = fixture.store.load("u1", "sess-1").await.unwrap().unwrap();
    assert!(session.get("chat_history").is_none());
    assert_eq!(session["other"], json!(1));
}

#[tokio::test]
async fn non_purgeable_builtin_is_refused() {
    let fixture = fixture().await;
    let err = fixture
        .registry
        .purge_module("system_prompt", "sess-1", "u1")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not purgeable"));
}
