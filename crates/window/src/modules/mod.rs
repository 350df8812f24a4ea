//! Built-in context modules and their handler factories.
//!
//! Each built-in ships a canonical manifest (written into the built-in
//! module directory on first run) and registers a factory under its
//! module id, so manifests without an explicit `handler.factory` resolve
//! to the matching built-in.

pub mod component_instructions;
pub mod conversation_history;
pub mod document_context;
pub mod knowledge_context;
pub mod rag_context;
pub mod system_prompt;
pub mod tool_definitions;
pub mod workflow_history;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tokenweave_core::module::ContextModule;
use tokenweave_core::profile::ProfileType;
use tokenweave_core::session::SessionStore;
use tokenweave_rag::RagRetriever;

use crate::manifest::{
    HandlerSpec, ManifestApplicability, ManifestCapabilities, ManifestDefaults, ModuleManifest,
};
use crate::registry::{FactoryFn, ModuleFactory};

pub use component_instructions::ComponentInstructionsModule;
pub use conversation_history::ConversationHistoryModule;
pub use document_context::DocumentContextModule;
pub use knowledge_context::KnowledgeContextModule;
pub use rag_context::RagContextModule;
pub use system_prompt::SystemPromptModule;
pub use tool_definitions::ToolDefinitionsModule;
pub use workflow_history::WorkflowHistoryModule;

/// Shared handles the built-in modules need.
#[derive(Clone)]
pub struct BuiltinModuleDeps {
    pub session_store: Option<Arc<dyn SessionStore>>,
    pub retriever: Option<Arc<RagRetriever>>,
    pub rag_examples_k: usize,
    pub rag_min_score: f64,
    pub knowledge_chunks_k: usize,
    pub knowledge_min_score: f64,
}

impl Default for BuiltinModuleDeps {
    fn default() -> Self {
        Self {
            session_store: None,
            retriever: None,
            rag_examples_k: 3,
            rag_min_score: 0.7,
            knowledge_chunks_k: 5,
            knowledge_min_score: 0.3,
        }
    }
}

fn caps(condensable: bool, purgeable: bool, has_cache: bool) -> ManifestCapabilities {
    ManifestCapabilities {
        condensable,
        purgeable,
        has_cache,
    }
}

/// Handler factories for every built-in, keyed by module id.
pub fn builtin_factories(deps: &BuiltinModuleDeps) -> HashMap<String, Arc<dyn ModuleFactory>> {
    let mut factories: HashMap<String, Arc<dyn ModuleFactory>> = HashMap::new();

    factories.insert(
        "system_prompt".into(),
        FactoryFn::new(caps(false, false, false), |_| {
            Arc::new(SystemPromptModule) as Arc<dyn ContextModule>
        }),
    );

    factories.insert(
        "tool_definitions".into(),
        FactoryFn::new(caps(true, false, false), |_| {
            Arc::new(ToolDefinitionsModule) as Arc<dyn ContextModule>
        }),
    );

    let store = deps.session_store.clone();
    factories.insert(
        "conversation_history".into(),
        FactoryFn::new(caps(true, true, false), move |_| {
            Arc::new(ConversationHistoryModule::new(store.clone())) as Arc<dyn ContextModule>
        }),
    );

    let store = deps.session_store.clone();
    factories.insert(
        "workflow_history".into(),
        FactoryFn::new(caps(true, true, false), move |_| {
            Arc::new(WorkflowHistoryModule::new(store.clone())) as Arc<dyn ContextModule>
        }),
    );

    let retriever = deps.retriever.clone();
    let (k, min_score) = (deps.rag_examples_k, deps.rag_min_score);
    factories.insert(
        "rag_context".into(),
        FactoryFn::new(caps(true, false, true), move |_| {
            Arc::new(RagContextModule::new(retriever.clone(), k, min_score))
                as Arc<dyn ContextModule>
        }),
    );

    let retriever = deps.retriever.clone();
    let (k, min_score) = (deps.knowledge_chunks_k, deps.knowledge_min_score);
    factories.insert(
        "knowledge_context".into(),
        FactoryFn::new(caps(true, false, true), move |_| {
            Arc::new(KnowledgeContextModule::new(retriever.clone(), k, min_score))
                as Arc<dyn ContextModule>
        }),
    );

    let store = deps.session_store.clone();
    factories.insert(
        "document_context".into(),
        FactoryFn::new(caps(true, true, false), move |_| {
            Arc::new(DocumentContextModule::new(store.clone())) as Arc<dyn ContextModule>
        }),
    );

    factories.insert(
        "component_instructions".into(),
        FactoryFn::new(caps(false, false, false), |_| {
            Arc::new(ComponentInstructionsModule) as Arc<dyn ContextModule>
        }),
    );

    factories
}

struct BuiltinSpec {
    module_id: &'static str,
    display_name: &'static str,
    description: &'static str,
    category: &'static str,
    capabilities: ManifestCapabilities,
    profile_types: &'static [ProfileType],
    required: bool,
    priority: i32,
    target_pct: f64,
    min_pct: f64,
    max_pct: f64,
}

const BUILTIN_SPECS: &[BuiltinSpec] = &[
    BuiltinSpec {
        module_id: "system_prompt",
        display_name: "System Prompt",
        description: "Profile identity and behavioral rules",
        category: "system",
        capabilities: ManifestCapabilities {
            condensable: false,
            purgeable: false,
            has_cache: false,
        },
        profile_types: &[],
        required: true,
        priority: 95,
        target_pct: 5.0,
        min_pct: 2.0,
        max_pct: 10.0,
    },
    BuiltinSpec {
        module_id: "tool_definitions",
        display_name: "Tool Definitions",
        description: "Available tools for the active server",
        category: "tools",
        capabilities: ManifestCapabilities {
            condensable: true,
            purgeable: false,
            has_cache: false,
        },
        profile_types: &[ProfileType::ToolEnabled, ProfileType::Genie],
        required: false,
        priority: 80,
        target_pct: 25.0,
        min_pct: 5.0,
        max_pct: 40.0,
    },
    BuiltinSpec {
        module_id: "conversation_history",
        display_name: "Conversation History",
        description: "Recent chat turns in a sliding window",
        category: "history",
        capabilities: ManifestCapabilities {
            condensable: true,
            purgeable: true,
            has_cache: false,
        },
        profile_types: &[],
        required: false,
        priority: 60,
        target_pct: 30.0,
        min_pct: 5.0,
        max_pct: 60.0,
    },
    BuiltinSpec {
        module_id: "workflow_history",
        display_name: "Workflow History",
        description: "Compact summary of prior workflow turns",
        category: "history",
        capabilities: ManifestCapabilities {
            condensable: true,
            purgeable: true,
            has_cache: false,
        },
        profile_types: &[ProfileType::ToolEnabled, ProfileType::Genie],
        required: false,
        priority: 55,
        target_pct: 10.0,
        min_pct: 0.0,
        max_pct: 25.0,
    },
    BuiltinSpec {
        module_id: "rag_context",
        display_name: "RAG Context",
        description: "Few-shot strategy examples from planner collections",
        category: "knowledge",
        capabilities: ManifestCapabilities {
            condensable: true,
            purgeable: false,
            has_cache: true,
        },
        profile_types: &[
            ProfileType::ToolEnabled,
            ProfileType::RagFocused,
            ProfileType::Genie,
        ],
        required: false,
        priority: 50,
        target_pct: 10.0,
        min_pct: 0.0,
        max_pct: 20.0,
    },
    BuiltinSpec {
        module_id: "knowledge_context",
        display_name: "Knowledge Context",
        description: "Document chunks from knowledge collections",
        category: "knowledge",
        capabilities: ManifestCapabilities {
            condensable: true,
            purgeable: false,
            has_cache: true,
        },
        profile_types: &[],
        required: false,
        priority: 45,
        target_pct: 10.0,
        min_pct: 0.0,
        max_pct: 25.0,
    },
    BuiltinSpec {
        module_id: "document_context",
        display_name: "Document Context",
        description: "Session attachments with per-file truncation",
        category: "documents",
        capabilities: ManifestCapabilities {
            condensable: true,
            purgeable: true,
            has_cache: false,
        },
        profile_types: &[],
        required: false,
        priority: 40,
        target_pct: 10.0,
        min_pct: 0.0,
        max_pct: 30.0,
    },
    BuiltinSpec {
        module_id: "component_instructions",
        display_name: "Component Instructions",
        description: "Usage notes for installed components",
        category: "system",
        capabilities: ManifestCapabilities {
            condensable: false,
            purgeable: false,
            has_cache: false,
        },
        profile_types: &[],
        required: false,
        priority: 20,
        target_pct: 5.0,
        min_pct: 0.0,
        max_pct: 10.0,
    },
];

/// Canonical manifests for the built-in modules.
pub fn builtin_manifests() -> Vec<ModuleManifest> {
    BUILTIN_SPECS
        .iter()
        .map(|spec| ModuleManifest {
            module_id: spec.module_id.into(),
            display_name: spec.display_name.into(),
            version: "1.0.0".into(),
            description: spec.description.into(),
            category: spec.category.into(),
            capabilities: spec.capabilities,
            applicability: ManifestApplicability {
                profile_types: spec.profile_types.to_vec(),
                required: spec.required,
            },
            defaults: ManifestDefaults {
                priority: spec.priority,
                target_pct: spec.target_pct,
                min_pct: spec.min_pct,
                max_pct: spec.max_pct,
            },
            handler: HandlerSpec { factory: None },
        })
        .collect()
}

/// Materialize the built-in manifests into a module directory. Existing
/// manifests are overwritten so upgrades propagate.
pub fn install_builtin_manifests(dir: &Path) -> std::io::Result<()> {
    for manifest in builtin_manifests() {
        let module_dir = dir.join(&manifest.module_id);
        std::fs::create_dir_all(&module_dir)?;
        let serialized = serde_json::to_string_pretty(&manifest)
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        std::fs::write(module_dir.join("manifest.json"), serialized)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ModuleRegistry;

    #[test]
    fn every_builtin_has_a_factory() {
        let deps = BuiltinModuleDeps::default();
        let factories = builtin_factories(&deps);
        for manifest in builtin_manifests() {
            assert!(
                factories.contains_key(manifest.factory_key()),
                "missing factory for {}",
                manifest.module_id
            );
        }
    }

    #[test]
    fn installed_manifests_discover_cleanly() {
        let builtin = tempfile::tempdir().unwrap();
        let user = tempfile::tempdir().unwrap();
        install_builtin_manifests(builtin.path()).unwrap();

        let registry = ModuleRegistry::new(
            builtin.path(),
            vec![],
            user.path(),
            builtin_factories(&BuiltinModuleDeps::default()),
        );
        let modules = registry.discover_modules();
        assert_eq!(modules.len(), BUILTIN_SPECS.len());
        assert!(registry.get_module("system_prompt").unwrap().required());
        assert!(registry.get_module("conversation_history").unwrap().purgeable());
    }

    #[test]
    fn factory_capabilities_cover_manifests() {
        let deps = BuiltinModuleDeps::default();
        let factories = builtin_factories(&deps);
        for manifest in builtin_manifests() {
            let factory = &factories[manifest.factory_key()];
            assert!(
                factory.capabilities().supports(&manifest.capabilities).is_none(),
                "factory for {} under-declares capabilities",
                manifest.module_id
            );
        }
    }
}
