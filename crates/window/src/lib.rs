//! # Tokenweave Window
//!
//! The context window orchestrator: a four-pass budget scheduler that
//! composes an LLM prompt from pluggable context modules, plus the module
//! registry that discovers them and the prompt builder that adapts the
//! assembled context for each call site.
//!
//! ```text
//! Orchestrator → AssembledContext → ContextBuilder → PromptContext
//!  (budget-aware)                    (format bridge)   (template-ready)
//! ```

pub mod builder;
pub mod manifest;
pub mod modules;
pub mod orchestrator;
pub mod prompt_context;
pub mod registry;
pub mod snapshot;

pub use builder::{ContextBuilder, PhaseContext};
pub use manifest::{
    InstalledModuleInfo, ManifestCapabilities, ModuleDefinition, ModuleManifest, ModuleSource,
};
pub use modules::{BuiltinModuleDeps, builtin_factories, builtin_manifests, install_builtin_manifests};
pub use orchestrator::{AssembledContext, ContextWindowOrchestrator, DEFAULT_MODULE_TIMEOUT};
pub use prompt_context::{CallType, ContextSource, PromptContext};
pub use registry::{FactoryFn, ModuleFactory, ModuleRegistry};
pub use snapshot::{CondensationEvent, ContextWindowSnapshot, ContributionMetric};
