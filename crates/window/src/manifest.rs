//! Module manifests — the contract between a module directory and the
//! registry.
//!
//! Each module is a self-contained directory holding a `manifest.json`.
//! The manifest names the handler factory to instantiate, the module's
//! capabilities, which profile types it applies to, and its default
//! budget shares.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokenweave_core::module::ContextModule;
use tokenweave_core::profile::ProfileType;

/// Parsed `manifest.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleManifest {
    pub module_id: String,

    #[serde(default)]
    pub display_name: String,

    #[serde(default = "default_version")]
    pub version: String,

    #[serde(default)]
    pub description: String,

    /// Category: system, tools, history, knowledge, optimization, documents.
    #[serde(default = "default_category")]
    pub category: String,

    #[serde(default)]
    pub capabilities: ManifestCapabilities,

    #[serde(default)]
    pub applicability: ManifestApplicability,

    #[serde(default)]
    pub defaults: ManifestDefaults,

    #[serde(default)]
    pub handler: HandlerSpec,
}

fn default_version() -> String {
    "0.0.0".into()
}

fn default_category() -> String {
    "general".into()
}

impl ModuleManifest {
    /// Minimal manifest for a module id; callers fill in the rest.
    pub fn for_module(module_id: impl Into<String>) -> Self {
        let module_id = module_id.into();
        Self {
            display_name: module_id.clone(),
            module_id,
            version: default_version(),
            description: String::new(),
            category: default_category(),
            capabilities: ManifestCapabilities::default(),
            applicability: ManifestApplicability::default(),
            defaults: ManifestDefaults::default(),
            handler: HandlerSpec::default(),
        }
    }

    /// The factory key resolving this manifest's handler; defaults to the
    /// module id itself.
    pub fn factory_key(&self) -> &str {
        self.handler
            .factory
            .as_deref()
            .unwrap_or(self.module_id.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ManifestCapabilities {
    #[serde(default)]
    pub condensable: bool,

    #[serde(default)]
    pub purgeable: bool,

    #[serde(default)]
    pub has_cache: bool,
}

impl ManifestCapabilities {
    /// Whether these capabilities cover everything `required` declares.
    pub fn supports(&self, required: &ManifestCapabilities) -> Option<&'static str> {
        if required.condensable && !self.condensable {
            return Some("condensable");
        }
        if required.purgeable && !self.purgeable {
            return Some("purgeable");
        }
        None
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ManifestApplicability {
    /// Profile types this module applies to; empty means all.
    #[serde(default)]
    pub profile_types: Vec<ProfileType>,

    /// Required modules cannot be deactivated or uninstalled.
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestDefaults {
    /// 90–100 critical, 30–89 normal, 1–29 optional.
    #[serde(default = "default_priority")]
    pub priority: i32,

    #[serde(default = "default_target_pct")]
    pub target_pct: f64,

    #[serde(default)]
    pub min_pct: f64,

    #[serde(default = "default_max_pct")]
    pub max_pct: f64,
}

fn default_priority() -> i32 {
    50
}

fn default_target_pct() -> f64 {
    5.0
}

fn default_max_pct() -> f64 {
    15.0
}

impl Default for ManifestDefaults {
    fn default() -> Self {
        Self {
            priority: default_priority(),
            target_pct: default_target_pct(),
            min_pct: 0.0,
            max_pct: default_max_pct(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HandlerSpec {
    /// Factory key; `None` resolves to the module id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub factory: Option<String>,
}

/// Where a module was discovered. Later sources override earlier ones on
/// id collision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleSource {
    Builtin,
    Pack,
    User,
}

impl ModuleSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleSource::Builtin => "builtin",
            ModuleSource::Pack => "pack",
            ModuleSource::User => "user",
        }
    }
}

/// A loaded module: its manifest plus a live handler instance.
#[derive(Clone)]
pub struct ModuleDefinition {
    pub manifest: ModuleManifest,
    pub handler: Arc<dyn ContextModule>,
    pub source: ModuleSource,
    pub source_path: PathBuf,
}

impl ModuleDefinition {
    pub fn module_id(&self) -> &str {
        &self.manifest.module_id
    }

    pub fn condensable(&self) -> bool {
        self.manifest.capabilities.condensable
    }

    pub fn purgeable(&self) -> bool {
        self.manifest.capabilities.purgeable
    }

    pub fn required(&self) -> bool {
        self.manifest.applicability.required
    }
}

impl std::fmt::Debug for ModuleDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleDefinition")
            .field("module_id", &self.manifest.module_id)
            .field("source", &self.source)
            .field("source_path", &self.source_path)
            .finish()
    }
}

/// Metadata snapshot for API responses and UI display — no handler
/// instances.
#[derive(Debug, Clone, Serialize)]
pub struct InstalledModuleInfo {
    pub module_id: String,
    pub display_name: String,
    pub version: String,
    pub description: String,
    pub category: String,
    pub source: &'static str,
    pub capabilities: ManifestCapabilities,
    pub applicability: ManifestApplicability,
    pub defaults: ManifestDefaults,
}

impl From<&ModuleDefinition> for InstalledModuleInfo {
    fn from(def: &ModuleDefinition) -> Self {
        Self {
            module_id: def.manifest.module_id.clone(),
            display_name: def.manifest.display_name.clone(),
            version: def.manifest.version.clone(),
            description: def.manifest.description.clone(),
            category: def.manifest.category.clone(),
            source: def.source.as_str(),
            capabilities: def.manifest.capabilities,
            applicability: def.manifest.applicability.clone(),
            defaults: def.manifest.defaults.clone(),
        }
    }
}
