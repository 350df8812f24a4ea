//! Configuration loading, validation, and management for Tokenweave.
//!
//! Loads platform configuration from a TOML file with serde defaults and
//! validates all settings at startup. Context window types are the central
//! record: they name which modules are active for a profile, their budget
//! shares, the condensation order, and the dynamic adjustment rules.
//!
//! Dynamic adjustments are data-driven but closed: the condition and action
//! sets are enums, so an unknown name is rejected at config load rather
//! than silently ignored at assembly time.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use tokenweave_core::error::Error;
use tokenweave_core::profile::ProfileType;
use tracing::warn;

/// The root platform configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlatformConfig {
    /// Context window type records, referenced by profiles.
    #[serde(default)]
    pub context_window_types: Vec<ContextWindowType>,

    /// Profile records.
    #[serde(default)]
    pub profiles: Vec<Profile>,

    /// Module discovery locations.
    #[serde(default)]
    pub module_paths: ModulePaths,

    /// Retrieval engine settings.
    #[serde(default)]
    pub rag: RagSettings,
}

impl PlatformConfig {
    /// Load and validate configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let raw = std::fs::read_to_string(path).map_err(|e| Error::Config {
            message: format!("Cannot read config file {}: {e}", path.display()),
        })?;
        Self::from_toml(&raw)
    }

    /// Parse and validate configuration from a TOML string.
    pub fn from_toml(raw: &str) -> Result<Self, Error> {
        let config: PlatformConfig = toml::from_str(raw).map_err(|e| Error::Config {
            message: format!("Invalid config: {e}"),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn context_window_type(&self, id: &str) -> Option<&ContextWindowType> {
        self.context_window_types.iter().find(|t| t.id == id)
    }

    pub fn profile(&self, id: &str) -> Option<&Profile> {
        self.profiles.iter().find(|p| p.id == id)
    }

    /// Validate every record. Called by the loaders; callers constructing
    /// configs programmatically should call it themselves.
    pub fn validate(&self) -> Result<(), Error> {
        for cwt in &self.context_window_types {
            cwt.validate()?;
        }
        for profile in &self.profiles {
            if self.context_window_type(&profile.context_window_type).is_none() {
                return Err(Error::Config {
                    message: format!(
                        "Profile '{}' references unknown context window type '{}'",
                        profile.id, profile.context_window_type
                    ),
                });
            }
        }
        Ok(())
    }
}

/// A context window type — the per-profile budget configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextWindowType {
    pub id: String,
    pub name: String,

    /// Percentage of the model context limit reserved for output tokens.
    #[serde(default = "default_output_reserve_pct")]
    pub output_reserve_pct: f64,

    /// Per-module overrides keyed by module id.
    #[serde(default)]
    pub modules: ModuleOverrides,

    /// Module ids in condensation order, lowest priority first.
    #[serde(default)]
    pub condensation_order: Vec<String>,

    /// Runtime condition/action reallocation rules.
    #[serde(default)]
    pub dynamic_adjustments: Vec<AdjustmentRule>,
}

fn default_output_reserve_pct() -> f64 {
    12.0
}

impl ContextWindowType {
    pub fn validate(&self) -> Result<(), Error> {
        if !(0.0..100.0).contains(&self.output_reserve_pct) {
            return Err(Error::Config {
                message: format!(
                    "Context window type '{}': output_reserve_pct {} outside [0, 100)",
                    self.id, self.output_reserve_pct
                ),
            });
        }
        for (module_id, m) in self.modules.iter() {
            m.validate(&self.id, module_id)?;
        }
        for rule in &self.dynamic_adjustments {
            rule.validate(&self.id)?;
        }
        for module_id in &self.condensation_order {
            if !self.modules.contains_key(module_id) {
                warn!(
                    cwt = %self.id,
                    module_id = %module_id,
                    "condensation_order names a module absent from the type config"
                );
            }
        }
        Ok(())
    }
}

/// Per-module override within a context window type. Unset budget fields
/// fall back to the module manifest's defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleOverride {
    #[serde(default = "default_true")]
    pub active: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_pct: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_pct: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pct: Option<f64>,
}

fn default_true() -> bool {
    true
}

impl Default for ModuleOverride {
    fn default() -> Self {
        Self {
            active: true,
            priority: None,
            target_pct: None,
            min_pct: None,
            max_pct: None,
        }
    }
}

impl ModuleOverride {
    fn validate(&self, cwt_id: &str, module_id: &str) -> Result<(), Error> {
        let pct_fields = [
            ("target_pct", self.target_pct),
            ("min_pct", self.min_pct),
            ("max_pct", self.max_pct),
        ];
        for (field, value) in pct_fields {
            if let Some(v) = value {
                if !(0.0..=100.0).contains(&v) {
                    return Err(Error::Config {
                        message: format!(
                            "Context window type '{cwt_id}', module '{module_id}': {field} {v} outside [0, 100]"
                        ),
                    });
                }
            }
        }
        if let (Some(min), Some(max)) = (self.min_pct, self.max_pct) {
            if min > max {
                return Err(Error::Config {
                    message: format!(
                        "Context window type '{cwt_id}', module '{module_id}': min_pct {min} > max_pct {max}"
                    ),
                });
            }
        }
        if let Some(p) = self.priority {
            if !(0..=100).contains(&p) {
                return Err(Error::Config {
                    message: format!(
                        "Context window type '{cwt_id}', module '{module_id}': priority {p} outside [0, 100]"
                    ),
                });
            }
        }
        Ok(())
    }
}

/// Module overrides keyed by module id. A thin map wrapper whose
/// deserializer warns on duplicate ids (last entry wins).
#[derive(Debug, Clone, Default, Serialize)]
pub struct ModuleOverrides(pub BTreeMap<String, ModuleOverride>);

impl ModuleOverrides {
    pub fn iter(&self) -> impl Iterator<Item = (&String, &ModuleOverride)> {
        self.0.iter()
    }

    pub fn contains_key(&self, module_id: &str) -> bool {
        self.0.contains_key(module_id)
    }

    pub fn get(&self, module_id: &str) -> Option<&ModuleOverride> {
        self.0.get(module_id)
    }

    pub fn insert(&mut self, module_id: impl Into<String>, config: ModuleOverride) {
        self.0.insert(module_id.into(), config);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'de> Deserialize<'de> for ModuleOverrides {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct MapVisitor;

        impl<'de> Visitor<'de> for MapVisitor {
            type Value = ModuleOverrides;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("a map of module id to module override")
            }

            fn visit_map<A>(self, mut access: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut out = BTreeMap::new();
                while let Some((key, value)) = access.next_entry::<String, ModuleOverride>()? {
                    if out.insert(key.clone(), value).is_some() {
                        warn!(module_id = %key, "Duplicate module id in context window type; last entry wins");
                    }
                }
                Ok(ModuleOverrides(out))
            }
        }

        deserializer.deserialize_map(MapVisitor)
    }
}

/// A dynamic adjustment rule: when the condition holds at assembly time,
/// the action reshapes target percentages before Pass 4.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdjustmentRule {
    pub condition: AdjustmentCondition,
    pub action: AdjustmentAction,
}

impl AdjustmentRule {
    fn validate(&self, cwt_id: &str) -> Result<(), Error> {
        if let AdjustmentAction::Reduce { by_pct, .. } = &self.action {
            if !(0.0..=100.0).contains(by_pct) {
                return Err(Error::Config {
                    message: format!(
                        "Context window type '{cwt_id}': reduce by_pct {by_pct} outside [0, 100]"
                    ),
                });
            }
        }
        Ok(())
    }
}

/// The closed set of adjustment conditions. `high_confidence_rag` reads the
/// rag module's `confidence` metadata on a [0, 1] scale with 0.85 as the
/// threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjustmentCondition {
    FirstTurn,
    NoDocumentsAttached,
    LongConversation,
    HighConfidenceRag,
}

impl AdjustmentCondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdjustmentCondition::FirstTurn => "first_turn",
            AdjustmentCondition::NoDocumentsAttached => "no_documents_attached",
            AdjustmentCondition::LongConversation => "long_conversation",
            AdjustmentCondition::HighConfidenceRag => "high_confidence_rag",
        }
    }
}

/// The closed set of adjustment actions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjustmentAction {
    /// Multiply the module's target_pct by (1 − by_pct/100).
    Reduce { module: String, by_pct: f64 },
    /// Move the whole target_pct of `from` onto `to`.
    Transfer { from: String, to: String },
    /// Set the module's target_pct to its max_pct.
    ForceFull { module: String },
}

/// A profile record binding a profile class to a context window type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub name: String,
    pub profile_type: ProfileType,

    /// Id of the bound context window type.
    pub context_window_type: String,

    #[serde(default = "default_model_context_limit")]
    pub model_context_limit: usize,

    /// Provider name for token-ratio estimation, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,

    /// Opaque profile configuration passed through to modules.
    #[serde(default)]
    pub config: serde_json::Value,
}

fn default_model_context_limit() -> usize {
    128_000
}

/// Module discovery locations for the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModulePaths {
    #[serde(default = "default_builtin_dir")]
    pub builtin_dir: PathBuf,

    /// Installed agent-pack module directories.
    #[serde(default)]
    pub pack_dirs: Vec<PathBuf>,

    #[serde(default = "default_user_dir")]
    pub user_dir: PathBuf,
}

fn default_builtin_dir() -> PathBuf {
    PathBuf::from("modules/builtin")
}

fn default_user_dir() -> PathBuf {
    let home = std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".tokenweave").join("modules")
}

impl Default for ModulePaths {
    fn default() -> Self {
        Self {
            builtin_dir: default_builtin_dir(),
            pack_dirs: Vec::new(),
            user_dir: default_user_dir(),
        }
    }
}

/// Retrieval engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagSettings {
    /// Root directory for per-collection case files.
    #[serde(default = "default_cases_root")]
    pub cases_root: PathBuf,

    /// Default embedding model for collections that do not name one.
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,

    /// Default number of examples to retrieve.
    #[serde(default = "default_examples_k")]
    pub examples_k: usize,

    /// Default minimum similarity threshold.
    #[serde(default = "default_min_score")]
    pub min_score: f64,

    /// Re-synchronize every index with its case directory at startup.
    #[serde(default)]
    pub refresh_on_startup: bool,
}

fn default_cases_root() -> PathBuf {
    PathBuf::from("rag_cases")
}

fn default_embedding_model() -> String {
    "all-MiniLM-L6-v2".into()
}

fn default_examples_k() -> usize {
    3
}

fn default_min_score() -> f64 {
    0.7
}

impl Default for RagSettings {
    fn default() -> Self {
        Self {
            cases_root: default_cases_root(),
            embedding_model: default_embedding_model(),
            examples_k: default_examples_k(),
            min_score: default_min_score(),
            refresh_on_startup: false,
        }
    }
}
