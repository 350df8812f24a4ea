//! The context module contract — the plugin interface of the window system.
//!
//! A context module is a self-contained unit that contributes content to
//! the LLM context window. Each module knows how to produce its content
//! (fetch tools, retrieve cases, format history), declares whether it can
//! condense its output under budget pressure, and declares which profile
//! types it applies to.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::ModuleError;
use crate::profile::ProfileType;
use crate::token::estimate_tokens;
use crate::tool::ToolSource;

/// Module-specific observability metadata attached to a contribution.
pub type Metadata = serde_json::Map<String, Value>;

/// Output of a module's `contribute()` or `condense()` call.
///
/// This is the atomic unit of context — a piece of text with a token
/// estimate and a flag saying whether it can be reduced further.
#[derive(Debug, Clone, Default)]
pub struct Contribution {
    /// The actual text to include in the LLM context window.
    pub content: String,

    /// Estimated tokens consumed by this content.
    pub tokens_used: usize,

    /// Module-specific metrics for observability. Examples:
    /// `{"tool_count": 15, "mode": "names_only"}`,
    /// `{"cases_retrieved": 3, "confidence": 0.87}`.
    pub metadata: Metadata,

    /// Whether this contribution can be further reduced under budget pressure.
    pub condensable: bool,
}

impl Contribution {
    pub fn new(content: impl Into<String>, tokens_used: usize) -> Self {
        Self {
            content: content.into(),
            tokens_used,
            metadata: Metadata::new(),
            condensable: true,
        }
    }

    /// A contribution with no content and no token cost.
    pub fn empty() -> Self {
        Self {
            condensable: false,
            ..Self::default()
        }
    }

    /// An empty contribution carrying an error marker, used by the
    /// orchestrator when a module fails so assembly can continue.
    pub fn failed(reason: impl Into<String>) -> Self {
        let mut c = Self::empty();
        c.metadata
            .insert("error".into(), Value::String(reason.into()));
        c
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn not_condensable(mut self) -> Self {
        self.condensable = false;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.tokens_used == 0 || self.content.is_empty()
    }
}

/// Runtime dependencies handed to modules through the assembly context.
///
/// Typed handles for the capabilities modules commonly need, plus an open
/// bag for anything profile-specific.
#[derive(Clone, Default)]
pub struct Dependencies {
    /// The active server's tool and prompt listings.
    pub tools: Option<Arc<dyn ToolSource>>,

    /// Opaque capability handles keyed by name.
    pub extras: HashMap<String, Value>,
}

impl std::fmt::Debug for Dependencies {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dependencies")
            .field("tools", &self.tools.is_some())
            .field("extras", &self.extras.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Shared state passed to all context modules during budget assembly.
///
/// Modules receive this by shared reference and must not mutate it; the
/// orchestrator alone extends `previous_contributions` between module calls.
#[derive(Debug, Clone)]
pub struct AssemblyContext {
    // --- Profile & session identity ---
    pub profile_type: ProfileType,
    pub profile_id: String,
    pub session_id: String,
    pub user_id: String,

    // --- Session state ---
    /// Full session document (chat history, workflow history, attachments...).
    pub session_data: serde_json::Map<String, Value>,

    /// Current turn number in the conversation (1-based).
    pub turn_number: u32,

    /// Whether this is the first turn (controls full vs condensed context).
    pub is_first_turn: bool,

    // --- Model limits ---
    /// Provider's maximum context window in tokens.
    pub model_context_limit: usize,

    /// Tokens reserved for LLM output generation.
    pub output_token_reserve: usize,

    /// Provider name for token-ratio estimation, when known.
    pub provider: Option<String>,

    // --- Execution dependencies ---
    pub dependencies: Dependencies,

    // --- Profile config ---
    /// Full profile configuration document.
    pub profile_config: Value,

    // --- Cross-module awareness ---
    /// Results from higher-priority modules that have already contributed,
    /// keyed by module id. Allows lower-priority modules to adapt (e.g.
    /// skip content a higher-priority module already provided).
    pub previous_contributions: HashMap<String, Contribution>,
}

impl AssemblyContext {
    pub fn new(
        profile_type: ProfileType,
        profile_id: impl Into<String>,
        session_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            profile_type,
            profile_id: profile_id.into(),
            session_id: session_id.into(),
            user_id: user_id.into(),
            session_data: serde_json::Map::new(),
            turn_number: 1,
            is_first_turn: true,
            model_context_limit: 128_000,
            output_token_reserve: 16_384,
            provider: None,
            dependencies: Dependencies::default(),
            profile_config: Value::Null,
            previous_contributions: HashMap::new(),
        }
    }

    /// Total tokens available for context (limit minus output reserve).
    pub fn available_budget(&self) -> usize {
        self.model_context_limit
            .saturating_sub(self.output_token_reserve)
    }

    pub fn provider(&self) -> Option<&str> {
        self.provider.as_deref()
    }
}

/// Result of a module purge operation.
#[derive(Debug, Clone)]
pub struct PurgeOutcome {
    pub purged: bool,
    pub details: String,
}

impl PurgeOutcome {
    pub fn purged(details: impl Into<String>) -> Self {
        Self {
            purged: true,
            details: details.into(),
        }
    }

    pub fn skipped(details: impl Into<String>) -> Self {
        Self {
            purged: false,
            details: details.into(),
        }
    }
}

/// The context module trait.
///
/// Built-in modules live in the window crate; additional modules arrive
/// through agent packs or the user's module directory, instantiated by a
/// registered handler factory named in their manifest.
#[async_trait]
pub trait ContextModule: Send + Sync {
    /// Unique module identifier (e.g. `system_prompt`, `tool_definitions`).
    /// Must match the `module_id` in the module's manifest.
    fn module_id(&self) -> &str;

    /// Whether this module is relevant for the given profile type.
    ///
    /// Called during Pass 1 of the orchestrator. Modules that return false
    /// are skipped and their budget is redistributed.
    fn applies_to(&self, profile_type: ProfileType) -> bool;

    /// Produce content within the given token budget.
    ///
    /// The primary method — called during Pass 2. The module should produce
    /// its best content within the allocated budget. May suspend on I/O.
    async fn contribute(
        &self,
        budget: usize,
        ctx: &AssemblyContext,
    ) -> Result<Contribution, ModuleError>;

    /// Reduce existing content to fit a smaller budget.
    ///
    /// Called during Pass 4 when total context exceeds the available
    /// budget, in condensation order (lowest priority first). The default
    /// implementation returns the content unchanged and marks it
    /// non-condensable.
    async fn condense(
        &self,
        content: &str,
        _target_tokens: usize,
        ctx: &AssemblyContext,
    ) -> Result<Contribution, ModuleError> {
        Ok(Contribution {
            content: content.to_string(),
            tokens_used: estimate_tokens(content, ctx.provider()),
            metadata: Metadata::new(),
            condensable: false,
        }
        .with_meta("condensed", false)
        .with_meta("reason", "not condensable"))
    }

    /// Clear cached or accumulated data owned by this module for the given
    /// user (and session, when non-empty). The default is a no-op.
    async fn purge(&self, _session_id: &str, _user_id: &str) -> Result<PurgeOutcome, ModuleError> {
        Ok(PurgeOutcome::skipped("module is not purgeable"))
    }

    /// Module health and counters for the admin dashboard.
    fn status(&self) -> Value {
        serde_json::json!({ "status": "ok", "module_id": self.module_id() })
    }
}
