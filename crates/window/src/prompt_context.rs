//! The template-ready output of the prompt builder.

use std::collections::BTreeMap;

use crate::snapshot::ContextWindowSnapshot;

/// The four LLM call sites the builder serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallType {
    /// Cross-turn meta-planning.
    Strategic,
    /// Per-phase planning within the current turn.
    Tactical,
    /// Conversation / retrieval synthesis paths.
    Synthesis,
    /// Minimal utility calls (classification, enrichment).
    Utility,
}

impl CallType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallType::Strategic => "strategic",
            CallType::Tactical => "tactical",
            CallType::Synthesis => "synthesis",
            CallType::Utility => "utility",
        }
    }
}

/// Where the builder's content came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextSource {
    /// Budget-aware module content from a cached assembly.
    Builder,
    /// No assembly cached; fallback content only.
    Fallback,
    /// Caller data passed straight through.
    Passthrough,
}

/// Context for one LLM call: template variables ready for injection, the
/// raw content blocks they came from, and a per-call snapshot.
#[derive(Debug, Clone)]
pub struct PromptContext {
    pub call_type: CallType,
    pub template_vars: BTreeMap<String, String>,
    pub content_blocks: BTreeMap<String, String>,
    pub snapshot: Option<ContextWindowSnapshot>,
    pub tokens_used: usize,
    pub source: ContextSource,
}

impl PromptContext {
    pub fn var(&self, key: &str) -> &str {
        self.template_vars.get(key).map(String::as_str).unwrap_or("")
    }
}
