//! Context builder — single entry point for per-call prompt assembly.
//!
//! Bridges the orchestrator (which manages budget allocation across
//! modules) and the LLM call sites (which need specific template variable
//! surfaces). Modules produce canonical content and know nothing about
//! call-site templates; the builder applies format adapters where a
//! template expects a different shape.
//!
//! The marquee adapter is strategic workflow history: the
//! workflow_history module emits a compact markdown summary, but the
//! strategic template wants rich JSON with turn metadata and extracted
//! SQL. The builder re-reads the raw session data, scrubs UI-only
//! fields, enriches each turn, and truncates oldest turns until the
//! serialized JSON fits the module's token allocation.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Value, json};
use tokenweave_core::module::{AssemblyContext, Dependencies};
use tokenweave_core::token::{estimate_tokens, tokens_to_chars};
use tracing::debug;

use crate::orchestrator::AssembledContext;
use crate::prompt_context::{CallType, ContextSource, PromptContext};
use crate::snapshot::{ContextWindowSnapshot, ContributionMetric};

/// Caller-supplied control data for one LLM call.
pub type PhaseContext = BTreeMap<String, Value>;

/// Session fields that exist only for UI rendering; stripped before
/// history is shown to the model.
const UI_ONLY_FIELDS: &[&str] = &[
    "ui_events",
    "system_events",
    "knowledge_events",
    "knowledge_chunks_ui",
    "provider",
    "model",
    "status",
    "session_input_tokens",
    "session_output_tokens",
    "final_summary_html",
    "tts_payload",
    "raw_llm_plan",
];

/// Collections larger than this are distilled to a metadata summary.
const DISTILL_ARRAY_LIMIT: usize = 20;
const DISTILL_STRING_LIMIT: usize = 2000;

pub struct ContextBuilder {
    assembled: Option<AssembledContext>,
    session_data: serde_json::Map<String, Value>,
    dependencies: Dependencies,
    provider: Option<String>,
}

impl ContextBuilder {
    pub fn new() -> Self {
        Self {
            assembled: None,
            session_data: serde_json::Map::new(),
            dependencies: Dependencies::default(),
            provider: None,
        }
    }

    /// Store the latest orchestrator output for reuse across the turn's
    /// LLM calls.
    pub fn set_assembled_context(&mut self, assembled: AssembledContext, ctx: &AssemblyContext) {
        self.session_data = ctx.session_data.clone();
        self.dependencies = ctx.dependencies.clone();
        self.provider = ctx.provider.clone();
        self.assembled = Some(assembled);
    }

    pub fn has_assembled_context(&self) -> bool {
        self.assembled.is_some()
    }

    /// Build context for a specific LLM call type. Keys in
    /// `phase_context` override module-derived values.
    pub fn build(&self, call_type: CallType, phase_context: PhaseContext) -> PromptContext {
        match call_type {
            CallType::Strategic => self.build_strategic(phase_context),
            CallType::Tactical => self.build_tactical(phase_context),
            CallType::Synthesis => self.build_synthesis(phase_context),
            CallType::Utility => self.build_utility(phase_context),
        }
    }

    // ------------------------------------------------------------------
    // Strategic planning
    // ------------------------------------------------------------------

    fn build_strategic(&self, pc: PhaseContext) -> PromptContext {
        let mut tv: BTreeMap<String, String> = BTreeMap::new();
        let mut blocks: BTreeMap<String, String> = BTreeMap::new();

        let tools = self.module_content("tool_definitions");
        if tools.is_empty() {
            tv.insert(
                "available_tools".into(),
                "--- No Tools Available ---".into(),
            );
        } else {
            tv.insert("available_tools".into(), tools.clone());
            blocks.insert("tool_definitions".into(), tools);
        }

        tv.insert("available_prompts".into(), self.prompts_context());

        let history = self.format_strategic_history();
        tv.insert("turn_action_history".into(), history.clone());
        blocks.insert("workflow_history".into(), history);

        let rag = self.module_content("rag_context");
        if !rag.is_empty() {
            blocks.insert("rag_context".into(), rag.clone());
        }
        tv.insert("rag_few_shot_examples".into(), rag);

        let knowledge = self.module_content("knowledge_context");
        if !knowledge.is_empty() {
            blocks.insert("knowledge_context".into(), knowledge.clone());
        }
        tv.insert("knowledge_context".into(), knowledge);

        let component = self.module_content("component_instructions");
        if !component.is_empty() {
            blocks.insert("component_instructions".into(), component.clone());
        }
        tv.insert("component_tools".into(), component);

        tv.insert("mcp_system_name".into(), self.mcp_system_name());

        // Control data: caller keys override module-derived values.
        for (key, value) in pc {
            tv.insert(key, value_to_string(&value));
        }

        let tokens = estimated_var_tokens(&tv, self.provider.as_deref());
        let snapshot = self.call_snapshot(CallType::Strategic, &blocks, tokens);
        PromptContext {
            call_type: CallType::Strategic,
            template_vars: tv,
            content_blocks: blocks,
            snapshot,
            tokens_used: tokens,
            source: self.source(),
        }
    }

    // ------------------------------------------------------------------
    // Tactical planning
    // ------------------------------------------------------------------

    /// Tactical calls differ from strategic: tools are filtered to the
    /// current phase, and workflow data is the CURRENT turn's state,
    /// distilled (large results replaced by metadata summaries).
    fn build_tactical(&self, mut pc: PhaseContext) -> PromptContext {
        let mut tv: BTreeMap<String, String> = BTreeMap::new();
        let mut blocks: BTreeMap<String, String> = BTreeMap::new();

        let phase_tools: Vec<String> = pc
            .remove("phase_tools")
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();
        let tools = self.filter_tools_for_phase(&phase_tools);
        tv.insert("permitted_tools_with_details".into(), tools.clone());
        blocks.insert("tool_definitions".into(), tools);

        let prompts = pc
            .remove("permitted_prompts_with_details")
            .map(|v| value_to_string(&v))
            .unwrap_or_else(|| "None".into());
        tv.insert("permitted_prompts_with_details".into(), prompts);

        let state = self
            .session_data
            .get("workflow_state")
            .map(distill_value)
            .unwrap_or_else(|| json!({}));
        let state_json = to_pretty_json(&state);
        tv.insert("all_collected_data".into(), state_json.clone());
        blocks.insert("plan_hydration".into(), state_json);

        let turn_history = self
            .session_data
            .get("turn_action_history")
            .map(distill_value)
            .unwrap_or_else(|| json!([]));
        let turn_history_json = to_pretty_json(&turn_history);
        tv.insert("turn_action_history".into(), turn_history_json.clone());
        blocks.insert("workflow_history".into(), turn_history_json);

        for (key, value) in pc {
            tv.insert(key, value_to_string(&value));
        }

        let tokens = estimated_var_tokens(&tv, self.provider.as_deref());
        let snapshot = self.call_snapshot(CallType::Tactical, &blocks, tokens);
        PromptContext {
            call_type: CallType::Tactical,
            template_vars: tv,
            content_blocks: blocks,
            snapshot,
            tokens_used: tokens,
            source: self.source(),
        }
    }

    // ------------------------------------------------------------------
    // Synthesis (conversation / retrieval paths)
    // ------------------------------------------------------------------

    /// Synthesis paths concatenate sections themselves; the builder hands
    /// them content blocks rather than template variables.
    fn build_synthesis(&self, pc: PhaseContext) -> PromptContext {
        let mut blocks: BTreeMap<String, String> = BTreeMap::new();
        for module_id in [
            "system_prompt",
            "conversation_history",
            "knowledge_context",
            "document_context",
            "component_instructions",
        ] {
            let content = self.module_content(module_id);
            if !content.is_empty() {
                blocks.insert(module_id.into(), content);
            }
        }

        let tv: BTreeMap<String, String> = pc
            .into_iter()
            .map(|(k, v)| (k, value_to_string(&v)))
            .collect();

        let tokens: usize = blocks
            .values()
            .map(|c| estimate_tokens(c, self.provider.as_deref()))
            .sum();
        let snapshot = self.call_snapshot(CallType::Synthesis, &blocks, tokens);
        PromptContext {
            call_type: CallType::Synthesis,
            template_vars: tv,
            content_blocks: blocks,
            snapshot,
            tokens_used: tokens,
            source: self.source(),
        }
    }

    // ------------------------------------------------------------------
    // Utility (minimal calls)
    // ------------------------------------------------------------------

    fn build_utility(&self, pc: PhaseContext) -> PromptContext {
        let tv: BTreeMap<String, String> = pc
            .into_iter()
            .map(|(k, v)| (k, value_to_string(&v)))
            .collect();
        let tokens = estimated_var_tokens(&tv, self.provider.as_deref());
        PromptContext {
            call_type: CallType::Utility,
            template_vars: tv,
            content_blocks: BTreeMap::new(),
            snapshot: None,
            tokens_used: tokens,
            source: ContextSource::Passthrough,
        }
    }

    // ==================================================================
    // Module content access
    // ==================================================================

    fn module_content(&self, module_id: &str) -> String {
        self.assembled
            .as_ref()
            .map(|a| a.content(module_id).to_string())
            .unwrap_or_default()
    }

    fn module_tokens(&self, module_id: &str) -> usize {
        self.assembled
            .as_ref()
            .and_then(|a| a.contribution(module_id))
            .map(|c| c.tokens_used)
            .unwrap_or(0)
    }

    fn source(&self) -> ContextSource {
        if self.assembled.is_some() {
            ContextSource::Builder
        } else {
            ContextSource::Fallback
        }
    }

    fn prompts_context(&self) -> String {
        let Some(tools) = self.dependencies.tools.as_ref() else {
            return "--- No Prompts Available ---".into();
        };
        let prompts = tools.prompt_definitions();
        if prompts.is_empty() {
            return "--- No Prompts Available ---".into();
        }
        prompts
            .iter()
            .map(|p| format!("- `{}` (prompt): {}", p.name, p.description))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn mcp_system_name(&self) -> String {
        self.dependencies
            .extras
            .get("mcp_system_name")
            .and_then(|v| v.as_str())
            .unwrap_or("Database System")
            .to_string()
    }

    // ==================================================================
    // Format adapters
    // ==================================================================

    /// Format workflow history as JSON for strategic planning, respecting
    /// the workflow_history module's budget allocation.
    fn format_strategic_history(&self) -> String {
        let turns = self
            .session_data
            .get("workflow_history")
            .and_then(|wh| wh.get("workflow_history"))
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        let valid_turns: Vec<&Value> = turns
            .iter()
            .filter(|t| t.is_object() && t.get("isValid").and_then(|v| v.as_bool()) != Some(false))
            .collect();

        let total = valid_turns.len();
        let mut scrubbed: Vec<Value> = Vec::with_capacity(total);
        for (idx, turn) in valid_turns.iter().enumerate() {
            let mut turn = (*turn).clone();
            if let Some(obj) = turn.as_object_mut() {
                for field in UI_ONLY_FIELDS {
                    obj.remove(*field);
                }

                // Chunk payloads are heavy and already summarized elsewhere.
                if let Some(kre) = obj
                    .get_mut("knowledge_retrieval_event")
                    .and_then(|v| v.as_object_mut())
                {
                    kre.remove("chunks");
                }

                // System-log entries are bookkeeping, not strategy.
                if let Some(trace) = obj.get_mut("execution_trace").and_then(|v| v.as_array_mut())
                {
                    trace.retain(|e| {
                        e.pointer("/action/tool_name").and_then(|v| v.as_str())
                            != Some(tokenweave_rag::case::SYSTEM_LOG_TOOL)
                    });
                }

                let turn_number = obj
                    .get("turn")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(idx as u64 + 1);
                let mut turn_metadata = json!({
                    "turn_number": turn_number,
                    "profile_tag": obj.get("profile_tag").cloned().unwrap_or(json!("unknown")),
                    "is_most_recent": idx == total - 1,
                });
                if let Some(summary) = obj.get("final_summary_text").and_then(|v| v.as_str()) {
                    let sql = extract_sql(summary);
                    if !sql.is_empty() {
                        turn_metadata["sql_mentioned_in_conversation"] = json!(sql);
                    }
                }
                obj.insert("turn_metadata".into(), turn_metadata);
            }
            scrubbed.push(turn);
        }

        // Truncate oldest turns until the serialization fits the module's
        // budget (when the module contributed at all).
        let budget_tokens = self.module_tokens("workflow_history");
        let char_limit = if budget_tokens > 0 {
            tokens_to_chars(budget_tokens, self.provider.as_deref())
        } else {
            usize::MAX
        };

        let mut rendered = render_history(&scrubbed);
        while rendered.len() > char_limit && scrubbed.len() > 1 {
            scrubbed.remove(0);
            rendered = render_history(&scrubbed);
        }
        if scrubbed.len() < total {
            debug!(
                kept = scrubbed.len(),
                total, "Strategic history truncated to module budget"
            );
        }
        rendered
    }

    /// Filter tools to those named in the strategic plan's
    /// `relevant_tools` for the current phase.
    fn filter_tools_for_phase(&self, relevant_tool_names: &[String]) -> String {
        if relevant_tool_names.is_empty() {
            return "No specific tools available for this phase.".into();
        }
        let definitions = self
            .dependencies
            .tools
            .as_ref()
            .map(|t| t.tool_definitions())
            .unwrap_or_default();

        let mut lines = Vec::new();
        for name in relevant_tool_names {
            match definitions.iter().find(|d| &d.name == name) {
                Some(tool) => {
                    lines.push(format!("- Tool: `{}`", tool.name));
                    lines.push(format!("  - Description: {}", tool.description));
                    let props = tool
                        .parameters
                        .get("properties")
                        .and_then(|v| v.as_object());
                    let required: Vec<&str> = tool
                        .parameters
                        .get("required")
                        .and_then(|v| v.as_array())
                        .map(|a| a.iter().filter_map(|v| v.as_str()).collect())
                        .unwrap_or_default();
                    if let Some(props) = props {
                        if !props.is_empty() {
                            lines.push("  - Arguments:".into());
                            for (pname, pinfo) in props {
                                let ptype =
                                    pinfo.get("type").and_then(|v| v.as_str()).unwrap_or("string");
                                let req = if required.contains(&pname.as_str()) {
                                    "required"
                                } else {
                                    "optional"
                                };
                                let pdesc = pinfo
                                    .get("description")
                                    .and_then(|v| v.as_str())
                                    .unwrap_or("");
                                lines.push(format!("    - `{pname}` ({ptype}, {req}): {pdesc}"));
                            }
                        }
                    }
                }
                None => lines.push(format!("- Tool: `{name}` (details not available)")),
            }
        }
        lines.join("\n")
    }

    // ==================================================================
    // Per-call snapshot
    // ==================================================================

    /// Derive a per-call snapshot from the base assembly snapshot,
    /// rescaling utilization to this call's actual tokens.
    fn call_snapshot(
        &self,
        call_type: CallType,
        blocks: &BTreeMap<String, String>,
        total_tokens: usize,
    ) -> Option<ContextWindowSnapshot> {
        let base = &self.assembled.as_ref()?.snapshot;
        let available = base.available_budget.max(1);

        let contributions: Vec<ContributionMetric> = blocks
            .iter()
            .filter_map(|(module_id, content)| {
                let tokens = estimate_tokens(content, self.provider.as_deref());
                (tokens > 0).then(|| ContributionMetric {
                    module_id: module_id.clone(),
                    label: title_case(module_id),
                    category: "content".into(),
                    tokens_allocated: tokens,
                    tokens_used: tokens,
                    utilization_pct: 100.0,
                    was_condensed: false,
                    is_active: true,
                    metadata: tokenweave_core::module::Metadata::new(),
                })
            })
            .collect();

        Some(ContextWindowSnapshot {
            context_window_type_id: base.context_window_type_id.clone(),
            context_window_type_name: format!(
                "{} ({})",
                base.context_window_type_name,
                call_type.as_str()
            ),
            model_context_limit: base.model_context_limit,
            output_reserve: base.output_reserve,
            available_budget: available,
            total_used: total_tokens,
            utilization_pct: total_tokens as f64 / available as f64 * 100.0,
            active_module_count: contributions.len(),
            contributions,
            condensations: Vec::new(),
            dynamic_adjustments_fired: Vec::new(),
            profile_type: base.profile_type,
            skipped_modules: Vec::new(),
            session_id: base.session_id.clone(),
            turn_number: base.turn_number,
            cancelled: false,
        })
    }
}

impl Default for ContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// -----------------------------------------------------------------------
// Helpers
// -----------------------------------------------------------------------

fn render_history(turns: &[Value]) -> String {
    let most_recent = turns
        .last()
        .and_then(|t| t.get("turn"))
        .and_then(|v| v.as_u64())
        .unwrap_or(turns.len() as u64);
    to_pretty_json(&json!({
        "total_turns": turns.len(),
        "most_recent_turn_number": most_recent,
        "workflow_history": turns,
    }))
}

fn to_pretty_json(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| "{}".into())
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn estimated_var_tokens(vars: &BTreeMap<String, String>, provider: Option<&str>) -> usize {
    vars.values().map(|v| estimate_tokens(v, provider)).sum()
}

fn title_case(module_id: &str) -> String {
    module_id
        .split('_')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Replace large collections and long strings with metadata summaries so
/// tactical prompts stay small.
fn distill_value(value: &Value) -> Value {
    match value {
        Value::Array(items) if items.len() > DISTILL_ARRAY_LIMIT => json!({
            "distilled": true,
            "row_count": items.len(),
            "sample": items.iter().take(3).map(distill_value).collect::<Vec<_>>(),
        }),
        Value::Array(items) => Value::Array(items.iter().map(distill_value).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), distill_value(v)))
                .collect(),
        ),
        Value::String(s) if s.len() > DISTILL_STRING_LIMIT => {
            Value::String(format!(
                "{}... [truncated {} chars]",
                clip_chars(s, DISTILL_STRING_LIMIT),
                s.len() - DISTILL_STRING_LIMIT
            ))
        }
        other => other.clone(),
    }
}

fn clip_chars(text: &str, limit: usize) -> &str {
    if text.len() <= limit {
        return text;
    }
    let mut end = limit;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Extract SQL statements mentioned in a summary: fenced ```sql blocks
/// plus bare SELECT statements.
fn extract_sql(text: &str) -> Vec<String> {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    static SELECT: OnceLock<Regex> = OnceLock::new();
    let fence = FENCE.get_or_init(|| Regex::new(r"(?is)```sql\s*(.+?)```").expect("static regex"));
    let select =
        SELECT.get_or_init(|| Regex::new(r"(?is)\bSELECT\b[^;`]{1,500};").expect("static regex"));

    let mut statements: Vec<String> = fence
        .captures_iter(text)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .collect();

    let stripped = fence.replace_all(text, "");
    statements.extend(
        select
            .find_iter(&stripped)
            .map(|m| m.as_str().trim().to_string()),
    );
    statements
}
