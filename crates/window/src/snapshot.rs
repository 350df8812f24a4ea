//! Context window snapshot — the observability record of one assembly.
//!
//! Emitted after every assembly as a structured `context_window_snapshot`
//! event for live status panels and analytics, and as a compact one-line
//! text summary for logs.

use serde::Serialize;
use serde_json::{Value, json};
use tokenweave_core::module::Metadata;
use tokenweave_core::profile::ProfileType;

/// Per-module metrics from a single context assembly.
#[derive(Debug, Clone, Serialize)]
pub struct ContributionMetric {
    pub module_id: String,

    /// Human-readable label (from the module manifest's display_name).
    pub label: String,

    pub category: String,

    /// Tokens allocated to this module by the budget orchestrator.
    pub tokens_allocated: usize,

    /// Actual tokens consumed by the module's contribution.
    pub tokens_used: usize,

    /// Percentage of the allocated budget actually used.
    pub utilization_pct: f64,

    /// Whether this module's output was condensed during Pass 4.
    pub was_condensed: bool,

    pub is_active: bool,

    /// Module-specific metadata from the Contribution.
    pub metadata: Metadata,
}

/// Record of a condensation operation during Pass 4.
#[derive(Debug, Clone, Serialize)]
pub struct CondensationEvent {
    pub module_id: String,
    pub tokens_before: usize,
    pub tokens_after: usize,

    /// (before − after) / before × 100.
    pub reduction_pct: f64,

    /// Strategy reported by the module (`names_only`, `sliding_window`, ...).
    pub strategy: String,
}

/// Complete snapshot of a context assembly operation.
#[derive(Debug, Clone, Serialize)]
pub struct ContextWindowSnapshot {
    // --- Context window type info ---
    pub context_window_type_id: String,
    pub context_window_type_name: String,

    // --- Budget summary ---
    pub model_context_limit: usize,
    pub output_reserve: usize,
    pub available_budget: usize,
    pub total_used: usize,

    /// total_used / available_budget × 100. Exceeds 100 when Pass 4
    /// exhausted the condensation order without fitting.
    pub utilization_pct: f64,

    // --- Per-module breakdown ---
    pub contributions: Vec<ContributionMetric>,

    // --- Condensation events ---
    pub condensations: Vec<CondensationEvent>,

    // --- Dynamic adjustments ---
    pub dynamic_adjustments_fired: Vec<String>,

    // --- Module resolution info ---
    pub profile_type: ProfileType,
    pub skipped_modules: Vec<String>,
    pub active_module_count: usize,

    // --- Session context ---
    pub session_id: String,
    pub turn_number: u32,

    /// Set when the assembly was cancelled before completion.
    pub cancelled: bool,
}

impl ContextWindowSnapshot {
    /// Structured wire payload for live-status consumers.
    pub fn to_event(&self) -> Value {
        json!({
            "type": "context_window_snapshot",
            "context_window_type": {
                "id": self.context_window_type_id,
                "name": self.context_window_type_name,
            },
            "budget": {
                "model_limit": self.model_context_limit,
                "output_reserve": self.output_reserve,
                "available": self.available_budget,
                "used": self.total_used,
                "utilization_pct": round1(self.utilization_pct),
            },
            "contributions": self.contributions.iter().map(|c| json!({
                "module_id": c.module_id,
                "label": c.label,
                "category": c.category,
                "allocated": c.tokens_allocated,
                "used": c.tokens_used,
                "utilization_pct": round1(c.utilization_pct),
                "condensed": c.was_condensed,
                "active": c.is_active,
                "metadata": c.metadata,
            })).collect::<Vec<_>>(),
            "condensations": self.condensations.iter().map(|e| json!({
                "module_id": e.module_id,
                "before": e.tokens_before,
                "after": e.tokens_after,
                "reduction_pct": round1(e.reduction_pct),
                "strategy": e.strategy,
            })).collect::<Vec<_>>(),
            "dynamic_adjustments": self.dynamic_adjustments_fired,
            "resolution": {
                "profile_type": self.profile_type,
                "active_modules": self.active_module_count,
                "skipped_modules": self.skipped_modules,
            },
            "session_id": self.session_id,
            "turn_number": self.turn_number,
            "cancelled": self.cancelled,
        })
    }

    /// Compact one-line text for logging or status display.
    ///
    /// Example: `Context: 10.4K/184K (5.7%) | Sys:1.0K Tool:3.2K Conv:4.1K`
    pub fn summary_text(&self) -> String {
        let parts: Vec<String> = self
            .contributions
            .iter()
            .filter(|c| c.is_active && c.tokens_used > 0)
            .map(|c| {
                let label: String = c.label.chars().take(4).collect();
                format!("{label}:{:.1}K", c.tokens_used as f64 / 1000.0)
            })
            .collect();

        format!(
            "Context: {:.1}K/{:.0}K ({:.1}%) | {}",
            self.total_used as f64 / 1000.0,
            self.available_budget as f64 / 1000.0,
            self.utilization_pct,
            parts.join(" ")
        )
    }
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> ContextWindowSnapshot {
        ContextWindowSnapshot {
            context_window_type_id: "standard".into(),
            context_window_type_name: "Standard".into(),
            model_context_limit: 200_000,
            output_reserve: 24_000,
            available_budget: 176_000,
            total_used: 10_400,
            utilization_pct: 10_400.0 / 176_000.0 * 100.0,
            contributions: vec![ContributionMetric {
                module_id: "system_prompt".into(),
                label: "System Prompt".into(),
                category: "system".into(),
                tokens_allocated: 12_000,
                tokens_used: 1_000,
                utilization_pct: 1_000.0 / 12_000.0 * 100.0,
                was_condensed: false,
                is_active: true,
                metadata: Metadata::new(),
            }],
            condensations: vec![CondensationEvent {
                module_id: "conversation_history".into(),
                tokens_before: 120_000,
                tokens_after: 74_000,
                reduction_pct: 38.333,
                strategy: "sliding_window".into(),
            }],
            dynamic_adjustments_fired: vec!["first_turn".into()],
            profile_type: ProfileType::ToolEnabled,
            skipped_modules: vec!["rag_context".into()],
            active_module_count: 1,
            session_id: "sess-1".into(),
            turn_number: 3,
            cancelled: false,
        }
    }

    #[test]
    fn event_payload_shape() {
        let event = snapshot().to_event();
        assert_eq!(event["type"], "context_window_snapshot");
        assert_eq!(event["budget"]["available"], 176_000);
        assert_eq!(event["budget"]["utilization_pct"], 5.9);
        assert_eq!(event["contributions"][0]["module_id"], "system_prompt");
        assert_eq!(event["condensations"][0]["reduction_pct"], 38.3);
        assert_eq!(event["dynamic_adjustments"][0], "first_turn");
        assert_eq!(event["resolution"]["skipped_modules"][0], "rag_context");
    }

    #[test]
    fn summary_line_is_compact() {
        let text = snapshot().summary_text();
        assert!(text.starts_with("Context: 10.4K/176K (5.9%)"), "{text}");
        assert!(text.contains("Syst:1.0K"));
    }
}
