//! The context window orchestrator — the budget scheduler.
//!
//! Manages the scarcest resource in the platform: the LLM context window.
//! Reads a profile's bound context window type, resolves which modules
//! are active, allocates budget, and produces a snapshot for
//! observability.
//!
//! Four-Pass Assembly:
//!   Pass 1: RESOLVE ACTIVE MODULES — skip deactivated and inapplicable
//!   Pass 2: ALLOCATE AND CONTRIBUTE — budget each module and invoke it
//!   Pass 3: APPLY DYNAMIC ADJUSTMENTS — condition-based reallocation
//!   Pass 4: CONDENSE IF OVER BUDGET — lowest-priority modules first

use std::sync::Arc;
use std::time::Duration;

use tokenweave_config::{AdjustmentAction, AdjustmentCondition, ContextWindowType};
use tokenweave_core::error::Error;
use tokenweave_core::module::{AssemblyContext, ContextModule, Contribution};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::registry::ModuleRegistry;
use crate::snapshot::{CondensationEvent, ContextWindowSnapshot, ContributionMetric};

/// Soft per-module timeout for `contribute`. Exceeding it yields an empty
/// contribution with a timeout marker; assembly continues.
pub const DEFAULT_MODULE_TIMEOUT: Duration = Duration::from_secs(30);

/// Confidence threshold for the `high_confidence_rag` condition, on the
/// rag module's [0, 1] confidence scale.
const HIGH_CONFIDENCE_THRESHOLD: f64 = 0.85;

/// A module resolved for one assembly, with its effective configuration.
struct ActiveModule {
    module_id: String,
    handler: Arc<dyn ContextModule>,
    label: String,
    category: String,
    priority: i32,
    target_pct: f64,
    min_pct: f64,
    max_pct: f64,
    condensable: bool,

    // Computed during allocation
    allocated_tokens: usize,
}

/// The fully assembled context window, ready for the prompt builder.
///
/// Contributions are stored in assembly order (descending priority, ties
/// broken by module id).
#[derive(Debug, Clone)]
pub struct AssembledContext {
    contributions: Vec<(String, Contribution)>,
    pub snapshot: ContextWindowSnapshot,
    pub total_tokens: usize,
}

impl AssembledContext {
    /// Assemble a context from parts. The orchestrator is the normal
    /// producer; this exists for adapters and tests that need a canned
    /// assembly.
    pub fn from_parts(
        contributions: Vec<(String, Contribution)>,
        snapshot: ContextWindowSnapshot,
    ) -> Self {
        let total_tokens = contributions.iter().map(|(_, c)| c.tokens_used).sum();
        Self {
            contributions,
            snapshot,
            total_tokens,
        }
    }

    pub fn contribution(&self, module_id: &str) -> Option<&Contribution> {
        self.contributions
            .iter()
            .find(|(id, _)| id == module_id)
            .map(|(_, c)| c)
    }

    /// A module's contribution content, empty when it did not contribute.
    pub fn content(&self, module_id: &str) -> &str {
        self.contribution(module_id)
            .map(|c| c.content.as_str())
            .unwrap_or("")
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Contribution)> {
        self.contributions.iter().map(|(id, c)| (id.as_str(), c))
    }

    /// All contributions concatenated, for debugging.
    pub fn all_content(&self) -> String {
        self.contributions
            .iter()
            .filter(|(_, c)| !c.content.is_empty())
            .map(|(_, c)| c.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn len(&self) -> usize {
        self.contributions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contributions.is_empty()
    }
}

/// The orchestrator. Stateless across assemblies apart from the retained
/// last snapshot.
pub struct ContextWindowOrchestrator {
    registry: Arc<ModuleRegistry>,
    module_timeout: Duration,
    last_snapshot: std::sync::RwLock<Option<ContextWindowSnapshot>>,
}

impl ContextWindowOrchestrator {
    pub fn new(registry: Arc<ModuleRegistry>) -> Self {
        Self {
            registry,
            module_timeout: DEFAULT_MODULE_TIMEOUT,
            last_snapshot: std::sync::RwLock::new(None),
        }
    }

    pub fn with_module_timeout(mut self, timeout: Duration) -> Self {
        self.module_timeout = timeout;
        self
    }

    /// Metrics from the last assembly, for the admin dashboard.
    pub fn metrics(&self) -> serde_json::Value {
        match self
            .last_snapshot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
        {
            Some(snapshot) => snapshot.to_event(),
            None => serde_json::json!({ "status": "no_assembly_yet" }),
        }
    }

    /// Assemble the full context window using the four-pass algorithm.
    pub async fn assemble(
        &self,
        context_window_type: &ContextWindowType,
        ctx: &mut AssemblyContext,
    ) -> Result<AssembledContext, Error> {
        self.assemble_with_cancel(context_window_type, ctx, &CancellationToken::new())
            .await
    }

    /// Assemble with external cancellation. After cancellation is
    /// observed, pending modules are not invoked, completed contributions
    /// are discarded, and the snapshot records the cancelled status.
    pub async fn assemble_with_cancel(
        &self,
        context_window_type: &ContextWindowType,
        ctx: &mut AssemblyContext,
        cancel: &CancellationToken,
    ) -> Result<AssembledContext, Error> {
        context_window_type.validate()?;

        let output_reserve = (ctx.model_context_limit as f64
            * context_window_type.output_reserve_pct
            / 100.0) as usize;
        let available_budget = ctx.model_context_limit - output_reserve;
        ctx.output_token_reserve = output_reserve;

        info!(
            cwt = %context_window_type.name,
            budget = available_budget,
            limit = ctx.model_context_limit,
            reserve = output_reserve,
            "Context window assembly"
        );

        // --- Pass 1: Resolve active modules ---
        let (mut active, skipped) = self.resolve_active_modules(context_window_type, ctx);

        if active.is_empty() {
            warn!("No active modules resolved; returning empty context");
            let snapshot = build_snapshot(SnapshotInputs {
                cwt: context_window_type,
                ctx,
                available_budget,
                output_reserve,
                metrics: Vec::new(),
                condensations: Vec::new(),
                adjustments_fired: Vec::new(),
                skipped_modules: skipped,
                cancelled: false,
            });
            self.retain_snapshot(&snapshot);
            return Ok(AssembledContext {
                contributions: Vec::new(),
                total_tokens: 0,
                snapshot,
            });
        }

        redistribute_budget(&mut active);

        // --- Pass 2: Allocate and contribute ---
        let mut contributions: Vec<(String, Contribution)> = Vec::with_capacity(active.len());
        for am in &mut active {
            if cancel.is_cancelled() {
                return Ok(self.cancelled_result(
                    context_window_type,
                    ctx,
                    available_budget,
                    output_reserve,
                    skipped,
                ));
            }

            let allocation = ((available_budget as f64 * am.target_pct / 100.0) as usize)
                .min((available_budget as f64 * am.max_pct / 100.0) as usize)
                .max((available_budget as f64 * am.min_pct / 100.0) as usize);
            am.allocated_tokens = allocation;

            let contribution =
                match tokio::time::timeout(self.module_timeout, am.handler.contribute(allocation, ctx))
                    .await
                {
                    Ok(Ok(contribution)) => {
                        debug!(
                            module_id = %am.module_id,
                            allocated = allocation,
                            used = contribution.tokens_used,
                            "Module contributed"
                        );
                        if contribution.tokens_used > allocation {
                            warn!(
                                module_id = %am.module_id,
                                allocated = allocation,
                                used = contribution.tokens_used,
                                "Contribution exceeds allocation; flagged for condensation"
                            );
                        }
                        contribution
                    }
                    Ok(Err(e)) => {
                        error!(module_id = %am.module_id, error = %e, "Module failed to contribute");
                        Contribution::failed(e.to_string())
                    }
                    Err(_) => {
                        error!(
                            module_id = %am.module_id,
                            timeout_secs = self.module_timeout.as_secs(),
                            "Module contribute timed out"
                        );
                        Contribution::failed(format!(
                            "timed out after {}s",
                            self.module_timeout.as_secs()
                        ))
                        .with_meta("timeout", true)
                    }
                };

            ctx.previous_contributions
                .insert(am.module_id.clone(), contribution.clone());
            contributions.push((am.module_id.clone(), contribution));
        }

        // --- Pass 3: Apply dynamic adjustments ---
        let adjustments_fired =
            apply_dynamic_adjustments(context_window_type, &mut active, ctx, &contributions);

        // --- Pass 4: Condense if over budget ---
        let mut total_used: usize = contributions.iter().map(|(_, c)| c.tokens_used).sum();
        let mut condensations = Vec::new();

        if total_used > available_budget {
            total_used = self
                .condense(
                    &active,
                    &mut contributions,
                    &context_window_type.condensation_order,
                    total_used,
                    available_budget,
                    ctx,
                    &mut condensations,
                )
                .await;
        }

        // --- Build result ---
        let metrics: Vec<ContributionMetric> = active
            .iter()
            .filter_map(|am| {
                let (_, contribution) = contributions.iter().find(|(id, _)| *id == am.module_id)?;
                let allocated = am.allocated_tokens;
                let used = contribution.tokens_used;
                Some(ContributionMetric {
                    module_id: am.module_id.clone(),
                    label: am.label.clone(),
                    category: am.category.clone(),
                    tokens_allocated: allocated,
                    tokens_used: used,
                    utilization_pct: if allocated > 0 {
                        used as f64 / allocated as f64 * 100.0
                    } else {
                        0.0
                    },
                    was_condensed: condensations.iter().any(|e| e.module_id == am.module_id),
                    is_active: true,
                    metadata: contribution.metadata.clone(),
                })
            })
            .collect();

        let snapshot = build_snapshot(SnapshotInputs {
            cwt: context_window_type,
            ctx,
            available_budget,
            output_reserve,
            metrics,
            condensations,
            adjustments_fired,
            skipped_modules: skipped,
            cancelled: false,
        });
        self.retain_snapshot(&snapshot);
        info!("{}", snapshot.summary_text());

        Ok(AssembledContext {
            contributions,
            total_tokens: total_used,
            snapshot,
        })
    }

    // -------------------------------------------------------------------
    // Pass 1
    // -------------------------------------------------------------------

    /// Determine which modules participate. A module is skipped when it is
    /// deactivated in the type config, unknown to the registry, or
    /// inapplicable to the profile type.
    fn resolve_active_modules(
        &self,
        context_window_type: &ContextWindowType,
        ctx: &AssemblyContext,
    ) -> (Vec<ActiveModule>, Vec<String>) {
        let mut active = Vec::new();
        let mut skipped = Vec::new();

        for (module_id, config) in context_window_type.modules.iter() {
            if !config.active {
                debug!(module_id = %module_id, "Module deactivated in type config");
                skipped.push(module_id.clone());
                continue;
            }

            let Some(definition) = self.registry.get_module(module_id) else {
                debug!(module_id = %module_id, "Module not found in registry");
                skipped.push(module_id.clone());
                continue;
            };

            if !definition.handler.applies_to(ctx.profile_type) {
                debug!(
                    module_id = %module_id,
                    profile_type = %ctx.profile_type,
                    "Module not applicable to profile type"
                );
                skipped.push(module_id.clone());
                continue;
            }

            let defaults = &definition.manifest.defaults;
            active.push(ActiveModule {
                module_id: module_id.clone(),
                handler: definition.handler.clone(),
                label: definition.manifest.display_name.clone(),
                category: definition.manifest.category.clone(),
                priority: config.priority.unwrap_or(defaults.priority),
                target_pct: config.target_pct.unwrap_or(defaults.target_pct),
                min_pct: config.min_pct.unwrap_or(defaults.min_pct),
                max_pct: config.max_pct.unwrap_or(defaults.max_pct),
                condensable: definition.condensable(),
                allocated_tokens: 0,
            });
        }

        // Highest priority first; ties break on module id so assembly
        // order is fully deterministic.
        active.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.module_id.cmp(&b.module_id))
        });

        debug!(
            active = active.len(),
            skipped = skipped.len(),
            "Resolved active modules"
        );
        (active, skipped)
    }

    // -------------------------------------------------------------------
    // Pass 4
    // -------------------------------------------------------------------

    /// Condense contributions to fit within budget, walking the type's
    /// condensation order (lowest priority first). Stops as soon as total
    /// usage fits. Returns the new total.
    #[allow(clippy::too_many_arguments)]
    async fn condense(
        &self,
        active: &[ActiveModule],
        contributions: &mut [(String, Contribution)],
        condensation_order: &[String],
        mut total_used: usize,
        available_budget: usize,
        ctx: &AssemblyContext,
        events: &mut Vec<CondensationEvent>,
    ) -> usize {
        for module_id in condensation_order {
            if total_used <= available_budget {
                break;
            }

            // Unknown or inactive ids in the order are simply ignored.
            let Some(am) = active.iter().find(|m| &m.module_id == module_id) else {
                continue;
            };
            if !am.condensable {
                continue;
            }
            let Some((_, contribution)) = contributions
                .iter_mut()
                .find(|(id, _)| id == module_id)
            else {
                continue;
            };
            if contribution.tokens_used == 0 {
                continue;
            }

            let overage = total_used - available_budget;
            let target_tokens = contribution.tokens_used.saturating_sub(overage);

            match am
                .handler
                .condense(&contribution.content, target_tokens, ctx)
                .await
            {
                Ok(condensed) => {
                    let tokens_before = contribution.tokens_used;
                    let tokens_after = condensed.tokens_used;
                    if tokens_after < tokens_before {
                        let strategy = condensed
                            .metadata
                            .get("strategy")
                            .and_then(|v| v.as_str())
                            .unwrap_or("unknown")
                            .to_string();
                        *contribution = condensed;
                        total_used -= tokens_before - tokens_after;

                        let reduction_pct =
                            (tokens_before - tokens_after) as f64 / tokens_before as f64 * 100.0;
                        debug!(
                            module_id = %module_id,
                            before = tokens_before,
                            after = tokens_after,
                            reduction_pct = format!("{reduction_pct:.0}"),
                            "Condensed module contribution"
                        );
                        events.push(CondensationEvent {
                            module_id: module_id.clone(),
                            tokens_before,
                            tokens_after,
                            reduction_pct,
                            strategy,
                        });
                    }
                }
                Err(e) => {
                    error!(module_id = %module_id, error = %e, "Condensation failed");
                }
            }
        }

        if total_used > available_budget {
            // No silent truncation: the over-budget total is reported on
            // the snapshot and the caller decides.
            warn!(
                total_used,
                available_budget, "Condensation order exhausted while over budget"
            );
        }
        total_used
    }

    fn cancelled_result(
        &self,
        context_window_type: &ContextWindowType,
        ctx: &AssemblyContext,
        available_budget: usize,
        output_reserve: usize,
        skipped: Vec<String>,
    ) -> AssembledContext {
        warn!("Assembly cancelled; discarding completed contributions");
        let snapshot = build_snapshot(SnapshotInputs {
            cwt: context_window_type,
            ctx,
            available_budget,
            output_reserve,
            metrics: Vec::new(),
            condensations: Vec::new(),
            adjustments_fired: Vec::new(),
            skipped_modules: skipped,
            cancelled: true,
        });
        self.retain_snapshot(&snapshot);
        AssembledContext {
            contributions: Vec::new(),
            total_tokens: 0,
            snapshot,
        }
    }

    fn retain_snapshot(&self, snapshot: &ContextWindowSnapshot) {
        *self
            .last_snapshot
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(snapshot.clone());
    }
}

// -----------------------------------------------------------------------
// Budget redistribution
// -----------------------------------------------------------------------

/// Normalize the surviving modules' target percentages to sum to 100, so
/// the full available budget is consumed regardless of how many modules
/// were skipped.
fn redistribute_budget(active: &mut [ActiveModule]) {
    let total_target: f64 = active.iter().map(|m| m.target_pct).sum();
    if total_target <= 0.0 {
        return;
    }
    for m in active.iter_mut() {
        m.target_pct = m.target_pct / total_target * 100.0;
    }
}

// -----------------------------------------------------------------------
// Pass 3: dynamic adjustments
// -----------------------------------------------------------------------

fn apply_dynamic_adjustments(
    context_window_type: &ContextWindowType,
    active: &mut [ActiveModule],
    ctx: &AssemblyContext,
    contributions: &[(String, Contribution)],
) -> Vec<String> {
    let mut fired = Vec::new();
    for rule in &context_window_type.dynamic_adjustments {
        if evaluate_condition(rule.condition, ctx, contributions) {
            apply_action(&rule.action, active);
            debug!(condition = rule.condition.as_str(), "Dynamic adjustment fired");
            fired.push(rule.condition.as_str().to_string());
        }
    }
    fired
}

fn evaluate_condition(
    condition: AdjustmentCondition,
    ctx: &AssemblyContext,
    contributions: &[(String, Contribution)],
) -> bool {
    match condition {
        AdjustmentCondition::FirstTurn => ctx.is_first_turn,
        AdjustmentCondition::NoDocumentsAttached => ctx
            .session_data
            .get("attachments")
            .and_then(|v| v.as_array())
            .is_none_or(|a| a.is_empty()),
        AdjustmentCondition::LongConversation => ctx.turn_number > 10,
        AdjustmentCondition::HighConfidenceRag => contributions
            .iter()
            .find(|(id, _)| id == "rag_context")
            .and_then(|(_, c)| c.metadata.get("confidence"))
            .and_then(|v| v.as_f64())
            .is_some_and(|confidence| confidence > HIGH_CONFIDENCE_THRESHOLD),
    }
}

fn apply_action(action: &AdjustmentAction, active: &mut [ActiveModule]) {
    match action {
        AdjustmentAction::Reduce { module, by_pct } => {
            if let Some(m) = active.iter_mut().find(|m| &m.module_id == module) {
                m.target_pct *= 1.0 - by_pct / 100.0;
            }
        }
        AdjustmentAction::Transfer { from, to } => {
            let Some(from_idx) = active.iter().position(|m| &m.module_id == from) else {
                return;
            };
            let Some(to_idx) = active.iter().position(|m| &m.module_id == to) else {
                return;
            };
            let amount = active[from_idx].target_pct;
            active[from_idx].target_pct = 0.0;
            active[to_idx].target_pct += amount;
        }
        AdjustmentAction::ForceFull { module } => {
            if let Some(m) = active.iter_mut().find(|m| &m.module_id == module) {
                m.target_pct = m.max_pct;
            }
        }
    }
}

// -----------------------------------------------------------------------
// Snapshot builder
// -----------------------------------------------------------------------

struct SnapshotInputs<'a> {
    cwt: &'a ContextWindowType,
    ctx: &'a AssemblyContext,
    available_budget: usize,
    output_reserve: usize,
    metrics: Vec<ContributionMetric>,
    condensations: Vec<CondensationEvent>,
    adjustments_fired: Vec<String>,
    skipped_modules: Vec<String>,
    cancelled: bool,
}

fn build_snapshot(inputs: SnapshotInputs<'_>) -> ContextWindowSnapshot {
    let total_used: usize = inputs.metrics.iter().map(|m| m.tokens_used).sum();
    let utilization_pct = if inputs.available_budget > 0 {
        total_used as f64 / inputs.available_budget as f64 * 100.0
    } else {
        0.0
    };
    ContextWindowSnapshot {
        context_window_type_id: inputs.cwt.id.clone(),
        context_window_type_name: inputs.cwt.name.clone(),
        model_context_limit: inputs.ctx.model_context_limit,
        output_reserve: inputs.output_reserve,
        available_budget: inputs.available_budget,
        total_used,
        utilization_pct,
        active_module_count: inputs.metrics.len(),
        contributions: inputs.metrics,
        condensations: inputs.condensations,
        dynamic_adjustments_fired: inputs.adjustments_fired,
        profile_type: inputs.ctx.profile_type,
        skipped_modules: inputs.skipped_modules,
        session_id: inputs.ctx.session_id.clone(),
        turn_number: inputs.ctx.turn_number,
        cancelled: inputs.cancelled,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokenweave_core::profile::ProfileType;

    fn module(id: &str, priority: i32, target_pct: f64) -> ActiveModule {
        struct Noop;
        #[async_trait::async_trait]
        impl ContextModule for Noop {
            fn module_id(&self) -> &str {
                "noop"
            }
            fn applies_to(&self, _p: ProfileType) -> bool {
                true
            }
            async fn contribute(
                &self,
                _budget: usize,
                _ctx: &AssemblyContext,
            ) -> Result<Contribution, tokenweave_core::error::ModuleError> {
                Ok(Contribution::empty())
            }
        }
        ActiveModule {
            module_id: id.into(),
            handler: Arc::new(Noop),
            label: id.into(),
            category: "general".into(),
            priority,
            target_pct,
            min_pct: 0.0,
            max_pct: 100.0,
            condensable: true,
            allocated_tokens: 0,
        }
    }

    #[test]
    fn redistribution_normalizes_to_hundred() {
        let mut active = vec![
            module("a", 95, 5.0),
            module("b", 80, 25.0),
            module("c", 60, 40.0),
        ];
        redistribute_budget(&mut active);
        let sum: f64 = active.iter().map(|m| m.target_pct).sum();
        assert!((sum - 100.0).abs() < 0.5);
        assert!((active[0].target_pct - 5.0 / 70.0 * 100.0).abs() < 1e-9);
    }

    #[test]
    fn redistribution_handles_zero_targets() {
        let mut active = vec![module("a", 50, 0.0)];
        redistribute_budget(&mut active);
        assert_eq!(active[0].target_pct, 0.0);
    }

    #[test]
    fn transfer_action_moves_whole_share() {
        let mut active = vec![module("rag_context", 50, 10.0), module("knowledge_context", 45, 15.0)];
        apply_action(
            &AdjustmentAction::Transfer {
                from: "rag_context".into(),
                to: "knowledge_context".into(),
            },
            &mut active,
        );
        assert_eq!(active[0].target_pct, 0.0);
        assert!((active[1].target_pct - 25.0).abs() < 1e-9);
    }

    #[test]
    fn reduce_action_scales_target() {
        let mut active = vec![module("a", 50, 40.0)];
        apply_action(
            &AdjustmentAction::Reduce {
                module: "a".into(),
                by_pct: 25.0,
            },
            &mut active,
        );
        assert!((active[0].target_pct - 30.0).abs() < 1e-9);
    }

    #[test]
    fn force_full_sets_target_to_max() {
        let mut active = vec![module("a", 50, 10.0)];
        active[0].max_pct = 35.0;
        apply_action(&AdjustmentAction::ForceFull { module: "a".into() }, &mut active);
        assert!((active[0].target_pct - 35.0).abs() < 1e-9);
    }

    #[test]
    fn high_confidence_condition_reads_rag_metadata() {
        let ctx = AssemblyContext::new(ProfileType::ToolEnabled, "p", "s", "u");
        let confident =
            Contribution::new("x", 1).with_meta("confidence", 0.9);
        let contributions = vec![("rag_context".to_string(), confident)];
        assert!(evaluate_condition(
            AdjustmentCondition::HighConfidenceRag,
            &ctx,
            &contributions
        ));

        let meek = Contribution::new("x", 1).with_meta("confidence", 0.5);
        let contributions = vec![("rag_context".to_string(), meek)];
        assert!(!evaluate_condition(
            AdjustmentCondition::HighConfidenceRag,
            &ctx,
            &contributions
        ));
    }
}
