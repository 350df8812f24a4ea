//! Case extraction — turning a completed turn into an indexable case study.
//!
//! Extraction is strict: only turns that executed their full plan without
//! an unrecoverable error become successful cases. Failed strategies are
//! kept for analysis (excluded from retrieval by the strategy_type filter)
//! and conversational turns are not indexed at all.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokenweave_core::error::RagError;
use tokenweave_core::vector::{ScalarMap, ScalarValue};
use tracing::debug;
use uuid::Uuid;

/// Tool names with special meaning in execution traces. These are wire
/// constants of the platform's trace format.
pub const CONTEXT_REPORT_TOOL: &str = "TDA_ContextReport";
pub const SYSTEM_LOG_TOOL: &str = "TDA_SystemLog";
pub const ORCHESTRATION_TOOL: &str = "TDA_SystemOrchestration";

/// System-log messages with special meaning, carried in the log entry's
/// arguments payload.
pub const UNRECOVERABLE_ERROR_MESSAGE: &str = "Unrecoverable Error";
pub const SYSTEM_CORRECTION_MESSAGE: &str = "System Correction";

/// Strategy classification of an indexed case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyType {
    Successful,
    Failed,
    Conversational,
    /// Knowledge-repository chunks surfaced through the same retrieval path.
    Knowledge,
}

impl StrategyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyType::Successful => "successful",
            StrategyType::Failed => "failed",
            StrategyType::Conversational => "conversational",
            StrategyType::Knowledge => "knowledge",
        }
    }
}

/// One phase of a strategic plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanPhase {
    pub phase: u32,

    #[serde(default)]
    pub goal: String,

    #[serde(default)]
    pub relevant_tools: Vec<String>,

    /// Strategic placeholder arguments (e.g. `{"source": "result_of_phase_1"}`),
    /// not resolved runtime values.
    #[serde(default)]
    pub arguments: Value,

    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub phase_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_over: Option<String>,
}

/// One entry in a turn's execution trace.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraceEntry {
    #[serde(default)]
    pub action: Option<TraceAction>,

    #[serde(default)]
    pub result: Option<TraceResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceAction {
    pub tool_name: String,

    /// Tool call arguments. System-log entries carry their `message` and
    /// `details` payload here.
    #[serde(default)]
    pub arguments: Value,

    #[serde(default)]
    pub metadata: TraceActionMeta,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraceActionMeta {
    #[serde(default)]
    pub phase_number: Option<u32>,

    /// Mid-flight tactical correction marker (`workaround`).
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraceResult {
    /// `success`, `error`, or absent for tools that return data directly.
    #[serde(default)]
    pub status: Option<String>,
}

impl TraceResult {
    fn is_error(&self) -> bool {
        self.status.as_deref() == Some("error")
    }

    /// Results without an explicit status are treated as successful; some
    /// tools return data directly.
    fn is_success(&self) -> bool {
        matches!(self.status.as_deref(), Some("success") | None)
    }
}

/// The raw summary of a completed turn, as handed over by the executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnSummary {
    pub session_id: String,
    pub turn: u32,

    #[serde(default)]
    pub user_query: String,

    #[serde(default)]
    pub user_uuid: Option<String>,

    #[serde(default)]
    pub original_plan: Vec<PlanPhase>,

    #[serde(default)]
    pub execution_trace: Vec<TraceEntry>,

    /// `up` / `down` from the user, when given before the turn was indexed.
    #[serde(default)]
    pub feedback: Option<String>,

    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,

    #[serde(default)]
    pub provider: Option<String>,

    #[serde(default)]
    pub model: Option<String>,

    #[serde(default)]
    pub turn_input_tokens: u64,

    #[serde(default)]
    pub turn_output_tokens: u64,

    #[serde(default)]
    pub final_summary: Option<String>,
}

/// A fully extracted case study, persisted one-per-file and indexed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseStudy {
    pub case_id: String,
    pub metadata: CaseMetadata,
    pub intent: CaseIntent,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub successful_strategy: Option<SuccessfulStrategy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_strategy: Option<FailedStrategy>,
}

impl CaseStudy {
    pub fn strategy_type(&self) -> StrategyType {
        if self.successful_strategy.is_some() {
            StrategyType::Successful
        } else if self.failed_strategy.is_some() {
            StrategyType::Failed
        } else {
            StrategyType::Conversational
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseMetadata {
    pub session_id: String,
    pub turn_id: u32,
    pub is_success: bool,
    pub collection_id: i64,

    #[serde(default)]
    pub user_uuid: String,

    pub has_orchestration: bool,
    pub had_plan_improvements: bool,
    pub had_tactical_improvements: bool,
    pub timestamp: DateTime<Utc>,

    /// −1 downvoted, 0 neutral, +1 upvoted.
    pub user_feedback_score: i32,

    #[serde(default)]
    pub is_most_efficient: bool,

    pub llm: LlmInfo,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy_metrics: Option<StrategyMetrics>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmInfo {
    #[serde(default)]
    pub provider: Option<String>,

    #[serde(default)]
    pub model: Option<String>,

    #[serde(default)]
    pub input_tokens: u64,

    #[serde(default)]
    pub output_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyMetrics {
    pub phase_count: usize,
    pub total_steps: usize,
    pub steps_per_phase: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseIntent {
    pub user_query: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuccessfulStrategy {
    pub phases: Vec<PlanPhase>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedStrategy {
    pub original_plan: Vec<PlanPhase>,
    pub error_summary: String,
    pub failed_action: Value,
}

/// Stable case id derived from session and turn.
pub fn case_id_for(session_id: &str, turn: u32) -> String {
    Uuid::new_v5(
        &Uuid::NAMESPACE_OID,
        format!("{session_id}_{turn}").as_bytes(),
    )
    .to_string()
}

/// Extract a case study from a turn summary.
///
/// Returns `None` when the turn has no strategic value for indexing:
/// conversational turns, turns without a plan, turns that took the
/// history-only context-report shortcut, and incomplete executions.
/// Successful and failed strategies both come back as `Some`; the caller
/// distinguishes them via [`CaseStudy::strategy_type`].
pub fn extract_case(turn: &TurnSummary, collection_id: i64) -> Option<CaseStudy> {
    if turn.session_id.is_empty() {
        debug!("Skipping turn: session_id is empty");
        return None;
    }
    if turn.user_query.is_empty() {
        debug!(turn = turn.turn, "Skipping turn: user_query is empty");
        return None;
    }

    // The context-report shortcut answers from history alone; such turns
    // carry no reusable strategy.
    for entry in &turn.execution_trace {
        if let Some(action) = &entry.action {
            if action.tool_name == CONTEXT_REPORT_TOOL {
                debug!(turn = turn.turn, "Skipping turn: context-report shortcut used");
                return None;
            }
        }
    }

    if turn.original_plan.is_empty() {
        debug!(turn = turn.turn, "Skipping turn: no original plan");
        return None;
    }
    let required_phases: BTreeSet<u32> = turn.original_plan.iter().map(|p| p.phase).collect();
    if required_phases.is_empty() {
        debug!(turn = turn.turn, "Skipping turn: plan has no valid phases");
        return None;
    }

    let mut completed_phases: BTreeSet<u32> = BTreeSet::new();
    let mut has_critical_error = false;
    let mut first_error_action: Option<Value> = None;
    let mut successful_actions: BTreeMap<u32, PlanPhase> = BTreeMap::new();
    let mut had_plan_improvements = false;
    let mut had_tactical_improvements = false;
    let mut has_orchestration = false;

    for entry in &turn.execution_trace {
        let action = entry.action.as_ref();
        let result = entry.result.as_ref();

        if let Some(action) = action {
            if action.metadata.kind.as_deref() == Some("workaround") {
                had_tactical_improvements = true;
            }
            if action.tool_name == SYSTEM_LOG_TOOL {
                match action.arguments.get("message").and_then(Value::as_str) {
                    Some(UNRECOVERABLE_ERROR_MESSAGE) => has_critical_error = true,
                    Some(SYSTEM_CORRECTION_MESSAGE) => {
                        // Only corrections attributed to the planner count
                        // as plan improvements; tactical layers log the
                        // same message for their own retries.
                        let summary = action
                            .arguments
                            .pointer("/details/summary")
                            .and_then(Value::as_str)
                            .unwrap_or_default();
                        if summary.contains("Planner") {
                            had_plan_improvements = true;
                        }
                    }
                    _ => {}
                }
            }
        }

        if result.is_some_and(TraceResult::is_error) {
            has_critical_error = true;
            if first_error_action.is_none() {
                first_error_action =
                    Some(serde_json::to_value(action).unwrap_or(Value::Null));
            }
            continue;
        }

        let Some(action) = action else { continue };
        if !result.is_none_or(TraceResult::is_success) {
            continue;
        }

        if action.tool_name == ORCHESTRATION_TOOL {
            has_orchestration = true;
            if let Some(phase) = action.metadata.phase_number {
                completed_phases.insert(phase);
            }
            continue;
        }

        if action.tool_name == SYSTEM_LOG_TOOL {
            continue;
        }

        let Some(phase_num) = action.metadata.phase_number else {
            continue;
        };
        completed_phases.insert(phase_num);

        let compliant = match turn.original_plan.iter().find(|p| p.phase == phase_num) {
            Some(original) => PlanPhase {
                phase: phase_num,
                goal: original.goal.clone(),
                relevant_tools: vec![action.tool_name.clone()],
                // Keep the strategic placeholders from the plan, not the
                // resolved runtime data.
                arguments: original.arguments.clone(),
                phase_type: original.phase_type.clone(),
                loop_over: original.loop_over.clone(),
            },
            None => PlanPhase {
                phase: phase_num,
                goal: "Goal not found in original plan.".into(),
                relevant_tools: vec![action.tool_name.clone()],
                arguments: action.arguments.clone(),
                phase_type: None,
                loop_over: None,
            },
        };
        successful_actions.insert(phase_num, compliant);
    }

    // Normal execution requires every planned phase to complete. When the
    // system orchestrator merged or reordered phases at runtime, a subset
    // match with at least one successful action is accepted.
    let phase_match = if has_orchestration {
        !completed_phases.is_empty()
            && completed_phases.is_subset(&required_phases)
            && !successful_actions.is_empty()
    } else {
        required_phases == completed_phases
    };
    let is_success = !has_critical_error && phase_match;

    let user_feedback_score = match turn.feedback.as_deref() {
        Some("up") => 1,
        Some("down") => -1,
        _ => 0,
    };

    let mut case = CaseStudy {
        case_id: case_id_for(&turn.session_id, turn.turn),
        metadata: CaseMetadata {
            session_id: turn.session_id.clone(),
            turn_id: turn.turn,
            is_success,
            collection_id,
            user_uuid: turn.user_uuid.clone().unwrap_or_default(),
            has_orchestration,
            had_plan_improvements,
            had_tactical_improvements,
            timestamp: turn.timestamp.unwrap_or_else(Utc::now),
            user_feedback_score,
            is_most_efficient: false,
            llm: LlmInfo {
                provider: turn.provider.clone(),
                model: turn.model.clone(),
                input_tokens: turn.turn_input_tokens,
                output_tokens: turn.turn_output_tokens,
            },
            strategy_metrics: None,
        },
        intent: CaseIntent {
            user_query: turn.user_query.clone(),
        },
        successful_strategy: None,
        failed_strategy: None,
    };

    if is_success {
        let phases: Vec<PlanPhase> = successful_actions.into_values().collect();

        let mut steps_per_phase: BTreeMap<String, usize> = BTreeMap::new();
        let mut total_steps = 0;
        for entry in &turn.execution_trace {
            let Some(action) = &entry.action else { continue };
            if action.tool_name == SYSTEM_LOG_TOOL {
                continue;
            }
            let key = action
                .metadata
                .phase_number
                .map(|p| p.to_string())
                .unwrap_or_else(|| "N/A".into());
            *steps_per_phase.entry(key).or_insert(0) += 1;
            total_steps += 1;
        }
        case.metadata.strategy_metrics = Some(StrategyMetrics {
            phase_count: turn.original_plan.len(),
            total_steps,
            steps_per_phase,
        });
        case.successful_strategy = Some(SuccessfulStrategy { phases });
        Some(case)
    } else if let Some(failed_action) = first_error_action {
        case.failed_strategy = Some(FailedStrategy {
            original_plan: turn.original_plan.clone(),
            error_summary: turn.final_summary.clone().unwrap_or_default(),
            failed_action,
        });
        Some(case)
    } else {
        debug!(
            turn = turn.turn,
            "Skipping turn: incomplete execution without a recorded error"
        );
        None
    }
}

/// Flatten a case into the scalar metadata the vector index requires.
/// The full case document rides along as a JSON string.
pub fn index_metadata(case: &CaseStudy) -> Result<ScalarMap, RagError> {
    let full =
        serde_json::to_string(case).map_err(|e| RagError::Storage(e.to_string()))?;

    let mut m = ScalarMap::new();
    m.insert("case_id".into(), case.case_id.clone().into());
    m.insert("user_uuid".into(), case.metadata.user_uuid.clone().into());
    m.insert(
        "user_query".into(),
        case.intent.user_query.clone().into(),
    );
    m.insert(
        "strategy_type".into(),
        case.strategy_type().as_str().into(),
    );
    m.insert(
        "timestamp".into(),
        case.metadata.timestamp.to_rfc3339().into(),
    );
    m.insert("collection_id".into(), case.metadata.collection_id.into());
    m.insert("is_success".into(), case.metadata.is_success.into());
    m.insert(
        "is_most_efficient".into(),
        case.metadata.is_most_efficient.into(),
    );
    m.insert(
        "had_plan_improvements".into(),
        case.metadata.had_plan_improvements.into(),
    );
    m.insert(
        "had_tactical_improvements".into(),
        case.metadata.had_tactical_improvements.into(),
    );
    m.insert(
        "has_orchestration".into(),
        case.metadata.has_orchestration.into(),
    );
    m.insert(
        "output_tokens".into(),
        ScalarValue::Int(case.metadata.llm.output_tokens as i64),
    );
    m.insert(
        "user_feedback_score".into(),
        ScalarValue::Int(case.metadata.user_feedback_score as i64),
    );
    m.insert("full_case_data".into(), full.into());
    Ok(m)
}

/// One-line summary of a case's strategy, used as an index document
/// fallback and in admin listings.
pub fn summarize_strategy(case: &CaseStudy) -> String {
    if let Some(strategy) = &case.successful_strategy {
        let summaries: Vec<String> = strategy
            .phases
            .iter()
            .map(|p| {
                let tool = p
                    .relevant_tools
                    .first()
                    .map(String::as_str)
                    .unwrap_or("No tool specified.");
                format!("Phase {}: Goal '{}', Tool '{}'", p.phase, p.goal, tool)
            })
            .collect();
        summaries.join(" -> ")
    } else if let Some(failed) = &case.failed_strategy {
        format!("Failed with error: {}", failed.error_summary)
    } else {
        "Strategy details unavailable.".into()
    }
}
