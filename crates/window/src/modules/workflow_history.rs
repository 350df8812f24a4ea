//! Workflow history module — a compact cross-turn summary.
//!
//! Emits one markdown line per prior turn. The strategic prompt builder
//! re-reads the raw session data and formats rich JSON itself; this
//! module's canonical output stays deliberately small.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokenweave_core::error::ModuleError;
use tokenweave_core::module::{AssemblyContext, ContextModule, Contribution, PurgeOutcome};
use tokenweave_core::profile::ProfileType;
use tokenweave_core::session::SessionStore;
use tokenweave_core::token::estimate_tokens;

pub struct WorkflowHistoryModule {
    store: Option<Arc<dyn SessionStore>>,
}

const HEADER: &str = "--- Prior Turns ---\n";

impl WorkflowHistoryModule {
    pub fn new(store: Option<Arc<dyn SessionStore>>) -> Self {
        Self { store }
    }

    fn turn_lines(ctx: &AssemblyContext) -> Vec<String> {
        let turns = ctx
            .session_data
            .get("workflow_history")
            .and_then(|wh| wh.get("workflow_history"))
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        turns
            .iter()
            .filter(|t| t.get("isValid").and_then(|v| v.as_bool()) != Some(false))
            .enumerate()
            .map(|(idx, t)| {
                let number = t
                    .get("turn")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(idx as u64 + 1);
                let query = t.get("user_query").and_then(|v| v.as_str()).unwrap_or("");
                let actions = t
                    .get("execution_trace")
                    .and_then(|v| v.as_array())
                    .map(|a| a.len())
                    .unwrap_or(0);
                format!("- Turn {number}: \"{query}\" ({actions} actions)")
            })
            .collect()
    }

    /// Keep the newest turns that fit the budget.
    fn render(lines: &[String], budget: usize, provider: Option<&str>) -> (String, usize, usize) {
        let mut used = estimate_tokens(HEADER, provider);
        if used >= budget {
            return (String::new(), 0, lines.len());
        }
        let mut kept: Vec<&String> = Vec::new();
        let mut dropped = 0usize;
        for line in lines.iter().rev() {
            let line_tokens = estimate_tokens(line, provider) + 1;
            if used + line_tokens <= budget {
                kept.push(line);
                used += line_tokens;
            } else {
                dropped += 1;
            }
        }
        if kept.is_empty() {
            return (String::new(), 0, lines.len());
        }
        kept.reverse();
        let content = format!(
            "{HEADER}{}",
            kept.iter().map(|s| s.as_str()).collect::<Vec<_>>().join("\n")
        );
        (content, kept.len(), dropped)
    }
}

#[async_trait]
impl ContextModule for WorkflowHistoryModule {
    fn module_id(&self) -> &str {
        "workflow_history"
    }

    fn applies_to(&self, profile_type: ProfileType) -> bool {
        matches!(profile_type, ProfileType::ToolEnabled | ProfileType::Genie)
    }

    async fn contribute(
        &self,
        budget: usize,
        ctx: &AssemblyContext,
    ) -> Result<Contribution, ModuleError> {
        let lines = Self::turn_lines(ctx);
        if lines.is_empty() {
            return Ok(Contribution::empty().with_meta("turn_count", 0));
        }
        let (content, included, dropped) = Self::render(&lines, budget, ctx.provider());
        if content.is_empty() {
            return Ok(Contribution::empty()
                .with_meta("turn_count", 0)
                .with_meta("dropped", lines.len()));
        }
        let tokens = estimate_tokens(&content, ctx.provider());
        Ok(Contribution::new(content, tokens)
            .with_meta("turn_count", included)
            .with_meta("dropped", dropped))
    }

    async fn condense(
        &self,
        _content: &str,
        target_tokens: usize,
        ctx: &AssemblyContext,
    ) -> Result<Contribution, ModuleError> {
        let lines = Self::turn_lines(ctx);
        let (content, included, dropped) = Self::render(&lines, target_tokens, ctx.provider());
        let tokens = estimate_tokens(&content, ctx.provider());
        Ok(Contribution::new(content, tokens)
            .with_meta("strategy", "drop_oldest")
            .with_meta("turn_count", included)
            .with_meta("dropped", dropped))
    }

    async fn purge(&self, session_id: &str, user_id: &str) -> Result<PurgeOutcome, ModuleError> {
        let Some(store) = self.store.as_ref() else {
            return Ok(PurgeOutcome::skipped("no session store configured"));
        };
        if session_id.is_empty() {
            return Ok(PurgeOutcome::skipped("session id required"));
        }
        let session = store.load(user_id, session_id).await.map_err(|e| {
            ModuleError::Contribution {
                module_id: self.module_id().into(),
                reason: e.to_string(),
            }
        })?;
        let Some(mut session) = session else {
            return Ok(PurgeOutcome::skipped("session not found"));
        };
        let removed = session
            .as_object_mut()
            .map(|obj| obj.remove("workflow_history").is_some())
            .unwrap_or(false);
        if removed {
            store
                .save(user_id, session_id, &session)
                .await
                .map_err(|e| ModuleError::Contribution {
                    module_id: self.module_id().into(),
                    reason: e.to_string(),
                })?;
        }
        Ok(PurgeOutcome::purged(format!(
            "workflow history {}",
            if removed { "cleared" } else { "already empty" }
        )))
    }

    fn status(&self) -> Value {
        serde_json::json!({
            "status": "ok",
            "module_id": self.module_id(),
            "has_store": self.store.is_some(),
        })
    }
}
