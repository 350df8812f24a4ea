//! System prompt module — highest-priority context, never condensed.

use async_trait::async_trait;
use tokenweave_core::error::ModuleError;
use tokenweave_core::module::{AssemblyContext, ContextModule, Contribution};
use tokenweave_core::profile::ProfileType;
use tokenweave_core::token::{clip_to_budget, estimate_tokens};

pub struct SystemPromptModule;

fn default_prompt(profile_type: ProfileType) -> &'static str {
    match profile_type {
        ProfileType::ToolEnabled => {
            "You are a data analysis agent. Plan your work in phases, execute \
             tools deliberately, and ground every answer in retrieved data."
        }
        ProfileType::LlmOnly => {
            "You are a helpful conversational assistant. Answer directly from \
             the conversation; you have no tools."
        }
        ProfileType::RagFocused => {
            "You are a retrieval-grounded assistant. Prefer retrieved \
             knowledge over prior beliefs and cite your sources."
        }
        ProfileType::Genie => {
            "You are a coordinator agent. Decompose the request, delegate to \
             child sessions, and synthesize their results."
        }
    }
}

#[async_trait]
impl ContextModule for SystemPromptModule {
    fn module_id(&self) -> &str {
        "system_prompt"
    }

    fn applies_to(&self, _profile_type: ProfileType) -> bool {
        true
    }

    async fn contribute(
        &self,
        budget: usize,
        ctx: &AssemblyContext,
    ) -> Result<Contribution, ModuleError> {
        let override_prompt = ctx
            .profile_config
            .get("system_prompt")
            .and_then(|v| v.as_str());
        let has_override = override_prompt.is_some();
        let prompt = override_prompt.unwrap_or_else(|| default_prompt(ctx.profile_type));

        let content = clip_to_budget(prompt, budget, ctx.provider());
        let truncated = content.len() < prompt.len();
        let tokens = estimate_tokens(content, ctx.provider());

        Ok(Contribution::new(content, tokens)
            .not_condensable()
            .with_meta("has_override", has_override)
            .with_meta("truncated", truncated))
    }
}
