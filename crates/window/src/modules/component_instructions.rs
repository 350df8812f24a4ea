//! Component instructions module — usage notes for installed components.

use async_trait::async_trait;
use tokenweave_core::error::ModuleError;
use tokenweave_core::module::{AssemblyContext, ContextModule, Contribution};
use tokenweave_core::profile::ProfileType;
use tokenweave_core::token::{clip_to_budget, estimate_tokens};

pub struct ComponentInstructionsModule;

#[async_trait]
impl ContextModule for ComponentInstructionsModule {
    fn module_id(&self) -> &str {
        "component_instructions"
    }

    fn applies_to(&self, _profile_type: ProfileType) -> bool {
        true
    }

    async fn contribute(
        &self,
        budget: usize,
        ctx: &AssemblyContext,
    ) -> Result<Contribution, ModuleError> {
        let Some(items) = ctx
            .profile_config
            .get("component_instructions")
            .and_then(|v| v.as_array())
        else {
            return Ok(Contribution::empty().with_meta("component_count", 0));
        };

        let sections: Vec<String> = items
            .iter()
            .filter_map(|item| {
                let component = item.get("component").and_then(|v| v.as_str())?;
                let instructions = item.get("instructions").and_then(|v| v.as_str())?;
                Some(format!("### {component}\n{instructions}"))
            })
            .collect();
        if sections.is_empty() {
            return Ok(Contribution::empty().with_meta("component_count", 0));
        }

        let full = sections.join("\n\n");
        let content = clip_to_budget(&full, budget, ctx.provider());
        let tokens = estimate_tokens(content, ctx.provider());
        Ok(Contribution::new(content, tokens)
            .not_condensable()
            .with_meta("component_count", sections.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn renders_component_sections() {
        let mut ctx = AssemblyContext::new(ProfileType::ToolEnabled, "p", "s", "u");
        ctx.profile_config = json!({
            "component_instructions": [
                {"component": "charting", "instructions": "Prefer bar charts for rankings."},
                {"component": "export", "instructions": "Name files with ISO dates."}
            ]
        });
        let result = ComponentInstructionsModule.contribute(1000, &ctx).await.unwrap();
        assert!(result.content.contains("### charting"));
        assert!(result.content.contains("ISO dates"));
        assert!(!result.condensable);
        assert_eq!(result.metadata["component_count"], json!(2));
    }

    #[tokio::test]
    async fn no_instructions_is_empty() {
        let ctx = AssemblyContext::new(ProfileType::ToolEnabled, "p", "s", "u");
        let result = ComponentInstructionsModule.contribute(1000, &ctx).await.unwrap();
        assert!(result.is_empty());
    }
}
