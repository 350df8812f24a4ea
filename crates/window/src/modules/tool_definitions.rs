//! Tool definitions module — surfaces the active server's tools.
//!
//! Full definitions (description + argument schemas) within budget;
//! condenses to a names-only list under budget pressure.

use async_trait::async_trait;
use tokenweave_core::error::ModuleError;
use tokenweave_core::module::{AssemblyContext, ContextModule, Contribution};
use tokenweave_core::profile::ProfileType;
use tokenweave_core::token::{clip_to_budget, estimate_tokens};
use tokenweave_core::tool::ToolDefinition;

pub struct ToolDefinitionsModule;

const HEADER: &str = "--- Available Tools ---\n";

fn format_tool(tool: &ToolDefinition) -> String {
    let mut lines = vec![format!("- `{}` (tool): {}", tool.name, tool.description)];
    let properties = tool.parameters.get("properties").and_then(|v| v.as_object());
    let required: Vec<&str> = tool
        .parameters
        .get("required")
        .and_then(|v| v.as_array())
        .map(|a| a.iter().filter_map(|v| v.as_str()).collect())
        .unwrap_or_default();
    if let Some(properties) = properties {
        if !properties.is_empty() {
            lines.push("  - Arguments:".into());
            for (name, info) in properties {
                let ptype = info.get("type").and_then(|v| v.as_str()).unwrap_or("string");
                let req = if required.contains(&name.as_str()) {
                    "required"
                } else {
                    "optional"
                };
                let desc = info.get("description").and_then(|v| v.as_str()).unwrap_or("");
                lines.push(format!("    - `{name}` ({ptype}, {req}): {desc}"));
            }
        }
    }
    lines.join("\n")
}

#[async_trait]
impl ContextModule for ToolDefinitionsModule {
    fn module_id(&self) -> &str {
        "tool_definitions"
    }

    fn applies_to(&self, profile_type: ProfileType) -> bool {
        matches!(profile_type, ProfileType::ToolEnabled | ProfileType::Genie)
    }

    async fn contribute(
        &self,
        budget: usize,
        ctx: &AssemblyContext,
    ) -> Result<Contribution, ModuleError> {
        let Some(source) = ctx.dependencies.tools.as_ref() else {
            return Ok(Contribution::empty().with_meta("reason", "no tool source"));
        };
        let tools = source.tool_definitions();
        if tools.is_empty() {
            return Ok(Contribution::empty().with_meta("tool_count", 0));
        }

        let provider = ctx.provider();
        let mut used = estimate_tokens(HEADER, provider);
        let mut sections = Vec::new();
        let mut dropped = 0usize;

        for tool in &tools {
            let section = format_tool(tool);
            let section_tokens = estimate_tokens(&section, provider) + 1;
            if used + section_tokens <= budget {
                sections.push(section);
                used += section_tokens;
            } else {
                dropped += 1;
            }
        }

        if sections.is_empty() {
            return Ok(Contribution::empty()
                .with_meta("tool_count", 0)
                .with_meta("dropped", tools.len()));
        }

        let content = format!("{HEADER}{}", sections.join("\n"));
        let tokens = estimate_tokens(&content, provider);
        Ok(Contribution::new(content, tokens)
            .with_meta("tool_count", sections.len())
            .with_meta("dropped", dropped)
            .with_meta("mode", "full"))
    }

    /// Names-only rendering: one line per tool, descriptions and argument
    /// schemas dropped.
    async fn condense(
        &self,
        _content: &str,
        target_tokens: usize,
        ctx: &AssemblyContext,
    ) -> Result<Contribution, ModuleError> {
        let tools = ctx
            .dependencies
            .tools
            .as_ref()
            .map(|s| s.tool_definitions())
            .unwrap_or_default();
        let names: Vec<String> = tools.iter().map(|t| format!("- `{}`", t.name)).collect();
        let full = format!("{HEADER}{}", names.join("\n"));
        let content = clip_to_budget(&full, target_tokens, ctx.provider()).to_string();
        let tokens = estimate_tokens(&content, ctx.provider());

        Ok(Contribution::new(content, tokens)
            .with_meta("strategy", "names_only")
            .with_meta("mode", "names_only")
            .with_meta("tool_count", names.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokenweave_core::tool::ToolSource;

    struct FixedTools(Vec<ToolDefinition>);

    impl ToolSource for FixedTools {
        fn tool_definitions(&self) -> Vec<ToolDefinition> {
            self.0.clone()
        }
    }

    fn tool(name: &str) -> ToolDefinition {
        ToolDefinition {
            name: name.into(),
            description: format!("The {name} tool does a lot of useful things."),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "database": {"type": "string", "description": "Database name"}
                },
                "required": ["database"]
            }),
        }
    }

    fn ctx_with_tools(count: usize) -> AssemblyContext {
        let mut ctx = AssemblyContext::new(ProfileType::ToolEnabled, "p", "s", "u");
        let tools: Vec<ToolDefinition> = (0..count).map(|i| tool(&format!("tool_{i}"))).collect();
        ctx.dependencies.tools = Some(Arc::new(FixedTools(tools)));
        ctx
    }

    #[tokio::test]
    async fn renders_full_definitions_within_budget() {
        let ctx = ctx_with_tools(3);
        let result = ToolDefinitionsModule.contribute(10_000, &ctx).await.unwrap();
        assert!(result.content.contains("`tool_0` (tool)"));
        assert!(result.content.contains("`database` (string, required)"));
        assert_eq!(result.metadata["tool_count"], serde_json::json!(3));
        assert_eq!(result.metadata["dropped"], serde_json::json!(0));
    }

    #[tokio::test]
    async fn drops_tools_over_budget() {
        let ctx = ctx_with_tools(50);
        let result = ToolDefinitionsModule.contribute(200, &ctx).await.unwrap();
        assert!(result.tokens_used <= 200);
        let dropped = result.metadata["dropped"].as_u64().unwrap();
        assert!(dropped > 0);
    }

    #[tokio::test]
    async fn no_tool_source_is_empty_not_error() {
        let ctx = AssemblyContext::new(ProfileType::ToolEnabled, "p", "s", "u");
        let result = ToolDefinitionsModule.contribute(1000, &ctx).await.unwrap();
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn condense_switches_to_names_only() {
        let ctx = ctx_with_tools(10);
        let full = ToolDefinitionsModule.contribute(10_000, &ctx).await.unwrap();
        let condensed = ToolDefinitionsModule
            .condense(&full.content, full.tokens_used / 4, &ctx)
            .await
            .unwrap();
        assert!(condensed.tokens_used < full.tokens_used);
        assert!(condensed.content.contains("- `tool_0`"));
        assert!(!condensed.content.contains("Arguments"));
        assert_eq!(condensed.metadata["strategy"], serde_json::json!("names_only"));
    }

    #[test]
    fn does_not_apply_to_llm_only() {
        assert!(!ToolDefinitionsModule.applies_to(ProfileType::LlmOnly));
        assert!(ToolDefinitionsModule.applies_to(ProfileType::Genie));
    }
}
