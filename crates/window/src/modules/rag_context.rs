//! RAG context module — few-shot strategy examples for the planner.
//!
//! Retrieves proven strategies for the current query from the user's
//! accessible planner collections and renders them as few-shot blocks.
//! Reports its best similarity as `confidence` so the
//! `high_confidence_rag` adjustment can react to strong matches.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokenweave_core::error::ModuleError;
use tokenweave_core::module::{AssemblyContext, ContextModule, Contribution};
use tokenweave_core::profile::ProfileType;
use tokenweave_core::token::estimate_tokens;
use tokenweave_rag::{RagRetriever, RepositoryType, format_few_shot_example};
use tracing::debug;

pub struct RagContextModule {
    retriever: Option<Arc<RagRetriever>>,
    examples_k: usize,
    min_score: f64,
}

const EXAMPLE_DELIMITER: &str = "### Retrieved Example";

impl RagContextModule {
    pub fn new(retriever: Option<Arc<RagRetriever>>, examples_k: usize, min_score: f64) -> Self {
        Self {
            retriever,
            examples_k,
            min_score,
        }
    }

    fn allowed_collections(ctx: &AssemblyContext) -> Option<HashSet<i64>> {
        ctx.profile_config
            .get("rag_collections")
            .and_then(|v| v.as_array())
            .map(|ids| ids.iter().filter_map(|v| v.as_i64()).collect())
    }

    /// Keep whole examples while they fit; never splits an example.
    fn pack_examples(blocks: &[String], budget: usize, provider: Option<&str>) -> (String, usize) {
        let mut kept = Vec::new();
        let mut used = 0usize;
        for block in blocks {
            let block_tokens = estimate_tokens(block, provider) + 1;
            if used + block_tokens > budget {
                break;
            }
            kept.push(block.as_str());
            used += block_tokens;
        }
        (kept.join("\n\n"), kept.len())
    }
}

#[async_trait]
impl ContextModule for RagContextModule {
    fn module_id(&self) -> &str {
        "rag_context"
    }

    fn applies_to(&self, profile_type: ProfileType) -> bool {
        matches!(
            profile_type,
            ProfileType::ToolEnabled | ProfileType::RagFocused | ProfileType::Genie
        )
    }

    async fn contribute(
        &self,
        budget: usize,
        ctx: &AssemblyContext,
    ) -> Result<Contribution, ModuleError> {
        let Some(retriever) = self.retriever.as_ref() else {
            return Ok(Contribution::empty().with_meta("reason", "retriever unavailable"));
        };
        let Some(query) = ctx.session_data.get("user_query").and_then(|v| v.as_str()) else {
            return Ok(Contribution::empty().with_meta("reason", "no user query"));
        };

        let access = retriever.access_for(ctx.user_id.clone());
        let allowed = Self::allowed_collections(ctx);
        let cases = retriever
            .retrieve_examples(
                query,
                self.examples_k,
                self.min_score,
                allowed.as_ref(),
                &access,
                RepositoryType::Planner,
            )
            .await
            .map_err(|e| ModuleError::Contribution {
                module_id: self.module_id().into(),
                reason: e.to_string(),
            })?;

        if cases.is_empty() {
            return Ok(Contribution::empty().with_meta("cases_retrieved", 0));
        }

        let confidence = cases
            .iter()
            .map(|c| c.similarity)
            .fold(0.0f64, f64::max);
        let blocks: Vec<String> = cases.iter().map(format_few_shot_example).collect();
        let (content, included) = Self::pack_examples(&blocks, budget, ctx.provider());
        debug!(
            retrieved = cases.len(),
            included, confidence, "RAG examples packed"
        );

        if content.is_empty() {
            return Ok(Contribution::empty()
                .with_meta("cases_retrieved", cases.len())
                .with_meta("confidence", confidence));
        }
        let tokens = estimate_tokens(&content, ctx.provider());
        Ok(Contribution::new(content, tokens)
            .with_meta("cases_retrieved", included)
            .with_meta("confidence", confidence))
    }

    /// Fewer examples: re-pack whole example blocks into the target.
    async fn condense(
        &self,
        content: &str,
        target_tokens: usize,
        ctx: &AssemblyContext,
    ) -> Result<Contribution, ModuleError> {
        let blocks: Vec<String> = content
            .split(EXAMPLE_DELIMITER)
            .filter(|part| !part.trim().is_empty())
            .map(|part| format!("{EXAMPLE_DELIMITER}{part}").trim_end().to_string())
            .collect();
        let (condensed, included) = Self::pack_examples(&blocks, target_tokens, ctx.provider());
        let tokens = estimate_tokens(&condensed, ctx.provider());
        Ok(Contribution::new(condensed, tokens)
            .with_meta("strategy", "fewer_examples")
            .with_meta("cases_retrieved", included))
    }

    fn status(&self) -> Value {
        serde_json::json!({
            "status": "ok",
            "module_id": self.module_id(),
            "has_retriever": self.retriever.is_some(),
            "examples_k": self.examples_k,
            "min_score": self.min_score,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn no_retriever_yields_empty_contribution() {
        let module = RagContextModule::new(None, 3, 0.7);
        let ctx = AssemblyContext::new(ProfileType::ToolEnabled, "p", "s", "u");
        let result = module.contribute(1000, &ctx).await.unwrap();
        assert!(result.is_empty());
        assert_eq!(
            result.metadata["reason"],
            serde_json::json!("retriever unavailable")
        );
    }

    #[tokio::test]
    async fn condense_repacks_whole_examples() {
        let module = RagContextModule::new(None, 3, 0.7);
        let ctx = AssemblyContext::new(ProfileType::ToolEnabled, "p", "s", "u");
        let content = format!(
            "{EXAMPLE_DELIMITER} (Case ID: a)\nbody one body one body one\n\n\
             {EXAMPLE_DELIMITER} (Case ID: b)\nbody two body two body two"
        );
        let full_tokens = estimate_tokens(&content, None);
        let condensed = module
            .condense(&content, full_tokens / 2 + 2, &ctx)
            .await
            .unwrap();
        assert!(condensed.tokens_used < full_tokens);
        assert!(condensed.content.contains("Case ID: a"));
        assert!(!condensed.content.contains("Case ID: b"));
        assert_eq!(
            condensed.metadata["strategy"],
            serde_json::json!("fewer_examples")
        );
    }

    #[test]
    fn applies_to_rag_profiles() {
        let module = RagContextModule::new(None, 3, 0.7);
        assert!(module.applies_to(ProfileType::RagFocused));
        assert!(module.applies_to(ProfileType::ToolEnabled));
        assert!(!module.applies_to(ProfileType::LlmOnly));
    }
}
