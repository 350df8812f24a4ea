//! Knowledge context module — document chunks from knowledge collections.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokenweave_core::error::ModuleError;
use tokenweave_core::module::{AssemblyContext, ContextModule, Contribution};
use tokenweave_core::profile::ProfileType;
use tokenweave_core::token::estimate_tokens;
use tokenweave_rag::{RagRetriever, RepositoryType, RetrievedCase};

pub struct KnowledgeContextModule {
    retriever: Option<Arc<RagRetriever>>,
    chunks_k: usize,
    min_score: f64,
}

const HEADER: &str = "--- Retrieved Knowledge ---\n";

impl KnowledgeContextModule {
    pub fn new(retriever: Option<Arc<RagRetriever>>, chunks_k: usize, min_score: f64) -> Self {
        Self {
            retriever,
            chunks_k,
            min_score,
        }
    }

    fn format_chunk(case: &RetrievedCase) -> String {
        let source = case.document_id.as_deref().unwrap_or("unknown");
        let index = case.chunk_index.unwrap_or(0);
        format!("[Source: {source}#{index}] {}", case.content)
    }

    /// Chunks arrive sorted by score; keep the best ones that fit.
    fn pack_chunks(chunks: &[String], budget: usize, provider: Option<&str>) -> (String, usize) {
        let mut used = estimate_tokens(HEADER, provider);
        if used >= budget {
            return (String::new(), 0);
        }
        let mut kept = Vec::new();
        for chunk in chunks {
            let chunk_tokens = estimate_tokens(chunk, provider) + 1;
            if used + chunk_tokens > budget {
                break;
            }
            kept.push(chunk.as_str());
            used += chunk_tokens;
        }
        if kept.is_empty() {
            return (String::new(), 0);
        }
        (format!("{HEADER}{}", kept.join("\n")), kept.len())
    }
}

#[async_trait]
impl ContextModule for KnowledgeContextModule {
    fn module_id(&self) -> &str {
        "knowledge_context"
    }

    fn applies_to(&self, _profile_type: ProfileType) -> bool {
        true
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
        let allowed: Option<HashSet<i64>> = ctx
            .profile_config
            .get("knowledge_collections")
            .and_then(|v| v.as_array())
            .map(|ids| ids.iter().filter_map(|v| v.as_i64()).collect());

        let cases = retriever
            .retrieve_examples(
                query,
                self.chunks_k,
                self.min_score,
                allowed.as_ref(),
                &access,
                RepositoryType::Knowledge,
            )
            .await
            .map_err(|e| ModuleError::Contribution {
                module_id: self.module_id().into(),
                reason: e.to_string(),
            })?;

        if cases.is_empty() {
            return Ok(Contribution::empty().with_meta("chunks_retrieved", 0));
        }

        let chunks: Vec<String> = cases.iter().map(Self::format_chunk).collect();
        let (content, included) = Self::pack_chunks(&chunks, budget, ctx.provider());
        if content.is_empty() {
            return Ok(Contribution::empty().with_meta("chunks_retrieved", cases.len()));
        }
        let tokens = estimate_tokens(&content, ctx.provider());
        Ok(Contribution::new(content, tokens)
            .with_meta("chunks_retrieved", included)
            .with_meta("dropped", cases.len() - included))
    }

    /// Drop the lowest-scoring chunks from the tail.
    async fn condense(
        &self,
        content: &str,
        target_tokens: usize,
        ctx: &AssemblyContext,
    ) -> Result<Contribution, ModuleError> {
        let body = content.strip_prefix(HEADER).unwrap_or(content);
        let chunks: Vec<String> = body.lines().map(String::from).collect();
        let (condensed, included) = Self::pack_chunks(&chunks, target_tokens, ctx.provider());
        let tokens = estimate_tokens(&condensed, ctx.provider());
        Ok(Contribution::new(condensed, tokens)
            .with_meta("strategy", "chunk_truncation")
            .with_meta("chunks_retrieved", included))
    }

    fn status(&self) -> Value {
        serde_json::json!({
            "status": "ok",
            "module_id": self.module_id(),
            "has_retriever": self.retriever.is_some(),
            "chunks_k": self.chunks_k,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn no_query_yields_empty() {
        let module = KnowledgeContextModule::new(None, 5, 0.3);
        let ctx = AssemblyContext::new(ProfileType::LlmOnly, "p", "s", "u");
        let result = module.contribute(1000, &ctx).await.unwrap();
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn condense_keeps_leading_chunks() {
        let module = KnowledgeContextModule::new(None, 5, 0.3);
        let ctx = AssemblyContext::new(ProfileType::LlmOnly, "p", "s", "u");
        let content = format!(
            "{HEADER}[Source: a#0] first chunk with enough text to count\n\
             [Source: b#0] second chunk with enough text to count"
        );
        let full = estimate_tokens(&content, None);
        let condensed = module.condense(&content, full / 2 + 4, &ctx).await.unwrap();
        assert!(condensed.tokens_used < full);
        assert!(condensed.content.contains("Source: a#0"));
        assert!(!condensed.content.contains("Source: b#0"));
    }
}
