//! Document context module — session attachments, truncated per file.
//!
//! Every attached document gets an equal share of the module budget so a
//! single large file cannot starve the others.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokenweave_core::error::ModuleError;
use tokenweave_core::module::{AssemblyContext, ContextModule, Contribution, PurgeOutcome};
use tokenweave_core::profile::ProfileType;
use tokenweave_core::session::SessionStore;
use tokenweave_core::token::{clip_to_budget, estimate_tokens};

pub struct DocumentContextModule {
    store: Option<Arc<dyn SessionStore>>,
}

#[derive(Debug, Clone, Deserialize)]
struct Attachment {
    name: String,

    #[serde(default)]
    content: String,
}

impl DocumentContextModule {
    pub fn new(store: Option<Arc<dyn SessionStore>>) -> Self {
        Self { store }
    }

    fn attachments(ctx: &AssemblyContext) -> Vec<Attachment> {
        ctx.session_data
            .get("attachments")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    fn render(attachments: &[Attachment], budget: usize, provider: Option<&str>) -> (String, usize) {
        if attachments.is_empty() {
            return (String::new(), 0);
        }
        let per_file = budget / attachments.len();
        let mut truncated = 0usize;
        let sections: Vec<String> = attachments
            .iter()
            .map(|a| {
                let header = format!("--- Document: {} ---\n", a.name);
                let header_tokens = estimate_tokens(&header, provider);
                let body_budget = per_file.saturating_sub(header_tokens);
                let body = clip_to_budget(&a.content, body_budget, provider);
                if body.len() < a.content.len() {
                    truncated += 1;
                }
                format!("{header}{body}")
            })
            .collect();
        (sections.join("\n\n"), truncated)
    }
}

#[async_trait]
impl ContextModule for DocumentContextModule {
    fn module_id(&self) -> &str {
        "document_context"
    }

    fn applies_to(&self, _profile_type: ProfileType) -> bool {
        true
    }

    async fn contribute(
        &self,
        budget: usize,
        ctx: &AssemblyContext,
    ) -> Result<Contribution, ModuleError> {
        let attachments = Self::attachments(ctx);
        if attachments.is_empty() {
            return Ok(Contribution::empty().with_meta("file_count", 0));
        }
        let (content, truncated) = Self::render(&attachments, budget, ctx.provider());
        let tokens = estimate_tokens(&content, ctx.provider());
        Ok(Contribution::new(content, tokens)
            .with_meta("file_count", attachments.len())
            .with_meta("truncated_files", truncated))
    }

    async fn condense(
        &self,
        _content: &str,
        target_tokens: usize,
        ctx: &AssemblyContext,
    ) -> Result<Contribution, ModuleError> {
        let attachments = Self::attachments(ctx);
        let (content, truncated) = Self::render(&attachments, target_tokens, ctx.provider());
        let tokens = estimate_tokens(&content, ctx.provider());
        Ok(Contribution::new(content, tokens)
            .with_meta("strategy", "per_file_truncation")
            .with_meta("file_count", attachments.len())
            .with_meta("truncated_files", truncated))
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
            .map(|obj| obj.remove("attachments").is_some())
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
            "attachments {}",
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

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx_with_docs(sizes: &[usize]) -> AssemblyContext {
        let mut ctx = AssemblyContext::new(ProfileType::ToolEnabled, "p", "s", "u");
        let docs: Vec<Value> = sizes
            .iter()
            .enumerate()
            .map(|(i, size)| {
                json!({"name": format!("doc{i}.md"), "content": "x".repeat(*size)})
            })
            .collect();
        ctx.session_data.insert("attachments".into(), json!(docs));
        ctx
    }

    #[tokio::test]
    async fn small_documents_pass_through() {
        let module = DocumentContextModule::new(None);
        let ctx = ctx_with_docs(&[100, 100]);
        let result = module.contribute(1000, &ctx).await.unwrap();
        assert!(result.content.contains("--- Document: doc0.md ---"));
        assert!(result.content.contains("--- Document: doc1.md ---"));
        assert_eq!(result.metadata["truncated_files"], json!(0));
    }

    #[tokio::test]
    async fn each_file_gets_an_equal_share() {
        let module = DocumentContextModule::new(None);
        // One huge file, one small: the huge one is truncated, the small
        // one stays intact.
        let ctx = ctx_with_docs(&[100_000, 40]);
        let result = module.contribute(200, &ctx).await.unwrap();
        assert!(result.tokens_used <= 220, "close to budget");
        assert_eq!(result.metadata["truncated_files"], json!(1));
        assert!(result.content.contains(&"x".repeat(40)));
    }

    #[tokio::test]
    async fn condense_tightens_per_file_shares() {
        let module = DocumentContextModule::new(None);
        let ctx = ctx_with_docs(&[4000, 4000]);
        let full = module.contribute(1500, &ctx).await.unwrap();
        let condensed = module
            .condense(&full.content, 300, &ctx)
            .await
            .unwrap();
        assert!(condensed.tokens_used < full.tokens_used);
        assert_eq!(
            condensed.metadata["strategy"],
            json!("per_file_truncation")
        );
        assert_eq!(condensed.metadata["file_count"], json!(2));
    }

    #[tokio::test]
    async fn no_attachments_is_empty() {
        let module = DocumentContextModule::new(None);
        let ctx = AssemblyContext::new(ProfileType::ToolEnabled, "p", "s", "u");
        let result = module.contribute(1000, &ctx).await.unwrap();
        assert!(result.is_empty());
    }
}
