//! Conversation history module — a sliding window over the chat.
//!
//! Newest messages first when trimming: the window always keeps the most
//! recent turns and drops from the oldest end.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokenweave_core::error::ModuleError;
use tokenweave_core::message::ChatMessage;
use tokenweave_core::module::{AssemblyContext, ContextModule, Contribution, PurgeOutcome};
use tokenweave_core::profile::ProfileType;
use tokenweave_core::session::SessionStore;
use tokenweave_core::token::{estimate_message_tokens, estimate_tokens};
use tracing::debug;

pub struct ConversationHistoryModule {
    store: Option<Arc<dyn SessionStore>>,
}

const HEADER: &str = "--- Conversation So Far ---\n";

impl ConversationHistoryModule {
    pub fn new(store: Option<Arc<dyn SessionStore>>) -> Self {
        Self { store }
    }

    fn messages(ctx: &AssemblyContext) -> Vec<ChatMessage> {
        ctx.session_data
            .get("chat_history")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    /// Render the newest messages that fit, preserving chronological
    /// order in the output.
    fn render_window(
        messages: &[ChatMessage],
        budget: usize,
        provider: Option<&str>,
    ) -> (String, usize, usize) {
        let header_tokens = estimate_tokens(HEADER, provider);
        if header_tokens >= budget {
            return (String::new(), 0, messages.len());
        }

        let mut used = header_tokens;
        let mut included: Vec<&ChatMessage> = Vec::new();
        let mut dropped = 0usize;
        for msg in messages.iter().rev() {
            let msg_tokens = estimate_message_tokens(msg, provider);
            if used + msg_tokens <= budget {
                included.push(msg);
                used += msg_tokens;
            } else {
                dropped += 1;
            }
        }
        if included.is_empty() {
            return (String::new(), 0, messages.len());
        }
        included.reverse();

        let mut out = String::from(HEADER);
        for msg in &included {
            let role = match msg.role.as_str() {
                "user" => "User",
                "assistant" => "Assistant",
                other => other,
            };
            out.push_str(&format!("{role}: {}\n", msg.text()));
        }
        (out, included.len(), dropped)
    }
}

#[async_trait]
impl ContextModule for ConversationHistoryModule {
    fn module_id(&self) -> &str {
        "conversation_history"
    }

    fn applies_to(&self, _profile_type: ProfileType) -> bool {
        true
    }

    async fn contribute(
        &self,
        budget: usize,
        ctx: &AssemblyContext,
    ) -> Result<Contribution, ModuleError> {
        let messages = Self::messages(ctx);
        if messages.is_empty() {
            return Ok(Contribution::empty().with_meta("message_count", 0));
        }

        let (content, included, dropped) = Self::render_window(&messages, budget, ctx.provider());
        if content.is_empty() {
            return Ok(Contribution::empty()
                .with_meta("message_count", 0)
                .with_meta("dropped", messages.len()));
        }
        let tokens = estimate_tokens(&content, ctx.provider());
        Ok(Contribution::new(content, tokens)
            .with_meta("message_count", included)
            .with_meta("dropped", dropped))
    }

    async fn condense(
        &self,
        _content: &str,
        target_tokens: usize,
        ctx: &AssemblyContext,
    ) -> Result<Contribution, ModuleError> {
        let messages = Self::messages(ctx);
        let (content, included, dropped) =
            Self::render_window(&messages, target_tokens, ctx.provider());
        let tokens = estimate_tokens(&content, ctx.provider());
        debug!(included, dropped, tokens, "Conversation history condensed");
        Ok(Contribution::new(content, tokens)
            .with_meta("strategy", "sliding_window")
            .with_meta("message_count", included)
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
            .map(|obj| obj.remove("chat_history").is_some())
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
            "chat history {}",
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
