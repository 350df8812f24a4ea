//! Token estimation utilities for context budget management.
//!
//! Uses a provider-aware character ratio: ~4 characters per token for most
//! providers, 3.8 for Anthropic and Bedrock. This approximation is accurate
//! within ~10-20% for BPE tokenizers on English text, which is sufficient
//! for pre-allocation budgeting — authoritative counts come from provider
//! responses and overwrite the estimates after the call.

use crate::message::{ChatMessage, MessageContent};

/// Tokens charged per message for role names, delimiters, and formatting
/// markers in the API wire format.
pub const MESSAGE_OVERHEAD_TOKENS: usize = 4;

/// Average characters per token when the provider is unknown.
pub const DEFAULT_CHARS_PER_TOKEN: f64 = 4.0;

fn chars_per_token(provider: Option<&str>) -> f64 {
    match provider.map(str::to_ascii_lowercase).as_deref() {
        Some("anthropic") | Some("amazon") | Some("bedrock") => 3.8,
        _ => DEFAULT_CHARS_PER_TOKEN,
    }
}

/// Estimate the token count for a string. Non-empty text is always at
/// least one token.
pub fn estimate_tokens(text: &str, provider: Option<&str>) -> usize {
    if text.is_empty() {
        return 0;
    }
    let estimate = (text.len() as f64 / chars_per_token(provider)) as usize;
    estimate.max(1)
}

/// Convert a token budget to an approximate character budget.
///
/// Useful for modules that need to truncate text to fit a token budget.
/// Always uses the ratio heuristic (inverse tokenization is not meaningful).
pub fn tokens_to_chars(tokens: usize, provider: Option<&str>) -> usize {
    (tokens as f64 * chars_per_token(provider)) as usize
}

/// Estimate tokens for a single message including per-message overhead.
pub fn estimate_message_tokens(message: &ChatMessage, provider: Option<&str>) -> usize {
    let content_tokens = match &message.content {
        MessageContent::Text(t) => estimate_tokens(t, provider),
        MessageContent::Parts(parts) => parts
            .iter()
            .filter_map(|p| p.text.as_deref())
            .map(|t| estimate_tokens(t, provider))
            .sum(),
    };
    MESSAGE_OVERHEAD_TOKENS + content_tokens
}

/// Estimate total tokens for a list of chat messages.
pub fn estimate_tokens_for_messages(messages: &[ChatMessage], provider: Option<&str>) -> usize {
    messages
        .iter()
        .map(|m| estimate_message_tokens(m, provider))
        .sum()
}

/// Clip text to fit a token budget, respecting UTF-8 char boundaries.
///
/// Returns the input unchanged when it already fits.
pub fn clip_to_budget<'a>(text: &'a str, budget_tokens: usize, provider: Option<&str>) -> &'a str {
    let char_limit = tokens_to_chars(budget_tokens, provider);
    if text.len() <= char_limit {
        return text;
    }
    let mut end = char_limit;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
