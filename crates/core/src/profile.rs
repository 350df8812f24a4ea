//! Profile classes — the coarse capability tiers a session runs under.
//!
//! Modules declare which profile types they apply to; the orchestrator
//! skips inapplicable modules during Pass 1 and redistributes their budget.

use serde::{Deserialize, Serialize};

/// The profile class of the active session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileType {
    /// Full agentic profile with tool execution.
    ToolEnabled,
    /// Conversation-only profile, no tools.
    LlmOnly,
    /// Retrieval-centric profile built around RAG collections.
    RagFocused,
    /// Coordinator profile that delegates to child sessions.
    Genie,
}

impl ProfileType {
    pub const ALL: [ProfileType; 4] = [
        ProfileType::ToolEnabled,
        ProfileType::LlmOnly,
        ProfileType::RagFocused,
        ProfileType::Genie,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProfileType::ToolEnabled => "tool_enabled",
            ProfileType::LlmOnly => "llm_only",
            ProfileType::RagFocused => "rag_focused",
            ProfileType::Genie => "genie",
        }
    }
}

impl std::fmt::Display for ProfileType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProfileType {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tool_enabled" => Ok(ProfileType::ToolEnabled),
            "llm_only" => Ok(ProfileType::LlmOnly),
            "rag_focused" => Ok(ProfileType::RagFocused),
            "genie" => Ok(ProfileType::Genie),
            other => Err(crate::error::Error::Config {
                message: format!("Unknown profile type: {other}"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_str() {
        for pt in ProfileType::ALL {
            let parsed: ProfileType = pt.as_str().parse().unwrap();
            assert_eq!(parsed, pt);
        }
    }

    #[test]
    fn unknown_profile_type_is_config_error() {
        let err = "turbo".parse::<ProfileType>().unwrap_err();
        assert!(err.to_string().contains("turbo"));
    }

    #[test]
    fn serde_uses_snake_case() {
        let json = serde_json::to_string(&ProfileType::ToolEnabled).unwrap();
        assert_eq!(json, "\"tool_enabled\"");
    }
}
