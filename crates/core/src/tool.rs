//! Tool and prompt definitions surfaced to context modules.
//!
//! The MCP tool registry for a session's active server is an external
//! collaborator; modules see it only through the `ToolSource` trait on the
//! assembly context's dependencies.

use serde::{Deserialize, Serialize};

/// A tool definition as presented to the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// The tool name
    pub name: String,

    /// Description of what the tool does
    pub description: String,

    /// JSON Schema describing the tool's parameters
    pub parameters: serde_json::Value,
}

/// A reusable prompt exposed by the active server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptDefinition {
    pub name: String,
    pub description: String,
}

/// Read access to the session's available tools and prompts.
///
/// Implementations cache the active server's listings; these calls are hot
/// (once per assembly) and must not perform network I/O.
pub trait ToolSource: Send + Sync {
    fn tool_definitions(&self) -> Vec<ToolDefinition>;

    fn prompt_definitions(&self) -> Vec<PromptDefinition> {
        Vec::new()
    }
}
