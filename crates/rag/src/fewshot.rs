//! Retrieved cases and their few-shot prompt rendering.

use serde_json::json;

use crate::case::{CaseStudy, StrategyType};

/// A retrieval hit, enriched for prompt building.
#[derive(Debug, Clone)]
pub struct RetrievedCase {
    pub case_id: String,
    pub collection_id: i64,
    pub user_query: String,
    pub strategy_type: StrategyType,

    /// The indexed document (the case's user query, or the chunk text for
    /// knowledge repositories).
    pub content: String,

    /// Parsed full case document; absent for knowledge chunks.
    pub case: Option<CaseStudy>,

    /// Raw semantic similarity (1 − distance).
    pub similarity: f64,

    /// Similarity minus the cleanliness penalty.
    pub adjusted_score: f64,

    pub is_most_efficient: bool,
    pub had_plan_improvements: bool,
    pub had_tactical_improvements: bool,

    pub collection_name: Option<String>,
    pub mcp_server_id: Option<String>,

    /// Source document id and chunk index, for knowledge hits.
    pub document_id: Option<String>,
    pub chunk_index: Option<u32>,
}

/// Render a retrieved case as a few-shot example block for the prompt.
pub fn format_few_shot_example(case: &RetrievedCase) -> String {
    let case_id = &case.case_id;
    let (thought, plan_content) = match case.strategy_type {
        StrategyType::Successful => {
            let plan_json = case
                .case
                .as_ref()
                .and_then(|c| c.successful_strategy.as_ref())
                .map(|s| serde_json::to_string_pretty(&s.phases).unwrap_or_else(|_| "[]".into()))
                .unwrap_or_else(|| "[]".into());
            (
                format!("Case `{case_id}` shows a proven strategy pattern for this query type."),
                format!("- **Correct Plan**:\n```json\n{plan_json}\n```"),
            )
        }
        StrategyType::Failed => {
            let failed = case.case.as_ref().and_then(|c| c.failed_strategy.as_ref());
            let error_summary = failed
                .map(|f| f.error_summary.clone())
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "an unspecified error.".into());
            let failed_action = failed
                .map(|f| serde_json::to_string_pretty(&f.failed_action).unwrap_or_default())
                .unwrap_or_else(|| json!({}).to_string());
            (
                format!(
                    "Case `{case_id}` shows a past failure with error: {error_summary} \
                     This helps in avoiding similar pitfalls."
                ),
                format!("- **Failed Action**: {failed_action}"),
            )
        }
        StrategyType::Conversational => (
            format!("Case `{case_id}` records a conversational interaction."),
            "- **Conversational Response**".to_string(),
        ),
        StrategyType::Knowledge => (
            format!("Knowledge chunk `{case_id}` is relevant to this query."),
            format!("- **Reference Content**: {}", case.content),
        ),
    };

    format!(
        "### Retrieved Example (Case ID: {case_id})\n\
         - **User Goal**: \"{goal}\"\n\
         - **Thought Process**:\n\
         \x20 1. The user's request is similar to a past interaction.\n\
         \x20 2. {thought}\n\
         {plan_content}",
        goal = case.user_query,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::case::{extract_case, tests as case_tests};

    fn retrieved(case: CaseStudy) -> RetrievedCase {
        RetrievedCase {
            case_id: case.case_id.clone(),
            collection_id: case.metadata.collection_id,
            user_query: case.intent.user_query.clone(),
            strategy_type: case.strategy_type(),
            content: case.intent.user_query.clone(),
            case: Some(case),
            similarity: 0.9,
            adjusted_score: 0.9,
            is_most_efficient: true,
            had_plan_improvements: false,
            had_tactical_improvements: false,
            collection_name: Some("Default".into()),
            mcp_server_id: Some("server-1".into()),
            document_id: None,
            chunk_index: None,
        }
    }

    #[test]
    fn successful_case_renders_plan_json() {
        let case = extract_case(&case_tests::turn(&[1, 2]), 7).unwrap();
        let rendered = format_few_shot_example(&retrieved(case));
        assert!(rendered.contains("Correct Plan"));
        assert!(rendered.contains("```json"));
        assert!(rendered.contains("top 10 customers by revenue"));
    }

    #[test]
    fn failed_case_renders_error_summary() {
        let mut turn = case_tests::turn(&[1]);
        turn.execution_trace[0].result = Some(crate::case::TraceResult {
            status: Some("error".into()),
        });
        let case = extract_case(&turn, 7).unwrap();
        let rendered = format_few_shot_example(&retrieved(case));
        assert!(rendered.contains("Failed Action"));
        assert!(rendered.contains("past failure"));
    }
}
