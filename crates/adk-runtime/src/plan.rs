//! The planner's tagged-variant return value (§4.A step 4, §9 design note
//! "Dynamic plan shapes").
//!
//! Grounded on `agent::planner::Planner::parse_plan`'s lenient-extract-
//! then-strict-validate shape: the LLM is asked for one JSON object with a
//! `type` discriminant, tolerating markdown code fences the instructions
//! told it not to use, but rejecting anything that doesn't resolve to one
//! of the four known shapes rather than coercing it into one.

use serde_json::Value;

use adk_core::error::{AdkError, Result};

/// One tool call as returned by the planner, prior to Dispatcher execution.
#[derive(Debug, Clone)]
pub struct PlannedToolCall {
    pub tool_name: String,
    pub arguments: Value,
}

/// The LLM's per-turn decision record (§4.A step 4).
#[derive(Debug, Clone)]
pub enum Plan {
    Answer {
        text: String,
    },
    ToolCalls {
        calls: Vec<PlannedToolCall>,
    },
    ComplexTask {
        template_id: String,
        parameters: Value,
    },
    ComplexTaskAdhoc {
        natural_language_spec: String,
    },
}

/// Parse the LLM's raw text response into a [`Plan`]. Rejects unknown
/// `type` discriminants and malformed JSON rather than guessing a shape.
pub fn parse_plan(text: &str) -> Result<Plan> {
    let json_str = extract_json_block(text);
    let v: Value = serde_json::from_str(json_str)
        .map_err(|e| AdkError::LlmUnparseablePlan(format!("invalid JSON: {e}\nraw: {text}")))?;

    let plan_type = v
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or_else(|| AdkError::LlmUnparseablePlan("missing `type` discriminant".to_string()))?;

    match plan_type {
        "answer" => {
            let text = v
                .get("text")
                .and_then(|t| t.as_str())
                .ok_or_else(|| AdkError::LlmUnparseablePlan("`answer` missing `text`".to_string()))?
                .to_string();
            Ok(Plan::Answer { text })
        }
        "tool_calls" => {
            let calls_value = v
                .get("calls")
                .and_then(|c| c.as_array())
                .ok_or_else(|| AdkError::LlmUnparseablePlan("`tool_calls` missing `calls` array".to_string()))?;
            if calls_value.is_empty() {
                return Err(AdkError::LlmUnparseablePlan("`tool_calls` has zero calls".to_string()));
            }
            let calls = calls_value
                .iter()
                .map(|c| {
                    let tool_name = c
                        .get("tool_name")
                        .or_else(|| c.get("name"))
                        .and_then(|n| n.as_str())
                        .ok_or_else(|| AdkError::LlmUnparseablePlan("tool call missing `tool_name`".to_string()))?
                        .to_string();
                    let arguments = c
                        .get("arguments")
                        .or_else(|| c.get("args"))
                        .cloned()
                        .unwrap_or_else(|| Value::Object(Default::default()));
                    Ok(PlannedToolCall { tool_name, arguments })
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(Plan::ToolCalls { calls })
        }
        "complex_task" => {
            let template_id = v
                .get("templateId")
                .or_else(|| v.get("template_id"))
                .and_then(|t| t.as_str())
                .ok_or_else(|| AdkError::LlmUnparseablePlan("`complex_task` missing `templateId`".to_string()))?
                .to_string();
            let parameters = v.get("parameters").cloned().unwrap_or_else(|| Value::Object(Default::default()));
            Ok(Plan::ComplexTask { template_id, parameters })
        }
        "complex_task_adhoc" => {
            let spec = v
                .get("naturalLanguageSpec")
                .or_else(|| v.get("natural_language_spec"))
                .and_then(|s| s.as_str())
                .ok_or_else(|| {
                    AdkError::LlmUnparseablePlan("`complex_task_adhoc` missing `naturalLanguageSpec`".to_string())
                })?
                .to_string();
            Ok(Plan::ComplexTaskAdhoc { natural_language_spec: spec })
        }
        other => Err(AdkError::LlmUnparseablePlan(format!("unknown plan type `{other}`"))),
    }
}

/// Try to extract a JSON block from text that might be wrapped in markdown
/// code fences, despite the planning instructions asking for bare JSON.
fn extract_json_block(text: &str) -> &str {
    let trimmed = text.trim();

    if let Some(start) = trimmed.find("```json") {
        let json_start = start + 7;
        if let Some(end) = trimmed[json_start..].find("```") {
            return trimmed[json_start..json_start + end].trim();
        }
    }
    if let Some(start) = trimmed.find("```") {
        let json_start = start + 3;
        if let Some(end) = trimmed[json_start..].find("```") {
            return trimmed[json_start..json_start + end].trim();
        }
    }
    trimmed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_answer() {
        let plan = parse_plan(r#"{"type": "answer", "text": "Refunds are accepted within 30 days."}"#).unwrap();
        match plan {
            Plan::Answer { text } => assert!(text.contains("30 days")),
            _ => panic!("expected answer"),
        }
    }

    #[test]
    fn parses_tool_calls_from_fenced_json() {
        let text = "```json\n{\"type\": \"tool_calls\", \"calls\": [{\"tool_name\": \"send_email\", \"arguments\": {\"to\": \"a@b.com\"}}]}\n```";
        let plan = parse_plan(text).unwrap();
        match plan {
            Plan::ToolCalls { calls } => {
                assert_eq!(calls.len(), 1);
                assert_eq!(calls[0].tool_name, "send_email");
            }
            _ => panic!("expected tool_calls"),
        }
    }

    #[test]
    fn rejects_empty_tool_calls() {
        let err = parse_plan(r#"{"type": "tool_calls", "calls": []}"#).unwrap_err();
        assert_eq!(err.kind(), "ERR_LLM_UNPARSEABLE_PLAN");
    }

    #[test]
    fn parses_complex_task() {
        let plan = parse_plan(r#"{"type": "complex_task", "templateId": "csv_export", "parameters": {"days": 60}}"#).unwrap();
        match plan {
            Plan::ComplexTask { template_id, parameters } => {
                assert_eq!(template_id, "csv_export");
                assert_eq!(parameters["days"], 60);
            }
            _ => panic!("expected complex_task"),
        }
    }

    #[test]
    fn parses_complex_task_adhoc() {
        let plan = parse_plan(r#"{"type": "complex_task_adhoc", "naturalLanguageSpec": "export invoices"}"#).unwrap();
        match plan {
            Plan::ComplexTaskAdhoc { natural_language_spec } => {
                assert_eq!(natural_language_spec, "export invoices");
            }
            _ => panic!("expected complex_task_adhoc"),
        }
    }

    #[test]
    fn rejects_unknown_type() {
        let err = parse_plan(r#"{"type": "mystery"}"#).unwrap_err();
        assert_eq!(err.kind(), "ERR_LLM_UNPARSEABLE_PLAN");
    }

    #[test]
    fn rejects_malformed_json() {
        let err = parse_plan("not json at all").unwrap_err();
        assert_eq!(err.kind(), "ERR_LLM_UNPARSEABLE_PLAN");
    }
}
