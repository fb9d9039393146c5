//! Stable error taxonomy (§7).
//!
//! One enum, shared across the workspace, so that every caller can match on
//! a `Kind` string regardless of which component raised it. Presentation to
//! the end user varies by caller; the kind itself never does.

/// Stable error kinds. The `Display` impl renders the exact token named in
/// §7's table so logs and events carry a grep-able name.
#[derive(Debug, thiserror::Error)]
pub enum AdkError {
    #[error("ERR_TOOL_UNKNOWN: tool '{0}' is not registered")]
    ToolUnknown(String),

    #[error("ERR_TOOL_FORBIDDEN: role '{role}' may not invoke tool '{tool}'")]
    ToolForbidden { tool: String, role: String },

    #[error("ERR_TOOL_BAD_ARGS: {reason}")]
    ToolBadArgs { reason: String },

    #[error("ERR_TOOL_TIMEOUT: tool '{tool}' exceeded {timeout_ms}ms")]
    ToolTimeout { tool: String, timeout_ms: u64 },

    #[error("ERR_EMBED_UNAVAILABLE: {0}")]
    EmbedUnavailable(String),

    #[error("ERR_QUEUE_FULL: task queue at capacity ({depth})")]
    QueueFull { depth: usize },

    #[error("ERR_SCRIPT_INVALID: {0}")]
    ScriptInvalid(String),

    #[error("ERR_SCRIPT_RUNTIME: {0}")]
    ScriptRuntime(String),

    #[error("ERR_SECURITY_VIOLATION: {0}")]
    SecurityViolation(String),

    #[error("ERR_SCRIPT_TIMEOUT: exceeded {limit_ms}ms")]
    ScriptTimeout { limit_ms: u64 },

    #[error("ERR_SCRIPT_HUNG: ignored cancellation for more than {grace_ms}ms")]
    ScriptHung { grace_ms: u64 },

    #[error("ERR_RESOURCE_LIMIT: {0}")]
    ResourceLimit(String),

    #[error("ERR_LLM_UNPARSEABLE_PLAN: {0}")]
    LlmUnparseablePlan(String),

    #[error("ERR_PLAN_LOOP_EXHAUSTED: exceeded cap of {cap} tool-acting turns")]
    PlanLoopExhausted { cap: u32 },

    #[error("ERR_UNREPAIRABLE: {0}")]
    Unrepairable(String),

    #[error("task '{0}' not found")]
    TaskNotFound(String),

    #[error("template '{0}' not found")]
    TemplateNotFound(String),

    #[error("storage error: {0}")]
    Store(String),

    #[error("llm provider error: {0}")]
    Llm(String),
}

impl AdkError {
    /// The stable token name, useful for structured logging/metrics
    /// independent of the human-readable message.
    pub fn kind(&self) -> &'static str {
        match self {
            AdkError::ToolUnknown(_) => "ERR_TOOL_UNKNOWN",
            AdkError::ToolForbidden { .. } => "ERR_TOOL_FORBIDDEN",
            AdkError::ToolBadArgs { .. } => "ERR_TOOL_BAD_ARGS",
            AdkError::ToolTimeout { .. } => "ERR_TOOL_TIMEOUT",
            AdkError::EmbedUnavailable(_) => "ERR_EMBED_UNAVAILABLE",
            AdkError::QueueFull { .. } => "ERR_QUEUE_FULL",
            AdkError::ScriptInvalid(_) => "ERR_SCRIPT_INVALID",
            AdkError::ScriptRuntime(_) => "ERR_SCRIPT_RUNTIME",
            AdkError::SecurityViolation(_) => "ERR_SECURITY_VIOLATION",
            AdkError::ScriptTimeout { .. } => "ERR_SCRIPT_TIMEOUT",
            AdkError::ScriptHung { .. } => "ERR_SCRIPT_HUNG",
            AdkError::ResourceLimit(_) => "ERR_RESOURCE_LIMIT",
            AdkError::LlmUnparseablePlan(_) => "ERR_LLM_UNPARSEABLE_PLAN",
            AdkError::PlanLoopExhausted { .. } => "ERR_PLAN_LOOP_EXHAUSTED",
            AdkError::Unrepairable(_) => "ERR_UNREPAIRABLE",
            AdkError::TaskNotFound(_) => "ERR_TASK_NOT_FOUND",
            AdkError::TemplateNotFound(_) => "ERR_TEMPLATE_NOT_FOUND",
            AdkError::Store(_) => "ERR_STORE",
            AdkError::Llm(_) => "ERR_LLM",
        }
    }
}

pub type Result<T> = std::result::Result<T, AdkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_matches_spec_token() {
        let err = AdkError::ToolForbidden {
            tool: "KnowledgeManagement".into(),
            role: "user".into(),
        };
        assert_eq!(err.kind(), "ERR_TOOL_FORBIDDEN");
        assert!(err.to_string().contains("ERR_TOOL_FORBIDDEN"));
    }

    #[test]
    fn queue_full_carries_depth() {
        let err = AdkError::QueueFull { depth: 1024 };
        assert!(err.to_string().contains("1024"));
    }
}
