//! `Dispatcher::invoke` (§4.B) — the single entry point through which a
//! tool call actually runs: role gate, schema validation, a single-attempt
//! timeout, and an emitted `ToolInvocationEvent`.
//!
//! Grounded on `agent::runtime::execute_tool_calls`'s per-call structure
//! (policy check, `on_tool_start`, find adapter, execute, collect result),
//! corrected from its concurrent `tokio::spawn` fan-out to strictly
//! sequential execution (§5 "Within one conversationId, tool calls in a
//! single plan are executed strictly in planner-returned order") and from
//! its absence of a retry loop — the Dispatcher itself never retries
//! (§4.B "Failure semantics": transient failures are the tool's own
//! responsibility).

use std::sync::Arc;
use std::time::{Duration, Instant};

use adk_core::error::{AdkError, Result};
use adk_core::events::{AdkEvent, ToolOutcome};
use adk_core::interfaces::EventSink;
use adk_core::model::Role;
use serde_json::Value;
use tracing::{info, warn};

use crate::registry::ToolRegistry;

/// Bound the Dispatcher's view of the outside world to exactly what §5
/// requires ("every entry point takes a context with a deadline and a
/// cancellation signal"), without pulling in a full context/tracing
/// framework the spec doesn't ask for.
#[derive(Debug, Clone, Default)]
pub struct InvokeContext {
    pub cancelled: Option<Arc<std::sync::atomic::AtomicBool>>,
}

impl InvokeContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancelled
            .as_ref()
            .map(|c| c.load(std::sync::atomic::Ordering::Relaxed))
            .unwrap_or(false)
    }
}

pub struct Dispatcher {
    registry: ToolRegistry,
    events: Arc<dyn EventSink>,
}

impl Dispatcher {
    pub fn new(registry: ToolRegistry, events: Arc<dyn EventSink>) -> Self {
        Self { registry, events }
    }

    /// `Invoke(ctx, userId, role, toolName, args)` (§4.B).
    pub async fn invoke(
        &self,
        ctx: &InvokeContext,
        user_id: &str,
        role: Role,
        tool_name: &str,
        args: Value,
    ) -> Result<Value> {
        if ctx.is_cancelled() {
            return Err(AdkError::ToolTimeout {
                tool: tool_name.to_string(),
                timeout_ms: 0,
            });
        }

        let tool = match self.registry.get(tool_name) {
            Some(t) => t,
            None => return Err(AdkError::ToolUnknown(tool_name.to_string())),
        };

        if !self.registry.is_enabled(tool_name) || !tool.allowed_roles().contains(&role) {
            self.emit(tool_name, user_id, role, 0, ToolOutcome::Forbidden);
            return Err(AdkError::ToolForbidden {
                tool: tool_name.to_string(),
                role: role_label(role).to_string(),
            });
        }

        if let Err(reason) = validate_schema(&tool.parameter_schema(), &args) {
            self.emit(tool_name, user_id, role, 0, ToolOutcome::Error);
            return Err(AdkError::ToolBadArgs { reason });
        }
        if let Err(reason) = tool.validate(&args) {
            self.emit(tool_name, user_id, role, 0, ToolOutcome::Error);
            return Err(AdkError::ToolBadArgs { reason });
        }

        let timeout_ms = tool.timeout_ms();
        let start = Instant::now();
        let result = tokio::time::timeout(Duration::from_millis(timeout_ms), tool.execute(args)).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(Ok(value)) => {
                self.emit(tool_name, user_id, role, duration_ms, ToolOutcome::Success);
                Ok(value)
            }
            Ok(Err(e)) => {
                warn!(tool = tool_name, error = %e, "tool execution failed");
                self.emit(tool_name, user_id, role, duration_ms, ToolOutcome::Error);
                Err(e)
            }
            Err(_) => {
                warn!(tool = tool_name, timeout_ms, "tool execution timed out");
                self.emit(tool_name, user_id, role, duration_ms, ToolOutcome::Timeout);
                Err(AdkError::ToolTimeout {
                    tool: tool_name.to_string(),
                    timeout_ms,
                })
            }
        }
    }

    /// Run a planner-ordered sequence of calls strictly sequentially
    /// (§4.B "Ordering" / §5), concatenating outputs in order. A call's
    /// own failure does not abort the remaining calls — the Dispatcher
    /// surfaces each outcome and lets the caller (`AgentRuntime`) decide
    /// how to annotate the follow-up plan turn.
    pub async fn invoke_sequence(
        &self,
        ctx: &InvokeContext,
        user_id: &str,
        role: Role,
        calls: Vec<(String, Value)>,
    ) -> Vec<(String, Result<Value>)> {
        let mut results = Vec::with_capacity(calls.len());
        for (tool_name, args) in calls {
            let outcome = self.invoke(ctx, user_id, role, &tool_name, args).await;
            results.push((tool_name, outcome));
        }
        results
    }

    fn emit(&self, tool_name: &str, user_id: &str, role: Role, duration_ms: u64, outcome: ToolOutcome) {
        info!(tool = tool_name, user_id, duration_ms, outcome = ?outcome, "tool invocation");
        self.events.emit(AdkEvent::ToolInvocation {
            tool_name: tool_name.to_string(),
            user_id: user_id.to_string(),
            role: role_label(role).to_string(),
            duration_ms,
            outcome,
        });
    }
}

fn role_label(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Admin => "admin",
    }
}

/// Minimal JSON-Schema-subset validator: checks `type: object`'s
/// `required` array is present and that declared `properties` types
/// (string/number/integer/boolean/object/array) match, when a schema
/// specifies them. Unrecognized schema keywords are ignored rather than
/// rejected, matching the lenient posture the teacher's planner response
/// parsing takes toward payload shape.
fn validate_schema(schema: &Value, args: &Value) -> std::result::Result<(), String> {
    let Some(schema_obj) = schema.as_object() else {
        return Ok(());
    };

    if let Some(required) = schema_obj.get("required").and_then(|v| v.as_array()) {
        let args_obj = args.as_object();
        for req in required {
            let Some(name) = req.as_str() else { continue };
            let present = args_obj.map(|o| o.contains_key(name)).unwrap_or(false);
            if !present {
                return Err(format!("missing required field `{name}`"));
            }
        }
    }

    if let Some(properties) = schema_obj.get("properties").and_then(|v| v.as_object()) {
        if let Some(args_obj) = args.as_object() {
            for (name, prop_schema) in properties {
                let Some(value) = args_obj.get(name) else {
                    continue;
                };
                if let Some(expected_type) = prop_schema.get("type").and_then(|v| v.as_str()) {
                    if !json_type_matches(expected_type, value) {
                        return Err(format!(
                            "field `{name}` expected type `{expected_type}`, got `{}`",
                            json_type_name(value)
                        ));
                    }
                }
            }
        }
    }

    Ok(())
}

fn json_type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adk_core::events::EventBus;
    use async_trait::async_trait;
    use serde_json::json;

    struct SlowTool;

    #[async_trait]
    impl crate::Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }
        fn description(&self) -> &str {
            "sleeps past its timeout"
        }
        fn parameter_schema(&self) -> Value {
            json!({"type": "object", "required": ["n"], "properties": {"n": {"type": "integer"}}})
        }
        fn allowed_roles(&self) -> &[Role] {
            static ROLES: [Role; 1] = [Role::User];
            &ROLES
        }
        fn timeout_ms(&self) -> u64 {
            10
        }
        async fn execute(&self, _args: Value) -> Result<Value> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(json!({}))
        }
    }

    struct AdminOnlyEcho;

    #[async_trait]
    impl crate::Tool for AdminOnlyEcho {
        fn name(&self) -> &str {
            "admin_echo"
        }
        fn description(&self) -> &str {
            "admin only echo"
        }
        fn parameter_schema(&self) -> Value {
            json!({"type": "object"})
        }
        fn allowed_roles(&self) -> &[Role] {
            static ROLES: [Role; 1] = [Role::Admin];
            &ROLES
        }
        async fn execute(&self, args: Value) -> Result<Value> {
            Ok(args)
        }
    }

    fn dispatcher_with(tools: Vec<Arc<dyn crate::Tool>>) -> Dispatcher {
        let registry = ToolRegistry::new();
        for t in tools {
            registry.register(t);
        }
        Dispatcher::new(registry, Arc::new(EventBus::new(16)))
    }

    #[tokio::test]
    async fn unknown_tool_fails_with_err_tool_unknown() {
        let d = dispatcher_with(vec![]);
        let err = d
            .invoke(&InvokeContext::default(), "u1", Role::User, "nope", json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "ERR_TOOL_UNKNOWN");
    }

    #[tokio::test]
    async fn forbidden_role_fails_with_err_tool_forbidden() {
        let d = dispatcher_with(vec![Arc::new(AdminOnlyEcho)]);
        let err = d
            .invoke(&InvokeContext::default(), "u1", Role::User, "admin_echo", json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "ERR_TOOL_FORBIDDEN");
    }

    #[tokio::test]
    async fn missing_required_arg_fails_with_err_tool_bad_args() {
        let d = dispatcher_with(vec![Arc::new(SlowTool)]);
        let err = d
            .invoke(&InvokeContext::default(), "u1", Role::User, "slow", json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "ERR_TOOL_BAD_ARGS");
    }

    #[tokio::test]
    async fn exceeding_timeout_fails_with_err_tool_timeout() {
        let d = dispatcher_with(vec![Arc::new(SlowTool)]);
        let err = d
            .invoke(&InvokeContext::default(), "u1", Role::User, "slow", json!({"n": 1}))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "ERR_TOOL_TIMEOUT");
    }

    #[tokio::test]
    async fn sequence_runs_in_order_and_collects_each_outcome() {
        let d = dispatcher_with(vec![Arc::new(AdminOnlyEcho)]);
        let results = d
            .invoke_sequence(
                &InvokeContext::default(),
                "u1",
                Role::Admin,
                vec![
                    ("admin_echo".to_string(), json!({"x": 1})),
                    ("missing".to_string(), json!({})),
                ],
            )
            .await;
        assert_eq!(results.len(), 2);
        assert!(results[0].1.is_ok());
        assert!(results[1].1.is_err());
    }
}
