//! The `Tool` trait (§3 `ToolDescriptor`, §4.B): a simpler, stateless unit
//! than the teacher's `Adapter` (no connect/disconnect lifecycle — a tool
//! is just a name, a schema, a role gate, and a synchronous-per-call
//! `execute`).

use adk_core::error::Result;
use adk_core::model::Role;
use async_trait::async_trait;
use serde_json::Value;

/// One invokable capability. Implementors are expected to be cheap to
/// construct and `Send + Sync`, since the registry holds them behind an
/// `Arc` shared across concurrent dispatch calls.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Globally unique name, matching `ToolDescriptor.name`.
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON-shaped schema describing accepted arguments. Used both to
    /// advertise the tool to the planner and to validate calls in
    /// `Dispatcher::invoke`.
    fn parameter_schema(&self) -> Value;

    /// Roles permitted to invoke this tool. Fail-secure: a tool absent
    /// from an explicit ACL defaults to admin-only (§4.B), so an empty
    /// slice here means "admin only" rather than "nobody".
    fn allowed_roles(&self) -> &[Role];

    fn timeout_ms(&self) -> u64 {
        30_000
    }

    /// Structural validation of `args` against `parameter_schema`, beyond
    /// what the Dispatcher's generic schema check already does. The
    /// default accepts anything; tools with stricter requirements than a
    /// JSON-schema type check can express them here.
    fn validate(&self, _args: &Value) -> std::result::Result<(), String> {
        Ok(())
    }

    /// Run the tool body. Transient failures are the tool's own
    /// responsibility to retry internally — the Dispatcher calls this
    /// exactly once per invocation (§4.B "Failure semantics").
    async fn execute(&self, args: Value) -> Result<Value>;
}

/// `T.is_visible_to(role)` equivalent for `Tool` (§4.B selection gate),
/// mirroring `adk_core::model::ToolDescriptor::is_visible_to`.
pub fn is_visible_to(tool: &dyn Tool, role: Role, enabled: bool) -> bool {
    enabled && tool.allowed_roles().contains(&role)
}
