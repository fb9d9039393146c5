//! Per-message agent orchestration (§4.A `AgentRuntime`): sanitize,
//! retrieve, plan, act, persist. Every actual decision is delegated to the
//! LLM or to one of the sibling crates (`adk-semantic`, `adk-tools`,
//! `adk-tasks`); this crate only sequences the steps §4.A specifies.

pub mod conversation;
pub mod plan;
pub mod runtime;

pub use conversation::ConversationStore;
pub use plan::{Plan, PlannedToolCall};
pub use runtime::{AgentRuntime, HandleRequest, HandleResponse, RequestContext};
