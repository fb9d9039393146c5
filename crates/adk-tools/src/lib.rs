//! Tool registry and dispatcher (§4.B): a name-addressable catalog of
//! `Tool` implementations plus the single entry point (`Dispatcher::invoke`)
//! that enforces role-gating, argument validation, and timeouts around a
//! call.

pub mod dispatcher;
pub mod registry;
pub mod tool;
pub mod tools;

pub use dispatcher::Dispatcher;
pub use registry::ToolRegistry;
pub use tool::Tool;
