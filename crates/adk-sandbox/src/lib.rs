//! `wasmtime`-backed `Sandbox` (§6, §4.D) implementation, grounded on
//! `sandbox::runtime::SandboxRuntime`/`sandbox::config::SandboxConfig`/
//! `sandbox::error::SandboxError`, adapted from "named pre-loaded plugin"
//! execution to "ad-hoc per-task script source" execution.

pub mod config;
pub mod host;
pub mod runtime;

pub use config::WasmSandboxConfig;
pub use runtime::WasmSandbox;
