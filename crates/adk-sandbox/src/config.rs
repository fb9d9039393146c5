//! Construction-time configuration for `WasmSandbox`.
//!
//! Per-call resource limits (wall clock, heap) travel on `SandboxBudget`
//! (§6, set by the caller per `run`); `WasmSandboxConfig` only carries the
//! knobs that are fixed for the lifetime of the engine, grounded on
//! `sandbox::config::SandboxConfig`'s `allow_fs`/`allow_network` fields.

use std::time::Duration;

/// Fixed, construction-time sandbox knobs.
#[derive(Debug, Clone)]
pub struct WasmSandboxConfig {
    /// Whether the HTTP-get host helper is exposed to scripts at all. The
    /// SSRF policy (§4.G) is enforced unconditionally whenever this is
    /// `true`; it never disables the policy, only the helper's presence.
    ///
    /// Default: **true** — §4.D step 2 says the render step injects "a
    /// read-only handle to...an HTTP-get helper with the SSRF policy",
    /// i.e. the capability is normally available, policed at the network
    /// boundary rather than withheld outright.
    pub allow_network: bool,

    /// Host filesystem access is never exposed to scripts (§4.D step 2:
    /// "no filesystem access outside a task-private temp area", and no
    /// temp-area host function is specified) — this field exists only to
    /// mirror the teacher's shape and is always `false`.
    pub allow_fs: bool,

    /// How often the epoch ticker increments `wasmtime::Engine`'s epoch
    /// counter, which is what makes a `SandboxBudget.wall_clock_ms`
    /// deadline actually interrupt a running script. Finer granularity
    /// means tighter timeout accuracy at the cost of more ticker wakeups.
    ///
    /// Default: **50 ms**.
    pub epoch_tick: Duration,
}

impl Default for WasmSandboxConfig {
    fn default() -> Self {
        Self {
            allow_network: true,
            allow_fs: false,
            epoch_tick: Duration::from_millis(50),
        }
    }
}

impl WasmSandboxConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_allow_network(mut self, allow: bool) -> Self {
        self.allow_network = allow;
        self
    }

    pub fn with_epoch_tick(mut self, tick: Duration) -> Self {
        self.epoch_tick = tick;
        self
    }
}
