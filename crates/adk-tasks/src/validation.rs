//! Static script validation (§4.D step 3), shared by `TaskWorker` before its
//! first execution attempt and by `RepairLoop` before accepting a patched
//! script (§4.E step 6: "same static checks as §4.D step 3").
//!
//! The rendered scripting dialect (§3 `executionScriptTemplate`) is
//! WebAssembly Text/binary, so "reject scripts that reference a blocked
//! pattern" becomes a question `wasmtime` can answer directly: a script may
//! only import from the `"env"` module, and only the host functions
//! `adk-sandbox` actually defines (`host_log`, `host_set_result`,
//! `host_get_param`, `host_llm_generate`, `host_http_get`,
//! `host_storage_get`). There is no WASI import, no filesystem import, no
//! process/env host call anywhere in that list, so enumerating the module's
//! own import section is a stronger check than a textual scan for
//! "process"/"env" substrings would be, and it comes for free once the
//! module parses. Parse failure itself is `Module::new`'s job, used here
//! with a throwaway engine independent of whatever `Sandbox` implementation
//! eventually executes the script — this pass only asks "is this
//! well-formed and import-clean", never "does it run".

use adk_core::error::{AdkError, Result};
use wasmtime::{Config, Engine, Module};

/// Host functions `adk-sandbox::host::define_host_functions` actually
/// registers. A script importing anything else under `"env"` (or anything
/// at all under any other module name, e.g. `wasi_snapshot_preview1`) is
/// rejected before it ever reaches a sandbox.
const ALLOWED_IMPORTS: &[&str] = &[
    "host_log",
    "host_set_result",
    "host_get_param",
    "host_llm_generate",
    "host_http_get",
    "host_storage_get",
];

/// Stateless validator: a parse-only `wasmtime::Engine` plus the configured
/// size cap. Cheap enough to construct once and share across the worker
/// pool and the repair loop.
#[derive(Clone)]
pub struct StaticValidator {
    engine: Engine,
    max_script_bytes: usize,
}

impl StaticValidator {
    pub fn new(max_script_bytes: usize) -> Self {
        Self {
            engine: Engine::new(&Config::new()).expect("default wasmtime config is always valid"),
            max_script_bytes,
        }
    }

    /// Validate `script_source` against every §4.D step 3 check. Returns
    /// `Ok(())` when the script may proceed to execution; otherwise
    /// `AdkError::ScriptInvalid` carrying a human-readable reason, suitable
    /// for direct use as a `FailureRecord.detail`.
    pub fn validate(&self, script_source: &str) -> Result<()> {
        if script_source.len() > self.max_script_bytes {
            return Err(AdkError::ScriptInvalid(format!(
                "script source is {} bytes, exceeding the {} byte cap",
                script_source.len(),
                self.max_script_bytes
            )));
        }

        let module = Module::new(&self.engine, script_source)
            .map_err(|e| AdkError::ScriptInvalid(format!("failed to parse script: {e}")))?;

        for import in module.imports() {
            if import.module() != "env" {
                return Err(AdkError::ScriptInvalid(format!(
                    "script imports from disallowed module `{}` (only `env` is permitted)",
                    import.module()
                )));
            }
            let name = import.name();
            if !ALLOWED_IMPORTS.contains(&name) {
                return Err(AdkError::ScriptInvalid(format!(
                    "script imports disallowed host function `{name}`"
                )));
            }
        }

        if module.exports().all(|e| e.name() != "execute") {
            return Err(AdkError::ScriptInvalid(
                "script does not export an `execute` entry point".to_string(),
            ));
        }

        Ok(())
    }
}
