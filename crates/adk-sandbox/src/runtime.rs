//! `WasmSandbox` — the `Sandbox` trait (§6) implementation, grounded
//! directly on `sandbox::runtime::SandboxRuntime` but adapted from "named
//! pre-loaded plugin, `toolName` selects behavior within it" execution to
//! "ad-hoc per-task script source" execution: every `run` call compiles
//! and instantiates its own module rather than looking one up by name.
//!
//! The scripting dialect §3 `TaskTemplate.executionScriptTemplate`
//! describes is WebAssembly Text (WAT) — `wasmtime::Module::new` accepts
//! WAT or binary Wasm interchangeably, which keeps §9's "must not be a
//! naive eval" requirement satisfied (every run goes through the
//! compiler's own parser and validator, not a string interpreter) while
//! giving a rendered script a textual, diffable shape an LLM can emit and
//! patch in the RepairLoop.
//!
//! Timeout enforcement combines two wasmtime mechanisms the teacher's
//! plugin runtime didn't need at this time scale: fuel metering (bounds
//! CPU independent of wall clock, as in the teacher) plus epoch
//! interruption (bounds actual wall-clock time, needed here because
//! `SandboxBudget.wall_clock_ms` defaults to ten minutes rather than the
//! teacher's five seconds — a script that is CPU-idle waiting on a host
//! call could otherwise run fuel-free forever).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use adk_core::error::Result as AdkResult;
use adk_core::interfaces::{KeyValueStore, LLMProvider, Sandbox, SandboxBudget, SandboxOutcome};
use adk_core::model::FailureCategory;
use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;
use wasmtime::{Config, Engine, Linker, Module, Store};

use crate::config::WasmSandboxConfig;
use crate::host::{define_host_functions, HostState};

/// One-ms-of-wall-clock-to-fuel ratio has no fixed meaning across scripts,
/// so fuel is set generously (CPU-bound abuse is still caught, just not at
/// a precise budget) and the wall-clock budget is carried entirely by the
/// epoch deadline instead.
const FUEL_PER_RUN: u64 = 10_000_000_000;

pub struct WasmSandbox {
    engine: Engine,
    config: WasmSandboxConfig,
    llm: Option<Arc<dyn LLMProvider>>,
    store: Option<Arc<dyn KeyValueStore>>,
    http_client: reqwest::Client,
    _epoch_ticker: tokio::task::JoinHandle<()>,
}

impl WasmSandbox {
    /// Build a sandbox with no LLM/storage host-function backing (only
    /// `host_log`/`host_set_result`/`host_get_param` are functional; the
    /// LLM/HTTP/storage helpers return an error code to the script). Used
    /// by tests and by callers that only need pure computation.
    pub fn new(config: WasmSandboxConfig) -> wasmtime::Result<Self> {
        Self::with_collaborators(config, None, None)
    }

    pub fn with_collaborators(
        config: WasmSandboxConfig,
        llm: Option<Arc<dyn LLMProvider>>,
        store: Option<Arc<dyn KeyValueStore>>,
    ) -> wasmtime::Result<Self> {
        let mut wasm_config = Config::new();
        wasm_config.consume_fuel(true);
        wasm_config.epoch_interruption(true);
        let engine = Engine::new(&wasm_config)?;

        let ticker_engine = engine.clone();
        let tick = config.epoch_tick;
        let ticker = tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            loop {
                interval.tick().await;
                ticker_engine.increment_epoch();
            }
        });

        Ok(Self {
            engine,
            config,
            llm,
            store,
            http_client: reqwest::Client::new(),
            _epoch_ticker: ticker,
        })
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }
}

impl Drop for WasmSandbox {
    fn drop(&mut self) {
        self._epoch_ticker.abort();
    }
}

fn classify_trap(err: &wasmtime::Error, security_violation: bool) -> (FailureCategory, String) {
    if security_violation {
        return (FailureCategory::SecurityViolation, err.to_string());
    }
    let msg = err.to_string();
    let lower = msg.to_lowercase();
    if lower.contains("epoch") || lower.contains("deadline") {
        (FailureCategory::Timeout, msg)
    } else if lower.contains("fuel") {
        (FailureCategory::ResourceLimit, msg)
    } else if lower.contains("memory") && (lower.contains("limit") || lower.contains("grow")) {
        (FailureCategory::ResourceLimit, msg)
    } else {
        (FailureCategory::RuntimeError, msg)
    }
}

#[async_trait]
impl Sandbox for WasmSandbox {
    /// `Run(scriptSource, params, budget)` (§6, §4.D step 4).
    async fn run(&self, script_source: &str, params: Value, budget: SandboxBudget) -> AdkResult<SandboxOutcome> {
        let module = match Module::new(&self.engine, script_source) {
            Ok(m) => m,
            Err(e) => {
                return Ok(SandboxOutcome {
                    ok: false,
                    result: None,
                    error: Some(e.to_string()),
                    classification: Some(FailureCategory::ValidationError),
                    diagnostics: vec![],
                });
            }
        };

        let namespace = params
            .get("taskId")
            .and_then(|v| v.as_str())
            .unwrap_or("unscoped")
            .to_string();
        let input_json = serde_json::to_vec(&params).unwrap_or_default();
        let security_violation = Arc::new(AtomicBool::new(false));

        let state = HostState {
            input_json,
            output_json: Vec::new(),
            diagnostics: Vec::new(),
            security_violation: Arc::clone(&security_violation),
            namespace,
            llm: self.llm.clone(),
            store: self.store.clone(),
            http_client: Some(self.http_client.clone()),
            allow_network: self.config.allow_network,
            rt_handle: tokio::runtime::Handle::current(),
            max_memory_bytes: budget.heap_bytes as usize,
        };

        let mut store = Store::new(&self.engine, state);
        store.limiter(|s| s as &mut dyn wasmtime::ResourceLimiter);
        store.set_fuel(FUEL_PER_RUN).ok();
        let ticks = (budget.wall_clock_ms / self.config.epoch_tick.as_millis().max(1) as u64).max(1);
        store.set_epoch_deadline(ticks);

        let mut linker = Linker::new(&self.engine);
        if let Err(e) = define_host_functions(&mut linker) {
            return Ok(SandboxOutcome {
                ok: false,
                result: None,
                error: Some(format!("failed to register host functions: {e}")),
                classification: Some(FailureCategory::RuntimeError),
                diagnostics: vec![],
            });
        }

        let wall_clock = Duration::from_millis(budget.wall_clock_ms);
        let run_result = tokio::task::spawn_blocking(move || -> wasmtime::Result<(Store<HostState>, i32)> {
            let instance = linker.instantiate(&mut store, &module)?;
            let entry = instance.get_typed_func::<(), i32>(&mut store, "execute")?;
            let code = entry.call(&mut store, ())?;
            Ok((store, code))
        });

        let joined = tokio::time::timeout(wall_clock, run_result).await;
        let (store, exit_code) = match joined {
            Ok(Ok(Ok(pair))) => pair,
            Ok(Ok(Err(e))) => {
                let sv = security_violation.load(Ordering::SeqCst);
                let (category, detail) = classify_trap(&e, sv);
                return Ok(SandboxOutcome {
                    ok: false,
                    result: None,
                    error: Some(detail),
                    classification: Some(category),
                    diagnostics: vec![],
                });
            }
            Ok(Err(join_err)) => {
                warn!(error = %join_err, "sandbox blocking task panicked");
                return Ok(SandboxOutcome {
                    ok: false,
                    result: None,
                    error: Some(join_err.to_string()),
                    classification: Some(FailureCategory::RuntimeError),
                    diagnostics: vec![],
                });
            }
            Err(_elapsed) => {
                return Ok(SandboxOutcome {
                    ok: false,
                    result: None,
                    error: Some(format!("script exceeded wall clock budget of {}ms", budget.wall_clock_ms)),
                    classification: Some(FailureCategory::Timeout),
                    diagnostics: vec![],
                });
            }
        };

        let diagnostics = store.data().diagnostics.clone();
        if exit_code != 0 {
            return Ok(SandboxOutcome {
                ok: false,
                result: None,
                error: Some(format!("script returned non-zero exit code {exit_code}")),
                classification: Some(FailureCategory::RuntimeError),
                diagnostics,
            });
        }

        let result = if store.data().output_json.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&store.data().output_json).unwrap_or(Value::Null)
        };

        Ok(SandboxOutcome {
            ok: true,
            result: Some(result),
            error: None,
            classification: None,
            diagnostics,
        })
    }
}
