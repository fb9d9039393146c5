//! Host-function surface exposed to a running script: `host_log`,
//! `host_set_result`, `host_get_param` (carried over almost verbatim from
//! `sandbox::runtime::define_host_functions`), plus the three read-only
//! services §4.D step 2 requires a rendered script to receive — LLM
//! access, an SSRF-policed HTTP-get, and namespace-scoped storage reads —
//! which the teacher's plugin model never needed (a plugin only ever
//! talked back to its own host, never outward).

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use adk_core::interfaces::{GenerationRequest, KeyValueStore, LLMProvider};
use tracing::{debug, error, info, warn};
use wasmtime::{Caller, Linker, Memory};

/// Per-run host state. One instance backs exactly one `Store`, i.e. one
/// script execution.
pub struct HostState {
    /// The task's rendered parameters, handed to the script verbatim via
    /// `host_get_param` — mirrors `sandbox::runtime`'s "for simplicity,
    /// write the full input JSON into the provided buffer" shortcut.
    pub input_json: Vec<u8>,
    pub output_json: Vec<u8>,
    /// Free-form log lines captured via `host_log`, surfaced back as
    /// `SandboxOutcome::diagnostics`.
    pub diagnostics: Vec<String>,
    /// Set when a host call is denied for policy reasons (e.g. an SSRF-blocked
    /// host); distinguishes `security_violation` from a plain `runtime_error`
    /// at classification time.
    pub security_violation: Arc<AtomicBool>,
    /// Namespace prefix for `host_storage_get`, scoping a script to its own
    /// task's storage area rather than the whole `KeyValueStore`.
    pub namespace: String,
    pub llm: Option<Arc<dyn LLMProvider>>,
    pub store: Option<Arc<dyn KeyValueStore>>,
    pub http_client: Option<reqwest::Client>,
    pub allow_network: bool,
    /// Handle onto the async runtime driving this sandbox, so a
    /// synchronous wasmtime host function can still call into the async
    /// `LLMProvider`/`KeyValueStore`/`reqwest` surfaces. Safe to
    /// `block_on` here because host functions only ever run on the
    /// blocking-pool thread `WasmSandbox::run` dispatches onto (see
    /// `runtime.rs`), never on a reactor thread.
    pub rt_handle: tokio::runtime::Handle,
    /// Heap cap for this run (`SandboxBudget.heap_bytes`), enforced via
    /// `wasmtime::ResourceLimiter` below.
    pub max_memory_bytes: usize,
}

impl wasmtime::ResourceLimiter for HostState {
    fn memory_growing(
        &mut self,
        _current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        Ok(desired <= self.max_memory_bytes)
    }

    fn table_growing(
        &mut self,
        _current: usize,
        _desired: u32,
        _maximum: Option<u32>,
    ) -> wasmtime::Result<bool> {
        Ok(true)
    }
}

/// Private IP ranges and metadata hostnames outbound requests must never
/// reach (§4.G footer), duplicated here rather than shared with
/// `adk-tools::tools::HttpRequestTool` since the two crates are siblings
/// with no lower-level crate both could depend on for it.
fn is_blocked_host(host: &str) -> bool {
    if host.eq_ignore_ascii_case("metadata.google.internal")
        || host == "169.254.169.254"
        || host.eq_ignore_ascii_case("metadata.azure.com")
    {
        return true;
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
        return is_blocked_ip(ip);
    }
    false
}

fn is_blocked_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            o[0] == 10
                || (o[0] == 172 && (16..=31).contains(&o[1]))
                || (o[0] == 192 && o[1] == 168)
                || (o[0] == 169 && o[1] == 254)
                || o[0] == 127
        }
        IpAddr::V6(v6) => v6.is_loopback() || v6.segments()[0] & 0xffc0 == 0xfe80,
    }
}

fn check_url(raw: &str) -> Result<url::Url, String> {
    let url = url::Url::parse(raw).map_err(|e| format!("invalid URL: {e}"))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(format!("scheme `{}` is not permitted", url.scheme()));
    }
    let Some(host) = url.host_str() else {
        return Err("URL has no host".to_string());
    };
    if is_blocked_host(host) {
        return Err(format!("host `{host}` is not permitted (SSRF policy)"));
    }
    Ok(url)
}

fn memory_of(caller: &mut Caller<'_, HostState>) -> Option<Memory> {
    caller.get_export("memory").and_then(|e| e.into_memory())
}

fn read_bytes(caller: &mut Caller<'_, HostState>, ptr: i32, len: i32) -> Option<Vec<u8>> {
    let mem = memory_of(caller)?;
    let data = mem.data(caller);
    let (ptr, len) = (ptr as usize, len as usize);
    data.get(ptr..ptr.checked_add(len)?).map(|s| s.to_vec())
}

fn write_bytes(caller: &mut Caller<'_, HostState>, ptr: i32, max_len: i32, bytes: &[u8]) -> i32 {
    let Some(mem) = memory_of(caller) else {
        return -1;
    };
    let data = mem.data_mut(caller);
    let (ptr, max_len) = (ptr as usize, max_len as usize);
    let n = bytes.len().min(max_len);
    let Some(dst) = data.get_mut(ptr..ptr + n) else {
        return -1;
    };
    dst.copy_from_slice(&bytes[..n]);
    bytes.len() as i32
}

/// Register every host function a rendered script may call, under the
/// `"env"` module namespace (matching `sandbox::runtime`'s convention).
pub fn define_host_functions(linker: &mut Linker<HostState>) -> wasmtime::Result<()> {
    linker.func_wrap(
        "env",
        "host_log",
        |mut caller: Caller<'_, HostState>, level: i32, ptr: i32, len: i32| {
            let Some(bytes) = read_bytes(&mut caller, ptr, len) else {
                return;
            };
            let msg = String::from_utf8_lossy(&bytes).to_string();
            match level {
                0 => debug!(target: "adk_sandbox::script", "{msg}"),
                1 => info!(target: "adk_sandbox::script", "{msg}"),
                2 => warn!(target: "adk_sandbox::script", "{msg}"),
                _ => error!(target: "adk_sandbox::script", "{msg}"),
            }
            caller.data_mut().diagnostics.push(msg);
        },
    )?;

    linker.func_wrap(
        "env",
        "host_set_result",
        |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| {
            if let Some(bytes) = read_bytes(&mut caller, ptr, len) {
                caller.data_mut().output_json = bytes;
            }
        },
    )?;

    linker.func_wrap(
        "env",
        "host_get_param",
        |mut caller: Caller<'_, HostState>, _key_ptr: i32, _key_len: i32, val_ptr: i32, val_len: i32| -> i32 {
            let input = caller.data().input_json.clone();
            write_bytes(&mut caller, val_ptr, val_len, &input)
        },
    )?;

    linker.func_wrap(
        "env",
        "host_llm_generate",
        |mut caller: Caller<'_, HostState>, prompt_ptr: i32, prompt_len: i32, out_ptr: i32, out_len: i32| -> i32 {
            let Some(bytes) = read_bytes(&mut caller, prompt_ptr, prompt_len) else {
                return -1;
            };
            let prompt = String::from_utf8_lossy(&bytes).to_string();
            let state = caller.data();
            let Some(llm) = state.llm.clone() else {
                return -1;
            };
            let handle = state.rt_handle.clone();
            let result = handle.block_on(llm.generate_content(GenerationRequest {
                messages: vec![adk_core::interfaces::ChatMessage {
                    role: "user".to_string(),
                    content: prompt,
                }],
                temperature: Some(0.0),
                ..Default::default()
            }));
            match result {
                Ok(resp) => write_bytes(&mut caller, out_ptr, out_len, resp.text.as_bytes()),
                Err(e) => {
                    warn!(error = %e, "host_llm_generate failed");
                    -1
                }
            }
        },
    )?;

    linker.func_wrap(
        "env",
        "host_http_get",
        |mut caller: Caller<'_, HostState>, url_ptr: i32, url_len: i32, out_ptr: i32, out_len: i32| -> i32 {
            let Some(bytes) = read_bytes(&mut caller, url_ptr, url_len) else {
                return -1;
            };
            let raw_url = String::from_utf8_lossy(&bytes).to_string();
            let state = caller.data();
            if !state.allow_network {
                return -1;
            }
            let checked = check_url(&raw_url);
            let Ok(url) = checked else {
                caller.data().security_violation.store(true, Ordering::SeqCst);
                warn!(url = %raw_url, "host_http_get denied by SSRF policy");
                return -2;
            };
            let Some(client) = state.http_client.clone() else {
                return -1;
            };
            let handle = state.rt_handle.clone();
            let result = handle.block_on(async move {
                client
                    .get(url)
                    .header("User-Agent", "adk-sandbox/0.1")
                    .send()
                    .await?
                    .text()
                    .await
            });
            match result {
                Ok(body) => write_bytes(&mut caller, out_ptr, out_len, body.as_bytes()),
                Err(e) => {
                    warn!(error = %e, "host_http_get request failed");
                    -1
                }
            }
        },
    )?;

    linker.func_wrap(
        "env",
        "host_storage_get",
        |mut caller: Caller<'_, HostState>, key_ptr: i32, key_len: i32, out_ptr: i32, out_len: i32| -> i32 {
            let Some(bytes) = read_bytes(&mut caller, key_ptr, key_len) else {
                return -1;
            };
            let key = String::from_utf8_lossy(&bytes).to_string();
            let state = caller.data();
            let Some(store) = state.store.clone() else {
                return -1;
            };
            let path = format!("{}/{}", state.namespace, key);
            let handle = state.rt_handle.clone();
            let result = handle.block_on(store.get(&path));
            match result {
                Ok(Some(value)) => {
                    let serialized = serde_json::to_vec(&value).unwrap_or_default();
                    write_bytes(&mut caller, out_ptr, out_len, &serialized)
                }
                Ok(None) => 0,
                Err(e) => {
                    warn!(error = %e, "host_storage_get failed");
                    -1
                }
            }
        },
    )?;

    Ok(())
}
