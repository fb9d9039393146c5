//! A small set of illustrative built-in tools exercising the Dispatcher
//! contract end to end, ported from `openintent-adapters`'s shell/
//! http_request/filesystem adapters. These are examples, not a product
//! surface — per-platform adapters (telegram, discord, github, ...) are
//! explicitly out of scope and not carried over.

use std::path::{Path, PathBuf};

use adk_core::error::{AdkError, Result};
use adk_core::model::Role;
use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::tool::Tool;

const MAX_OUTPUT_BYTES: usize = 100 * 1024;
const MAX_FILE_READ_CHARS: usize = 16_000;

/// Runs a shell command via `sh -c`, ported from `ShellAdapter::
/// tool_shell_execute`. Output is truncated to 100 KB per stream; the
/// per-call timeout is enforced by the Dispatcher, not here.
pub struct ShellExecuteTool {
    working_dir: PathBuf,
    roles: Vec<Role>,
}

impl ShellExecuteTool {
    pub fn new(working_dir: impl Into<PathBuf>, roles: Vec<Role>) -> Self {
        Self {
            working_dir: working_dir.into(),
            roles,
        }
    }
}

#[async_trait]
impl Tool for ShellExecuteTool {
    fn name(&self) -> &str {
        "shell_execute"
    }

    fn description(&self) -> &str {
        "Execute a shell command and return its stdout, stderr, and exit code."
    }

    fn parameter_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["command"],
            "properties": {
                "command": {"type": "string"},
                "working_dir": {"type": "string"},
            }
        })
    }

    fn allowed_roles(&self) -> &[Role] {
        &self.roles
    }

    fn timeout_ms(&self) -> u64 {
        30_000
    }

    async fn execute(&self, args: Value) -> Result<Value> {
        let command = args
            .get("command")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AdkError::ToolBadArgs {
                reason: "missing required string field `command`".into(),
            })?;
        let working_dir = args
            .get("working_dir")
            .and_then(|v| v.as_str())
            .map(PathBuf::from)
            .unwrap_or_else(|| self.working_dir.clone());

        debug!(command, working_dir = %working_dir.display(), "executing shell command");

        let child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&working_dir)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AdkError::ScriptRuntime(format!("failed to spawn process: {e}")))?;

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| AdkError::ScriptRuntime(format!("process error: {e}")))?;

        let exit_code = output.status.code().unwrap_or(-1);
        let (stdout, stdout_truncated) = truncate_output(&output.stdout);
        let (stderr, stderr_truncated) = truncate_output(&output.stderr);

        Ok(json!({
            "command": command,
            "exit_code": exit_code,
            "stdout": stdout,
            "stderr": stderr,
            "stdout_truncated": stdout_truncated,
            "stderr_truncated": stderr_truncated,
            "success": exit_code == 0,
        }))
    }
}

fn truncate_output(raw: &[u8]) -> (String, bool) {
    if raw.len() <= MAX_OUTPUT_BYTES {
        (String::from_utf8_lossy(raw).into_owned(), false)
    } else {
        let truncated = &raw[..MAX_OUTPUT_BYTES];
        let mut s = String::from_utf8_lossy(truncated).into_owned();
        s.push_str("\n... [output truncated at 100 KB]");
        (s, true)
    }
}

/// Issues an HTTP request, ported from `HttpRequestAdapter::
/// tool_http_request`, with the SSRF policy of §4.G applied centrally
/// rather than left to the caller.
pub struct HttpRequestTool {
    client: reqwest::Client,
    roles: Vec<Role>,
}

impl HttpRequestTool {
    pub fn new(roles: Vec<Role>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .user_agent("adk-tools/0.1 (+https://github.com/adk-rs/adk-core)")
                .build()
                .expect("reqwest client builds with static config"),
            roles,
        }
    }
}

#[async_trait]
impl Tool for HttpRequestTool {
    fn name(&self) -> &str {
        "http_request"
    }

    fn description(&self) -> &str {
        "Issue an HTTP(S) request to a public, non-private-network endpoint."
    }

    fn parameter_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["method", "url"],
            "properties": {
                "method": {"type": "string"},
                "url": {"type": "string"},
                "body": {"type": "string"},
            }
        })
    }

    fn allowed_roles(&self) -> &[Role] {
        &self.roles
    }

    async fn execute(&self, args: Value) -> Result<Value> {
        let method = args
            .get("method")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AdkError::ToolBadArgs {
                reason: "missing required string field `method`".into(),
            })?;
        let url = args
            .get("url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AdkError::ToolBadArgs {
                reason: "missing required string field `url`".into(),
            })?;

        check_ssrf_policy(url)?;

        let method = parse_method(method)
            .ok_or_else(|| AdkError::ToolBadArgs {
                reason: format!("unsupported HTTP method `{method}`"),
            })?;

        let mut req = self.client.request(method, url);
        if let Some(body) = args.get("body").and_then(|v| v.as_str()) {
            req = req.body(body.to_string());
        }

        let response = req
            .send()
            .await
            .map_err(|e| AdkError::ScriptRuntime(format!("http request failed: {e}")))?;
        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| AdkError::ScriptRuntime(format!("reading response body: {e}")))?;

        Ok(json!({"status": status, "body": text}))
    }
}

fn parse_method(method: &str) -> Option<reqwest::Method> {
    match method.to_uppercase().as_str() {
        "GET" => Some(reqwest::Method::GET),
        "POST" => Some(reqwest::Method::POST),
        "PUT" => Some(reqwest::Method::PUT),
        "PATCH" => Some(reqwest::Method::PATCH),
        "DELETE" => Some(reqwest::Method::DELETE),
        "HEAD" => Some(reqwest::Method::HEAD),
        _ => None,
    }
}

/// Reject non-HTTP(S) schemes, private/loopback/link-local IP ranges, and
/// cloud-metadata hostnames (§4.G SSRF / network policy, inherited by
/// worker-exposed HTTP helpers).
fn check_ssrf_policy(raw_url: &str) -> Result<()> {
    let parsed = url::Url::parse(raw_url)
        .map_err(|e| AdkError::ToolBadArgs { reason: format!("invalid url: {e}") })?;

    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(AdkError::ToolBadArgs {
            reason: format!("scheme `{}` is not permitted", parsed.scheme()),
        });
    }

    let host = parsed.host_str().unwrap_or_default();
    if host.eq_ignore_ascii_case("metadata.google.internal")
        || host == "169.254.169.254"
        || host.eq_ignore_ascii_case("metadata.azure.com")
    {
        warn!(url = raw_url, "rejected cloud-metadata host");
        return Err(AdkError::SecurityViolation(format!(
            "host `{host}` is a disallowed cloud-metadata endpoint"
        )));
    }

    if let Some(url::Host::Ipv4(ip)) = parsed.host() {
        if is_private_ipv4(ip) {
            return Err(AdkError::SecurityViolation(format!(
                "address `{ip}` is in a private/reserved range"
            )));
        }
    }
    if host == "localhost" {
        return Err(AdkError::SecurityViolation(
            "host `localhost` is disallowed".into(),
        ));
    }

    Ok(())
}

fn is_private_ipv4(ip: std::net::Ipv4Addr) -> bool {
    ip.is_private() || ip.is_loopback() || ip.is_link_local()
}

/// Reads a UTF-8 text file rooted at `root_dir`, ported from
/// `FilesystemAdapter`'s path-traversal-safe read path.
pub struct ReadFileTool {
    root_dir: PathBuf,
    roles: Vec<Role>,
}

impl ReadFileTool {
    pub fn new(root_dir: impl Into<PathBuf>, roles: Vec<Role>) -> Self {
        Self {
            root_dir: root_dir.into(),
            roles,
        }
    }

    fn safe_resolve(&self, raw_path: &str) -> Result<PathBuf> {
        let candidate = if Path::new(raw_path).is_absolute() {
            PathBuf::from(raw_path)
        } else {
            self.root_dir.join(raw_path)
        };
        let normalized = normalize_path(&candidate);
        let canon_root = self
            .root_dir
            .canonicalize()
            .unwrap_or_else(|_| self.root_dir.clone());
        if !normalized.starts_with(&canon_root) {
            return Err(AdkError::SecurityViolation(format!(
                "path `{raw_path}` escapes the permitted root"
            )));
        }
        Ok(normalized)
    }
}

fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            std::path::Component::ParentDir => {
                out.pop();
            }
            std::path::Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a UTF-8 text file rooted under a fixed directory."
    }

    fn parameter_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["path"],
            "properties": {"path": {"type": "string"}}
        })
    }

    fn allowed_roles(&self) -> &[Role] {
        &self.roles
    }

    async fn execute(&self, args: Value) -> Result<Value> {
        let raw_path = args
            .get("path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AdkError::ToolBadArgs {
                reason: "missing required string field `path`".into(),
            })?;
        let resolved = self.safe_resolve(raw_path)?;

        let contents = tokio::fs::read_to_string(&resolved)
            .await
            .map_err(|e| AdkError::ScriptRuntime(format!("reading file: {e}")))?;

        let truncated = contents.chars().count() > MAX_FILE_READ_CHARS;
        let text: String = if truncated {
            contents.chars().take(MAX_FILE_READ_CHARS).collect()
        } else {
            contents
        };

        Ok(json!({"path": raw_path, "content": text, "truncated": truncated}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shell_execute_runs_a_command() {
        let tool = ShellExecuteTool::new(".", vec![Role::User]);
        let out = tool.execute(json!({"command": "echo hi"})).await.unwrap();
        assert_eq!(out["success"], true);
        assert!(out["stdout"].as_str().unwrap().contains("hi"));
    }

    #[test]
    fn ssrf_policy_rejects_private_ip() {
        assert!(check_ssrf_policy("http://127.0.0.1/admin").is_err());
        assert!(check_ssrf_policy("http://10.0.0.5/").is_err());
        assert!(check_ssrf_policy("http://169.254.169.254/latest/meta-data").is_err());
    }

    #[test]
    fn ssrf_policy_rejects_non_http_scheme() {
        assert!(check_ssrf_policy("file:///etc/passwd").is_err());
        assert!(check_ssrf_policy("ftp://example.com/x").is_err());
    }

    #[test]
    fn ssrf_policy_allows_public_https() {
        assert!(check_ssrf_policy("https://example.com/api").is_ok());
    }

    #[tokio::test]
    async fn read_file_rejects_path_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let tool = ReadFileTool::new(dir.path(), vec![Role::User]);
        let err = tool
            .execute(json!({"path": "../../../etc/passwd"}))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "ERR_SECURITY_VIOLATION");
    }

    #[tokio::test]
    async fn read_file_reads_an_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hello.txt"), "hello world").unwrap();
        let tool = ReadFileTool::new(dir.path(), vec![Role::User]);
        let out = tool.execute(json!({"path": "hello.txt"})).await.unwrap();
        assert_eq!(out["content"], "hello world");
    }
}
