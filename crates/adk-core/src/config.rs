//! Configuration keys consumed by the core (§6), loaded from TOML the way
//! the teacher workspace loads `config/default.toml` sections.

use serde::Deserialize;

fn default_loop_cap() -> u32 {
    5
}
fn default_retrieval_k() -> usize {
    5
}
fn default_retrieval_n() -> usize {
    10
}
fn default_retrieval_m() -> usize {
    3
}
fn default_sim_threshold() -> f32 {
    0.65
}
fn default_task_workers() -> usize {
    3
}
fn default_queue_depth() -> usize {
    1024
}
fn default_per_user_cap_user() -> u32 {
    5
}
fn default_per_user_cap_admin() -> u32 {
    u32::MAX
}
fn default_max_repairs() -> u32 {
    3
}
fn default_wall_clock_ms() -> u64 {
    600_000
}
fn default_heap_bytes() -> u64 {
    256 * 1024 * 1024
}
fn default_tool_timeout_ms() -> u64 {
    30_000
}
fn default_cache_capacity() -> u64 {
    1_000
}
fn default_cache_ttl_ms() -> u64 {
    3_600_000
}
fn default_metrics_report_ms() -> u64 {
    3_600_000
}
fn default_heartbeat_interval_ms() -> u64 {
    5_000
}
fn default_hung_grace_ms() -> u64 {
    30_000
}
fn default_semaphore() -> usize {
    32
}
fn default_max_script_bytes() -> usize {
    200 * 1024
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlanConfig {
    #[serde(rename = "loopCap")]
    pub loop_cap: u32,
}

impl Default for PlanConfig {
    fn default() -> Self {
        Self {
            loop_cap: default_loop_cap(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub k: usize,
    pub n: usize,
    pub m: usize,
    #[serde(rename = "simThreshold")]
    pub sim_threshold: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            k: default_retrieval_k(),
            n: default_retrieval_n(),
            m: default_retrieval_m(),
            sim_threshold: default_sim_threshold(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    pub workers: usize,
    #[serde(rename = "queueDepth")]
    pub queue_depth: usize,
    #[serde(rename = "perUserCapUser")]
    pub per_user_cap_user: u32,
    #[serde(rename = "perUserCapAdmin")]
    pub per_user_cap_admin: u32,
    #[serde(rename = "maxRepairs")]
    pub max_repairs: u32,
    #[serde(rename = "wallClockMs")]
    pub wall_clock_ms: u64,
    #[serde(rename = "heapBytes")]
    pub heap_bytes: u64,
    #[serde(rename = "heartbeatIntervalMs")]
    pub heartbeat_interval_ms: u64,
    #[serde(rename = "hungGraceMs")]
    pub hung_grace_ms: u64,
    #[serde(rename = "maxScriptBytes")]
    pub max_script_bytes: usize,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            workers: default_task_workers(),
            queue_depth: default_queue_depth(),
            per_user_cap_user: default_per_user_cap_user(),
            per_user_cap_admin: default_per_user_cap_admin(),
            max_repairs: default_max_repairs(),
            wall_clock_ms: default_wall_clock_ms(),
            heap_bytes: default_heap_bytes(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            hung_grace_ms: default_hung_grace_ms(),
            max_script_bytes: default_max_script_bytes(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    #[serde(rename = "defaultTimeoutMs")]
    pub default_timeout_ms: u64,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_tool_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    #[serde(rename = "cacheCapacity")]
    pub cache_capacity: u64,
    #[serde(rename = "cacheTtlMs")]
    pub cache_ttl_ms: u64,
    #[serde(rename = "metricsReportMs")]
    pub metrics_report_ms: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            cache_capacity: default_cache_capacity(),
            cache_ttl_ms: default_cache_ttl_ms(),
            metrics_report_ms: default_metrics_report_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RequestConfig {
    /// Request-path semaphore bound (§5: "separately bounded by a
    /// configurable semaphore, default 32 in-flight").
    #[serde(rename = "maxInFlight")]
    pub max_in_flight: usize,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            max_in_flight: default_semaphore(),
        }
    }
}

/// Top-level configuration document, covering exactly the keys enumerated
/// in §6.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub plan: PlanConfig,
    pub retrieval: RetrievalConfig,
    pub task: TaskConfig,
    pub tool: ToolConfig,
    pub embedding: EmbeddingConfig,
    pub request: RequestConfig,
}

impl Config {
    /// Load from a TOML file, falling back to built-in defaults for any
    /// table or key the file omits (mirrors the teacher's
    /// `load_config_toml` leniency).
    pub fn from_toml_str(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| crate::error::AdkError::Store(format!("reading config: {e}")))?;
        Self::from_toml_str(&raw)
            .map_err(|e| crate::error::AdkError::Store(format!("parsing config: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = Config::default();
        assert_eq!(cfg.plan.loop_cap, 5);
        assert_eq!(cfg.retrieval.k, 5);
        assert_eq!(cfg.retrieval.n, 10);
        assert_eq!(cfg.retrieval.m, 3);
        assert!((cfg.retrieval.sim_threshold - 0.65).abs() < f32::EPSILON);
        assert_eq!(cfg.task.workers, 3);
        assert_eq!(cfg.task.queue_depth, 1024);
        assert_eq!(cfg.task.per_user_cap_user, 5);
        assert_eq!(cfg.task.max_repairs, 3);
        assert_eq!(cfg.task.wall_clock_ms, 600_000);
        assert_eq!(cfg.task.heap_bytes, 256 * 1024 * 1024);
        assert_eq!(cfg.tool.default_timeout_ms, 30_000);
        assert_eq!(cfg.embedding.cache_capacity, 1_000);
        assert_eq!(cfg.embedding.cache_ttl_ms, 3_600_000);
        assert_eq!(cfg.embedding.metrics_report_ms, 3_600_000);
        assert_eq!(cfg.request.max_in_flight, 32);
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let cfg = Config::from_toml_str(
            r#"
            [task]
            workers = 8
            "#,
        )
        .unwrap();
        assert_eq!(cfg.task.workers, 8);
        assert_eq!(cfg.task.queue_depth, 1024);
        assert_eq!(cfg.plan.loop_cap, 5);
    }
}
