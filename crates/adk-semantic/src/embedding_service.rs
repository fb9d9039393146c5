//! `EmbeddingService` (§4.G) — the single gateway to the vector embedding
//! provider, with caching, metrics, and batching.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use adk_core::error::{AdkError, Result};
use adk_core::interfaces::EmbeddingProvider;
use adk_core::model::{Embedding, EmbeddingTaskType, EMBEDDING_DIM};
use moka::future::Cache;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Tracks latency samples and error counts per task type. Sized reservoir
/// kept small and bounded; percentiles are computed on demand by sorting
/// the reservoir, which is adequate at the reporting cadence this is
/// exercised at (default hourly, §6 `embedding.metricsReportMs`).
#[derive(Default)]
struct TaskTypeStats {
    samples_ms: Vec<u64>,
    errors: u64,
    calls: u64,
}

const MAX_RESERVOIR: usize = 4096;

impl TaskTypeStats {
    fn record_success(&mut self, latency_ms: u64) {
        self.calls += 1;
        if self.samples_ms.len() >= MAX_RESERVOIR {
            self.samples_ms.remove(0);
        }
        self.samples_ms.push(latency_ms);
    }

    fn record_error(&mut self) {
        self.calls += 1;
        self.errors += 1;
    }

    fn percentile(&self, p: f64) -> u64 {
        if self.samples_ms.is_empty() {
            return 0;
        }
        let mut sorted = self.samples_ms.clone();
        sorted.sort_unstable();
        let idx = ((sorted.len() as f64 - 1.0) * p).round() as usize;
        sorted[idx]
    }

    fn error_rate(&self) -> f64 {
        if self.calls == 0 {
            0.0
        } else {
            self.errors as f64 / self.calls as f64
        }
    }
}

/// A point-in-time performance report, emitted periodically (§4.G).
#[derive(Debug, Clone)]
pub struct PerformanceReport {
    pub by_task_type: HashMap<String, TaskTypeReport>,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_hit_rate: f64,
}

#[derive(Debug, Clone)]
pub struct TaskTypeReport {
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
    pub error_rate: f64,
    pub calls: u64,
}

fn task_type_label(t: EmbeddingTaskType) -> &'static str {
    match t {
        EmbeddingTaskType::RetrievalQuery => "RETRIEVAL_QUERY",
        EmbeddingTaskType::RetrievalDocument => "RETRIEVAL_DOCUMENT",
        EmbeddingTaskType::SemanticSimilarity => "SEMANTIC_SIMILARITY",
    }
}

fn cache_key(text: &str, task_type: EmbeddingTaskType) -> String {
    format!("{}:{}", task_type_label(task_type), text.trim().to_lowercase())
}

/// Gateway in front of an `EmbeddingProvider`, caching normalized lookups
/// and single-flighting concurrent identical requests (§8 invariant 6).
///
/// This cache also serves as `SemanticIndex`'s LRU (§4.F): both call sites
/// share the same `(taskType, normalizedText) -> vector` mapping, so there
/// is exactly one cache to reason about rather than two that could drift.
pub struct EmbeddingService {
    provider: Arc<dyn EmbeddingProvider>,
    cache: Cache<String, Embedding>,
    hits: AtomicU64,
    misses: AtomicU64,
    stats: Mutex<HashMap<&'static str, TaskTypeStats>>,
}

impl EmbeddingService {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, capacity: u64, ttl: Duration) -> Self {
        Self {
            provider,
            cache: Cache::builder()
                .max_capacity(capacity)
                .time_to_live(ttl)
                .build(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            stats: Mutex::new(HashMap::new()),
        }
    }

    /// `Embed(text, taskType) -> float32[768]` (§4.G). Normalizes for cache
    /// keying, single-flights concurrent identical requests via
    /// `moka::Cache::try_get_with`, records latency/error metrics.
    pub async fn embed(&self, text: &str, task_type: EmbeddingTaskType) -> Result<Embedding> {
        let key = cache_key(text, task_type);
        let provider = Arc::clone(&self.provider);
        let owned_text = text.to_string();
        let start = Instant::now();

        let result = self
            .cache
            .try_get_with(key.clone(), async move {
                provider.embed_one(&owned_text, task_type).await
            })
            .await;

        match result {
            Ok(embedding) => {
                let elapsed = start.elapsed();
                // try_get_with doesn't tell us hit vs. miss directly; a
                // sub-millisecond round trip for a provider call is not
                // realistic, so use elapsed time as the hit/miss signal for
                // bookkeeping purposes (stats are advisory, not correctness
                // critical).
                if elapsed < Duration::from_millis(1) {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    self.record_latency(task_type, elapsed).await;
                }
                debug!(task_type = task_type_label(task_type), key = %key, "embedding resolved");
                Ok(embedding)
            }
            Err(err) => {
                self.record_error(task_type).await;
                warn!(task_type = task_type_label(task_type), %err, "embedding provider failed");
                Err(AdkError::EmbedUnavailable(err.to_string()))
            }
        }
    }

    /// `EmbedBatch([text], taskType) -> [float32[768]]` (§4.G) for bulk
    /// document paths.
    pub async fn embed_batch(
        &self,
        texts: &[String],
        task_type: EmbeddingTaskType,
    ) -> Result<Vec<Embedding>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text, task_type).await?);
        }
        Ok(out)
    }

    async fn record_latency(&self, task_type: EmbeddingTaskType, elapsed: Duration) {
        let mut stats = self.stats.lock().await;
        stats
            .entry(task_type_label(task_type))
            .or_default()
            .record_success(elapsed.as_millis() as u64);
    }

    async fn record_error(&self, task_type: EmbeddingTaskType) {
        let mut stats = self.stats.lock().await;
        stats
            .entry(task_type_label(task_type))
            .or_default()
            .record_error();
    }

    pub async fn performance_report(&self) -> PerformanceReport {
        let stats = self.stats.lock().await;
        let by_task_type = stats
            .iter()
            .map(|(name, s)| {
                (
                    name.to_string(),
                    TaskTypeReport {
                        p50_ms: s.percentile(0.50),
                        p95_ms: s.percentile(0.95),
                        p99_ms: s.percentile(0.99),
                        error_rate: s.error_rate(),
                        calls: s.calls,
                    },
                )
            })
            .collect();

        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        PerformanceReport {
            by_task_type,
            cache_hits: hits,
            cache_misses: misses,
            cache_hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
        }
    }

    /// Spawn the periodic performance-report loop (default hourly, §4.G /
    /// §6 `embedding.metricsReportMs`). Runs until the returned handle is
    /// dropped/aborted.
    pub fn spawn_report_loop(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let report = this.performance_report().await;
                info!(
                    cache_hit_rate = report.cache_hit_rate,
                    cache_hits = report.cache_hits,
                    cache_misses = report.cache_misses,
                    "embedding service performance report"
                );
                for (task_type, r) in &report.by_task_type {
                    info!(
                        task_type = %task_type,
                        p50_ms = r.p50_ms,
                        p95_ms = r.p95_ms,
                        p99_ms = r.p99_ms,
                        error_rate = r.error_rate,
                        calls = r.calls,
                        "embedding task-type breakdown"
                    );
                }
            }
        })
    }
}

/// Test-friendly in-memory provider used by `adk-semantic`'s own tests and
/// reusable by downstream crates' tests.
pub struct DeterministicProvider {
    pub fail_next: std::sync::atomic::AtomicBool,
    pub call_count: AtomicU64,
}

impl Default for DeterministicProvider {
    fn default() -> Self {
        Self {
            fail_next: std::sync::atomic::AtomicBool::new(false),
            call_count: AtomicU64::new(0),
        }
    }
}

#[async_trait::async_trait]
impl EmbeddingProvider for DeterministicProvider {
    async fn embed_one(&self, text: &str, _task_type: EmbeddingTaskType) -> Result<Embedding> {
        self.call_count.fetch_add(1, Ordering::Relaxed);
        if self.fail_next.swap(false, Ordering::Relaxed) {
            return Err(AdkError::EmbedUnavailable("simulated failure".into()));
        }
        // Deterministic pseudo-embedding derived from text bytes so tests
        // can assert on similarity ordering.
        let mut v = vec![0.0f32; EMBEDDING_DIM];
        for (i, b) in text.bytes().enumerate() {
            v[i % EMBEDDING_DIM] += b as f32;
        }
        Ok(Embedding::new(v).expect("constructed with EMBEDDING_DIM length"))
    }

    async fn embed_many(
        &self,
        texts: &[String],
        task_type: EmbeddingTaskType,
    ) -> Result<Vec<Embedding>> {
        let mut out = Vec::with_capacity(texts.len());
        for t in texts {
            out.push(self.embed_one(t, task_type).await?);
        }
        Ok(out)
    }
}
