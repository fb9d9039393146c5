//! `SemanticIndex` (§4.F) — four logical vector indexes (knowledge, tool
//! descriptors, task templates, reasoning memories) sharing one cosine
//! ranking and caching implementation.
//!
//! Grounded on the `KeyValueStore` vector-query contract (`QueryFilter`'s
//! `nearest_to`/`min_score`) for the query shape, and on
//! `store::cache::CacheLayer`'s moka-backed LRU-with-stats pattern for the
//! embedding cache that sits in front of it.

use std::collections::HashMap;
use std::sync::Arc;

use adk_core::error::Result;
use adk_core::model::{Embedding, EmbeddingTaskType};
use chrono::{DateTime, Utc};
use moka::future::Cache;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;

use crate::embedding_service::EmbeddingService;

/// Which logical index an entry belongs to. Each kind is stored and
/// queried independently even though the backing cache and ranking logic
/// are shared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexKind {
    Knowledge,
    Tool,
    Template,
    Memory,
}

/// Filters applicable to a `Query`/`QueryByVector` call, mirroring the
/// subset of `adk_core::interfaces::QueryFilter` that makes sense for a
/// vector index (category/tags/enabled/minScore rather than arbitrary
/// equality filters, which belong to the backing `KeyValueStore`).
#[derive(Debug, Clone, Default)]
pub struct IndexFilters {
    pub category: Option<String>,
    pub tags: Vec<String>,
    pub enabled_only: bool,
    pub min_score: Option<f32>,
}

/// One indexed item: its vector plus the bookkeeping needed for
/// tie-breaking and filtering.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub id: String,
    pub text: String,
    pub embedding: Embedding,
    pub category: Option<String>,
    pub tags: Vec<String>,
    pub enabled: bool,
    pub priority: u32,
    pub updated_at: DateTime<Utc>,
    pub metadata: Value,
}

/// One ranked result from a query.
#[derive(Debug, Clone)]
pub struct QueryMatch {
    pub id: String,
    pub score: f32,
    pub metadata: Value,
}

fn cache_key(kind: IndexKind, text: &str) -> String {
    format!("{:?}:{}", kind, text.trim().to_lowercase())
}

/// In-memory vector index over the four logical collections, fronted by
/// an embedding cache so repeated `AddOrUpdate`/`Query` calls against the
/// same normalized text don't re-hit the embedding provider.
pub struct SemanticIndex {
    embeddings: Arc<EmbeddingService>,
    /// One map per logical index, guarded independently so a write to
    /// `Knowledge` never blocks a read of `Tool`.
    knowledge: RwLock<HashMap<String, IndexEntry>>,
    tool: RwLock<HashMap<String, IndexEntry>>,
    template: RwLock<HashMap<String, IndexEntry>>,
    memory: RwLock<HashMap<String, IndexEntry>>,
    /// Cache of normalized-text -> embedding, separate from
    /// `EmbeddingService`'s own cache so a cache-hit-rate figure can be
    /// reported per index as required by §4.F, independent of whatever
    /// hit rate the embedding gateway itself is already tracking.
    vector_cache: Cache<String, Embedding>,
}

impl SemanticIndex {
    pub fn new(embeddings: Arc<EmbeddingService>, capacity: u64, ttl: std::time::Duration) -> Self {
        Self {
            embeddings,
            knowledge: RwLock::new(HashMap::new()),
            tool: RwLock::new(HashMap::new()),
            template: RwLock::new(HashMap::new()),
            memory: RwLock::new(HashMap::new()),
            vector_cache: Cache::builder()
                .max_capacity(capacity)
                .time_to_live(ttl)
                .build(),
        }
    }

    fn map_for(&self, kind: IndexKind) -> &RwLock<HashMap<String, IndexEntry>> {
        match kind {
            IndexKind::Knowledge => &self.knowledge,
            IndexKind::Tool => &self.tool,
            IndexKind::Template => &self.template,
            IndexKind::Memory => &self.memory,
        }
    }

    /// Resolve an embedding for `text`, consulting the cache first.
    async fn embed_cached(&self, kind: IndexKind, text: &str) -> Result<Embedding> {
        let key = cache_key(kind, text);
        if let Some(v) = self.vector_cache.get(&key).await {
            return Ok(v);
        }
        let v = self
            .embeddings
            .embed(text, EmbeddingTaskType::RetrievalDocument)
            .await?;
        self.vector_cache.insert(key, v.clone()).await;
        Ok(v)
    }

    /// `AddOrUpdate(id, text, metadata)` (§4.F) for one of the four logical
    /// indexes. Computes the embedding, persists the entry, and
    /// invalidates any stale cached vector for the previous text (a plain
    /// re-insert under the new key is sufficient since the cache is keyed
    /// by normalized text, not by id).
    pub async fn add_or_update(
        &self,
        kind: IndexKind,
        id: impl Into<String>,
        text: impl Into<String>,
        category: Option<String>,
        tags: Vec<String>,
        enabled: bool,
        priority: u32,
        metadata: Value,
    ) -> Result<()> {
        let id = id.into();
        let text = text.into();
        let embedding = self.embed_cached(kind, &text).await?;
        let entry = IndexEntry {
            id: id.clone(),
            text,
            embedding,
            category,
            tags,
            enabled,
            priority,
            updated_at: Utc::now(),
            metadata,
        };
        self.map_for(kind).write().await.insert(id, entry);
        Ok(())
    }

    /// `Remove(id)` (§4.F).
    pub async fn remove(&self, kind: IndexKind, id: &str) {
        self.map_for(kind).write().await.remove(id);
    }

    /// `Query(text, filters, k)` (§4.F) — embeds `text` then delegates to
    /// `query_by_vector`. On embedding-provider failure, degrades to an
    /// empty result set per §4.G's failure mode rather than propagating
    /// the error, so callers one level up (e.g. `AgentRuntime`) can
    /// proceed with no retrieved context.
    pub async fn query(
        &self,
        kind: IndexKind,
        text: &str,
        filters: &IndexFilters,
        k: usize,
    ) -> Vec<QueryMatch> {
        match self.embed_cached(kind, text).await {
            Ok(vec) => self.query_by_vector(kind, &vec, filters, k).await,
            Err(e) => {
                debug!(error = %e, "semantic index query degraded to empty result");
                Vec::new()
            }
        }
    }

    /// `QueryByVector(vec, filters, k)` (§4.F), used directly by the
    /// RepairLoop which already holds a failure-context embedding.
    pub async fn query_by_vector(
        &self,
        kind: IndexKind,
        vec: &Embedding,
        filters: &IndexFilters,
        k: usize,
    ) -> Vec<QueryMatch> {
        let map = self.map_for(kind).read().await;
        let mut scored: Vec<(f32, &IndexEntry)> = map
            .values()
            .filter(|e| !filters.enabled_only || e.enabled)
            .filter(|e| {
                filters
                    .category
                    .as_ref()
                    .map(|c| e.category.as_deref() == Some(c.as_str()))
                    .unwrap_or(true)
            })
            .filter(|e| {
                filters.tags.is_empty() || filters.tags.iter().all(|t| e.tags.contains(t))
            })
            .map(|e| (vec.cosine_similarity(&e.embedding), e))
            .filter(|(score, _)| filters.min_score.map(|m| *score >= m).unwrap_or(true))
            .collect();

        // Descending similarity; ties broken by descending priority, then
        // by descending updatedAt (§4.F "Ordering & tie-break").
        scored.sort_by(|(score_a, a), (score_b, b)| {
            score_b
                .partial_cmp(score_a)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.priority.cmp(&a.priority))
                .then_with(|| b.updated_at.cmp(&a.updated_at))
        });

        scored
            .into_iter()
            .take(k)
            .map(|(score, e)| QueryMatch {
                id: e.id.clone(),
                score,
                metadata: e.metadata.clone(),
            })
            .collect()
    }

    pub async fn len(&self, kind: IndexKind) -> usize {
        self.map_for(kind).read().await.len()
    }
}
