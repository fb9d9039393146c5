//! External collaborator interfaces (§6).
//!
//! Conformance means an equivalent call surface and equivalent behavior,
//! not literal type matching — these traits are the seams the core depends
//! on; concrete implementations (an embedded store, a cloud LLM client, a
//! wasmtime sandbox) live in other crates or in the integrating
//! application.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::events::AdkEvent;
use crate::model::{Embedding, EmbeddingTaskType};

/// A document-oriented, path-addressed store with a `vector` field type
/// supporting cosine-similarity querying.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, path: &str) -> Result<Option<Value>>;
    async fn set(&self, path: &str, doc: Value) -> Result<()>;
    /// Merge `patch` into the existing document at `path` (shallow,
    /// object-level merge — callers needing deep merge semantics do it
    /// client-side before calling).
    async fn update(&self, path: &str, patch: Value) -> Result<()>;
    async fn delete(&self, path: &str) -> Result<()>;
    async fn query(&self, collection: &str, filter: QueryFilter) -> Result<Vec<(String, Value)>>;
    /// Run `body` as a single atomic unit. The store serializes
    /// transactions so callers don't need external locking.
    async fn transaction(
        &self,
        body: Box<dyn FnOnce() -> Result<()> + Send>,
    ) -> Result<()>;
}

/// Filter/ordering/paging parameters for `KeyValueStore::query`.
#[derive(Debug, Clone, Default)]
pub struct QueryFilter {
    /// Equality filters on top-level document fields.
    pub where_eq: Vec<(String, Value)>,
    /// If set, rank by cosine similarity against this vector and keep only
    /// the top `limit` (used by the vector-query path).
    pub nearest_to: Option<Embedding>,
    pub min_score: Option<f32>,
    pub order_by: Option<String>,
    pub descending: bool,
    pub limit: Option<usize>,
}

/// A chat-style LLM call surface.
#[async_trait]
pub trait LLMProvider: Send + Sync {
    async fn generate_content(&self, request: GenerationRequest) -> Result<GenerationResponse>;

    /// Stream response chunks via the returned channel; the transport layer
    /// drains it. Default implementation that just forwards the
    /// non-streaming result as a single chunk is acceptable for providers
    /// without native streaming support.
    async fn stream_content(
        &self,
        request: GenerationRequest,
    ) -> Result<tokio::sync::mpsc::Receiver<String>> {
        let response = self.generate_content(request).await?;
        let (tx, rx) = tokio::sync::mpsc::channel(1);
        let _ = tx.send(response.text).await;
        Ok(rx)
    }
}

#[derive(Debug, Clone, Default)]
pub struct GenerationRequest {
    pub system_instruction: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub tools: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct GenerationResponse {
    pub text: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// The vector-embedding provider gateway.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed_one(&self, text: &str, task_type: EmbeddingTaskType) -> Result<Embedding>;
    async fn embed_many(
        &self,
        texts: &[String],
        task_type: EmbeddingTaskType,
    ) -> Result<Vec<Embedding>>;
}

/// Budget enforced on a single `Sandbox::run` call.
#[derive(Debug, Clone, Copy)]
pub struct SandboxBudget {
    pub wall_clock_ms: u64,
    pub heap_bytes: u64,
}

/// Outcome of a sandbox run. `diagnostics` is free-form, intended for
/// operator/debug logs, never shown to non-admin end users (§7).
#[derive(Debug, Clone)]
pub struct SandboxOutcome {
    pub ok: bool,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub classification: Option<crate::model::FailureCategory>,
    pub diagnostics: Vec<String>,
}

/// The isolated code-execution boundary (§9 design note: never a naive
/// "eval the template string").
#[async_trait]
pub trait Sandbox: Send + Sync {
    async fn run(
        &self,
        script_source: &str,
        params: Value,
        budget: SandboxBudget,
    ) -> Result<SandboxOutcome>;
}

/// Append-only observable event emission.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: AdkEvent);
}

impl EventSink for crate::events::EventBus {
    fn emit(&self, event: AdkEvent) {
        crate::events::EventBus::emit(self, event);
    }
}
