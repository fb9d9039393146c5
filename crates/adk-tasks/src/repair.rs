//! `RepairLoop` — ReasoningMemory-backed self-repair (§4.E).
//!
//! Grounded on `agent::executor::Executor`'s retry-with-backoff shape,
//! generalized from "retry the same call N times" to "ask the LLM for a
//! better script, informed by similar past fixes, up to `maxRepairs`
//! times"; the memory retrieval/ranking itself is grounded on
//! `adk_semantic::index::SemanticIndex`'s `QueryByVector` path, which its
//! own test suite already names as the repair-loop entry point.

use std::sync::Arc;

use adk_core::error::Result;
use adk_core::interfaces::{ChatMessage, GenerationRequest, KeyValueStore, LLMProvider};
use adk_core::model::{FailureCategory, FailureRecord, ReasoningMemory, TaskRequest};
use adk_semantic::{IndexFilters, IndexKind, SemanticIndex};
use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::validation::StaticValidator;

/// How many candidate memories are retrieved before re-ranking (§4.E step
/// 3 default).
const RETRIEVE_K: usize = 5;

pub enum RepairDecision {
    /// A new, statically-valid `scriptCurrent` to try, the memory ids
    /// consulted while producing it (for §4.E step 8 bookkeeping), the
    /// failure records accumulated by any statically-invalid patches tried
    /// along the way (§4.E step 6 "accumulate failure record"), and the
    /// task's new absolute `repair_count` — each invalid patch is itself a
    /// repair attempt and has already been charged against it.
    Patched {
        new_script: String,
        used_memory_ids: Vec<Uuid>,
        accumulated_failures: Vec<FailureRecord>,
        repair_count: u32,
    },
    /// The task cannot be repaired further; the caller should transition
    /// it to `failed` with this cause.
    Unrepairable(String),
}

pub struct RepairLoop {
    store: Arc<dyn KeyValueStore>,
    llm: Arc<dyn LLMProvider>,
    index: Arc<SemanticIndex>,
    validator: StaticValidator,
    max_repairs: u32,
}

impl RepairLoop {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        llm: Arc<dyn LLMProvider>,
        index: Arc<SemanticIndex>,
        validator: StaticValidator,
        max_repairs: u32,
    ) -> Self {
        Self { store, llm, index, validator, max_repairs }
    }

    /// Run the full §4.E algorithm for one worker-observed failure.
    /// `original_intent` is the best available proxy for "why this task
    /// was submitted" — `TaskRequest` carries no free-text intent field,
    /// so callers pass `templateId` plus the serialized `parameters`.
    ///
    /// Every synthesis attempt — including a re-synthesis triggered by a
    /// patch that itself fails static validation (step 6 "loop to step
    /// 1") — consumes one unit of `maxRepairs` and re-checks the budget
    /// before trying again; `MAX_REPAIRS` bounds the *total* number of
    /// LLM-driven patches a task may receive, not just the number that
    /// make it past the sandbox.
    pub async fn repair(
        &self,
        task: &TaskRequest,
        failure: &FailureRecord,
        original_intent: &str,
    ) -> Result<RepairDecision> {
        let mut repair_count = task.repair_count;
        let mut current_failure = failure.clone();
        let mut accumulated_failures = Vec::new();
        let mut used_memory_ids = Vec::new();

        loop {
            // Step 1: budget check, re-run before every synthesis attempt.
            if repair_count >= self.max_repairs {
                return Ok(RepairDecision::Unrepairable("budget_exhausted".to_string()));
            }

            // Steps 2-4: embed the failure context, retrieve, rank.
            let ranked = self.retrieve_ranked_memories(&current_failure, task, original_intent).await?;
            for id in ranked.iter().map(|m| m.id) {
                if !used_memory_ids.contains(&id) {
                    used_memory_ids.push(id);
                }
            }

            // Step 5: prompt. Step 6: re-validate.
            let patch = self.prompt_llm(task, &current_failure, &ranked).await?;
            repair_count += 1;
            match self.validator.validate(&patch) {
                Ok(()) => {
                    info!(task_id = %task.task_id, repair_count, "repair produced a statically valid patch");
                    return Ok(RepairDecision::Patched {
                        new_script: patch,
                        used_memory_ids,
                        accumulated_failures,
                        repair_count,
                    });
                }
                Err(e) => {
                    warn!(task_id = %task.task_id, repair_count, error = %e, "repair patch failed static validation, retrying");
                    current_failure = FailureRecord {
                        category: FailureCategory::ValidationError,
                        detail: e.to_string(),
                        script_snapshot: patch,
                        occurred_at: Utc::now(),
                    };
                    accumulated_failures.push(current_failure.clone());
                    // loop back to step 1
                }
            }
        }
    }

    /// §4.E step 8: on the task's terminal outcome, update every memory
    /// used anywhere in its repair history exactly once each.
    pub async fn record_outcome(&self, memory_ids: &[Uuid], success: bool) -> Result<()> {
        for id in memory_ids {
            let path = format!("memories/{id}");
            let Some(doc) = self.store.get(&path).await? else {
                continue;
            };
            let mut memory: ReasoningMemory = serde_json::from_value(doc).map_err(|e| {
                adk_core::error::AdkError::Store(format!("decoding reasoning memory {id}: {e}"))
            })?;
            if success {
                memory.times_used_in_success += 1;
            } else {
                memory.times_used_in_failure += 1;
            }
            let value = serde_json::to_value(&memory)
                .map_err(|e| adk_core::error::AdkError::Store(e.to_string()))?;
            self.store.set(&path, value).await?;
        }
        Ok(())
    }

    async fn retrieve_ranked_memories(
        &self,
        failure: &FailureRecord,
        task: &TaskRequest,
        original_intent: &str,
    ) -> Result<Vec<ReasoningMemory>> {
        let excerpt: String = task.script_current.chars().take(500).collect();
        let failure_context = format!(
            "category={:?} detail={} script_excerpt={excerpt} intent={original_intent}",
            failure.category, failure.detail,
        );

        let compatible = failure.category.compatible_memory_categories();
        let matches = self
            .index
            .query(IndexKind::Memory, &failure_context, &IndexFilters::default(), RETRIEVE_K * 4)
            .await;

        let mut ranked: Vec<(f64, ReasoningMemory)> = Vec::new();
        for m in matches {
            let Some(doc) = self.store.get(&format!("memories/{}", m.id)).await? else {
                continue;
            };
            let memory: ReasoningMemory = serde_json::from_value(doc).map_err(|e| {
                adk_core::error::AdkError::Store(format!("decoding reasoning memory {}: {e}", m.id))
            })?;
            if !compatible.contains(&memory.category) {
                continue;
            }
            let success_rate = memory.success_rate().unwrap_or(0.5);
            let rank_score = 0.7 * m.score as f64 + 0.3 * success_rate;
            ranked.push((rank_score, memory));
        }

        ranked.sort_by(|(score_a, mem_a), (score_b, mem_b)| {
            score_b
                .partial_cmp(score_a)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| mem_b.times_used_in_success.cmp(&mem_a.times_used_in_success))
        });
        ranked.truncate(RETRIEVE_K);

        for (_, memory) in &mut ranked {
            memory.times_retrieved += 1;
            let value = serde_json::to_value(&*memory)
                .map_err(|e| adk_core::error::AdkError::Store(e.to_string()))?;
            self.store.set(&format!("memories/{}", memory.id), value).await?;
        }

        Ok(ranked.into_iter().map(|(_, m)| m).collect())
    }

    async fn prompt_llm(
        &self,
        task: &TaskRequest,
        failure: &FailureRecord,
        memories: &[ReasoningMemory],
    ) -> Result<String> {
        let patch_sketches: String = memories
            .iter()
            .map(|m| format!("- ({:?}) {}", m.category, m.patch_sketch))
            .collect::<Vec<_>>()
            .join("\n");

        let system_instruction = "You repair a single WebAssembly Text (WAT) module so it no \
            longer fails the way described. Respond with only the corrected module source, no \
            commentary, no code fences. The module must still export a zero-argument `execute` \
            function returning an i32 exit code, and may import only `host_log`, \
            `host_set_result`, `host_get_param`, `host_llm_generate`, `host_http_get`, and \
            `host_storage_get` from the `env` module.";

        let user_message = format!(
            "Failing script:\n{}\n\nFailure category: {:?}\nFailure detail: {}\n\nRelevant past fixes:\n{}",
            task.script_current, failure.category, failure.detail, patch_sketches,
        );

        let response = self
            .llm
            .generate_content(GenerationRequest {
                system_instruction: Some(system_instruction.to_string()),
                messages: vec![ChatMessage { role: "user".to_string(), content: user_message }],
                temperature: Some(0.1),
                max_tokens: Some(4096),
                tools: None,
            })
            .await?;

        Ok(extract_script(&response.text))
    }
}

fn extract_script(text: &str) -> String {
    if let Some(start) = text.find("```") {
        let after = &text[start + 3..];
        let after = after.strip_prefix("wat\n").or_else(|| after.strip_prefix("\n")).unwrap_or(after);
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }
    text.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use adk_core::model::{Embedding, ReasoningMemoryCategory, Role, TaskStatus, EMBEDDING_DIM};
    use adk_semantic::EmbeddingService;
    use adk_store::DocumentStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    struct StubEmbeddingProvider;

    #[async_trait]
    impl adk_core::interfaces::EmbeddingProvider for StubEmbeddingProvider {
        async fn embed_one(
            &self,
            text: &str,
            _task_type: adk_core::model::EmbeddingTaskType,
        ) -> Result<Embedding> {
            let mut v = vec![0.0f32; EMBEDDING_DIM];
            for (i, b) in text.bytes().enumerate() {
                v[i % EMBEDDING_DIM] += b as f32;
            }
            Ok(Embedding::new(v).unwrap())
        }

        async fn embed_many(
            &self,
            texts: &[String],
            task_type: adk_core::model::EmbeddingTaskType,
        ) -> Result<Vec<Embedding>> {
            let mut out = Vec::new();
            for t in texts {
                out.push(self.embed_one(t, task_type).await?);
            }
            Ok(out)
        }
    }

    /// Unused by either test below (both return before or never reach the
    /// LLM call), but every `RepairLoop` needs an `LLMProvider` to
    /// construct.
    struct UnreachableLlm;

    #[async_trait]
    impl LLMProvider for UnreachableLlm {
        async fn generate_content(
            &self,
            _req: GenerationRequest,
        ) -> Result<adk_core::interfaces::GenerationResponse> {
            unreachable!("test scenarios below never prompt the LLM")
        }
    }

    fn make_validator() -> StaticValidator {
        StaticValidator::new(200 * 1024)
    }

    async fn seed_memory(
        store: &Arc<DocumentStore>,
        index: &SemanticIndex,
        id: Uuid,
        category: ReasoningMemoryCategory,
        patch_sketch: &str,
        times_success: u64,
        times_failure: u64,
    ) {
        let memory = ReasoningMemory {
            id,
            title: "t".into(),
            description: "d".into(),
            category,
            source: "repair_loop".into(),
            context_embedding: None,
            patch_sketch: patch_sketch.into(),
            created_at: Utc::now(),
            times_retrieved: 0,
            times_used_in_success: times_success,
            times_used_in_failure: times_failure,
        };
        store
            .set(&format!("memories/{id}"), serde_json::to_value(&memory).unwrap())
            .await
            .unwrap();
        index
            .add_or_update(
                IndexKind::Memory,
                id.to_string(),
                format!("category={:?} detail={}", category, patch_sketch),
                None,
                vec![],
                true,
                0,
                json!({}),
            )
            .await
            .unwrap();
    }

    fn task() -> TaskRequest {
        let mut t = TaskRequest::new("t1", "u1", Role::User, json!({}), "(module)".to_string());
        t.status = TaskStatus::Repairing;
        t
    }

    #[tokio::test]
    async fn budget_exhausted_when_repair_count_at_cap() {
        let store: Arc<dyn KeyValueStore> = Arc::new(DocumentStore::new());
        let embeddings = Arc::new(EmbeddingService::new(Arc::new(StubEmbeddingProvider), 100, Duration::from_secs(60)));
        let index = Arc::new(SemanticIndex::new(embeddings, 100, Duration::from_secs(60)));
        let llm: Arc<dyn LLMProvider> = Arc::new(UnreachableLlm);
        let repair = RepairLoop::new(store, llm, index, make_validator(), 3);

        let mut t = task();
        t.repair_count = 3;
        let failure = FailureRecord {
            category: FailureCategory::RuntimeError,
            detail: "division by zero".into(),
            script_snapshot: t.script_current.clone(),
            occurred_at: Utc::now(),
        };
        let decision = repair.repair(&t, &failure, "t1 {}").await.unwrap();
        match decision {
            RepairDecision::Unrepairable(reason) => assert_eq!(reason, "budget_exhausted"),
            _ => panic!("expected unrepairable"),
        }
    }

    /// An LLM stub whose every response fails static validation, so each
    /// call to `repair()` internally re-synthesizes until the budget check
    /// (§4.E step 1) stops it — never past `max_repairs` total attempts.
    struct AlwaysInvalidLlm {
        calls: std::sync::atomic::AtomicU32,
    }

    #[async_trait]
    impl LLMProvider for AlwaysInvalidLlm {
        async fn generate_content(
            &self,
            _req: GenerationRequest,
        ) -> Result<adk_core::interfaces::GenerationResponse> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(adk_core::interfaces::GenerationResponse {
                text: "not valid wat or wasm".to_string(),
                prompt_tokens: 0,
                completion_tokens: 0,
            })
        }
    }

    #[tokio::test]
    async fn invalid_patches_consume_budget_and_stop_at_max_repairs() {
        let store: Arc<dyn KeyValueStore> = Arc::new(DocumentStore::new());
        let embeddings = Arc::new(EmbeddingService::new(Arc::new(StubEmbeddingProvider), 100, Duration::from_secs(60)));
        let index = Arc::new(SemanticIndex::new(embeddings, 100, Duration::from_secs(60)));
        let llm = Arc::new(AlwaysInvalidLlm { calls: std::sync::atomic::AtomicU32::new(0) });
        let max_repairs = 2;
        let repair = RepairLoop::new(store, llm.clone() as Arc<dyn LLMProvider>, index, make_validator(), max_repairs);

        let t = task();
        let failure = FailureRecord {
            category: FailureCategory::RuntimeError,
            detail: "division by zero".into(),
            script_snapshot: t.script_current.clone(),
            occurred_at: Utc::now(),
        };
        let decision = repair.repair(&t, &failure, "t1 {}").await.unwrap();
        match decision {
            RepairDecision::Unrepairable(reason) => assert_eq!(reason, "budget_exhausted"),
            _ => panic!("expected unrepairable once every attempt is a statically-invalid patch"),
        }
        // Exactly `max_repairs` LLM calls: each invalid patch is a repair
        // attempt that must itself be charged against the budget, not an
        // independent retry bound layered on top of it.
        assert_eq!(llm.calls.load(std::sync::atomic::Ordering::SeqCst), max_repairs);
    }

    #[tokio::test]
    async fn record_outcome_increments_only_targeted_memories() {
        let store: Arc<DocumentStore> = Arc::new(DocumentStore::new());
        let embeddings = Arc::new(EmbeddingService::new(Arc::new(StubEmbeddingProvider), 100, Duration::from_secs(60)));
        let index = Arc::new(SemanticIndex::new(embeddings, 100, Duration::from_secs(60)));
        let id = Uuid::now_v7();
        seed_memory(&store, &index, id, ReasoningMemoryCategory::RuntimeError, "guard against zero denominator", 0, 0).await;

        let llm: Arc<dyn LLMProvider> = Arc::new(UnreachableLlm);
        let repair = RepairLoop::new(store.clone() as Arc<dyn KeyValueStore>, llm, index, make_validator(), 3);

        repair.record_outcome(&[id], true).await.unwrap();
        let doc = store.get(&format!("memories/{id}")).await.unwrap().unwrap();
        let memory: ReasoningMemory = serde_json::from_value(doc).unwrap();
        assert_eq!(memory.times_used_in_success, 1);
        assert_eq!(memory.times_used_in_failure, 0);
    }
}
