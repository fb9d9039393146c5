//! `TaskWorker` (§4.D) — a long-lived loop that picks up queued tasks,
//! renders and executes their script under a `Sandbox`, and drives failed
//! attempts through `RepairLoop`.
//!
//! Grounded on `kernel::worker::Worker`'s pick-up/heartbeat/execute loop
//! shape, generalized from "run a named plugin to completion" to "render,
//! statically validate, sandbox-execute, and on failure repair" (§4.D
//! steps 1-6).

use std::sync::Arc;
use std::time::Duration;

use adk_core::error::AdkError;
use adk_core::events::AdkEvent;
use adk_core::interfaces::{Sandbox, SandboxBudget};
use adk_core::model::{FailureCategory, FailureRecord, TaskRequest, TaskStatus};
use chrono::Utc;
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::orchestrator::TaskOrchestrator;
use crate::repair::{RepairDecision, RepairLoop};

/// Outcome of racing a sandbox run against the cancellation grace period.
enum RunOutcome {
    Finished(adk_core::error::Result<adk_core::interfaces::SandboxOutcome>),
    /// The script kept running more than `hungGraceMs` after cancellation
    /// was requested; the worker aborted the underlying task.
    Hung,
}

pub struct TaskWorker {
    id: String,
    orchestrator: TaskOrchestrator,
    sandbox: Arc<dyn Sandbox>,
    repair_loop: Arc<RepairLoop>,
}

impl TaskWorker {
    pub fn new(
        id: impl Into<String>,
        orchestrator: TaskOrchestrator,
        sandbox: Arc<dyn Sandbox>,
        repair_loop: Arc<RepairLoop>,
    ) -> Self {
        Self { id: id.into(), orchestrator, sandbox, repair_loop }
    }

    /// Run until the returned handle is aborted. One call to `run` is one
    /// worker; the orchestrator's `config().workers` callers spawn that
    /// many of these.
    pub async fn run(&self) {
        loop {
            match self.orchestrator.try_dequeue() {
                Some(task_id) => self.process(task_id).await,
                None => self.orchestrator.wait_for_work().await,
            }
        }
    }

    async fn process(&self, task_id: Uuid) {
        let Some(picked_up) = self.orchestrator.status(task_id) else { return };
        if picked_up.status != TaskStatus::Queued {
            return;
        }
        self.orchestrator.mark_dispatched(&picked_up.user_id);

        let Some(mut current) = self.begin_running(task_id) else {
            self.orchestrator.mark_finished(&picked_up.user_id);
            return;
        };

        let heartbeat = self.spawn_heartbeat(task_id);

        loop {
            if self.orchestrator.is_cancel_requested(task_id) {
                self.finish_cancelled(task_id).await;
                break;
            }

            let budget = SandboxBudget {
                wall_clock_ms: self.orchestrator.config().wall_clock_ms,
                heap_bytes: self.orchestrator.config().heap_bytes,
            };
            let run_result = self
                .run_with_hang_grace(task_id, current.script_current.clone(), current.parameters.clone(), budget)
                .await;

            let run_result = match run_result {
                RunOutcome::Finished(r) => r,
                RunOutcome::Hung => {
                    let grace_ms = self.orchestrator.config().hung_grace_ms;
                    warn!(task_id = %task_id, grace_ms, "script ignored cancellation past grace period, force-terminated");
                    let err = AdkError::ScriptHung { grace_ms };
                    let record = FailureRecord {
                        category: FailureCategory::RuntimeError,
                        detail: err.to_string(),
                        script_snapshot: current.script_current.clone(),
                        occurred_at: Utc::now(),
                    };
                    self.orchestrator.update(task_id, |t| t.errors.push(record));
                    self.finish_terminal(task_id, TaskStatus::Failed, &err.to_string()).await;
                    break;
                }
            };

            if self.orchestrator.is_cancel_requested(task_id) {
                self.finish_cancelled(task_id).await;
                break;
            }

            let outcome = match run_result {
                Ok(o) => o,
                Err(e) => {
                    warn!(task_id = %task_id, error = %e, "sandbox invocation itself errored");
                    self.finish_failure(task_id, &format!("sandbox error: {e}")).await;
                    break;
                }
            };

            if outcome.ok {
                self.finish_success(task_id, outcome.result.unwrap_or(Value::Null)).await;
                break;
            }

            let category = outcome.classification.unwrap_or(FailureCategory::RuntimeError);
            let record = FailureRecord {
                category,
                detail: outcome.error.clone().unwrap_or_else(|| "unknown failure".to_string()),
                script_snapshot: current.script_current.clone(),
                occurred_at: Utc::now(),
            };
            self.orchestrator.update(task_id, |t| t.errors.push(record.clone()));

            let repairable = category.is_unconditionally_repairable()
                || (current.repair_count < self.orchestrator.config().max_repairs
                    && self.expected_to_reduce_work(&current, category));
            if !repairable {
                self.finish_unrepairable(
                    task_id,
                    "resource/timeout failure with no repair budget remaining, or the last patch did not shrink the script",
                )
                .await;
                break;
            }

            let orch = &self.orchestrator;
            let Some(repairing) = orch.update(task_id, |t| orch.transition(t, TaskStatus::Repairing)) else {
                break;
            };
            current = repairing;

            let original_intent = format!(
                "templateId={} parameters={}",
                current.template_id, current.parameters
            );
            let decision = self.repair_loop.repair(&current, &record, &original_intent).await;

            match decision {
                Ok(RepairDecision::Patched { new_script, used_memory_ids, accumulated_failures, repair_count }) => {
                    let orch = &self.orchestrator;
                    let Some(updated) = orch.update(task_id, |t| {
                        t.script_current = new_script.clone();
                        t.repair_count = repair_count;
                        t.errors.extend(accumulated_failures.iter().cloned());
                        for id in &used_memory_ids {
                            if !t.used_memory_ids.contains(id) {
                                t.used_memory_ids.push(*id);
                            }
                        }
                        orch.transition(t, TaskStatus::Running);
                    }) else {
                        break;
                    };
                    let _ = self.orchestrator.persist_task(&updated).await;
                    self.orchestrator.events().emit(AdkEvent::TaskRepaired {
                        task_id,
                        repair_count: updated.repair_count,
                        memory_ids: used_memory_ids,
                    });
                    info!(task_id = %task_id, repair_count = updated.repair_count, "task repaired, retrying");
                    current = updated;
                }
                Ok(RepairDecision::Unrepairable(reason)) => {
                    self.finish_unrepairable(task_id, &reason).await;
                    break;
                }
                Err(e) => {
                    self.finish_unrepairable(task_id, &e.to_string()).await;
                    break;
                }
            }
        }

        heartbeat.abort();
        self.orchestrator.mark_finished(&picked_up.user_id);
    }

    /// `timeout`/`resource_limit` failures are only unconditionally given
    /// one free pass; every failure after that must show its last repair
    /// actually shrank the script, as a proxy for "the classifier expects
    /// the next patch to reduce work" (§5). Script length is the cheapest
    /// available stand-in for an actual fuel estimate: `StaticValidator`
    /// already caps `scriptCurrent` by byte size, and smaller WAT modules
    /// have strictly fewer instructions to execute per call.
    fn expected_to_reduce_work(&self, current: &TaskRequest, category: FailureCategory) -> bool {
        let Some(prior) = current.errors.iter().rev().find(|e| e.category == category) else {
            return true;
        };
        current.script_current.len() < prior.script_snapshot.len()
    }

    /// Runs the sandbox on its own task so a hung script can be aborted
    /// rather than merely waited on. Cooperative cancellation is polled
    /// every 100ms; once `is_cancel_requested` first turns true, a
    /// `hungGraceMs` deadline is set, and the spawned task is aborted and
    /// `RunOutcome::Hung` returned if the script is still running once
    /// that deadline passes (§5 "a script that ignores cancellation for
    /// more than 30s is force-terminated").
    async fn run_with_hang_grace(
        &self,
        task_id: Uuid,
        script_source: String,
        params: Value,
        budget: SandboxBudget,
    ) -> RunOutcome {
        const POLL_INTERVAL: Duration = Duration::from_millis(100);

        let sandbox = self.sandbox.clone();
        let mut handle =
            tokio::spawn(async move { sandbox.run(&script_source, params, budget).await });
        let hung_grace_ms = self.orchestrator.config().hung_grace_ms;
        let mut grace_deadline: Option<tokio::time::Instant> = None;

        loop {
            tokio::select! {
                res = &mut handle => {
                    return match res {
                        Ok(inner) => RunOutcome::Finished(inner),
                        Err(join_err) => RunOutcome::Finished(Err(AdkError::ScriptRuntime(
                            format!("sandbox task terminated unexpectedly: {join_err}"),
                        ))),
                    };
                }
                _ = tokio::time::sleep(POLL_INTERVAL) => {
                    if self.orchestrator.is_cancel_requested(task_id) {
                        let deadline = *grace_deadline.get_or_insert_with(|| {
                            tokio::time::Instant::now() + Duration::from_millis(hung_grace_ms)
                        });
                        if tokio::time::Instant::now() >= deadline {
                            handle.abort();
                            return RunOutcome::Hung;
                        }
                    } else {
                        grace_deadline = None;
                    }
                }
            }
        }
    }

    fn begin_running(&self, task_id: Uuid) -> Option<TaskRequest> {
        let worker_id = self.id.clone();
        let orch = &self.orchestrator;
        let updated = orch.update(task_id, |t| {
            t.worker_id = Some(worker_id.clone());
            t.last_heartbeat_at = Some(Utc::now());
            orch.transition(t, TaskStatus::Running);
        })?;
        let store_clone = updated.clone();
        let orchestrator = self.orchestrator.clone();
        tokio::spawn(async move {
            let _ = orchestrator.persist_task(&store_clone).await;
        });
        Some(updated)
    }

    fn spawn_heartbeat(&self, task_id: Uuid) -> tokio::task::JoinHandle<()> {
        let orchestrator = self.orchestrator.clone();
        let interval_ms = orchestrator.config().heartbeat_interval_ms;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
            loop {
                ticker.tick().await;
                let snapshot = orchestrator.update(task_id, |t| {
                    t.last_heartbeat_at = Some(Utc::now());
                });
                match snapshot {
                    Some(t) if !t.status.is_terminal() => {
                        let _ = orchestrator.persist_task(&t).await;
                    }
                    _ => break,
                }
            }
        })
    }

    async fn finish_success(&self, task_id: Uuid, result: Value) {
        let orch = &self.orchestrator;
        let Some(updated) = orch.update(task_id, |t| {
            t.result_artifact = Some(result.clone());
            orch.transition(t, TaskStatus::Succeeded);
        }) else {
            return;
        };
        let _ = self.orchestrator.persist_task(&updated).await;
        self.orchestrator.events().emit(AdkEvent::TaskSucceeded { task_id });
        self.record_terminal_outcome(&updated, true).await;
    }

    async fn finish_failure(&self, task_id: Uuid, cause: &str) {
        self.finish_terminal(task_id, TaskStatus::Failed, cause).await;
    }

    async fn finish_unrepairable(&self, task_id: Uuid, reason: &str) {
        let cause = AdkError::Unrepairable(reason.to_string()).to_string();
        self.finish_terminal(task_id, TaskStatus::Failed, &cause).await;
    }

    async fn finish_cancelled(&self, task_id: Uuid) {
        let orch = &self.orchestrator;
        let Some(updated) = orch.update(task_id, |t| orch.transition(t, TaskStatus::Cancelled)) else {
            return;
        };
        let _ = self.orchestrator.persist_task(&updated).await;
        self.record_terminal_outcome(&updated, false).await;
    }

    async fn finish_terminal(&self, task_id: Uuid, to: TaskStatus, cause: &str) {
        let orch = &self.orchestrator;
        let Some(updated) = orch.update(task_id, |t| orch.transition(t, to)) else {
            return;
        };
        let _ = self.orchestrator.persist_task(&updated).await;
        self.orchestrator
            .events()
            .emit(AdkEvent::TaskFailed { task_id, cause: cause.to_string() });
        self.record_terminal_outcome(&updated, false).await;
    }

    /// §4.E step 8: every memory used anywhere in this task's repair
    /// history gets its counter bumped exactly once, at the task's single
    /// terminal transition — not once per repair attempt that reused it.
    async fn record_terminal_outcome(&self, task: &TaskRequest, success: bool) {
        if task.used_memory_ids.is_empty() {
            return;
        }
        if let Err(e) = self.repair_loop.record_outcome(&task.used_memory_ids, success).await {
            warn!(task_id = %task.task_id, error = %e, "failed to update reasoning memory counters");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adk_core::config::TaskConfig;
    use adk_core::events::EventBus;
    use adk_core::interfaces::{GenerationRequest, GenerationResponse, KeyValueStore, LLMProvider, SandboxOutcome};
    use adk_core::model::Role;
    use adk_semantic::{EmbeddingService, SemanticIndex};
    use adk_store::DocumentStore;
    use async_trait::async_trait;
    use serde_json::json;

    struct AlwaysSucceeds;

    #[async_trait]
    impl Sandbox for AlwaysSucceeds {
        async fn run(
            &self,
            _script_source: &str,
            _params: Value,
            _budget: SandboxBudget,
        ) -> adk_core::error::Result<SandboxOutcome> {
            Ok(SandboxOutcome { ok: true, result: Some(json!({"done": true})), error: None, classification: None, diagnostics: vec![] })
        }
    }

    struct AlwaysFails;

    #[async_trait]
    impl Sandbox for AlwaysFails {
        async fn run(
            &self,
            _script_source: &str,
            _params: Value,
            _budget: SandboxBudget,
        ) -> adk_core::error::Result<SandboxOutcome> {
            Ok(SandboxOutcome {
                ok: false,
                result: None,
                error: Some("boom".to_string()),
                classification: Some(FailureCategory::RuntimeError),
                diagnostics: vec![],
            })
        }
    }

    struct AlwaysFailsResourceLimit;

    #[async_trait]
    impl Sandbox for AlwaysFailsResourceLimit {
        async fn run(
            &self,
            _script_source: &str,
            _params: Value,
            _budget: SandboxBudget,
        ) -> adk_core::error::Result<SandboxOutcome> {
            Ok(SandboxOutcome {
                ok: false,
                result: None,
                error: Some("ran out of fuel".to_string()),
                classification: Some(FailureCategory::ResourceLimit),
                diagnostics: vec![],
            })
        }
    }

    struct HangsForever;

    #[async_trait]
    impl Sandbox for HangsForever {
        async fn run(
            &self,
            _script_source: &str,
            _params: Value,
            _budget: SandboxBudget,
        ) -> adk_core::error::Result<SandboxOutcome> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(SandboxOutcome { ok: true, result: Some(json!({"done": true})), error: None, classification: None, diagnostics: vec![] })
        }
    }

    struct NoOpLlm;

    #[async_trait]
    impl LLMProvider for NoOpLlm {
        async fn generate_content(&self, _req: GenerationRequest) -> adk_core::error::Result<GenerationResponse> {
            Ok(GenerationResponse {
                text: r#"(module (func (export "execute") (result i32) i32.const 0))"#.to_string(),
                prompt_tokens: 0,
                completion_tokens: 0,
            })
        }
    }

    fn test_setup(sandbox: Arc<dyn Sandbox>) -> (TaskOrchestrator, TaskWorker) {
        test_setup_with_config(sandbox, TaskConfig::default())
    }

    fn test_setup_with_config(sandbox: Arc<dyn Sandbox>, config: TaskConfig) -> (TaskOrchestrator, TaskWorker) {
        let store: Arc<dyn KeyValueStore> = Arc::new(DocumentStore::new());
        let events = Arc::new(EventBus::new(64));
        let llm: Arc<dyn LLMProvider> = Arc::new(NoOpLlm);
        let orchestrator = TaskOrchestrator::new(store.clone(), llm.clone(), events.clone(), config);

        let embeddings = Arc::new(EmbeddingService::new(
            Arc::new(adk_semantic::embedding_service::DeterministicProvider::default()),
            100,
            Duration::from_secs(60),
        ));
        let index = Arc::new(SemanticIndex::new(embeddings, 100, Duration::from_secs(60)));
        let validator = crate::validation::StaticValidator::new(200 * 1024);
        let repair_loop = Arc::new(RepairLoop::new(store, llm, index, validator, 3));

        let worker = TaskWorker::new("worker-1", orchestrator.clone(), sandbox, repair_loop);
        (orchestrator, worker)
    }

    async fn seed_template(o: &TaskOrchestrator, id: &str) {
        let template = adk_core::model::TaskTemplate {
            template_id: id.to_string(),
            name: "n".into(),
            categories: vec![],
            trigger_patterns: vec![],
            trigger_keywords: vec![],
            keywords: vec![],
            embedding: None,
            required_services: vec![],
            estimated_steps: None,
            estimated_duration_ms: None,
            execution_script_template: r#"(module (func (export "execute") (result i32) i32.const 0))"#.to_string(),
            parameter_schema: json!({}),
            priority: 0,
            enabled: true,
        };
        o.store().set(&format!("templates/{id}"), serde_json::to_value(&template).unwrap()).await.unwrap();
    }

    #[tokio::test]
    async fn successful_run_transitions_to_succeeded() {
        let (orchestrator, worker) = test_setup(Arc::new(AlwaysSucceeds));
        seed_template(&orchestrator, "t1").await;
        let task_id = orchestrator
            .submit("u1", Role::User, crate::orchestrator::SubmitRequest::Templated { template_id: "t1".into(), parameters: json!({}) })
            .await
            .unwrap();

        worker.process(task_id).await;

        let task = orchestrator.status(task_id).unwrap();
        assert_eq!(task.status, TaskStatus::Succeeded);
        assert_eq!(task.result_artifact.unwrap()["done"], true);
    }

    #[tokio::test]
    async fn persistent_failure_exhausts_repair_budget_and_fails() {
        let (orchestrator, worker) = test_setup(Arc::new(AlwaysFails));
        seed_template(&orchestrator, "t1").await;
        let task_id = orchestrator
            .submit("u1", Role::User, crate::orchestrator::SubmitRequest::Templated { template_id: "t1".into(), parameters: json!({}) })
            .await
            .unwrap();

        worker.process(task_id).await;

        let task = orchestrator.status(task_id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.repair_count, 3);
    }

    #[tokio::test]
    async fn cancelled_before_dispatch_is_skipped() {
        let (orchestrator, worker) = test_setup(Arc::new(AlwaysSucceeds));
        seed_template(&orchestrator, "t1").await;
        let task_id = orchestrator
            .submit("u1", Role::User, crate::orchestrator::SubmitRequest::Templated { template_id: "t1".into(), parameters: json!({}) })
            .await
            .unwrap();
        orchestrator.cancel(task_id).await.unwrap();

        worker.process(task_id).await;

        let task = orchestrator.status(task_id).unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn hung_script_is_force_terminated_past_grace_period() {
        let mut config = TaskConfig::default();
        config.hung_grace_ms = 50;
        let (orchestrator, worker) = test_setup_with_config(Arc::new(HangsForever), config);
        seed_template(&orchestrator, "t1").await;
        let task_id = orchestrator
            .submit("u1", Role::User, crate::orchestrator::SubmitRequest::Templated { template_id: "t1".into(), parameters: json!({}) })
            .await
            .unwrap();

        let o = orchestrator.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            o.update(task_id, |t| t.status = TaskStatus::Cancelled);
        });

        tokio::time::timeout(Duration::from_secs(2), worker.process(task_id))
            .await
            .expect("worker must force-terminate the hung script within the test timeout");

        let task = orchestrator.status(task_id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.errors.iter().any(|e| e.detail.contains("ERR_SCRIPT_HUNG")));
    }

    #[tokio::test]
    async fn resource_limit_failure_blocked_once_patch_fails_to_shrink_script() {
        let (orchestrator, worker) = test_setup(Arc::new(AlwaysFailsResourceLimit));
        seed_template(&orchestrator, "t1").await;
        let task_id = orchestrator
            .submit("u1", Role::User, crate::orchestrator::SubmitRequest::Templated { template_id: "t1".into(), parameters: json!({}) })
            .await
            .unwrap();

        worker.process(task_id).await;

        let task = orchestrator.status(task_id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(
            task.repair_count, 1,
            "the first resource_limit failure gets one free repair attempt; the second is blocked \
             because `NoOpLlm`'s patch is the same length as the script it replaced"
        );
    }
}
