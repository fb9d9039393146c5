//! `TaskOrchestrator` (§4.C): accepts `TaskRequest`s, enqueues them behind a
//! bounded, fair, per-user FIFO queue, and hands them to workers.
//!
//! Grounded on `kernel::scheduler::Scheduler`'s lock-free queue/`DashMap`
//! task-table/`Notify` park-and-wake shape for the queue mechanics, and on
//! `agent::orchestrator::Orchestrator`'s submit/track/dispatch surface for
//! the public API shape — its two stub methods (`Orchestrator::execute`'s
//! hardcoded completion string and `decompose_goal`'s two hardcoded tasks)
//! are not carried over; ad-hoc template synthesis here actually calls the
//! `LLMProvider`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use adk_core::config::TaskConfig;
use adk_core::error::{AdkError, Result};
use adk_core::events::AdkEvent;
use adk_core::interfaces::{ChatMessage, EventSink, GenerationRequest, KeyValueStore, LLMProvider};
use adk_core::model::{Role, TaskRequest, TaskStatus, TaskTemplate};
use serde_json::Value;
use tokio::sync::Notify;
use tracing::{info, warn};
use uuid::Uuid;

use crate::validation::StaticValidator;

/// What `Submit` accepts: either a caller-named template, or a natural
/// language spec that must first be turned into one (§4.C "ad-hoc template
/// synthesis").
pub enum SubmitRequest {
    Templated { template_id: String, parameters: Value },
    Adhoc { natural_language_spec: String },
}

#[derive(Debug, Clone, Default)]
pub struct TaskListFilter {
    pub user_id: Option<String>,
    pub status: Option<TaskStatus>,
}

struct Inner {
    store: Arc<dyn KeyValueStore>,
    llm: Arc<dyn LLMProvider>,
    events: Arc<dyn EventSink>,
    validator: StaticValidator,
    config: TaskConfig,

    tasks: dashmap::DashMap<Uuid, TaskRequest>,
    queues: dashmap::DashMap<String, VecDeque<Uuid>>,
    user_order: Mutex<VecDeque<String>>,
    user_role: dashmap::DashMap<String, Role>,
    running_per_user: dashmap::DashMap<String, u32>,
    requeued_once: dashmap::DashMap<Uuid, bool>,
    depth: AtomicUsize,
    notify: Notify,
}

/// Accept-enqueue-dispatch control plane for complex tasks. Cheaply
/// cloneable; every clone shares the same queue and task table.
#[derive(Clone)]
pub struct TaskOrchestrator {
    inner: Arc<Inner>,
}

impl TaskOrchestrator {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        llm: Arc<dyn LLMProvider>,
        events: Arc<dyn EventSink>,
        config: TaskConfig,
    ) -> Self {
        let validator = StaticValidator::new(config.max_script_bytes);
        Self {
            inner: Arc::new(Inner {
                store,
                llm,
                events,
                validator,
                config,
                tasks: dashmap::DashMap::new(),
                queues: dashmap::DashMap::new(),
                user_order: Mutex::new(VecDeque::new()),
                user_role: dashmap::DashMap::new(),
                running_per_user: dashmap::DashMap::new(),
                requeued_once: dashmap::DashMap::new(),
                depth: AtomicUsize::new(0),
                notify: Notify::new(),
            }),
        }
    }

    pub fn validator(&self) -> &StaticValidator {
        &self.inner.validator
    }

    pub fn config(&self) -> &TaskConfig {
        &self.inner.config
    }

    pub fn events(&self) -> &Arc<dyn EventSink> {
        &self.inner.events
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.inner.store
    }

    /// `Submit(req) -> taskHandle` (§4.C).
    pub async fn submit(&self, user_id: &str, role: Role, req: SubmitRequest) -> Result<Uuid> {
        if self.inner.depth.load(Ordering::SeqCst) >= self.inner.config.queue_depth {
            return Err(AdkError::QueueFull {
                depth: self.inner.config.queue_depth,
            });
        }

        let (template_id, parameters, script) = match req {
            SubmitRequest::Templated { template_id, parameters } => {
                let template = self.load_template(&template_id).await?;
                validate_params(&template.parameter_schema, &parameters)?;
                (template_id, parameters, template.execution_script_template)
            }
            SubmitRequest::Adhoc { natural_language_spec } => {
                let (template, script) = self.synthesize_adhoc(&natural_language_spec).await?;
                let template_id = template.template_id.clone();
                self.persist_ephemeral_template(&template).await?;
                (template_id, Value::Object(Default::default()), script)
            }
        };

        let task = TaskRequest::new(template_id.clone(), user_id, role, parameters, script);
        self.persist_task(&task).await?;

        self.inner.tasks.insert(task.task_id, task.clone());
        self.inner.user_role.insert(user_id.to_string(), role);
        self.enqueue(user_id, task.task_id);
        self.inner.depth.fetch_add(1, Ordering::SeqCst);

        self.inner.events.emit(AdkEvent::TaskQueued {
            task_id: task.task_id,
            template_id,
            user_id: user_id.to_string(),
        });
        info!(task_id = %task.task_id, user_id, "task queued");
        Ok(task.task_id)
    }

    pub fn status(&self, task_id: Uuid) -> Option<TaskRequest> {
        self.inner.tasks.get(&task_id).map(|e| e.value().clone())
    }

    pub fn list(&self, filter: TaskListFilter) -> Vec<TaskRequest> {
        self.inner
            .tasks
            .iter()
            .map(|e| e.value().clone())
            .filter(|t| filter.user_id.as_deref().is_none_or(|u| u == t.user_id))
            .filter(|t| filter.status.is_none_or(|s| s == t.status))
            .collect()
    }

    /// Soft-cancel: a queued task is marked `cancelled` immediately (its id
    /// stays in the FIFO queue but `try_dequeue` skips non-`queued` tasks);
    /// a running task only has its cooperative flag flipped, observed by
    /// the worker at the next step boundary (§5 "Cancellation & timeouts").
    pub async fn cancel(&self, task_id: Uuid) -> Result<()> {
        let mut entry = self
            .inner
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| AdkError::TaskNotFound(task_id.to_string()))?;
        if entry.status.is_terminal() {
            return Ok(());
        }
        if entry.status == TaskStatus::Queued {
            self.transition(&mut entry, TaskStatus::Cancelled);
            drop(entry);
            self.persist_task(&self.status(task_id).expect("just updated")).await?;
        }
        // `running`/`repairing`: the worker owning this task polls
        // `is_cancel_requested` and transitions it itself (see worker.rs).
        Ok(())
    }

    pub fn is_cancel_requested(&self, task_id: Uuid) -> bool {
        self.inner
            .tasks
            .get(&task_id)
            .map(|t| t.status == TaskStatus::Cancelled)
            .unwrap_or(false)
    }

    /// Notify any worker parked on an empty queue that work may be
    /// available (used after `submit` and after a requeue).
    pub fn notify_workers(&self) {
        self.inner.notify.notify_waiters();
    }

    pub async fn wait_for_work(&self) {
        self.inner.notify.notified().await;
    }

    /// Pop the next eligible task id, honoring per-user concurrency caps
    /// and best-effort cross-user round robin (§4.C "Ordering guarantee").
    pub fn try_dequeue(&self) -> Option<Uuid> {
        let mut order = self.inner.user_order.lock().unwrap();
        let rounds = order.len();
        for _ in 0..rounds {
            let Some(user) = order.pop_front() else {
                break;
            };
            let cap = match self.inner.user_role.get(&user).map(|r| *r) {
                Some(Role::Admin) => self.inner.config.per_user_cap_admin,
                _ => self.inner.config.per_user_cap_user,
            };
            let running = self.inner.running_per_user.get(&user).map(|c| *c).unwrap_or(0);
            if running >= cap {
                order.push_back(user);
                continue;
            }
            let Some(mut queue) = self.inner.queues.get_mut(&user) else {
                continue;
            };
            // Skip ids whose task was soft-cancelled while still queued.
            while let Some(task_id) = queue.pop_front() {
                let still_queued = self
                    .inner
                    .tasks
                    .get(&task_id)
                    .map(|t| t.status == TaskStatus::Queued)
                    .unwrap_or(false);
                if !still_queued {
                    continue;
                }
                if !queue.is_empty() {
                    order.push_back(user);
                }
                return Some(task_id);
            }
        }
        None
    }

    pub fn mark_dispatched(&self, user_id: &str) {
        *self.inner.running_per_user.entry(user_id.to_string()).or_insert(0) += 1;
    }

    pub fn mark_finished(&self, user_id: &str) {
        if let Some(mut count) = self.inner.running_per_user.get_mut(user_id) {
            *count = count.saturating_sub(1);
        }
        self.inner.depth.fetch_sub(1, Ordering::SeqCst);
    }

    /// Transition a task's status, always emitting the implied
    /// `TaskStateChanged` event (§8 invariant 1). Callers hold the
    /// `DashMap` entry guard so the read-then-write is atomic w.r.t. other
    /// readers of this task id.
    pub fn transition(&self, entry: &mut TaskRequest, to: TaskStatus) {
        if entry.status.is_terminal() {
            warn!(task_id = %entry.task_id, "ignoring transition attempt on terminal task");
            return;
        }
        let from = entry.status;
        entry.status = to;
        match to {
            TaskStatus::Running if entry.started_at.is_none() => {
                entry.started_at = Some(chrono::Utc::now());
            }
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::TimedOut => {
                entry.finished_at = Some(chrono::Utc::now());
            }
            _ => {}
        }
        self.inner.events.emit(AdkEvent::TaskStateChanged {
            task_id: entry.task_id,
            from,
            to,
        });
    }

    pub fn update(&self, task_id: Uuid, f: impl FnOnce(&mut TaskRequest)) -> Option<TaskRequest> {
        let mut entry = self.inner.tasks.get_mut(&task_id)?;
        f(&mut entry);
        Some(entry.clone())
    }

    pub async fn persist_task(&self, task: &TaskRequest) -> Result<()> {
        let value = serde_json::to_value(task).map_err(|e| AdkError::Store(e.to_string()))?;
        self.inner.store.set(&format!("tasks/{}", task.task_id), value).await
    }

    /// A task whose heartbeat is older than `3 * heartbeatIntervalMs` is
    /// orphaned (§4.D step 6) and is requeued exactly once.
    pub async fn reap_orphans(&self) -> Result<()> {
        let threshold =
            chrono::Duration::milliseconds(3 * self.inner.config.heartbeat_interval_ms as i64);
        let now = chrono::Utc::now();
        let orphaned: Vec<Uuid> = self
            .inner
            .tasks
            .iter()
            .filter(|e| matches!(e.status, TaskStatus::Running | TaskStatus::Repairing))
            .filter(|e| {
                e.last_heartbeat_at
                    .map(|hb| now.signed_duration_since(hb) > threshold)
                    .unwrap_or(false)
            })
            .map(|e| e.task_id)
            .collect();

        for task_id in orphaned {
            if self.inner.requeued_once.insert(task_id, true).is_some() {
                // Already requeued once; force-fail instead of looping forever.
                if let Some(mut entry) = self.inner.tasks.get_mut(&task_id) {
                    self.transition(&mut entry, TaskStatus::Failed);
                    let snapshot = entry.clone();
                    drop(entry);
                    self.persist_task(&snapshot).await?;
                    self.inner.events.emit(AdkEvent::TaskFailed {
                        task_id,
                        cause: "orphaned twice without a heartbeat".to_string(),
                    });
                }
                continue;
            }
            warn!(task_id = %task_id, "task orphaned (no heartbeat), requeuing");
            if let Some(mut entry) = self.inner.tasks.get_mut(&task_id) {
                entry.status = TaskStatus::Queued;
                entry.worker_id = None;
                let user_id = entry.user_id.clone();
                drop(entry);
                self.enqueue(&user_id, task_id);
            }
        }
        self.notify_workers();
        Ok(())
    }

    fn enqueue(&self, user_id: &str, task_id: Uuid) {
        let mut queue = self.inner.queues.entry(user_id.to_string()).or_default();
        let was_empty = queue.is_empty();
        queue.push_back(task_id);
        drop(queue);
        if was_empty {
            self.inner.user_order.lock().unwrap().push_back(user_id.to_string());
        }
        self.notify_workers();
    }

    async fn load_template(&self, template_id: &str) -> Result<TaskTemplate> {
        let doc = self
            .inner
            .store
            .get(&format!("templates/{template_id}"))
            .await?
            .ok_or_else(|| AdkError::TemplateNotFound(template_id.to_string()))?;
        serde_json::from_value(doc).map_err(|e| AdkError::Store(e.to_string()))
    }

    async fn persist_ephemeral_template(&self, template: &TaskTemplate) -> Result<()> {
        let value = serde_json::to_value(template).map_err(|e| AdkError::Store(e.to_string()))?;
        self.inner
            .store
            .set(&format!("templates/{}", template.template_id), value)
            .await
    }

    /// Ad-hoc template synthesis (§4.C): prompt the LLM for a script plus
    /// parameter schema, then run it through the same static checks
    /// `TaskWorker` applies to any other script before execution.
    async fn synthesize_adhoc(&self, natural_language_spec: &str) -> Result<(TaskTemplate, String)> {
        let system_instruction = "You write a single WebAssembly Text (WAT) module implementing a \
            requested task. The module must export a zero-argument `execute` function returning \
            an i32 exit code (0 = success), and may import only the following functions from the \
            `env` module: host_log(level,ptr,len), host_set_result(ptr,len), host_get_param(key_ptr,\
            key_len,val_ptr,val_len), host_llm_generate(prompt_ptr,prompt_len,out_ptr,out_len), \
            host_http_get(url_ptr,url_len,out_ptr,out_len), host_storage_get(key_ptr,key_len,out_ptr,\
            out_len). Respond with a JSON object {\"executionScript\": \"...\", \"parameterSchema\": \
            {...}} and nothing else.";

        let response = self
            .inner
            .llm
            .generate_content(GenerationRequest {
                system_instruction: Some(system_instruction.to_string()),
                messages: vec![ChatMessage {
                    role: "user".to_string(),
                    content: natural_language_spec.to_string(),
                }],
                temperature: Some(0.1),
                max_tokens: Some(4096),
                tools: None,
            })
            .await?;

        let parsed: Value = serde_json::from_str(extract_json_block(&response.text))
            .map_err(|e| AdkError::ScriptInvalid(format!("ad-hoc synthesis returned unparseable JSON: {e}")))?;
        let script = parsed
            .get("executionScript")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AdkError::ScriptInvalid("ad-hoc synthesis response missing `executionScript`".into()))?
            .to_string();
        let parameter_schema = parsed
            .get("parameterSchema")
            .cloned()
            .unwrap_or_else(|| Value::Object(Default::default()));

        self.inner.validator.validate(&script)?;

        let template = TaskTemplate {
            template_id: format!("adhoc-{}", Uuid::now_v7()),
            name: "ad-hoc task".to_string(),
            categories: vec!["adhoc".to_string()],
            trigger_patterns: vec![],
            trigger_keywords: vec![],
            keywords: vec![],
            embedding: None,
            required_services: vec![],
            estimated_steps: None,
            estimated_duration_ms: None,
            execution_script_template: script.clone(),
            parameter_schema,
            priority: 0,
            enabled: true,
        };
        Ok((template, script))
    }
}

fn extract_json_block(text: &str) -> &str {
    if let Some(start) = text.find("```json") {
        let after = &text[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim();
        }
    }
    if let Some(start) = text.find("```") {
        let after = &text[start + 3..];
        if let Some(end) = after.find("```") {
            return after[..end].trim();
        }
    }
    text.trim()
}

/// Minimal JSON-Schema-subset `required`/`type` check, duplicated from
/// `adk-tools::dispatcher::validate_schema` rather than shared — the two
/// crates are siblings with no lower-level crate both could depend on for
/// it, matching `adk-sandbox::host`'s own SSRF-list duplication.
fn validate_params(schema: &Value, params: &Value) -> Result<()> {
    let Some(schema_obj) = schema.as_object() else {
        return Ok(());
    };
    if let Some(required) = schema_obj.get("required").and_then(|v| v.as_array()) {
        let params_obj = params.as_object();
        for req in required {
            let Some(name) = req.as_str() else { continue };
            let present = params_obj.map(|o| o.contains_key(name)).unwrap_or(false);
            if !present {
                return Err(AdkError::ScriptInvalid(format!("missing required parameter `{name}`")));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use adk_core::events::EventBus;
    use adk_core::interfaces::GenerationResponse;
    use async_trait::async_trait;
    use serde_json::json;

    struct StubLlm {
        response: String,
    }

    #[async_trait]
    impl LLMProvider for StubLlm {
        async fn generate_content(&self, _req: GenerationRequest) -> Result<GenerationResponse> {
            Ok(GenerationResponse {
                text: self.response.clone(),
                prompt_tokens: 0,
                completion_tokens: 0,
            })
        }
    }

    fn store() -> Arc<dyn KeyValueStore> {
        Arc::new(adk_store::DocumentStore::new())
    }

    fn orchestrator(llm_response: &str) -> TaskOrchestrator {
        TaskOrchestrator::new(
            store(),
            Arc::new(StubLlm { response: llm_response.to_string() }),
            Arc::new(EventBus::new(64)),
            TaskConfig::default(),
        )
    }

    async fn seed_template(o: &TaskOrchestrator, id: &str) {
        let template = TaskTemplate {
            template_id: id.to_string(),
            name: "n".into(),
            categories: vec!["x".into()],
            trigger_patterns: vec![],
            trigger_keywords: vec![],
            keywords: vec![],
            embedding: None,
            required_services: vec![],
            estimated_steps: None,
            estimated_duration_ms: None,
            execution_script_template: "(module (func (export \"execute\") (result i32) i32.const 0))".to_string(),
            parameter_schema: json!({"type": "object"}),
            priority: 0,
            enabled: true,
        };
        o.persist_ephemeral_template(&template).await.unwrap();
    }

    #[tokio::test]
    async fn submit_templated_task_enqueues_and_emits() {
        let o = orchestrator("");
        seed_template(&o, "t1").await;
        let task_id = o
            .submit(
                "u1",
                Role::User,
                SubmitRequest::Templated { template_id: "t1".into(), parameters: json!({}) },
            )
            .await
            .unwrap();
        assert!(o.status(task_id).is_some());
        assert_eq!(o.try_dequeue(), Some(task_id));
    }

    #[tokio::test]
    async fn submit_unknown_template_fails() {
        let o = orchestrator("");
        let err = o
            .submit("u1", Role::User, SubmitRequest::Templated { template_id: "missing".into(), parameters: json!({}) })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "ERR_TEMPLATE_NOT_FOUND");
    }

    #[tokio::test]
    async fn queue_full_rejects_further_submits() {
        let mut cfg = TaskConfig::default();
        cfg.queue_depth = 1;
        let o = TaskOrchestrator::new(store(), Arc::new(StubLlm { response: String::new() }), Arc::new(EventBus::new(64)), cfg);
        seed_template(&o, "t1").await;
        o.submit("u1", Role::User, SubmitRequest::Templated { template_id: "t1".into(), parameters: json!({}) })
            .await
            .unwrap();
        let err = o
            .submit("u1", Role::User, SubmitRequest::Templated { template_id: "t1".into(), parameters: json!({}) })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "ERR_QUEUE_FULL");
    }

    #[tokio::test]
    async fn round_robin_interleaves_across_users() {
        let o = orchestrator("");
        seed_template(&o, "t1").await;
        let u1a = o.submit("u1", Role::User, SubmitRequest::Templated { template_id: "t1".into(), parameters: json!({}) }).await.unwrap();
        let u1b = o.submit("u1", Role::User, SubmitRequest::Templated { template_id: "t1".into(), parameters: json!({}) }).await.unwrap();
        let u2a = o.submit("u2", Role::User, SubmitRequest::Templated { template_id: "t1".into(), parameters: json!({}) }).await.unwrap();

        assert_eq!(o.try_dequeue(), Some(u1a));
        assert_eq!(o.try_dequeue(), Some(u2a));
        assert_eq!(o.try_dequeue(), Some(u1b));
    }

    #[tokio::test]
    async fn cancel_queued_task_is_skipped_by_dequeue() {
        let o = orchestrator("");
        seed_template(&o, "t1").await;
        let task_id = o.submit("u1", Role::User, SubmitRequest::Templated { template_id: "t1".into(), parameters: json!({}) }).await.unwrap();
        o.cancel(task_id).await.unwrap();
        assert_eq!(o.status(task_id).unwrap().status, TaskStatus::Cancelled);
        assert_eq!(o.try_dequeue(), None);
    }

    #[tokio::test]
    async fn adhoc_synthesis_validates_and_persists_template() {
        let o = orchestrator(
            r#"```json
            {"executionScript": "(module (func (export \"execute\") (result i32) i32.const 0))", "parameterSchema": {"type": "object"}}
            ```"#,
        );
        let task_id = o
            .submit("admin1", Role::Admin, SubmitRequest::Adhoc { natural_language_spec: "export a csv".into() })
            .await
            .unwrap();
        assert!(o.status(task_id).is_some());
    }

    #[tokio::test]
    async fn adhoc_synthesis_rejects_invalid_script() {
        let o = orchestrator(r#"{"executionScript": "not wat", "parameterSchema": {}}"#);
        let err = o
            .submit("admin1", Role::Admin, SubmitRequest::Adhoc { natural_language_spec: "export a csv".into() })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "ERR_SCRIPT_INVALID");
    }
}
