//! `AgentRuntime::handle` (§4.A): the single per-message entry point.
//!
//! Grounded on `agent::runtime::react_loop`'s turn-loop shape (system
//! prompt + history, call the LLM, branch on tool calls vs. final text,
//! feed results back) and on `agent::planner::Planner::plan` for the
//! retrieve-then-prompt-then-parse structure, with two deliberate
//! corrections the spec calls for: tool calls within one plan run strictly
//! sequentially rather than via `tokio::spawn` fan-out (§5), and the plan
//! shape is a closed four-variant enum ([`crate::plan::Plan`]) rather than
//! an open-ended JSON document (§9 "Dynamic plan shapes").

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{error, info, warn};
use uuid::Uuid;

use adk_core::config::{PlanConfig, RetrievalConfig};
use adk_core::error::{AdkError, Result};
use adk_core::interfaces::{
    ChatMessage, EventSink, GenerationRequest, KeyValueStore, LLMProvider, QueryFilter,
};
use adk_core::model::{
    ConversationRole, ConversationTurn, ReasoningMemory, ReasoningMemoryCategory, Role, TaskTemplate,
};
use adk_core::sanitize::{sanitize, ContextType};
use adk_semantic::{IndexFilters, IndexKind, SemanticIndex};
use adk_tasks::{SubmitRequest, TaskOrchestrator, TemplateTriggerIndex};
use adk_tools::dispatcher::InvokeContext;
use adk_tools::{Dispatcher, ToolRegistry};

use crate::conversation::ConversationStore;
use crate::plan::{parse_plan, Plan, PlannedToolCall};

const SAFE_APOLOGY: &str =
    "I'm sorry, I wasn't able to work out a plan for that request. Could you try rephrasing it?";

/// Carries the deadline/cancellation signal every entry point is specified
/// to take (§5), kept minimal since `Handle` has no streaming transport of
/// its own to wire up.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub cancelled: Option<Arc<std::sync::atomic::AtomicBool>>,
}

impl RequestContext {
    fn invoke_ctx(&self) -> InvokeContext {
        InvokeContext {
            cancelled: self.cancelled.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HandleRequest {
    pub user_id: String,
    pub role: Role,
    pub conversation_id: String,
    pub message: String,
    /// Carried through only for logging/metrics bucketing; the core has no
    /// platform-specific behavior (§1 scope).
    pub platform_hint: Option<String>,
}

/// What `Handle` produces: either a final answer, or an acknowledgement
/// that a complex task was submitted to the orchestrator.
#[derive(Debug, Clone)]
pub enum HandleResponse {
    Answer { text: String },
    TaskSubmitted { task_id: Uuid, acknowledgement: String },
}

/// Per-message orchestrator (§4.A). Pure coordination: every actual
/// decision is made by the LLM or delegated to one of the other
/// components; `AgentRuntime` itself holds no business logic.
pub struct AgentRuntime {
    llm: Arc<dyn LLMProvider>,
    store: Arc<dyn KeyValueStore>,
    events: Arc<dyn EventSink>,
    semantic: Arc<SemanticIndex>,
    tools: ToolRegistry,
    dispatcher: Arc<Dispatcher>,
    orchestrator: Arc<TaskOrchestrator>,
    conversations: ConversationStore,
    plan_config: PlanConfig,
    retrieval_config: RetrievalConfig,
}

impl AgentRuntime {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        llm: Arc<dyn LLMProvider>,
        store: Arc<dyn KeyValueStore>,
        events: Arc<dyn EventSink>,
        semantic: Arc<SemanticIndex>,
        tools: ToolRegistry,
        dispatcher: Arc<Dispatcher>,
        orchestrator: Arc<TaskOrchestrator>,
        plan_config: PlanConfig,
        retrieval_config: RetrievalConfig,
    ) -> Self {
        Self {
            llm,
            store,
            events,
            semantic,
            tools,
            dispatcher,
            orchestrator,
            conversations: ConversationStore::new(),
            plan_config,
            retrieval_config,
        }
    }

    /// `Handle(ctx, req)` (§4.A).
    pub async fn handle(&self, ctx: &RequestContext, req: HandleRequest) -> Result<HandleResponse> {
        // Step 1: sanitize.
        let message = sanitize(&req.message, ContextType::ChatTurn);

        // Step 2: load conversation window, holding the lock for the rest
        // of this call so concurrent `Handle`s against the same
        // `conversationId` serialize here (§4.A concurrency contract).
        let conv_guard = self.conversations.lock(&req.conversation_id).await;
        let mut conv = conv_guard.guard().await;
        conv.push(ConversationTurn {
            role: ConversationRole::User,
            content: message.clone(),
        });

        // Step 3: retrieve.
        let retrieved = self.retrieve(&message, req.role).await;

        // Step 4/5: plan then act, looping on tool-call turns.
        let outcome = self.plan_and_act(ctx, &req, &retrieved, &conv).await;

        let response = match outcome {
            Ok(PlanOutcome::Answer(text)) => HandleResponse::Answer { text },
            Ok(PlanOutcome::TaskSubmitted { task_id, acknowledgement }) => {
                HandleResponse::TaskSubmitted { task_id, acknowledgement }
            }
            Err(AdkError::LlmUnparseablePlan(reason)) => {
                warn!(reason = %reason, conversation_id = %req.conversation_id, "plan unparseable after reformat retry, falling back to apology");
                HandleResponse::Answer { text: SAFE_APOLOGY.to_string() }
            }
            Err(e) => return Err(e),
        };

        // Step 6: persist the final assistant turn.
        let assistant_text = match &response {
            HandleResponse::Answer { text } => text.clone(),
            HandleResponse::TaskSubmitted { acknowledgement, .. } => acknowledgement.clone(),
        };
        conv.push(ConversationTurn {
            role: ConversationRole::Assistant,
            content: assistant_text,
        });

        Ok(response)
    }

    /// Retrieval step (§4.A step 3): top-k knowledge, top-n role-filtered
    /// candidate tools, top-m candidate templates. Retrieval failures
    /// degrade to empty context rather than aborting the request — the
    /// `SemanticIndex` itself already degrades embedding failures to an
    /// empty match list (§4.G), so this layer only needs to carry that
    /// degradation through to the prompt.
    async fn retrieve(&self, message: &str, role: Role) -> RetrievedContext {
        let knowledge = self
            .semantic
            .query(
                IndexKind::Knowledge,
                message,
                &IndexFilters { enabled_only: true, ..Default::default() },
                self.retrieval_config.k,
            )
            .await;

        let tool_matches = self
            .semantic
            .query(
                IndexKind::Tool,
                message,
                &IndexFilters {
                    enabled_only: true,
                    min_score: Some(self.retrieval_config.sim_threshold),
                    ..Default::default()
                },
                self.retrieval_config.n,
            )
            .await;
        // Intersect with the role-visible set by name so RBAC soundness
        // never depends on the semantic index alone (§8 invariant 2) — the
        // index only knows about `enabled`, not about role ACLs.
        let visible = self.tools.list_visible_to(role);
        let candidate_tools: Vec<_> = tool_matches
            .into_iter()
            .filter_map(|m| visible.iter().find(|t| t.name() == m.id).cloned())
            .collect();

        let templates = self
            .semantic
            .query(
                IndexKind::Template,
                message,
                &IndexFilters { enabled_only: true, ..Default::default() },
                self.retrieval_config.m,
            )
            .await;
        let mut template_docs: Vec<Value> = templates.into_iter().map(|m| m.metadata).collect();

        // Regex/keyword trigger candidates augment the semantic list rather
        // than gating it (Open Question 1, `DESIGN.md`) — a template the
        // embedding missed but whose trigger phrase literally appears in the
        // message still reaches the planner's candidate list.
        for (id, doc) in self.trigger_matched_templates(message).await {
            let already_present = template_docs
                .iter()
                .any(|d| d.get("template_id").and_then(Value::as_str) == Some(id.as_str()));
            if !already_present {
                template_docs.push(doc);
            }
        }

        RetrievedContext {
            knowledge: knowledge.into_iter().map(|m| m.metadata).collect(),
            tools: candidate_tools,
            templates: template_docs,
        }
    }

    /// Loads every enabled `TaskTemplate` from the store and matches
    /// `message` against their `trigger_keywords`/`trigger_patterns`
    /// (§3). Store failures degrade to no trigger candidates, matching
    /// `retrieve`'s overall "never abort on retrieval failure" stance.
    async fn trigger_matched_templates(&self, message: &str) -> Vec<(String, Value)> {
        let rows = match self.store.query("templates", QueryFilter::default()).await {
            Ok(rows) => rows,
            Err(err) => {
                warn!(error = %err, "failed to load templates for trigger matching");
                return Vec::new();
            }
        };

        let mut templates = Vec::with_capacity(rows.len());
        let mut docs_by_id = std::collections::HashMap::with_capacity(rows.len());
        for (_, doc) in rows {
            if let Ok(template) = serde_json::from_value::<TaskTemplate>(doc.clone()) {
                docs_by_id.insert(template.template_id.clone(), doc);
                templates.push(template);
            }
        }

        TemplateTriggerIndex::build(&templates)
            .match_candidates(message)
            .into_iter()
            .filter_map(|id| docs_by_id.get(&id).cloned().map(|doc| (id, doc)))
            .collect()
    }

    /// Steps 4 and 5 combined: obtain a plan, then act on it, looping while
    /// the plan keeps coming back as `tool_calls` (§4.A state machine).
    async fn plan_and_act(
        &self,
        ctx: &RequestContext,
        req: &HandleRequest,
        retrieved: &RetrievedContext,
        conv: &adk_core::model::ConversationContext,
    ) -> Result<PlanOutcome> {
        let mut degraded_tools: Vec<String> = Vec::new();
        let mut tool_feedback: Option<String> = None;
        // Counts `planning -> acting_tool` transitions specifically (§4.A
        // state machine), not every planning turn — a turn that resolves
        // straight to `answer`/`complex_task*` never visits `acting_tool`.
        let mut acting_tool_visits: u32 = 0;

        loop {
            let plan = self
                .obtain_plan(req, retrieved, conv, tool_feedback.as_deref())
                .await?;

            match plan {
                Plan::Answer { text } => {
                    if !degraded_tools.is_empty() {
                        return Ok(PlanOutcome::Answer(annotate_degradation(&text, &degraded_tools)));
                    }
                    return Ok(PlanOutcome::Answer(text));
                }
                Plan::ToolCalls { calls } => {
                    if acting_tool_visits == self.plan_config.loop_cap {
                        error!(conversation_id = %req.conversation_id, cap = self.plan_config.loop_cap, "plan_loop_exhausted");
                        return Err(AdkError::PlanLoopExhausted { cap: self.plan_config.loop_cap });
                    }
                    acting_tool_visits += 1;
                    let (feedback, failures) = self.run_tool_calls(ctx, req, calls).await;
                    degraded_tools.extend(failures);
                    tool_feedback = Some(feedback);
                    // loop again: feed the tool outcomes into the next planning turn.
                }
                Plan::ComplexTask { template_id, parameters } => {
                    let task_id = self
                        .orchestrator
                        .submit(&req.user_id, req.role, SubmitRequest::Templated { template_id, parameters })
                        .await?;
                    return Ok(PlanOutcome::TaskSubmitted {
                        task_id,
                        acknowledgement: format!(
                            "I've started that task for you (id {task_id}); I'll let you know once it's done."
                        ),
                    });
                }
                Plan::ComplexTaskAdhoc { natural_language_spec } => {
                    let spec = sanitize(&natural_language_spec, ContextType::TaskDescription);
                    let task_id = self
                        .orchestrator
                        .submit(&req.user_id, req.role, SubmitRequest::Adhoc { natural_language_spec: spec })
                        .await?;
                    return Ok(PlanOutcome::TaskSubmitted {
                        task_id,
                        acknowledgement: format!(
                            "I've started that task for you (id {task_id}); I'll let you know once it's done."
                        ),
                    });
                }
            }
        }
    }

    /// Invoke one planning turn, with the single reformat retry the spec
    /// requires before giving up (§4.A "Failures").
    async fn obtain_plan(
        &self,
        req: &HandleRequest,
        retrieved: &RetrievedContext,
        conv: &adk_core::model::ConversationContext,
        tool_feedback: Option<&str>,
    ) -> Result<Plan> {
        let system_prompt = self.build_system_prompt(req.role, retrieved);
        let user_prompt = self.build_user_prompt(conv, tool_feedback);

        let response = self
            .llm
            .generate_content(GenerationRequest {
                system_instruction: Some(system_prompt.clone()),
                messages: vec![ChatMessage { role: "user".to_string(), content: user_prompt.clone() }],
                temperature: Some(0.0),
                max_tokens: Some(2048),
                tools: None,
            })
            .await
            .map_err(|e| AdkError::Llm(e.to_string()))?;

        match parse_plan(&response.text) {
            Ok(plan) => Ok(plan),
            Err(first_err) => {
                info!(error = %first_err, "plan unparseable, asking once for reformatting");
                let retry_prompt = format!(
                    "{user_prompt}\n\nYour previous response could not be parsed as JSON matching one of the expected shapes (error: {first_err}). Respond again with exactly one JSON object, no surrounding prose or code fences."
                );
                let retry = self
                    .llm
                    .generate_content(GenerationRequest {
                        system_instruction: Some(system_prompt),
                        messages: vec![ChatMessage { role: "user".to_string(), content: retry_prompt }],
                        temperature: Some(0.0),
                        max_tokens: Some(2048),
                        tools: None,
                    })
                    .await
                    .map_err(|e| AdkError::Llm(e.to_string()))?;
                parse_plan(&retry.text)
            }
        }
    }

    fn build_system_prompt(&self, role: Role, retrieved: &RetrievedContext) -> String {
        let mut prompt = String::from(
            "You are the planning core of an agent. Given the conversation so far, decide on exactly one next action and respond with a single JSON object, no markdown code fences, matching one of:\n\
             {\"type\": \"answer\", \"text\": string}\n\
             {\"type\": \"tool_calls\", \"calls\": [{\"tool_name\": string, \"arguments\": object}]}\n\
             {\"type\": \"complex_task\", \"templateId\": string, \"parameters\": object}\n\
             {\"type\": \"complex_task_adhoc\", \"naturalLanguageSpec\": string}\n\n",
        );

        if !retrieved.knowledge.is_empty() {
            prompt.push_str("Relevant knowledge:\n");
            for k in &retrieved.knowledge {
                prompt.push_str(&format!("- {k}\n"));
            }
            prompt.push('\n');
        }

        if retrieved.tools.is_empty() {
            prompt.push_str("No tools are available to this user.\n\n");
        } else {
            prompt.push_str(&format!("Tools available to role {role:?}:\n"));
            for tool in &retrieved.tools {
                prompt.push_str(&format!(
                    "- {}: {} (arguments schema: {})\n",
                    tool.name(),
                    tool.description(),
                    tool.parameter_schema()
                ));
            }
            prompt.push('\n');
        }

        if !retrieved.templates.is_empty() {
            prompt.push_str("Candidate task templates for multi-step or long-running work:\n");
            for t in &retrieved.templates {
                prompt.push_str(&format!("- {t}\n"));
            }
            prompt.push('\n');
        }

        prompt
    }

    fn build_user_prompt(&self, conv: &adk_core::model::ConversationContext, tool_feedback: Option<&str>) -> String {
        let mut prompt = String::from("Conversation so far:\n");
        for turn in conv.turns() {
            prompt.push_str(&format!("{:?}: {}\n", turn.role, turn.content));
        }
        if let Some(feedback) = tool_feedback {
            prompt.push_str("\nTool call outcomes from the previous turn:\n");
            prompt.push_str(feedback);
            prompt.push_str("\nDecide what to do next given these outcomes.\n");
        }
        prompt
    }

    /// Run a plan's tool calls strictly sequentially (§5) via the
    /// Dispatcher, and build the feedback text fed into the next planning
    /// turn. Returns the names of tools whose call failed, so the final
    /// answer can be forced to acknowledge the degradation if every call
    /// in this turn failed (§4.A "Failures").
    async fn run_tool_calls(
        &self,
        ctx: &RequestContext,
        req: &HandleRequest,
        calls: Vec<PlannedToolCall>,
    ) -> (String, Vec<String>) {
        let invoke_ctx = ctx.invoke_ctx();
        let pairs = calls.into_iter().map(|c| (c.tool_name, c.arguments)).collect();
        let results = self
            .dispatcher
            .invoke_sequence(&invoke_ctx, &req.user_id, req.role, pairs)
            .await;

        let mut feedback = String::new();
        let mut failed = Vec::new();
        for (tool_name, outcome) in &results {
            match outcome {
                Ok(value) => {
                    feedback.push_str(&format!("- {tool_name} succeeded: {value}\n"));
                }
                Err(e) => {
                    feedback.push_str(&format!("- {tool_name} failed: {e}\n"));
                    failed.push(tool_name.clone());
                }
            }
        }

        let all_failed = !results.is_empty() && failed.len() == results.len();
        if all_failed {
            feedback.push_str(
                "\nEvery tool call in this turn failed. Your final answer MUST explicitly tell the user that you were unable to complete the requested action and why.\n",
            );
        }

        (feedback, failed)
    }

    /// `§4.E step 9`: record a `ReasoningMemory` from an explicit
    /// user-initiated correction ("the report summed the wrong column"),
    /// so a later repair attempt on a similar task can retrieve it.
    pub async fn record_user_correction(
        &self,
        description: &str,
        before_script: &str,
        after_script: &str,
    ) -> Result<Uuid> {
        let patch_sketch = self
            .llm
            .generate_content(GenerationRequest {
                system_instruction: Some(
                    "Summarize the difference between the before and after scripts as a short, reusable patch instruction for a future similar repair.".to_string(),
                ),
                messages: vec![ChatMessage {
                    role: "user".to_string(),
                    content: format!(
                        "User correction: {description}\n\nBefore:\n{before_script}\n\nAfter:\n{after_script}"
                    ),
                }],
                temperature: Some(0.0),
                max_tokens: Some(512),
                tools: None,
            })
            .await
            .map_err(|e| AdkError::Llm(e.to_string()))?
            .text;

        let memory = ReasoningMemory {
            id: Uuid::now_v7(),
            title: description.chars().take(80).collect(),
            description: description.to_string(),
            category: ReasoningMemoryCategory::UserCorrection,
            source: "agent_runtime".to_string(),
            context_embedding: None,
            patch_sketch,
            created_at: chrono::Utc::now(),
            times_retrieved: 0,
            times_used_in_success: 0,
            times_used_in_failure: 0,
        };

        self.store
            .set(&format!("reasoning_memories/{}", memory.id), memory_to_doc(&memory))
            .await?;
        self.semantic
            .add_or_update(
                IndexKind::Memory,
                memory.id.to_string(),
                format!("{description}\n{before_script}\n{after_script}"),
                None,
                vec![],
                true,
                0,
                json!({"memoryId": memory.id}),
            )
            .await?;

        Ok(memory.id)
    }
}

fn memory_to_doc(memory: &ReasoningMemory) -> Value {
    serde_json::to_value(SerializableMemory {
        id: memory.id,
        title: memory.title.clone(),
        description: memory.description.clone(),
        category: memory.category,
        source: memory.source.clone(),
        patch_sketch: memory.patch_sketch.clone(),
        created_at: memory.created_at,
        times_retrieved: memory.times_retrieved,
        times_used_in_success: memory.times_used_in_success,
        times_used_in_failure: memory.times_used_in_failure,
    })
    .unwrap_or(Value::Null)
}

#[derive(serde::Serialize)]
struct SerializableMemory {
    id: Uuid,
    title: String,
    description: String,
    category: ReasoningMemoryCategory,
    source: String,
    patch_sketch: String,
    created_at: chrono::DateTime<chrono::Utc>,
    times_retrieved: u64,
    times_used_in_success: u64,
    times_used_in_failure: u64,
}

fn annotate_degradation(text: &str, degraded_tools: &[String]) -> String {
    if text.to_lowercase().contains("unable") || text.to_lowercase().contains("couldn't") || text.to_lowercase().contains("could not") {
        text.to_string()
    } else {
        format!("{text}\n\n(Note: the following tool calls did not succeed: {})", degraded_tools.join(", "))
    }
}

struct RetrievedContext {
    knowledge: Vec<Value>,
    tools: Vec<Arc<dyn adk_tools::Tool>>,
    templates: Vec<Value>,
}

enum PlanOutcome {
    Answer(String),
    TaskSubmitted { task_id: Uuid, acknowledgement: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use adk_core::config::{PlanConfig, RetrievalConfig, TaskConfig};
    use adk_core::error::Result as AdkResult;
    use adk_core::events::EventBus;
    use adk_core::interfaces::GenerationResponse;
    use adk_core::model::EmbeddingTaskType;
    use adk_semantic::EmbeddingService;
    use adk_store::DocumentStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct ScriptedLlm {
        responses: std::sync::Mutex<std::collections::VecDeque<String>>,
        calls: AtomicUsize,
    }

    impl ScriptedLlm {
        fn new(responses: Vec<&str>) -> Self {
            Self {
                responses: std::sync::Mutex::new(responses.into_iter().map(String::from).collect()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl LLMProvider for ScriptedLlm {
        async fn generate_content(&self, _request: GenerationRequest) -> AdkResult<GenerationResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut q = self.responses.lock().unwrap();
            let text = q.pop_front().unwrap_or_else(|| r#"{"type":"answer","text":"(no more scripted responses)"}"#.to_string());
            Ok(GenerationResponse { text, prompt_tokens: 0, completion_tokens: 0 })
        }
    }

    struct DeterministicEmbeddings;
    #[async_trait]
    impl adk_core::interfaces::EmbeddingProvider for DeterministicEmbeddings {
        async fn embed_one(&self, text: &str, _task_type: EmbeddingTaskType) -> AdkResult<adk_core::model::Embedding> {
            let mut v = vec![0.0f32; adk_core::model::EMBEDDING_DIM];
            for (i, b) in text.bytes().enumerate().take(v.len()) {
                v[i] = b as f32;
            }
            Ok(adk_core::model::Embedding::new(v).unwrap())
        }
        async fn embed_many(&self, texts: &[String], task_type: EmbeddingTaskType) -> AdkResult<Vec<adk_core::model::Embedding>> {
            let mut out = Vec::with_capacity(texts.len());
            for t in texts {
                out.push(self.embed_one(t, task_type).await?);
            }
            Ok(out)
        }
    }

    fn build_runtime(llm: Arc<dyn LLMProvider>) -> AgentRuntime {
        let store: Arc<dyn KeyValueStore> = Arc::new(DocumentStore::new());
        let events: Arc<dyn EventSink> = Arc::new(EventBus::default());
        let embeddings = Arc::new(EmbeddingService::new(Arc::new(DeterministicEmbeddings), 1_000, Duration::from_secs(3600)));
        let semantic = Arc::new(SemanticIndex::new(embeddings, 1_000, Duration::from_secs(3600)));
        let tools = ToolRegistry::new();
        let dispatcher = Arc::new(Dispatcher::new(tools.clone(), events.clone()));
        let orchestrator = Arc::new(TaskOrchestrator::new(store.clone(), llm.clone(), events.clone(), TaskConfig::default()));

        AgentRuntime::new(
            llm,
            store,
            events,
            semantic,
            tools,
            dispatcher,
            orchestrator,
            PlanConfig::default(),
            RetrievalConfig::default(),
        )
    }

    #[tokio::test]
    async fn answer_plan_returns_text_and_persists_turns() {
        let llm = Arc::new(ScriptedLlm::new(vec![r#"{"type":"answer","text":"Refunds are accepted within 30 days."}"#]));
        let runtime = build_runtime(llm);

        let resp = runtime
            .handle(
                &RequestContext::default(),
                HandleRequest {
                    user_id: "u1".into(),
                    role: Role::User,
                    conversation_id: "c1".into(),
                    message: "what's your refund policy?".into(),
                    platform_hint: None,
                },
            )
            .await
            .unwrap();

        match resp {
            HandleResponse::Answer { text } => assert!(text.contains("30 days")),
            _ => panic!("expected an answer"),
        }
    }

    #[tokio::test]
    async fn unparseable_plan_falls_back_to_apology_after_one_retry() {
        let llm = Arc::new(ScriptedLlm::new(vec!["not json", "still not json"]));
        let runtime = build_runtime(llm);

        let resp = runtime
            .handle(
                &RequestContext::default(),
                HandleRequest {
                    user_id: "u1".into(),
                    role: Role::User,
                    conversation_id: "c2".into(),
                    message: "do something weird".into(),
                    platform_hint: None,
                },
            )
            .await
            .unwrap();

        match resp {
            HandleResponse::Answer { text } => assert_eq!(text, SAFE_APOLOGY),
            _ => panic!("expected apology answer"),
        }
    }

    #[tokio::test]
    async fn complex_task_adhoc_submits_to_orchestrator() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            r#"{"type":"complex_task_adhoc","naturalLanguageSpec":"export all invoices from the last 60 days as a CSV"}"#,
        ]));
        let runtime = build_runtime(llm);

        let resp = runtime
            .handle(
                &RequestContext::default(),
                HandleRequest {
                    user_id: "u1".into(),
                    role: Role::Admin,
                    conversation_id: "c3".into(),
                    message: "export my invoices".into(),
                    platform_hint: None,
                },
            )
            .await
            .unwrap();

        match resp {
            HandleResponse::TaskSubmitted { acknowledgement, .. } => {
                assert!(acknowledgement.contains("started that task"));
            }
            _ => panic!("expected a task submission"),
        }
    }

    #[tokio::test]
    async fn tool_loop_exhausting_cap_is_a_fatal_error() {
        // Every turn returns tool_calls naming an unknown tool, so the act
        // loop never resolves to an answer and must hit the loop cap.
        let scripted: Vec<&str> = std::iter::repeat(r#"{"type":"tool_calls","calls":[{"tool_name":"does_not_exist","arguments":{}}]}"#)
            .take(10)
            .collect();
        let llm = Arc::new(ScriptedLlm::new(scripted));
        let runtime = build_runtime(llm);

        let err = runtime
            .handle(
                &RequestContext::default(),
                HandleRequest {
                    user_id: "u1".into(),
                    role: Role::User,
                    conversation_id: "c4".into(),
                    message: "keep trying a tool that doesn't exist".into(),
                    platform_hint: None,
                },
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "ERR_PLAN_LOOP_EXHAUSTED");
    }

    #[tokio::test]
    async fn concurrent_same_conversation_calls_serialize_at_the_window() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            r#"{"type":"answer","text":"first reply"}"#,
            r#"{"type":"answer","text":"second reply"}"#,
        ]));
        let runtime = Arc::new(build_runtime(llm));

        let r1 = runtime.clone();
        let r2 = runtime.clone();
        let h1 = tokio::spawn(async move {
            r1.handle(
                &RequestContext::default(),
                HandleRequest {
                    user_id: "u1".into(),
                    role: Role::User,
                    conversation_id: "shared".into(),
                    message: "first message".into(),
                    platform_hint: None,
                },
            )
            .await
        });
        let h2 = tokio::spawn(async move {
            r2.handle(
                &RequestContext::default(),
                HandleRequest {
                    user_id: "u1".into(),
                    role: Role::User,
                    conversation_id: "shared".into(),
                    message: "second message".into(),
                    platform_hint: None,
                },
            )
            .await
        });

        let (a, b) = tokio::join!(h1, h2);
        assert!(a.unwrap().is_ok());
        assert!(b.unwrap().is_ok());
    }

    #[tokio::test]
    async fn retrieve_surfaces_a_trigger_matched_template_the_embedding_missed() {
        let llm = Arc::new(ScriptedLlm::new(vec![]));
        let runtime = build_runtime(llm);

        let template = json!({
            "template_id": "renew-subscription",
            "name": "Renew subscription",
            "categories": ["billing"],
            "trigger_patterns": [],
            "trigger_keywords": ["renew my subscription"],
            "keywords": [],
            "embedding": null,
            "required_services": [],
            "estimated_steps": null,
            "estimated_duration_ms": null,
            "execution_script_template": "",
            "parameter_schema": {},
            "priority": 0,
            "enabled": true
        });
        runtime.store.set("templates/renew-subscription", template).await.unwrap();

        let retrieved = runtime.retrieve("please renew my subscription today", Role::User).await;
        assert!(retrieved
            .templates
            .iter()
            .any(|t| t.get("template_id").and_then(Value::as_str) == Some("renew-subscription")));
    }
}
