//! The logical entities the core operates on (data model).
//!
//! These types are intentionally storage-agnostic: they describe shape and
//! invariants, not a particular `KeyValueStore` encoding. Backing stores
//! serialize them as documents; the vector fields are the ones a
//! `KeyValueStore` implementation must expose `cosineSimilarity` querying
//! over.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Dimensionality shared by every embedding in the system (§4.G).
pub const EMBEDDING_DIM: usize = 768;

/// A single embedding vector. Kept as a newtype so call sites can't
/// accidentally pass an arbitrary `Vec<f32>` of the wrong length.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding(pub Vec<f32>);

impl Embedding {
    /// Build an embedding, checking it has the declared dimension.
    pub fn new(values: Vec<f32>) -> Option<Self> {
        if values.len() == EMBEDDING_DIM {
            Some(Self(values))
        } else {
            None
        }
    }

    pub fn cosine_similarity(&self, other: &Embedding) -> f32 {
        let dot: f32 = self.0.iter().zip(&other.0).map(|(a, b)| a * b).sum();
        let norm_a = self.0.iter().map(|v| v * v).sum::<f32>().sqrt();
        let norm_b = other.0.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm_a == 0.0 || norm_b == 0.0 {
            0.0
        } else {
            dot / (norm_a * norm_b)
        }
    }
}

/// The two roles a caller can carry. `allowedRoles` is a subset of this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Admin,
}

/// Which kind of text is being embedded — drives provider task-type
/// selection and cache-key/metric bucketing (§4.G).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EmbeddingTaskType {
    RetrievalQuery,
    RetrievalDocument,
    SemanticSimilarity,
}

/// A curated piece of knowledge eligible for retrieval (§3 `KnowledgeEntry`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeEntry {
    pub id: Uuid,
    pub title: String,
    /// Free text, up to ~100 KB by convention; not enforced here (the
    /// admin interfaces that write these are out of scope, per §1).
    pub content: String,
    pub category: String,
    pub tags: Vec<String>,
    pub priority: u32,
    pub enabled: bool,
    pub embedding: Option<Embedding>,
    pub embedding_model: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A registered tool, discoverable and selectable by the planner (§3
/// `ToolDescriptor`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Globally unique; an identifier, not a display label.
    pub name: String,
    pub description: String,
    pub category: String,
    pub priority: u32,
    pub enabled: bool,
    /// JSON-shaped schema describing inputs.
    pub parameter_schema: serde_json::Value,
    /// Fail-secure default: `{Admin}` if absent from the ACL map.
    pub allowed_roles: Vec<Role>,
    pub embedding: Option<Embedding>,
    pub timeout_ms: u64,
}

impl ToolDescriptor {
    pub fn is_visible_to(&self, role: Role) -> bool {
        self.enabled && self.allowed_roles.contains(&role)
    }
}

/// A reusable template for a complex, asynchronous task (§3 `TaskTemplate`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskTemplate {
    /// Stable, human-chosen, stable across versions.
    pub template_id: String,
    pub name: String,
    pub categories: Vec<String>,
    pub trigger_patterns: Vec<String>,
    pub trigger_keywords: Vec<String>,
    pub keywords: Vec<String>,
    pub embedding: Option<Embedding>,
    pub required_services: Vec<String>,
    pub estimated_steps: Option<u32>,
    pub estimated_duration_ms: Option<u64>,
    pub execution_script_template: String,
    pub parameter_schema: serde_json::Value,
    pub priority: u32,
    pub enabled: bool,
}

impl TaskTemplate {
    /// A template referencing an unavailable required service MUST NOT be
    /// selectable.
    pub fn is_selectable(&self, available_services: &[String]) -> bool {
        self.enabled
            && self
                .required_services
                .iter()
                .all(|svc| available_services.iter().any(|a| a == svc))
    }
}

/// Ordered task lifecycle states (§3 `TaskRequest`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Repairing,
    Succeeded,
    Failed,
    Cancelled,
    TimedOut,
}

impl TaskStatus {
    /// Terminal states are immutable (§3 invariant, §8 invariant 4).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::TimedOut
        )
    }
}

/// A single recorded failure during a task's lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    pub category: FailureCategory,
    pub detail: String,
    pub script_snapshot: String,
    pub occurred_at: DateTime<Utc>,
}

/// The failure taxonomy produced by the worker (§4.D), input to RepairLoop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    ValidationError,
    SecurityViolation,
    RuntimeError,
    Timeout,
    ResourceLimit,
}

impl FailureCategory {
    /// Only the first three are candidates for repair unconditionally;
    /// `Timeout`/`ResourceLimit` are repairable only if budget remains and
    /// the patch is expected to reduce work (decided by the caller).
    pub fn is_unconditionally_repairable(self) -> bool {
        matches!(
            self,
            FailureCategory::ValidationError
                | FailureCategory::SecurityViolation
                | FailureCategory::RuntimeError
        )
    }

    /// Which `ReasoningMemory` categories are compatible donors for this
    /// failure category, per §4.E step 3.
    pub fn compatible_memory_categories(self) -> Vec<ReasoningMemoryCategory> {
        match self {
            FailureCategory::SecurityViolation => vec![
                ReasoningMemoryCategory::SecurityViolation,
                ReasoningMemoryCategory::ValidationError,
            ],
            FailureCategory::RuntimeError => vec![
                ReasoningMemoryCategory::RuntimeError,
                ReasoningMemoryCategory::UserCorrection,
            ],
            FailureCategory::ValidationError => vec![ReasoningMemoryCategory::ValidationError],
            FailureCategory::Timeout | FailureCategory::ResourceLimit => {
                vec![ReasoningMemoryCategory::RuntimeError]
            }
        }
    }
}

/// An in-flight or terminal complex task (§3 `TaskRequest`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub task_id: Uuid,
    pub template_id: String,
    pub user_id: String,
    pub role: Role,
    pub parameters: serde_json::Value,
    /// The actual code to run, possibly patched by a repair cycle. A
    /// snapshot at submission time — later template edits never mutate it
    /// (Open Question 3, decided in DESIGN.md).
    pub script_current: String,
    pub status: TaskStatus,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result_artifact: Option<serde_json::Value>,
    pub errors: Vec<FailureRecord>,
    pub repair_count: u32,
    pub worker_id: Option<String>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    /// Every `ReasoningMemory` id the repair loop has drawn on across this
    /// task's lifetime, deduplicated. Used at the terminal transition to
    /// update each memory's counters exactly once regardless of how many
    /// repair cycles reused it (§4.E step 8).
    pub used_memory_ids: Vec<Uuid>,
}

impl TaskRequest {
    pub fn new(
        template_id: impl Into<String>,
        user_id: impl Into<String>,
        role: Role,
        parameters: serde_json::Value,
        script_current: impl Into<String>,
    ) -> Self {
        Self {
            task_id: Uuid::now_v7(),
            template_id: template_id.into(),
            user_id: user_id.into(),
            role,
            parameters,
            script_current: script_current.into(),
            status: TaskStatus::Queued,
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
            result_artifact: None,
            errors: Vec::new(),
            repair_count: 0,
            worker_id: None,
            last_heartbeat_at: None,
            used_memory_ids: Vec::new(),
        }
    }
}

/// The category taxonomy for episodic failure-and-fix records (§3
/// `ReasoningMemory`). Distinct from `FailureCategory`: this is the
/// memory's own classification, which may additionally be
/// `UserCorrection` (a memory created from explicit user feedback rather
/// than a worker-observed failure).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningMemoryCategory {
    ValidationError,
    SecurityViolation,
    RuntimeError,
    UserCorrection,
}

/// An episodic record of a prior failure-and-fix (§3 `ReasoningMemory`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningMemory {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub category: ReasoningMemoryCategory,
    /// Which subsystem created it, e.g. `"repair_loop"` or `"agent_runtime"`.
    pub source: String,
    pub context_embedding: Option<Embedding>,
    pub patch_sketch: String,
    pub created_at: DateTime<Utc>,
    pub times_retrieved: u64,
    pub times_used_in_success: u64,
    pub times_used_in_failure: u64,
}

impl ReasoningMemory {
    /// `successRate = timesUsedInSuccess / (timesUsedInSuccess +
    /// timesUsedInFailure)` when the denominator is > 0, else `None`
    /// (callers treat an undefined rate as 0.5 per §4.E step 4).
    pub fn success_rate(&self) -> Option<f64> {
        let denom = self.times_used_in_success + self.times_used_in_failure;
        if denom == 0 {
            None
        } else {
            Some(self.times_used_in_success as f64 / denom as f64)
        }
    }
}

/// A single (role, content) turn in a conversation window (§3
/// `ConversationContext`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: ConversationRole,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationRole {
    User,
    Assistant,
    System,
}

/// Bounded window of recent turns for one platform-agnostic conversation
/// identity. Used for LLM prompting only — not an authoritative transcript
/// store (§3).
#[derive(Debug, Clone, Default)]
pub struct ConversationContext {
    pub conversation_id: String,
    turns: Vec<ConversationTurn>,
    max_turns: usize,
}

impl ConversationContext {
    pub fn new(conversation_id: impl Into<String>, max_turns: usize) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            turns: Vec::new(),
            max_turns,
        }
    }

    pub fn push(&mut self, turn: ConversationTurn) {
        self.turns.push(turn);
        if self.turns.len() > self.max_turns {
            let excess = self.turns.len() - self.max_turns;
            self.turns.drain(0..excess);
        }
    }

    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }
}

/// Free-form key/value bag attached to requests that don't yet have a
/// dedicated struct field (kept small and explicit rather than a generic
/// `HashMap<String, Value>` passed everywhere).
pub type Metadata = HashMap<String, String>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedding_rejects_wrong_dimension() {
        assert!(Embedding::new(vec![0.0; 10]).is_none());
        assert!(Embedding::new(vec![0.0; EMBEDDING_DIM]).is_some());
    }

    #[test]
    fn cosine_similarity_identical_vectors_is_one() {
        let mut v = vec![0.0f32; EMBEDDING_DIM];
        v[0] = 1.0;
        v[1] = 2.0;
        let a = Embedding::new(v.clone()).unwrap();
        let b = Embedding::new(v).unwrap();
        assert!((a.cosine_similarity(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn tool_descriptor_visibility_respects_role_and_enabled() {
        let mut tool = ToolDescriptor {
            name: "t".into(),
            description: "d".into(),
            category: "c".into(),
            priority: 0,
            enabled: true,
            parameter_schema: serde_json::json!({}),
            allowed_roles: vec![Role::Admin],
            embedding: None,
            timeout_ms: 30_000,
        };
        assert!(!tool.is_visible_to(Role::User));
        assert!(tool.is_visible_to(Role::Admin));
        tool.enabled = false;
        assert!(!tool.is_visible_to(Role::Admin));
    }

    #[test]
    fn task_template_unavailable_service_not_selectable() {
        let tmpl = TaskTemplate {
            template_id: "t1".into(),
            name: "n".into(),
            categories: vec![],
            trigger_patterns: vec![],
            trigger_keywords: vec![],
            keywords: vec![],
            embedding: None,
            required_services: vec!["csv_export".into()],
            estimated_steps: None,
            estimated_duration_ms: None,
            execution_script_template: String::new(),
            parameter_schema: serde_json::json!({}),
            priority: 0,
            enabled: true,
        };
        assert!(!tmpl.is_selectable(&[]));
        assert!(tmpl.is_selectable(&["csv_export".to_string()]));
    }

    #[test]
    fn task_status_terminality() {
        assert!(TaskStatus::Succeeded.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(!TaskStatus::Repairing.is_terminal());
    }

    #[test]
    fn reasoning_memory_success_rate_undefined_when_unused() {
        let mem = ReasoningMemory {
            id: Uuid::now_v7(),
            title: "t".into(),
            description: "d".into(),
            category: ReasoningMemoryCategory::RuntimeError,
            source: "repair_loop".into(),
            context_embedding: None,
            patch_sketch: "guard against zero denominator".into(),
            created_at: Utc::now(),
            times_retrieved: 0,
            times_used_in_success: 0,
            times_used_in_failure: 0,
        };
        assert_eq!(mem.success_rate(), None);
    }

    #[test]
    fn conversation_context_bounds_window() {
        let mut ctx = ConversationContext::new("c1", 2);
        for i in 0..5 {
            ctx.push(ConversationTurn {
                role: ConversationRole::User,
                content: format!("turn {i}"),
            });
        }
        assert_eq!(ctx.turns().len(), 2);
        assert_eq!(ctx.turns()[0].content, "turn 3");
    }

    #[test]
    fn failure_category_repairability() {
        assert!(FailureCategory::RuntimeError.is_unconditionally_repairable());
        assert!(!FailureCategory::Timeout.is_unconditionally_repairable());
    }
}
