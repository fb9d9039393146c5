//! Per-`conversationId` serialization and bounded window storage (§4.A
//! step 2, the concurrency contract for `Handle`).
//!
//! Grounded on `agent::runtime::AgentContext`'s in-memory history, with the
//! teacher's per-session lock promoted to a per-conversation lock so two
//! concurrent `Handle` calls against the same `conversationId` serialize at
//! the window rather than racing to append.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, MutexGuard};

use adk_core::model::ConversationContext;

const MAX_TURNS: usize = 20;

/// Concurrent map of `conversationId -> Mutex<ConversationContext>`.
/// Acquiring the per-conversation lock is what makes `Handle` reentrant-safe
/// per §4.A's concurrency contract: the second concurrent caller simply
/// waits for the first's critical section, and "last writer wins" falls
/// out of running the two critical sections one after another.
#[derive(Clone, Default)]
pub struct ConversationStore {
    inner: Arc<DashMap<String, Arc<Mutex<ConversationContext>>>>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, conversation_id: &str) -> Arc<Mutex<ConversationContext>> {
        self.inner
            .entry(conversation_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(ConversationContext::new(conversation_id, MAX_TURNS))))
            .value()
            .clone()
    }

    /// Acquire the lock for `conversationId`. Holding the returned guard for
    /// the full duration of one `Handle` call is what serializes concurrent
    /// invocations against the same conversation.
    pub async fn lock(&self, conversation_id: &str) -> OwnedConversationGuard {
        let arc = self.entry(conversation_id);
        OwnedConversationGuard { arc }
    }
}

/// A lock handle tied to one conversation's mutex, acquired fresh per call
/// so the guard can be held across the whole `Handle` body without
/// borrowing from `ConversationStore` itself.
pub struct OwnedConversationGuard {
    arc: Arc<Mutex<ConversationContext>>,
}

impl OwnedConversationGuard {
    pub async fn guard(&self) -> MutexGuard<'_, ConversationContext> {
        self.arc.lock().await
    }
}
