//! The observable event stream (§6 `EventSink`, §8 invariant 1).
//!
//! Modeled closely on the kernel's IPC bus: a `tokio::sync::broadcast`
//! channel carrying `Arc<AdkEvent>` so publishing is a pointer copy per
//! subscriber rather than a clone of the event payload.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::model::TaskStatus;

/// Every event the core is specified to emit (§6), plus the state
/// transition event implied by §8 invariant 1 (no-silent-drop requires a
/// per-step record, which in turn requires the state transitions
/// themselves to be observable).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AdkEvent {
    ToolInvocation {
        tool_name: String,
        user_id: String,
        role: String,
        duration_ms: u64,
        outcome: ToolOutcome,
    },
    TaskQueued {
        task_id: Uuid,
        template_id: String,
        user_id: String,
    },
    TaskStateChanged {
        task_id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
    },
    TaskRepaired {
        task_id: Uuid,
        repair_count: u32,
        memory_ids: Vec<Uuid>,
    },
    TaskSucceeded {
        task_id: Uuid,
    },
    TaskFailed {
        task_id: Uuid,
        cause: String,
    },
}

impl AdkEvent {
    pub fn name(&self) -> &'static str {
        match self {
            AdkEvent::ToolInvocation { .. } => "ToolInvocationEvent",
            AdkEvent::TaskQueued { .. } => "TaskQueuedEvent",
            AdkEvent::TaskStateChanged { .. } => "TaskStateChangedEvent",
            AdkEvent::TaskRepaired { .. } => "TaskRepairedEvent",
            AdkEvent::TaskSucceeded { .. } => "TaskSucceededEvent",
            AdkEvent::TaskFailed { .. } => "TaskFailedEvent",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolOutcome {
    Success,
    Error,
    Forbidden,
    Timeout,
}

/// A timestamped envelope, so subscribers don't need to stamp events
/// themselves (and so ordering within the bus is unambiguous).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub event: AdkEvent,
    pub emitted_at: DateTime<Utc>,
}

/// Append-only event bus. `Emit` never blocks on subscriber presence: an
/// event with zero subscribers is not an error (matches `IpcBus::publish`).
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Arc<Envelope>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event; returns the number of subscribers that received it.
    pub fn emit(&self, event: AdkEvent) -> usize {
        let envelope = Arc::new(Envelope {
            event,
            emitted_at: Utc::now(),
        });
        match self.sender.send(envelope) {
            Ok(n) => n,
            Err(_) => 0,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Envelope>> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emit_with_no_subscribers_is_not_an_error() {
        let bus = EventBus::new(16);
        let n = bus.emit(AdkEvent::TaskQueued {
            task_id: Uuid::now_v7(),
            template_id: "t".into(),
            user_id: "u".into(),
        });
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn subscriber_receives_zero_copy_event() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        bus.emit(AdkEvent::TaskSucceeded {
            task_id: Uuid::now_v7(),
        });
        let received = rx.recv().await.unwrap();
        assert_eq!(received.event.name(), "TaskSucceededEvent");
    }

    #[tokio::test]
    async fn multiple_subscribers_each_get_the_event() {
        let bus = EventBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);
        bus.emit(AdkEvent::TaskFailed {
            task_id: Uuid::now_v7(),
            cause: "ERR_UNREPAIRABLE".into(),
        });
        assert!(rx1.recv().await.is_ok());
        assert!(rx2.recv().await.is_ok());
    }
}
