//! Lifecycle and orchestration event buses.
//!
//! Both buses are lossy broadcast channels: emitting with no subscribers is
//! fine, and a slow subscriber only lags itself. Deferred subtask waits are
//! NOT resolved through these buses — the orchestrator uses per-task-id
//! one-shot channels for that.

use tokio::sync::broadcast;

use crate::model::{PauseReason, Task};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Typed broadcast bus.
pub struct EventBus<E: Clone> {
    tx: broadcast::Sender<E>,
}

impl<E: Clone> EventBus<E> {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Send an event to all subscribers. No subscribers is not an error.
    pub fn emit(&self, event: E) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.tx.subscribe()
    }
}

impl<E: Clone> Default for EventBus<E> {
    fn default() -> Self {
        Self::new(EVENT_CHANNEL_CAPACITY)
    }
}

/// Events emitted by the lifecycle manager.
#[derive(Debug, Clone)]
pub enum TaskEvent {
    TaskCreated(Task),
    TaskUpdated(Task),
    TaskLoaded(Task),
    TaskDeleted(String),
    TaskCompleted(Task),
    TaskTerminated(Task),
    TaskFailed { task: Task, error: String },
    CheckpointAdded { task: Task, checkpoint_id: String },
    CheckpointRestored { task: Task, checkpoint_id: String },
    /// Initialization finished; the manager accepts operations.
    Ready,
    Closed,
}

/// Events emitted by the subtask orchestrator.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    SubtaskStarted {
        task_id: String,
        parent_task_id: String,
        depth: u32,
    },
    SubtaskCompleted {
        task_id: String,
        parent_task_id: String,
    },
    SubtaskFailed {
        task_id: String,
        parent_task_id: String,
        error: String,
    },
    TaskPaused {
        task_id: String,
        reason: PauseReason,
    },
    TaskResumed {
        task_id: String,
    },
    TaskSpawned {
        task_id: String,
        spawned_from: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emit_without_subscribers_does_not_panic() {
        let bus: EventBus<TaskEvent> = EventBus::default();
        bus.emit(TaskEvent::Ready);
    }

    #[tokio::test]
    async fn subscriber_receives_emitted_event() {
        let bus: EventBus<TaskEvent> = EventBus::default();
        let mut rx = bus.subscribe();
        bus.emit(TaskEvent::TaskDeleted("t-1".into()));
        match rx.recv().await.unwrap() {
            TaskEvent::TaskDeleted(id) => assert_eq!(id, "t-1"),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
