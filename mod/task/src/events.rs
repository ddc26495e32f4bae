use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use atelier_core::{new_id, now_rfc3339};

use crate::model::Task;

// ---------------------------------------------------------------------------
// Event model
// ---------------------------------------------------------------------------

/// Lifecycle event types, wire-named as `task.*`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TaskEventType {
    #[serde(rename = "task.created")]
    Created,
    #[serde(rename = "task.processing")]
    Processing,
    #[serde(rename = "task.progress")]
    Progress,
    #[serde(rename = "task.completed")]
    Completed,
    #[serde(rename = "task.failed")]
    Failed,
}

impl TaskEventType {
    pub fn wire_name(&self) -> &'static str {
        match self {
            Self::Created => "task.created",
            Self::Processing => "task.processing",
            Self::Progress => "task.progress",
            Self::Completed => "task.completed",
            Self::Failed => "task.failed",
        }
    }
}

/// A lifecycle/progress snapshot, immutable once published.
///
/// Self-describing: a consumer can resynchronize from the latest event alone
/// (identity, classification, timestamp, payload snapshot) without replay.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: TaskEventType,
    pub task_id: String,
    pub owner_id: String,
    pub project_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub episode_id: Option<String>,
    pub task_type: String,
    pub target_type: String,
    pub target_id: String,
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    pub payload: serde_json::Value,
    pub ts: String,
}

impl TaskEvent {
    /// Snapshot an event off a task row.
    pub fn snapshot(task: &Task, event_type: TaskEventType, payload: serde_json::Value) -> Self {
        Self {
            id: new_id(),
            event_type,
            task_id: task.id.clone(),
            owner_id: task.owner_id.clone(),
            project_id: task.project_id.clone(),
            episode_id: task.episode_id.clone(),
            task_type: task.task_type.clone(),
            target_type: task.target_type.clone(),
            target_id: task.target_id.clone(),
            payload,
            ts: now_rfc3339(),
        }
    }
}

// ---------------------------------------------------------------------------
// TaskEventBus
// ---------------------------------------------------------------------------

/// Broadcast bus for task lifecycle events.
///
/// Publication is fire-and-forget relative to the ledger write that
/// triggered it: no subscribers, a closed receiver, or a lagging one can
/// never fail or block the caller.
pub struct TaskEventBus {
    tx: broadcast::Sender<TaskEvent>,
}

impl TaskEventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event to all current subscribers.
    pub fn publish(&self, event: TaskEvent) {
        // send() errs only when no receiver exists — not a failure here.
        if self.tx.send(event).is_err() {
            debug!("task event published with no subscribers");
        }
    }

    /// Subscribe to the raw firehose; callers filter by owner/project.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.tx.subscribe()
    }
}

impl Default for TaskEventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
