use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use atelier_core::ServiceError;
use tracing::warn;

use crate::model::QueueKind;

// ---------------------------------------------------------------------------
// Job state
// ---------------------------------------------------------------------------

/// Queue-level lifecycle of a single job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    Waiting,
    Active,
    Completed,
    Failed,
}

impl JobPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Verdict of probing all queues for a task's job.
///
/// - `Alive`: found and still runnable (waiting / active).
/// - `Terminal`: found but already finished at the queue layer.
/// - `Missing`: absent from every queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Alive,
    Terminal,
    Missing,
}

/// A job handed to an execution queue. `task_id` doubles as the job id.
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub task_id: String,
    pub task_type: String,
    pub priority: i64,
}

// ---------------------------------------------------------------------------
// TaskQueue — seam to the execution backend
// ---------------------------------------------------------------------------

/// One resource-kind execution queue.
///
/// The engine only needs existence/state probing and job bookkeeping; actual
/// work execution happens in external workers.
pub trait TaskQueue: Send + Sync {
    fn kind(&self) -> QueueKind;

    fn enqueue(&self, job: QueuedJob) -> Result<(), ServiceError>;

    /// Queue-level phase of the job, `None` when this queue doesn't hold it.
    fn phase(&self, task_id: &str) -> Result<Option<JobPhase>, ServiceError>;

    /// Record a phase change. Returns false when the job is not held here.
    fn set_phase(&self, task_id: &str, phase: JobPhase) -> Result<bool, ServiceError>;

    /// Drop the job entirely. Returns false when it was not held here.
    fn remove(&self, task_id: &str) -> Result<bool, ServiceError>;
}

// ---------------------------------------------------------------------------
// QueueSet — the fixed set of queues plus cross-queue probing
// ---------------------------------------------------------------------------

/// The fixed registry of resource-kind queues.
pub struct QueueSet {
    queues: Vec<Arc<dyn TaskQueue>>,
}

impl QueueSet {
    pub fn new(queues: Vec<Arc<dyn TaskQueue>>) -> Self {
        Self { queues }
    }

    /// An all-in-process queue set (one MemoryQueue per kind, probe order).
    pub fn memory() -> Self {
        Self::new(
            QueueKind::ALL
                .iter()
                .map(|k| Arc::new(MemoryQueue::new(*k)) as Arc<dyn TaskQueue>)
                .collect(),
        )
    }

    pub fn queue_for(&self, kind: QueueKind) -> Option<&Arc<dyn TaskQueue>> {
        self.queues.iter().find(|q| q.kind() == kind)
    }

    /// Probe every queue for the job, first match wins.
    ///
    /// A failed probe on one queue must not hide the job on another, so
    /// individual errors are logged and probing continues.
    pub fn job_state(&self, task_id: &str) -> JobState {
        for queue in &self.queues {
            match queue.phase(task_id) {
                Ok(Some(phase)) if phase.is_terminal() => return JobState::Terminal,
                Ok(Some(_)) => return JobState::Alive,
                Ok(None) => continue,
                Err(e) => {
                    warn!("job probe on {} queue failed: {e}", queue.kind());
                    continue;
                }
            }
        }
        JobState::Missing
    }

    /// Whether the job still runs somewhere. Used by submission dedup —
    /// ledger status alone is never trusted.
    pub fn is_job_alive(&self, task_id: &str) -> bool {
        self.job_state(task_id) == JobState::Alive
    }

    /// Remove the job from whichever queue holds it.
    pub fn remove(&self, task_id: &str) -> bool {
        for queue in &self.queues {
            match queue.remove(task_id) {
                Ok(true) => return true,
                Ok(false) => continue,
                Err(e) => {
                    warn!("job removal on {} queue failed: {e}", queue.kind());
                    continue;
                }
            }
        }
        false
    }
}

// ---------------------------------------------------------------------------
// MemoryQueue — in-process implementation
// ---------------------------------------------------------------------------

struct MemoryJob {
    job: QueuedJob,
    phase: JobPhase,
}

/// In-process queue used by the server binary and tests.
///
/// Holds jobs and their queue-level phase in a mutex-guarded map; external
/// workers drive phases through the engine's worker-facing transitions.
pub struct MemoryQueue {
    kind: QueueKind,
    jobs: Mutex<HashMap<String, MemoryJob>>,
}

impl MemoryQueue {
    pub fn new(kind: QueueKind) -> Self {
        Self {
            kind,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    fn locked(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, MemoryJob>>, ServiceError> {
        self.jobs
            .lock()
            .map_err(|e| ServiceError::Internal(format!("queue lock poisoned: {e}")))
    }

    /// Jobs still waiting for a worker, highest priority first. Workers poll
    /// this, then claim the task through the engine's `@start` transition.
    pub fn waiting_jobs(&self) -> Result<Vec<QueuedJob>, ServiceError> {
        let jobs = self.locked()?;
        let mut waiting: Vec<QueuedJob> = jobs
            .values()
            .filter(|j| j.phase == JobPhase::Waiting)
            .map(|j| j.job.clone())
            .collect();
        waiting.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.task_id.cmp(&b.task_id)));
        Ok(waiting)
    }
}

impl TaskQueue for MemoryQueue {
    fn kind(&self) -> QueueKind {
        self.kind
    }

    fn enqueue(&self, job: QueuedJob) -> Result<(), ServiceError> {
        let mut jobs = self.locked()?;
        jobs.insert(
            job.task_id.clone(),
            MemoryJob {
                job,
                phase: JobPhase::Waiting,
            },
        );
        Ok(())
    }

    fn phase(&self, task_id: &str) -> Result<Option<JobPhase>, ServiceError> {
        Ok(self.locked()?.get(task_id).map(|j| j.phase))
    }

    fn set_phase(&self, task_id: &str, phase: JobPhase) -> Result<bool, ServiceError> {
        let mut jobs = self.locked()?;
        match jobs.get_mut(task_id) {
            Some(j) => {
                j.phase = phase;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn remove(&self, task_id: &str) -> Result<bool, ServiceError> {
        Ok(self.locked()?.remove(task_id).is_some())
    }
}
