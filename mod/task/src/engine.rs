use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use atelier_core::{ListResult, ServiceError, new_id, now_rfc3339};

use crate::billing::{BillingGateway, rollback_for_task};
use crate::events::{TaskEvent, TaskEventBus, TaskEventType};
use crate::manual::{self, CompleteKeyReject, CompleteKeyResult};
use crate::model::{
    BillingStatus, CompleteKeyRequest, CompleteRequest, FailRequest, ProgressReport,
    SubmitOutcome, SubmitTaskRequest, Task, TaskListQuery, TaskStatus, queue_for_type,
};
use crate::queue::{JobPhase, QueueSet, QueuedJob};
use crate::store::TaskStore;

/// The orchestration engine: submission, dedup, and the worker-facing
/// lifecycle transitions.
///
/// This is a state machine over the ledger, not an executor — the
/// computation per task type happens in external workers that drive status
/// through these methods. Every event publish happens after its ledger
/// write and can never roll it back.
pub struct TaskEngine {
    store: Arc<TaskStore>,
    queues: Arc<QueueSet>,
    billing: Arc<dyn BillingGateway>,
    events: TaskEventBus,
    /// Per-task serialization points for the manual completion protocol.
    manual_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl TaskEngine {
    pub fn new(
        store: Arc<TaskStore>,
        queues: Arc<QueueSet>,
        billing: Arc<dyn BillingGateway>,
    ) -> Self {
        Self {
            store,
            queues,
            billing,
            events: TaskEventBus::default(),
            manual_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<TaskStore> {
        &self.store
    }

    pub fn queues(&self) -> &Arc<QueueSet> {
        &self.queues
    }

    pub fn events(&self) -> &TaskEventBus {
        &self.events
    }

    pub(crate) fn billing_gateway(&self) -> &dyn BillingGateway {
        self.billing.as_ref()
    }

    // =======================================================================
    // Submission
    // =======================================================================

    /// Submit a unit of work: either reuse a live task under the same dedupe
    /// key, or insert a queued ledger row and enqueue a matching job.
    ///
    /// Reuse requires the existing job to be *truly alive* in a queue —
    /// ledger status alone is never trusted, since ledger and queue can
    /// diverge after a crash. A dead task never blocks resubmission.
    pub fn submit(&self, input: SubmitTaskRequest) -> Result<SubmitOutcome, ServiceError> {
        if input.owner_id.trim().is_empty() || input.project_id.trim().is_empty() {
            return Err(ServiceError::Validation("ownerId and projectId are required".into()));
        }
        if input.target_type.trim().is_empty() || input.target_id.trim().is_empty() {
            return Err(ServiceError::Validation("targetType and targetId are required".into()));
        }
        let Some(kind) = queue_for_type(&input.task_type) else {
            return Err(ServiceError::Validation(format!(
                "unknown task type: {}",
                input.task_type
            )));
        };

        let dedupe_key = input
            .dedupe_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string);

        if let Some(ref key) = dedupe_key {
            if let Some(existing) = self.store.find_active_by_dedupe_key(key)? {
                if self.queues.is_job_alive(&existing.id) {
                    return Ok(SubmitOutcome {
                        task_id: existing.id,
                        reused: true,
                    });
                }
                // Ledger says live but the queue lost the job: leave the row
                // for the watchdog and submit fresh under the same key.
                info!(
                    "dedupe key {key} points at dead task {}; submitting anew",
                    existing.id
                );
            }
        }

        let now = now_rfc3339();
        let task = Task {
            id: new_id(),
            task_type: input.task_type,
            target_type: input.target_type,
            target_id: input.target_id,
            owner_id: input.owner_id,
            project_id: input.project_id,
            episode_id: input.episode_id,
            status: TaskStatus::Queued,
            progress: 0,
            payload: input.payload,
            dedupe_key,
            billing_info: input.billing_info,
            error_code: None,
            error_message: None,
            heartbeat_at: None,
            created_at: now.clone(),
            updated_at: now,
            finished_at: None,
        };

        self.store.create(&task)?;

        // Enqueue after the ledger insert. If this fails the row stays and
        // the reconciliation watchdog fails it once the missing-orphan grace
        // window passes.
        let queue = self
            .queues
            .queue_for(kind)
            .ok_or_else(|| ServiceError::Internal(format!("no {kind} queue registered")))?;
        queue.enqueue(QueuedJob {
            task_id: task.id.clone(),
            task_type: task.task_type.clone(),
            priority: input.priority,
        })?;

        self.events.publish(TaskEvent::snapshot(
            &task,
            TaskEventType::Created,
            task.payload.clone(),
        ));

        Ok(SubmitOutcome {
            task_id: task.id,
            reused: false,
        })
    }

    // =======================================================================
    // Worker-facing transitions
    // =======================================================================

    /// Worker picked the job up: queued → processing.
    pub fn start_task(&self, id: &str) -> Result<Task, ServiceError> {
        let now = now_rfc3339();
        match self.store.mark_processing(id, &now)? {
            Some(task) => {
                self.mark_queue_phase(&task, JobPhase::Active);
                self.events.publish(TaskEvent::snapshot(
                    &task,
                    TaskEventType::Processing,
                    serde_json::Value::Null,
                ));
                Ok(task)
            }
            None => Err(ServiceError::Conflict(format!("task {id} is not queued"))),
        }
    }

    /// Worker liveness signal.
    pub fn heartbeat(&self, id: &str) -> Result<(), ServiceError> {
        let now = now_rfc3339();
        match self.store.touch_heartbeat(id, &now)? {
            Some(_) => Ok(()),
            None => Err(ServiceError::Conflict(format!("task {id} is not processing"))),
        }
    }

    /// Worker progress step. Publishes a progress event per step — unlike
    /// partial manual completion, which persists silently.
    pub fn report_progress(&self, id: &str, report: ProgressReport) -> Result<Task, ServiceError> {
        let now = now_rfc3339();
        match self
            .store
            .update_progress(id, report.progress, report.payload, &now)?
        {
            Some(task) => {
                self.events.publish(TaskEvent::snapshot(
                    &task,
                    TaskEventType::Progress,
                    serde_json::json!({ "progress": task.progress }),
                ));
                Ok(task)
            }
            None => Err(ServiceError::Conflict(format!("task {id} is not active"))),
        }
    }

    /// Worker finished successfully.
    pub fn complete_task(&self, id: &str, req: CompleteRequest) -> Result<Task, ServiceError> {
        let current = self.store.get(id)?;

        // A frozen reservation settles on successful output.
        let billing = current.billing_info.as_ref().and_then(|b| {
            b.frozen_freeze_id().map(|_| {
                let mut settled = b.clone();
                settled.status = Some(BillingStatus::Settled);
                settled
            })
        });

        // Queue first, ledger second: a crash in between leaves exactly the
        // terminal-orphan the watchdog reconciles.
        self.mark_queue_phase(&current, JobPhase::Completed);

        let now = now_rfc3339();
        match self.store.mark_completed(id, req.payload, billing, &now)? {
            Some(task) => {
                self.events.publish(TaskEvent::snapshot(
                    &task,
                    TaskEventType::Completed,
                    task.payload.clone(),
                ));
                Ok(task)
            }
            None => Err(ServiceError::Conflict(format!("task {id} is not active"))),
        }
    }

    /// Worker-reported failure: terminal `failed` with the worker's domain
    /// error code. Any frozen reservation is rolled back; a compensation
    /// failure is recorded in the billing status without displacing the
    /// worker's own code.
    pub fn fail_task(&self, id: &str, req: FailRequest) -> Result<Task, ServiceError> {
        let current = self.store.get(id)?;
        let (outcome, billing) = rollback_for_task(self.billing.as_ref(), &current);

        self.mark_queue_phase(&current, JobPhase::Failed);

        let now = now_rfc3339();
        match self.store.mark_failed(
            id,
            req.error_code.as_deref(),
            &req.error_message,
            billing,
            &now,
        )? {
            Some(task) => {
                self.events.publish(TaskEvent::snapshot(
                    &task,
                    TaskEventType::Failed,
                    serde_json::json!({
                        "errorCode": task.error_code,
                        "message": task.error_message,
                        "compensationFailed": outcome.compensation_failed(),
                    }),
                ));
                Ok(task)
            }
            None => Err(ServiceError::Conflict(format!("task {id} is not active"))),
        }
    }

    /// Dismiss a live task. Terminal for the ledger, but publishes no event —
    /// the lifecycle event set has no dismissed member.
    pub fn dismiss_task(&self, id: &str) -> Result<Task, ServiceError> {
        let now = now_rfc3339();
        match self.store.mark_dismissed(id, &now)? {
            Some(task) => {
                self.queues.remove(id);
                Ok(task)
            }
            None => Err(ServiceError::Conflict(format!("task {id} is not active"))),
        }
    }

    // =======================================================================
    // Manual completion
    // =======================================================================

    /// Resolve one externally supplied item of a manual-wait task.
    ///
    /// Serialized per task id: two callers completing different keys
    /// concurrently must not lose either update, so the read-modify-write
    /// runs under a per-task mutex on top of the store's guarded write.
    pub async fn complete_manual_key(
        &self,
        task_id: &str,
        req: &CompleteKeyRequest,
    ) -> Result<CompleteKeyResult, ServiceError> {
        let lock = {
            let mut locks = self.manual_locks.lock().await;
            locks
                .entry(task_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = lock.lock().await;

        let result = manual::complete_key(&self.store, &self.queues, &self.events, task_id, req)?;

        // The task can't be completed twice; drop its lock entry once done.
        if matches!(
            result,
            CompleteKeyResult::Accepted { done: true, .. }
                | CompleteKeyResult::Rejected(CompleteKeyReject::NotFound)
                | CompleteKeyResult::Rejected(CompleteKeyReject::TaskNotActive)
        ) {
            self.manual_locks.lock().await.remove(task_id);
        }

        Ok(result)
    }

    // =======================================================================
    // Query
    // =======================================================================

    pub fn get_task(&self, id: &str) -> Result<Task, ServiceError> {
        self.store.get(id)
    }

    pub fn list_tasks(&self, query: &TaskListQuery) -> Result<ListResult<Task>, ServiceError> {
        self.store.list(query)
    }

    // =======================================================================
    // Internals
    // =======================================================================

    /// Best-effort queue bookkeeping; the ledger write is the authority and
    /// a queue hiccup here surfaces later as reconcilable drift.
    fn mark_queue_phase(&self, task: &Task, phase: JobPhase) {
        let Some(kind) = queue_for_type(&task.task_type) else {
            return;
        };
        let Some(queue) = self.queues.queue_for(kind) else {
            return;
        };
        if let Err(e) = queue.set_phase(&task.id, phase) {
            warn!("queue phase update failed for task {}: {e}", task.id);
        }
    }
}
