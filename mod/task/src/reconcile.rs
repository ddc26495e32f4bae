use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use atelier_core::{ServiceError, now_rfc3339, parse_rfc3339};

use crate::billing::rollback_for_task;
use crate::engine::TaskEngine;
use crate::events::{TaskEvent, TaskEventType};
use crate::model::Task;
use crate::queue::JobState;

// ---------------------------------------------------------------------------
// Error codes
// ---------------------------------------------------------------------------
//
// Infrastructure-detected failures carry their own codes so operators can
// separate "the work failed" from "the plumbing lost track of the work".

/// A processing task whose worker stopped heartbeating.
pub const ERR_HEARTBEAT_TIMEOUT: &str = "HEARTBEAT_TIMEOUT";
/// A ledger-active task whose queue job finished or vanished.
pub const ERR_RECONCILE_ORPHAN: &str = "RECONCILE_ORPHAN";
/// Forced failure where the billing rollback itself failed; needs manual
/// reconciliation of the financial ledger.
pub const ERR_BILLING_COMPENSATION_FAILED: &str = "BILLING_COMPENSATION_FAILED";

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Threshold surface of the watchdog. Structure is fixed; only the numbers
/// are tunable.
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// How often the watchdog runs one cycle.
    pub tick_interval: Duration,
    /// A processing task with no heartbeat for this long is force-failed.
    pub heartbeat_timeout: Duration,
    /// Ignore a `terminal` probe while the task was updated this recently
    /// (the worker may still be writing its own completion).
    pub terminal_grace: Duration,
    /// Ignore a `missing` probe while the task was updated this recently
    /// (covers the gap between ledger insert and enqueue).
    pub missing_grace: Duration,
    /// Max live tasks examined per cycle, oldest first.
    pub batch_size: u32,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(60),
            heartbeat_timeout: Duration::from_secs(5 * 60),
            terminal_grace: Duration::from_secs(90),
            missing_grace: Duration::from_secs(30),
            batch_size: 200,
        }
    }
}

/// Whether `ts` lies at least `d` in the past of `now`. Unparseable
/// timestamps count as recent: the watchdog would rather skip a task for a
/// cycle than fail one it cannot age.
fn older_than(ts: &str, now: DateTime<Utc>, d: Duration) -> bool {
    let Some(t) = parse_rfc3339(ts) else {
        warn!("unparseable ledger timestamp: {ts}");
        return false;
    };
    match chrono::Duration::from_std(d) {
        Ok(d) => now.signed_duration_since(t) >= d,
        Err(_) => false,
    }
}

// ---------------------------------------------------------------------------
// Sweeper + reconciliation passes
// ---------------------------------------------------------------------------

impl TaskEngine {
    /// Fail `processing` tasks whose heartbeat went stale.
    ///
    /// Independent of what the queue reports — a worker can hang without the
    /// queue infrastructure noticing. Queued tasks have no heartbeat yet and
    /// are never touched here.
    pub fn sweep_stale_tasks(&self, timeout: Duration) -> Result<Vec<String>, ServiceError> {
        let now = Utc::now();
        let mut swept = Vec::new();

        for task in self.store().processing_tasks()? {
            // A processing row always carries a heartbeat; fall back to
            // updated_at rather than trusting a row this code never writes.
            let reference = task.heartbeat_at.as_deref().unwrap_or(&task.updated_at);
            if !older_than(reference, now, timeout) {
                continue;
            }
            if self.force_fail(
                &task,
                ERR_HEARTBEAT_TIMEOUT,
                "watchdog_timeout",
                "worker heartbeat timed out",
            )? {
                swept.push(task.id.clone());
            }
        }

        Ok(swept)
    }

    /// Compare ledger-active tasks against true queue state and force-fail
    /// orphans past their grace window.
    pub fn reconcile_active_tasks(
        &self,
        config: &ReconcileConfig,
    ) -> Result<Vec<String>, ServiceError> {
        let now = Utc::now();
        let batch = self.store().active_tasks(config.batch_size)?;
        let mut reconciled = Vec::new();

        for task in batch {
            let reason = match self.queues().job_state(&task.id) {
                JobState::Alive => continue,
                JobState::Terminal => {
                    if !older_than(&task.updated_at, now, config.terminal_grace) {
                        continue;
                    }
                    "queue job already terminated but the ledger was never updated"
                }
                JobState::Missing => {
                    if !older_than(&task.updated_at, now, config.missing_grace) {
                        continue;
                    }
                    "queue job missing (likely lost during restart)"
                }
            };

            if self.force_fail(&task, ERR_RECONCILE_ORPHAN, "reconciled", reason)? {
                reconciled.push(task.id.clone());
            }
        }

        Ok(reconciled)
    }

    /// One full watchdog cycle: heartbeat sweep, then queue reconciliation.
    /// Synchronous, so tests invoke a pass without waiting on wall-clock
    /// time.
    pub fn run_reconcile_cycle(
        &self,
        config: &ReconcileConfig,
    ) -> Result<(usize, usize), ServiceError> {
        let swept = self.sweep_stale_tasks(config.heartbeat_timeout)?;
        let reconciled = self.reconcile_active_tasks(config)?;

        if !swept.is_empty() || !reconciled.is_empty() {
            info!(
                "watchdog cycle: {} heartbeat-timeout, {} orphan-reconciled",
                swept.len(),
                reconciled.len()
            );
        }
        Ok((swept.len(), reconciled.len()))
    }

    /// Force-fail sequence shared by the sweeper and reconciliation:
    /// compensate, conditionally write `failed`, publish only if the write
    /// took effect.
    fn force_fail(
        &self,
        task: &Task,
        base_code: &str,
        stage: &str,
        reason: &str,
    ) -> Result<bool, ServiceError> {
        // 1. Billing compensation, outcome folded into the error code.
        let (outcome, billing) = rollback_for_task(self.billing_gateway(), task);
        let (code, message) = if outcome.compensation_failed() {
            (
                ERR_BILLING_COMPENSATION_FAILED,
                format!("{reason}; billing rollback failed"),
            )
        } else {
            (base_code, reason.to_string())
        };

        // 2. Conditional write: only if the task is still active. This is
        // the sole mechanism preventing a race with a legitimate completion
        // between our probe and this write.
        let now = now_rfc3339();
        let Some(updated) =
            self.store()
                .mark_failed(&task.id, Some(code), &message, billing, &now)?
        else {
            debug!("task {} left active state before force-fail; skipping", task.id);
            return Ok(false);
        };

        // 3. Publish only for a write that took effect.
        self.events().publish(TaskEvent::snapshot(
            &updated,
            TaskEventType::Failed,
            serde_json::json!({
                "stage": stage,
                "message": message,
                "errorCode": code,
                "compensationFailed": outcome.compensation_failed(),
            }),
        ));

        Ok(true)
    }
}
