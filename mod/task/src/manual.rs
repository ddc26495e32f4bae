use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use atelier_core::{ServiceError, now_rfc3339};

use crate::events::{TaskEvent, TaskEventBus, TaskEventType};
use crate::model::{CompleteKeyRequest, task_type};
use crate::queue::QueueSet;
use crate::store::TaskStore;

/// Stage marker written into the payload when the wait set empties.
pub const STAGE_MANUAL_DONE: &str = "manual_asset_wait_done";

// ---------------------------------------------------------------------------
// ManualWaitState
// ---------------------------------------------------------------------------

/// Asset kind a manual-wait task is collecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManualAssetKind {
    Image,
    Video,
    Audio,
}

impl ManualAssetKind {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "image" => Some(Self::Image),
            "video" => Some(Self::Video),
            "audio" => Some(Self::Audio),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
            Self::Audio => "audio",
        }
    }
}

/// The remaining-items sub-state of a manual-wait task, nested in the
/// payload under `manualAsset`.
///
/// Invariant: `remaining_keys` only shrinks, and `total_count ≥ 1`, so the
/// derived progress percentage is monotonically non-decreasing.
#[derive(Debug, Clone, PartialEq)]
pub struct ManualWaitState {
    pub kind: ManualAssetKind,
    pub remaining_keys: Vec<String>,
    pub total_count: u32,
}

impl ManualWaitState {
    /// Percentage of fulfilled items, clamped to [0, 100].
    pub fn progress(&self) -> i64 {
        progress_pct(self.total_count, self.remaining_keys.len())
    }
}

fn progress_pct(total_count: u32, remaining: usize) -> i64 {
    if total_count == 0 {
        return 0;
    }
    let total = total_count as i64;
    let done = (total - remaining as i64).clamp(0, total);
    ((done * 100 + total / 2) / total).clamp(0, 100)
}

/// Parse the manual-wait sub-state out of a task payload.
///
/// Tolerant of sloppy writers: keys are trimmed, empty keys dropped, and a
/// missing/broken `totalCount` falls back to the remaining-key count
/// (floored at 1). Returns `None` only when the structure itself is absent.
pub fn parse_manual_state(payload: &Value) -> Option<ManualWaitState> {
    let manual = payload.as_object()?.get("manualAsset")?.as_object()?;

    let kind = ManualAssetKind::parse(manual.get("kind")?.as_str()?.trim())?;

    let remaining_keys: Vec<String> = manual
        .get("remainingKeys")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let total_count = manual
        .get("totalCount")
        .and_then(Value::as_u64)
        .map(|n| n.max(1) as u32)
        .unwrap_or_else(|| remaining_keys.len().max(1) as u32);

    Some(ManualWaitState {
        kind,
        remaining_keys,
        total_count,
    })
}

/// Rebuild the payload with a new remaining-key set, leaving every other
/// field untouched.
fn replace_remaining(payload: &Value, remaining: &[String]) -> Option<Value> {
    let mut next = payload.clone();
    let manual = next.as_object_mut()?.get_mut("manualAsset")?.as_object_mut()?;
    manual.insert("remainingKeys".into(), json!(remaining));
    Some(next)
}

// ---------------------------------------------------------------------------
// Protocol outcome
// ---------------------------------------------------------------------------

/// Rejection codes of the manual completion protocol, in check order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompleteKeyReject {
    NotFound,
    Forbidden,
    InvalidTaskType,
    InvalidTarget,
    TaskNotActive,
    InvalidPayload,
    InvalidKey,
}

impl CompleteKeyReject {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound => "NOT_FOUND",
            Self::Forbidden => "FORBIDDEN",
            Self::InvalidTaskType => "INVALID_TASK_TYPE",
            Self::InvalidTarget => "INVALID_TARGET",
            Self::TaskNotActive => "TASK_NOT_ACTIVE",
            Self::InvalidPayload => "INVALID_PAYLOAD",
            Self::InvalidKey => "INVALID_KEY",
        }
    }
}

/// Result of one completeKey call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CompleteKeyResult {
    Rejected(CompleteKeyReject),
    Accepted {
        done: bool,
        progress: i64,
        already_done: bool,
    },
}

// ---------------------------------------------------------------------------
// The protocol
// ---------------------------------------------------------------------------

/// Resolve one externally supplied item of a manual-wait task.
///
/// Validation rejections are synchronous and mutate nothing. Repeating an
/// already-consumed key reports `already_done` success without touching the
/// row. Consuming the last key completes the task, publishes the single
/// `completed` event and removes the now-superfluous queue job. Partial
/// progress persists silently — per-upload events would storm subscribers.
///
/// Callers must hold the per-task serialization lock (see
/// `TaskEngine::complete_manual_key`); the store's status-guarded payload
/// write is the second line of defense against a concurrent terminal
/// transition.
pub fn complete_key(
    store: &TaskStore,
    queues: &QueueSet,
    events: &TaskEventBus,
    task_id: &str,
    req: &CompleteKeyRequest,
) -> Result<CompleteKeyResult, ServiceError> {
    use CompleteKeyReject::*;
    use CompleteKeyResult::*;

    let Some(task) = store.try_get(task_id)? else {
        return Ok(Rejected(NotFound));
    };
    if task.owner_id != req.owner_id || task.project_id != req.project_id {
        return Ok(Rejected(Forbidden));
    }
    if task.task_type != task_type::MANUAL_ASSET_WAIT {
        return Ok(Rejected(InvalidTaskType));
    }
    if task.target_type != req.target_type || task.target_id != req.target_id {
        return Ok(Rejected(InvalidTarget));
    }
    if !task.status.is_active() {
        return Ok(Rejected(TaskNotActive));
    }

    let Some(state) = parse_manual_state(&task.payload) else {
        return Ok(Rejected(InvalidPayload));
    };

    let key = req.completed_key.trim();
    if key.is_empty() {
        return Ok(Rejected(InvalidKey));
    }

    if !state.remaining_keys.iter().any(|k| k == key) {
        // Idempotent retry: the key was already consumed (or never expected).
        return Ok(Accepted {
            done: state.remaining_keys.is_empty(),
            progress: state.progress(),
            already_done: true,
        });
    }

    let next_remaining: Vec<String> = state
        .remaining_keys
        .iter()
        .filter(|k| k.as_str() != key)
        .cloned()
        .collect();
    let progress = progress_pct(state.total_count, next_remaining.len());

    let Some(next_payload) = replace_remaining(&task.payload, &next_remaining) else {
        return Ok(Rejected(InvalidPayload));
    };

    let now = now_rfc3339();

    if !next_remaining.is_empty() {
        // Partial progress: persist only; no event.
        return match store.update_progress(task_id, progress, Some(next_payload), &now)? {
            Some(_) => Ok(Accepted {
                done: false,
                progress,
                already_done: false,
            }),
            // Went terminal between our read and the guarded write.
            None => Ok(Rejected(TaskNotActive)),
        };
    }

    // Last key: complete the task with a stage-marked payload.
    let mut done_payload = next_payload;
    if let Some(obj) = done_payload.as_object_mut() {
        obj.insert("stage".into(), json!(STAGE_MANUAL_DONE));
        obj.insert("progress".into(), json!(100));
    }

    let Some(completed) = store.mark_completed(task_id, Some(done_payload), None, &now)? else {
        return Ok(Rejected(TaskNotActive));
    };

    events.publish(TaskEvent::snapshot(
        &completed,
        TaskEventType::Completed,
        json!({
            "stage": STAGE_MANUAL_DONE,
            "progress": 100,
            "manualAsset": { "kind": state.kind.as_str() },
        }),
    ));

    // No worker should ever pick this job up — the work arrived externally.
    queues.remove(task_id);

    Ok(Accepted {
        done: true,
        progress: 100,
        already_done: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Task, TaskStatus};
    use crate::queue::{JobState, QueuedJob};
    use atelier_sql::SqliteStore;
    use std::sync::Arc;

    fn fixtures() -> (TaskStore, QueueSet, TaskEventBus) {
        let db = Arc::new(SqliteStore::open_in_memory().unwrap());
        (TaskStore::new(db).unwrap(), QueueSet::memory(), TaskEventBus::default())
    }

    fn manual_task(id: &str, remaining: &[&str], total: u32) -> Task {
        let now = now_rfc3339();
        Task {
            id: id.into(),
            task_type: task_type::MANUAL_ASSET_WAIT.into(),
            target_type: "CharacterAppearance".into(),
            target_id: "appearance-1".into(),
            owner_id: "u-1".into(),
            project_id: "p-1".into(),
            episode_id: None,
            status: TaskStatus::Queued,
            progress: 0,
            payload: json!({
                "manualAsset": {
                    "kind": "image",
                    "remainingKeys": remaining,
                    "totalCount": total,
                }
            }),
            dedupe_key: None,
            billing_info: None,
            error_code: None,
            error_message: None,
            heartbeat_at: None,
            created_at: now.clone(),
            updated_at: now,
            finished_at: None,
        }
    }

    fn request(key: &str) -> CompleteKeyRequest {
        CompleteKeyRequest {
            owner_id: "u-1".into(),
            project_id: "p-1".into(),
            target_type: "CharacterAppearance".into(),
            target_id: "appearance-1".into(),
            completed_key: key.into(),
        }
    }

    // -- pure helpers --

    #[test]
    fn progress_math() {
        assert_eq!(progress_pct(2, 2), 0);
        assert_eq!(progress_pct(2, 1), 50);
        assert_eq!(progress_pct(2, 0), 100);
        assert_eq!(progress_pct(3, 1), 67);
        // Degenerate inputs clamp instead of under/overflowing.
        assert_eq!(progress_pct(1, 5), 0);
        assert_eq!(progress_pct(0, 0), 0);
    }

    #[test]
    fn parse_tolerates_sloppy_payloads() {
        let state = parse_manual_state(&json!({
            "manualAsset": {
                "kind": "video",
                "remainingKeys": ["  raw  ", "", "final", 7],
            }
        }))
        .unwrap();
        assert_eq!(state.kind, ManualAssetKind::Video);
        assert_eq!(state.remaining_keys, vec!["raw", "final"]);
        assert_eq!(state.total_count, 2, "falls back to remaining count");

        assert!(parse_manual_state(&json!({})).is_none());
        assert!(parse_manual_state(&json!({"manualAsset": {"kind": "sculpture"}})).is_none());
        assert!(parse_manual_state(&Value::Null).is_none());
    }

    #[test]
    fn replace_preserves_sibling_fields() {
        let payload = json!({
            "stage": "waiting",
            "manualAsset": {"kind": "audio", "remainingKeys": ["a", "b"], "totalCount": 2}
        });
        let next = replace_remaining(&payload, &["b".to_string()]).unwrap();
        assert_eq!(next["stage"], "waiting");
        assert_eq!(next["manualAsset"]["remainingKeys"], json!(["b"]));
        assert_eq!(next["manualAsset"]["totalCount"], 2);
    }

    // -- the protocol ladder --

    #[test]
    fn rejects_in_spec_order() {
        let (store, queues, events) = fixtures();
        store.create(&manual_task("t1", &["0"], 1)).unwrap();

        // Unknown task.
        assert_eq!(
            complete_key(&store, &queues, &events, "ghost", &request("0")).unwrap(),
            CompleteKeyResult::Rejected(CompleteKeyReject::NotFound)
        );

        // Wrong owner.
        let mut req = request("0");
        req.owner_id = "intruder".into();
        assert_eq!(
            complete_key(&store, &queues, &events, "t1", &req).unwrap(),
            CompleteKeyResult::Rejected(CompleteKeyReject::Forbidden)
        );

        // Wrong target.
        let mut req = request("0");
        req.target_id = "appearance-2".into();
        assert_eq!(
            complete_key(&store, &queues, &events, "t1", &req).unwrap(),
            CompleteKeyResult::Rejected(CompleteKeyReject::InvalidTarget)
        );

        // Blank key.
        assert_eq!(
            complete_key(&store, &queues, &events, "t1", &request("   ")).unwrap(),
            CompleteKeyResult::Rejected(CompleteKeyReject::InvalidKey)
        );

        // Not a manual-wait task.
        let mut other = manual_task("t2", &["0"], 1);
        other.task_type = task_type::IMAGE_PANEL.into();
        store.create(&other).unwrap();
        assert_eq!(
            complete_key(&store, &queues, &events, "t2", &request("0")).unwrap(),
            CompleteKeyResult::Rejected(CompleteKeyReject::InvalidTaskType)
        );

        // Already terminal.
        let mut dead = manual_task("t3", &["0"], 1);
        dead.status = TaskStatus::Failed;
        store.create(&dead).unwrap();
        assert_eq!(
            complete_key(&store, &queues, &events, "t3", &request("0")).unwrap(),
            CompleteKeyResult::Rejected(CompleteKeyReject::TaskNotActive)
        );

        // Broken sub-state.
        let mut broken = manual_task("t4", &["0"], 1);
        broken.payload = json!({"stage": "waiting"});
        store.create(&broken).unwrap();
        assert_eq!(
            complete_key(&store, &queues, &events, "t4", &request("0")).unwrap(),
            CompleteKeyResult::Rejected(CompleteKeyReject::InvalidPayload)
        );
    }

    #[test]
    fn rejection_leaves_row_unchanged() {
        let (store, queues, events) = fixtures();
        store.create(&manual_task("t1", &["0", "1"], 2)).unwrap();
        let before = store.get("t1").unwrap();

        let mut req = request("0");
        req.owner_id = "intruder".into();
        complete_key(&store, &queues, &events, "t1", &req).unwrap();

        let mut req = request("0");
        req.target_type = "Panel".into();
        complete_key(&store, &queues, &events, "t1", &req).unwrap();

        assert_eq!(store.get("t1").unwrap(), before);
    }

    #[test]
    fn partial_then_final_key() {
        let (store, queues, events) = fixtures();
        let mut rx = events.subscribe();
        store.create(&manual_task("t1", &["0", "1"], 2)).unwrap();
        queues
            .queue_for(crate::model::QueueKind::Manual)
            .unwrap()
            .enqueue(QueuedJob {
                task_id: "t1".into(),
                task_type: task_type::MANUAL_ASSET_WAIT.into(),
                priority: 0,
            })
            .unwrap();

        // First key: half done, persisted, no event.
        assert_eq!(
            complete_key(&store, &queues, &events, "t1", &request("0")).unwrap(),
            CompleteKeyResult::Accepted {
                done: false,
                progress: 50,
                already_done: false
            }
        );
        let mid = store.get("t1").unwrap();
        assert_eq!(mid.progress, 50);
        assert_eq!(mid.payload["manualAsset"]["remainingKeys"], json!(["1"]));
        assert!(rx.try_recv().is_err(), "partial progress publishes nothing");

        // Same key again: idempotent, no mutation.
        assert_eq!(
            complete_key(&store, &queues, &events, "t1", &request("0")).unwrap(),
            CompleteKeyResult::Accepted {
                done: false,
                progress: 50,
                already_done: true
            }
        );
        assert_eq!(store.get("t1").unwrap(), mid);

        // Final key: completed, one event, job gone.
        assert_eq!(
            complete_key(&store, &queues, &events, "t1", &request("1")).unwrap(),
            CompleteKeyResult::Accepted {
                done: true,
                progress: 100,
                already_done: false
            }
        );
        let done = store.get("t1").unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.progress, 100);
        assert_eq!(done.payload["stage"], STAGE_MANUAL_DONE);

        let ev = rx.try_recv().unwrap();
        assert_eq!(ev.event_type, TaskEventType::Completed);
        assert!(rx.try_recv().is_err(), "exactly one completed event");

        assert_eq!(queues.job_state("t1"), JobState::Missing);
    }
}
