use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

/// Lifecycle state of a task.
///
/// ```text
/// queued → processing → completed
///                     → failed
///        → dismissed   (from queued or processing)
/// ```
///
/// Terminal states (completed/failed/dismissed) never transition further.
/// Every terminal write clears `dedupe_key` so a dead task can never block a
/// later submission under the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Dismissed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Dismissed => "dismissed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "dismissed" => Some(Self::Dismissed),
            _ => None,
        }
    }

    /// Whether the task has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Dismissed)
    }

    /// Whether the task still counts as live for dedup and reconciliation.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Queued | Self::Processing)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// QueueKind — the fixed set of resource-kind execution queues
// ---------------------------------------------------------------------------

/// Resource kind a task's job is dispatched to.
///
/// The set is fixed; task IDs are unique across all queues, so a job probe
/// can scan the kinds in order and stop at the first hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueKind {
    Image,
    Video,
    Voice,
    Text,
    Manual,
}

impl QueueKind {
    /// All queue kinds, in probe order.
    pub const ALL: [QueueKind; 5] = [
        QueueKind::Image,
        QueueKind::Video,
        QueueKind::Voice,
        QueueKind::Text,
        QueueKind::Manual,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
            Self::Voice => "voice",
            Self::Text => "text",
            Self::Manual => "manual",
        }
    }
}

impl std::fmt::Display for QueueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Task types — catalog and queue routing
// ---------------------------------------------------------------------------

/// Well-known task type tags.
///
/// The computation behind each type lives in external workers; the engine
/// only needs the tag to route the job to the right queue.
pub mod task_type {
    pub const IMAGE_PANEL: &str = "image_panel";
    pub const IMAGE_CHARACTER: &str = "image_character";
    pub const IMAGE_LOCATION: &str = "image_location";
    pub const VIDEO_PANEL: &str = "video_panel";
    pub const LIP_SYNC: &str = "lip_sync";
    pub const VOICE_LINE: &str = "voice_line";
    pub const VOICE_DESIGN: &str = "voice_design";
    pub const STORYBOARD_TEXT: &str = "storyboard_text";
    pub const ANALYZE_NOVEL: &str = "analyze_novel";
    pub const SCREENPLAY_CONVERT: &str = "screenplay_convert";
    pub const MANUAL_ASSET_WAIT: &str = "manual_asset_wait";
}

/// Map a task type to its execution queue. Unknown types are rejected at
/// submission, so stored tasks always route.
pub fn queue_for_type(task_type: &str) -> Option<QueueKind> {
    use task_type::*;
    match task_type {
        IMAGE_PANEL | IMAGE_CHARACTER | IMAGE_LOCATION => Some(QueueKind::Image),
        VIDEO_PANEL | LIP_SYNC => Some(QueueKind::Video),
        VOICE_LINE | VOICE_DESIGN => Some(QueueKind::Voice),
        STORYBOARD_TEXT | ANALYZE_NOVEL | SCREENPLAY_CONVERT => Some(QueueKind::Text),
        MANUAL_ASSET_WAIT => Some(QueueKind::Manual),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Billing
// ---------------------------------------------------------------------------

/// Settlement state of a billable task's charge reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingStatus {
    Quoted,
    Frozen,
    Settled,
    RolledBack,
    Failed,
}

/// Billing sub-state carried on a task.
///
/// Conceptually a union on `billable`: a non-billable record carries only the
/// flag, a billable one carries the quote and freeze bookkeeping. Modeled as
/// one struct with optional fields because the flag is a boolean, which serde
/// cannot use as an enum tag; [`BillingInfo::frozen_freeze_id`] is the single
/// place that interprets the combination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BillingInfo {
    pub billable: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<f64>,

    /// Billing unit: "token", "image", "video", "second" or "call".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_frozen_cost: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub billing_key: Option<String>,

    /// Reservation handle created when the charge was frozen.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub freeze_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<BillingStatus>,
}

impl BillingInfo {
    pub fn not_billable() -> Self {
        Self {
            billable: false,
            model: None,
            quantity: None,
            unit: None,
            max_frozen_cost: None,
            billing_key: None,
            freeze_id: None,
            status: None,
        }
    }

    /// The freeze to roll back, if this task still holds a reservation.
    pub fn frozen_freeze_id(&self) -> Option<&str> {
        if !self.billable || self.status != Some(BillingStatus::Frozen) {
            return None;
        }
        self.freeze_id.as_deref()
    }
}

// ---------------------------------------------------------------------------
// Task — the ledger row
// ---------------------------------------------------------------------------

/// A single task tracked by the ledger.
///
/// The full record is stored as a JSON `data` column; status, type, owner,
/// project, dedupe key and created_at are mirrored into indexed columns.
/// `id` doubles as the execution-queue job id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,

    #[serde(rename = "type")]
    pub task_type: String,

    // --- target ---
    pub target_type: String,
    pub target_id: String,

    // --- scope ---
    pub owner_id: String,
    pub project_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub episode_id: Option<String>,

    // --- execution state ---
    pub status: TaskStatus,
    /// Percentage 0–100, written by worker progress reports and the manual
    /// completion protocol.
    #[serde(default)]
    pub progress: i64,
    /// Opaque structured document (stage/progress info, manual-wait state).
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub payload: serde_json::Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedupe_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub billing_info: Option<BillingInfo>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    /// Last liveness signal from the worker; meaningful only while processing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_at: Option<String>,

    // --- timestamps (RFC 3339) ---
    pub created_at: String,
    pub updated_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
}

// ---------------------------------------------------------------------------
// API request / response types
// ---------------------------------------------------------------------------

/// Body for `POST /tasks` — submit a unit of work.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitTaskRequest {
    pub owner_id: String,
    pub project_id: String,
    #[serde(default)]
    pub episode_id: Option<String>,

    #[serde(rename = "type")]
    pub task_type: String,

    pub target_type: String,
    pub target_id: String,

    #[serde(default)]
    pub payload: serde_json::Value,

    #[serde(default)]
    pub dedupe_key: Option<String>,

    /// Queue priority hint, passed through to the job.
    #[serde(default)]
    pub priority: i64,

    #[serde(default)]
    pub billing_info: Option<BillingInfo>,
}

/// Response for `POST /tasks`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitOutcome {
    pub task_id: String,
    /// True when an existing live task with the same dedupe key was reused.
    pub reused: bool,
}

/// Query parameters for `GET /tasks`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskListQuery {
    #[serde(default)]
    pub owner_id: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(rename = "type", default)]
    pub task_type: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
}

/// Body for `POST /tasks/{id}/@progress`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressReport {
    /// Percentage 0–100.
    pub progress: i64,
    /// Replacement payload document, if the worker carries stage state.
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
}

/// Body for `POST /tasks/{id}/@complete`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteRequest {
    /// Final payload document (result summary, stage marker).
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
}

/// Body for `POST /tasks/{id}/@fail`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailRequest {
    /// Domain error code from the worker, e.g. "MODEL_REFUSED".
    #[serde(default)]
    pub error_code: Option<String>,
    pub error_message: String,
}

/// Body for `POST /tasks/{id}/@complete-key` — the manual completion
/// protocol (§ external interface: tasks resolved by supplied artifacts).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteKeyRequest {
    pub owner_id: String,
    pub project_id: String,
    pub target_type: String,
    pub target_id: String,
    pub completed_key: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrip() {
        for s in &[
            TaskStatus::Queued,
            TaskStatus::Processing,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Dismissed,
        ] {
            let json = serde_json::to_string(s).unwrap();
            let back: TaskStatus = serde_json::from_str(&json).unwrap();
            assert_eq!(*s, back);
            assert_eq!(TaskStatus::from_str(s.as_str()), Some(*s));
        }
    }

    #[test]
    fn status_terminal_and_active_partition() {
        for s in &[
            TaskStatus::Queued,
            TaskStatus::Processing,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Dismissed,
        ] {
            assert_ne!(s.is_terminal(), s.is_active());
        }
        assert!(TaskStatus::Queued.is_active());
        assert!(TaskStatus::Processing.is_active());
        assert!(TaskStatus::Dismissed.is_terminal());
    }

    #[test]
    fn queue_routing() {
        assert_eq!(queue_for_type(task_type::IMAGE_PANEL), Some(QueueKind::Image));
        assert_eq!(queue_for_type(task_type::LIP_SYNC), Some(QueueKind::Video));
        assert_eq!(queue_for_type(task_type::VOICE_DESIGN), Some(QueueKind::Voice));
        assert_eq!(queue_for_type(task_type::ANALYZE_NOVEL), Some(QueueKind::Text));
        assert_eq!(
            queue_for_type(task_type::MANUAL_ASSET_WAIT),
            Some(QueueKind::Manual)
        );
        assert_eq!(queue_for_type("unknown_type"), None);
    }

    #[test]
    fn task_json_roundtrip() {
        let task = Task {
            id: "abc123".into(),
            task_type: task_type::IMAGE_PANEL.into(),
            target_type: "Panel".into(),
            target_id: "panel-1".into(),
            owner_id: "u-1".into(),
            project_id: "p-1".into(),
            episode_id: None,
            status: TaskStatus::Processing,
            progress: 40,
            payload: serde_json::json!({"stage": "rendering"}),
            dedupe_key: Some("panel-1:render".into()),
            billing_info: Some(BillingInfo {
                billable: true,
                model: Some("img-xl".into()),
                quantity: Some(1.0),
                unit: Some("image".into()),
                max_frozen_cost: Some(4.0),
                billing_key: Some("bk-1".into()),
                freeze_id: Some("frz-1".into()),
                status: Some(BillingStatus::Frozen),
            }),
            error_code: None,
            error_message: None,
            heartbeat_at: Some("2026-01-01T00:01:00+00:00".into()),
            created_at: "2026-01-01T00:00:00+00:00".into(),
            updated_at: "2026-01-01T00:01:00+00:00".into(),
            finished_at: None,
        };

        let json = serde_json::to_string(&task).unwrap();
        let back: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(back, task);

        // Optional None fields must not appear in JSON.
        assert!(!json.contains("\"episodeId\""));
        assert!(!json.contains("\"errorCode\""));
        assert!(!json.contains("\"finishedAt\""));
        // Wire names use camelCase and the "type" rename.
        assert!(json.contains("\"type\":\"image_panel\""));
        assert!(json.contains("\"billingInfo\""));
    }

    #[test]
    fn billing_frozen_freeze_id() {
        let mut b = BillingInfo::not_billable();
        assert_eq!(b.frozen_freeze_id(), None);

        b.billable = true;
        b.freeze_id = Some("frz-9".into());
        assert_eq!(b.frozen_freeze_id(), None, "no status yet");

        b.status = Some(BillingStatus::Frozen);
        assert_eq!(b.frozen_freeze_id(), Some("frz-9"));

        b.status = Some(BillingStatus::RolledBack);
        assert_eq!(b.frozen_freeze_id(), None, "already rolled back");
    }

    #[test]
    fn billing_status_wire_names() {
        assert_eq!(
            serde_json::to_string(&BillingStatus::RolledBack).unwrap(),
            "\"rolled_back\""
        );
        assert_eq!(serde_json::to_string(&BillingStatus::Frozen).unwrap(), "\"frozen\"");
    }

    #[test]
    fn submit_request_deserialize() {
        let json = r#"{
            "ownerId": "u-1",
            "projectId": "p-1",
            "type": "video_panel",
            "targetType": "Panel",
            "targetId": "panel-3",
            "dedupeKey": "panel-3:video"
        }"#;
        let req: SubmitTaskRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.task_type, "video_panel");
        assert_eq!(req.dedupe_key.as_deref(), Some("panel-3:video"));
        assert!(req.payload.is_null());
        assert_eq!(req.priority, 0);
        assert!(req.billing_info.is_none());
    }
}
