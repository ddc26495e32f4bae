use std::sync::Arc;

use atelier_core::{ListResult, ServiceError};
use atelier_sql::{Row, SQLStore, Value};

use crate::model::{BillingInfo, Task, TaskListQuery, TaskStatus};

/// SQL schema for the task ledger.
///
/// The whole record lives in the JSON `data` column; the remaining columns
/// are copies kept for indexing and are never read back into the model.
const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tasks (
    id          TEXT PRIMARY KEY,
    data        TEXT NOT NULL,
    type        TEXT NOT NULL,
    status      TEXT NOT NULL,
    owner_id    TEXT NOT NULL,
    project_id  TEXT NOT NULL,
    dedupe_key  TEXT,
    created_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_task_status ON tasks(status);
CREATE INDEX IF NOT EXISTS idx_task_dedupe ON tasks(dedupe_key);
CREATE INDEX IF NOT EXISTS idx_task_project ON tasks(project_id);
CREATE INDEX IF NOT EXISTS idx_task_created ON tasks(created_at);
";

/// Durable task ledger, backed by SQLStore (SQLite).
///
/// Every status write is a *conditional* UPDATE guarded on the current
/// status column. That guard is the cancellation-safety mechanism for the
/// whole engine: a watchdog force-fail and a worker completion can race, and
/// whichever guarded write lands second simply affects zero rows.
pub struct TaskStore {
    db: Arc<dyn SQLStore>,
}

/// Transition targets a guarded write may start from.
const ACTIVE: &[TaskStatus] = &[TaskStatus::Queued, TaskStatus::Processing];

impl TaskStore {
    /// Create a new TaskStore and initialise the schema.
    pub fn new(db: Arc<dyn SQLStore>) -> Result<Self, ServiceError> {
        db.exec_batch(SCHEMA)
            .map_err(|e| ServiceError::Storage(format!("task schema init: {e}")))?;
        Ok(Self { db })
    }

    // -----------------------------------------------------------------------
    // CRUD
    // -----------------------------------------------------------------------

    /// Insert a new task.
    pub fn create(&self, task: &Task) -> Result<(), ServiceError> {
        let data =
            serde_json::to_string(task).map_err(|e| ServiceError::Internal(e.to_string()))?;

        self.db
            .exec(
                "INSERT INTO tasks (id, data, type, status, owner_id, project_id, dedupe_key, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                &[
                    Value::Text(task.id.clone()),
                    Value::Text(data),
                    Value::Text(task.task_type.clone()),
                    Value::Text(task.status.as_str().to_string()),
                    Value::Text(task.owner_id.clone()),
                    Value::Text(task.project_id.clone()),
                    Value::opt_text(task.dedupe_key.as_deref()),
                    Value::Text(task.created_at.clone()),
                ],
            )
            .map_err(|e| ServiceError::Storage(e.to_string()))?;

        Ok(())
    }

    /// Get a task by ID.
    pub fn get(&self, id: &str) -> Result<Task, ServiceError> {
        self.try_get(id)?
            .ok_or_else(|| ServiceError::NotFound(format!("task {id}")))
    }

    /// Get a task by ID, `None` when absent.
    pub fn try_get(&self, id: &str) -> Result<Option<Task>, ServiceError> {
        let rows = self
            .db
            .query(
                "SELECT data FROM tasks WHERE id = ?1",
                &[Value::Text(id.to_string())],
            )
            .map_err(|e| ServiceError::Storage(e.to_string()))?;

        rows.first().map(row_to_task).transpose()
    }

    // -----------------------------------------------------------------------
    // Dedup lookup
    // -----------------------------------------------------------------------

    /// Find a task by dedupe key among *live* statuses only.
    ///
    /// Terminal tasks have their dedupe key cleared, but the status filter
    /// also protects against rows written before that invariant held.
    pub fn find_active_by_dedupe_key(&self, key: &str) -> Result<Option<Task>, ServiceError> {
        let rows = self
            .db
            .query(
                &format!(
                    "SELECT data FROM tasks WHERE dedupe_key = ?1 AND status IN ({}) \
                     ORDER BY created_at DESC LIMIT 1",
                    status_literals(ACTIVE)
                ),
                &[Value::Text(key.to_string())],
            )
            .map_err(|e| ServiceError::Storage(e.to_string()))?;

        rows.first().map(row_to_task).transpose()
    }

    // -----------------------------------------------------------------------
    // List / Query
    // -----------------------------------------------------------------------

    /// List tasks with optional filters, newest first.
    pub fn list(&self, query: &TaskListQuery) -> Result<ListResult<Task>, ServiceError> {
        let limit = query.limit.unwrap_or(50);
        let offset = query.offset.unwrap_or(0);

        let mut where_clauses: Vec<String> = Vec::new();
        let mut params: Vec<Value> = Vec::new();
        let mut idx = 1;

        if let Some(ref o) = query.owner_id {
            where_clauses.push(format!("owner_id = ?{idx}"));
            params.push(Value::Text(o.clone()));
            idx += 1;
        }
        if let Some(ref p) = query.project_id {
            where_clauses.push(format!("project_id = ?{idx}"));
            params.push(Value::Text(p.clone()));
            idx += 1;
        }
        if let Some(ref s) = query.status {
            where_clauses.push(format!("status = ?{idx}"));
            params.push(Value::Text(s.clone()));
            idx += 1;
        }
        if let Some(ref t) = query.task_type {
            where_clauses.push(format!("type = ?{idx}"));
            params.push(Value::Text(t.clone()));
            idx += 1;
        }

        let where_sql = if where_clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", where_clauses.join(" AND "))
        };

        // Count total
        let count_sql = format!("SELECT COUNT(*) as cnt FROM tasks {where_sql}");
        let count_rows = self
            .db
            .query(&count_sql, &params)
            .map_err(|e| ServiceError::Storage(e.to_string()))?;
        let total = count_rows
            .first()
            .and_then(|r| r.get_i64("cnt"))
            .unwrap_or(0) as usize;

        // Fetch page
        let select_sql = format!(
            "SELECT data FROM tasks {where_sql} ORDER BY created_at DESC LIMIT ?{idx} OFFSET ?{}",
            idx + 1
        );
        let mut select_params = params;
        select_params.push(Value::Integer(limit as i64));
        select_params.push(Value::Integer(offset as i64));

        let rows = self
            .db
            .query(&select_sql, &select_params)
            .map_err(|e| ServiceError::Storage(e.to_string()))?;

        let items = rows
            .iter()
            .map(row_to_task)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ListResult { items, total })
    }

    // -----------------------------------------------------------------------
    // Reconciliation scans
    // -----------------------------------------------------------------------

    /// Oldest-first batch of live tasks, for the reconciliation watchdog.
    pub fn active_tasks(&self, limit: u32) -> Result<Vec<Task>, ServiceError> {
        let rows = self
            .db
            .query(
                &format!(
                    "SELECT data FROM tasks WHERE status IN ({}) \
                     ORDER BY created_at ASC LIMIT ?1",
                    status_literals(ACTIVE)
                ),
                &[Value::Integer(limit as i64)],
            )
            .map_err(|e| ServiceError::Storage(e.to_string()))?;

        rows.iter().map(row_to_task).collect()
    }

    /// All processing tasks, for the heartbeat sweeper.
    pub fn processing_tasks(&self) -> Result<Vec<Task>, ServiceError> {
        let rows = self
            .db
            .query(
                "SELECT data FROM tasks WHERE status = ?1",
                &[Value::Text(TaskStatus::Processing.as_str().to_string())],
            )
            .map_err(|e| ServiceError::Storage(e.to_string()))?;

        rows.iter().map(row_to_task).collect()
    }

    // -----------------------------------------------------------------------
    // Guarded transitions
    // -----------------------------------------------------------------------

    /// Transition queued → processing and stamp the first heartbeat.
    pub fn mark_processing(&self, id: &str, now: &str) -> Result<Option<Task>, ServiceError> {
        let mut task = self.get(id)?;
        if task.status != TaskStatus::Queued {
            return Ok(None);
        }
        task.status = TaskStatus::Processing;
        task.heartbeat_at = Some(now.to_string());
        task.updated_at = now.to_string();
        self.write_guarded(&task, &[TaskStatus::Queued])
    }

    /// Refresh the heartbeat of a processing task.
    pub fn touch_heartbeat(&self, id: &str, now: &str) -> Result<Option<Task>, ServiceError> {
        let mut task = self.get(id)?;
        if task.status != TaskStatus::Processing {
            return Ok(None);
        }
        task.heartbeat_at = Some(now.to_string());
        task.updated_at = now.to_string();
        self.write_guarded(&task, &[TaskStatus::Processing])
    }

    /// Write progress (and optionally a replacement payload) to a live task.
    ///
    /// Also the payload CAS used by the manual completion protocol: a task
    /// that went terminal between the caller's read and this write is left
    /// untouched and `None` is returned.
    pub fn update_progress(
        &self,
        id: &str,
        progress: i64,
        payload: Option<serde_json::Value>,
        now: &str,
    ) -> Result<Option<Task>, ServiceError> {
        let mut task = self.get(id)?;
        if !task.status.is_active() {
            return Ok(None);
        }
        task.progress = progress.clamp(0, 100);
        if let Some(p) = payload {
            task.payload = p;
        }
        task.updated_at = now.to_string();
        self.write_guarded(&task, ACTIVE)
    }

    /// Terminal transition to completed.
    pub fn mark_completed(
        &self,
        id: &str,
        payload: Option<serde_json::Value>,
        billing: Option<BillingInfo>,
        now: &str,
    ) -> Result<Option<Task>, ServiceError> {
        let mut task = self.get(id)?;
        if !task.status.is_active() {
            return Ok(None);
        }
        task.status = TaskStatus::Completed;
        task.progress = 100;
        if let Some(p) = payload {
            task.payload = p;
        }
        if let Some(b) = billing {
            task.billing_info = Some(b);
        }
        finish(&mut task, now);
        self.write_guarded(&task, ACTIVE)
    }

    /// Terminal transition to failed, recording the error taxonomy fields.
    pub fn mark_failed(
        &self,
        id: &str,
        error_code: Option<&str>,
        error_message: &str,
        billing: Option<BillingInfo>,
        now: &str,
    ) -> Result<Option<Task>, ServiceError> {
        let mut task = self.get(id)?;
        if !task.status.is_active() {
            return Ok(None);
        }
        task.status = TaskStatus::Failed;
        task.error_code = error_code.map(str::to_string);
        task.error_message = Some(error_message.to_string());
        if let Some(b) = billing {
            task.billing_info = Some(b);
        }
        finish(&mut task, now);
        self.write_guarded(&task, ACTIVE)
    }

    /// Terminal transition to dismissed ({queued,processing} only).
    pub fn mark_dismissed(&self, id: &str, now: &str) -> Result<Option<Task>, ServiceError> {
        let mut task = self.get(id)?;
        if !task.status.is_active() {
            return Ok(None);
        }
        task.status = TaskStatus::Dismissed;
        finish(&mut task, now);
        self.write_guarded(&task, ACTIVE)
    }

    /// Conditional write: persist `task` only if the stored status is still
    /// one of `from`. Returns the task when the write took effect.
    fn write_guarded(
        &self,
        task: &Task,
        from: &[TaskStatus],
    ) -> Result<Option<Task>, ServiceError> {
        let data =
            serde_json::to_string(task).map_err(|e| ServiceError::Internal(e.to_string()))?;

        let affected = self
            .db
            .exec(
                &format!(
                    "UPDATE tasks SET data = ?1, status = ?2, dedupe_key = ?3 \
                     WHERE id = ?4 AND status IN ({})",
                    status_literals(from)
                ),
                &[
                    Value::Text(data),
                    Value::Text(task.status.as_str().to_string()),
                    Value::opt_text(task.dedupe_key.as_deref()),
                    Value::Text(task.id.clone()),
                ],
            )
            .map_err(|e| ServiceError::Storage(e.to_string()))?;

        Ok((affected > 0).then(|| task.clone()))
    }
}

/// Stamp the terminal fields shared by completed/failed/dismissed.
///
/// Clearing the dedupe key here is what guarantees a dead task never blocks
/// a later submission under the same key.
fn finish(task: &mut Task, now: &str) {
    task.heartbeat_at = None;
    task.dedupe_key = None;
    task.updated_at = now.to_string();
    task.finished_at = Some(now.to_string());
}

/// Render statuses as quoted SQL literals for an IN clause.
fn status_literals(statuses: &[TaskStatus]) -> String {
    statuses
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Deserialize a Task from a row's `data` JSON column.
fn row_to_task(row: &Row) -> Result<Task, ServiceError> {
    let json = row
        .get_str("data")
        .ok_or_else(|| ServiceError::Storage("missing data column".into()))?;
    serde_json::from_str(json).map_err(|e| ServiceError::Storage(format!("bad task json: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::task_type;
    use atelier_core::now_rfc3339;
    use atelier_sql::SqliteStore;

    fn test_store() -> TaskStore {
        let db = Arc::new(SqliteStore::open_in_memory().unwrap());
        TaskStore::new(db).unwrap()
    }

    fn make_task(id: &str, status: TaskStatus) -> Task {
        let now = now_rfc3339();
        Task {
            id: id.into(),
            task_type: task_type::IMAGE_PANEL.into(),
            target_type: "Panel".into(),
            target_id: "panel-1".into(),
            owner_id: "u-1".into(),
            project_id: "p-1".into(),
            episode_id: None,
            status,
            progress: 0,
            payload: serde_json::Value::Null,
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

    #[test]
    fn create_and_get() {
        let store = test_store();
        store.create(&make_task("t1", TaskStatus::Queued)).unwrap();

        let got = store.get("t1").unwrap();
        assert_eq!(got.id, "t1");
        assert_eq!(got.status, TaskStatus::Queued);

        assert!(store.get("nope").is_err());
        assert!(store.try_get("nope").unwrap().is_none());
    }

    #[test]
    fn processing_requires_queued() {
        let store = test_store();
        store.create(&make_task("t1", TaskStatus::Queued)).unwrap();

        let now = now_rfc3339();
        let started = store.mark_processing("t1", &now).unwrap().unwrap();
        assert_eq!(started.status, TaskStatus::Processing);
        assert_eq!(started.heartbeat_at.as_deref(), Some(now.as_str()));

        // Second start attempt misses the guard.
        assert!(store.mark_processing("t1", &now).unwrap().is_none());
    }

    #[test]
    fn terminal_states_are_final() {
        let store = test_store();
        store.create(&make_task("t1", TaskStatus::Processing)).unwrap();

        let now = now_rfc3339();
        assert!(store.mark_completed("t1", None, None, &now).unwrap().is_some());

        // No transition leaves a terminal state.
        assert!(store.mark_failed("t1", None, "late", None, &now).unwrap().is_none());
        assert!(store.mark_dismissed("t1", &now).unwrap().is_none());
        assert!(store.mark_processing("t1", &now).unwrap().is_none());
        assert!(store.update_progress("t1", 10, None, &now).unwrap().is_none());

        let got = store.get("t1").unwrap();
        assert_eq!(got.status, TaskStatus::Completed);
        assert_eq!(got.progress, 100);
        assert!(got.finished_at.is_some());
        assert!(got.heartbeat_at.is_none());
    }

    #[test]
    fn terminal_write_clears_dedupe_key() {
        let store = test_store();
        let mut task = make_task("t1", TaskStatus::Queued);
        task.dedupe_key = Some("panel-1:render".into());
        store.create(&task).unwrap();

        assert!(store
            .find_active_by_dedupe_key("panel-1:render")
            .unwrap()
            .is_some());

        let now = now_rfc3339();
        store.mark_failed("t1", Some("X"), "boom", None, &now).unwrap().unwrap();

        // Key is free again: neither the column nor the data row holds it.
        assert!(store
            .find_active_by_dedupe_key("panel-1:render")
            .unwrap()
            .is_none());
        assert!(store.get("t1").unwrap().dedupe_key.is_none());
    }

    #[test]
    fn dedupe_lookup_ignores_terminal_rows() {
        let store = test_store();
        let mut dead = make_task("dead", TaskStatus::Queued);
        dead.dedupe_key = Some("k".into());
        store.create(&dead).unwrap();
        store.mark_dismissed("dead", &now_rfc3339()).unwrap().unwrap();

        assert!(store.find_active_by_dedupe_key("k").unwrap().is_none());

        let mut live = make_task("live", TaskStatus::Processing);
        live.dedupe_key = Some("k".into());
        store.create(&live).unwrap();

        let found = store.find_active_by_dedupe_key("k").unwrap().unwrap();
        assert_eq!(found.id, "live");
    }

    #[test]
    fn heartbeat_only_while_processing() {
        let store = test_store();
        store.create(&make_task("t1", TaskStatus::Queued)).unwrap();

        let now = now_rfc3339();
        assert!(store.touch_heartbeat("t1", &now).unwrap().is_none());

        store.mark_processing("t1", &now).unwrap().unwrap();
        let later = now_rfc3339();
        let touched = store.touch_heartbeat("t1", &later).unwrap().unwrap();
        assert_eq!(touched.heartbeat_at.as_deref(), Some(later.as_str()));
    }

    #[test]
    fn progress_updates_payload() {
        let store = test_store();
        store.create(&make_task("t1", TaskStatus::Processing)).unwrap();

        let now = now_rfc3339();
        let updated = store
            .update_progress("t1", 250, Some(serde_json::json!({"stage": "half"})), &now)
            .unwrap()
            .unwrap();
        assert_eq!(updated.progress, 100, "clamped");
        assert_eq!(updated.payload["stage"], "half");
    }

    #[test]
    fn active_tasks_oldest_first() {
        let store = test_store();
        let mut old = make_task("old", TaskStatus::Queued);
        old.created_at = "2026-01-01T00:00:00+00:00".into();
        let mut newer = make_task("newer", TaskStatus::Processing);
        newer.created_at = "2026-02-01T00:00:00+00:00".into();
        let mut done = make_task("done", TaskStatus::Completed);
        done.created_at = "2025-12-01T00:00:00+00:00".into();
        store.create(&newer).unwrap();
        store.create(&old).unwrap();
        store.create(&done).unwrap();

        let batch = store.active_tasks(10).unwrap();
        assert_eq!(
            batch.iter().map(|t| t.id.as_str()).collect::<Vec<_>>(),
            vec!["old", "newer"]
        );

        let capped = store.active_tasks(1).unwrap();
        assert_eq!(capped.len(), 1);
        assert_eq!(capped[0].id, "old");
    }

    #[test]
    fn list_filters() {
        let store = test_store();
        let mut a = make_task("a", TaskStatus::Queued);
        a.owner_id = "u-1".into();
        let mut b = make_task("b", TaskStatus::Completed);
        b.owner_id = "u-2".into();
        store.create(&a).unwrap();
        store.create(&b).unwrap();

        let result = store
            .list(&TaskListQuery {
                owner_id: Some("u-1".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(result.total, 1);
        assert_eq!(result.items[0].id, "a");

        let result = store
            .list(&TaskListQuery {
                status: Some("completed".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(result.total, 1);
        assert_eq!(result.items[0].id, "b");
    }
}
