use std::time::{Duration, SystemTime};

use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};

use crate::models::{
    CoreError, CoreErrorKind, SessionId, Task, TaskId, TaskStatus, task::invalid_transition,
};
use crate::persistence::{PersistenceResult, TaskStore};
use crate::sqlite::store::{
    SqliteStore, deadline_millis, ensure_schema_ready, from_json, from_unix_millis,
    storage_error_sqlite, to_json, to_unix_millis,
};

const TASK_COLUMNS: &str = "task_id, session_id, status, progress, stage, inputs_json, \
     outputs_json, options_json, page_count, file_errors_json, error_message, job_handle, \
     created_at_ms, updated_at_ms, completed_at_ms, expires_at_ms";

/// Read-modify-write outcome: the outer error is SQLite, the inner one is a rejected change.
type Checked<T> = rusqlite::Result<PersistenceResult<T>>;

impl TaskStore for SqliteStore {
    fn store(&self, task: &Task, ttl: Duration) -> PersistenceResult<()> {
        self.with_connection("store_task", |connection| {
            ensure_schema_ready(connection)?;
            let expires_at_ms = deadline_millis(SystemTime::now(), ttl)?;
            let transaction = connection.transaction()?;
            transaction.execute(
                &format!(
                    "INSERT OR REPLACE INTO task_records ({TASK_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
                ),
                params![
                    task.id.as_str(),
                    task.session_id.as_str(),
                    task.status.as_str(),
                    task.progress.min(100),
                    task.stage.as_deref(),
                    to_json(&task.inputs)?,
                    to_json(&task.outputs)?,
                    to_json(&task.options)?,
                    task.page_count,
                    to_json(&task.file_errors)?,
                    task.error_message.as_deref(),
                    task.job_handle.as_deref(),
                    to_unix_millis(task.created_at)?,
                    to_unix_millis(task.updated_at)?,
                    task.completed_at.map(to_unix_millis).transpose()?,
                    expires_at_ms,
                ],
            )?;
            transaction.execute(
                "
INSERT INTO session_task_index (session_id, task_id, expires_at_ms)
VALUES (?1, ?2, ?3)
ON CONFLICT(session_id, task_id) DO UPDATE SET expires_at_ms = excluded.expires_at_ms
",
                params![task.session_id.as_str(), task.id.as_str(), expires_at_ms],
            )?;
            transaction.commit()
        })
    }

    fn get(&self, id: &TaskId) -> PersistenceResult<Option<Task>> {
        self.with_connection("get_task", |connection| {
            ensure_schema_ready(connection)?;
            load_live_task(connection, id, SystemTime::now())
        })
    }

    fn update(&self, task: &Task) -> PersistenceResult<bool> {
        self.with_connection("update_task", |connection| -> Checked<bool> {
            ensure_schema_ready(connection)?;
            let now = SystemTime::now();
            let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let Some(current) = load_live_task(&transaction, &task.id, now)? else {
                return Ok(Ok(false));
            };
            if current.session_id != task.session_id {
                return Ok(Err(CoreError::for_task(
                    &task.id,
                    CoreErrorKind::InvalidInput,
                    "a task cannot move to another session",
                )));
            }
            if !current.status.can_transition_to(task.status) {
                return Ok(Err(invalid_transition(&task.id, current.status, task.status)));
            }

            let mut next = task.clone();
            let is_retry =
                current.status == TaskStatus::Failed && task.status == TaskStatus::Queued;
            if !is_retry {
                next.progress = current.progress.max(task.progress);
            }
            next.updated_at = now;
            write_task(&transaction, &next)?;
            transaction.commit()?;
            Ok(Ok(true))
        })?
    }

    fn update_status(
        &self,
        id: &TaskId,
        status: TaskStatus,
        progress: Option<u8>,
        error: Option<&str>,
    ) -> PersistenceResult<bool> {
        self.with_connection("update_task_status", |connection| -> Checked<bool> {
            ensure_schema_ready(connection)?;
            let now = SystemTime::now();
            let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let Some(mut task) = load_live_task(&transaction, id, now)? else {
                return Ok(Ok(false));
            };
            if let Err(error) = task.transition_to(status, now) {
                return Ok(Err(error));
            }
            if let Some(progress) = progress {
                task.progress = task.progress.max(progress.min(100));
            }
            if let Some(message) = error {
                task.error_message = Some(message.to_string());
            }
            write_task(&transaction, &task)?;
            transaction.commit()?;
            Ok(Ok(true))
        })?
    }

    fn update_progress(
        &self,
        id: &TaskId,
        progress: u8,
        stage: Option<&str>,
    ) -> PersistenceResult<bool> {
        self.with_connection("update_task_progress", |connection| {
            ensure_schema_ready(connection)?;
            let now_ms = to_unix_millis(SystemTime::now())?;
            let changed = connection.execute(
                "
UPDATE task_records
SET progress = MAX(progress, ?2),
    stage = COALESCE(?3, stage),
    updated_at_ms = ?4
WHERE task_id = ?1
  AND expires_at_ms > ?4
  AND status IN ('queued', 'processing')
",
                params![id.as_str(), progress.min(100), stage, now_ms],
            )?;
            Ok(changed > 0)
        })
    }

    fn set_job_handle(&self, id: &TaskId, handle: &str) -> PersistenceResult<bool> {
        self.with_connection("set_job_handle", |connection| {
            ensure_schema_ready(connection)?;
            let changed = connection.execute(
                "
UPDATE task_records
SET job_handle = ?2
WHERE task_id = ?1
  AND expires_at_ms > ?3
  AND (job_handle IS NULL OR job_handle = ?2)
",
                params![id.as_str(), handle, to_unix_millis(SystemTime::now())?],
            )?;
            Ok(changed > 0)
        })
    }

    fn begin_processing(&self, id: &TaskId, handle: &str) -> PersistenceResult<bool> {
        self.with_connection("begin_task_processing", |connection| -> Checked<bool> {
            ensure_schema_ready(connection)?;
            let now = SystemTime::now();
            let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let Some(mut task) = load_live_task(&transaction, id, now)? else {
                return Ok(Ok(false));
            };
            let recorded = task.job_handle.as_deref();
            let allowed = match task.status {
                TaskStatus::Queued => recorded.is_none_or(|current| current == handle),
                TaskStatus::Processing => recorded == Some(handle),
                _ => false,
            };
            if !allowed {
                return Ok(Ok(false));
            }
            if task.status == TaskStatus::Queued {
                if let Err(error) = task.transition_to(TaskStatus::Processing, now) {
                    return Ok(Err(error));
                }
                task.job_handle = Some(handle.to_string());
                write_task(&transaction, &task)?;
                transaction.commit()?;
            }
            Ok(Ok(true))
        })?
    }

    fn mark_cancelled(&self, id: &TaskId, reason: &str) -> PersistenceResult<bool> {
        self.with_connection("mark_task_cancelled", |connection| -> Checked<bool> {
            ensure_schema_ready(connection)?;
            let now = SystemTime::now();
            let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let Some(mut task) = load_live_task(&transaction, id, now)? else {
                return Ok(Ok(false));
            };
            if !task.status.is_cancellable() {
                return Ok(Err(invalid_transition(id, task.status, TaskStatus::Failed)));
            }
            task.status = TaskStatus::Failed;
            task.error_message = Some(reason.to_string());
            task.completed_at = Some(now);
            task.updated_at = now;
            write_task(&transaction, &task)?;
            transaction.commit()?;
            Ok(Ok(true))
        })?
    }

    fn get_by_session(&self, session_id: &SessionId) -> PersistenceResult<Vec<Task>> {
        self.with_connection("get_tasks_by_session", |connection| {
            ensure_schema_ready(connection)?;
            let mut statement = connection.prepare(&format!(
                "
SELECT {TASK_COLUMNS}
FROM task_records
WHERE task_id IN (
        SELECT task_id FROM session_task_index
        WHERE session_id = ?1 AND expires_at_ms > ?2
    )
  AND session_id = ?1
  AND expires_at_ms > ?2
ORDER BY created_at_ms ASC
"
            ))?;
            let rows = statement.query_map(
                params![session_id.as_str(), to_unix_millis(SystemTime::now())?],
                task_from_row,
            )?;
            rows.collect()
        })
    }

    fn delete(&self, id: &TaskId, session_id: &SessionId) -> PersistenceResult<bool> {
        self.with_connection("delete_task", |connection| {
            ensure_schema_ready(connection)?;
            let transaction = connection.transaction()?;
            let removed = transaction.execute(
                "DELETE FROM task_records WHERE task_id = ?1 AND session_id = ?2",
                params![id.as_str(), session_id.as_str()],
            )?;
            transaction.execute(
                "DELETE FROM session_task_index WHERE task_id = ?1 AND session_id = ?2",
                params![id.as_str(), session_id.as_str()],
            )?;
            transaction.commit()?;
            Ok(removed > 0)
        })
    }

    fn list_by_status(&self, status: TaskStatus) -> PersistenceResult<Vec<Task>> {
        self.with_connection("list_tasks_by_status", |connection| {
            ensure_schema_ready(connection)?;
            let mut statement = connection.prepare(&format!(
                "
SELECT {TASK_COLUMNS}
FROM task_records
WHERE status = ?1 AND expires_at_ms > ?2
ORDER BY updated_at_ms ASC
"
            ))?;
            let rows = statement.query_map(
                params![status.as_str(), to_unix_millis(SystemTime::now())?],
                task_from_row,
            )?;
            rows.collect()
        })
    }

    fn purge_expired(&self) -> PersistenceResult<usize> {
        self.with_connection("purge_expired_tasks", |connection| {
            ensure_schema_ready(connection)?;
            connection.execute(
                "DELETE FROM task_records WHERE expires_at_ms <= ?1",
                [to_unix_millis(SystemTime::now())?],
            )
        })
    }

    fn prune_session_index(&self) -> PersistenceResult<usize> {
        self.with_connection("prune_session_index", |connection| {
            ensure_schema_ready(connection)?;
            connection.execute(
                "
DELETE FROM session_task_index
WHERE expires_at_ms <= ?1
   OR NOT EXISTS (
        SELECT 1 FROM task_records
        WHERE task_records.task_id = session_task_index.task_id
          AND task_records.expires_at_ms > ?1
    )
",
                [to_unix_millis(SystemTime::now())?],
            )
        })
    }

    fn status_counts(&self) -> PersistenceResult<Vec<(TaskStatus, u64)>> {
        self.with_connection("task_status_counts", |connection| {
            ensure_schema_ready(connection)?;
            let mut statement = connection.prepare(
                "
SELECT status, COUNT(*)
FROM task_records
WHERE expires_at_ms > ?1
GROUP BY status
",
            )?;
            let rows = statement.query_map([to_unix_millis(SystemTime::now())?], |row| {
                let status: String = row.get(0)?;
                let count: i64 = row.get(1)?;
                Ok((parse_task_status(&status)?, u64::try_from(count).unwrap_or(0)))
            })?;
            let observed = rows.collect::<rusqlite::Result<Vec<_>>>()?;

            Ok(TaskStatus::ALL
                .into_iter()
                .map(|status| {
                    let count = observed
                        .iter()
                        .find(|(candidate, _)| *candidate == status)
                        .map(|(_, count)| *count)
                        .unwrap_or(0);
                    (status, count)
                })
                .collect())
        })
    }
}

fn load_live_task(
    connection: &Connection,
    id: &TaskId,
    now: SystemTime,
) -> rusqlite::Result<Option<Task>> {
    connection
        .query_row(
            &format!(
                "SELECT {TASK_COLUMNS} FROM task_records WHERE task_id = ?1 AND expires_at_ms > ?2"
            ),
            params![id.as_str(), to_unix_millis(now)?],
            task_from_row,
        )
        .optional()
}

/// Writes every mutable column. `expires_at_ms` and the owning session are never rewritten.
fn write_task(connection: &Connection, task: &Task) -> rusqlite::Result<()> {
    connection.execute(
        "
UPDATE task_records
SET status = ?2,
    progress = ?3,
    stage = ?4,
    inputs_json = ?5,
    outputs_json = ?6,
    options_json = ?7,
    page_count = ?8,
    file_errors_json = ?9,
    error_message = ?10,
    job_handle = ?11,
    updated_at_ms = ?12,
    completed_at_ms = ?13
WHERE task_id = ?1
",
        params![
            task.id.as_str(),
            task.status.as_str(),
            task.progress.min(100),
            task.stage.as_deref(),
            to_json(&task.inputs)?,
            to_json(&task.outputs)?,
            to_json(&task.options)?,
            task.page_count,
            to_json(&task.file_errors)?,
            task.error_message.as_deref(),
            task.job_handle.as_deref(),
            to_unix_millis(task.updated_at)?,
            task.completed_at.map(to_unix_millis).transpose()?,
        ],
    )?;
    Ok(())
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    let raw_id: String = row.get(0)?;
    let raw_session: String = row.get(1)?;
    let raw_status: String = row.get(2)?;
    let inputs: String = row.get(5)?;
    let outputs: String = row.get(6)?;
    let options: String = row.get(7)?;
    let file_errors: String = row.get(9)?;
    let completed_at: Option<i64> = row.get(14)?;

    Ok(Task {
        id: TaskId::parse(&raw_id).map_err(|error| storage_error_sqlite(&error.message))?,
        session_id: SessionId::parse(&raw_session)
            .map_err(|error| storage_error_sqlite(&error.message))?,
        status: parse_task_status(&raw_status)?,
        progress: row.get(3)?,
        stage: row.get(4)?,
        inputs: from_json(&inputs, "inputs_json")?,
        outputs: from_json(&outputs, "outputs_json")?,
        options: from_json(&options, "options_json")?,
        page_count: row.get(8)?,
        file_errors: from_json(&file_errors, "file_errors_json")?,
        error_message: row.get(10)?,
        job_handle: row.get(11)?,
        created_at: from_unix_millis(row.get(12)?)?,
        updated_at: from_unix_millis(row.get(13)?)?,
        completed_at: completed_at.map(from_unix_millis).transpose()?,
        expires_at: Some(from_unix_millis(row.get(15)?)?),
    })
}

fn parse_task_status(raw: &str) -> rusqlite::Result<TaskStatus> {
    raw.parse::<TaskStatus>().map_err(|_| {
        storage_error_sqlite(&format!("unknown task status '{raw}' in sqlite record"))
    })
}
