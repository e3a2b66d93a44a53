use std::time::Duration;

use crate::models::{CoreError, Session, SessionId, Task, TaskId, TaskStatus};

pub type PersistenceResult<T> = Result<T, CoreError>;

pub trait MigrationStore: Send + Sync {
    fn current_version(&self) -> PersistenceResult<i64>;

    fn apply_migration(&self, target_version: i64) -> PersistenceResult<()>;
}

pub trait SessionStore: Send + Sync {
    fn insert_session(&self, session: &Session, ttl: Duration) -> PersistenceResult<()>;

    /// Refreshes activity and pushes the deadline out by `ttl`. Returns false
    /// when the session is unknown or already expired.
    fn touch_session(&self, id: &SessionId, ttl: Duration) -> PersistenceResult<bool>;

    fn increment_task_count(&self, id: &SessionId, ttl: Duration) -> PersistenceResult<bool>;

    fn get_session(&self, id: &SessionId) -> PersistenceResult<Option<Session>>;

    fn purge_expired_sessions(&self) -> PersistenceResult<usize>;
}

pub trait TaskStore: Send + Sync {
    fn store(&self, task: &Task, ttl: Duration) -> PersistenceResult<()>;

    /// Expired records are reported as absent.
    fn get(&self, id: &TaskId) -> PersistenceResult<Option<Task>>;

    /// Replaces a live record, keeping its expiry. Returns false when the key is absent.
    fn update(&self, task: &Task) -> PersistenceResult<bool>;

    fn update_status(
        &self,
        id: &TaskId,
        status: TaskStatus,
        progress: Option<u8>,
        error: Option<&str>,
    ) -> PersistenceResult<bool>;

    /// Raises progress to `max(current, progress)` for a Queued or Processing task.
    fn update_progress(
        &self,
        id: &TaskId,
        progress: u8,
        stage: Option<&str>,
    ) -> PersistenceResult<bool>;

    /// Records the job that carries the task. Returns false when the task is
    /// absent or already carried by a different job.
    fn set_job_handle(&self, id: &TaskId, handle: &str) -> PersistenceResult<bool>;

    /// Lets the job `handle` run the task: Queued moves to Processing when no
    /// other job is recorded, and Processing is re-entered only by the job
    /// recorded on it. Returns false for every other delivery.
    fn begin_processing(&self, id: &TaskId, handle: &str) -> PersistenceResult<bool>;

    /// Queued or Processing to Failed with `reason`. Returns false when the key is absent.
    fn mark_cancelled(&self, id: &TaskId, reason: &str) -> PersistenceResult<bool>;

    fn get_by_session(&self, session_id: &SessionId) -> PersistenceResult<Vec<Task>>;

    fn delete(&self, id: &TaskId, session_id: &SessionId) -> PersistenceResult<bool>;

    fn list_by_status(&self, status: TaskStatus) -> PersistenceResult<Vec<Task>>;

    fn purge_expired(&self) -> PersistenceResult<usize>;

    fn prune_session_index(&self) -> PersistenceResult<usize>;

    fn status_counts(&self) -> PersistenceResult<Vec<(TaskStatus, u64)>>;
}
