use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::Serialize;

use crate::artifacts::{AgeCleanupReport, ArtifactStorage, RoleUsage};
use crate::models::{
    ArtifactRole, CoreError, CoreErrorKind, Session, SessionId, Task, TaskId, TaskStatus, TaskView,
};
use crate::orchestration::{TaskQueue, run_blocking};
use crate::persistence::TaskStore;
use crate::registry::SessionRegistry;

pub type GatewayResult<T> = Result<T, CoreError>;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Upload {
    pub filename: String,
    pub bytes: Vec<u8>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct UsageReport {
    pub storage: Vec<RoleUsage>,
    pub tasks: Vec<(TaskStatus, u64)>,
    pub pending_jobs: Option<u64>,
    pub queue_degraded: bool,
}

/// Entry point for the HTTP layer. Every session-scoped call validates the
/// session before touching task records or artifacts.
#[derive(Clone)]
pub struct Gateway {
    sessions: Arc<SessionRegistry>,
    tasks: Arc<dyn TaskStore>,
    storage: ArtifactStorage,
    queue: Arc<TaskQueue>,
    task_ttl: Duration,
}

impl Gateway {
    pub fn new(
        sessions: Arc<SessionRegistry>,
        tasks: Arc<dyn TaskStore>,
        storage: ArtifactStorage,
        queue: Arc<TaskQueue>,
        task_ttl: Duration,
    ) -> Self {
        Self {
            sessions,
            tasks,
            storage,
            queue,
            task_ttl,
        }
    }

    pub async fn create_session(&self) -> GatewayResult<Session> {
        let sessions = self.sessions.clone();
        run_blocking("create_session", move || sessions.create()).await
    }

    /// Creates a task from the uploaded files and enqueues it. If publishing
    /// fails the task stays Queued; the error carries its id so `start` can
    /// be retried.
    pub async fn submit_upload(
        &self,
        session: &str,
        uploads: Vec<Upload>,
        options: BTreeMap<String, String>,
    ) -> GatewayResult<TaskView> {
        let session_id = self.authorize(session).await?;
        if uploads.is_empty() {
            return Err(CoreError::new(
                CoreErrorKind::InvalidInput,
                "an upload needs at least one file",
            ));
        }

        let mut task = Task::new(session_id.clone(), options, SystemTime::now());
        let storage = self.storage.clone();
        let owner = session_id.clone();
        let id = task.id.clone();
        task.inputs = run_blocking("store_inputs", move || {
            uploads
                .iter()
                .map(|upload| {
                    storage
                        .store(&owner, &id, ArtifactRole::Input, &upload.filename, &upload.bytes)
                        .map(|stored| stored.reference)
                })
                .collect()
        })
        .await?;

        let tasks = self.tasks.clone();
        let sessions = self.sessions.clone();
        let record = task.clone();
        let ttl = self.task_ttl;
        run_blocking("store_task", move || {
            tasks.store(&record, ttl)?;
            sessions.increment_task_count(&record.session_id)?;
            Ok(())
        })
        .await?;
        tracing::info!(task_id = %task.id, inputs = task.inputs.len(), "task created");

        self.queue.enqueue(&task.id, &session_id).await?;
        Ok(self.load_owned(&task.id, &session_id).await?.view())
    }

    pub async fn task_status(&self, session: &str, task: &str) -> GatewayResult<TaskView> {
        let session_id = self.authorize(session).await?;
        let task_id = parse_task_id(task)?;
        Ok(self.load_owned(&task_id, &session_id).await?.view())
    }

    pub async fn list_tasks(&self, session: &str) -> GatewayResult<Vec<TaskView>> {
        let session_id = self.authorize(session).await?;
        let tasks = self.tasks.clone();
        let listed = run_blocking("list_tasks", move || tasks.get_by_session(&session_id)).await?;
        Ok(listed.iter().map(Task::view).collect())
    }

    /// Publishes a task whose earlier enqueue failed.
    pub async fn start(&self, session: &str, task: &str) -> GatewayResult<TaskView> {
        let session_id = self.authorize(session).await?;
        let task_id = parse_task_id(task)?;
        self.queue.enqueue(&task_id, &session_id).await?;
        Ok(self.load_owned(&task_id, &session_id).await?.view())
    }

    pub async fn cancel(&self, session: &str, task: &str) -> GatewayResult<TaskView> {
        let session_id = self.authorize(session).await?;
        let task_id = parse_task_id(task)?;
        self.queue.cancel(&task_id, &session_id).await?;
        Ok(self.load_owned(&task_id, &session_id).await?.view())
    }

    pub async fn retry(&self, session: &str, task: &str) -> GatewayResult<TaskView> {
        let session_id = self.authorize(session).await?;
        let task_id = parse_task_id(task)?;
        self.queue.retry(&task_id, &session_id).await?;
        Ok(self.load_owned(&task_id, &session_id).await?.view())
    }

    /// Physical path of one output file, only for its owning session.
    pub async fn resolve_download(
        &self,
        session: &str,
        task: &str,
        filename: &str,
    ) -> GatewayResult<PathBuf> {
        let session_id = self.authorize(session).await?;
        let task_id = parse_task_id(task)?;
        let record = self.load_owned(&task_id, &session_id).await?;
        if !record
            .outputs
            .iter()
            .any(|artifact| artifact.filename == filename)
        {
            return Err(download_not_found(&task_id, filename));
        }

        let storage = self.storage.clone();
        let name = filename.to_string();
        let resolved = run_blocking("resolve_download", move || {
            let role = ArtifactRole::Output;
            Ok(storage
                .verify_access(&session_id, &task_id, role, &name)
                .then(|| storage.resolve(&session_id, &task_id, role, &name))
                .flatten())
        })
        .await?;
        resolved.ok_or_else(|| download_not_found(&record.id, filename))
    }

    /// Cancels the task if it is still active, then removes its record and
    /// every artifact.
    pub async fn delete_task(&self, session: &str, task: &str) -> GatewayResult<()> {
        let session_id = self.authorize(session).await?;
        let task_id = parse_task_id(task)?;
        let record = self.load_owned(&task_id, &session_id).await?;
        if record.status.is_cancellable()
            && let Err(error) = self.queue.cancel(&task_id, &session_id).await
        {
            tracing::warn!(
                task_id = %task_id,
                kind = ?error.kind,
                message = %error.message,
                "cancel before delete failed"
            );
        }

        let tasks = self.tasks.clone();
        let storage = self.storage.clone();
        let id = task_id.clone();
        let removed = run_blocking("delete_task", move || {
            let removed = tasks.delete(&id, &session_id)?;
            let stats = storage.cleanup_task(&session_id, &id);
            Ok((removed, stats))
        })
        .await?;
        tracing::info!(
            task_id = %task_id,
            record_removed = removed.0,
            files_removed = removed.1.files_removed,
            "task deleted"
        );
        Ok(())
    }

    pub async fn admin_cleanup(&self, max_age: Duration) -> GatewayResult<AgeCleanupReport> {
        let storage = self.storage.clone();
        run_blocking("admin_cleanup", move || Ok(storage.cleanup_older_than(max_age))).await
    }

    pub async fn admin_usage(&self) -> GatewayResult<UsageReport> {
        let storage = self.storage.clone();
        let tasks = self.tasks.clone();
        let (usage, counts) = run_blocking("admin_usage", move || {
            Ok((storage.usage(), tasks.status_counts()?))
        })
        .await?;
        let pending_jobs = self.queue.pending_jobs().await.ok();
        Ok(UsageReport {
            storage: usage,
            tasks: counts,
            pending_jobs,
            queue_degraded: self.queue.is_degraded(),
        })
    }

    async fn authorize(&self, session: &str) -> GatewayResult<SessionId> {
        let sessions = self.sessions.clone();
        let raw = session.to_string();
        run_blocking("authorize_session", move || sessions.authorize(&raw)).await
    }

    async fn load_owned(&self, task_id: &TaskId, session_id: &SessionId) -> GatewayResult<Task> {
        let tasks = self.tasks.clone();
        let id = task_id.clone();
        let found = run_blocking("get_task", move || tasks.get(&id)).await?;
        match found {
            Some(task) if task.owned_by(session_id) => Ok(task),
            _ => Err(CoreError::task_not_found(task_id)),
        }
    }
}

/// Malformed ids look exactly like unknown ones.
fn parse_task_id(raw: &str) -> GatewayResult<TaskId> {
    TaskId::parse(raw).map_err(|_| {
        CoreError::new(CoreErrorKind::NotFound, format!("task '{raw}' was not found"))
    })
}

fn download_not_found(task_id: &TaskId, filename: &str) -> CoreError {
    CoreError::for_task(
        task_id,
        CoreErrorKind::NotFound,
        format!("download '{filename}' was not found"),
    )
}
