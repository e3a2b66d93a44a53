use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::models::{
    CoreError, CoreErrorKind, ErrorView, SessionId, Task, TaskId, TaskStatus,
    task::invalid_transition,
};
use crate::orchestration::{
    JobBroker, JobEnvelope, JobHandle, OrchestrationResult, RetryPolicy, retry_transient,
    run_blocking,
};
use crate::persistence::TaskStore;

pub const CANCELLATION_REASON: &str = "cancelled by user";

const PING_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub round_trip_ms: Option<u64>,
    pub pending_jobs: Option<u64>,
    pub error: Option<ErrorView>,
}

/// Request-side view of the job queue: publishes, cancels and retries tasks
/// on behalf of their owning session.
pub struct TaskQueue {
    store: Arc<dyn TaskStore>,
    broker: Arc<dyn JobBroker>,
    publish_policy: RetryPolicy,
    degraded: AtomicBool,
}

impl TaskQueue {
    pub fn new(
        store: Arc<dyn TaskStore>,
        broker: Arc<dyn JobBroker>,
        publish_policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            broker,
            publish_policy,
            degraded: AtomicBool::new(false),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Publishes a Queued task. On failure the task stays Queued and the
    /// call can be repeated. A task that already has a job keeps it, and its
    /// handle is returned instead of publishing another.
    pub async fn enqueue(
        &self,
        task_id: &TaskId,
        session_id: &SessionId,
    ) -> OrchestrationResult<JobHandle> {
        let task = self.owned_task(task_id, session_id).await?;
        if task.status != TaskStatus::Queued {
            return Err(CoreError::for_task(
                task_id,
                CoreErrorKind::InvalidTransition,
                format!("task '{task_id}' is '{}' and cannot be enqueued", task.status),
            ));
        }
        if let Some(existing) = task.job_handle {
            tracing::debug!(task_id = %task_id, job = %existing, "task already has a job");
            return Ok(JobHandle::from_raw(existing));
        }

        let envelope = JobEnvelope::Process {
            task_id: task_id.clone(),
            session_id: session_id.clone(),
        };
        let published = retry_transient(&self.publish_policy, "publish_job", || {
            let broker = self.broker.clone();
            let envelope = envelope.clone();
            run_blocking("publish_job", move || broker.publish(&envelope))
        })
        .await;
        let handle = match published {
            Ok(handle) => {
                self.degraded.store(false, Ordering::SeqCst);
                handle
            }
            Err(error) => {
                if error.kind.is_transient() {
                    self.degraded.store(true, Ordering::SeqCst);
                }
                tracing::error!(
                    task_id = %task_id,
                    kind = ?error.kind,
                    message = %error.message,
                    "failed to publish task job"
                );
                return Err(CoreError {
                    task: Some(task_id.clone()),
                    ..error
                });
            }
        };

        let store = self.store.clone();
        let id = task_id.clone();
        let raw_handle = handle.as_str().to_string();
        let recorded = run_blocking("set_job_handle", move || {
            store.set_job_handle(&id, &raw_handle)
        })
        .await?;
        if !recorded {
            self.revoke_quietly(task_id, handle.clone()).await;
            let current = self.owned_task(task_id, session_id).await?;
            return match current.job_handle {
                Some(existing) => Ok(JobHandle::from_raw(existing)),
                None => Err(CoreError::for_task(
                    task_id,
                    CoreErrorKind::InvalidTransition,
                    format!("task '{task_id}' could not record its job"),
                )),
            };
        }

        tracing::debug!(task_id = %task_id, job = %handle, "task enqueued");
        Ok(handle)
    }

    /// Queued or Processing to Failed. A running worker notices at its next
    /// checkpoint and discards its results.
    pub async fn cancel(
        &self,
        task_id: &TaskId,
        session_id: &SessionId,
    ) -> OrchestrationResult<()> {
        let task = self.owned_task(task_id, session_id).await?;
        if !task.status.is_cancellable() {
            return Err(invalid_transition(task_id, task.status, TaskStatus::Failed));
        }

        if let Some(raw_handle) = task.job_handle {
            self.revoke_quietly(task_id, JobHandle::from_raw(raw_handle))
                .await;
        }

        let store = self.store.clone();
        let id = task_id.clone();
        let cancelled = run_blocking("mark_cancelled", move || {
            store.mark_cancelled(&id, CANCELLATION_REASON)
        })
        .await?;
        if !cancelled {
            return Err(CoreError::task_not_found(task_id));
        }
        tracing::info!(task_id = %task_id, "task cancelled");
        Ok(())
    }

    /// Failed back to Queued with error, progress and outputs cleared, then re-published.
    pub async fn retry(
        &self,
        task_id: &TaskId,
        session_id: &SessionId,
    ) -> OrchestrationResult<JobHandle> {
        let task = self.owned_task(task_id, session_id).await?;
        if task.status != TaskStatus::Failed {
            return Err(invalid_transition(task_id, task.status, TaskStatus::Queued));
        }

        let store = self.store.clone();
        let id = task_id.clone();
        let reset = run_blocking("retry_task", move || {
            store.update_status(&id, TaskStatus::Queued, None, None)
        })
        .await?;
        if !reset {
            return Err(CoreError::task_not_found(task_id));
        }
        self.enqueue(task_id, session_id).await
    }

    /// Sends a ping through the queue and waits for a worker to answer it.
    pub async fn health_check(&self, timeout: Duration) -> HealthReport {
        let started = Instant::now();
        let outcome = self.ping_round_trip(timeout).await;
        let healthy = outcome.is_ok();
        self.degraded.store(!healthy, Ordering::SeqCst);

        let pending_jobs = self.pending_jobs().await.ok();

        if let Err(error) = &outcome {
            tracing::warn!(
                kind = ?error.kind,
                message = %error.message,
                "job queue health check failed"
            );
        }

        HealthReport {
            healthy,
            round_trip_ms: healthy.then(|| started.elapsed().as_millis() as u64),
            pending_jobs,
            error: outcome.err().map(|error| error.view()),
        }
    }

    pub async fn pending_jobs(&self) -> OrchestrationResult<u64> {
        let broker = self.broker.clone();
        run_blocking("pending_jobs", move || broker.pending_jobs()).await
    }

    async fn ping_round_trip(&self, timeout: Duration) -> OrchestrationResult<()> {
        let nonce = uuid::Uuid::new_v4().to_string();
        let broker = self.broker.clone();
        let envelope = JobEnvelope::Ping {
            nonce: nonce.clone(),
        };
        let handle = run_blocking("publish_ping", move || broker.publish(&envelope)).await?;

        let deadline = Instant::now() + timeout;
        loop {
            let broker = self.broker.clone();
            let pending = nonce.clone();
            if run_blocking("consume_ping", move || broker.consume_ping(&pending)).await? {
                return Ok(());
            }
            if Instant::now() >= deadline {
                let broker = self.broker.clone();
                let _ = run_blocking("revoke_ping", move || broker.revoke(&handle)).await;
                return Err(CoreError::new(
                    CoreErrorKind::Timeout,
                    format!(
                        "no worker answered the health ping within {} ms",
                        timeout.as_millis()
                    ),
                ));
            }
            tokio::time::sleep(PING_POLL_INTERVAL).await;
        }
    }

    /// Another session's task is reported exactly like a missing one.
    async fn owned_task(
        &self,
        task_id: &TaskId,
        session_id: &SessionId,
    ) -> OrchestrationResult<Task> {
        let store = self.store.clone();
        let id = task_id.clone();
        let task = run_blocking("get_task", move || store.get(&id)).await?;
        match task {
            Some(task) if task.owned_by(session_id) => Ok(task),
            _ => Err(CoreError::task_not_found(task_id)),
        }
    }

    async fn revoke_quietly(&self, task_id: &TaskId, handle: JobHandle) {
        let broker = self.broker.clone();
        if let Err(error) = run_blocking("revoke_job", move || broker.revoke(&handle)).await {
            tracing::warn!(
                task_id = %task_id,
                kind = ?error.kind,
                message = %error.message,
                "could not revoke queued job"
            );
        }
    }
}
