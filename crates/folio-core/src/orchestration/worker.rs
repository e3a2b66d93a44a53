use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::artifacts::ArtifactStorage;
use crate::models::{
    ArtifactRef, ArtifactRole, CoreError, CoreErrorKind, FileError, SessionId, Task, TaskId,
    TaskStatus,
};
use crate::orchestration::{
    ClaimedJob, JobBroker, JobEnvelope, OrchestrationResult, RetryPolicy, TaskCancellationToken,
    run_blocking,
};
use crate::persistence::TaskStore;
use crate::progress::{ProgressDisposition, ProgressTracker};
use crate::transform::{
    DocumentTransform, InputDocument, OutputDocument, ProgressReporter, TransformOutput,
    TransformRequest,
};

const MAX_ERROR_SUMMARY_CHARS: usize = 500;

#[derive(Clone, Debug, PartialEq)]
pub struct WorkerSettings {
    pub concurrency: usize,
    /// Must outlast `hard_time_limit`, or a healthy job gets redelivered.
    pub lease: Duration,
    pub poll_interval: Duration,
    pub soft_time_limit: Duration,
    pub hard_time_limit: Duration,
    pub retry: RetryPolicy,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            concurrency: 2,
            lease: Duration::from_secs(330),
            poll_interval: Duration::from_millis(500),
            soft_time_limit: Duration::from_secs(270),
            hard_time_limit: Duration::from_secs(300),
            retry: RetryPolicy::new(3, Duration::from_secs(5), Duration::from_secs(60)),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum JobOutcome {
    Completed { task_id: TaskId, outputs: usize },
    Retrying { task_id: TaskId, attempt: u32, delay: Duration },
    Failed { task_id: TaskId },
    /// The task left Processing while the job ran; results were discarded.
    Cancelled { task_id: TaskId },
    /// Redelivered or orphaned job; nothing was touched.
    Skipped { task_id: TaskId, status: Option<TaskStatus> },
    PingAnswered,
}

#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<WorkerShared>,
}

struct WorkerShared {
    store: Arc<dyn TaskStore>,
    broker: Arc<dyn JobBroker>,
    storage: ArtifactStorage,
    tracker: Arc<ProgressTracker>,
    transform: Arc<dyn DocumentTransform>,
    settings: WorkerSettings,
}

impl WorkerPool {
    pub fn new(
        store: Arc<dyn TaskStore>,
        broker: Arc<dyn JobBroker>,
        storage: ArtifactStorage,
        tracker: Arc<ProgressTracker>,
        transform: Arc<dyn DocumentTransform>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            inner: Arc::new(WorkerShared {
                store,
                broker,
                storage,
                tracker,
                transform,
                settings,
            }),
        }
    }

    pub fn settings(&self) -> &WorkerSettings {
        &self.inner.settings
    }

    /// Starts `concurrency` worker loops. Each finishes its current job and
    /// exits once `shutdown` turns true.
    pub fn spawn(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        (0..self.inner.settings.concurrency.max(1))
            .map(|index| {
                let pool = self.clone();
                let name = format!("worker-{}-{index}", std::process::id());
                let shutdown = shutdown.clone();
                tokio::spawn(async move { pool.run_loop(name, shutdown).await })
            })
            .collect()
    }

    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        for handle in self.spawn(shutdown) {
            if let Err(error) = handle.await {
                tracing::error!(error = %error, "worker loop terminated abnormally");
            }
        }
    }

    /// Claims and fully handles at most one job.
    pub async fn process_next(&self, worker: &str) -> OrchestrationResult<Option<JobOutcome>> {
        let broker = self.inner.broker.clone();
        let owner = worker.to_string();
        let lease = self.inner.settings.lease;
        let claimed = run_blocking("claim_job", move || broker.claim(&owner, lease)).await?;
        let Some(job) = claimed else {
            return Ok(None);
        };

        let outcome = match job.envelope.clone() {
            JobEnvelope::Ping { nonce } => {
                let broker = self.inner.broker.clone();
                run_blocking("record_ping", move || broker.record_ping(&nonce)).await?;
                JobOutcome::PingAnswered
            }
            JobEnvelope::Process {
                task_id,
                session_id,
            } => {
                let result = self.execute(&task_id, &session_id, &job).await;
                self.conclude(&task_id, &job, result).await
            }
        };

        self.settle(&job, &outcome).await?;
        Ok(Some(outcome))
    }

    async fn run_loop(&self, name: String, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(worker = %name, "worker started");
        while !*shutdown.borrow() {
            match self.process_next(&name).await {
                Ok(Some(outcome)) => {
                    tracing::debug!(worker = %name, outcome = ?outcome, "job handled");
                }
                Ok(None) => self.idle(&mut shutdown).await,
                Err(error) => {
                    tracing::error!(
                        worker = %name,
                        kind = ?error.kind,
                        message = %error.message,
                        "worker iteration failed"
                    );
                    self.idle(&mut shutdown).await;
                }
            }
        }
        tracing::info!(worker = %name, "worker stopped");
    }

    async fn idle(&self, shutdown: &mut watch::Receiver<bool>) {
        let poll_interval = self.inner.settings.poll_interval;
        tokio::select! {
            _ = tokio::time::sleep(poll_interval) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    tokio::time::sleep(poll_interval).await;
                }
            }
        }
    }

    async fn execute(
        &self,
        task_id: &TaskId,
        session_id: &SessionId,
        job: &ClaimedJob,
    ) -> OrchestrationResult<JobOutcome> {
        let skipped = |status| JobOutcome::Skipped {
            task_id: task_id.clone(),
            status,
        };

        let Some(task) = self.load(task_id).await? else {
            tracing::warn!(task_id = %task_id, "job refers to a task that no longer exists");
            return Ok(skipped(None));
        };
        if !task.owned_by(session_id) {
            tracing::warn!(task_id = %task_id, "job session does not own the task");
            return Ok(skipped(None));
        }
        if task.status.is_finished() {
            tracing::debug!(task_id = %task_id, status = %task.status, "redelivered job ignored");
            return Ok(skipped(Some(task.status)));
        }
        let store = self.inner.store.clone();
        let id = task_id.clone();
        let handle = job.handle.as_str().to_string();
        let started =
            run_blocking("start_task", move || store.begin_processing(&id, &handle)).await?;
        if !started {
            tracing::info!(
                task_id = %task_id,
                job = %job.handle,
                status = %task.status,
                "task is carried by another job; duplicate ignored"
            );
            return Ok(skipped(Some(task.status)));
        }

        let (request, missing_inputs) = self.prepare_request(&task).await?;
        let output = self.run_transform(task_id, request).await;

        let Some(mut current) = self.load(task_id).await? else {
            return Ok(skipped(None));
        };
        if current.status != TaskStatus::Processing {
            tracing::info!(
                task_id = %task_id,
                status = %current.status,
                "task left processing while running; results discarded"
            );
            return Ok(JobOutcome::Cancelled {
                task_id: task_id.clone(),
            });
        }
        let output = output?;

        let outputs = self.store_outputs(&current, output.documents).await?;
        let output_count = outputs.len();
        current.outputs = outputs;
        current.page_count = output.page_count;
        current.file_errors = missing_inputs;
        current.file_errors.extend(output.file_errors);
        current.stage = Some("completed".to_string());
        current.transition_to(TaskStatus::Completed, SystemTime::now())?;

        let store = self.inner.store.clone();
        let completed = current.clone();
        let written = run_blocking("complete_task", move || store.update(&completed)).await;
        match written {
            Ok(true) => {
                tracing::info!(task_id = %task_id, outputs = output_count, "task completed");
                Ok(JobOutcome::Completed {
                    task_id: task_id.clone(),
                    outputs: output_count,
                })
            }
            Ok(false) => {
                self.discard_outputs(&current).await;
                Ok(skipped(None))
            }
            Err(error) if error.kind == CoreErrorKind::InvalidTransition => {
                let status = self.load(task_id).await?.map(|task| task.status);
                if status == Some(TaskStatus::Completed) {
                    tracing::info!(task_id = %task_id, "task was completed by another delivery");
                    return Ok(skipped(status));
                }
                self.discard_outputs(&current).await;
                Ok(JobOutcome::Cancelled {
                    task_id: task_id.clone(),
                })
            }
            Err(error) => Err(error),
        }
    }

    async fn prepare_request(
        &self,
        task: &Task,
    ) -> OrchestrationResult<(TransformRequest, Vec<FileError>)> {
        let storage = self.inner.storage.clone();
        let task = task.clone();
        run_blocking("prepare_request", move || {
            let mut inputs = Vec::new();
            let mut missing = Vec::new();
            for artifact in task
                .inputs
                .iter()
                .filter(|artifact| artifact.role == ArtifactRole::Input)
            {
                let resolved =
                    storage.resolve(&task.session_id, &task.id, artifact.role, &artifact.filename);
                match resolved {
                    Some(path) => inputs.push(InputDocument {
                        filename: artifact.filename.clone(),
                        path,
                    }),
                    None => missing.push(FileError {
                        filename: artifact.filename.clone(),
                        message: "input artifact is missing".to_string(),
                    }),
                }
            }
            if inputs.is_empty() {
                return Err(CoreError::for_task(
                    &task.id,
                    CoreErrorKind::ProcessingFailure,
                    "no input artifacts are available",
                ));
            }

            let request = TransformRequest {
                inputs,
                options: task.options.clone(),
                work_dir: storage.work_dir(&task.id)?,
            };
            Ok((request, missing))
        })
        .await
    }

    /// Runs the transform on the blocking pool, raising the cancellation
    /// token at the soft limit or when the task leaves Processing, and giving
    /// up at the hard limit.
    async fn run_transform(
        &self,
        task_id: &TaskId,
        request: TransformRequest,
    ) -> OrchestrationResult<TransformOutput> {
        let settings = &self.inner.settings;
        let token = TaskCancellationToken::new();
        let reporter = Arc::new(JobReporter {
            task_id: task_id.clone(),
            tracker: self.inner.tracker.clone(),
            token: token.clone(),
        });
        let transform = self.inner.transform.clone();
        let mut handle =
            tokio::task::spawn_blocking(move || transform.transform(&request, reporter.as_ref()));

        let soft_limit = tokio::time::sleep(settings.soft_time_limit);
        let hard_limit = tokio::time::sleep(settings.hard_time_limit);
        tokio::pin!(soft_limit, hard_limit);
        let mut watchdog = tokio::time::interval(settings.poll_interval);
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut soft_expired = false;

        let joined = loop {
            tokio::select! {
                joined = &mut handle => break joined,
                _ = &mut soft_limit, if !soft_expired => {
                    soft_expired = true;
                    token.cancel();
                    tracing::warn!(
                        task_id = %task_id,
                        "soft time limit reached; asking transform to stop"
                    );
                }
                _ = &mut hard_limit => {
                    token.cancel();
                    return Err(CoreError::for_task(
                        task_id,
                        CoreErrorKind::Timeout,
                        format!(
                            "transform exceeded the hard time limit of {}s",
                            settings.hard_time_limit.as_secs()
                        ),
                    ));
                }
                _ = watchdog.tick() => {
                    if !token.is_cancelled() && !self.still_processing(task_id).await {
                        token.cancel();
                    }
                }
            }
        };

        match joined {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(error)) if soft_expired => Err(CoreError::for_task(
                task_id,
                CoreErrorKind::Timeout,
                format!("transform stopped at the soft time limit: {}", error.message),
            )),
            Ok(Err(error)) if error.kind == CoreErrorKind::Cancelled => Err(CoreError::for_task(
                task_id,
                CoreErrorKind::ProcessingFailure,
                "transform stopped before completing",
            )),
            Ok(Err(error)) => Err(CoreError {
                task: Some(task_id.clone()),
                ..error
            }),
            Err(join_error) => {
                tracing::error!(task_id = %task_id, error = %join_error, "transform panicked");
                Err(CoreError::for_task(
                    task_id,
                    CoreErrorKind::ProcessingFailure,
                    format!("transform panicked: {join_error}"),
                ))
            }
        }
    }

    /// Failed jobs are released with backoff until the attempt budget is
    /// spent; then the task is marked Failed.
    async fn conclude(
        &self,
        task_id: &TaskId,
        job: &ClaimedJob,
        result: OrchestrationResult<JobOutcome>,
    ) -> JobOutcome {
        self.inner.tracker.forget(task_id);
        let storage = self.inner.storage.clone();
        let scratch = task_id.clone();
        let _ = run_blocking("cleanup_temp", move || Ok(storage.cleanup_temp(&scratch))).await;

        let error = match result {
            Ok(outcome) => return outcome,
            Err(error) => error,
        };

        let retry = self.inner.settings.retry;
        if retry.allows_another_attempt(job.attempts) {
            let delay = retry.delay_for(job.attempts);
            tracing::warn!(
                task_id = %task_id,
                attempt = job.attempts,
                delay_ms = delay.as_millis() as u64,
                kind = ?error.kind,
                message = %error.message,
                "job attempt failed; releasing for retry"
            );
            return JobOutcome::Retrying {
                task_id: task_id.clone(),
                attempt: job.attempts,
                delay,
            };
        }

        tracing::error!(
            task_id = %task_id,
            attempts = job.attempts,
            kind = ?error.kind,
            message = %error.message,
            "job failed permanently"
        );
        self.fail_task(task_id, &error).await;
        JobOutcome::Failed {
            task_id: task_id.clone(),
        }
    }

    async fn fail_task(&self, task_id: &TaskId, error: &CoreError) {
        let store = self.inner.store.clone();
        let id = task_id.clone();
        let summary = error_summary(error);
        let written = run_blocking("fail_task", move || {
            let Some(task) = store.get(&id)? else {
                return Ok(false);
            };
            if task.status.is_finished() {
                return Ok(false);
            }
            if task.status == TaskStatus::Queued {
                store.update_status(&id, TaskStatus::Processing, None, None)?;
            }
            store.update_status(&id, TaskStatus::Failed, None, Some(&summary))
        })
        .await;
        if let Err(error) = written {
            tracing::error!(
                task_id = %task_id,
                kind = ?error.kind,
                message = %error.message,
                "could not record task failure"
            );
        }
    }

    async fn settle(&self, job: &ClaimedJob, outcome: &JobOutcome) -> OrchestrationResult<()> {
        let broker = self.inner.broker.clone();
        let delivery = job.clone();
        let settled = match outcome {
            JobOutcome::Retrying { delay, .. } => {
                let delay = *delay;
                run_blocking("release_job", move || broker.release(&delivery, delay)).await?
            }
            _ => run_blocking("ack_job", move || broker.ack(&delivery)).await?,
        };
        if !settled {
            tracing::warn!(
                worker = %job.worker,
                job = %job.handle,
                attempt = job.attempts,
                "lease lost before the job was settled; leaving it to its current holder"
            );
        }
        Ok(())
    }

    async fn store_outputs(
        &self,
        task: &Task,
        documents: Vec<OutputDocument>,
    ) -> OrchestrationResult<Vec<ArtifactRef>> {
        if documents.is_empty() {
            return Err(CoreError::for_task(
                &task.id,
                CoreErrorKind::ProcessingFailure,
                "transform produced no output documents",
            ));
        }
        let storage = self.inner.storage.clone();
        let session = task.session_id.clone();
        let id = task.id.clone();
        run_blocking("store_outputs", move || {
            documents
                .iter()
                .map(|document| {
                    storage
                        .store(
                            &session,
                            &id,
                            ArtifactRole::Output,
                            &document.filename,
                            &document.bytes,
                        )
                        .map(|stored| stored.reference)
                })
                .collect()
        })
        .await
    }

    async fn discard_outputs(&self, task: &Task) {
        let storage = self.inner.storage.clone();
        let task = task.clone();
        let _ = run_blocking("discard_outputs", move || {
            for artifact in &task.outputs {
                storage.remove(&task.session_id, &task.id, artifact.role, &artifact.filename);
            }
            Ok(())
        })
        .await;
    }

    async fn load(&self, task_id: &TaskId) -> OrchestrationResult<Option<Task>> {
        let store = self.inner.store.clone();
        let id = task_id.clone();
        run_blocking("get_task", move || store.get(&id)).await
    }

    async fn still_processing(&self, task_id: &TaskId) -> bool {
        match self.load(task_id).await {
            Ok(Some(task)) => task.status == TaskStatus::Processing,
            Ok(None) => false,
            Err(error) => {
                tracing::debug!(
                    task_id = %task_id,
                    message = %error.message,
                    "status check failed"
                );
                true
            }
        }
    }
}

struct JobReporter {
    task_id: TaskId,
    tracker: Arc<ProgressTracker>,
    token: TaskCancellationToken,
}

impl ProgressReporter for JobReporter {
    fn report(&self, progress: u8, stage: Option<&str>) {
        if self.token.is_cancelled() {
            return;
        }
        match self.tracker.update(&self.task_id, progress, stage) {
            Ok(ProgressDisposition::Rejected) => self.token.cancel(),
            Ok(_) => {}
            Err(error) => {
                tracing::warn!(
                    task_id = %self.task_id,
                    kind = ?error.kind,
                    message = %error.message,
                    "progress update failed"
                );
            }
        }
    }

    fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

fn error_summary(error: &CoreError) -> String {
    let summary = format!("{}: {}", error.kind.code(), error.message);
    if summary.chars().count() <= MAX_ERROR_SUMMARY_CHARS {
        return summary;
    }
    let mut truncated: String = summary.chars().take(MAX_ERROR_SUMMARY_CHARS - 3).collect();
    truncated.push_str("...");
    truncated
}
