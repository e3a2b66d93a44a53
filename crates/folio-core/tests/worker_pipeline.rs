use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use folio_core::config::FolioConfig;
use folio_core::context::ServiceContext;
use folio_core::gateway::{Gateway, Upload};
use folio_core::models::{CoreError, CoreErrorKind, SessionId, TaskId, TaskStatus, TaskView};
use folio_core::orchestration::{
    InMemoryJobBroker, JobBroker, JobEnvelope, JobOutcome, RetryPolicy, WorkerPool,
    WorkerSettings,
};
use folio_core::transform::{
    DocumentTransform, OutputDocument, PassthroughTransform, ProgressReporter, TransformOutput,
    TransformRequest,
};

const WORKER: &str = "test-worker";

fn test_root(test_name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_nanos();
    std::env::temp_dir().join(format!("folio-{test_name}-{nanos}"))
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct Harness {
    context: ServiceContext,
    gateway: Gateway,
    session: SessionId,
}

impl Harness {
    async fn open(test_name: &str) -> Self {
        init_tracing();
        let root = test_root(test_name);
        let mut config = FolioConfig::default();
        config.storage.database_path = root.join("folio.sqlite3");
        config.storage.root = root.join("artifacts");
        let context = ServiceContext::open_with_broker(config, Arc::new(InMemoryJobBroker::new()))
            .expect("open context");
        let gateway = context.gateway();
        let session = gateway.create_session().await.expect("create session").id;
        Self {
            context,
            gateway,
            session,
        }
    }

    fn pool(&self, transform: Arc<dyn DocumentTransform>, max_attempts: u32) -> WorkerPool {
        self.pool_with(transform, settings(max_attempts))
    }

    fn pool_with(
        &self,
        transform: Arc<dyn DocumentTransform>,
        settings: WorkerSettings,
    ) -> WorkerPool {
        WorkerPool::new(
            self.context.tasks().clone(),
            self.context.broker().clone(),
            self.context.storage().clone(),
            self.context.tracker().clone(),
            transform,
            settings,
        )
    }

    async fn submit(&self, files: &[(&str, &str)]) -> TaskView {
        let uploads = files
            .iter()
            .map(|(filename, contents)| Upload {
                filename: filename.to_string(),
                bytes: contents.as_bytes().to_vec(),
            })
            .collect();
        self.gateway
            .submit_upload(self.session.as_str(), uploads, BTreeMap::new())
            .await
            .expect("submit upload")
    }

    async fn status(&self, task: &TaskView) -> TaskView {
        self.gateway
            .task_status(self.session.as_str(), &task.task_id)
            .await
            .expect("task status")
    }
}

fn settings(max_attempts: u32) -> WorkerSettings {
    WorkerSettings {
        concurrency: 1,
        lease: Duration::from_secs(30),
        poll_interval: Duration::from_millis(20),
        soft_time_limit: Duration::from_secs(5),
        hard_time_limit: Duration::from_secs(10),
        retry: RetryPolicy::new(max_attempts, Duration::from_millis(1), Duration::from_millis(1)),
    }
}

struct FailingTransform;

impl DocumentTransform for FailingTransform {
    fn transform(
        &self,
        _request: &TransformRequest,
        _reporter: &dyn ProgressReporter,
    ) -> Result<TransformOutput, CoreError> {
        Err(CoreError::new(
            CoreErrorKind::ProcessingFailure,
            "document is encrypted",
        ))
    }
}

/// Panics on its first `panics` calls, then copies inputs through.
struct PanickyTransform {
    panics: AtomicU32,
}

impl DocumentTransform for PanickyTransform {
    fn transform(
        &self,
        request: &TransformRequest,
        reporter: &dyn ProgressReporter,
    ) -> Result<TransformOutput, CoreError> {
        let remaining = self.panics.load(Ordering::SeqCst);
        if remaining > 0 {
            self.panics.store(remaining - 1, Ordering::SeqCst);
            panic!("simulated transform panic");
        }
        PassthroughTransform.transform(request, reporter)
    }
}

/// Runs until cancelled.
struct StubbornTransform;

impl DocumentTransform for StubbornTransform {
    fn transform(
        &self,
        _request: &TransformRequest,
        reporter: &dyn ProgressReporter,
    ) -> Result<TransformOutput, CoreError> {
        let mut progress = 0u8;
        while !reporter.is_cancelled() {
            progress = (progress + 10).min(90);
            reporter.report(progress, Some("working"));
            std::thread::sleep(Duration::from_millis(10));
        }
        Err(CoreError::new(CoreErrorKind::Cancelled, "stopped"))
    }
}

/// Counts its runs and holds each one long enough for a rival delivery to arrive.
#[derive(Default)]
struct CountingTransform {
    runs: AtomicU32,
}

impl DocumentTransform for CountingTransform {
    fn transform(
        &self,
        request: &TransformRequest,
        reporter: &dyn ProgressReporter,
    ) -> Result<TransformOutput, CoreError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(150));
        PassthroughTransform.transform(request, reporter)
    }
}

/// Ignores cancellation and sleeps past every limit.
struct SleepyTransform;

impl DocumentTransform for SleepyTransform {
    fn transform(
        &self,
        _request: &TransformRequest,
        _reporter: &dyn ProgressReporter,
    ) -> Result<TransformOutput, CoreError> {
        std::thread::sleep(Duration::from_millis(800));
        Ok(TransformOutput {
            documents: vec![OutputDocument {
                filename: "late.txt".to_string(),
                bytes: b"late".to_vec(),
            }],
            page_count: None,
            file_errors: Vec::new(),
        })
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn uploaded_task_is_processed_and_downloadable() {
    let harness = Harness::open("pipeline-complete").await;
    let pool = harness.pool(Arc::new(PassthroughTransform), 3);
    let task = harness.submit(&[("notes.txt", "hello folio")]).await;
    assert_eq!(task.status, TaskStatus::Queued);
    assert_eq!(task.inputs, vec!["notes.txt".to_string()]);

    let outcome = pool.process_next(WORKER).await.expect("process job");
    assert!(matches!(
        outcome,
        Some(JobOutcome::Completed { outputs: 1, .. })
    ));

    let done = harness.status(&task).await;
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.progress, 100);
    assert_eq!(done.downloads, vec!["notes.txt".to_string()]);
    assert!(done.completed_at_unix.is_some());

    let path = harness
        .gateway
        .resolve_download(harness.session.as_str(), &task.task_id, "notes.txt")
        .await
        .expect("resolve download");
    assert_eq!(std::fs::read(path).expect("read output"), b"hello folio");

    let foreign = harness.gateway.create_session().await.expect("second session");
    let error = harness
        .gateway
        .resolve_download(foreign.id.as_str(), &task.task_id, "notes.txt")
        .await
        .expect_err("foreign download");
    assert_eq!(error.kind, CoreErrorKind::NotFound);

    assert_eq!(pool.process_next(WORKER).await.expect("idle"), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn redelivered_job_for_finished_task_is_a_no_op() {
    let harness = Harness::open("pipeline-redelivery").await;
    let pool = harness.pool(Arc::new(PassthroughTransform), 3);
    let task = harness.submit(&[("a.txt", "a")]).await;
    pool.process_next(WORKER).await.expect("first run");
    let first = harness.status(&task).await;

    harness
        .context
        .broker()
        .publish(&JobEnvelope::Process {
            task_id: TaskId::parse(&task.task_id).expect("task id"),
            session_id: harness.session.clone(),
        })
        .expect("publish duplicate");
    let outcome = pool.process_next(WORKER).await.expect("redelivery");
    assert!(matches!(
        outcome,
        Some(JobOutcome::Skipped {
            status: Some(TaskStatus::Completed),
            ..
        })
    ));

    let second = harness.status(&task).await;
    assert_eq!(second.status, TaskStatus::Completed);
    assert_eq!(second.completed_at_unix, first.completed_at_unix);
    assert_eq!(second.downloads, first.downloads);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn starting_a_queued_task_twice_reuses_its_job() {
    let harness = Harness::open("pipeline-start-twice").await;
    let task = harness.submit(&[("a.txt", "a")]).await;

    let restarted = harness
        .gateway
        .start(harness.session.as_str(), &task.task_id)
        .await
        .expect("second start");
    assert_eq!(restarted.status, TaskStatus::Queued);
    assert_eq!(harness.context.queue().pending_jobs().await.expect("pending"), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_duplicate_jobs_run_the_transform_once() {
    let harness = Harness::open("pipeline-duplicate-jobs").await;
    let transform = Arc::new(CountingTransform::default());
    let pool = harness.pool(transform.clone(), 3);
    let task = harness.submit(&[("a.txt", "a")]).await;
    harness
        .context
        .broker()
        .publish(&JobEnvelope::Process {
            task_id: TaskId::parse(&task.task_id).expect("task id"),
            session_id: harness.session.clone(),
        })
        .expect("publish duplicate");

    let (first, second) = tokio::join!(
        pool.process_next("worker-a"),
        pool.process_next("worker-b")
    );
    let outcomes = [
        first.expect("first worker").expect("first job"),
        second.expect("second worker").expect("second job"),
    ];

    assert_eq!(transform.runs.load(Ordering::SeqCst), 1);
    let completed = outcomes
        .iter()
        .filter(|outcome| matches!(outcome, JobOutcome::Completed { outputs: 1, .. }))
        .count();
    let skipped = outcomes
        .iter()
        .filter(|outcome| matches!(outcome, JobOutcome::Skipped { .. }))
        .count();
    assert_eq!((completed, skipped), (1, 1));

    let done = harness.status(&task).await;
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.downloads, vec!["a.txt".to_string()]);
    assert_eq!(harness.context.queue().pending_jobs().await.expect("pending"), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn expired_lease_lets_another_worker_finish_the_job() {
    let harness = Harness::open("pipeline-lease").await;
    let pool = harness.pool(Arc::new(PassthroughTransform), 3);
    let task = harness.submit(&[("a.txt", "a")]).await;

    let crashed = harness
        .context
        .broker()
        .claim("crashed-worker", Duration::from_millis(200))
        .expect("claim")
        .expect("job available");
    assert_eq!(crashed.attempts, 1);
    assert_eq!(pool.process_next(WORKER).await.expect("leased"), None);

    tokio::time::sleep(Duration::from_millis(300)).await;
    let outcome = pool.process_next(WORKER).await.expect("reclaim");
    assert!(matches!(outcome, Some(JobOutcome::Completed { .. })));
    assert_eq!(harness.status(&task).await.status, TaskStatus::Completed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn worker_survives_a_panicking_transform() {
    let harness = Harness::open("pipeline-panic").await;
    let pool = harness.pool(
        Arc::new(PanickyTransform {
            panics: AtomicU32::new(1),
        }),
        3,
    );
    let task = harness.submit(&[("a.txt", "a")]).await;

    let first = pool.process_next(WORKER).await.expect("panicking attempt");
    assert!(matches!(
        first,
        Some(JobOutcome::Retrying { attempt: 1, .. })
    ));
    assert_eq!(harness.status(&task).await.status, TaskStatus::Processing);

    tokio::time::sleep(Duration::from_millis(20)).await;
    let second = pool.process_next(WORKER).await.expect("second attempt");
    assert!(matches!(second, Some(JobOutcome::Completed { .. })));
    assert_eq!(harness.status(&task).await.status, TaskStatus::Completed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn exhausted_retries_fail_the_task_and_retry_requeues_it() {
    let harness = Harness::open("pipeline-failure").await;
    let pool = harness.pool(Arc::new(FailingTransform), 2);
    let task = harness.submit(&[("a.pdf", "%PDF")]).await;

    let first = pool.process_next(WORKER).await.expect("first attempt");
    assert!(matches!(first, Some(JobOutcome::Retrying { .. })));
    tokio::time::sleep(Duration::from_millis(20)).await;
    let second = pool.process_next(WORKER).await.expect("second attempt");
    assert!(matches!(second, Some(JobOutcome::Failed { .. })));

    let failed = harness.status(&task).await;
    assert_eq!(failed.status, TaskStatus::Failed);
    assert_eq!(
        failed.error.as_deref(),
        Some("processing_failure: document is encrypted")
    );
    assert!(failed.downloads.is_empty());

    let retried = harness
        .gateway
        .retry(harness.session.as_str(), &task.task_id)
        .await
        .expect("retry");
    assert_eq!(retried.status, TaskStatus::Queued);
    assert_eq!(retried.progress, 0);
    assert_eq!(retried.error, None);
    assert_eq!(
        harness.context.queue().pending_jobs().await.expect("pending"),
        1
    );

    let error = harness
        .gateway
        .retry(harness.session.as_str(), &task.task_id)
        .await
        .expect_err("queued tasks cannot be retried");
    assert_eq!(error.kind, CoreErrorKind::InvalidTransition);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelling_a_running_task_discards_its_results() {
    let harness = Harness::open("pipeline-cancel").await;
    let pool = harness.pool(Arc::new(StubbornTransform), 3);
    let task = harness.submit(&[("a.txt", "a")]).await;

    let running = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.process_next(WORKER).await })
    };
    for _ in 0..200 {
        if harness.status(&task).await.status == TaskStatus::Processing {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let cancelled = harness
        .gateway
        .cancel(harness.session.as_str(), &task.task_id)
        .await
        .expect("cancel");
    assert_eq!(cancelled.status, TaskStatus::Failed);
    assert_eq!(cancelled.error.as_deref(), Some("cancelled by user"));

    let outcome = running
        .await
        .expect("worker task joins")
        .expect("process job");
    assert!(matches!(outcome, Some(JobOutcome::Cancelled { .. })));

    let after = harness.status(&task).await;
    assert_eq!(after.status, TaskStatus::Failed);
    assert!(after.downloads.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn queued_task_cancel_revokes_its_job() {
    let harness = Harness::open("pipeline-cancel-queued").await;
    let pool = harness.pool(Arc::new(PassthroughTransform), 3);
    let task = harness.submit(&[("a.txt", "a")]).await;

    harness
        .gateway
        .cancel(harness.session.as_str(), &task.task_id)
        .await
        .expect("cancel");
    assert_eq!(
        harness.context.queue().pending_jobs().await.expect("pending"),
        0
    );
    assert_eq!(pool.process_next(WORKER).await.expect("idle"), None);

    let error = harness
        .gateway
        .cancel(harness.session.as_str(), &task.task_id)
        .await
        .expect_err("already failed");
    assert_eq!(error.kind, CoreErrorKind::InvalidTransition);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn hard_time_limit_fails_the_job() {
    let harness = Harness::open("pipeline-timeout").await;
    let mut limits = settings(1);
    limits.soft_time_limit = Duration::from_millis(100);
    limits.hard_time_limit = Duration::from_millis(200);
    let pool = harness.pool_with(Arc::new(SleepyTransform), limits);
    let task = harness.submit(&[("a.txt", "a")]).await;

    let outcome = pool.process_next(WORKER).await.expect("process job");
    assert!(matches!(outcome, Some(JobOutcome::Failed { .. })));

    let failed = harness.status(&task).await;
    assert_eq!(failed.status, TaskStatus::Failed);
    assert!(
        failed
            .error
            .as_deref()
            .is_some_and(|message| message.starts_with("timeout:"))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn health_check_round_trips_through_a_running_worker() {
    let harness = Harness::open("pipeline-health").await;

    let unanswered = harness
        .context
        .queue()
        .health_check(Duration::from_millis(100))
        .await;
    assert!(!unanswered.healthy);
    assert_eq!(
        unanswered.error.as_ref().map(|error| error.code),
        Some("timeout")
    );
    assert!(harness.context.queue().is_degraded());

    let pool = harness.pool(Arc::new(PassthroughTransform), 3);
    let running = pool.spawn(harness.context.shutdown_signal());
    let answered = harness
        .context
        .queue()
        .health_check(Duration::from_secs(5))
        .await;
    assert!(answered.healthy);
    assert!(answered.round_trip_ms.is_some());
    assert!(!harness.context.queue().is_degraded());

    harness.context.close(running).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn other_sessions_cannot_see_or_touch_a_task() {
    let harness = Harness::open("pipeline-ownership").await;
    let task = harness.submit(&[("a.txt", "a")]).await;
    let intruder = harness.gateway.create_session().await.expect("intruder").id;

    let status = harness
        .gateway
        .task_status(intruder.as_str(), &task.task_id)
        .await
        .expect_err("foreign status");
    assert_eq!(status.kind, CoreErrorKind::NotFound);
    let cancel = harness
        .gateway
        .cancel(intruder.as_str(), &task.task_id)
        .await
        .expect_err("foreign cancel");
    assert_eq!(cancel.kind, CoreErrorKind::NotFound);
    assert!(
        harness
            .gateway
            .list_tasks(intruder.as_str())
            .await
            .expect("list")
            .is_empty()
    );

    let unknown = harness
        .gateway
        .task_status(harness.session.as_str(), "../etc")
        .await
        .expect_err("malformed id");
    assert_eq!(unknown.kind, CoreErrorKind::NotFound);

    harness
        .gateway
        .delete_task(harness.session.as_str(), &task.task_id)
        .await
        .expect("owner delete");
    assert!(
        harness
            .gateway
            .list_tasks(harness.session.as_str())
            .await
            .expect("list")
            .is_empty()
    );
}
