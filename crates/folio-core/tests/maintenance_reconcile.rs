use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use folio_core::config::FolioConfig;
use folio_core::context::ServiceContext;
use folio_core::gateway::Upload;
use folio_core::maintenance::{
    MISSING_OUTPUTS_MESSAGE, MaintenanceScheduler, MaintenanceSettings, NO_OUTPUTS_MESSAGE,
};
use folio_core::models::{CoreError, CoreErrorKind, SessionId, Task, TaskStatus};
use folio_core::orchestration::{InMemoryJobBroker, JobOutcome};
use folio_core::persistence::TaskStore;
use folio_core::transform::{
    DocumentTransform, PassthroughTransform, ProgressReporter, TransformOutput, TransformRequest,
};

fn test_root(test_name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_nanos();
    std::env::temp_dir().join(format!("folio-{test_name}-{nanos}"))
}

fn open_context(test_name: &str) -> ServiceContext {
    let root = test_root(test_name);
    let mut config = FolioConfig::default();
    config.storage.database_path = root.join("folio.sqlite3");
    config.storage.root = root.join("artifacts");
    ServiceContext::open_with_broker(config, Arc::new(InMemoryJobBroker::new()))
        .expect("open context")
}

fn scheduler(context: &ServiceContext, artifact_max_age: Duration) -> MaintenanceScheduler {
    MaintenanceScheduler::new(
        context.sessions().clone(),
        context.tasks().clone(),
        context.storage().clone(),
        MaintenanceSettings {
            interval: Duration::from_millis(50),
            artifact_max_age,
        },
    )
}

async fn completed_task(context: &ServiceContext) -> (SessionId, String) {
    let gateway = context.gateway();
    let session = gateway.create_session().await.expect("session").id;
    let task = gateway
        .submit_upload(
            session.as_str(),
            vec![Upload {
                filename: "report.txt".to_string(),
                bytes: b"quarterly numbers".to_vec(),
            }],
            BTreeMap::new(),
        )
        .await
        .expect("submit");
    let outcome = context
        .worker_pool(Arc::new(PassthroughTransform))
        .process_next("maintenance-test")
        .await
        .expect("process");
    assert!(matches!(outcome, Some(JobOutcome::Completed { .. })));
    (session, task.task_id)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn purged_outputs_expire_their_completed_task() {
    let context = open_context("maintenance-expire");
    let (session, task_id) = completed_task(&context).await;

    let report = scheduler(&context, Duration::ZERO).run_once().await;
    assert!(report.failed_steps.is_empty());
    assert_eq!(report.artifacts.total().files_removed, 2);
    assert_eq!(report.tasks_expired, 1);

    let view = context
        .gateway()
        .task_status(session.as_str(), &task_id)
        .await
        .expect("status");
    assert_eq!(view.status, TaskStatus::Expired);
    assert_eq!(view.error.as_deref(), Some(MISSING_OUTPUTS_MESSAGE));

    let second = scheduler(&context, Duration::ZERO).run_once().await;
    assert_eq!(second.tasks_expired, 0);
    assert_eq!(second.artifacts.total().files_removed, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fresh_artifacts_are_left_alone() {
    let context = open_context("maintenance-fresh");
    let (session, task_id) = completed_task(&context).await;

    let report = scheduler(&context, Duration::from_secs(3600)).run_once().await;
    assert_eq!(report.artifacts.total().files_removed, 0);
    assert_eq!(report.tasks_expired, 0);

    let path = context
        .gateway()
        .resolve_download(session.as_str(), &task_id, "report.txt")
        .await
        .expect("download still resolves");
    assert!(path.is_file());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn completed_tasks_without_outputs_are_expired() {
    let context = open_context("maintenance-no-outputs");
    let session = context.sessions().create().expect("session");
    let task = Task::new(session.id.clone(), BTreeMap::new(), SystemTime::now());
    let tasks = context.tasks();
    tasks.store(&task, Duration::from_secs(3600)).expect("store");
    tasks
        .update_status(&task.id, TaskStatus::Processing, None, None)
        .expect("processing");
    tasks
        .update_status(&task.id, TaskStatus::Completed, None, None)
        .expect("completed");

    let expired = scheduler(&context, Duration::from_secs(3600))
        .reconcile()
        .expect("reconcile");
    assert_eq!(expired, 1);

    let stored = tasks.get(&task.id).expect("get").expect("exists");
    assert_eq!(stored.status, TaskStatus::Expired);
    assert_eq!(stored.error_message.as_deref(), Some(NO_OUTPUTS_MESSAGE));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn expired_records_and_sessions_are_pruned() {
    let context = open_context("maintenance-prune");
    let session = context.sessions().create().expect("session");
    let task = Task::new(session.id.clone(), BTreeMap::new(), SystemTime::now());
    context
        .tasks()
        .store(&task, Duration::ZERO)
        .expect("store already-expired task");

    let records = scheduler(&context, Duration::from_secs(3600))
        .prune_records()
        .expect("prune");
    assert_eq!(records.task_records_purged, 1);
    assert_eq!(records.index_entries_pruned, 1);
    assert_eq!(records.sessions_purged, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scheduler_loop_stops_on_shutdown() {
    let context = open_context("maintenance-loop");
    let scheduler = scheduler(&context, Duration::from_secs(3600));
    let shutdown = context.shutdown_signal();
    let running = vec![tokio::spawn(async move { scheduler.run(shutdown).await })];

    tokio::time::sleep(Duration::from_millis(120)).await;
    tokio::time::timeout(Duration::from_secs(5), context.close(running))
        .await
        .expect("scheduler drains promptly");
}

/// Writes scratch data into its work dir after a pause, then copies inputs through.
struct ScratchTransform;

impl DocumentTransform for ScratchTransform {
    fn transform(
        &self,
        request: &TransformRequest,
        reporter: &dyn ProgressReporter,
    ) -> Result<TransformOutput, CoreError> {
        std::thread::sleep(Duration::from_millis(400));
        std::fs::write(request.work_dir.join("page-1.bin"), b"scratch").map_err(|error| {
            CoreError::new(
                CoreErrorKind::ProcessingFailure,
                format!("scratch write failed: {error}"),
            )
        })?;
        PassthroughTransform.transform(request, reporter)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn maintenance_leaves_a_running_job_alone() {
    let context = open_context("maintenance-live-job");
    let gateway = context.gateway();
    let session = gateway.create_session().await.expect("session").id;
    let task = gateway
        .submit_upload(
            session.as_str(),
            vec![Upload {
                filename: "draft.txt".to_string(),
                bytes: b"work in progress".to_vec(),
            }],
            BTreeMap::new(),
        )
        .await
        .expect("submit");

    let pool = context.worker_pool(Arc::new(ScratchTransform));
    let running = tokio::spawn(async move { pool.process_next("live-worker").await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let report = scheduler(&context, Duration::from_secs(24 * 3600))
        .run_once()
        .await;
    assert!(report.failed_steps.is_empty());
    assert_eq!(report.artifacts.total().files_removed, 0);
    assert_eq!(report.artifacts.total().directories_removed, 0);

    let outcome = running.await.expect("worker task").expect("process");
    assert!(matches!(outcome, Some(JobOutcome::Completed { .. })));
    let view = gateway
        .task_status(session.as_str(), &task.task_id)
        .await
        .expect("status");
    assert_eq!(view.status, TaskStatus::Completed);
    assert_eq!(view.downloads, vec!["draft.txt".to_string()]);
}
