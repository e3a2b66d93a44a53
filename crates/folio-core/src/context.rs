use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::artifacts::ArtifactStorage;
use crate::config::FolioConfig;
use crate::gateway::Gateway;
use crate::maintenance::MaintenanceScheduler;
use crate::models::CoreError;
use crate::orchestration::{JobBroker, TaskQueue, WorkerPool};
use crate::persistence::TaskStore;
use crate::progress::ProgressTracker;
use crate::registry::SessionRegistry;
use crate::sqlite::{SqliteJobBroker, SqliteStore};
use crate::transform::DocumentTransform;

/// Everything a folio process needs, built once at startup and handed to
/// the components that run in it.
pub struct ServiceContext {
    config: FolioConfig,
    sessions: Arc<SessionRegistry>,
    tasks: Arc<dyn TaskStore>,
    storage: ArtifactStorage,
    tracker: Arc<ProgressTracker>,
    broker: Arc<dyn JobBroker>,
    queue: Arc<TaskQueue>,
    shutdown: watch::Sender<bool>,
}

impl ServiceContext {
    /// Migrates the database, prepares the storage tree and wires the
    /// SQLite-backed job broker.
    pub fn open(config: FolioConfig) -> Result<Self, CoreError> {
        let database = SqliteStore::new(&config.storage.database_path);
        let broker = Arc::new(SqliteJobBroker::from_store(database.clone()));
        Self::open_with_broker(config, broker)
    }

    pub fn open_with_broker(
        config: FolioConfig,
        broker: Arc<dyn JobBroker>,
    ) -> Result<Self, CoreError> {
        config.validate()?;
        let database = SqliteStore::new(&config.storage.database_path);
        database.migrate_to_latest()?;

        let storage = ArtifactStorage::new(&config.storage.root);
        storage.ensure_layout()?;

        let tasks: Arc<dyn TaskStore> = Arc::new(database.clone());
        let sessions = Arc::new(SessionRegistry::new(
            Arc::new(database.clone()),
            config.session_ttl(),
        ));
        let tracker = Arc::new(ProgressTracker::new(
            tasks.clone(),
            config.progress_settings(),
        ));
        let queue = Arc::new(TaskQueue::new(
            tasks.clone(),
            broker.clone(),
            config.publish_policy(),
        ));
        let (shutdown, _) = watch::channel(false);

        tracing::info!(
            database = %config.storage.database_path.display(),
            storage_root = %config.storage.root.display(),
            "service context opened"
        );

        Ok(Self {
            config,
            sessions,
            tasks,
            storage,
            tracker,
            broker,
            queue,
            shutdown,
        })
    }

    pub fn config(&self) -> &FolioConfig {
        &self.config
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn tasks(&self) -> &Arc<dyn TaskStore> {
        &self.tasks
    }

    pub fn storage(&self) -> &ArtifactStorage {
        &self.storage
    }

    pub fn tracker(&self) -> &Arc<ProgressTracker> {
        &self.tracker
    }

    pub fn broker(&self) -> &Arc<dyn JobBroker> {
        &self.broker
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn gateway(&self) -> Gateway {
        Gateway::new(
            self.sessions.clone(),
            self.tasks.clone(),
            self.storage.clone(),
            self.queue.clone(),
            self.config.task_ttl(),
        )
    }

    pub fn worker_pool(&self, transform: Arc<dyn DocumentTransform>) -> WorkerPool {
        WorkerPool::new(
            self.tasks.clone(),
            self.broker.clone(),
            self.storage.clone(),
            self.tracker.clone(),
            transform,
            self.config.worker_settings(),
        )
    }

    pub fn maintenance(&self) -> MaintenanceScheduler {
        MaintenanceScheduler::new(
            self.sessions.clone(),
            self.tasks.clone(),
            self.storage.clone(),
            self.config.maintenance_settings(),
        )
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Signals shutdown and waits for the given background loops to drain.
    pub async fn close(self, running: Vec<JoinHandle<()>>) {
        self.shutdown.send_replace(true);
        let total = running.len();
        for handle in running {
            if let Err(error) = handle.await {
                tracing::error!(error = %error, "background loop ended abnormally");
            }
        }
        tracing::info!(drained = total, "service context closed");
    }
}
