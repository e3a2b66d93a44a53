use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;

use crate::artifacts::{AgeCleanupReport, ArtifactStorage};
use crate::models::{CoreErrorKind, TaskStatus};
use crate::orchestration::run_blocking;
use crate::persistence::{PersistenceResult, TaskStore};
use crate::registry::SessionRegistry;

pub const MISSING_OUTPUTS_MESSAGE: &str = "output artifacts are no longer available";
pub const NO_OUTPUTS_MESSAGE: &str = "task completed without recording any output artifacts";

#[derive(Clone, Debug, PartialEq)]
pub struct MaintenanceSettings {
    pub interval: Duration,
    pub artifact_max_age: Duration,
}

impl Default for MaintenanceSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15 * 60),
            artifact_max_age: Duration::from_secs(24 * 60 * 60),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct RecordPruneReport {
    pub task_records_purged: usize,
    pub index_entries_pruned: usize,
    pub sessions_purged: usize,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct MaintenanceReport {
    pub records: RecordPruneReport,
    pub artifacts: AgeCleanupReport,
    pub tasks_expired: usize,
    pub failed_steps: Vec<&'static str>,
}

/// Periodic housekeeping that runs outside the request path. Every step is
/// idempotent and a failing step does not stop the others.
#[derive(Clone)]
pub struct MaintenanceScheduler {
    sessions: Arc<SessionRegistry>,
    store: Arc<dyn TaskStore>,
    storage: ArtifactStorage,
    settings: MaintenanceSettings,
}

impl MaintenanceScheduler {
    pub fn new(
        sessions: Arc<SessionRegistry>,
        store: Arc<dyn TaskStore>,
        storage: ArtifactStorage,
        settings: MaintenanceSettings,
    ) -> Self {
        Self {
            sessions,
            store,
            storage,
            settings,
        }
    }

    /// Drops expired task records, their index entries and expired sessions.
    pub fn prune_records(&self) -> PersistenceResult<RecordPruneReport> {
        Ok(RecordPruneReport {
            task_records_purged: self.store.purge_expired()?,
            index_entries_pruned: self.store.prune_session_index()?,
            sessions_purged: self.sessions.purge_expired()?,
        })
    }

    pub fn purge_artifacts(&self) -> AgeCleanupReport {
        self.storage
            .cleanup_older_than(self.settings.artifact_max_age)
    }

    /// Flips Completed tasks whose outputs no longer resolve to Expired.
    pub fn reconcile(&self) -> PersistenceResult<usize> {
        let mut expired = 0;
        for task in self.store.list_by_status(TaskStatus::Completed)? {
            let message = if task.outputs.is_empty() {
                NO_OUTPUTS_MESSAGE
            } else if task.outputs.iter().all(|artifact| {
                self.storage
                    .verify_access(&task.session_id, &task.id, artifact.role, &artifact.filename)
            }) {
                continue;
            } else {
                MISSING_OUTPUTS_MESSAGE
            };

            match self
                .store
                .update_status(&task.id, TaskStatus::Expired, None, Some(message))
            {
                Ok(true) => {
                    tracing::info!(
                        task_id = %task.id,
                        reason = message,
                        "task expired by reconciliation"
                    );
                    expired += 1;
                }
                Ok(false) => {}
                Err(error) if error.kind == CoreErrorKind::InvalidTransition => {}
                Err(error) => {
                    tracing::error!(
                        task_id = %task.id,
                        kind = ?error.kind,
                        message = %error.message,
                        "reconciliation could not expire task"
                    );
                }
            }
        }
        Ok(expired)
    }

    pub async fn run_once(&self) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();

        let this = self.clone();
        match run_blocking("prune_records", move || this.prune_records()).await {
            Ok(records) => report.records = records,
            Err(error) => {
                log_step_failure("prune_records", &error);
                report.failed_steps.push("prune_records");
            }
        }

        let this = self.clone();
        match run_blocking("purge_artifacts", move || Ok(this.purge_artifacts())).await {
            Ok(artifacts) => report.artifacts = artifacts,
            Err(error) => {
                log_step_failure("purge_artifacts", &error);
                report.failed_steps.push("purge_artifacts");
            }
        }

        let this = self.clone();
        match run_blocking("reconcile", move || this.reconcile()).await {
            Ok(expired) => report.tasks_expired = expired,
            Err(error) => {
                log_step_failure("reconcile", &error);
                report.failed_steps.push("reconcile");
            }
        }

        let artifacts = report.artifacts.total();
        tracing::info!(
            task_records_purged = report.records.task_records_purged,
            index_entries_pruned = report.records.index_entries_pruned,
            sessions_purged = report.records.sessions_purged,
            files_removed = artifacts.files_removed,
            cleanup_errors = artifacts.errors,
            tasks_expired = report.tasks_expired,
            failed_steps = report.failed_steps.len(),
            "maintenance pass finished"
        );
        report
    }

    /// Runs a pass every `interval` until `shutdown` turns true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            interval_secs = self.settings.interval.as_secs(),
            "maintenance scheduler started"
        );
        while !*shutdown.borrow() {
            self.run_once().await;
            tokio::select! {
                _ = tokio::time::sleep(self.settings.interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::info!("maintenance scheduler stopped");
    }
}

fn log_step_failure(step: &str, error: &crate::models::CoreError) {
    tracing::error!(
        step,
        kind = ?error.kind,
        message = %error.message,
        "maintenance step failed"
    );
}
