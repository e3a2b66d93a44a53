use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::maintenance::MaintenanceSettings;
use crate::models::{CoreError, CoreErrorKind};
use crate::orchestration::{RetryPolicy, WorkerSettings};
use crate::progress::ProgressSettings;

const HOUR: u64 = 60 * 60;

/// Process configuration. Every field has a default, so an empty file (or no
/// file) is a valid configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FolioConfig {
    pub storage: StorageConfig,
    pub sessions: SessionConfig,
    pub tasks: TaskConfig,
    pub worker: WorkerConfig,
    pub progress: ProgressConfig,
    pub maintenance: MaintenanceConfig,
    pub health: HealthConfig,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub database_path: PathBuf,
    /// Holds the `uploads/`, `outputs/` and `temp/` trees.
    pub root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("folio-data/folio.sqlite3"),
            root: PathBuf::from("folio-data/artifacts"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub ttl_hours: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { ttl_hours: 72 }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    pub ttl_hours: u64,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self { ttl_hours: 24 }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub lease_secs: u64,
    pub poll_interval_ms: u64,
    pub soft_time_limit_secs: u64,
    pub hard_time_limit_secs: u64,
    pub max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// Attempts for publishing a job before `enqueue` gives up.
    pub publish_attempts: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            lease_secs: 330,
            poll_interval_ms: 500,
            soft_time_limit_secs: 270,
            hard_time_limit_secs: 300,
            max_attempts: 3,
            retry_base_delay_ms: 5_000,
            retry_max_delay_ms: 60_000,
            publish_attempts: 3,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressConfig {
    pub min_interval_ms: u64,
    pub min_delta: u8,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: 2_000,
            min_delta: 5,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    pub interval_secs: u64,
    pub artifact_max_age_hours: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval_secs: 15 * 60,
            artifact_max_age_hours: 24,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub ping_timeout_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            ping_timeout_secs: 5,
        }
    }
}

impl FolioConfig {
    /// Reads `path` when given, then applies `FOLIO_*` environment overrides
    /// and validates the result.
    pub fn load(path: Option<&Path>) -> Result<Self, CoreError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, CoreError> {
        let raw = fs::read_to_string(path).map_err(|error| {
            invalid(format!("could not read config '{}': {error}", path.display()))
        })?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self, CoreError> {
        toml::from_str(raw).map_err(|error| invalid(format!("malformed config: {error}")))
    }

    /// `FOLIO_DATABASE_PATH`, `FOLIO_STORAGE_ROOT` and `FOLIO_WORKER_CONCURRENCY`.
    pub fn apply_env_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), CoreError> {
        if let Some(path) = lookup("FOLIO_DATABASE_PATH") {
            self.storage.database_path = PathBuf::from(path);
        }
        if let Some(root) = lookup("FOLIO_STORAGE_ROOT") {
            self.storage.root = PathBuf::from(root);
        }
        if let Some(raw) = lookup("FOLIO_WORKER_CONCURRENCY") {
            self.worker.concurrency = raw.trim().parse().map_err(|_| {
                invalid(format!("FOLIO_WORKER_CONCURRENCY must be a number, got '{raw}'"))
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        let worker = &self.worker;
        if worker.concurrency == 0 {
            return Err(invalid("worker.concurrency must be at least 1"));
        }
        if worker.lease_secs == 0 {
            return Err(invalid("worker.lease_secs must be positive"));
        }
        if worker.soft_time_limit_secs >= worker.hard_time_limit_secs {
            return Err(invalid(
                "worker.soft_time_limit_secs must be below worker.hard_time_limit_secs",
            ));
        }
        if worker.lease_secs <= worker.hard_time_limit_secs {
            return Err(invalid(
                "worker.lease_secs must exceed worker.hard_time_limit_secs",
            ));
        }
        if worker.max_attempts == 0 || worker.publish_attempts == 0 {
            return Err(invalid("attempt counts must be at least 1"));
        }
        if self.sessions.ttl_hours == 0 || self.tasks.ttl_hours == 0 {
            return Err(invalid("ttl_hours must be positive"));
        }
        Ok(())
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.sessions.ttl_hours.saturating_mul(HOUR))
    }

    pub fn task_ttl(&self) -> Duration {
        Duration::from_secs(self.tasks.ttl_hours.saturating_mul(HOUR))
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health.ping_timeout_secs)
    }

    pub fn publish_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.worker.publish_attempts,
            Duration::from_millis(200),
            Duration::from_secs(2),
        )
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        let worker = &self.worker;
        WorkerSettings {
            concurrency: worker.concurrency,
            lease: Duration::from_secs(worker.lease_secs),
            poll_interval: Duration::from_millis(worker.poll_interval_ms),
            soft_time_limit: Duration::from_secs(worker.soft_time_limit_secs),
            hard_time_limit: Duration::from_secs(worker.hard_time_limit_secs),
            retry: RetryPolicy::new(
                worker.max_attempts,
                Duration::from_millis(worker.retry_base_delay_ms),
                Duration::from_millis(worker.retry_max_delay_ms),
            ),
        }
    }

    pub fn progress_settings(&self) -> ProgressSettings {
        ProgressSettings {
            min_interval: Duration::from_millis(self.progress.min_interval_ms),
            min_delta: self.progress.min_delta,
        }
    }

    pub fn maintenance_settings(&self) -> MaintenanceSettings {
        MaintenanceSettings {
            interval: Duration::from_secs(self.maintenance.interval_secs),
            artifact_max_age: Duration::from_secs(
                self.maintenance.artifact_max_age_hours.saturating_mul(HOUR),
            ),
        }
    }
}

fn invalid(message: impl Into<String>) -> CoreError {
    CoreError::new(CoreErrorKind::InvalidInput, message)
}
