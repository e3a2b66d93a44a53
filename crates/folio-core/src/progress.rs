use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::models::{CoreError, CoreErrorKind, ProgressEvent, TaskId};
use crate::persistence::{PersistenceResult, TaskStore};

const HISTORY_LIMIT: usize = 10;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ProgressSettings {
    pub min_interval: Duration,
    pub min_delta: u8,
}

impl Default for ProgressSettings {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(2),
            min_delta: 5,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressDisposition {
    Propagated,
    /// Held back by rate limiting or a regressing value.
    Throttled,
    /// The store refused the write because the task is no longer active.
    Rejected,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ProgressSnapshot {
    pub progress: u8,
    pub stage: Option<String>,
    pub rate_per_minute: Option<f64>,
    pub eta: Option<Duration>,
}

#[derive(Default)]
struct TaskProgress {
    highest: u8,
    last_propagated: Option<ProgressEvent>,
    history: VecDeque<ProgressEvent>,
}

/// Rate-limited propagation of worker progress into the task record store.
/// History lives in memory only.
pub struct ProgressTracker {
    store: Arc<dyn TaskStore>,
    settings: ProgressSettings,
    tasks: Mutex<HashMap<TaskId, TaskProgress>>,
}

impl ProgressTracker {
    pub fn new(store: Arc<dyn TaskStore>, settings: ProgressSettings) -> Self {
        Self {
            store,
            settings,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    pub fn update(
        &self,
        task_id: &TaskId,
        progress: u8,
        stage: Option<&str>,
    ) -> PersistenceResult<ProgressDisposition> {
        self.update_at(task_id, progress, stage, Instant::now())
    }

    pub fn update_at(
        &self,
        task_id: &TaskId,
        progress: u8,
        stage: Option<&str>,
        now: Instant,
    ) -> PersistenceResult<ProgressDisposition> {
        let progress = progress.min(100);
        let event = ProgressEvent {
            progress,
            stage: stage.map(str::to_string),
            at: now,
        };

        let propagate = {
            let mut tasks = self.lock_tasks()?;
            let entry = tasks.entry(task_id.clone()).or_default();
            if progress < entry.highest {
                return Ok(ProgressDisposition::Throttled);
            }
            entry.highest = progress;
            entry.history.push_back(event.clone());
            while entry.history.len() > HISTORY_LIMIT {
                entry.history.pop_front();
            }

            let propagate =
                should_propagate(&self.settings, entry.last_propagated.as_ref(), &event);
            if propagate {
                entry.last_propagated = Some(event);
            }
            propagate
        };

        if !propagate {
            return Ok(ProgressDisposition::Throttled);
        }
        if self.store.update_progress(task_id, progress, stage)? {
            Ok(ProgressDisposition::Propagated)
        } else {
            Ok(ProgressDisposition::Rejected)
        }
    }

    pub fn snapshot(&self, task_id: &TaskId) -> Option<ProgressSnapshot> {
        let tasks = self.lock_tasks().ok()?;
        let entry = tasks.get(task_id)?;
        let latest = entry.history.back()?;
        let rate = rate_per_minute(&entry.history);
        Some(ProgressSnapshot {
            progress: latest.progress,
            stage: latest.stage.clone(),
            rate_per_minute: rate,
            eta: rate.and_then(|rate| estimate_remaining(latest.progress, rate)),
        })
    }

    pub fn forget(&self, task_id: &TaskId) {
        if let Ok(mut tasks) = self.lock_tasks() {
            tasks.remove(task_id);
        }
    }

    fn lock_tasks(&self) -> PersistenceResult<MutexGuard<'_, HashMap<TaskId, TaskProgress>>> {
        self.tasks.lock().map_err(|_| {
            CoreError::new(CoreErrorKind::Internal, "progress tracker mutex poisoned")
        })
    }
}

fn should_propagate(
    settings: &ProgressSettings,
    last: Option<&ProgressEvent>,
    event: &ProgressEvent,
) -> bool {
    if event.progress == 0 || event.progress == 100 {
        return true;
    }
    let Some(last) = last else {
        return true;
    };
    if event.stage.is_some() && event.stage != last.stage {
        return true;
    }
    if event.progress.saturating_sub(last.progress) >= settings.min_delta {
        return true;
    }
    event.at.saturating_duration_since(last.at) >= settings.min_interval
}

fn rate_per_minute(history: &VecDeque<ProgressEvent>) -> Option<f64> {
    let first = history.front()?;
    let last = history.back()?;
    let elapsed = last.at.saturating_duration_since(first.at).as_secs_f64() / 60.0;
    let advanced = f64::from(last.progress) - f64::from(first.progress);
    if elapsed <= 0.0 || advanced <= 0.0 {
        return None;
    }
    Some(advanced / elapsed)
}

fn estimate_remaining(progress: u8, rate_per_minute: f64) -> Option<Duration> {
    if rate_per_minute <= 0.0 {
        return None;
    }
    let minutes = f64::from(100 - progress.min(100)) / rate_per_minute;
    Duration::try_from_secs_f64(minutes * 60.0).ok()
}
