use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::models::{
    ArtifactRef, ArtifactRole, CoreError, CoreErrorKind, SessionId, unix_seconds,
    validate_identifier,
};

#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TaskId(String);

impl TaskId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        validate_identifier(raw, "task id")?;
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for TaskId {
    type Err = CoreError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Self::parse(raw)
    }
}

impl TryFrom<String> for TaskId {
    type Error = CoreError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::parse(&raw)
    }
}

impl From<TaskId> for String {
    fn from(id: TaskId) -> Self {
        id.0
    }
}

impl Display for TaskId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Expired,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Queued,
        TaskStatus::Processing,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Expired,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Expired => "expired",
        }
    }

    /// Rewriting the status of an active task is a detail update. A finished
    /// task never accepts its own status again.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        (self == next && !self.is_finished())
            || matches!(
                (self, next),
                (TaskStatus::Queued, TaskStatus::Processing)
                    | (TaskStatus::Processing, TaskStatus::Completed)
                    | (TaskStatus::Processing, TaskStatus::Failed)
                    | (TaskStatus::Failed, TaskStatus::Queued)
                    | (TaskStatus::Completed, TaskStatus::Expired)
            )
    }

    /// No worker should act on a task in one of these states.
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Expired
        )
    }

    pub fn is_cancellable(self) -> bool {
        matches!(self, TaskStatus::Queued | TaskStatus::Processing)
    }
}

impl FromStr for TaskStatus {
    type Err = CoreError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == raw)
            .ok_or_else(|| {
                CoreError::new(
                    CoreErrorKind::InvalidInput,
                    format!("unknown task status '{raw}'"),
                )
            })
    }
}

impl Display for TaskStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct FileError {
    pub filename: String,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Task {
    pub id: TaskId,
    pub session_id: SessionId,
    pub status: TaskStatus,
    pub progress: u8,
    pub stage: Option<String>,
    pub inputs: Vec<ArtifactRef>,
    pub outputs: Vec<ArtifactRef>,
    pub options: BTreeMap<String, String>,
    pub page_count: Option<u32>,
    pub file_errors: Vec<FileError>,
    pub error_message: Option<String>,
    pub job_handle: Option<String>,
    pub created_at: SystemTime,
    pub updated_at: SystemTime,
    pub completed_at: Option<SystemTime>,
    /// Set by the record store from the TTL passed to `store`.
    pub expires_at: Option<SystemTime>,
}

impl Task {
    pub fn new(session_id: SessionId, options: BTreeMap<String, String>, now: SystemTime) -> Self {
        Self {
            id: TaskId::generate(),
            session_id,
            status: TaskStatus::Queued,
            progress: 0,
            stage: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
            options,
            page_count: None,
            file_errors: Vec::new(),
            error_message: None,
            job_handle: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            expires_at: None,
        }
    }

    pub fn owned_by(&self, session_id: &SessionId) -> bool {
        &self.session_id == session_id
    }

    /// Moves the task to `next`, applying the side effects each edge carries.
    pub fn transition_to(&mut self, next: TaskStatus, now: SystemTime) -> Result<(), CoreError> {
        if !self.status.can_transition_to(next) {
            return Err(invalid_transition(&self.id, self.status, next));
        }
        if self.status == next {
            self.updated_at = now;
            return Ok(());
        }

        match next {
            TaskStatus::Queued => {
                self.progress = 0;
                self.stage = None;
                self.error_message = None;
                self.outputs.clear();
                self.page_count = None;
                self.file_errors.clear();
                self.completed_at = None;
                self.job_handle = None;
            }
            TaskStatus::Completed => {
                self.progress = 100;
                self.error_message = None;
                self.completed_at = Some(now);
            }
            TaskStatus::Failed => {
                self.completed_at = Some(now);
            }
            TaskStatus::Processing | TaskStatus::Expired => {}
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    pub fn view(&self) -> TaskView {
        TaskView {
            task_id: self.id.to_string(),
            status: self.status,
            progress: self.progress,
            stage: self.stage.clone(),
            error: self.error_message.clone(),
            inputs: self
                .inputs
                .iter()
                .map(|artifact| artifact.filename.clone())
                .collect(),
            downloads: self
                .outputs
                .iter()
                .filter(|artifact| artifact.role == ArtifactRole::Output)
                .map(|artifact| artifact.filename.clone())
                .collect(),
            page_count: self.page_count,
            file_errors: self.file_errors.clone(),
            created_at_unix: unix_seconds(self.created_at),
            updated_at_unix: unix_seconds(self.updated_at),
            completed_at_unix: self.completed_at.map(unix_seconds),
        }
    }
}

pub(crate) fn invalid_transition(
    task: &TaskId,
    current: TaskStatus,
    desired: TaskStatus,
) -> CoreError {
    CoreError::for_task(
        task,
        CoreErrorKind::InvalidTransition,
        format!("task '{task}' cannot transition from '{current}' to '{desired}'"),
    )
}

/// Polling payload handed to the HTTP collaborator.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct TaskView {
    pub task_id: String,
    pub status: TaskStatus,
    pub progress: u8,
    pub stage: Option<String>,
    pub error: Option<String>,
    pub inputs: Vec<String>,
    pub downloads: Vec<String>,
    pub page_count: Option<u32>,
    pub file_errors: Vec<FileError>,
    pub created_at_unix: u64,
    pub updated_at_unix: u64,
    pub completed_at_unix: Option<u64>,
}
