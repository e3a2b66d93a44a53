use serde::Serialize;

use crate::models::TaskId;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CoreErrorKind {
    InvalidInput,
    NotFound,
    InvalidTransition,
    StorageFailure,
    BrokerUnavailable,
    ProcessingFailure,
    CleanupFailure,
    Timeout,
    Cancelled,
    Internal,
}

impl CoreErrorKind {
    /// Stable code surfaced to clients.
    pub fn code(self) -> &'static str {
        match self {
            CoreErrorKind::InvalidInput => "invalid_input",
            CoreErrorKind::NotFound => "not_found",
            CoreErrorKind::InvalidTransition => "invalid_transition",
            CoreErrorKind::StorageFailure => "storage_failure",
            CoreErrorKind::BrokerUnavailable => "broker_unavailable",
            CoreErrorKind::ProcessingFailure => "processing_failure",
            CoreErrorKind::CleanupFailure => "cleanup_failure",
            CoreErrorKind::Timeout => "timeout",
            CoreErrorKind::Cancelled => "cancelled",
            CoreErrorKind::Internal => "internal",
        }
    }

    pub fn is_client_error(self) -> bool {
        matches!(
            self,
            CoreErrorKind::InvalidInput | CoreErrorKind::NotFound | CoreErrorKind::InvalidTransition
        )
    }

    /// Infrastructure failures that are worth retrying with backoff.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            CoreErrorKind::StorageFailure | CoreErrorKind::BrokerUnavailable
        )
    }
}

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct CoreError {
    pub task: Option<TaskId>,
    pub kind: CoreErrorKind,
    pub message: String,
}

impl CoreError {
    pub fn new(kind: CoreErrorKind, message: impl Into<String>) -> Self {
        Self {
            task: None,
            kind,
            message: message.into(),
        }
    }

    pub fn for_task(task: &TaskId, kind: CoreErrorKind, message: impl Into<String>) -> Self {
        Self {
            task: Some(task.clone()),
            kind,
            message: message.into(),
        }
    }

    pub fn task_not_found(task: &TaskId) -> Self {
        Self::for_task(
            task,
            CoreErrorKind::NotFound,
            format!("task '{task}' was not found"),
        )
    }

    pub fn view(&self) -> ErrorView {
        ErrorView {
            code: self.kind.code(),
            message: self.message.clone(),
        }
    }
}

/// Client-facing rendering of a [`CoreError`].
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct ErrorView {
    pub code: &'static str,
    pub message: String,
}
