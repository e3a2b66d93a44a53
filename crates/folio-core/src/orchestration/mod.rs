pub mod backoff;
pub mod broker;
pub mod in_memory;
pub mod task_queue;
pub mod worker;

pub use backoff::{RetryPolicy, retry_transient};
pub use broker::{ClaimedJob, JobBroker, JobEnvelope, JobHandle};
pub use in_memory::InMemoryJobBroker;
pub use task_queue::{HealthReport, TaskQueue};
pub use worker::{JobOutcome, WorkerPool, WorkerSettings};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::models::{CoreError, CoreErrorKind};

pub type OrchestrationResult<T> = Result<T, CoreError>;

#[derive(Clone, Debug, Default)]
pub struct TaskCancellationToken {
    flag: Arc<AtomicBool>,
}

impl TaskCancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Runs blocking store or broker work off the async executor.
pub(crate) async fn run_blocking<T, F>(
    operation_name: &'static str,
    operation: F,
) -> OrchestrationResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> OrchestrationResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(operation)
        .await
        .map_err(|error| {
            CoreError::new(
                CoreErrorKind::Internal,
                format!("blocking operation '{operation_name}' did not complete: {error}"),
            )
        })?
}
