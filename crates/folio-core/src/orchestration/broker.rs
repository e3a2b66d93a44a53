use std::fmt::{Display, Formatter};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::models::{SessionId, TaskId};
use crate::orchestration::OrchestrationResult;

#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct JobHandle(String);

impl JobHandle {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for JobHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobEnvelope {
    Process {
        task_id: TaskId,
        session_id: SessionId,
    },
    /// Synthetic job used by the queue health check.
    Ping { nonce: String },
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ClaimedJob {
    pub handle: JobHandle,
    pub envelope: JobEnvelope,
    /// Lease holder named in `claim`.
    pub worker: String,
    /// Deliveries so far, including this one.
    pub attempts: u32,
}

/// At-least-once job transport. A claimed job is leased to one worker; if
/// the lease runs out before `ack` or `release`, the job becomes claimable again.
/// `ack` and `release` only act on the delivery they are given: once another
/// worker has claimed the job they return false and leave it alone.
pub trait JobBroker: Send + Sync {
    fn publish(&self, envelope: &JobEnvelope) -> OrchestrationResult<JobHandle>;

    fn claim(&self, worker: &str, lease: Duration) -> OrchestrationResult<Option<ClaimedJob>>;

    fn ack(&self, job: &ClaimedJob) -> OrchestrationResult<bool>;

    /// Returns a claimed job to the queue, claimable again after `delay`.
    fn release(&self, job: &ClaimedJob, delay: Duration) -> OrchestrationResult<bool>;

    /// Drops a job that no worker holds yet. Returns false when it was already
    /// claimed or gone.
    fn revoke(&self, handle: &JobHandle) -> OrchestrationResult<bool>;

    fn record_ping(&self, nonce: &str) -> OrchestrationResult<()>;

    /// True once a worker has answered the ping; the answer is consumed.
    fn consume_ping(&self, nonce: &str) -> OrchestrationResult<bool>;

    fn pending_jobs(&self) -> OrchestrationResult<u64>;
}
