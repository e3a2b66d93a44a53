use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::models::{CoreError, CoreErrorKind};
use crate::orchestration::{ClaimedJob, JobBroker, JobEnvelope, JobHandle, OrchestrationResult};

/// Single-process broker with the same lease semantics as the SQLite one.
#[derive(Default)]
pub struct InMemoryJobBroker {
    state: Mutex<BrokerState>,
}

#[derive(Default)]
struct BrokerState {
    next_sequence: u64,
    jobs: HashMap<JobHandle, QueuedJob>,
    answered_pings: HashSet<String>,
}

struct QueuedJob {
    sequence: u64,
    envelope: JobEnvelope,
    available_at: Instant,
    leased_until: Option<Instant>,
    lease_owner: Option<String>,
    attempts: u32,
}

impl QueuedJob {
    fn is_claimable(&self, now: Instant) -> bool {
        match self.leased_until {
            Some(deadline) => deadline <= now,
            None => self.available_at <= now,
        }
    }

    fn is_held_by(&self, job: &ClaimedJob) -> bool {
        self.leased_until.is_some()
            && self.lease_owner.as_deref() == Some(job.worker.as_str())
            && self.attempts == job.attempts
    }
}

impl InMemoryJobBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_state(&self) -> OrchestrationResult<MutexGuard<'_, BrokerState>> {
        self.state.lock().map_err(|_| {
            CoreError::new(
                CoreErrorKind::Internal,
                "in-memory job broker mutex poisoned",
            )
        })
    }
}

impl JobBroker for InMemoryJobBroker {
    fn publish(&self, envelope: &JobEnvelope) -> OrchestrationResult<JobHandle> {
        let mut state = self.lock_state()?;
        let handle = JobHandle::generate();
        let sequence = state.next_sequence;
        state.next_sequence = state.next_sequence.saturating_add(1);
        state.jobs.insert(
            handle.clone(),
            QueuedJob {
                sequence,
                envelope: envelope.clone(),
                available_at: Instant::now(),
                leased_until: None,
                lease_owner: None,
                attempts: 0,
            },
        );
        Ok(handle)
    }

    fn claim(&self, worker: &str, lease: Duration) -> OrchestrationResult<Option<ClaimedJob>> {
        let mut state = self.lock_state()?;
        let now = Instant::now();
        let next = state
            .jobs
            .iter()
            .filter(|(_, job)| job.is_claimable(now))
            .min_by_key(|(_, job)| (job.available_at, job.sequence))
            .map(|(handle, _)| handle.clone());

        let Some(handle) = next else {
            return Ok(None);
        };
        let Some(job) = state.jobs.get_mut(&handle) else {
            return Ok(None);
        };
        job.attempts = job.attempts.saturating_add(1);
        job.leased_until = Some(now + lease);
        job.lease_owner = Some(worker.to_string());

        Ok(Some(ClaimedJob {
            handle,
            envelope: job.envelope.clone(),
            worker: worker.to_string(),
            attempts: job.attempts,
        }))
    }

    fn ack(&self, job: &ClaimedJob) -> OrchestrationResult<bool> {
        let mut state = self.lock_state()?;
        let held = state
            .jobs
            .get(&job.handle)
            .is_some_and(|queued| queued.is_held_by(job));
        if held {
            state.jobs.remove(&job.handle);
        }
        Ok(held)
    }

    fn release(&self, job: &ClaimedJob, delay: Duration) -> OrchestrationResult<bool> {
        let mut state = self.lock_state()?;
        match state.jobs.get_mut(&job.handle) {
            Some(queued) if queued.is_held_by(job) => {
                queued.leased_until = None;
                queued.lease_owner = None;
                queued.available_at = Instant::now() + delay;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn revoke(&self, handle: &JobHandle) -> OrchestrationResult<bool> {
        let mut state = self.lock_state()?;
        let unclaimed = state
            .jobs
            .get(handle)
            .is_some_and(|job| job.leased_until.is_none());
        if unclaimed {
            state.jobs.remove(handle);
        }
        Ok(unclaimed)
    }

    fn record_ping(&self, nonce: &str) -> OrchestrationResult<()> {
        self.lock_state()?.answered_pings.insert(nonce.to_string());
        Ok(())
    }

    fn consume_ping(&self, nonce: &str) -> OrchestrationResult<bool> {
        Ok(self.lock_state()?.answered_pings.remove(nonce))
    }

    fn pending_jobs(&self) -> OrchestrationResult<u64> {
        Ok(self.lock_state()?.jobs.len() as u64)
    }
}
