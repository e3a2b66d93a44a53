use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use rusqlite::{OptionalExtension, TransactionBehavior, params};

use crate::models::{CoreError, CoreErrorKind};
use crate::orchestration::{ClaimedJob, JobBroker, JobEnvelope, JobHandle, OrchestrationResult};
use crate::persistence::PersistenceResult;
use crate::sqlite::store::{
    SqliteStore, deadline_millis, ensure_schema_ready, from_json, to_json, to_unix_millis,
};

/// Durable job queue living in the same database as the task records.
#[derive(Clone, Debug)]
pub struct SqliteJobBroker {
    store: SqliteStore,
}

impl SqliteJobBroker {
    pub fn new(database_path: impl Into<PathBuf>) -> Self {
        Self {
            store: SqliteStore::new(database_path),
        }
    }

    pub fn from_store(store: SqliteStore) -> Self {
        Self { store }
    }
}

impl JobBroker for SqliteJobBroker {
    fn publish(&self, envelope: &JobEnvelope) -> OrchestrationResult<JobHandle> {
        let handle = JobHandle::generate();
        broker_result(self.store.with_connection("publish_job", |connection| {
            ensure_schema_ready(connection)?;
            let now_ms = to_unix_millis(SystemTime::now())?;
            connection.execute(
                "
INSERT INTO job_queue (job_id, payload_json, state, available_at_ms, attempts, enqueued_at_ms)
VALUES (?1, ?2, 'pending', ?3, 0, ?3)
",
                params![handle.as_str(), to_json(envelope)?, now_ms],
            )?;
            Ok(())
        }))?;
        Ok(handle)
    }

    fn claim(&self, worker: &str, lease: Duration) -> OrchestrationResult<Option<ClaimedJob>> {
        broker_result(self.store.with_connection("claim_job", |connection| {
            ensure_schema_ready(connection)?;
            let now = SystemTime::now();
            let now_ms = to_unix_millis(now)?;
            let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let candidate = transaction
                .query_row(
                    "
SELECT job_id, payload_json, attempts
FROM job_queue
WHERE (state = 'pending' AND available_at_ms <= ?1)
   OR (state = 'leased' AND lease_expires_at_ms <= ?1)
ORDER BY available_at_ms ASC, enqueued_at_ms ASC
LIMIT 1
",
                    [now_ms],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, u32>(2)?,
                        ))
                    },
                )
                .optional()?;

            let Some((job_id, payload, attempts)) = candidate else {
                return Ok(None);
            };

            transaction.execute(
                "
UPDATE job_queue
SET state = 'leased', lease_owner = ?2, lease_expires_at_ms = ?3, attempts = attempts + 1
WHERE job_id = ?1
",
                params![job_id, worker, deadline_millis(now, lease)?],
            )?;
            transaction.commit()?;

            Ok(Some(ClaimedJob {
                handle: JobHandle::from_raw(job_id),
                envelope: from_json(&payload, "payload_json")?,
                worker: worker.to_string(),
                attempts: attempts.saturating_add(1),
            }))
        }))
    }

    fn ack(&self, job: &ClaimedJob) -> OrchestrationResult<bool> {
        broker_result(self.store.with_connection("ack_job", |connection| {
            ensure_schema_ready(connection)?;
            let removed = connection.execute(
                "
DELETE FROM job_queue
WHERE job_id = ?1 AND state = 'leased' AND lease_owner = ?2 AND attempts = ?3
",
                params![job.handle.as_str(), job.worker, job.attempts],
            )?;
            Ok(removed > 0)
        }))
    }

    fn release(&self, job: &ClaimedJob, delay: Duration) -> OrchestrationResult<bool> {
        broker_result(self.store.with_connection("release_job", |connection| {
            ensure_schema_ready(connection)?;
            let changed = connection.execute(
                "
UPDATE job_queue
SET state = 'pending', available_at_ms = ?4, lease_owner = NULL, lease_expires_at_ms = NULL
WHERE job_id = ?1 AND state = 'leased' AND lease_owner = ?2 AND attempts = ?3
",
                params![
                    job.handle.as_str(),
                    job.worker,
                    job.attempts,
                    deadline_millis(SystemTime::now(), delay)?
                ],
            )?;
            Ok(changed > 0)
        }))
    }

    fn revoke(&self, handle: &JobHandle) -> OrchestrationResult<bool> {
        broker_result(self.store.with_connection("revoke_job", |connection| {
            ensure_schema_ready(connection)?;
            let removed = connection.execute(
                "DELETE FROM job_queue WHERE job_id = ?1 AND state = 'pending'",
                [handle.as_str()],
            )?;
            Ok(removed > 0)
        }))
    }

    fn record_ping(&self, nonce: &str) -> OrchestrationResult<()> {
        broker_result(self.store.with_connection("record_ping", |connection| {
            ensure_schema_ready(connection)?;
            connection.execute(
                "INSERT OR REPLACE INTO health_pings (nonce, completed_at_ms) VALUES (?1, ?2)",
                params![nonce, to_unix_millis(SystemTime::now())?],
            )?;
            Ok(())
        }))
    }

    fn consume_ping(&self, nonce: &str) -> OrchestrationResult<bool> {
        broker_result(self.store.with_connection("consume_ping", |connection| {
            ensure_schema_ready(connection)?;
            let removed = connection.execute("DELETE FROM health_pings WHERE nonce = ?1", [nonce])?;
            Ok(removed > 0)
        }))
    }

    fn pending_jobs(&self) -> OrchestrationResult<u64> {
        broker_result(self.store.with_connection("pending_jobs", |connection| {
            ensure_schema_ready(connection)?;
            connection.query_row("SELECT COUNT(*) FROM job_queue", [], |row| row.get(0))
        }))
    }
}

fn broker_result<T>(result: PersistenceResult<T>) -> OrchestrationResult<T> {
    result.map_err(|error| CoreError {
        kind: CoreErrorKind::BrokerUnavailable,
        ..error
    })
}
