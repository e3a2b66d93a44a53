use std::time::{Duration, SystemTime};

use rusqlite::{OptionalExtension, Row, params};

use crate::models::{Session, SessionId};
use crate::persistence::{PersistenceResult, SessionStore};
use crate::sqlite::store::{
    SqliteStore, deadline_millis, ensure_schema_ready, from_unix_millis, storage_error_sqlite,
    to_unix_millis,
};

impl SessionStore for SqliteStore {
    fn insert_session(&self, session: &Session, ttl: Duration) -> PersistenceResult<()> {
        self.with_connection("insert_session", |connection| {
            ensure_schema_ready(connection)?;
            connection.execute(
                "
INSERT INTO sessions (session_id, created_at_ms, last_activity_ms, task_count, expires_at_ms)
VALUES (?1, ?2, ?3, ?4, ?5)
",
                params![
                    session.id.as_str(),
                    to_unix_millis(session.created_at)?,
                    to_unix_millis(session.last_activity)?,
                    i64::try_from(session.task_count).unwrap_or(i64::MAX),
                    deadline_millis(session.last_activity, ttl)?,
                ],
            )?;
            Ok(())
        })
    }

    fn touch_session(&self, id: &SessionId, ttl: Duration) -> PersistenceResult<bool> {
        self.with_connection("touch_session", |connection| {
            ensure_schema_ready(connection)?;
            let now = SystemTime::now();
            let changed = connection.execute(
                "
UPDATE sessions
SET last_activity_ms = ?2, expires_at_ms = ?3
WHERE session_id = ?1 AND expires_at_ms > ?2
",
                params![id.as_str(), to_unix_millis(now)?, deadline_millis(now, ttl)?],
            )?;
            Ok(changed > 0)
        })
    }

    fn increment_task_count(&self, id: &SessionId, ttl: Duration) -> PersistenceResult<bool> {
        self.with_connection("increment_task_count", |connection| {
            ensure_schema_ready(connection)?;
            let now = SystemTime::now();
            let changed = connection.execute(
                "
UPDATE sessions
SET task_count = task_count + 1, last_activity_ms = ?2, expires_at_ms = ?3
WHERE session_id = ?1 AND expires_at_ms > ?2
",
                params![id.as_str(), to_unix_millis(now)?, deadline_millis(now, ttl)?],
            )?;
            Ok(changed > 0)
        })
    }

    fn get_session(&self, id: &SessionId) -> PersistenceResult<Option<Session>> {
        self.with_connection("get_session", |connection| {
            ensure_schema_ready(connection)?;
            connection
                .query_row(
                    "
SELECT session_id, created_at_ms, last_activity_ms, task_count
FROM sessions
WHERE session_id = ?1 AND expires_at_ms > ?2
",
                    params![id.as_str(), to_unix_millis(SystemTime::now())?],
                    session_from_row,
                )
                .optional()
        })
    }

    fn purge_expired_sessions(&self) -> PersistenceResult<usize> {
        self.with_connection("purge_expired_sessions", |connection| {
            ensure_schema_ready(connection)?;
            connection.execute(
                "DELETE FROM sessions WHERE expires_at_ms <= ?1",
                [to_unix_millis(SystemTime::now())?],
            )
        })
    }
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<Session> {
    let raw_id: String = row.get(0)?;
    let id = SessionId::parse(&raw_id).map_err(|error| storage_error_sqlite(&error.message))?;
    let task_count: i64 = row.get(3)?;
    Ok(Session {
        id,
        created_at: from_unix_millis(row.get(1)?)?,
        last_activity: from_unix_millis(row.get(2)?)?,
        task_count: u64::try_from(task_count)
            .map_err(|_| storage_error_sqlite("negative task count in sqlite record"))?,
    })
}
