use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::models::{CoreError, CoreErrorKind, Session, SessionId};
use crate::persistence::{PersistenceResult, SessionStore};

/// Anonymous session tokens with a sliding activity TTL.
pub struct SessionRegistry {
    store: Arc<dyn SessionStore>,
    ttl: Duration,
}

impl SessionRegistry {
    pub fn new(store: Arc<dyn SessionStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn create(&self) -> PersistenceResult<Session> {
        let session = Session::new(SystemTime::now());
        self.store.insert_session(&session, self.ttl)?;
        tracing::debug!(session_id = %session.id, "session created");
        Ok(session)
    }

    /// True when the session exists; a hit also slides its expiry forward.
    /// Malformed ids and storage failures both answer false.
    pub fn validate(&self, raw_id: &str) -> bool {
        self.authorize(raw_id).is_ok()
    }

    /// Like [`validate`](Self::validate), returning the parsed id for
    /// follow-up calls. Unknown and malformed ids are `NotFound`; a store
    /// failure surfaces with its own kind so callers never mistake an outage
    /// for a lost session.
    pub fn authorize(&self, raw_id: &str) -> Result<SessionId, CoreError> {
        let id = SessionId::parse(raw_id).map_err(|_| session_rejected())?;
        match self.store.touch_session(&id, self.ttl) {
            Ok(true) => Ok(id),
            Ok(false) => Err(session_rejected()),
            Err(error) => {
                tracing::error!(
                    session_id = %id,
                    kind = ?error.kind,
                    message = %error.message,
                    "session validation failed"
                );
                Err(error)
            }
        }
    }

    pub fn increment_task_count(&self, id: &SessionId) -> PersistenceResult<bool> {
        self.store.increment_task_count(id, self.ttl)
    }

    pub fn get(&self, id: &SessionId) -> PersistenceResult<Option<Session>> {
        self.store.get_session(id)
    }

    pub fn purge_expired(&self) -> PersistenceResult<usize> {
        self.store.purge_expired_sessions()
    }
}

fn session_rejected() -> CoreError {
    CoreError::new(
        CoreErrorKind::NotFound,
        "session was not found or has expired",
    )
}
