pub mod artifact;
pub mod error;
pub mod progress;
pub mod session;
pub mod task;

pub use artifact::{ArtifactRef, ArtifactRole};
pub use error::{CoreError, CoreErrorKind, ErrorView};
pub use progress::ProgressEvent;
pub use session::{Session, SessionId};
pub use task::{FileError, Task, TaskId, TaskStatus, TaskView};

use std::time::{Duration, SystemTime, UNIX_EPOCH};

const MAX_IDENTIFIER_LEN: usize = 64;

/// Session and task ids become path components, so only `[A-Za-z0-9-]` is accepted.
pub(crate) fn validate_identifier(raw: &str, what: &str) -> Result<(), CoreError> {
    if raw.is_empty() || raw.len() > MAX_IDENTIFIER_LEN {
        return Err(CoreError::new(
            CoreErrorKind::InvalidInput,
            format!("{what} must be between 1 and {MAX_IDENTIFIER_LEN} characters"),
        ));
    }
    if !raw
        .chars()
        .all(|character| character.is_ascii_alphanumeric() || character == '-')
    {
        return Err(CoreError::new(
            CoreErrorKind::InvalidInput,
            format!("{what} contains characters outside [A-Za-z0-9-]"),
        ));
    }
    Ok(())
}

pub fn unix_seconds(value: SystemTime) -> u64 {
    value
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}
