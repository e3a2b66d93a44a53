use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactRole {
    Input,
    Output,
    Temp,
}

impl ArtifactRole {
    pub const ALL: [ArtifactRole; 3] = [
        ArtifactRole::Input,
        ArtifactRole::Output,
        ArtifactRole::Temp,
    ];

    /// Top-level directory under the storage root.
    pub fn dir_name(self) -> &'static str {
        match self {
            ArtifactRole::Input => "uploads",
            ArtifactRole::Output => "outputs",
            ArtifactRole::Temp => "temp",
        }
    }

    /// Temp artifacts are worker scratch space and are never served.
    pub fn is_servable(self) -> bool {
        !matches!(self, ArtifactRole::Temp)
    }
}

impl Display for ArtifactRole {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Logical reference to a stored artifact. The owning session and task come
/// from the task record, so the physical path is always re-derived.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub role: ArtifactRole,
    pub filename: String,
    pub size_bytes: u64,
}
