use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use walkdir::WalkDir;

use crate::models::{ArtifactRef, ArtifactRole, CoreError, CoreErrorKind, SessionId, TaskId};

pub type StorageResult<T> = Result<T, CoreError>;

const MAX_FILENAME_BYTES: usize = 200;
const FALLBACK_FILENAME: &str = "file";

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StoredArtifact {
    pub reference: ArtifactRef,
    pub path: PathBuf,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct CleanupStats {
    pub files_removed: u64,
    pub bytes_removed: u64,
    pub directories_removed: u64,
    pub errors: u64,
}

impl CleanupStats {
    fn absorb(&mut self, other: CleanupStats) {
        self.files_removed += other.files_removed;
        self.bytes_removed += other.bytes_removed;
        self.directories_removed += other.directories_removed;
        self.errors += other.errors;
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct AgeCleanupReport {
    pub per_role: Vec<(ArtifactRole, CleanupStats)>,
}

impl AgeCleanupReport {
    pub fn total(&self) -> CleanupStats {
        let mut total = CleanupStats::default();
        for (_, stats) in &self.per_role {
            total.absorb(*stats);
        }
        total
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct RoleUsage {
    pub role: ArtifactRole,
    pub bytes: u64,
    pub files: u64,
}

/// Filesystem storage for task artifacts.
///
/// Layout under `root`:
/// - `uploads/{session}/{task}_{filename}`
/// - `outputs/{session}/{task}_{filename}`
/// - `temp/{task}/{filename}`
///
/// Physical paths are always derived from the logical key; callers never
/// hand in a path.
#[derive(Clone, Debug)]
pub struct ArtifactStorage {
    root: PathBuf,
}

impl ArtifactStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ensure_layout(&self) -> StorageResult<()> {
        for role in ArtifactRole::ALL {
            let dir = self.root.join(role.dir_name());
            fs::create_dir_all(&dir).map_err(|error| io_error("ensure_layout", &dir, error))?;
        }
        Ok(())
    }

    pub fn store(
        &self,
        session: &SessionId,
        task: &TaskId,
        role: ArtifactRole,
        filename: &str,
        bytes: &[u8],
    ) -> StorageResult<StoredArtifact> {
        let filename = sanitize_filename(filename);
        let path = self.artifact_path(session, task, role, &filename);
        let written = match write_creating_parent(&path, bytes) {
            // Age cleanup may drop the parent between creation and write.
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                write_creating_parent(&path, bytes)
            }
            result => result,
        };
        written.map_err(|error| io_error("store", &path, error))?;

        Ok(StoredArtifact {
            reference: ArtifactRef {
                role,
                filename,
                size_bytes: bytes.len() as u64,
            },
            path,
        })
    }

    pub fn resolve(
        &self,
        session: &SessionId,
        task: &TaskId,
        role: ArtifactRole,
        filename: &str,
    ) -> Option<PathBuf> {
        let path = self.artifact_path(session, task, role, &sanitize_filename(filename));
        path.is_file().then_some(path)
    }

    /// Only uploads and outputs are ever served.
    pub fn verify_access(
        &self,
        session: &SessionId,
        task: &TaskId,
        role: ArtifactRole,
        filename: &str,
    ) -> bool {
        role.is_servable() && self.resolve(session, task, role, filename).is_some()
    }

    pub fn read(
        &self,
        session: &SessionId,
        task: &TaskId,
        role: ArtifactRole,
        filename: &str,
    ) -> StorageResult<Vec<u8>> {
        let path = self.resolve(session, task, role, filename).ok_or_else(|| {
            CoreError::for_task(
                task,
                CoreErrorKind::NotFound,
                format!("artifact '{filename}' ({role}) was not found"),
            )
        })?;
        fs::read(&path).map_err(|error| io_error("read", &path, error))
    }

    pub fn remove(
        &self,
        session: &SessionId,
        task: &TaskId,
        role: ArtifactRole,
        filename: &str,
    ) -> CleanupStats {
        let mut stats = CleanupStats::default();
        if let Some(path) = self.resolve(session, task, role, filename) {
            remove_file(&path, &mut stats);
        }
        stats
    }

    /// Scratch directory for one job.
    pub fn work_dir(&self, task: &TaskId) -> StorageResult<PathBuf> {
        let dir = self.temp_dir(task);
        fs::create_dir_all(&dir).map_err(|error| io_error("work_dir", &dir, error))?;
        Ok(dir)
    }

    pub fn cleanup_temp(&self, task: &TaskId) -> CleanupStats {
        let mut stats = CleanupStats::default();
        remove_tree(&self.temp_dir(task), &mut stats);
        stats
    }

    /// Removes every artifact of the pair in every role. Safe to repeat.
    pub fn cleanup_task(&self, session: &SessionId, task: &TaskId) -> CleanupStats {
        let mut stats = CleanupStats::default();
        let prefix = format!("{task}_");

        for role in [ArtifactRole::Input, ArtifactRole::Output] {
            let dir = self.session_dir(role, session);
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(error) if error.kind() == io::ErrorKind::NotFound => continue,
                Err(error) => {
                    log_cleanup_error(&dir, &error);
                    stats.errors += 1;
                    continue;
                }
            };
            for entry in entries.flatten() {
                let matches_task = entry
                    .file_name()
                    .to_str()
                    .is_some_and(|name| name.starts_with(&prefix));
                if matches_task {
                    remove_file(&entry.path(), &mut stats);
                }
            }
            remove_dir_if_empty(&dir, &mut stats);
        }

        stats.absorb(self.cleanup_temp(task));
        stats
    }

    /// Deletes files at least `max_age` old in every role, then drops empty
    /// directories that are themselves at least `max_age` old. A fresh
    /// directory belongs to live work even while it is empty.
    pub fn cleanup_older_than(&self, max_age: Duration) -> AgeCleanupReport {
        let now = SystemTime::now();
        let mut report = AgeCleanupReport::default();

        for role in ArtifactRole::ALL {
            let role_root = self.root.join(role.dir_name());
            let mut stats = CleanupStats::default();
            if !role_root.is_dir() {
                report.per_role.push((role, stats));
                continue;
            }

            for entry in WalkDir::new(&role_root).min_depth(1) {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(error) => {
                        tracing::warn!(role = %role, error = %error, "artifact scan error");
                        stats.errors += 1;
                        continue;
                    }
                };
                if !entry.file_type().is_file() {
                    continue;
                }
                match entry_age(&entry, now) {
                    Some(age) if age >= max_age => remove_file(entry.path(), &mut stats),
                    Some(_) => {}
                    None => stats.errors += 1,
                }
            }

            for entry in WalkDir::new(&role_root)
                .min_depth(1)
                .contents_first(true)
                .into_iter()
                .filter_map(Result::ok)
            {
                let stale = entry_age(&entry, now).is_some_and(|age| age >= max_age);
                if entry.file_type().is_dir() && stale {
                    remove_dir_if_empty(entry.path(), &mut stats);
                }
            }

            report.per_role.push((role, stats));
        }

        report
    }

    pub fn usage(&self) -> Vec<RoleUsage> {
        ArtifactRole::ALL
            .into_iter()
            .map(|role| {
                let mut usage = RoleUsage {
                    role,
                    bytes: 0,
                    files: 0,
                };
                for entry in WalkDir::new(self.root.join(role.dir_name()))
                    .into_iter()
                    .filter_map(Result::ok)
                    .filter(|entry| entry.file_type().is_file())
                {
                    usage.files += 1;
                    usage.bytes += entry.metadata().map(|metadata| metadata.len()).unwrap_or(0);
                }
                usage
            })
            .collect()
    }

    fn artifact_path(
        &self,
        session: &SessionId,
        task: &TaskId,
        role: ArtifactRole,
        filename: &str,
    ) -> PathBuf {
        match role {
            ArtifactRole::Temp => self.temp_dir(task).join(filename),
            ArtifactRole::Input | ArtifactRole::Output => self
                .session_dir(role, session)
                .join(format!("{task}_{filename}")),
        }
    }

    fn session_dir(&self, role: ArtifactRole, session: &SessionId) -> PathBuf {
        self.root.join(role.dir_name()).join(session.as_str())
    }

    fn temp_dir(&self, task: &TaskId) -> PathBuf {
        self.root
            .join(ArtifactRole::Temp.dir_name())
            .join(task.as_str())
    }
}

/// Reduces a client-supplied name to a single safe path component.
pub fn sanitize_filename(raw: &str) -> String {
    let base = raw.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base
        .chars()
        .filter_map(|character| match character {
            'A'..='Z' | 'a'..='z' | '0'..='9' | '.' | '_' | '-' => Some(character),
            character if character.is_whitespace() => Some('_'),
            _ => None,
        })
        .collect();
    let trimmed = cleaned.trim_start_matches('.');
    if trimmed.is_empty() {
        return FALLBACK_FILENAME.to_string();
    }
    bound_length(trimmed)
}

fn bound_length(name: &str) -> String {
    if name.len() <= MAX_FILENAME_BYTES {
        return name.to_string();
    }
    match name.rfind('.') {
        Some(dot) if name.len() - dot < MAX_FILENAME_BYTES => {
            let extension = &name[dot..];
            let stem_budget = MAX_FILENAME_BYTES - extension.len();
            format!("{}{}", &name[..stem_budget], extension)
        }
        _ => name[..MAX_FILENAME_BYTES].to_string(),
    }
}

fn write_creating_parent(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, bytes)
}

fn entry_age(entry: &walkdir::DirEntry, now: SystemTime) -> Option<Duration> {
    let modified = entry.metadata().ok()?.modified().ok()?;
    Some(now.duration_since(modified).unwrap_or(Duration::ZERO))
}

fn remove_file(path: &Path, stats: &mut CleanupStats) {
    let size = fs::metadata(path).map(|metadata| metadata.len()).unwrap_or(0);
    match fs::remove_file(path) {
        Ok(()) => {
            stats.files_removed += 1;
            stats.bytes_removed += size;
        }
        Err(error) if error.kind() == io::ErrorKind::NotFound => {}
        Err(error) => {
            log_cleanup_error(path, &error);
            stats.errors += 1;
        }
    }
}

fn remove_tree(dir: &Path, stats: &mut CleanupStats) {
    if !dir.is_dir() {
        return;
    }
    for entry in WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
    {
        remove_file(entry.path(), stats);
    }
    match fs::remove_dir_all(dir) {
        Ok(()) => stats.directories_removed += 1,
        Err(error) if error.kind() == io::ErrorKind::NotFound => {}
        Err(error) => {
            log_cleanup_error(dir, &error);
            stats.errors += 1;
        }
    }
}

fn remove_dir_if_empty(dir: &Path, stats: &mut CleanupStats) {
    let is_empty = fs::read_dir(dir)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(false);
    if is_empty && fs::remove_dir(dir).is_ok() {
        stats.directories_removed += 1;
    }
}

fn log_cleanup_error(path: &Path, error: &io::Error) {
    tracing::warn!(
        path = %path.display(),
        kind = ?CoreErrorKind::CleanupFailure,
        error = %error,
        "artifact cleanup skipped an entry"
    );
}

fn io_error(operation: &str, path: &Path, error: io::Error) -> CoreError {
    CoreError::new(
        CoreErrorKind::StorageFailure,
        format!(
            "artifact storage '{operation}' failed for '{}': {error}",
            path.display()
        ),
    )
}
