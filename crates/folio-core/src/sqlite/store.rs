use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::Connection;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::models::{CoreError, CoreErrorKind};
use crate::persistence::{MigrationStore, PersistenceResult};
use crate::sqlite::migrations::{SqliteMigration, current_schema_version, migration};

const MIGRATIONS_TABLE: &str = "folio_schema_migrations";
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite-backed session registry, task record store and job queue. Every
/// process pointing at the same file shares the same state.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    database_path: PathBuf,
}

impl SqliteStore {
    pub fn new(database_path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: database_path.into(),
        }
    }

    pub fn migrate_to_latest(&self) -> PersistenceResult<()> {
        self.apply_migration(current_schema_version())
    }

    pub(crate) fn with_connection<T>(
        &self,
        operation_name: &str,
        operation: impl FnOnce(&mut Connection) -> rusqlite::Result<T>,
    ) -> PersistenceResult<T> {
        let mut connection = open_connection(&self.database_path)
            .map_err(|error| storage_error(operation_name, error))?;
        operation(&mut connection).map_err(|error| storage_error(operation_name, error))
    }
}

impl MigrationStore for SqliteStore {
    fn current_version(&self) -> PersistenceResult<i64> {
        self.with_connection("current_version", |connection| {
            ensure_migrations_table(connection)?;
            read_current_version(connection)
        })
    }

    fn apply_migration(&self, target_version: i64) -> PersistenceResult<()> {
        if target_version < 0 || target_version > current_schema_version() {
            return Err(storage_error_text(
                "apply_migration",
                format!("invalid migration target version '{target_version}'"),
            ));
        }

        if target_version > 0 && migration(target_version).is_none() {
            return Err(storage_error_text(
                "apply_migration",
                format!("migration version '{target_version}' is not defined"),
            ));
        }

        self.with_connection("apply_migration", |connection| {
            ensure_migrations_table(connection)?;
            let current_version = read_current_version(connection)?;

            if target_version == current_version {
                // All DDL is IF NOT EXISTS; re-running it repairs a schema whose
                // version row survived while tables were dropped.
                for version in 1..=target_version {
                    connection.execute_batch(defined_migration(version)?.up_sql)?;
                }
                return Ok(());
            }

            if target_version > current_version {
                for version in (current_version + 1)..=target_version {
                    apply_up_migration(connection, defined_migration(version)?)?;
                }
            } else {
                for version in ((target_version + 1)..=current_version).rev() {
                    apply_down_migration(connection, defined_migration(version)?)?;
                }
            }

            Ok(())
        })
    }
}

fn open_connection(database_path: &Path) -> rusqlite::Result<Connection> {
    if let Some(parent) = database_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|error| rusqlite::Error::ToSqlConversionFailure(Box::new(error)))?;
    }
    let connection = Connection::open(database_path)?;
    connection.busy_timeout(BUSY_TIMEOUT)?;
    connection.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
        row.get::<_, String>(0)
    })?;
    Ok(connection)
}

fn ensure_migrations_table(connection: &Connection) -> rusqlite::Result<()> {
    connection.execute_batch(
        "
CREATE TABLE IF NOT EXISTS folio_schema_migrations (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at_unix INTEGER NOT NULL
);
",
    )?;
    Ok(())
}

pub(crate) fn ensure_schema_ready(connection: &Connection) -> rusqlite::Result<()> {
    ensure_migrations_table(connection)?;
    let version = read_current_version(connection)?;
    if version < current_schema_version() {
        return Err(storage_error_sqlite(&format!(
            "database schema is at version {version}; run migrations before using the store"
        )));
    }
    Ok(())
}

fn read_current_version(connection: &Connection) -> rusqlite::Result<i64> {
    connection.query_row(
        &format!("SELECT COALESCE(MAX(version), 0) FROM {MIGRATIONS_TABLE}"),
        [],
        |row| row.get(0),
    )
}

fn defined_migration(version: i64) -> rusqlite::Result<&'static SqliteMigration> {
    migration(version).ok_or_else(|| {
        storage_error_sqlite(&format!("migration version '{version}' is not defined"))
    })
}

fn apply_up_migration(
    connection: &mut Connection,
    migration: &SqliteMigration,
) -> rusqlite::Result<()> {
    let transaction = connection.transaction()?;
    transaction.execute_batch(migration.up_sql)?;
    transaction.execute(
        &format!(
            "INSERT INTO {MIGRATIONS_TABLE} (version, name, applied_at_unix)
             VALUES (?1, ?2, strftime('%s', 'now'))"
        ),
        (migration.version, migration.name),
    )?;
    transaction.commit()?;
    Ok(())
}

fn apply_down_migration(
    connection: &mut Connection,
    migration: &SqliteMigration,
) -> rusqlite::Result<()> {
    let transaction = connection.transaction()?;
    transaction.execute_batch(migration.down_sql)?;
    transaction.execute(
        &format!("DELETE FROM {MIGRATIONS_TABLE} WHERE version = ?1"),
        [migration.version],
    )?;
    transaction.commit()?;
    Ok(())
}

pub(crate) fn storage_error(operation: &str, error: rusqlite::Error) -> CoreError {
    storage_error_text(operation, error.to_string())
}

pub(crate) fn storage_error_sqlite(message: &str) -> rusqlite::Error {
    rusqlite::Error::ToSqlConversionFailure(Box::new(std::io::Error::other(message.to_string())))
}

pub(crate) fn storage_error_text(operation: &str, message: impl AsRef<str>) -> CoreError {
    CoreError::new(
        CoreErrorKind::StorageFailure,
        format!("sqlite store '{operation}' failed: {}", message.as_ref()),
    )
}

pub(crate) fn to_unix_millis(value: SystemTime) -> rusqlite::Result<i64> {
    let duration = value.duration_since(UNIX_EPOCH).map_err(|error| {
        storage_error_sqlite(&format!("time before unix epoch is not supported: {error}"))
    })?;
    i64::try_from(duration.as_millis())
        .map_err(|_| storage_error_sqlite("unix timestamp millis exceed i64 range"))
}

pub(crate) fn from_unix_millis(value: i64) -> rusqlite::Result<SystemTime> {
    let millis = u64::try_from(value)
        .map_err(|_| storage_error_sqlite("negative unix timestamps are not supported"))?;
    Ok(UNIX_EPOCH + Duration::from_millis(millis))
}

pub(crate) fn deadline_millis(now: SystemTime, ttl: Duration) -> rusqlite::Result<i64> {
    let now_ms = to_unix_millis(now)?;
    let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
    Ok(now_ms.saturating_add(ttl_ms))
}

pub(crate) fn to_json<T: Serialize + ?Sized>(value: &T) -> rusqlite::Result<String> {
    serde_json::to_string(value)
        .map_err(|error| rusqlite::Error::ToSqlConversionFailure(Box::new(error)))
}

pub(crate) fn from_json<T: DeserializeOwned>(raw: &str, column: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw).map_err(|error| {
        storage_error_sqlite(&format!("column '{column}' holds malformed json: {error}"))
    })
}
