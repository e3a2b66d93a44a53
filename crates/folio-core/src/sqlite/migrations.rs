#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SqliteMigration {
    pub version: i64,
    pub name: &'static str,
    pub up_sql: &'static str,
    pub down_sql: &'static str,
}

const MIGRATION_0001: SqliteMigration = SqliteMigration {
    version: 1,
    name: "initial_session_and_task_schema",
    up_sql: r#"
CREATE TABLE IF NOT EXISTS sessions (
    session_id TEXT PRIMARY KEY,
    created_at_ms INTEGER NOT NULL,
    last_activity_ms INTEGER NOT NULL,
    task_count INTEGER NOT NULL DEFAULT 0,
    expires_at_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS task_records (
    task_id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    status TEXT NOT NULL,
    progress INTEGER NOT NULL DEFAULT 0,
    stage TEXT,
    inputs_json TEXT NOT NULL,
    outputs_json TEXT NOT NULL,
    options_json TEXT NOT NULL,
    page_count INTEGER,
    file_errors_json TEXT NOT NULL,
    error_message TEXT,
    job_handle TEXT,
    created_at_ms INTEGER NOT NULL,
    updated_at_ms INTEGER NOT NULL,
    completed_at_ms INTEGER,
    expires_at_ms INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_task_records_status
    ON task_records (status);

CREATE TABLE IF NOT EXISTS session_task_index (
    session_id TEXT NOT NULL,
    task_id TEXT NOT NULL,
    expires_at_ms INTEGER NOT NULL,
    PRIMARY KEY (session_id, task_id)
);
"#,
    down_sql: r#"
DROP TABLE IF EXISTS session_task_index;
DROP INDEX IF EXISTS idx_task_records_status;
DROP TABLE IF EXISTS task_records;
DROP TABLE IF EXISTS sessions;
"#,
};

const MIGRATION_0002: SqliteMigration = SqliteMigration {
    version: 2,
    name: "add_job_queue",
    up_sql: r#"
CREATE TABLE IF NOT EXISTS job_queue (
    job_id TEXT PRIMARY KEY,
    payload_json TEXT NOT NULL,
    state TEXT NOT NULL,
    available_at_ms INTEGER NOT NULL,
    lease_owner TEXT,
    lease_expires_at_ms INTEGER,
    attempts INTEGER NOT NULL DEFAULT 0,
    enqueued_at_ms INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_job_queue_claim
    ON job_queue (state, available_at_ms);

CREATE TABLE IF NOT EXISTS health_pings (
    nonce TEXT PRIMARY KEY,
    completed_at_ms INTEGER NOT NULL
);
"#,
    down_sql: r#"
DROP TABLE IF EXISTS health_pings;
DROP INDEX IF EXISTS idx_job_queue_claim;
DROP TABLE IF EXISTS job_queue;
"#,
};

const MIGRATIONS: [SqliteMigration; 2] = [MIGRATION_0001, MIGRATION_0002];

pub fn migrations() -> &'static [SqliteMigration] {
    &MIGRATIONS
}

pub fn migration(version: i64) -> Option<&'static SqliteMigration> {
    MIGRATIONS.iter().find(|entry| entry.version == version)
}

pub fn current_schema_version() -> i64 {
    MIGRATIONS.last().map(|entry| entry.version).unwrap_or(0)
}
