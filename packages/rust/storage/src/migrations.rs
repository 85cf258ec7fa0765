//! SQL migration definitions for the ContextSync state database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: update_jobs, rollback_records, snapshots, snapshot_files",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version   INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Durable job records; job_json holds the full serialized UpdateJob
CREATE TABLE IF NOT EXISTS update_jobs (
    id           TEXT PRIMARY KEY,
    trigger_type TEXT NOT NULL,
    status       TEXT NOT NULL,
    created_at   TEXT NOT NULL,
    updated_at   TEXT NOT NULL,
    completed_at TEXT,
    job_json     TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_update_jobs_status ON update_jobs(status);
CREATE INDEX IF NOT EXISTS idx_update_jobs_created ON update_jobs(created_at);

-- One rollback record per job, keyed by the job id
CREATE TABLE IF NOT EXISTS rollback_records (
    update_id         TEXT PRIMARY KEY,
    status            TEXT NOT NULL,
    failure_reason    TEXT,
    affected_domains  TEXT NOT NULL,
    file_operations   TEXT NOT NULL DEFAULT '[]',
    created_at        TEXT NOT NULL,
    updated_at        TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_rollback_status ON rollback_records(status);

-- One snapshot per (record, domain)
CREATE TABLE IF NOT EXISTS snapshots (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    update_id   TEXT NOT NULL REFERENCES rollback_records(update_id) ON DELETE CASCADE,
    domain      TEXT NOT NULL,
    captured_at TEXT NOT NULL,
    UNIQUE(update_id, domain)
);

CREATE INDEX IF NOT EXISTS idx_snapshots_update ON snapshots(update_id);

-- Captured artifact bytes
CREATE TABLE IF NOT EXISTS snapshot_files (
    snapshot_id INTEGER NOT NULL REFERENCES snapshots(id) ON DELETE CASCADE,
    path        TEXT NOT NULL,
    sha256      TEXT NOT NULL,
    content     BLOB NOT NULL,
    PRIMARY KEY (snapshot_id, path)
);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
