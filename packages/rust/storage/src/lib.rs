//! Turso Embedded / libSQL storage layer for ContextSync state.
//!
//! The [`Storage`] struct wraps a libSQL database holding durable job records
//! (the `state` area) and rollback records with their captured snapshot bytes
//! (the `snapshots` area).
//!
//! **Access rules:**
//! - Orchestrator: read-write via [`Storage::open`]
//! - Status queries from the CLI: read-only via [`Storage::open_readonly`]
//!
//! A libSQL connection shares one transaction scope, so every write goes
//! through an internal write lock.

mod migrations;

use std::path::Path;

use chrono::{DateTime, Utc};
use contextsync_shared::{
    ContextSyncError, DomainId, FileOperation, JobFilter, JobId, Result, RollbackRecord,
    RollbackStatus, RollbackSummary, Snapshot, SnapshotFile, UpdateJob,
};
use libsql::{Connection, Database, params};
use tokio::sync::Mutex;

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    write_lock: Mutex<()>,
    readonly: bool,
}

fn storage_err(e: libsql::Error) -> ContextSyncError {
    ContextSyncError::Storage(e.to_string())
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| ContextSyncError::Storage(format!("invalid date '{s}': {e}")))
}

fn parse_job_id(s: &str) -> Result<JobId> {
    s.parse()
        .map_err(|e| ContextSyncError::Storage(format!("invalid job id '{s}': {e}")))
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ContextSyncError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;
        let conn = db.connect().map_err(storage_err)?;

        let storage = Self {
            db,
            conn,
            write_lock: Mutex::new(()),
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open an existing database at `path` in read-only mode. Migrations
    /// are not run and a missing file is an error rather than created.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(ContextSyncError::Storage(format!(
                "state database {} does not exist",
                path.display()
            )));
        }
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;
        let conn = db.connect().map_err(storage_err)?;

        Ok(Self {
            db,
            conn,
            write_lock: Mutex::new(()),
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        ContextSyncError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(ContextSyncError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Job records
    // -----------------------------------------------------------------------

    /// Insert or replace a job record.
    pub async fn upsert_job(&self, job: &UpdateJob) -> Result<()> {
        self.check_writable()?;
        let json =
            serde_json::to_string(job).map_err(|e| ContextSyncError::Storage(e.to_string()))?;
        let _guard = self.write_lock.lock().await;
        self.conn
            .execute(
                "INSERT INTO update_jobs (id, trigger_type, status, created_at, updated_at, completed_at, job_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(id) DO UPDATE SET
                   status = excluded.status,
                   updated_at = excluded.updated_at,
                   completed_at = excluded.completed_at,
                   job_json = excluded.job_json",
                params![
                    job.id.to_string(),
                    job.trigger_type.as_str(),
                    job.status.as_str(),
                    job.created_at.to_rfc3339(),
                    job.updated_at.to_rfc3339(),
                    job.completed_at.map(|t| t.to_rfc3339()),
                    json,
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Get a job by id.
    pub async fn get_job(&self, id: &JobId) -> Result<Option<UpdateJob>> {
        let mut rows = self
            .conn
            .query(
                "SELECT job_json FROM update_jobs WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await.map_err(storage_err)? {
            Some(row) => {
                let json: String = row.get(0).map_err(storage_err)?;
                Ok(Some(decode_job(&json)?))
            }
            None => Ok(None),
        }
    }

    /// List jobs matching `filter`, newest first.
    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<UpdateJob>> {
        let mut rows = self
            .conn
            .query(
                "SELECT job_json FROM update_jobs ORDER BY created_at DESC, id DESC",
                params![],
            )
            .await
            .map_err(storage_err)?;

        let mut jobs = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            let json: String = row.get(0).map_err(storage_err)?;
            let job = decode_job(&json)?;
            if filter.matches(&job) {
                jobs.push(job);
            }
            if filter.limit.is_some_and(|limit| jobs.len() >= limit) {
                break;
            }
        }
        Ok(jobs)
    }

    /// Delete job records. Returns the number of rows removed.
    pub async fn delete_jobs(&self, ids: &[JobId]) -> Result<usize> {
        self.check_writable()?;
        let _guard = self.write_lock.lock().await;
        let tx = self.conn.transaction().await.map_err(storage_err)?;
        let mut removed = 0;
        for id in ids {
            removed += tx
                .execute(
                    "DELETE FROM update_jobs WHERE id = ?1",
                    params![id.to_string()],
                )
                .await
                .map_err(storage_err)? as usize;
        }
        tx.commit().await.map_err(storage_err)?;
        Ok(removed)
    }

    // -----------------------------------------------------------------------
    // Rollback records
    // -----------------------------------------------------------------------

    /// Insert a rollback record header (snapshots are added per domain).
    pub async fn insert_rollback_record(&self, record: &RollbackRecord) -> Result<()> {
        self.check_writable()?;
        let domains = encode_json(&record.affected_domains)?;
        let ops = encode_json(&record.file_operations)?;
        let _guard = self.write_lock.lock().await;
        self.conn
            .execute(
                "INSERT INTO rollback_records
                   (update_id, status, failure_reason, affected_domains, file_operations, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    record.update_id.to_string(),
                    record.status.as_str(),
                    record.failure_reason.as_deref(),
                    domains,
                    ops,
                    record.created_at.to_rfc3339(),
                    record.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Persist one domain's snapshot in a single transaction.
    pub async fn insert_snapshot(&self, update_id: &JobId, snapshot: &Snapshot) -> Result<()> {
        self.check_writable()?;
        let _guard = self.write_lock.lock().await;
        let tx = self.conn.transaction().await.map_err(storage_err)?;

        tx.execute(
            "INSERT INTO snapshots (update_id, domain, captured_at) VALUES (?1, ?2, ?3)",
            params![
                update_id.to_string(),
                snapshot.domain.as_str(),
                snapshot.captured_at.to_rfc3339(),
            ],
        )
        .await
        .map_err(storage_err)?;
        let snapshot_id = tx.last_insert_rowid();

        for (path, file) in &snapshot.files {
            tx.execute(
                "INSERT INTO snapshot_files (snapshot_id, path, sha256, content)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    snapshot_id,
                    path.as_str(),
                    file.sha256.as_str(),
                    libsql::Value::Blob(file.content.clone()),
                ],
            )
            .await
            .map_err(storage_err)?;
        }

        tx.commit().await.map_err(storage_err)?;
        Ok(())
    }

    /// Load a rollback record with all snapshot contents.
    pub async fn get_rollback_record(&self, update_id: &JobId) -> Result<Option<RollbackRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT status, failure_reason, affected_domains, file_operations, created_at, updated_at
                 FROM rollback_records WHERE update_id = ?1",
                params![update_id.to_string()],
            )
            .await
            .map_err(storage_err)?;

        let Some(row) = rows.next().await.map_err(storage_err)? else {
            return Ok(None);
        };

        let status: String = row.get(0).map_err(storage_err)?;
        let affected_domains: Vec<DomainId> =
            decode_json(&row.get::<String>(2).map_err(storage_err)?)?;
        let file_operations: Vec<FileOperation> =
            decode_json(&row.get::<String>(3).map_err(storage_err)?)?;

        let mut record = RollbackRecord {
            update_id: update_id.clone(),
            affected_domains,
            snapshots: Vec::new(),
            file_operations,
            status: status.parse()?,
            failure_reason: row.get::<String>(1).ok(),
            created_at: parse_ts(&row.get::<String>(4).map_err(storage_err)?)?,
            updated_at: parse_ts(&row.get::<String>(5).map_err(storage_err)?)?,
        };

        let mut snapshot_rows = self
            .conn
            .query(
                "SELECT id, domain, captured_at FROM snapshots WHERE update_id = ?1 ORDER BY id",
                params![update_id.to_string()],
            )
            .await
            .map_err(storage_err)?;

        let mut headers = Vec::new();
        while let Some(row) = snapshot_rows.next().await.map_err(storage_err)? {
            let id: i64 = row.get(0).map_err(storage_err)?;
            let domain = DomainId::new(row.get::<String>(1).map_err(storage_err)?)?;
            let captured_at = parse_ts(&row.get::<String>(2).map_err(storage_err)?)?;
            headers.push((id, domain, captured_at));
        }

        for (snapshot_id, domain, captured_at) in headers {
            let mut file_rows = self
                .conn
                .query(
                    "SELECT path, sha256, content FROM snapshot_files
                     WHERE snapshot_id = ?1 ORDER BY path",
                    params![snapshot_id],
                )
                .await
                .map_err(storage_err)?;

            let mut snapshot = Snapshot {
                domain,
                captured_at,
                files: Default::default(),
            };
            while let Some(row) = file_rows.next().await.map_err(storage_err)? {
                let path: String = row.get(0).map_err(storage_err)?;
                let sha256: String = row.get(1).map_err(storage_err)?;
                let content: Vec<u8> = row.get(2).map_err(storage_err)?;
                snapshot.files.insert(path, SnapshotFile { content, sha256 });
            }
            record.snapshots.push(snapshot);
        }

        Ok(Some(record))
    }

    /// List all rollback records without snapshot contents, oldest first.
    pub async fn list_rollback_summaries(&self) -> Result<Vec<RollbackSummary>> {
        let mut rows = self
            .conn
            .query(
                "SELECT update_id, status, failure_reason, affected_domains, created_at, updated_at
                 FROM rollback_records ORDER BY created_at, update_id",
                params![],
            )
            .await
            .map_err(storage_err)?;

        let mut summaries = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            let status: String = row.get(1).map_err(storage_err)?;
            let domains: Vec<DomainId> =
                decode_json(&row.get::<String>(3).map_err(storage_err)?)?;
            summaries.push(RollbackSummary {
                update_id: parse_job_id(&row.get::<String>(0).map_err(storage_err)?)?,
                status: status.parse()?,
                domain_count: domains.len(),
                failure_reason: row.get::<String>(2).ok(),
                created_at: parse_ts(&row.get::<String>(4).map_err(storage_err)?)?,
                updated_at: parse_ts(&row.get::<String>(5).map_err(storage_err)?)?,
            });
        }
        Ok(summaries)
    }

    /// Set a record's status and failure reason. Returns false if no such record.
    pub async fn set_rollback_status(
        &self,
        update_id: &JobId,
        status: RollbackStatus,
        failure_reason: Option<&str>,
    ) -> Result<bool> {
        self.check_writable()?;
        let _guard = self.write_lock.lock().await;
        let changed = self
            .conn
            .execute(
                "UPDATE rollback_records
                 SET status = ?1, failure_reason = COALESCE(?2, failure_reason), updated_at = ?3
                 WHERE update_id = ?4",
                params![
                    status.as_str(),
                    failure_reason,
                    Utc::now().to_rfc3339(),
                    update_id.to_string(),
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(changed > 0)
    }

    /// Replace the recorded file operations for a record.
    pub async fn set_file_operations(
        &self,
        update_id: &JobId,
        operations: &[FileOperation],
    ) -> Result<()> {
        self.check_writable()?;
        let ops = encode_json(operations)?;
        let _guard = self.write_lock.lock().await;
        self.conn
            .execute(
                "UPDATE rollback_records SET file_operations = ?1, updated_at = ?2
                 WHERE update_id = ?3",
                params![ops, Utc::now().to_rfc3339(), update_id.to_string()],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Delete a record and its snapshots. Returns false if no such record.
    pub async fn delete_rollback_record(&self, update_id: &JobId) -> Result<bool> {
        self.check_writable()?;
        let id = update_id.to_string();
        let _guard = self.write_lock.lock().await;
        let tx = self.conn.transaction().await.map_err(storage_err)?;
        tx.execute(
            "DELETE FROM snapshot_files WHERE snapshot_id IN
               (SELECT id FROM snapshots WHERE update_id = ?1)",
            params![id.as_str()],
        )
        .await
        .map_err(storage_err)?;
        tx.execute(
            "DELETE FROM snapshots WHERE update_id = ?1",
            params![id.as_str()],
        )
        .await
        .map_err(storage_err)?;
        let removed = tx
            .execute(
                "DELETE FROM rollback_records WHERE update_id = ?1",
                params![id.as_str()],
            )
            .await
            .map_err(storage_err)?;
        tx.commit().await.map_err(storage_err)?;
        Ok(removed > 0)
    }
}

fn decode_job(json: &str) -> Result<UpdateJob> {
    serde_json::from_str(json).map_err(|e| ContextSyncError::Storage(format!("corrupt job: {e}")))
}

fn encode_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| ContextSyncError::Storage(e.to_string()))
}

fn decode_json<T: serde::de::DeserializeOwned>(json: &str) -> Result<T> {
    serde_json::from_str(json).map_err(|e| ContextSyncError::Storage(format!("corrupt record: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use contextsync_shared::{FileOpKind, JobStatus, TriggerType};
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    /// Create a temp file storage for testing.
    async fn test_storage() -> (TempDir, Storage) {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = Storage::open(&dir.path().join("state.db"))
            .await
            .expect("open test db");
        (dir, storage)
    }

    fn domain(s: &str) -> DomainId {
        DomainId::new(s).expect("domain")
    }

    #[tokio::test]
    async fn open_and_migrate() {
        let (_dir, storage) = test_storage().await;
        assert_eq!(storage.get_schema_version().await, 1);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        let s1 = Storage::open(&path).await.expect("first open");
        drop(s1);
        let s2 = Storage::open(&path).await.expect("second open");
        assert_eq!(s2.get_schema_version().await, 1);
    }

    #[tokio::test]
    async fn job_upsert_and_list() {
        let (_dir, storage) = test_storage().await;
        let mut job = UpdateJob::new(
            TriggerType::Manual,
            vec!["Analysis/X.cs".into()],
            BTreeSet::from([domain("Analysis")]),
        );
        storage.upsert_job(&job).await.expect("insert");

        job.status = JobStatus::Snapshotting;
        job.errors.push("boom".into());
        storage.upsert_job(&job).await.expect("update");

        let loaded = storage.get_job(&job.id).await.unwrap().expect("present");
        assert_eq!(loaded.status, JobStatus::Snapshotting);
        assert_eq!(loaded.errors, vec!["boom".to_string()]);

        let other = UpdateJob::new(TriggerType::FullReindex, vec![], BTreeSet::new());
        storage.upsert_job(&other).await.unwrap();

        let all = storage.list_jobs(&JobFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);
        let reindex = storage
            .list_jobs(&JobFilter {
                trigger_type: Some(TriggerType::FullReindex),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(reindex.len(), 1);
        assert_eq!(reindex[0].id, other.id);

        assert_eq!(storage.delete_jobs(&[job.id.clone()]).await.unwrap(), 1);
        assert!(storage.get_job(&job.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rollback_record_with_snapshots() {
        let (_dir, storage) = test_storage().await;
        let id = JobId::new();
        let record = RollbackRecord::pending(id.clone(), vec![domain("Analysis"), domain("Data")]);
        storage.insert_rollback_record(&record).await.expect("insert");

        let mut snapshot = Snapshot::empty(domain("Analysis"));
        snapshot
            .files
            .insert("context.md".into(), SnapshotFile::new(b"# old\n".to_vec()));
        snapshot
            .files
            .insert("notes/extra.md".into(), SnapshotFile::new(vec![0, 159, 255]));
        storage.insert_snapshot(&id, &snapshot).await.expect("snapshot");
        storage
            .insert_snapshot(&id, &Snapshot::empty(domain("Data")))
            .await
            .expect("empty snapshot");

        let ops = vec![FileOperation {
            domain: domain("Data"),
            path: "context.md".into(),
            operation: FileOpKind::Create,
        }];
        storage.set_file_operations(&id, &ops).await.unwrap();

        let loaded = storage
            .get_rollback_record(&id)
            .await
            .unwrap()
            .expect("present");
        assert_eq!(loaded.status, RollbackStatus::Pending);
        assert_eq!(loaded.snapshots.len(), 2);
        assert_eq!(loaded.file_count(), 2);
        let analysis = loaded.snapshot_for(&domain("Analysis")).unwrap();
        assert_eq!(analysis.files["notes/extra.md"].content, vec![0, 159, 255]);
        assert!(analysis.files.values().all(SnapshotFile::is_intact));
        assert_eq!(loaded.file_operations, ops);
    }

    #[tokio::test]
    async fn rollback_status_and_delete() {
        let (_dir, storage) = test_storage().await;
        let id = JobId::new();
        storage
            .insert_rollback_record(&RollbackRecord::pending(id.clone(), vec![domain("A")]))
            .await
            .unwrap();
        let mut snapshot = Snapshot::empty(domain("A"));
        snapshot
            .files
            .insert("context.md".into(), SnapshotFile::new(b"a".to_vec()));
        storage.insert_snapshot(&id, &snapshot).await.unwrap();

        assert!(
            storage
                .set_rollback_status(&id, RollbackStatus::Failed, Some("disk full"))
                .await
                .unwrap()
        );
        let summaries = storage.list_rollback_summaries().await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].status, RollbackStatus::Failed);
        assert_eq!(summaries[0].failure_reason.as_deref(), Some("disk full"));

        assert!(storage.delete_rollback_record(&id).await.unwrap());
        assert!(!storage.delete_rollback_record(&id).await.unwrap());
        assert!(storage.get_rollback_record(&id).await.unwrap().is_none());
        assert!(
            !storage
                .set_rollback_status(&id, RollbackStatus::Committed, None)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn readonly_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        let rw = Storage::open(&path).await.unwrap();
        drop(rw);

        let ro = Storage::open_readonly(&path).await.unwrap();
        let job = UpdateJob::new(TriggerType::Manual, vec![], BTreeSet::new());
        let result = ro.upsert_job(&job).await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("read-only"));
    }

    #[tokio::test]
    async fn readonly_reads_existing_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        let rw = Storage::open(&path).await.unwrap();
        let job = UpdateJob::new(TriggerType::Manual, vec!["a.cs".into()], BTreeSet::new());
        rw.upsert_job(&job).await.unwrap();
        drop(rw);

        let ro = Storage::open_readonly(&path).await.unwrap();
        assert_eq!(ro.get_job(&job.id).await.unwrap().unwrap().id, job.id);
        assert_eq!(ro.list_jobs(&JobFilter::default()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn readonly_does_not_create_a_missing_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        let err = Storage::open_readonly(&path).await.err().unwrap();
        assert!(err.to_string().contains("does not exist"));
        assert!(!path.exists());
    }
}
