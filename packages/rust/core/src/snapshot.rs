//! Snapshot store: capture, restore, and retention of rollback records.
//!
//! A job snapshots every affected domain's artifact directory before any
//! write. The record stays `pending` while the job runs, becomes
//! `committed` on success, and `failed` when the job fails; failed records
//! stay restorable until cleanup reclaims them.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use contextsync_artifacts::ArtifactStore;
use contextsync_shared::{
    CleanupAction, CleanupPolicy, CleanupTrigger, ContextSyncError, DomainId, FileOperation, JobId,
    Result, RollbackRecord, RollbackStatus, RollbackSummary, Snapshot, SnapshotFile,
};
use contextsync_storage::Storage;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, instrument, warn};

use crate::retry::{RetryPolicy, retry_transient};

// ---------------------------------------------------------------------------
// Per-domain locks
// ---------------------------------------------------------------------------

/// One async lock per domain serializing snapshot reads, commit writes, and
/// restores of that domain's artifact directory across jobs.
#[derive(Default)]
pub struct DomainLocks {
    inner: Mutex<HashMap<DomainId, Arc<AsyncMutex<()>>>>,
}

impl DomainLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self, domain: &DomainId) -> Arc<AsyncMutex<()>> {
        Arc::clone(self.inner.lock().entry(domain.clone()).or_default())
    }

    pub async fn lock(&self, domain: &DomainId) -> OwnedMutexGuard<()> {
        self.handle(domain).lock_owned().await
    }

    /// Lock several domains, always in id order so two callers never deadlock.
    pub async fn lock_all<'a>(
        &self,
        domains: impl IntoIterator<Item = &'a DomainId>,
    ) -> Vec<OwnedMutexGuard<()>> {
        let ordered: BTreeSet<&DomainId> = domains.into_iter().collect();
        let mut guards = Vec::with_capacity(ordered.len());
        for domain in ordered {
            guards.push(self.lock(domain).await);
        }
        guards
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Result of [`SnapshotStore::snapshot`].
#[derive(Debug)]
pub struct SnapshotOutcome {
    /// The pending record with every snapshot that was captured.
    pub record: RollbackRecord,
    /// Domains whose capture failed, with the error.
    pub failed: Vec<(DomainId, String)>,
}

impl SnapshotOutcome {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Files touched by a restore.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    pub files_restored: usize,
    pub files_removed: usize,
}

/// Result of a cleanup or maintenance pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    /// Rollback records removed.
    pub removed_count: usize,
    /// Job records pruned from history.
    pub jobs_pruned: usize,
    pub errors: Vec<String>,
}

impl CleanupReport {
    pub fn merge(&mut self, other: CleanupReport) {
        self.removed_count += other.removed_count;
        self.jobs_pruned += other.jobs_pruned;
        self.errors.extend(other.errors);
    }
}

fn cutoff(hours: u64) -> Option<DateTime<Utc>> {
    let delta = chrono::Duration::try_hours(i64::try_from(hours).ok()?)?;
    Utc::now().checked_sub_signed(delta)
}

// ---------------------------------------------------------------------------
// SnapshotStore
// ---------------------------------------------------------------------------

/// Captures and restores domain artifact directories, backed by [`Storage`].
pub struct SnapshotStore {
    storage: Arc<Storage>,
    artifacts: Arc<dyn ArtifactStore>,
    policy: CleanupPolicy,
    retry: RetryPolicy,
    locks: Arc<DomainLocks>,
    /// Jobs whose records are in use; cleanup never touches these.
    leases: Mutex<HashSet<JobId>>,
}

impl SnapshotStore {
    pub fn new(
        storage: Arc<Storage>,
        artifacts: Arc<dyn ArtifactStore>,
        policy: CleanupPolicy,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            storage,
            artifacts,
            policy,
            retry,
            locks: Arc::new(DomainLocks::new()),
            leases: Mutex::new(HashSet::new()),
        }
    }

    pub fn locks(&self) -> &Arc<DomainLocks> {
        &self.locks
    }

    pub fn is_leased(&self, update_id: &JobId) -> bool {
        self.leases.lock().contains(update_id)
    }

    /// Drop the in-flight lease taken by [`SnapshotStore::snapshot`].
    pub fn release(&self, update_id: &JobId) {
        self.leases.lock().remove(update_id);
    }

    /// Capture every domain into a new pending record.
    ///
    /// A domain whose capture fails is reported in the outcome; snapshots of
    /// the other domains are kept. A domain without artifacts yet is
    /// captured as an empty file set.
    #[instrument(skip_all, fields(update_id = %update_id, domains = domains.len()))]
    pub async fn snapshot(&self, update_id: &JobId, domains: &[DomainId]) -> Result<SnapshotOutcome> {
        self.leases.lock().insert(update_id.clone());
        let mut record = RollbackRecord::pending(update_id.clone(), domains.to_vec());
        if let Err(e) = self.storage.insert_rollback_record(&record).await {
            self.release(update_id);
            return Err(e);
        }

        let mut failed = Vec::new();
        for domain in domains {
            let captured = retry_transient(&self.retry, "snapshot domain", || {
                self.capture(update_id, domain)
            })
            .await;
            match captured {
                Ok(snapshot) => {
                    debug!(domain = %domain, files = snapshot.files.len(), "captured snapshot");
                    record.snapshots.push(snapshot);
                }
                Err(e) => {
                    warn!(domain = %domain, error = %e, "snapshot failed");
                    failed.push((domain.clone(), e.to_string()));
                }
            }
        }

        info!(
            captured = record.snapshots.len(),
            files = record.file_count(),
            failed = failed.len(),
            "snapshot complete"
        );
        Ok(SnapshotOutcome { record, failed })
    }

    async fn capture(&self, update_id: &JobId, domain: &DomainId) -> Result<Snapshot> {
        let _guard = self.locks.lock(domain).await;
        let mut snapshot = Snapshot::empty(domain.clone());
        for path in self.artifacts.list(domain).await? {
            // A file deleted between list and read is simply not captured.
            if let Some(content) = self.artifacts.read(domain, &path).await? {
                snapshot.files.insert(path, SnapshotFile::new(content));
            }
        }
        self.storage.insert_snapshot(update_id, &snapshot).await?;
        Ok(snapshot)
    }

    /// Rewrite every captured file and delete files the snapshot did not
    /// contain. Restoring twice has the same effect as once.
    #[instrument(skip_all, fields(update_id = %update_id))]
    pub async fn restore(&self, update_id: &JobId) -> Result<RestoreReport> {
        let fail = |msg: String| ContextSyncError::rollback(update_id.to_string(), msg);
        let record = self
            .storage
            .get_rollback_record(update_id)
            .await
            .map_err(|e| fail(e.to_string()))?
            .ok_or_else(|| fail("no rollback record".to_string()))?;

        for snapshot in &record.snapshots {
            if let Some((path, _)) = snapshot.files.iter().find(|(_, f)| !f.is_intact()) {
                return Err(fail(format!(
                    "snapshot of {}/{path} failed its integrity check",
                    snapshot.domain
                )));
            }
        }

        let _guards = self
            .locks
            .lock_all(record.snapshots.iter().map(|s| &s.domain))
            .await;
        let mut report = RestoreReport::default();

        for snapshot in &record.snapshots {
            let domain = &snapshot.domain;
            let current = self
                .artifacts
                .list(domain)
                .await
                .map_err(|e| fail(e.to_string()))?;
            for path in current.iter().filter(|p| !snapshot.files.contains_key(*p)) {
                if self
                    .artifacts
                    .delete(domain, path)
                    .await
                    .map_err(|e| fail(e.to_string()))?
                {
                    report.files_removed += 1;
                }
            }

            for (path, file) in &snapshot.files {
                let existing = self
                    .artifacts
                    .read(domain, path)
                    .await
                    .map_err(|e| fail(e.to_string()))?;
                if existing.as_deref() == Some(file.content.as_slice()) {
                    continue;
                }
                retry_transient(&self.retry, "restore file", || {
                    self.artifacts.write(domain, path, &file.content)
                })
                .await
                .map_err(|e| fail(e.to_string()))?;
                report.files_restored += 1;
            }
        }

        info!(
            restored = report.files_restored,
            removed = report.files_removed,
            "restore complete"
        );
        Ok(report)
    }

    /// Whether the record exists and every captured file passes its digest check.
    pub async fn validate(&self, update_id: &JobId) -> bool {
        match self.storage.get_rollback_record(update_id).await {
            Ok(Some(record)) => record.snapshots.iter().all(|s| {
                record.affected_domains.contains(&s.domain) && s.files.values().all(|f| f.is_intact())
            }),
            Ok(None) => false,
            Err(e) => {
                warn!(update_id = %update_id, error = %e, "rollback record unreadable");
                false
            }
        }
    }

    pub async fn record(&self, update_id: &JobId) -> Result<Option<RollbackRecord>> {
        self.storage.get_rollback_record(update_id).await
    }

    /// Persist the operations a commit is about to perform.
    pub async fn record_operations(&self, update_id: &JobId, operations: &[FileOperation]) -> Result<()> {
        self.storage.set_file_operations(update_id, operations).await
    }

    pub async fn mark_committed(&self, update_id: &JobId) -> Result<()> {
        self.set_status(update_id, RollbackStatus::Committed, None).await
    }

    /// Mark the record failed with `context: error`. The snapshots are kept.
    pub async fn mark_failed(&self, update_id: &JobId, error: &str, context: &str) -> Result<()> {
        let reason = format!("{context}: {error}");
        self.set_status(update_id, RollbackStatus::Failed, Some(&reason))
            .await
    }

    async fn set_status(
        &self,
        update_id: &JobId,
        status: RollbackStatus,
        reason: Option<&str>,
    ) -> Result<()> {
        if self.storage.set_rollback_status(update_id, status, reason).await? {
            Ok(())
        } else {
            Err(ContextSyncError::NotFound(format!(
                "rollback record {update_id}"
            )))
        }
    }

    /// Drop a record that never protected a durable change (cancelled job).
    pub async fn discard(&self, update_id: &JobId) -> Result<bool> {
        self.release(update_id);
        self.storage.delete_rollback_record(update_id).await
    }

    // -----------------------------------------------------------------------
    // Cleanup
    // -----------------------------------------------------------------------

    /// Remove committed records created more than `max_age_hours` ago.
    pub async fn cleanup_by_age(&self, max_age_hours: u64) -> CleanupReport {
        let Some(cutoff) = cutoff(max_age_hours) else {
            return CleanupReport::default();
        };
        self.remove_matching(|summaries| {
            summaries
                .iter()
                .filter(|s| s.status == RollbackStatus::Committed && s.created_at < cutoff)
                .map(|s| s.update_id.clone())
                .collect()
        })
        .await
    }

    /// Keep at most `max_count` committed records, dropping the oldest
    /// (or the newest when `keep_newest` is false).
    pub async fn cleanup_by_count(&self, max_count: usize, keep_newest: bool) -> CleanupReport {
        self.remove_matching(|summaries| {
            let mut committed: Vec<&RollbackSummary> = summaries
                .iter()
                .filter(|s| s.status == RollbackStatus::Committed)
                .collect();
            let excess = committed.len().saturating_sub(max_count);
            if !keep_newest {
                committed.reverse();
            }
            committed
                .into_iter()
                .take(excess)
                .map(|s| s.update_id.clone())
                .collect()
        })
        .await
    }

    /// Remove failed records that failed more than `age_hours` ago.
    pub async fn cleanup_failed(&self, age_hours: u64) -> CleanupReport {
        let Some(cutoff) = cutoff(age_hours) else {
            return CleanupReport::default();
        };
        self.remove_matching(|summaries| {
            summaries
                .iter()
                .filter(|s| s.status == RollbackStatus::Failed && s.updated_at < cutoff)
                .map(|s| s.update_id.clone())
                .collect()
        })
        .await
    }

    /// Run the cleanup passes enabled for `trigger`.
    #[instrument(skip_all, fields(trigger = %trigger))]
    pub async fn perform_automatic_cleanup(&self, trigger: CleanupTrigger) -> CleanupReport {
        let mut report = CleanupReport::default();
        for action in self.policy.actions_for(trigger) {
            let pass = match action {
                CleanupAction::Age => self.cleanup_by_age(self.policy.max_age_hours).await,
                CleanupAction::Count => {
                    self.cleanup_by_count(self.policy.max_count, self.policy.keep_newest)
                        .await
                }
                CleanupAction::Failed => self.cleanup_failed(self.policy.failed_age_hours).await,
            };
            report.merge(pass);
        }
        if report.removed_count > 0 || !report.errors.is_empty() {
            info!(removed = report.removed_count, errors = report.errors.len(), "cleanup finished");
        }
        report
    }

    /// Select victims from the current summaries (oldest first) and delete
    /// them. Pending and leased records are never offered.
    async fn remove_matching<F>(&self, select: F) -> CleanupReport
    where
        F: FnOnce(&[RollbackSummary]) -> Vec<JobId>,
    {
        let mut report = CleanupReport::default();
        let summaries = match self.storage.list_rollback_summaries().await {
            Ok(s) => s,
            Err(e) => {
                report.errors.push(e.to_string());
                return report;
            }
        };
        let candidates: Vec<RollbackSummary> = {
            let leases = self.leases.lock();
            summaries
                .into_iter()
                .filter(|s| s.status != RollbackStatus::Pending && !leases.contains(&s.update_id))
                .collect()
        };

        for update_id in select(&candidates) {
            match self.storage.delete_rollback_record(&update_id).await {
                Ok(true) => {
                    debug!(update_id = %update_id, "removed rollback record");
                    report.removed_count += 1;
                }
                Ok(false) => {}
                Err(e) => report.errors.push(format!("{update_id}: {e}")),
            }
        }
        report
    }

    /// Mark pending records that no running job holds as failed, so they
    /// stay restorable and become visible to cleanup. Returns how many.
    pub async fn recover_interrupted(&self) -> Result<usize> {
        let summaries = self.storage.list_rollback_summaries().await?;
        let mut recovered = 0;
        for summary in summaries {
            if summary.status != RollbackStatus::Pending || self.is_leased(&summary.update_id) {
                continue;
            }
            self.mark_failed(&summary.update_id, "interrupted before completion", "recovery")
                .await?;
            warn!(update_id = %summary.update_id, "recovered interrupted rollback record");
            recovered += 1;
        }
        Ok(recovered)
    }
}
