//! Job registry: in-memory table of jobs, mirrored to durable storage.
//!
//! Every status change goes through [`JobRegistry::update_status`], which
//! enforces the job state machine. The map lock is never held across an
//! await; persistence re-reads the latest in-memory job so the stored copy
//! never goes backwards under concurrent updates.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use contextsync_shared::{
    ContextSyncError, JobFilter, JobId, JobMetrics, JobStatus, Result, UpdateJob,
};
use contextsync_storage::Storage;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Receives every job state change. Called synchronously; keep it cheap.
pub trait StatusListener: Send + Sync {
    fn on_status_change(&self, job: &UpdateJob);

    /// Called as files finish analysis.
    fn on_file_analyzed(&self, _job: &JobId, _path: &str, _done: usize, _total: usize) {}
}

/// No-op listener for headless/test usage.
pub struct SilentListener;

impl StatusListener for SilentListener {
    fn on_status_change(&self, _job: &UpdateJob) {}
}

/// Fields changed alongside a status update.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    /// Appended to the job's errors.
    pub errors: Vec<String>,
    /// Appended to the job's warnings.
    pub warnings: Vec<String>,
    /// Replaces the job's metrics.
    pub metrics: Option<JobMetrics>,
}

impl JobPatch {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            errors: vec![message.into()],
            ..Default::default()
        }
    }

    fn apply(self, job: &mut UpdateJob) {
        job.errors.extend(self.errors);
        job.warnings.extend(self.warnings);
        if let Some(metrics) = self.metrics {
            job.metrics = metrics;
        }
    }
}

struct Entry {
    job: UpdateJob,
    cancel: CancellationToken,
}

pub struct JobRegistry {
    jobs: RwLock<HashMap<JobId, Entry>>,
    storage: Option<Arc<Storage>>,
    listener: Arc<dyn StatusListener>,
    persist_lock: tokio::sync::Mutex<()>,
}

impl JobRegistry {
    pub fn new(storage: Option<Arc<Storage>>, listener: Arc<dyn StatusListener>) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            storage,
            listener,
            persist_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn listener(&self) -> &Arc<dyn StatusListener> {
        &self.listener
    }

    /// Register a new job and return its cancellation token.
    pub async fn create(&self, job: UpdateJob) -> Result<CancellationToken> {
        let id = job.id.clone();
        let cancel = CancellationToken::new();
        {
            let mut jobs = self.jobs.write();
            if jobs.contains_key(&id) {
                return Err(ContextSyncError::validation(format!("job {id} already exists")));
            }
            jobs.insert(
                id.clone(),
                Entry {
                    job: job.clone(),
                    cancel: cancel.clone(),
                },
            );
        }
        self.persist(&id).await?;
        info!(job_id = %id, trigger = %job.trigger_type, files = job.changed_files.len(), "job created");
        self.listener.on_status_change(&job);
        Ok(cancel)
    }

    /// Look a job up in memory, then in storage.
    pub async fn get(&self, id: &JobId) -> Result<Option<UpdateJob>> {
        if let Some(entry) = self.jobs.read().get(id) {
            return Ok(Some(entry.job.clone()));
        }
        match &self.storage {
            Some(storage) => storage.get_job(id).await,
            None => Ok(None),
        }
    }

    /// Like [`JobRegistry::get`], but a job found only in storage is adopted
    /// into memory so it can change status again (manual rollback).
    pub async fn load(&self, id: &JobId) -> Result<Option<UpdateJob>> {
        if let Some(entry) = self.jobs.read().get(id) {
            return Ok(Some(entry.job.clone()));
        }
        let Some(storage) = &self.storage else {
            return Ok(None);
        };
        let Some(job) = storage.get_job(id).await? else {
            return Ok(None);
        };
        let mut jobs = self.jobs.write();
        let entry = jobs.entry(id.clone()).or_insert_with(|| Entry {
            job,
            cancel: CancellationToken::new(),
        });
        Ok(Some(entry.job.clone()))
    }

    /// Move a job to `status`, applying `patch`. Rejects transitions the
    /// state machine does not allow.
    pub async fn update_status(
        &self,
        id: &JobId,
        status: JobStatus,
        patch: JobPatch,
    ) -> Result<UpdateJob> {
        let updated = self.modify(id, |job| {
            if !job.status.can_transition_to(status) {
                return Err(ContextSyncError::validation(format!(
                    "job {id}: illegal transition {} -> {status}",
                    job.status
                )));
            }
            job.status = status;
            patch.apply(job);
            if status.is_terminal() {
                job.completed_at = Some(Utc::now());
            }
            Ok(())
        })?;
        debug!(job_id = %id, status = %status, "job status changed");
        self.persist(id).await?;
        self.listener.on_status_change(&updated);
        Ok(updated)
    }

    /// Apply `patch` without a status change. Terminal jobs are immutable.
    pub async fn patch(&self, id: &JobId, patch: JobPatch) -> Result<UpdateJob> {
        let updated = self.modify(id, |job| {
            if job.status.is_terminal() {
                return Err(ContextSyncError::validation(format!(
                    "job {id} is {} and can no longer change",
                    job.status
                )));
            }
            patch.apply(job);
            Ok(())
        })?;
        self.persist(id).await?;
        Ok(updated)
    }

    fn modify(
        &self,
        id: &JobId,
        f: impl FnOnce(&mut UpdateJob) -> Result<()>,
    ) -> Result<UpdateJob> {
        let mut jobs = self.jobs.write();
        let entry = jobs
            .get_mut(id)
            .ok_or_else(|| ContextSyncError::NotFound(format!("job {id}")))?;
        let mut job = entry.job.clone();
        f(&mut job)?;
        job.updated_at = Utc::now();
        entry.job = job.clone();
        Ok(job)
    }

    async fn persist(&self, id: &JobId) -> Result<()> {
        let Some(storage) = &self.storage else {
            return Ok(());
        };
        let _guard = self.persist_lock.lock().await;
        let latest = self.jobs.read().get(id).map(|e| e.job.clone());
        if let Some(job) = latest {
            storage.upsert_job(&job).await?;
        }
        Ok(())
    }

    /// Jobs matching `filter`, newest first, from memory and storage.
    pub async fn list(&self, filter: &JobFilter) -> Result<Vec<UpdateJob>> {
        let mut jobs: HashMap<JobId, UpdateJob> = HashMap::new();
        if let Some(storage) = &self.storage {
            let unlimited = JobFilter {
                limit: None,
                ..filter.clone()
            };
            for job in storage.list_jobs(&unlimited).await? {
                jobs.insert(job.id.clone(), job);
            }
        }
        for entry in self.jobs.read().values() {
            if filter.matches(&entry.job) {
                jobs.insert(entry.job.id.clone(), entry.job.clone());
            } else {
                // The in-memory copy is newer than storage.
                jobs.remove(&entry.job.id);
            }
        }

        let mut jobs: Vec<UpdateJob> = jobs.into_values().collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        if let Some(limit) = filter.limit {
            jobs.truncate(limit);
        }
        Ok(jobs)
    }

    /// Request cancellation. Returns false when the job is unknown or no
    /// longer in a cancellable state. The running job observes the token
    /// between units of work.
    pub fn cancel(&self, id: &JobId) -> bool {
        let jobs = self.jobs.read();
        match jobs.get(id) {
            Some(entry) if entry.job.status.is_cancellable() => {
                entry.cancel.cancel();
                info!(job_id = %id, status = %entry.job.status, "cancellation requested");
                true
            }
            Some(entry) => {
                debug!(job_id = %id, status = %entry.job.status, "job not cancellable");
                false
            }
            None => false,
        }
    }

    /// Ids of jobs that have not reached a terminal state.
    pub fn in_flight(&self) -> Vec<JobId> {
        self.jobs
            .read()
            .values()
            .filter(|e| !e.job.status.is_terminal())
            .map(|e| e.job.id.clone())
            .collect()
    }

    /// Load stored jobs left non-terminal by a previous process and fail them.
    pub async fn recover_interrupted(&self) -> Result<usize> {
        let Some(storage) = &self.storage else {
            return Ok(0);
        };
        let stored = storage.list_jobs(&JobFilter::default()).await?;
        let mut recovered = 0;
        for job in stored {
            if job.status.is_terminal() || self.jobs.read().contains_key(&job.id) {
                continue;
            }
            let id = job.id.clone();
            let previous = job.status;
            self.jobs.write().insert(
                id.clone(),
                Entry {
                    job,
                    cancel: CancellationToken::new(),
                },
            );
            self.update_status(
                &id,
                JobStatus::Failed,
                JobPatch::error(format!("interrupted while {previous}; process exited before completion")),
            )
            .await?;
            warn!(job_id = %id, was = %previous, "recovered interrupted job");
            recovered += 1;
        }
        Ok(recovered)
    }

    /// Remove terminal jobs older than `max_age_hours`, then the oldest
    /// terminal jobs beyond `max_count`. Returns how many were removed.
    pub async fn prune(&self, max_age_hours: u64, max_count: usize) -> Result<usize> {
        let terminal: Vec<UpdateJob> = self
            .list(&JobFilter::default())
            .await?
            .into_iter()
            .filter(|j| j.status.is_terminal())
            .collect();

        let cutoff = chrono::Duration::try_hours(i64::try_from(max_age_hours).unwrap_or(i64::MAX))
            .and_then(|age| Utc::now().checked_sub_signed(age));
        let mut victims = Vec::new();
        let mut kept = 0usize;
        // Newest first.
        for job in terminal {
            let too_old = cutoff.is_some_and(|c| job.created_at < c);
            if too_old || kept >= max_count {
                victims.push(job.id);
            } else {
                kept += 1;
            }
        }
        if victims.is_empty() {
            return Ok(0);
        }

        {
            let mut jobs = self.jobs.write();
            for id in &victims {
                jobs.remove(id);
            }
        }
        let removed = match &self.storage {
            Some(storage) => storage.delete_jobs(&victims).await?,
            None => victims.len(),
        };
        info!(removed, "pruned job history");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contextsync_shared::{DomainId, TriggerType};
    use std::collections::BTreeSet;

    fn job() -> UpdateJob {
        UpdateJob::new(
            TriggerType::Manual,
            vec!["Billing/Invoice.cs".into()],
            BTreeSet::from([DomainId::new("Billing").unwrap()]),
        )
    }

    fn registry() -> JobRegistry {
        JobRegistry::new(None, Arc::new(SilentListener))
    }

    #[tokio::test]
    async fn enforces_state_machine() {
        let registry = registry();
        let job = job();
        let id = job.id.clone();
        registry.create(job).await.unwrap();

        let err = registry
            .update_status(&id, JobStatus::Generating, JobPatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ContextSyncError::Validation { .. }));

        for status in [
            JobStatus::Snapshotting,
            JobStatus::Analyzing,
            JobStatus::Generating,
            JobStatus::Committing,
            JobStatus::Completed,
        ] {
            registry
                .update_status(&id, status, JobPatch::default())
                .await
                .unwrap();
        }
        let done = registry.get(&id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert!(done.completed_at.is_some());

        assert!(registry.patch(&id, JobPatch::error("late")).await.is_err());
        assert!(
            registry
                .update_status(&id, JobStatus::Failed, JobPatch::default())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn concurrent_patches_are_all_applied() {
        let registry = Arc::new(registry());
        let job = job();
        let id = job.id.clone();
        registry.create(job).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..16 {
            let registry = Arc::clone(&registry);
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                registry
                    .patch(&id, JobPatch::error(format!("file {i}")))
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(registry.get(&id).await.unwrap().unwrap().errors.len(), 16);
    }

    #[tokio::test]
    async fn cancel_only_in_cancellable_states() {
        let registry = registry();
        let job = job();
        let id = job.id.clone();
        let token = registry.create(job).await.unwrap();

        assert!(registry.cancel(&id));
        assert!(token.is_cancelled());
        assert!(!registry.cancel(&JobId::new()));

        registry
            .update_status(&id, JobStatus::Cancelled, JobPatch::default())
            .await
            .unwrap();
        assert!(!registry.cancel(&id));
        assert!(registry.in_flight().is_empty());
    }

    #[tokio::test]
    async fn persists_and_recovers_through_storage() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(Storage::open(&dir.path().join("state.db")).await.unwrap());
        let registry = JobRegistry::new(Some(Arc::clone(&storage)), Arc::new(SilentListener));
        let job = job();
        let id = job.id.clone();
        registry.create(job).await.unwrap();
        registry
            .update_status(&id, JobStatus::Snapshotting, JobPatch::default())
            .await
            .unwrap();

        // A fresh registry over the same database sees the stranded job.
        let restarted = JobRegistry::new(Some(storage), Arc::new(SilentListener));
        assert_eq!(
            restarted.get(&id).await.unwrap().unwrap().status,
            JobStatus::Snapshotting
        );
        assert_eq!(restarted.recover_interrupted().await.unwrap(), 1);
        let job = restarted.get(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.errors.len(), 1);
    }

    #[tokio::test]
    async fn list_filters_and_prune_keeps_newest() {
        let registry = registry();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let job = job();
            ids.push(job.id.clone());
            registry.create(job).await.unwrap();
            registry
                .update_status(ids.last().unwrap(), JobStatus::Failed, JobPatch::error("x"))
                .await
                .unwrap();
        }
        let running = job();
        registry.create(running.clone()).await.unwrap();

        let failed = registry
            .list(&JobFilter {
                status: Some(JobStatus::Failed),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(failed.len(), 3);

        assert_eq!(registry.prune(720, 1).await.unwrap(), 2);
        let all = registry.list(&JobFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.iter().any(|j| j.id == running.id));
        assert!(all.iter().any(|j| j.id == ids[2]));
    }
}
