//! Update orchestrator: the job state machine.
//!
//! ```text
//! submit → resolve domains → queued → snapshotting → analyzing → generating → committing → completed
//!                                         any failure → failed → rolling-back → rolled-back
//! ```
//!
//! Each accepted job runs on its own task. Stages report progress through
//! the [`JobRegistry`]; a failure after snapshotting marks the rollback
//! record failed and, when automatic rollback is on, restores every
//! captured domain.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use contextsync_artifacts::{ArtifactStore, FsArtifactStore};
use contextsync_discovery::{
    DependencyGraph, DomainMap, DomainResolver, ResolvedDomains, WalkOptions, walk_source_tree,
};
use contextsync_shared::{
    AnalysisResult, BoundaryPolicy, CleanupTrigger, ConfigValidation, ContextArtifact,
    ContextSyncError, DomainId, FileOpKind, FileOperation, JobFilter, JobId, JobMetrics,
    JobStatus, OrchestratorConfig, ReindexOptions, Result, RollbackRecord, TemplateThresholds,
    TriggerType, UpdateJob, UpdateOptions,
};
use contextsync_storage::Storage;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::analysis::{AnalysisStage, HeuristicAnalyzer, SemanticAnalyzer};
use crate::generation::{
    ContextGenerator, GenerationOutcome, TemplateGenerator, assign_results, generate_all,
};
use crate::registry::{JobPatch, JobRegistry, SilentListener, StatusListener};
use crate::retry::{RetryPolicy, retry_transient};
use crate::snapshot::{CleanupReport, RestoreReport, SnapshotStore};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// External collaborators the orchestrator drives.
pub struct Collaborators {
    pub analyzer: Arc<dyn SemanticAnalyzer>,
    pub generator: Arc<dyn ContextGenerator>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub domain_map: Arc<dyn DomainMap>,
    pub listener: Arc<dyn StatusListener>,
}

impl Collaborators {
    /// Heuristic analyzer, markdown templates, and a filesystem artifact store.
    pub fn defaults(
        artifact_root: impl Into<std::path::PathBuf>,
        domain_map: Arc<dyn DomainMap>,
        thresholds: TemplateThresholds,
    ) -> Self {
        Self {
            analyzer: Arc::new(HeuristicAnalyzer),
            generator: Arc::new(TemplateGenerator::new(thresholds)),
            artifacts: Arc::new(FsArtifactStore::new(artifact_root)),
            domain_map,
            listener: Arc::new(SilentListener),
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn StatusListener>) -> Self {
        self.listener = listener;
        self
    }
}

/// Result of [`Orchestrator::rollback_job`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum RollbackOutcome {
    RolledBack {
        files_restored: usize,
        files_removed: usize,
    },
    /// The job is not in a state that allows rollback.
    NotRollbackable { status: JobStatus, reason: String },
    /// The restore failed; the job stays failed.
    Failed { error: String },
}

impl From<RestoreReport> for RollbackOutcome {
    fn from(report: RestoreReport) -> Self {
        Self::RolledBack {
            files_restored: report.files_restored,
            files_removed: report.files_removed,
        }
    }
}

/// Result of [`Orchestrator::recover`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub jobs_failed: usize,
    pub rollback_records_failed: usize,
    pub cleanup: CleanupReport,
}

// ---------------------------------------------------------------------------
// Internal job plumbing
// ---------------------------------------------------------------------------

/// Everything a job needs, fixed at submission.
struct JobPlan {
    /// Analysis input: (source path, resolved domain).
    files: Vec<(String, DomainId)>,
    /// Domains to regenerate.
    domains: BTreeSet<DomainId>,
    /// Domains whose artifacts are removed outright.
    orphans: Vec<DomainId>,
    graph: DependencyGraph,
    cleanup_first: bool,
    concurrency: usize,
    timeout: Duration,
}

impl JobPlan {
    fn affected(&self) -> BTreeSet<DomainId> {
        self.domains.iter().chain(&self.orphans).cloned().collect()
    }
}

/// How far a job got, for the failure path.
#[derive(Default)]
struct RunState {
    record_created: bool,
    domains_captured: usize,
}

enum Finish {
    Completed(JobMetrics),
    Cancelled(JobPatch),
}

/// A stage failure escalated to the orchestrator.
struct StageFailure {
    stage: &'static str,
    messages: Vec<String>,
}

impl StageFailure {
    fn at(stage: &'static str) -> impl Fn(ContextSyncError) -> Self {
        move |e| Self {
            stage,
            messages: vec![format!("{stage}: {e}")],
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Cheap to clone; clones share the same jobs.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    config: OrchestratorConfig,
    resolver: Arc<DomainResolver>,
    analysis: AnalysisStage,
    generator: Arc<dyn ContextGenerator>,
    artifacts: Arc<dyn ArtifactStore>,
    snapshots: SnapshotStore,
    registry: JobRegistry,
    retry: RetryPolicy,
    tasks: Mutex<HashMap<JobId, JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        boundary: BoundaryPolicy,
        storage: Arc<Storage>,
        collaborators: Collaborators,
    ) -> Result<Self> {
        let retry = RetryPolicy::from(&config);
        let walk = WalkOptions {
            extensions: config.file_extensions.clone(),
            exclude_patterns: config.exclude_patterns.clone(),
        };
        let resolver = DomainResolver::new(
            config.source_root.clone(),
            collaborators.domain_map,
            boundary,
            &walk,
        )?;
        let analysis = AnalysisStage::new(
            collaborators.analyzer,
            config.source_root.clone(),
            config.file_timeout,
            retry,
        );
        let snapshots = SnapshotStore::new(
            Arc::clone(&storage),
            Arc::clone(&collaborators.artifacts),
            config.cleanup.clone(),
            retry,
        );
        let registry = JobRegistry::new(Some(storage), collaborators.listener);

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                resolver: Arc::new(resolver),
                analysis,
                generator: collaborators.generator,
                artifacts: collaborators.artifacts,
                snapshots,
                registry,
                retry,
                tasks: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    /// Resolve `changed_files` and start an update job.
    ///
    /// Fails fast, without creating a job, on invalid options or when no
    /// file maps to a domain.
    #[instrument(skip_all, fields(files = changed_files.len(), trigger = %trigger))]
    pub async fn submit_update(
        &self,
        changed_files: Vec<String>,
        trigger: TriggerType,
        options: UpdateOptions,
    ) -> Result<JobId> {
        let config = &self.inner.config;
        config.check(&options).into_result()?;
        let resolved = self.resolve(changed_files.clone()).await?;

        let plan = self.plan(
            &resolved,
            Vec::new(),
            options.cleanup_first.unwrap_or(config.cleanup_first),
            options.max_concurrency.unwrap_or(config.max_concurrency),
            options
                .performance_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(config.performance_timeout),
        );
        let mut job = UpdateJob::new(trigger, changed_files, plan.affected());
        job.revision = options.revision;
        job.warnings = resolved.warnings;
        self.launch(job, plan).await
    }

    /// Walk the whole source tree and start a full reindex job. With
    /// `cleanup_first`, artifact directories of domains that no longer
    /// resolve are removed as part of the job.
    #[instrument(skip_all)]
    pub async fn submit_full_reindex(&self, options: ReindexOptions) -> Result<JobId> {
        let config = &self.inner.config;
        let update_options = UpdateOptions {
            cleanup_first: options.cleanup_first,
            max_concurrency: options.max_concurrency,
            ..Default::default()
        };
        config.check(&update_options).into_result()?;

        let walk = WalkOptions {
            extensions: options
                .file_extensions
                .unwrap_or_else(|| config.file_extensions.clone()),
            exclude_patterns: options
                .exclude_patterns
                .unwrap_or_else(|| config.exclude_patterns.clone()),
        };
        let root = config.source_root.clone();
        let files = tokio::task::spawn_blocking(move || walk_source_tree(&root, &walk))
            .await
            .map_err(|e| ContextSyncError::validation(format!("source walk aborted: {e}")))??;
        if files.is_empty() {
            return Err(ContextSyncError::validation(format!(
                "no source files found under {}",
                config.source_root.display()
            )));
        }

        let resolved = self.resolve(files.clone()).await?;
        let cleanup_first = options.cleanup_first.unwrap_or(config.cleanup_first);
        let orphans = if cleanup_first {
            self.inner
                .artifacts
                .list_domains()
                .await?
                .into_iter()
                .filter(|d| !resolved.domains.contains(d))
                .collect()
        } else {
            Vec::new()
        };
        if !orphans.is_empty() {
            info!(orphans = orphans.len(), "removing artifacts of domains that no longer resolve");
        }

        let plan = self.plan(
            &resolved,
            orphans,
            cleanup_first,
            options.max_concurrency.unwrap_or(config.max_concurrency),
            config.performance_timeout,
        );
        let mut job = UpdateJob::new(TriggerType::FullReindex, files, plan.affected());
        job.warnings = resolved.warnings;
        self.launch(job, plan).await
    }

    pub async fn get_job_status(&self, id: &JobId) -> Result<UpdateJob> {
        self.inner
            .registry
            .get(id)
            .await?
            .ok_or_else(|| ContextSyncError::NotFound(format!("job {id}")))
    }

    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<UpdateJob>> {
        self.inner.registry.list(filter).await
    }

    /// Request cancellation of one job. Other jobs are unaffected.
    pub fn cancel_job(&self, id: &JobId) -> bool {
        self.inner.registry.cancel(id)
    }

    /// Restore the snapshot of a failed job.
    #[instrument(skip_all, fields(job_id = %id))]
    pub async fn rollback_job(&self, id: &JobId) -> Result<RollbackOutcome> {
        let job = self
            .inner
            .registry
            .load(id)
            .await?
            .ok_or_else(|| ContextSyncError::NotFound(format!("job {id}")))?;

        let refusal = match job.status {
            JobStatus::Failed => None,
            JobStatus::RolledBack => Some("job is already rolled back"),
            JobStatus::Completed => Some("completed jobs are not rolled back"),
            JobStatus::Cancelled => Some("cancelled jobs made no durable changes"),
            _ => Some("job is still running"),
        };
        if let Some(reason) = refusal {
            return Ok(RollbackOutcome::NotRollbackable {
                status: job.status,
                reason: reason.to_string(),
            });
        }
        if !self.inner.snapshots.validate(id).await {
            return Ok(RollbackOutcome::NotRollbackable {
                status: job.status,
                reason: "rollback record is missing or corrupt".to_string(),
            });
        }
        self.inner.roll_back(id).await
    }

    /// Check the configuration merged with `options`.
    pub fn validate_config(&self, options: &UpdateOptions) -> ConfigValidation {
        self.inner.config.check(options)
    }

    /// Run the cleanup passes for `trigger`; manual and startup runs also
    /// prune job history.
    pub async fn perform_maintenance(&self, trigger: CleanupTrigger) -> CleanupReport {
        let inner = &self.inner;
        let mut report = inner.snapshots.perform_automatic_cleanup(trigger).await;
        if matches!(trigger, CleanupTrigger::Manual | CleanupTrigger::Startup) {
            let policy = &inner.config.cleanup;
            match inner
                .registry
                .prune(policy.job_max_age_hours, policy.job_max_count)
                .await
            {
                Ok(pruned) => report.jobs_pruned += pruned,
                Err(e) => report.errors.push(format!("job history: {e}")),
            }
        }
        report
    }

    /// Fail jobs and rollback records left in flight by a previous process,
    /// then run startup cleanup.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let jobs_failed = self.inner.registry.recover_interrupted().await?;
        let rollback_records_failed = self.inner.snapshots.recover_interrupted().await?;
        let cleanup = self.perform_maintenance(CleanupTrigger::Startup).await;
        if jobs_failed + rollback_records_failed > 0 {
            warn!(jobs_failed, rollback_records_failed, "recovered interrupted work");
        }
        Ok(RecoveryReport {
            jobs_failed,
            rollback_records_failed,
            cleanup,
        })
    }

    /// Wait for a job's task to finish and return the final job.
    pub async fn wait(&self, id: &JobId) -> Result<UpdateJob> {
        let handle = self.inner.tasks.lock().remove(id);
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(job_id = %id, error = %e, "job task panicked");
            }
        }
        self.get_job_status(id).await
    }

    async fn resolve(&self, files: Vec<String>) -> Result<ResolvedDomains> {
        let resolver = Arc::clone(&self.inner.resolver);
        tokio::task::spawn_blocking(move || resolver.resolve(&files))
            .await
            .map_err(|e| ContextSyncError::validation(format!("domain resolution aborted: {e}")))?
    }

    fn plan(
        &self,
        resolved: &ResolvedDomains,
        orphans: Vec<DomainId>,
        cleanup_first: bool,
        concurrency: usize,
        timeout: Duration,
    ) -> JobPlan {
        JobPlan {
            files: resolved
                .file_domains
                .iter()
                .map(|(path, domain)| (path.clone(), domain.clone()))
                .collect(),
            domains: resolved.domains.clone(),
            orphans,
            graph: resolved.graph.clone(),
            cleanup_first,
            concurrency,
            timeout,
        }
    }

    async fn launch(&self, job: UpdateJob, plan: JobPlan) -> Result<JobId> {
        let id = job.id.clone();
        let cancel = self.inner.registry.create(job).await?;
        let inner = Arc::clone(&self.inner);
        let task_id = id.clone();
        let handle = tokio::spawn(async move { inner.run_job(task_id, plan, cancel).await });
        self.inner.tasks.lock().insert(id.clone(), handle);
        Ok(id)
    }
}

// ---------------------------------------------------------------------------
// Job execution
// ---------------------------------------------------------------------------

impl Inner {
    #[instrument(skip_all, fields(job_id = %id))]
    async fn run_job(self: Arc<Self>, id: JobId, plan: JobPlan, cancel: CancellationToken) {
        let started = std::time::Instant::now();
        let mut state = RunState::default();

        match self.execute(&id, &plan, &cancel, &mut state).await {
            Ok(Finish::Completed(metrics)) => self.complete(&id, metrics, started).await,
            Ok(Finish::Cancelled(patch)) => self.finish_cancelled(&id, patch, &state).await,
            Err(failure) => self.fail(&id, failure, &state, started).await,
        }
        self.tasks.lock().remove(&id);
    }

    async fn execute(
        &self,
        id: &JobId,
        plan: &JobPlan,
        cancel: &CancellationToken,
        state: &mut RunState,
    ) -> std::result::Result<Finish, StageFailure> {
        if cancel.is_cancelled() {
            return Ok(Finish::Cancelled(JobPatch::default()));
        }

        // --- Snapshot ---
        self.transition(id, JobStatus::Snapshotting, JobPatch::default())
            .await
            .map_err(StageFailure::at("snapshot"))?;
        let snapshot_domains: Vec<DomainId> = plan.affected().into_iter().collect();
        let outcome = self
            .snapshots
            .snapshot(id, &snapshot_domains)
            .await
            .map_err(StageFailure::at("snapshot"))?;
        state.record_created = true;
        state.domains_captured = outcome.record.snapshots.len();
        if !outcome.is_complete() {
            return Err(StageFailure {
                stage: "snapshot",
                messages: outcome
                    .failed
                    .iter()
                    .map(|(domain, e)| format!("snapshot of {domain}: {e}"))
                    .collect(),
            });
        }
        let record = outcome.record;

        // --- Analyze ---
        self.transition(id, JobStatus::Analyzing, JobPatch::default())
            .await
            .map_err(StageFailure::at("analysis"))?;
        if cancel.is_cancelled() {
            return Ok(Finish::Cancelled(JobPatch::default()));
        }
        let deadline = tokio::time::Instant::now() + plan.timeout;
        let listener = Arc::clone(self.registry.listener());
        let batch = self
            .analysis
            .analyze_files(
                &plan.files,
                deadline,
                plan.concurrency,
                cancel,
                &|path, done, total| listener.on_file_analyzed(id, path, done, total),
            )
            .await;

        let mut metrics = JobMetrics {
            files_discovered: batch.discovered,
            files_analyzed: batch.results.len(),
            files_failed: batch.failures.len(),
            files_skipped: batch.skipped.len(),
            ..Default::default()
        };
        let mut patch = JobPatch {
            errors: batch.failures.iter().map(|f| f.to_string()).collect(),
            warnings: Vec::new(),
            metrics: Some(metrics.clone()),
        };
        if batch.deadline_exceeded {
            patch.warnings.push(format!(
                "analysis deadline of {}s exceeded; {} files skipped",
                plan.timeout.as_secs(),
                batch.skipped.len()
            ));
        }
        if batch.cancelled {
            return Ok(Finish::Cancelled(patch));
        }
        let (graph, cycle_warnings) = self.graph_with_reported(plan, &batch.results);
        patch.warnings.extend(cycle_warnings);

        // --- Generate ---
        self.transition(id, JobStatus::Generating, patch)
            .await
            .map_err(StageFailure::at("generation"))?;
        let inputs = assign_results(&plan.domains, batch.results);
        let generation = generate_all(
            Arc::clone(&self.generator),
            &graph,
            inputs,
            plan.concurrency,
            self.retry,
            cancel,
        )
        .await;
        if generation.cancelled {
            return Ok(Finish::Cancelled(JobPatch::default()));
        }
        if let Some(reason) = generation.aborted {
            return Err(StageFailure {
                stage: "generation",
                messages: vec![reason],
            });
        }
        let generation_errors: Vec<String> = generation
            .failures
            .iter()
            .map(|(domain, e)| format!("generation of {domain}: {e}"))
            .collect();
        if generation.generated.is_empty() {
            return Err(StageFailure {
                stage: "generation",
                messages: generation_errors,
            });
        }

        // --- Commit ---
        if cancel.is_cancelled() {
            return Ok(Finish::Cancelled(JobPatch {
                errors: generation_errors,
                ..Default::default()
            }));
        }
        self.transition(id, JobStatus::Committing, JobPatch {
            errors: generation_errors,
            ..Default::default()
        })
        .await
        .map_err(StageFailure::at("commit"))?;
        let (generated, removed) = self.commit(id, plan, &graph, &record, &generation).await?;
        metrics.context_files_generated = generated;
        metrics.context_files_removed = removed;
        Ok(Finish::Completed(metrics))
    }

    /// The planned graph plus edges for dependencies the analyzer reported,
    /// with any cycle they close broken again.
    fn graph_with_reported(
        &self,
        plan: &JobPlan,
        results: &[AnalysisResult],
    ) -> (DependencyGraph, Vec<String>) {
        let mut graph = plan.graph.clone();
        let mut added = 0usize;
        for result in results {
            let Some(from) = plan
                .domains
                .iter()
                .filter(|d| d.is_ancestor_or_self(&result.domain_context))
                .max_by_key(|d| d.depth())
            else {
                continue;
            };
            for reference in &result.dependencies {
                let target = self
                    .resolver
                    .reference_domain(&result.file_path, reference, &plan.domains);
                if let Some(to) = target.filter(|to| to != from) {
                    if graph.add_edge(from.clone(), to.clone()) {
                        debug!(%from, %to, reference = %reference, "reported dependency edge");
                        added += 1;
                    }
                }
            }
        }
        if added == 0 {
            return (graph, Vec::new());
        }
        let warnings = graph.break_cycles();
        (graph, warnings)
    }

    /// Persist the write-ahead operation list, then write generated artifacts
    /// in dependency order and remove stale files, holding every involved
    /// domain's lock.
    async fn commit(
        &self,
        id: &JobId,
        plan: &JobPlan,
        graph: &DependencyGraph,
        record: &RollbackRecord,
        generation: &GenerationOutcome,
    ) -> std::result::Result<(usize, usize), StageFailure> {
        let mut writes: Vec<(&DomainId, &ContextArtifact)> = Vec::new();
        for domain in graph.topological_order() {
            if let Some((key, generated)) = generation.generated.get_key_value(&domain) {
                writes.push((key, &generated.artifact));
            }
        }

        let mut deletes: Vec<(&DomainId, &String)> = Vec::new();
        if plan.cleanup_first {
            for (domain, artifact) in &writes {
                if let Some(snapshot) = record.snapshot_for(domain) {
                    deletes.extend(
                        snapshot
                            .files
                            .keys()
                            .filter(|path| **path != artifact.relative_path)
                            .map(|path| (*domain, path)),
                    );
                }
            }
        }
        for orphan in &plan.orphans {
            if let Some(snapshot) = record.snapshot_for(orphan) {
                deletes.extend(snapshot.files.keys().map(|path| (orphan, path)));
            }
        }

        let mut operations = Vec::with_capacity(writes.len() + deletes.len());
        for (domain, artifact) in &writes {
            let existed = record
                .snapshot_for(domain)
                .is_some_and(|s| s.files.contains_key(&artifact.relative_path));
            operations.push(FileOperation {
                domain: (*domain).clone(),
                path: artifact.relative_path.clone(),
                operation: if existed { FileOpKind::Modify } else { FileOpKind::Create },
            });
        }
        for (domain, path) in &deletes {
            operations.push(FileOperation {
                domain: (*domain).clone(),
                path: (*path).clone(),
                operation: FileOpKind::Delete,
            });
        }
        self.snapshots
            .record_operations(id, &operations)
            .await
            .map_err(StageFailure::at("commit"))?;

        let _guards = self
            .snapshots
            .locks()
            .lock_all(operations.iter().map(|op| &op.domain))
            .await;

        let commit_failure = |domain: &DomainId, e: ContextSyncError| StageFailure {
            stage: "commit",
            messages: vec![ContextSyncError::commit(domain.as_str(), e.to_string()).to_string()],
        };

        for &(domain, artifact) in &writes {
            let path = artifact.relative_path.as_str();
            let bytes = artifact.content.as_bytes();
            let current = self
                .artifacts
                .read(domain, path)
                .await
                .map_err(|e| commit_failure(domain, e))?;
            if current.as_deref() == Some(bytes) {
                continue;
            }
            retry_transient(&self.retry, "write artifact", || {
                self.artifacts.write(domain, path, bytes)
            })
            .await
            .map_err(|e| commit_failure(domain, e))?;
        }

        let mut removed = 0;
        for &(domain, path) in &deletes {
            let deleted = retry_transient(&self.retry, "remove stale artifact", || {
                self.artifacts.delete(domain, path)
            })
            .await
            .map_err(|e| commit_failure(domain, e))?;
            if deleted {
                removed += 1;
            }
        }

        info!(written = writes.len(), removed, "commit complete");
        Ok((writes.len(), removed))
    }

    async fn transition(&self, id: &JobId, status: JobStatus, patch: JobPatch) -> Result<UpdateJob> {
        self.registry.update_status(id, status, patch).await
    }

    async fn complete(&self, id: &JobId, mut metrics: JobMetrics, started: std::time::Instant) {
        metrics.execution_time_ms = started.elapsed().as_millis() as u64;
        if let Err(e) = self.snapshots.mark_committed(id).await {
            warn!(job_id = %id, error = %e, "could not mark rollback record committed");
        }
        self.snapshots.release(id);

        let patch = JobPatch {
            metrics: Some(metrics.clone()),
            ..Default::default()
        };
        match self.transition(id, JobStatus::Completed, patch).await {
            Ok(_) => info!(
                job_id = %id,
                analyzed = metrics.files_analyzed,
                generated = metrics.context_files_generated,
                removed = metrics.context_files_removed,
                elapsed_ms = metrics.execution_time_ms,
                "job completed"
            ),
            Err(e) => error!(job_id = %id, error = %e, "could not record job completion"),
        }

        let report = self
            .snapshots
            .perform_automatic_cleanup(CleanupTrigger::AfterSuccess)
            .await;
        for e in &report.errors {
            warn!(error = %e, "cleanup after success");
        }
    }

    async fn finish_cancelled(&self, id: &JobId, mut patch: JobPatch, state: &RunState) {
        patch.warnings.push("cancelled by request".to_string());
        if let Err(e) = self.transition(id, JobStatus::Cancelled, patch).await {
            error!(job_id = %id, error = %e, "could not record cancellation");
        }
        if state.record_created {
            // Nothing was written, so the snapshot protects nothing.
            if let Err(e) = self.snapshots.discard(id).await {
                warn!(job_id = %id, error = %e, "could not discard rollback record");
            }
        }
        self.snapshots.release(id);
        info!(job_id = %id, "job cancelled");
    }

    async fn fail(
        &self,
        id: &JobId,
        failure: StageFailure,
        state: &RunState,
        started: std::time::Instant,
    ) {
        error!(job_id = %id, stage = failure.stage, errors = ?failure.messages, "job failed");
        let mut metrics = match self.registry.get(id).await {
            Ok(Some(job)) => job.metrics,
            _ => JobMetrics::default(),
        };
        metrics.execution_time_ms = started.elapsed().as_millis() as u64;
        let summary = failure.messages.join("; ");
        let patch = JobPatch {
            errors: failure.messages,
            warnings: Vec::new(),
            metrics: Some(metrics),
        };
        if let Err(e) = self.transition(id, JobStatus::Failed, patch).await {
            error!(job_id = %id, error = %e, "could not record job failure");
        }

        if state.record_created {
            if let Err(e) = self.snapshots.mark_failed(id, &summary, failure.stage).await {
                warn!(job_id = %id, error = %e, "could not mark rollback record failed");
            }
            if self.config.auto_rollback && state.domains_captured > 0 {
                if let Err(e) = self.roll_back(id).await {
                    error!(job_id = %id, error = %e, "automatic rollback could not run");
                }
            }
        }
        self.snapshots.release(id);

        let report = self
            .snapshots
            .perform_automatic_cleanup(CleanupTrigger::AfterFailure)
            .await;
        for e in &report.errors {
            warn!(error = %e, "cleanup after failure");
        }
    }

    /// `failed → rolling-back → rolled-back`, or back to `failed` with the
    /// restore error appended.
    async fn roll_back(&self, id: &JobId) -> Result<RollbackOutcome> {
        self.transition(id, JobStatus::RollingBack, JobPatch::default())
            .await?;
        match self.snapshots.restore(id).await {
            Ok(report) => {
                self.transition(id, JobStatus::RolledBack, JobPatch::default())
                    .await?;
                info!(
                    job_id = %id,
                    restored = report.files_restored,
                    removed = report.files_removed,
                    "job rolled back"
                );
                Ok(report.into())
            }
            Err(e) => {
                let message = e.to_string();
                error!(job_id = %id, error = %message, "rollback failed; manual intervention required");
                if let Err(mark) = self.snapshots.mark_failed(id, &message, "restore").await {
                    warn!(job_id = %id, error = %mark, "could not mark rollback record failed");
                }
                self.transition(id, JobStatus::Failed, JobPatch::error(message.clone()))
                    .await?;
                Ok(RollbackOutcome::Failed { error: message })
            }
        }
    }
}
