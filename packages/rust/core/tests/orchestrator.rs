//! End-to-end update jobs against a temporary source tree, a filesystem
//! artifact store, and a libSQL state database.

use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use contextsync_artifacts::{ArtifactStore, FsArtifactStore};
use contextsync_core::{
    Collaborators, ContextGenerator, FileAnalysis, HeuristicAnalyzer, Orchestrator,
    RollbackOutcome, SemanticAnalyzer, StatusListener, TemplateGenerator,
};
use contextsync_discovery::PrefixDomainMap;
use contextsync_shared::{
    AnalysisResult, BoundaryPolicy, CleanupTrigger, ContextArtifact, ContextSyncError, DomainId,
    JobFilter, JobId, JobStatus, OrchestratorConfig, ReindexOptions, Result, RollbackRecord,
    RollbackStatus, TemplateThresholds, TriggerType, UpdateJob, UpdateOptions,
};
use contextsync_storage::Storage;
use parking_lot::Mutex;

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

const RICH: &str = r#"
namespace App.Analysis.Fractal;

public class FractalDimension { }
public class FractalSeries { }
public record FractalResult(double Value);
public interface IFractalEstimator { }

public static class BoxCounting
{
    public static double Estimate(double[] s)
    {
        if (s == null) throw new ArgumentNullException(nameof(s));
        if (s.Length < 2) throw new ArgumentException("too short");
        for (var i = 0; i < s.Length; i++)
        {
            if (s[i] < 0 && i > 0) { continue; }
            while (s[i] > 1 || s[i] < -1) { s[i] /= 2; }
        }
        return 0;
    }
}
"#;

const SPARSE: &str = "// helper\nnamespace App.Analysis.Fractal;\n";

struct Harness {
    dir: tempfile::TempDir,
    storage: Arc<Storage>,
    artifacts: Arc<FsArtifactStore>,
}

impl Harness {
    async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        let storage = Arc::new(Storage::open(&dir.path().join("state.db")).await.unwrap());
        let artifacts = Arc::new(FsArtifactStore::new(dir.path().join("context")));
        Self {
            dir,
            storage,
            artifacts,
        }
    }

    fn src(&self) -> PathBuf {
        self.dir.path().join("src")
    }

    fn write_source(&self, rel: &str, content: &str) {
        let path = self.src().join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            source_root: self.src(),
            retry_backoff: Duration::from_millis(1),
            ..Default::default()
        }
    }

    fn collaborators(&self) -> Collaborators {
        Collaborators {
            analyzer: Arc::new(HeuristicAnalyzer),
            generator: Arc::new(TemplateGenerator::new(TemplateThresholds::default())),
            artifacts: self.artifacts.clone(),
            domain_map: Arc::new(PrefixDomainMap::default()),
            listener: Arc::new(contextsync_core::SilentListener),
        }
    }

    fn orchestrator(&self, config: OrchestratorConfig, collaborators: Collaborators) -> Orchestrator {
        Orchestrator::new(config, BoundaryPolicy::default(), self.storage.clone(), collaborators)
            .unwrap()
    }

    fn default_orchestrator(&self) -> Orchestrator {
        self.orchestrator(self.config(), self.collaborators())
    }

    async fn artifact(&self, domain: &str, path: &str) -> Option<String> {
        self.artifacts
            .read(&d(domain), path)
            .await
            .unwrap()
            .map(|b| String::from_utf8(b).unwrap())
    }

    async fn seed_artifact(&self, domain: &str, path: &str, content: &str) {
        self.artifacts
            .write(&d(domain), path, content.as_bytes())
            .await
            .unwrap();
    }
}

fn d(s: &str) -> DomainId {
    DomainId::new(s).unwrap()
}

fn files(paths: &[&str]) -> Vec<String> {
    paths.iter().map(|p| p.to_string()).collect()
}

async fn run(orchestrator: &Orchestrator, paths: &[&str]) -> UpdateJob {
    let id = orchestrator
        .submit_update(files(paths), TriggerType::Manual, UpdateOptions::default())
        .await
        .unwrap();
    orchestrator.wait(&id).await.unwrap()
}

// ---------------------------------------------------------------------------
// Doubles
// ---------------------------------------------------------------------------

/// Throws for files whose path ends with `suffix`.
struct ThrowingAnalyzer {
    suffix: &'static str,
}

#[async_trait]
impl SemanticAnalyzer for ThrowingAnalyzer {
    async fn analyze(&self, path: &str, content: &str) -> Result<FileAnalysis> {
        if path.ends_with(self.suffix) {
            return Err(ContextSyncError::validation("syntax error at line 1"));
        }
        HeuristicAnalyzer.analyze(path, content).await
    }
}

struct SlowAnalyzer(Duration);

#[async_trait]
impl SemanticAnalyzer for SlowAnalyzer {
    async fn analyze(&self, path: &str, content: &str) -> Result<FileAnalysis> {
        tokio::time::sleep(self.0).await;
        HeuristicAnalyzer.analyze(path, content).await
    }
}

/// Fails every write to one domain while `failing` is set.
struct FailingWrites {
    inner: Arc<FsArtifactStore>,
    domain: DomainId,
    failing: AtomicBool,
}

#[async_trait]
impl ArtifactStore for FailingWrites {
    async fn list(&self, domain: &DomainId) -> Result<Vec<String>> {
        self.inner.list(domain).await
    }

    async fn read(&self, domain: &DomainId, path: &str) -> Result<Option<Vec<u8>>> {
        self.inner.read(domain, path).await
    }

    async fn write(&self, domain: &DomainId, path: &str, content: &[u8]) -> Result<()> {
        if *domain == self.domain && self.failing.load(Ordering::SeqCst) {
            let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only");
            return Err(ContextSyncError::io(path, denied));
        }
        self.inner.write(domain, path, content).await
    }

    async fn delete(&self, domain: &DomainId, path: &str) -> Result<bool> {
        self.inner.delete(domain, path).await
    }

    async fn list_domains(&self) -> Result<Vec<DomainId>> {
        self.inner.list_domains().await
    }
}

/// Records when each domain's generation started and finished.
#[derive(Default)]
struct RecordingGenerator {
    spans: Mutex<Vec<(DomainId, Instant, Instant)>>,
}

#[async_trait]
impl ContextGenerator for RecordingGenerator {
    async fn generate(
        &self,
        domain: &DomainId,
        results: &[AnalysisResult],
        related: &[DomainId],
    ) -> Result<ContextArtifact> {
        let start = Instant::now();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let artifact = TemplateGenerator::default()
            .generate(domain, results, related)
            .await?;
        self.spans.lock().push((domain.clone(), start, Instant::now()));
        Ok(artifact)
    }
}

/// Adds fixed dependencies to the heuristic analysis of chosen files.
struct ReportingAnalyzer {
    reported: Vec<(&'static str, &'static str)>,
}

#[async_trait]
impl SemanticAnalyzer for ReportingAnalyzer {
    async fn analyze(&self, path: &str, content: &str) -> Result<FileAnalysis> {
        let mut analysis = HeuristicAnalyzer.analyze(path, content).await?;
        analysis.dependencies.extend(
            self.reported
                .iter()
                .filter(|(file, _)| path.ends_with(file))
                .map(|(_, dep)| dep.to_string()),
        );
        Ok(analysis)
    }
}

/// Cancels its own job from inside the generator call.
#[derive(Default)]
struct CancellingGenerator {
    job: OnceLock<(Orchestrator, JobId)>,
}

#[async_trait]
impl ContextGenerator for CancellingGenerator {
    async fn generate(
        &self,
        domain: &DomainId,
        results: &[AnalysisResult],
        related: &[DomainId],
    ) -> Result<ContextArtifact> {
        while self.job.get().is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        if let Some((orchestrator, id)) = self.job.get() {
            assert!(orchestrator.cancel_job(id));
        }
        TemplateGenerator::default()
            .generate(domain, results, related)
            .await
    }
}

#[derive(Default)]
struct RecordingListener {
    statuses: Mutex<Vec<JobStatus>>,
}

impl StatusListener for RecordingListener {
    fn on_status_change(&self, job: &UpdateJob) {
        self.statuses.lock().push(job.status);
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn repeated_update_produces_identical_artifacts() {
    let h = Harness::new().await;
    h.write_source(
        "Billing/Invoice.cs",
        "public class Invoice { void Pay() { if (x) throw new Exception(); } }\n",
    );
    let listener = Arc::new(RecordingListener::default());
    let orchestrator = h.orchestrator(h.config(), Collaborators {
        listener: listener.clone(),
        ..h.collaborators()
    });

    let first = run(&orchestrator, &["Billing/Invoice.cs"]).await;
    assert_eq!(first.status, JobStatus::Completed, "{:?}", first.errors);
    assert_eq!(first.metrics.files_analyzed, 1);
    assert_eq!(first.metrics.context_files_generated, 1);
    let before = h.artifact("Billing", "context.md").await.unwrap();
    assert!(before.contains("`Invoice`"));

    let second = run(&orchestrator, &["Billing/Invoice.cs"]).await;
    assert_eq!(second.status, JobStatus::Completed);
    assert_eq!(h.artifact("Billing", "context.md").await.unwrap(), before);

    let statuses = listener.statuses.lock().clone();
    assert_eq!(
        &statuses[..6],
        &[
            JobStatus::Queued,
            JobStatus::Snapshotting,
            JobStatus::Analyzing,
            JobStatus::Generating,
            JobStatus::Committing,
            JobStatus::Completed,
        ]
    );
}

#[tokio::test]
async fn one_failing_file_is_a_partial_failure() {
    let h = Harness::new().await;
    for name in ["A", "B", "C"] {
        h.write_source(&format!("Billing/{name}.cs"), "public class Ledger { }\n");
    }
    let orchestrator = h.orchestrator(h.config(), Collaborators {
        analyzer: Arc::new(ThrowingAnalyzer { suffix: "B.cs" }),
        ..h.collaborators()
    });

    let job = run(&orchestrator, &["Billing/A.cs", "Billing/B.cs", "Billing/C.cs"]).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.metrics.files_discovered, 3);
    assert_eq!(job.metrics.files_analyzed, 2);
    assert_eq!(job.metrics.files_failed, 1);
    assert_eq!(job.errors.len(), 1);
    assert!(job.errors[0].contains("Billing/B.cs"));
    assert!(job.errors[0].contains("parse-failure"));
}

#[tokio::test]
async fn domain_without_results_gets_placeholder() {
    let h = Harness::new().await;
    h.write_source("Billing/Broken.cs", "public class {\n");
    let orchestrator = h.orchestrator(h.config(), Collaborators {
        analyzer: Arc::new(ThrowingAnalyzer { suffix: "Broken.cs" }),
        ..h.collaborators()
    });

    let job = run(&orchestrator, &["Billing/Broken.cs"]).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.metrics.files_analyzed, 0);
    assert_eq!(job.metrics.context_files_generated, 1);
    let content = h.artifact("Billing", "context.md").await.unwrap();
    assert!(content.contains("placeholder"));
}

#[tokio::test]
async fn dense_subdirectory_becomes_its_own_domain() {
    let h = Harness::new().await;
    h.write_source("Analysis/Fractal/X.cs", RICH);
    let job = run(&h.default_orchestrator(), &["Analysis/Fractal/X.cs"]).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.affected_domains.contains(&d("Analysis.Fractal")));
    assert!(h.artifact("Analysis.Fractal", "context.md").await.is_some());
}

#[tokio::test]
async fn sparse_subdirectory_rolls_up_to_parent() {
    let h = Harness::new().await;
    h.write_source("Analysis/Fractal/X.cs", SPARSE);
    let job = run(&h.default_orchestrator(), &["Analysis/Fractal/X.cs"]).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(
        job.affected_domains.iter().collect::<Vec<_>>(),
        vec![&d("Analysis")]
    );
    assert!(h.artifact("Analysis", "context.md").await.is_some());
}

#[tokio::test]
async fn dependencies_generate_before_dependents() {
    let h = Harness::new().await;
    h.write_source("Orders/Order.cs", "using App.Customers;\npublic class Order { }\n");
    h.write_source("Customers/Customer.cs", "public class Customer { }\n");
    h.write_source("Shipping/Parcel.cs", "public class Parcel { }\n");
    let generator = Arc::new(RecordingGenerator::default());
    let orchestrator = h.orchestrator(h.config(), Collaborators {
        generator: generator.clone(),
        ..h.collaborators()
    });

    let job = run(
        &orchestrator,
        &["Orders/Order.cs", "Customers/Customer.cs", "Shipping/Parcel.cs"],
    )
    .await;
    assert_eq!(job.status, JobStatus::Completed);

    let spans = generator.spans.lock().clone();
    let span = |name: &str| spans.iter().find(|(dom, _, _)| *dom == d(name)).cloned().unwrap();
    let (_, _, customers_done) = span("Customers");
    let (_, orders_start, _) = span("Orders");
    assert!(customers_done <= orders_start);

    let orders = h.artifact("Orders", "context.md").await.unwrap();
    assert!(orders.contains("[Customers](../Customers/context.md)"));
}

#[tokio::test]
async fn analyzer_reported_dependencies_become_links() {
    let h = Harness::new().await;
    h.write_source("Alpha/a.cs", "public class Alpha { }\n");
    h.write_source("Beta/b.cs", "public class Beta { }\n");
    let orchestrator = h.orchestrator(h.config(), Collaborators {
        analyzer: Arc::new(ReportingAnalyzer {
            reported: vec![("Alpha/a.cs", "App.Beta")],
        }),
        ..h.collaborators()
    });

    let job = run(&orchestrator, &["Alpha/a.cs", "Beta/b.cs"]).await;
    assert_eq!(job.status, JobStatus::Completed, "{:?}", job.errors);
    assert!(job.warnings.is_empty(), "{:?}", job.warnings);

    let alpha = h.artifact("Alpha", "context.md").await.unwrap();
    assert!(alpha.contains("[Beta](../Beta/context.md)"));
    let beta = h.artifact("Beta", "context.md").await.unwrap();
    assert!(!beta.contains("../Alpha/context.md"));
}

#[tokio::test]
async fn reported_dependency_closing_a_cycle_is_dropped_with_warning() {
    let h = Harness::new().await;
    h.write_source("Alpha/a.cs", "using App.Beta;\npublic class Alpha { }\n");
    h.write_source("Beta/b.cs", "public class Beta { }\n");
    let orchestrator = h.orchestrator(h.config(), Collaborators {
        analyzer: Arc::new(ReportingAnalyzer {
            reported: vec![("Beta/b.cs", "App.Alpha")],
        }),
        ..h.collaborators()
    });

    let job = run(&orchestrator, &["Alpha/a.cs", "Beta/b.cs"]).await;
    assert_eq!(job.status, JobStatus::Completed, "{:?}", job.errors);
    assert!(job.warnings.iter().any(|w| w.contains("dependency cycle")));
    assert_eq!(job.metrics.context_files_generated, 2);
}

#[tokio::test]
async fn reference_cycle_completes_with_warning() {
    let h = Harness::new().await;
    h.write_source("A/a.cs", "using App.B;\nclass Alpha {}\n");
    h.write_source("B/b.cs", "using App.C;\nclass Beta {}\n");
    h.write_source("C/c.cs", "using App.A;\nclass Gamma {}\n");

    let job = run(&h.default_orchestrator(), &["A/a.cs", "B/b.cs", "C/c.cs"]).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.warnings.iter().any(|w| w.contains("dependency cycle")));
    assert_eq!(job.metrics.context_files_generated, 3);
}

#[tokio::test]
async fn commit_failure_rolls_back_automatically() {
    let h = Harness::new().await;
    for name in ["A", "B", "C"] {
        h.write_source(&format!("{name}/src.cs"), "public class Widget { }\n");
    }
    h.seed_artifact("A", "context.md", "original A\n").await;
    let store = Arc::new(FailingWrites {
        inner: h.artifacts.clone(),
        domain: d("C"),
        failing: AtomicBool::new(true),
    });
    let orchestrator = h.orchestrator(h.config(), Collaborators {
        artifacts: store,
        ..h.collaborators()
    });

    let job = run(&orchestrator, &["A/src.cs", "B/src.cs", "C/src.cs"]).await;
    assert_eq!(job.status, JobStatus::RolledBack);
    assert!(!job.errors.is_empty());
    assert!(job.errors.iter().any(|e| e.contains("commit of C failed")));

    assert_eq!(h.artifact("A", "context.md").await.unwrap(), "original A\n");
    assert!(h.artifacts.list(&d("B")).await.unwrap().is_empty());
    assert!(h.artifacts.list(&d("C")).await.unwrap().is_empty());

    let record = h.storage.get_rollback_record(&job.id).await.unwrap().unwrap();
    assert_eq!(record.status, RollbackStatus::Failed);
    assert_eq!(record.file_operations.len(), 3);
}

#[tokio::test]
async fn manual_rollback_restores_snapshot_bytes() {
    let h = Harness::new().await;
    for name in ["A", "B", "C"] {
        h.write_source(&format!("{name}/src.cs"), "public class Widget { }\n");
    }
    h.seed_artifact("A", "context.md", "original A\n").await;
    h.seed_artifact("A", "notes/keep.md", "hand-written\n").await;
    let store = Arc::new(FailingWrites {
        inner: h.artifacts.clone(),
        domain: d("C"),
        failing: AtomicBool::new(true),
    });
    let config = OrchestratorConfig {
        auto_rollback: false,
        ..h.config()
    };
    let orchestrator = h.orchestrator(config, Collaborators {
        artifacts: store,
        ..h.collaborators()
    });

    let job = run(&orchestrator, &["A/src.cs", "B/src.cs", "C/src.cs"]).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert!(!job.errors.is_empty());
    assert_ne!(h.artifact("A", "context.md").await.unwrap(), "original A\n");
    assert!(h.artifact("B", "context.md").await.is_some());

    let outcome = orchestrator.rollback_job(&job.id).await.unwrap();
    assert_eq!(
        outcome,
        RollbackOutcome::RolledBack {
            files_restored: 1,
            files_removed: 1,
        }
    );
    assert_eq!(h.artifact("A", "context.md").await.unwrap(), "original A\n");
    assert_eq!(h.artifact("A", "notes/keep.md").await.unwrap(), "hand-written\n");
    assert!(h.artifact("B", "context.md").await.is_none());

    let job = orchestrator.get_job_status(&job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::RolledBack);
    assert!(!job.errors.is_empty());

    let again = orchestrator.rollback_job(&job.id).await.unwrap();
    assert!(matches!(
        again,
        RollbackOutcome::NotRollbackable {
            status: JobStatus::RolledBack,
            ..
        }
    ));
}

#[tokio::test]
async fn completed_jobs_are_not_rolled_back() {
    let h = Harness::new().await;
    h.write_source("Billing/Invoice.cs", "public class Invoice { }\n");
    let orchestrator = h.default_orchestrator();
    let job = run(&orchestrator, &["Billing/Invoice.cs"]).await;

    let outcome = orchestrator.rollback_job(&job.id).await.unwrap();
    assert!(matches!(outcome, RollbackOutcome::NotRollbackable { .. }));
    assert!(matches!(
        orchestrator.rollback_job(&JobId::new()).await,
        Err(ContextSyncError::NotFound(_))
    ));
}

#[tokio::test]
async fn cancellation_leaves_artifacts_untouched() {
    let h = Harness::new().await;
    for name in ["A", "B", "C"] {
        h.write_source(&format!("Billing/{name}.cs"), "public class Invoice { }\n");
    }
    h.seed_artifact("Billing", "context.md", "previous\n").await;
    let orchestrator = h.orchestrator(h.config(), Collaborators {
        analyzer: Arc::new(SlowAnalyzer(Duration::from_millis(300))),
        ..h.collaborators()
    });

    let id = orchestrator
        .submit_update(
            files(&["Billing/A.cs", "Billing/B.cs", "Billing/C.cs"]),
            TriggerType::GitHook,
            UpdateOptions {
                max_concurrency: Some(1),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(orchestrator.cancel_job(&id));

    let job = orchestrator.wait(&id).await.unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.metrics.files_analyzed < 3);
    assert_eq!(h.artifact("Billing", "context.md").await.unwrap(), "previous\n");
    assert!(h.storage.get_rollback_record(&id).await.unwrap().is_none());
    assert!(!orchestrator.cancel_job(&id));
}

#[tokio::test]
async fn cancellation_during_generation_commits_nothing() {
    let h = Harness::new().await;
    h.write_source("Billing/Invoice.cs", "public class Invoice { }\n");
    h.seed_artifact("Billing", "context.md", "previous\n").await;
    let generator = Arc::new(CancellingGenerator::default());
    let listener = Arc::new(RecordingListener::default());
    let orchestrator = h.orchestrator(h.config(), Collaborators {
        generator: generator.clone(),
        listener: listener.clone(),
        ..h.collaborators()
    });

    let id = orchestrator
        .submit_update(
            files(&["Billing/Invoice.cs"]),
            TriggerType::Manual,
            UpdateOptions::default(),
        )
        .await
        .unwrap();
    assert!(generator.job.set((orchestrator.clone(), id.clone())).is_ok());

    let job = orchestrator.wait(&id).await.unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(!listener.statuses.lock().contains(&JobStatus::Committing));
    assert_eq!(h.artifact("Billing", "context.md").await.unwrap(), "previous\n");
    assert!(h.storage.get_rollback_record(&id).await.unwrap().is_none());
}

#[tokio::test]
async fn invalid_submissions_fail_without_a_job() {
    let h = Harness::new().await;
    h.write_source("Billing/Invoice.cs", "public class Invoice { }\n");
    let orchestrator = h.default_orchestrator();

    let empty = orchestrator
        .submit_update(Vec::new(), TriggerType::Manual, UpdateOptions::default())
        .await;
    assert!(matches!(empty, Err(ContextSyncError::Validation { .. })));

    let zero = orchestrator
        .submit_update(
            files(&["Billing/Invoice.cs"]),
            TriggerType::Manual,
            UpdateOptions {
                max_concurrency: Some(0),
                ..Default::default()
            },
        )
        .await;
    assert!(matches!(zero, Err(ContextSyncError::Validation { .. })));

    let unmapped = orchestrator
        .submit_update(files(&["README.md"]), TriggerType::Manual, UpdateOptions::default())
        .await;
    assert!(unmapped.is_err());

    assert!(
        orchestrator
            .list_jobs(&JobFilter::default())
            .await
            .unwrap()
            .is_empty()
    );
    let validation = orchestrator.validate_config(&UpdateOptions {
        performance_timeout_secs: Some(0),
        ..Default::default()
    });
    assert!(!validation.valid);
    assert_eq!(validation.issues.len(), 1);
}

#[tokio::test]
async fn full_reindex_with_cleanup_removes_orphans_and_stale_files() {
    let h = Harness::new().await;
    h.write_source("Billing/Invoice.cs", "public class Invoice { }\n");
    h.write_source("Billing/notes.txt", "not source");
    h.seed_artifact("Legacy", "context.md", "gone\n").await;
    h.seed_artifact("Billing", "old-notes.md", "stale\n").await;
    let orchestrator = h.default_orchestrator();

    let id = orchestrator
        .submit_full_reindex(ReindexOptions {
            cleanup_first: Some(true),
            ..Default::default()
        })
        .await
        .unwrap();
    let job = orchestrator.wait(&id).await.unwrap();

    assert_eq!(job.status, JobStatus::Completed, "{:?}", job.errors);
    assert_eq!(job.trigger_type, TriggerType::FullReindex);
    assert_eq!(job.changed_files, vec!["Billing/Invoice.cs"]);
    assert!(job.affected_domains.contains(&d("Legacy")));
    assert_eq!(job.metrics.context_files_removed, 2);
    assert_eq!(h.artifacts.list_domains().await.unwrap(), vec![d("Billing")]);
    assert_eq!(
        h.artifacts.list(&d("Billing")).await.unwrap(),
        vec!["context.md"]
    );
}

#[tokio::test]
async fn recovery_fails_interrupted_work_and_keeps_it_restorable() {
    let h = Harness::new().await;
    h.seed_artifact("Billing", "context.md", "before crash\n").await;

    // State left behind by a process that died mid-job.
    let mut job = UpdateJob::new(
        TriggerType::Scheduled,
        files(&["Billing/Invoice.cs"]),
        [d("Billing")].into(),
    );
    job.status = JobStatus::Analyzing;
    h.storage.upsert_job(&job).await.unwrap();
    h.storage
        .insert_rollback_record(&RollbackRecord::pending(job.id.clone(), vec![d("Billing")]))
        .await
        .unwrap();
    let mut snapshot = contextsync_shared::Snapshot::empty(d("Billing"));
    snapshot.files.insert(
        "context.md".into(),
        contextsync_shared::SnapshotFile::new(b"before crash\n".to_vec()),
    );
    h.storage.insert_snapshot(&job.id, &snapshot).await.unwrap();
    h.seed_artifact("Billing", "context.md", "half written\n").await;

    let orchestrator = h.default_orchestrator();
    let report = orchestrator.recover().await.unwrap();
    assert_eq!(report.jobs_failed, 1);
    assert_eq!(report.rollback_records_failed, 1);

    let recovered = orchestrator.get_job_status(&job.id).await.unwrap();
    assert_eq!(recovered.status, JobStatus::Failed);
    assert!(!recovered.errors.is_empty());

    let outcome = orchestrator.rollback_job(&job.id).await.unwrap();
    assert!(matches!(outcome, RollbackOutcome::RolledBack { .. }));
    assert_eq!(
        h.artifact("Billing", "context.md").await.unwrap(),
        "before crash\n"
    );
}

#[tokio::test]
async fn maintenance_prunes_history_beyond_limits() {
    let h = Harness::new().await;
    h.write_source("Billing/Invoice.cs", "public class Invoice { }\n");
    let mut config = h.config();
    config.cleanup.job_max_count = 1;
    config.cleanup.max_count = 1;
    let orchestrator = h.orchestrator(config, h.collaborators());

    for _ in 0..3 {
        run(&orchestrator, &["Billing/Invoice.cs"]).await;
    }
    let report = orchestrator.perform_maintenance(CleanupTrigger::Manual).await;
    assert!(report.errors.is_empty());
    assert_eq!(report.jobs_pruned, 2);
    assert_eq!(
        orchestrator
            .list_jobs(&JobFilter::default())
            .await
            .unwrap()
            .len(),
        1
    );
}
