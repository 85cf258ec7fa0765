//! Analysis stage: per-file semantic analysis on a bounded worker pool.
//!
//! Each file is read from the source root and handed to a
//! [`SemanticAnalyzer`]. A failing file is logged, classified, and left out
//! of the results; the batch carries on. A wall-clock deadline bounds the
//! whole batch: once it passes, in-flight work is abandoned and every
//! unfinished file is reported as skipped.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use contextsync_discovery::{normalize_reference, scan_source};
use contextsync_shared::{AnalysisResult, ContextSyncError, DomainId, Result, language_for_path};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::retry::{RetryPolicy, retry_transient};

// ---------------------------------------------------------------------------
// Analyzer interface
// ---------------------------------------------------------------------------

/// What an analyzer extracts from one file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileAnalysis {
    pub concepts: Vec<String>,
    pub rules: Vec<String>,
    /// Normalized import/using targets.
    pub dependencies: Vec<String>,
    /// Domain the analyzer believes the file belongs to, if it has an opinion.
    pub domain_hint: Option<DomainId>,
}

/// Per-file semantic analyzer. Implementations must be pure with respect to
/// `(path, content)`.
#[async_trait]
pub trait SemanticAnalyzer: Send + Sync {
    async fn analyze(&self, path: &str, content: &str) -> Result<FileAnalysis>;
}

/// Default analyzer backed by the lexical signal scanner.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicAnalyzer;

#[async_trait]
impl SemanticAnalyzer for HeuristicAnalyzer {
    async fn analyze(&self, _path: &str, content: &str) -> Result<FileAnalysis> {
        let signals = scan_source(content);
        let dependencies = signals
            .references
            .iter()
            .map(|r| normalize_reference(r))
            .filter(|r| !r.is_empty())
            .collect();
        Ok(FileAnalysis {
            concepts: signals.concepts,
            rules: signals.rules,
            dependencies,
            domain_hint: None,
        })
    }
}

// ---------------------------------------------------------------------------
// Failures
// ---------------------------------------------------------------------------

/// Error class recorded for a file that could not be analyzed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisFailureKind {
    NotFound,
    Permission,
    Timeout,
    ParseFailure,
}

impl AnalysisFailureKind {
    pub fn classify(error: &ContextSyncError) -> Self {
        match error {
            ContextSyncError::Io { source, .. } => match source.kind() {
                std::io::ErrorKind::NotFound => Self::NotFound,
                std::io::ErrorKind::PermissionDenied => Self::Permission,
                std::io::ErrorKind::TimedOut => Self::Timeout,
                _ => Self::ParseFailure,
            },
            ContextSyncError::Timeout { .. } => Self::Timeout,
            _ => Self::ParseFailure,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not-found",
            Self::Permission => "permission",
            Self::Timeout => "timeout",
            Self::ParseFailure => "parse-failure",
        }
    }
}

impl std::fmt::Display for AnalysisFailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One file excluded from the results.
#[derive(Debug, Clone)]
pub struct AnalysisFailure {
    pub file_path: String,
    pub kind: AnalysisFailureKind,
    pub message: String,
}

impl std::fmt::Display for AnalysisFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}: {}", self.file_path, self.kind, self.message)
    }
}

/// Output of one [`AnalysisStage::analyze_files`] call.
#[derive(Debug, Default)]
pub struct AnalysisBatch {
    /// Successful results, in input order.
    pub results: Vec<AnalysisResult>,
    pub failures: Vec<AnalysisFailure>,
    /// Files never analyzed because of the deadline or cancellation.
    pub skipped: Vec<String>,
    pub discovered: usize,
    pub deadline_exceeded: bool,
    pub cancelled: bool,
}

// ---------------------------------------------------------------------------
// AnalysisStage
// ---------------------------------------------------------------------------

/// Runs the analyzer over a batch of files.
#[derive(Clone)]
pub struct AnalysisStage {
    analyzer: Arc<dyn SemanticAnalyzer>,
    source_root: PathBuf,
    file_timeout: Duration,
    retry: RetryPolicy,
}

impl AnalysisStage {
    pub fn new(
        analyzer: Arc<dyn SemanticAnalyzer>,
        source_root: impl Into<PathBuf>,
        file_timeout: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            analyzer,
            source_root: source_root.into(),
            file_timeout,
            retry,
        }
    }

    /// Analyze `files` (path relative to the source root, resolved domain)
    /// with at most `concurrency` files in flight.
    ///
    /// On cancellation no new file is dispatched but in-flight files run to
    /// completion. When `deadline` passes, in-flight files are abandoned.
    #[instrument(skip_all, fields(files = files.len(), concurrency))]
    pub async fn analyze_files(
        &self,
        files: &[(String, DomainId)],
        deadline: Instant,
        concurrency: usize,
        cancel: &CancellationToken,
        on_progress: &(dyn Fn(&str, usize, usize) + Send + Sync),
    ) -> AnalysisBatch {
        let total = files.len();
        let affected: Arc<BTreeSet<DomainId>> =
            Arc::new(files.iter().map(|(_, d)| d.clone()).collect());
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        let mut tasks: JoinSet<(usize, Result<AnalysisResult>)> = JoinSet::new();
        let mut outcomes: Vec<Option<Result<AnalysisResult>>> = (0..total).map(|_| None).collect();

        let mut batch = AnalysisBatch {
            discovered: total,
            ..Default::default()
        };
        let mut next = 0usize;
        let mut finished = 0usize;
        let sleep = tokio::time::sleep_until(deadline);
        tokio::pin!(sleep);

        loop {
            let dispatching = next < total && !batch.cancelled && !batch.deadline_exceeded;
            if !dispatching && tasks.is_empty() {
                break;
            }

            tokio::select! {
                biased;

                _ = cancel.cancelled(), if !batch.cancelled => {
                    info!(dispatched = next, total, "analysis cancelled; draining in-flight files");
                    batch.cancelled = true;
                }

                _ = &mut sleep, if !batch.deadline_exceeded => {
                    warn!(finished, total, "analysis deadline exceeded; skipping remaining files");
                    batch.deadline_exceeded = true;
                    tasks.abort_all();
                }

                Some(joined) = tasks.join_next() => match joined {
                    Ok((idx, outcome)) => {
                        finished += 1;
                        on_progress(&files[idx].0, finished, total);
                        outcomes[idx] = Some(outcome);
                    }
                    Err(e) if e.is_cancelled() => {}
                    Err(e) => error!(error = %e, "analysis task panicked"),
                },

                permit = semaphore.clone().acquire_owned(), if dispatching => {
                    let Ok(permit) = permit else { break };
                    let idx = next;
                    next += 1;
                    let (path, domain) = files[idx].clone();
                    let stage = self.clone();
                    let affected = Arc::clone(&affected);
                    tasks.spawn(async move {
                        let _permit = permit;
                        (idx, stage.analyze_one(&path, &domain, &affected).await)
                    });
                }

                else => break,
            }
        }

        for (idx, outcome) in outcomes.into_iter().enumerate() {
            let path = &files[idx].0;
            match outcome {
                Some(Ok(result)) => batch.results.push(result),
                Some(Err(e)) => {
                    let failure = AnalysisFailure {
                        file_path: path.clone(),
                        kind: AnalysisFailureKind::classify(&e),
                        message: e.to_string(),
                    };
                    warn!(file = %path, class = %failure.kind, error = %e, "file analysis failed");
                    batch.failures.push(failure);
                }
                // Dispatched, not abandoned, yet no outcome: the task panicked.
                None if idx < next && !batch.deadline_exceeded => {
                    batch.failures.push(AnalysisFailure {
                        file_path: path.clone(),
                        kind: AnalysisFailureKind::ParseFailure,
                        message: "analyzer task aborted unexpectedly".to_string(),
                    });
                }
                None => batch.skipped.push(path.clone()),
            }
        }

        info!(
            analyzed = batch.results.len(),
            failed = batch.failures.len(),
            skipped = batch.skipped.len(),
            "analysis stage finished"
        );
        batch
    }

    async fn analyze_one(
        &self,
        path: &str,
        domain: &DomainId,
        affected: &BTreeSet<DomainId>,
    ) -> Result<AnalysisResult> {
        let started = std::time::Instant::now();
        let full = self.source_root.join(path);
        let full_ref = &full;

        let bytes = retry_transient(&self.retry, "read source file", move || async move {
            tokio::fs::read(full_ref)
                .await
                .map_err(|e| ContextSyncError::io(full_ref, e))
        })
        .await?;
        let content = String::from_utf8_lossy(&bytes).into_owned();

        let analyzer = self.analyzer.as_ref();
        let content_ref = content.as_str();
        let timeout = self.file_timeout;
        let analysis = retry_transient(&self.retry, "analyze file", move || async move {
            match tokio::time::timeout(timeout, analyzer.analyze(path, content_ref)).await {
                Ok(result) => result,
                Err(_) => Err(ContextSyncError::Timeout {
                    operation: format!("analyze {path}"),
                    after_ms: timeout.as_millis() as u64,
                }),
            }
        })
        .await?;

        let domain_context = analysis
            .domain_hint
            .filter(|hint| affected.contains(hint))
            .unwrap_or_else(|| domain.clone());
        let elapsed = started.elapsed().as_millis() as u64;
        debug!(file = path, domain = %domain_context, elapsed_ms = elapsed, "analyzed file");

        Ok(AnalysisResult {
            file_path: path.to_string(),
            language: language_for_path(path).to_string(),
            domain_context,
            business_concepts: analysis.concepts,
            business_rules: analysis.rules,
            dependencies: analysis.dependencies,
            analysis_time_ms: elapsed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailOn(&'static str);

    #[async_trait]
    impl SemanticAnalyzer for FailOn {
        async fn analyze(&self, path: &str, content: &str) -> Result<FileAnalysis> {
            if path.ends_with(self.0) {
                return Err(ContextSyncError::validation("unparseable"));
            }
            HeuristicAnalyzer.analyze(path, content).await
        }
    }

    struct Slow;

    #[async_trait]
    impl SemanticAnalyzer for Slow {
        async fn analyze(&self, _path: &str, _content: &str) -> Result<FileAnalysis> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(FileAnalysis::default())
        }
    }

    fn fixture(files: &[&str]) -> (tempfile::TempDir, Vec<(String, DomainId)>) {
        let dir = tempfile::tempdir().unwrap();
        let mut out = Vec::new();
        for f in files {
            let path = dir.path().join(f);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, "public class Invoice { }\n").unwrap();
            out.push((f.to_string(), DomainId::new("Billing").unwrap()));
        }
        (dir, out)
    }

    fn stage(analyzer: Arc<dyn SemanticAnalyzer>, root: &std::path::Path) -> AnalysisStage {
        AnalysisStage::new(analyzer, root, Duration::from_secs(5), RetryPolicy::none())
    }

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    #[tokio::test]
    async fn one_failing_file_does_not_abort_batch() {
        let (dir, files) = fixture(&["Billing/A.cs", "Billing/B.cs", "Billing/C.cs"]);
        let stage = stage(Arc::new(FailOn("B.cs")), dir.path());
        let batch = stage
            .analyze_files(&files, far_deadline(), 2, &CancellationToken::new(), &|_, _, _| {})
            .await;

        assert_eq!(batch.results.len(), 2);
        assert_eq!(batch.results[0].file_path, "Billing/A.cs");
        assert_eq!(batch.results[1].file_path, "Billing/C.cs");
        assert_eq!(batch.results[0].business_concepts, vec!["Invoice"]);
        assert_eq!(batch.failures.len(), 1);
        assert_eq!(batch.failures[0].file_path, "Billing/B.cs");
        assert_eq!(batch.failures[0].kind, AnalysisFailureKind::ParseFailure);
    }

    #[tokio::test]
    async fn missing_file_is_classified_not_found() {
        let (dir, mut files) = fixture(&["Billing/A.cs"]);
        files.push(("Billing/Gone.cs".into(), DomainId::new("Billing").unwrap()));
        let stage = stage(Arc::new(HeuristicAnalyzer), dir.path());
        let batch = stage
            .analyze_files(&files, far_deadline(), 1, &CancellationToken::new(), &|_, _, _| {})
            .await;
        assert_eq!(batch.results.len(), 1);
        assert_eq!(batch.failures[0].kind, AnalysisFailureKind::NotFound);
    }

    #[tokio::test]
    async fn deadline_skips_remaining_files() {
        let (dir, files) = fixture(&["Billing/A.cs", "Billing/B.cs", "Billing/C.cs"]);
        let stage = stage(Arc::new(Slow), dir.path());
        let deadline = Instant::now() + Duration::from_millis(50);
        let batch = stage
            .analyze_files(&files, deadline, 1, &CancellationToken::new(), &|_, _, _| {})
            .await;
        assert!(batch.deadline_exceeded);
        assert!(batch.results.is_empty());
        assert!(batch.failures.is_empty());
        assert_eq!(batch.skipped.len(), 3);
        assert_eq!(batch.discovered, 3);
    }

    #[tokio::test]
    async fn cancelled_batch_dispatches_nothing() {
        let (dir, files) = fixture(&["Billing/A.cs", "Billing/B.cs"]);
        let stage = stage(Arc::new(HeuristicAnalyzer), dir.path());
        let token = CancellationToken::new();
        token.cancel();
        let batch = stage
            .analyze_files(&files, far_deadline(), 2, &token, &|_, _, _| {})
            .await;
        assert!(batch.cancelled);
        assert!(batch.results.is_empty());
        assert_eq!(batch.skipped.len(), 2);
    }

    #[test]
    fn failure_classes() {
        let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "no");
        assert_eq!(
            AnalysisFailureKind::classify(&ContextSyncError::io("/x", denied)),
            AnalysisFailureKind::Permission
        );
        let timeout = ContextSyncError::Timeout {
            operation: "analyze".into(),
            after_ms: 1,
        };
        assert_eq!(AnalysisFailureKind::classify(&timeout), AnalysisFailureKind::Timeout);
        assert_eq!(AnalysisFailureKind::Timeout.to_string(), "timeout");
    }
}
