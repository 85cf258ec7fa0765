//! Context generation stage.
//!
//! Domains are generated on a bounded pool in dependency order: a domain is
//! dispatched only once every domain it depends on has finished generating.
//! Unrelated domains run concurrently.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use contextsync_artifacts::render_context;
use contextsync_discovery::DependencyGraph;
use contextsync_shared::{
    AnalysisResult, ContextArtifact, DomainId, Result, TemplateThresholds,
};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::retry::{RetryPolicy, retry_transient};

/// Turns a domain's aggregated analysis results into its context artifact.
/// Must be deterministic in its inputs apart from `generated_at`.
#[async_trait]
pub trait ContextGenerator: Send + Sync {
    async fn generate(
        &self,
        domain: &DomainId,
        results: &[AnalysisResult],
        related: &[DomainId],
    ) -> Result<ContextArtifact>;
}

/// Markdown template generator with low/medium/high tiers.
#[derive(Debug, Clone, Default)]
pub struct TemplateGenerator {
    thresholds: TemplateThresholds,
}

impl TemplateGenerator {
    pub fn new(thresholds: TemplateThresholds) -> Self {
        Self { thresholds }
    }
}

#[async_trait]
impl ContextGenerator for TemplateGenerator {
    async fn generate(
        &self,
        domain: &DomainId,
        results: &[AnalysisResult],
        related: &[DomainId],
    ) -> Result<ContextArtifact> {
        Ok(render_context(domain, results, related, &self.thresholds))
    }
}

/// Group results under the most specific affected domain that is the
/// result's domain or one of its ancestors. Every domain gets an entry, so
/// domains without results still produce a placeholder.
pub fn assign_results(
    domains: &BTreeSet<DomainId>,
    results: Vec<AnalysisResult>,
) -> BTreeMap<DomainId, Vec<AnalysisResult>> {
    let mut grouped: BTreeMap<DomainId, Vec<AnalysisResult>> =
        domains.iter().map(|d| (d.clone(), Vec::new())).collect();
    for result in results {
        let owner = domains
            .iter()
            .filter(|d| d.is_ancestor_or_self(&result.domain_context))
            .max_by_key(|d| d.depth());
        match owner {
            Some(domain) => grouped.entry(domain.clone()).or_default().push(result),
            None => warn!(
                file = %result.file_path,
                domain = %result.domain_context,
                "analysis result matches no affected domain; dropped"
            ),
        }
    }
    grouped
}

/// One generated domain with its timing.
#[derive(Debug, Clone)]
pub struct DomainGeneration {
    pub artifact: ContextArtifact,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Output of [`generate_all`].
#[derive(Debug, Default)]
pub struct GenerationOutcome {
    pub generated: BTreeMap<DomainId, DomainGeneration>,
    /// Domains whose generator call failed, with the error.
    pub failures: BTreeMap<DomainId, String>,
    /// Finish order.
    pub order: Vec<DomainId>,
    pub cancelled: bool,
    /// Set when a generation task died without reporting; the stage is unusable.
    pub aborted: Option<String>,
}

type TaskOutput = (DomainId, DateTime<Utc>, Result<ContextArtifact>, DateTime<Utc>);

/// Generate every domain in `inputs`, at most `concurrency` at a time.
///
/// Dependents of a failed domain are still generated; the failure is
/// recorded for the caller to treat as partial.
#[instrument(skip_all, fields(domains = inputs.len(), concurrency))]
pub async fn generate_all(
    generator: Arc<dyn ContextGenerator>,
    graph: &DependencyGraph,
    inputs: BTreeMap<DomainId, Vec<AnalysisResult>>,
    concurrency: usize,
    retry: RetryPolicy,
    cancel: &CancellationToken,
) -> GenerationOutcome {
    let mut outcome = GenerationOutcome::default();
    let domains: BTreeSet<DomainId> = inputs.keys().cloned().collect();

    let mut waiting_on: BTreeMap<DomainId, usize> = domains
        .iter()
        .map(|d| {
            let deps = graph
                .dependencies_of(d)
                .into_iter()
                .filter(|dep| domains.contains(dep))
                .count();
            (d.clone(), deps)
        })
        .collect();
    let mut ready: VecDeque<DomainId> = waiting_on
        .iter()
        .filter(|(_, n)| **n == 0)
        .map(|(d, _)| d.clone())
        .collect();
    let mut inputs = inputs;
    let mut tasks: JoinSet<TaskOutput> = JoinSet::new();
    let limit = concurrency.max(1);

    loop {
        while tasks.len() < limit && outcome.aborted.is_none() && !outcome.cancelled {
            if cancel.is_cancelled() {
                info!("generation cancelled; no further domains dispatched");
                outcome.cancelled = true;
                break;
            }
            let Some(domain) = ready.pop_front() else {
                break;
            };
            let results = inputs.remove(&domain).unwrap_or_default();
            let related: Vec<DomainId> = graph
                .dependencies_of(&domain)
                .into_iter()
                .filter(|d| domains.contains(d))
                .collect();
            let generator = Arc::clone(&generator);
            debug!(domain = %domain, files = results.len(), "dispatching generation");
            tasks.spawn(async move {
                let started = Utc::now();
                let generated = retry_transient(&retry, "generate context", || {
                    generator.generate(&domain, &results, &related)
                })
                .await;
                (domain, started, generated, Utc::now())
            });
        }

        let Some(joined) = tasks.join_next().await else {
            break;
        };
        let (domain, started_at, generated, finished_at) = match joined {
            Ok(output) => output,
            Err(e) => {
                error!(error = %e, "generation task died");
                outcome.aborted = Some(format!("generation task failed: {e}"));
                continue;
            }
        };

        match generated {
            Ok(artifact) => {
                debug!(domain = %domain, tier = %artifact.template_used, "generated context");
                outcome.generated.insert(
                    domain.clone(),
                    DomainGeneration {
                        artifact,
                        started_at,
                        finished_at,
                    },
                );
            }
            Err(e) => {
                warn!(domain = %domain, error = %e, "context generation failed");
                outcome.failures.insert(domain.clone(), e.to_string());
            }
        }
        outcome.order.push(domain.clone());

        for dependent in graph.dependents_of(&domain) {
            if let Some(count) = waiting_on.get_mut(&dependent) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    ready.push_back(dependent);
                }
            }
        }
    }

    info!(
        generated = outcome.generated.len(),
        failed = outcome.failures.len(),
        cancelled = outcome.cancelled,
        "generation stage finished"
    );
    outcome
}
