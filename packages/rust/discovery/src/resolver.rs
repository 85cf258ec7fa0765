//! Changed files → affected domains and their dependency graph.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use contextsync_shared::{BoundaryPolicy, ContextSyncError, DomainId, Result};
use tracing::{debug, info, instrument, warn};

use crate::boundary::{BoundaryScore, score_directory};
use crate::domain_map::{DomainMap, normalize_path};
use crate::graph::DependencyGraph;
use crate::signals::{FileSignals, normalize_reference, scan_source};
use crate::walk::{SourceFilter, WalkOptions, walk_dir};

// ---------------------------------------------------------------------------
// ResolvedDomains
// ---------------------------------------------------------------------------

/// Output of one resolution.
#[derive(Debug, Clone, Default)]
pub struct ResolvedDomains {
    /// Every domain at least one changed file resolved to.
    pub domains: BTreeSet<DomainId>,
    /// Acyclic dependency graph over `domains`.
    pub graph: DependencyGraph,
    /// Resolved files (normalized path → domain).
    pub file_domains: BTreeMap<String, DomainId>,
    /// Scores computed for candidate sub-domains, keyed by candidate id.
    pub boundary_scores: BTreeMap<DomainId, BoundaryScore>,
    /// Non-fatal notes: unresolved files, dropped cycle edges.
    pub warnings: Vec<String>,
    /// Changed files that map to no domain.
    pub unresolved: Vec<String>,
}

impl ResolvedDomains {
    pub fn domain_of(&self, path: &str) -> Option<&DomainId> {
        self.file_domains.get(&normalize_path(path))
    }
}

// ---------------------------------------------------------------------------
// DomainResolver
// ---------------------------------------------------------------------------

/// Maps changed files to domains, applying granular boundary promotion and
/// deriving cross-domain dependency edges from import references.
pub struct DomainResolver {
    source_root: PathBuf,
    map: Arc<dyn DomainMap>,
    policy: BoundaryPolicy,
    filter: SourceFilter,
}

/// Per-resolution memo of file signals and directory scores.
#[derive(Default)]
struct ResolveCache {
    signals: HashMap<String, Option<FileSignals>>,
    scores: HashMap<String, BoundaryScore>,
}

impl DomainResolver {
    /// `source_files` selects which files count when scoring a candidate directory.
    pub fn new(
        source_root: impl Into<PathBuf>,
        map: Arc<dyn DomainMap>,
        policy: BoundaryPolicy,
        source_files: &WalkOptions,
    ) -> Result<Self> {
        Ok(Self {
            source_root: source_root.into(),
            map,
            policy,
            filter: SourceFilter::new(source_files)?,
        })
    }

    pub fn source_root(&self) -> &Path {
        &self.source_root
    }

    /// Resolve the affected domains and dependency graph for a change set.
    ///
    /// Unmappable files are reported in `unresolved`; the resolution fails
    /// only when no file maps to a domain.
    #[instrument(skip_all, fields(files = changed_files.len()))]
    pub fn resolve(&self, changed_files: &[String]) -> Result<ResolvedDomains> {
        if changed_files.is_empty() {
            return Err(ContextSyncError::validation("no changed files to resolve"));
        }

        let mut cache = ResolveCache::default();
        let mut resolved = ResolvedDomains::default();
        let mut ordered_files = Vec::new();

        for raw in changed_files {
            let Some(path) = self.relative(raw) else {
                resolved
                    .warnings
                    .push(format!("{raw}: outside the source root, ignored"));
                resolved.unresolved.push(raw.clone());
                continue;
            };
            if resolved.file_domains.contains_key(&path) {
                continue;
            }
            match self.resolve_path(&path, &mut cache, &mut resolved.boundary_scores) {
                Some(domain) => {
                    debug!(file = %path, domain = %domain, "resolved file");
                    resolved.domains.insert(domain.clone());
                    resolved.file_domains.insert(path.clone(), domain);
                    ordered_files.push(path);
                }
                None => {
                    warn!(file = %path, "file maps to no domain");
                    resolved
                        .warnings
                        .push(format!("{path}: maps to no domain, ignored"));
                    resolved.unresolved.push(path);
                }
            }
        }

        if resolved.domains.is_empty() {
            return Err(ContextSyncError::validation(format!(
                "none of the {} changed files resolves to a domain",
                changed_files.len()
            )));
        }

        for domain in &resolved.domains {
            resolved.graph.add_node(domain.clone());
        }
        for path in &ordered_files {
            let Some(from) = resolved.file_domains.get(path).cloned() else {
                continue;
            };
            let references = self
                .signals(path, &mut cache)
                .map(|s| s.references.clone())
                .unwrap_or_default();
            for reference in references {
                let target = self.reference_target(
                    path,
                    &reference,
                    &resolved.domains,
                    &mut cache,
                    &mut resolved.boundary_scores,
                );
                if let Some(to) = target.filter(|to| *to != from) {
                    if resolved.graph.add_edge(from.clone(), to.clone()) {
                        debug!(%from, %to, reference = %reference, "dependency edge");
                    }
                }
            }
        }

        let cycle_warnings = resolved.graph.break_cycles();
        resolved.warnings.extend(cycle_warnings);

        info!(
            domains = resolved.domains.len(),
            edges = resolved.graph.edges().len(),
            unresolved = resolved.unresolved.len(),
            "resolved affected domains"
        );
        Ok(resolved)
    }

    /// Domain a single path resolves to, with boundary promotion.
    pub fn domain_for(&self, path: &str) -> Option<DomainId> {
        let path = self.relative(path)?;
        self.resolve_path(&path, &mut ResolveCache::default(), &mut BTreeMap::new())
    }

    /// Affected domain an import reference made from `from_file` points at.
    pub fn reference_domain(
        &self,
        from_file: &str,
        reference: &str,
        affected: &BTreeSet<DomainId>,
    ) -> Option<DomainId> {
        let from_file = self.relative(from_file)?;
        self.reference_target(
            &from_file,
            reference,
            affected,
            &mut ResolveCache::default(),
            &mut BTreeMap::new(),
        )
    }

    /// Normalize to a root-relative path; `None` for paths escaping the root.
    fn relative(&self, raw: &str) -> Option<String> {
        let as_path = Path::new(raw);
        let raw = if as_path.is_absolute() {
            as_path
                .strip_prefix(&self.source_root)
                .ok()?
                .to_string_lossy()
                .into_owned()
        } else {
            raw.to_string()
        };
        let path = normalize_path(&raw);
        if path.is_empty() || path.split('/').any(|s| s == "..") {
            return None;
        }
        Some(path)
    }

    fn resolve_path(
        &self,
        path: &str,
        cache: &mut ResolveCache,
        scores: &mut BTreeMap<DomainId, BoundaryScore>,
    ) -> Option<DomainId> {
        let hit = self.map.lookup(path)?;

        let remainder = if hit.prefix.is_empty() {
            path
        } else {
            path.strip_prefix(hit.prefix.as_str())
                .map(|r| r.trim_start_matches('/'))
                .unwrap_or("")
        };
        let Some((sub, _)) = remainder.split_once('/') else {
            return Some(hit.domain);
        };
        if !self.policy.enabled {
            return Some(hit.domain);
        }

        let candidate_dir = if hit.prefix.is_empty() {
            sub.to_string()
        } else {
            format!("{}/{sub}", hit.prefix)
        };
        let Ok(candidate) = hit.domain.child(sub) else {
            return Some(hit.domain);
        };

        let score = match cache.scores.get(&candidate_dir) {
            Some(score) => *score,
            None => {
                let score = self.score_candidate(&candidate_dir, cache);
                debug!(
                    candidate = %candidate,
                    total = score.total,
                    density = score.density,
                    complexity = score.complexity,
                    coherence = score.coherence,
                    assistance = score.assistance,
                    "scored candidate sub-domain"
                );
                cache.scores.insert(candidate_dir.clone(), score);
                scores.insert(candidate.clone(), score);
                score
            }
        };

        if score.promotes(&self.policy) {
            Some(candidate)
        } else {
            Some(hit.domain)
        }
    }

    fn score_candidate(&self, dir: &str, cache: &mut ResolveCache) -> BoundaryScore {
        let files = match walk_dir(&self.source_root, &self.source_root.join(dir), &self.filter) {
            Ok(files) => files,
            Err(e) => {
                warn!(dir, error = %e, "could not walk candidate directory");
                return BoundaryScore::default();
            }
        };
        let signals: Vec<FileSignals> = files
            .iter()
            .filter_map(|f| self.signals(f, cache).cloned())
            .collect();
        score_directory(&self.policy, &signals)
    }

    fn signals<'c>(&self, path: &str, cache: &'c mut ResolveCache) -> Option<&'c FileSignals> {
        cache
            .signals
            .entry(path.to_string())
            .or_insert_with(|| {
                let full = self.source_root.join(path);
                match std::fs::read_to_string(&full) {
                    Ok(content) => Some(scan_source(&content)),
                    Err(e) => {
                        debug!(file = %path, error = %e, "no signals for file");
                        None
                    }
                }
            })
            .as_ref()
    }

    /// Affected domain a reference points into, if any.
    fn reference_target(
        &self,
        from_file: &str,
        reference: &str,
        affected: &BTreeSet<DomainId>,
        cache: &mut ResolveCache,
        scores: &mut BTreeMap<DomainId, BoundaryScore>,
    ) -> Option<DomainId> {
        if reference.starts_with('.') {
            let target = join_relative(from_file, reference)?;
            let mut domain = self.resolve_path(&target, cache, scores);
            while let Some(d) = domain {
                if affected.contains(&d) {
                    return Some(d);
                }
                domain = d.parent();
            }
            return None;
        }

        let normalized = normalize_reference(reference);
        let segments: Vec<&str> = normalized.split('.').collect();
        let mut candidates: Vec<&DomainId> = affected.iter().collect();
        candidates.sort_by(|a, b| b.depth().cmp(&a.depth()).then_with(|| a.cmp(b)));
        candidates
            .into_iter()
            .find(|d| contains_run(&segments, d.as_str()))
            .cloned()
    }
}

/// Whether `domain`'s segments appear contiguously in `segments`, ignoring case.
fn contains_run(segments: &[&str], domain: &str) -> bool {
    let wanted: Vec<&str> = domain.split('.').collect();
    if wanted.len() > segments.len() {
        return false;
    }
    segments.windows(wanted.len()).any(|window| {
        window
            .iter()
            .zip(&wanted)
            .all(|(a, b)| a.eq_ignore_ascii_case(b))
    })
}

/// Resolve `./x` or `../x` against the directory of `from_file`.
fn join_relative(from_file: &str, reference: &str) -> Option<String> {
    let mut parts: Vec<&str> = from_file.split('/').collect();
    parts.pop();
    for segment in reference.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop()?;
            }
            other => parts.push(other),
        }
    }
    (!parts.is_empty()).then(|| parts.join("/"))
}
