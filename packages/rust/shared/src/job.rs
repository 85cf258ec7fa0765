//! Update job model and its state machine.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ContextSyncError, Result};
use crate::types::{DomainId, JobId};

// ---------------------------------------------------------------------------
// TriggerType
// ---------------------------------------------------------------------------

/// What caused an update to be requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TriggerType {
    Manual,
    GitHook,
    Scheduled,
    FullReindex,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::GitHook => "git-hook",
            Self::Scheduled => "scheduled",
            Self::FullReindex => "full-reindex",
        }
    }
}

impl std::fmt::Display for TriggerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TriggerType {
    type Err = ContextSyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "manual" => Ok(Self::Manual),
            "git-hook" => Ok(Self::GitHook),
            "scheduled" => Ok(Self::Scheduled),
            "full-reindex" => Ok(Self::FullReindex),
            other => Err(ContextSyncError::validation(format!(
                "unknown trigger type '{other}'"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// JobStatus
// ---------------------------------------------------------------------------

/// Lifecycle state of an update job.
///
/// ```text
/// queued → snapshotting → analyzing → generating → committing → completed
///    │          │             │            │            │
///    └──────────┴─────────────┴────────────┴────────────┴──→ failed → rolling-back → rolled-back
/// queued | analyzing | generating ──→ cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobStatus {
    Queued,
    Snapshotting,
    Analyzing,
    Generating,
    Committing,
    Completed,
    Failed,
    RollingBack,
    RolledBack,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Snapshotting => "snapshotting",
            Self::Analyzing => "analyzing",
            Self::Generating => "generating",
            Self::Committing => "committing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::RollingBack => "rolling-back",
            Self::RolledBack => "rolled-back",
            Self::Cancelled => "cancelled",
        }
    }

    /// Terminal states. `Failed` is terminal but may still enter `RollingBack`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::RolledBack | Self::Cancelled
        )
    }

    /// States from which an external cancellation is honored.
    pub fn is_cancellable(&self) -> bool {
        matches!(
            self,
            Self::Queued | Self::Snapshotting | Self::Analyzing | Self::Generating
        )
    }

    /// Whether the state machine permits `self → next`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Queued, Snapshotting)
            | (Snapshotting, Analyzing)
            | (Analyzing, Generating)
            | (Generating, Committing)
            | (Committing, Completed)
            | (Failed, RollingBack)
            | (RollingBack, RolledBack)
            | (RollingBack, Failed) => true,
            (Queued | Analyzing | Generating, Cancelled) => true,
            (from, Failed) => !from.is_terminal() && *from != RollingBack,
            _ => false,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = ContextSyncError;

    fn from_str(s: &str) -> Result<Self> {
        let status = match s {
            "queued" => Self::Queued,
            "snapshotting" => Self::Snapshotting,
            "analyzing" => Self::Analyzing,
            "generating" => Self::Generating,
            "committing" => Self::Committing,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "rolling-back" => Self::RollingBack,
            "rolled-back" => Self::RolledBack,
            "cancelled" => Self::Cancelled,
            other => {
                return Err(ContextSyncError::validation(format!(
                    "unknown job status '{other}'"
                )));
            }
        };
        Ok(status)
    }
}

// ---------------------------------------------------------------------------
// JobMetrics
// ---------------------------------------------------------------------------

/// Counters recorded while a job runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMetrics {
    /// Files handed to the analysis stage.
    pub files_discovered: usize,
    /// Files that produced an analysis result.
    pub files_analyzed: usize,
    /// Files whose analysis failed.
    pub files_failed: usize,
    /// Files skipped because the batch deadline fired.
    pub files_skipped: usize,
    /// Context files written during commit.
    pub context_files_generated: usize,
    /// Stale or orphaned context files removed during commit.
    pub context_files_removed: usize,
    /// Total wall-clock time of the job.
    pub execution_time_ms: u64,
}

impl JobMetrics {
    /// Ratio of analyzed files to discovered files (1.0 when nothing was discovered).
    pub fn coverage_ratio(&self) -> f64 {
        if self.files_discovered == 0 {
            1.0
        } else {
            self.files_analyzed as f64 / self.files_discovered as f64
        }
    }
}

// ---------------------------------------------------------------------------
// UpdateJob
// ---------------------------------------------------------------------------

/// One holistic update request and its progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateJob {
    pub id: JobId,
    pub trigger_type: TriggerType,
    /// Changed files, relative to the source root, in submission order.
    pub changed_files: Vec<String>,
    pub affected_domains: BTreeSet<DomainId>,
    pub status: JobStatus,
    /// Source control revision the change set came from, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub errors: Vec<String>,
    /// Non-fatal notes (dropped dependency edges, skipped files).
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub metrics: JobMetrics,
}

impl UpdateJob {
    /// A freshly accepted job in `queued` state.
    pub fn new(
        trigger_type: TriggerType,
        changed_files: Vec<String>,
        affected_domains: BTreeSet<DomainId>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            trigger_type,
            changed_files,
            affected_domains,
            status: JobStatus::Queued,
            revision: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            errors: Vec::new(),
            warnings: Vec::new(),
            metrics: JobMetrics::default(),
        }
    }
}

/// Filter for listing jobs.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub trigger_type: Option<TriggerType>,
    /// Maximum number of jobs returned, newest first.
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn matches(&self, job: &UpdateJob) -> bool {
        self.status.is_none_or(|s| s == job.status)
            && self.trigger_type.is_none_or(|t| t == job.trigger_type)
    }
}
