//! Update orchestration for ContextSync.
//!
//! Ties discovery, analysis, generation, and the snapshot store together
//! into update jobs driven by [`Orchestrator`]:
//!
//! - [`AnalysisStage`] runs the [`SemanticAnalyzer`] per file on a bounded pool
//! - [`generate_all`] runs the [`ContextGenerator`] per domain in dependency order
//! - [`SnapshotStore`] captures and restores artifact directories
//! - [`JobRegistry`] tracks job state and cancellation

pub mod analysis;
pub mod generation;
pub mod orchestrator;
pub mod registry;
pub mod retry;
pub mod snapshot;

pub use analysis::{
    AnalysisBatch, AnalysisFailure, AnalysisFailureKind, AnalysisStage, FileAnalysis,
    HeuristicAnalyzer, SemanticAnalyzer,
};
pub use generation::{
    ContextGenerator, DomainGeneration, GenerationOutcome, TemplateGenerator, assign_results,
    generate_all,
};
pub use orchestrator::{Collaborators, Orchestrator, RecoveryReport, RollbackOutcome};
pub use registry::{JobPatch, JobRegistry, SilentListener, StatusListener};
pub use retry::{RetryPolicy, retry_transient};
pub use snapshot::{CleanupReport, DomainLocks, RestoreReport, SnapshotOutcome, SnapshotStore};
