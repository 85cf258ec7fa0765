//! Shared types, error model, and configuration for ContextSync.
//!
//! This crate is the foundation depended on by all other ContextSync crates.
//! It provides:
//! - [`ContextSyncError`], the unified error type
//! - Domain types ([`DomainId`], [`UpdateJob`], [`RollbackRecord`], [`AnalysisResult`])
//! - Configuration ([`AppConfig`], [`OrchestratorConfig`], config loading)

pub mod config;
pub mod error;
pub mod job;
pub mod rollback;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, BoundaryConfig, BoundaryPolicy, CleanupAction, CleanupConfig, CleanupPolicy,
    CleanupTrigger, ConfigValidation, DomainMapEntry, OrchestratorConfig, PathsConfig,
    ReindexConfig, ReindexOptions, TemplateConfig, TemplateThresholds, UpdateConfig,
    UpdateOptions, config_dir, config_file_path, init_config, init_config_at, load_config,
    load_config_from,
};
pub use error::{ContextSyncError, ErrorClass, Result};
pub use job::{JobFilter, JobMetrics, JobStatus, TriggerType, UpdateJob};
pub use rollback::{
    FileOpKind, FileOperation, RollbackRecord, RollbackStatus, RollbackSummary, Snapshot,
    SnapshotFile, sha256_hex,
};
pub use types::{
    AnalysisResult, CONTEXT_FILE_NAME, ContextArtifact, DomainId, JobId, TemplateTier,
    language_for_path,
};
