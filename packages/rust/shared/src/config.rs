//! Application configuration for ContextSync.
//!
//! User config lives at `~/.contextsync/contextsync.toml`.
//! CLI flags override config file values, which override defaults.
//! Nothing here is global: the CLI loads an [`AppConfig`], derives the
//! runtime structs from it, and hands them to constructors.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ContextSyncError, Result};
use crate::types::DomainId;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "contextsync.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".contextsync";

// ---------------------------------------------------------------------------
// Config structs (matching contextsync.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub update: UpdateConfig,

    #[serde(default)]
    pub reindex: ReindexConfig,

    /// Granular boundary scoring policy.
    #[serde(default)]
    pub boundary: BoundaryConfig,

    #[serde(default)]
    pub templates: TemplateConfig,

    /// Rollback record and job retention.
    #[serde(default)]
    pub cleanup: CleanupConfig,

    /// Path prefix → domain table, most specific prefix wins.
    #[serde(default)]
    pub domains: Vec<DomainMapEntry>,
}

/// `[paths]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Root of the source tree that changed paths are relative to.
    #[serde(default = "default_source_root")]
    pub source_root: String,

    /// Root of the generated context tree.
    #[serde(default = "default_artifact_root")]
    pub artifact_root: String,

    /// libSQL database holding jobs and rollback records.
    #[serde(default = "default_state_db")]
    pub state_db: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            source_root: default_source_root(),
            artifact_root: default_artifact_root(),
            state_db: default_state_db(),
        }
    }
}

fn default_source_root() -> String {
    ".".into()
}
fn default_artifact_root() -> String {
    ".contextsync/context".into()
}
fn default_state_db() -> String {
    ".contextsync/state.db".into()
}

/// `[update]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateConfig {
    /// Worker pool size for analysis and generation.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Wall-clock budget for the whole analysis batch.
    #[serde(default = "default_performance_timeout_secs")]
    pub performance_timeout_secs: u64,

    /// Budget for a single file analysis.
    #[serde(default = "default_file_timeout_ms")]
    pub file_timeout_ms: u64,

    /// Retries for transient errors inside one stage.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay between retries, doubled per attempt.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Restore snapshots automatically when a job fails.
    #[serde(default = "default_true")]
    pub auto_rollback: bool,

    /// Remove stale files in affected domain directories before writing.
    #[serde(default)]
    pub cleanup_first: bool,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            performance_timeout_secs: default_performance_timeout_secs(),
            file_timeout_ms: default_file_timeout_ms(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            auto_rollback: true,
            cleanup_first: false,
        }
    }
}

fn default_max_concurrency() -> usize {
    3
}
fn default_performance_timeout_secs() -> u64 {
    15
}
fn default_file_timeout_ms() -> u64 {
    5_000
}
fn default_max_retries() -> u32 {
    2
}
fn default_retry_backoff_ms() -> u64 {
    50
}
fn default_true() -> bool {
    true
}

/// `[reindex]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReindexConfig {
    /// Extensions (without dot) considered source files.
    #[serde(default = "default_file_extensions")]
    pub file_extensions: Vec<String>,

    /// Glob patterns excluded from the walk, relative to the source root.
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
}

impl Default for ReindexConfig {
    fn default() -> Self {
        Self {
            file_extensions: default_file_extensions(),
            exclude_patterns: Vec::new(),
        }
    }
}

fn default_file_extensions() -> Vec<String> {
    ["cs", "rs", "ts", "js", "py", "go", "java", "kt"]
        .into_iter()
        .map(String::from)
        .collect()
}

/// `[boundary]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundaryConfig {
    /// Disable to always roll files up to the mapped domain.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Score a sub-directory must strictly exceed to become a sub-domain.
    #[serde(default = "default_boundary_threshold")]
    pub threshold: f64,

    #[serde(default = "default_density_weight")]
    pub density_weight: f64,

    #[serde(default = "default_complexity_weight")]
    pub complexity_weight: f64,

    #[serde(default = "default_coherence_weight")]
    pub coherence_weight: f64,

    #[serde(default = "default_assistance_weight")]
    pub assistance_weight: f64,

    /// Concepts per file at which the density signal saturates to 1.0.
    #[serde(default = "default_concept_saturation")]
    pub concept_saturation: f64,

    /// Branches per file at which the complexity signal saturates to 1.0.
    #[serde(default = "default_complexity_saturation")]
    pub complexity_saturation: f64,

    /// Concepts plus rules across the directory at which assistance value saturates.
    #[serde(default = "default_assistance_saturation")]
    pub assistance_saturation: f64,
}

impl Default for BoundaryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: default_boundary_threshold(),
            density_weight: default_density_weight(),
            complexity_weight: default_complexity_weight(),
            coherence_weight: default_coherence_weight(),
            assistance_weight: default_assistance_weight(),
            concept_saturation: default_concept_saturation(),
            complexity_saturation: default_complexity_saturation(),
            assistance_saturation: default_assistance_saturation(),
        }
    }
}

fn default_boundary_threshold() -> f64 {
    0.7
}
fn default_density_weight() -> f64 {
    0.35
}
fn default_complexity_weight() -> f64 {
    0.25
}
fn default_coherence_weight() -> f64 {
    0.2
}
fn default_assistance_weight() -> f64 {
    0.2
}
fn default_concept_saturation() -> f64 {
    4.0
}
fn default_complexity_saturation() -> f64 {
    8.0
}
fn default_assistance_saturation() -> f64 {
    12.0
}

/// `[templates]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateConfig {
    /// Concepts plus rules at which a domain uses the medium template.
    #[serde(default = "default_medium_threshold")]
    pub medium_threshold: usize,

    /// Concepts plus rules at which a domain uses the high template.
    #[serde(default = "default_high_threshold")]
    pub high_threshold: usize,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self {
            medium_threshold: default_medium_threshold(),
            high_threshold: default_high_threshold(),
        }
    }
}

fn default_medium_threshold() -> usize {
    8
}
fn default_high_threshold() -> usize {
    20
}

/// One cleanup pass the snapshot store can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CleanupAction {
    /// Remove settled records older than `max_age_hours`.
    Age,
    /// Keep at most `max_count` settled records.
    Count,
    /// Remove failed records older than `failed_age_hours`.
    Failed,
}

/// `[cleanup]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    #[serde(default = "default_max_age_hours")]
    pub max_age_hours: u64,

    #[serde(default = "default_max_count")]
    pub max_count: usize,

    /// Count cleanup keeps the newest records when true, the oldest otherwise.
    #[serde(default = "default_true")]
    pub keep_newest: bool,

    #[serde(default = "default_failed_age_hours")]
    pub failed_age_hours: u64,

    #[serde(default = "default_after_success")]
    pub after_success: Vec<CleanupAction>,

    #[serde(default)]
    pub after_failure: Vec<CleanupAction>,

    #[serde(default = "default_on_startup")]
    pub on_startup: Vec<CleanupAction>,

    #[serde(default = "default_manual")]
    pub manual: Vec<CleanupAction>,

    /// Terminal jobs older than this are pruned from the registry.
    #[serde(default = "default_job_max_age_hours")]
    pub job_max_age_hours: u64,

    /// Terminal jobs kept in the registry, newest first.
    #[serde(default = "default_job_max_count")]
    pub job_max_count: usize,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            max_age_hours: default_max_age_hours(),
            max_count: default_max_count(),
            keep_newest: true,
            failed_age_hours: default_failed_age_hours(),
            after_success: default_after_success(),
            after_failure: Vec::new(),
            on_startup: default_on_startup(),
            manual: default_manual(),
            job_max_age_hours: default_job_max_age_hours(),
            job_max_count: default_job_max_count(),
        }
    }
}

fn default_max_age_hours() -> u64 {
    24 * 7
}
fn default_max_count() -> usize {
    50
}
fn default_failed_age_hours() -> u64 {
    24 * 30
}
fn default_after_success() -> Vec<CleanupAction> {
    vec![CleanupAction::Count]
}
fn default_on_startup() -> Vec<CleanupAction> {
    vec![CleanupAction::Age, CleanupAction::Failed]
}
fn default_manual() -> Vec<CleanupAction> {
    vec![CleanupAction::Age, CleanupAction::Count, CleanupAction::Failed]
}
fn default_job_max_age_hours() -> u64 {
    24 * 30
}
fn default_job_max_count() -> usize {
    500
}

/// `[[domains]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainMapEntry {
    /// Path prefix relative to the source root, `/`-separated.
    pub prefix: String,
    /// Dotted domain identifier.
    pub domain: String,
}

// ---------------------------------------------------------------------------
// Runtime structs (derived from AppConfig, passed to constructors)
// ---------------------------------------------------------------------------

/// Weighted sub-domain promotion policy used by the resolver.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundaryPolicy {
    pub enabled: bool,
    pub threshold: f64,
    pub density_weight: f64,
    pub complexity_weight: f64,
    pub coherence_weight: f64,
    pub assistance_weight: f64,
    pub concept_saturation: f64,
    pub complexity_saturation: f64,
    pub assistance_saturation: f64,
}

impl Default for BoundaryPolicy {
    fn default() -> Self {
        Self::from(&BoundaryConfig::default())
    }
}

impl From<&BoundaryConfig> for BoundaryPolicy {
    fn from(config: &BoundaryConfig) -> Self {
        Self {
            enabled: config.enabled,
            threshold: config.threshold,
            density_weight: config.density_weight,
            complexity_weight: config.complexity_weight,
            coherence_weight: config.coherence_weight,
            assistance_weight: config.assistance_weight,
            concept_saturation: config.concept_saturation,
            complexity_saturation: config.complexity_saturation,
            assistance_saturation: config.assistance_saturation,
        }
    }
}

/// Tier thresholds for context rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TemplateThresholds {
    pub medium: usize,
    pub high: usize,
}

impl Default for TemplateThresholds {
    fn default() -> Self {
        Self::from(&TemplateConfig::default())
    }
}

impl From<&TemplateConfig> for TemplateThresholds {
    fn from(config: &TemplateConfig) -> Self {
        Self {
            medium: config.medium_threshold,
            high: config.high_threshold,
        }
    }
}

/// What caused a cleanup run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CleanupTrigger {
    AfterSuccess,
    AfterFailure,
    Startup,
    Manual,
}

impl std::fmt::Display for CleanupTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::AfterSuccess => "after-success",
            Self::AfterFailure => "after-failure",
            Self::Startup => "startup",
            Self::Manual => "manual",
        };
        f.write_str(s)
    }
}

/// Retention limits for rollback records and job history.
#[derive(Debug, Clone, PartialEq)]
pub struct CleanupPolicy {
    pub max_age_hours: u64,
    pub max_count: usize,
    pub keep_newest: bool,
    pub failed_age_hours: u64,
    pub after_success: Vec<CleanupAction>,
    pub after_failure: Vec<CleanupAction>,
    pub on_startup: Vec<CleanupAction>,
    pub manual: Vec<CleanupAction>,
    pub job_max_age_hours: u64,
    pub job_max_count: usize,
}

impl CleanupPolicy {
    /// Cleanup passes enabled for a trigger.
    pub fn actions_for(&self, trigger: CleanupTrigger) -> &[CleanupAction] {
        match trigger {
            CleanupTrigger::AfterSuccess => &self.after_success,
            CleanupTrigger::AfterFailure => &self.after_failure,
            CleanupTrigger::Startup => &self.on_startup,
            CleanupTrigger::Manual => &self.manual,
        }
    }
}

impl Default for CleanupPolicy {
    fn default() -> Self {
        Self::from(&CleanupConfig::default())
    }
}

impl From<&CleanupConfig> for CleanupPolicy {
    fn from(config: &CleanupConfig) -> Self {
        Self {
            max_age_hours: config.max_age_hours,
            max_count: config.max_count,
            keep_newest: config.keep_newest,
            failed_age_hours: config.failed_age_hours,
            after_success: config.after_success.clone(),
            after_failure: config.after_failure.clone(),
            on_startup: config.on_startup.clone(),
            manual: config.manual.clone(),
            job_max_age_hours: config.job_max_age_hours,
            job_max_count: config.job_max_count,
        }
    }
}

/// Runtime orchestrator configuration, merged from the config file.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Root of the source tree; changed paths are relative to it.
    pub source_root: PathBuf,
    pub max_concurrency: usize,
    /// Deadline for the whole analysis batch.
    pub performance_timeout: Duration,
    pub file_timeout: Duration,
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub auto_rollback: bool,
    pub cleanup_first: bool,
    pub file_extensions: Vec<String>,
    pub exclude_patterns: Vec<String>,
    pub templates: TemplateThresholds,
    pub cleanup: CleanupPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for OrchestratorConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            source_root: PathBuf::from(&config.paths.source_root),
            max_concurrency: config.update.max_concurrency,
            performance_timeout: Duration::from_secs(config.update.performance_timeout_secs),
            file_timeout: Duration::from_millis(config.update.file_timeout_ms),
            max_retries: config.update.max_retries,
            retry_backoff: Duration::from_millis(config.update.retry_backoff_ms),
            auto_rollback: config.update.auto_rollback,
            cleanup_first: config.update.cleanup_first,
            file_extensions: config.reindex.file_extensions.clone(),
            exclude_patterns: config.reindex.exclude_patterns.clone(),
            templates: TemplateThresholds::from(&config.templates),
            cleanup: CleanupPolicy::from(&config.cleanup),
        }
    }
}

/// Per-submission overrides for an incremental update.
#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    pub cleanup_first: Option<bool>,
    pub max_concurrency: Option<usize>,
    pub performance_timeout_secs: Option<u64>,
    /// Source control revision the change set was read from.
    pub revision: Option<String>,
}

/// Per-submission overrides for a full reindex.
#[derive(Debug, Clone, Default)]
pub struct ReindexOptions {
    pub file_extensions: Option<Vec<String>>,
    pub exclude_patterns: Option<Vec<String>>,
    pub cleanup_first: Option<bool>,
    pub max_concurrency: Option<usize>,
}

/// Outcome of a configuration check.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConfigValidation {
    pub valid: bool,
    pub issues: Vec<String>,
}

impl ConfigValidation {
    pub fn from_issues(issues: Vec<String>) -> Self {
        Self {
            valid: issues.is_empty(),
            issues,
        }
    }

    /// Convert into a `Validation` error listing every issue.
    pub fn into_result(self) -> Result<()> {
        if self.valid {
            Ok(())
        } else {
            Err(ContextSyncError::validation(self.issues.join("; ")))
        }
    }
}

impl OrchestratorConfig {
    /// Collect every issue with this configuration merged with `options`.
    pub fn check(&self, options: &UpdateOptions) -> ConfigValidation {
        let mut issues = Vec::new();
        let concurrency = options.max_concurrency.unwrap_or(self.max_concurrency);
        if concurrency == 0 {
            issues.push("max_concurrency must be at least 1".to_string());
        }
        let timeout = options
            .performance_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.performance_timeout);
        if timeout.is_zero() {
            issues.push("performance timeout must be greater than zero".to_string());
        }
        if self.file_timeout.is_zero() {
            issues.push("file timeout must be greater than zero".to_string());
        }
        if self.templates.medium > self.templates.high {
            issues.push(format!(
                "template medium threshold ({}) exceeds high threshold ({})",
                self.templates.medium, self.templates.high
            ));
        }
        if !self.source_root.is_dir() {
            issues.push(format!(
                "source root {} is not a directory",
                self.source_root.display()
            ));
        }
        ConfigValidation::from_issues(issues)
    }
}

impl AppConfig {
    /// Structural checks that do not touch the filesystem.
    pub fn validate(&self) -> ConfigValidation {
        let mut issues = Vec::new();
        let b = &self.boundary;
        if !(0.0..=1.0).contains(&b.threshold) {
            issues.push(format!("boundary.threshold {} is outside [0, 1]", b.threshold));
        }
        let weights = [
            ("density_weight", b.density_weight),
            ("complexity_weight", b.complexity_weight),
            ("coherence_weight", b.coherence_weight),
            ("assistance_weight", b.assistance_weight),
        ];
        for (name, w) in weights {
            if w < 0.0 {
                issues.push(format!("boundary.{name} must not be negative"));
            }
        }
        if weights.iter().map(|(_, w)| w).sum::<f64>() <= 0.0 {
            issues.push("boundary weights must not all be zero".to_string());
        }
        for (name, s) in [
            ("concept_saturation", b.concept_saturation),
            ("complexity_saturation", b.complexity_saturation),
            ("assistance_saturation", b.assistance_saturation),
        ] {
            if s <= 0.0 {
                issues.push(format!("boundary.{name} must be positive"));
            }
        }
        if self.update.max_concurrency == 0 {
            issues.push("update.max_concurrency must be at least 1".to_string());
        }
        if self.update.performance_timeout_secs == 0 {
            issues.push("update.performance_timeout_secs must be greater than zero".to_string());
        }
        if self.templates.medium_threshold > self.templates.high_threshold {
            issues.push("templates.medium_threshold exceeds templates.high_threshold".to_string());
        }
        for entry in &self.domains {
            if let Err(e) = DomainId::new(entry.domain.as_str()) {
                issues.push(format!("domains '{}': {e}", entry.prefix));
            }
        }
        ConfigValidation::from_issues(issues)
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.contextsync/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| ContextSyncError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.contextsync/contextsync.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| ContextSyncError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| ContextSyncError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Write a default config file to `path`, creating parent directories.
pub fn init_config_at(path: &Path) -> Result<PathBuf> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| ContextSyncError::io(dir, e))?;
    }

    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| ContextSyncError::config(e.to_string()))?;

    std::fs::write(path, content).map_err(|e| ContextSyncError::io(path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path.to_path_buf())
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    init_config_at(&config_file_path()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("artifact_root"));
        assert!(toml_str.contains("max_concurrency"));
        assert!(toml_str.contains("threshold"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.update.max_concurrency, 3);
        assert_eq!(parsed.update.performance_timeout_secs, 15);
        assert_eq!(parsed.cleanup.manual.len(), 3);
    }

    #[test]
    fn config_with_domains_and_overrides() {
        let toml_str = r#"
[update]
max_concurrency = 2

[boundary]
threshold = 0.5

[cleanup]
after_success = ["age", "count"]

[[domains]]
prefix = "src/Analysis"
domain = "Analysis"

[[domains]]
prefix = "src/Data/Provider"
domain = "Data.Provider"
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.domains.len(), 2);
        assert_eq!(config.domains[1].domain, "Data.Provider");
        assert_eq!(config.update.max_concurrency, 2);
        assert_eq!(config.update.performance_timeout_secs, 15);
        assert!((config.boundary.threshold - 0.5).abs() < f64::EPSILON);
        assert_eq!(
            config.cleanup.after_success,
            vec![CleanupAction::Age, CleanupAction::Count]
        );
        assert!(config.validate().valid);
    }

    #[test]
    fn validate_reports_every_issue() {
        let mut config = AppConfig::default();
        config.boundary.threshold = 1.5;
        config.update.max_concurrency = 0;
        config.domains.push(DomainMapEntry {
            prefix: "src/x".into(),
            domain: "bad..id".into(),
        });
        let report = config.validate();
        assert!(!report.valid);
        assert_eq!(report.issues.len(), 3);
        assert!(report.into_result().is_err());
    }

    #[test]
    fn orchestrator_config_check_merges_options() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = OrchestratorConfig {
            source_root: dir.path().to_path_buf(),
            ..OrchestratorConfig::default()
        };
        assert!(config.check(&UpdateOptions::default()).valid);

        let bad = UpdateOptions {
            max_concurrency: Some(0),
            performance_timeout_secs: Some(0),
            ..Default::default()
        };
        let report = config.check(&bad);
        assert_eq!(report.issues.len(), 2);
    }

    #[test]
    fn cleanup_actions_per_trigger() {
        let policy = CleanupPolicy::default();
        assert_eq!(
            policy.actions_for(CleanupTrigger::AfterSuccess),
            &[CleanupAction::Count]
        );
        assert!(policy.actions_for(CleanupTrigger::AfterFailure).is_empty());
    }

    #[test]
    fn init_config_at_writes_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join(CONFIG_FILE_NAME);
        init_config_at(&path).expect("init");
        let loaded = load_config_from(&path).expect("load");
        assert_eq!(loaded.templates.high_threshold, 20);
    }
}
