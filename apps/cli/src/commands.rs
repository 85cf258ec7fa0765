//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use contextsync_core::{Collaborators, Orchestrator, RollbackOutcome, StatusListener};
use contextsync_discovery::PrefixDomainMap;
use contextsync_shared::{
    AppConfig, BoundaryPolicy, CleanupTrigger, JobFilter, JobId, JobStatus, OrchestratorConfig,
    ReindexOptions, TemplateThresholds, TriggerType, UpdateJob, UpdateOptions, init_config,
    init_config_at, load_config, load_config_from,
};
use contextsync_storage::Storage;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// ContextSync: keep domain context documents in step with the code.
#[derive(Parser)]
#[command(
    name = "contextsync",
    version,
    about = "Regenerate per-domain context documents from changed source files, with rollback.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Config file (defaults to ~/.contextsync/contextsync.toml).
    #[arg(long, global = true, env = "CONTEXTSYNC_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Regenerate context for the domains touched by a set of changed files.
    Update {
        /// Changed files, relative to the source root.
        files: Vec<String>,

        /// Take the changed files from `git diff --name-only <REV>`.
        #[arg(long, value_name = "REV")]
        git: Option<String>,

        /// What triggered this update: manual, git-hook, or scheduled.
        #[arg(long, default_value = "manual")]
        trigger: TriggerType,

        /// Remove stale files from affected domain directories.
        #[arg(long)]
        cleanup_first: bool,

        /// Maximum files analyzed in parallel.
        #[arg(long)]
        max_concurrency: Option<usize>,

        /// Analysis deadline in seconds.
        #[arg(long)]
        timeout: Option<u64>,

        /// Print the finished job as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Regenerate context for every domain in the source tree.
    Reindex {
        /// File extensions to include (repeatable). Defaults to config.
        #[arg(long = "ext")]
        extensions: Vec<String>,

        /// Glob patterns to exclude (repeatable). Defaults to config.
        #[arg(long)]
        exclude: Vec<String>,

        /// Remove stale files and domains that no longer exist.
        #[arg(long)]
        cleanup_first: bool,

        /// Maximum files analyzed in parallel.
        #[arg(long)]
        max_concurrency: Option<usize>,

        /// Print the finished job as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show one job.
    Status {
        /// Job ID.
        job: JobId,

        /// Print as JSON.
        #[arg(long)]
        json: bool,
    },

    /// List recent jobs, newest first.
    Jobs {
        /// Only jobs in this status.
        #[arg(long)]
        status: Option<JobStatus>,

        /// Only jobs with this trigger.
        #[arg(long)]
        trigger: Option<TriggerType>,

        /// Maximum number of jobs shown.
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,

        /// Print as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Restore the context tree captured before a failed job.
    Rollback {
        /// Job ID.
        job: JobId,
    },

    /// Run rollback-record cleanup and prune job history.
    Maintenance,

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
    /// Check the configuration for invalid values.
    Validate,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "contextsync=info",
        1 => "contextsync=debug",
        _ => "contextsync=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.as_deref();
    match cli.command {
        Command::Update {
            files,
            git,
            trigger,
            cleanup_first,
            max_concurrency,
            timeout,
            json,
        } => {
            let options = UpdateOptions {
                cleanup_first: cleanup_first.then_some(true),
                max_concurrency,
                performance_timeout_secs: timeout,
                revision: git.clone(),
            };
            cmd_update(config_path, files, git.as_deref(), trigger, options, json).await
        }
        Command::Reindex {
            extensions,
            exclude,
            cleanup_first,
            max_concurrency,
            json,
        } => {
            let options = ReindexOptions {
                file_extensions: (!extensions.is_empty()).then_some(extensions),
                exclude_patterns: (!exclude.is_empty()).then_some(exclude),
                cleanup_first: cleanup_first.then_some(true),
                max_concurrency,
            };
            cmd_reindex(config_path, options, json).await
        }
        Command::Status { job, json } => cmd_status(config_path, &job, json).await,
        Command::Jobs {
            status,
            trigger,
            limit,
            json,
        } => {
            let filter = JobFilter {
                status,
                trigger_type: trigger,
                limit: Some(limit),
            };
            cmd_jobs(config_path, &filter, json).await
        }
        Command::Rollback { job } => cmd_rollback(config_path, &job).await,
        Command::Maintenance => cmd_maintenance(config_path).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(config_path),
            ConfigAction::Show => cmd_config_show(config_path),
            ConfigAction::Validate => cmd_config_validate(config_path),
        },
    }
}

// ---------------------------------------------------------------------------
// Orchestrator setup
// ---------------------------------------------------------------------------

fn read_config(path: Option<&Path>) -> Result<AppConfig> {
    let config = match path {
        Some(p) => load_config_from(p)?,
        None => load_config()?,
    };
    Ok(config)
}

/// How a command uses the state database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    /// Status queries: the database is opened read-only and must exist.
    Query,
    /// Commands that run or roll back jobs. Jobs and rollback records left
    /// in flight by an earlier process are marked failed first, which
    /// assumes no other `contextsync` process is using the same database.
    Mutate,
}

/// Build an orchestrator from config.
async fn open(
    config_path: Option<&Path>,
    listener: Option<Arc<dyn StatusListener>>,
    access: Access,
) -> Result<Orchestrator> {
    let config = read_config(config_path)?;
    config.validate().into_result()?;

    let state_db = Path::new(&config.paths.state_db);
    let storage = match access {
        Access::Query => Storage::open_readonly(state_db).await?,
        Access::Mutate => Storage::open(state_db).await?,
    };
    let storage = Arc::new(storage);
    let domain_map = Arc::new(PrefixDomainMap::from_config(&config.domains)?);
    let mut collaborators = Collaborators::defaults(
        &config.paths.artifact_root,
        domain_map,
        TemplateThresholds::from(&config.templates),
    );
    if let Some(listener) = listener {
        collaborators = collaborators.with_listener(listener);
    }

    let orchestrator = Orchestrator::new(
        OrchestratorConfig::from(&config),
        BoundaryPolicy::from(&config.boundary),
        storage,
        collaborators,
    )?;

    if access == Access::Mutate {
        let report = orchestrator.recover().await?;
        if report.jobs_failed + report.rollback_records_failed > 0 {
            warn!(
                jobs = report.jobs_failed,
                rollback_records = report.rollback_records_failed,
                "marked interrupted work as failed; see `contextsync jobs --status failed`"
            );
        }
        for error in &report.cleanup.errors {
            warn!(error = %error, "startup cleanup");
        }
    }
    Ok(orchestrator)
}

/// Changed paths from `git diff --name-only <rev>`, relative to `source_root`.
async fn git_changed_files(source_root: &Path, rev: &str) -> Result<Vec<String>> {
    let output = tokio::process::Command::new("git")
        .args(["diff", "--name-only", "--relative", rev])
        .current_dir(source_root)
        .output()
        .await
        .map_err(|e| eyre!("failed to run git: {e}"))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(eyre!("git diff {rev} failed: {}", stderr.trim()));
    }

    Ok(String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect())
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_update(
    config_path: Option<&Path>,
    mut files: Vec<String>,
    git: Option<&str>,
    trigger: TriggerType,
    options: UpdateOptions,
    json: bool,
) -> Result<()> {
    let progress = Arc::new(CliProgress::new());
    let orchestrator = open(config_path, Some(progress.clone()), Access::Mutate).await?;

    if let Some(rev) = git {
        let changed = git_changed_files(&orchestrator.config().source_root, rev).await?;
        info!(rev, count = changed.len(), "collected changed files from git");
        files.extend(changed);
    }
    if files.is_empty() {
        progress.clear();
        println!("No changed files; nothing to update.");
        return Ok(());
    }

    info!(files = files.len(), trigger = %trigger, "submitting update");
    let id = orchestrator.submit_update(files, trigger, options).await?;
    let job = wait_interruptible(&orchestrator, &id).await?;
    progress.clear();
    finish(&job, json)
}

async fn cmd_reindex(config_path: Option<&Path>, options: ReindexOptions, json: bool) -> Result<()> {
    let progress = Arc::new(CliProgress::new());
    let orchestrator = open(config_path, Some(progress.clone()), Access::Mutate).await?;

    info!("submitting full reindex");
    let id = orchestrator.submit_full_reindex(options).await?;
    let job = wait_interruptible(&orchestrator, &id).await?;
    progress.clear();
    finish(&job, json)
}

/// Wait for a job; Ctrl-C requests cancellation and keeps waiting for the
/// job to wind down.
async fn wait_interruptible(orchestrator: &Orchestrator, id: &JobId) -> Result<UpdateJob> {
    let watcher = {
        let orchestrator = orchestrator.clone();
        let id = id.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!(job_id = %id, "interrupt received, cancelling job");
                orchestrator.cancel_job(&id);
            }
        })
    };
    let job = orchestrator.wait(id).await;
    watcher.abort();
    Ok(job?)
}

/// Print the job and turn a non-completed outcome into an error exit.
fn finish(job: &UpdateJob, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(job)?);
    } else {
        print_job(job);
    }
    match job.status {
        JobStatus::Completed => Ok(()),
        JobStatus::Failed => Err(eyre!(
            "job {} failed; run `contextsync rollback {}` to restore the previous context",
            job.id,
            job.id
        )),
        other => Err(eyre!("job {} finished {other}", job.id)),
    }
}

async fn cmd_status(config_path: Option<&Path>, id: &JobId, json: bool) -> Result<()> {
    let orchestrator = open(config_path, None, Access::Query).await?;
    let job = orchestrator.get_job_status(id).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&job)?);
    } else {
        print_job(&job);
    }
    Ok(())
}

async fn cmd_jobs(config_path: Option<&Path>, filter: &JobFilter, json: bool) -> Result<()> {
    let orchestrator = open(config_path, None, Access::Query).await?;
    let jobs = orchestrator.list_jobs(filter).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&jobs)?);
        return Ok(());
    }
    if jobs.is_empty() {
        println!("No jobs.");
        return Ok(());
    }
    for job in &jobs {
        println!(
            "{}  {:<12} {:<12} {:>3} domains  {}",
            job.id,
            job.status.as_str(),
            job.trigger_type.as_str(),
            job.affected_domains.len(),
            job.created_at.format("%Y-%m-%d %H:%M:%S"),
        );
    }
    Ok(())
}

async fn cmd_rollback(config_path: Option<&Path>, id: &JobId) -> Result<()> {
    let orchestrator = open(config_path, None, Access::Mutate).await?;
    match orchestrator.rollback_job(id).await? {
        RollbackOutcome::RolledBack {
            files_restored,
            files_removed,
        } => {
            println!();
            println!("  Job {id} rolled back.");
            println!("  Restored: {files_restored}");
            println!("  Removed:  {files_removed}");
            println!();
            Ok(())
        }
        RollbackOutcome::NotRollbackable { status, reason } => {
            Err(eyre!("job {id} ({status}) cannot be rolled back: {reason}"))
        }
        RollbackOutcome::Failed { error } => Err(eyre!(
            "rollback of {id} failed, manual intervention required: {error}"
        )),
    }
}

async fn cmd_maintenance(config_path: Option<&Path>) -> Result<()> {
    let orchestrator = open(config_path, None, Access::Mutate).await?;
    let report = orchestrator.perform_maintenance(CleanupTrigger::Manual).await;

    println!();
    println!("  Rollback records removed: {}", report.removed_count);
    println!("  Jobs pruned:              {}", report.jobs_pruned);
    for error in &report.errors {
        println!("  error: {error}");
    }
    println!();
    Ok(())
}

fn cmd_config_init(config_path: Option<&Path>) -> Result<()> {
    let path = match config_path {
        Some(p) => init_config_at(p)?,
        None => init_config()?,
    };
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(config_path: Option<&Path>) -> Result<()> {
    let config = read_config(config_path)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

fn cmd_config_validate(config_path: Option<&Path>) -> Result<()> {
    let config = read_config(config_path)?;
    let mut issues = config.validate().issues;
    issues.extend(
        OrchestratorConfig::from(&config)
            .check(&UpdateOptions::default())
            .issues,
    );
    issues.dedup();

    if issues.is_empty() {
        println!("Configuration is valid.");
        return Ok(());
    }
    for issue in &issues {
        println!("  - {issue}");
    }
    Err(eyre!("configuration has {} issue(s)", issues.len()))
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

fn print_job(job: &UpdateJob) {
    let m = &job.metrics;
    println!();
    println!("  Job:       {}", job.id);
    println!("  Status:    {}", job.status);
    println!("  Trigger:   {}", job.trigger_type);
    if let Some(rev) = &job.revision {
        println!("  Revision:  {rev}");
    }
    let domains: Vec<&str> = job.affected_domains.iter().map(|d| d.as_str()).collect();
    println!("  Domains:   {}", domains.join(", "));
    println!(
        "  Files:     {} analyzed, {} failed, {} skipped of {}",
        m.files_analyzed, m.files_failed, m.files_skipped, m.files_discovered
    );
    println!(
        "  Context:   {} generated, {} removed",
        m.context_files_generated, m.context_files_removed
    );
    println!("  Time:      {:.1}s", m.execution_time_ms as f64 / 1000.0);
    for warning in &job.warnings {
        println!("  warning: {warning}");
    }
    for error in &job.errors {
        println!("  error:   {error}");
    }
    println!();
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// Status listener that drives an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        spinner.set_style(style);
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }

    fn clear(&self) {
        self.spinner.finish_and_clear();
    }
}

impl StatusListener for CliProgress {
    fn on_status_change(&self, job: &UpdateJob) {
        if job.status.is_terminal() {
            self.spinner.finish_and_clear();
        } else {
            self.spinner.set_message(format!(
                "{} ({} domains)",
                job.status,
                job.affected_domains.len()
            ));
        }
    }

    fn on_file_analyzed(&self, _job: &JobId, path: &str, done: usize, total: usize) {
        self.spinner
            .set_message(format!("Analyzing [{done}/{total}] {path}"));
    }
}
