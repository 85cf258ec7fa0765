//! ContextSync CLI: keeps per-domain context documents in step with source changes.
//!
//! Thin driver over `contextsync-core`: submits update and reindex jobs,
//! inspects job history, and rolls back failed jobs.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
