mod compiler;
mod config;
mod grading;
mod locator;
mod project;
mod runner;
mod script;
mod session;
mod tester;
mod transcript;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::info;

use crate::config::GraderConfig;
use crate::grading::grade_submission;
use crate::runner::ProcessRunner;

/// Build a submitted project and record an interactive session with it
#[derive(Debug, Parser)]
#[command(name = "grader", version)]
struct Cli {
    /// Submission (group) name; names the transcript file
    #[arg(long)]
    name: String,

    /// TOML configuration file
    #[arg(long, env = "GRADER_CONFIG")]
    config: Option<PathBuf>,

    /// Directory holding the unpacked submission
    #[arg(long)]
    root: Option<PathBuf>,

    /// Directory transcripts are written to
    #[arg(long)]
    results: Option<PathBuf>,

    /// YAML command list
    #[arg(long)]
    commands: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("grader=info".parse()?),
        )
        .init();

    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let mut config = GraderConfig::load(cli.config.as_deref())?;
    if let Some(root) = cli.root {
        config.submission_root = root;
    }
    if let Some(results) = cli.results {
        config.results_dir = results;
    }
    if let Some(commands) = cli.commands {
        config.commands_file = commands;
    }

    let commands = script::load_commands(&config.commands_file)?;
    info!(
        "Loaded {} commands from {}",
        commands.len(),
        config.commands_file.display()
    );

    let runner = ProcessRunner::new();
    let report = grade_submission(&config, &cli.name, &commands, &runner).await;

    let json = serde_json::to_string_pretty(&report).context("Failed to serialize report")?;
    println!("{}", json);

    Ok(if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
