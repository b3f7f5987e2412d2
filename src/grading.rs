//! Grading pipeline for one submission
//!
//! Locate -> parse descriptor -> compile -> tests -> interactive session ->
//! transcript. Discovery and compile failures stop the pipeline before a
//! session is attempted; test failures do not.

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use crate::compiler::{BuildDriver, CompileReport};
use crate::config::GraderConfig;
use crate::locator::locate_project;
use crate::project::ProjectDescriptor;
use crate::runner::{CommandSpec, Runner};
use crate::session::{SessionDriver, SessionEnd};
use crate::tester::{TestReport, TestRunner};

/// Build status gating the session
#[derive(Debug, Clone, Serialize)]
pub struct BuildResult {
    pub compile_succeeded: bool,
    pub tests_succeeded: bool,
    pub project_path: PathBuf,
}

/// Everything known about one graded submission
#[derive(Debug, Clone, Serialize)]
pub struct GradeReport {
    pub name: String,
    pub build: BuildResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compile: Option<CompileReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tests: Option<TestReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcript_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_end: Option<SessionEnd>,
    /// Discovery error, compile diagnostics or unexpected failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl GradeReport {
    fn new(name: &str, project_path: PathBuf) -> Self {
        Self {
            name: name.to_string(),
            build: BuildResult {
                compile_succeeded: false,
                tests_succeeded: false,
                project_path,
            },
            compile: None,
            tests: None,
            transcript_path: None,
            session_end: None,
            error_message: None,
        }
    }

    /// Compiled and produced a transcript
    pub fn is_success(&self) -> bool {
        self.build.compile_succeeded && self.transcript_path.is_some()
    }
}

/// Grade one submission. Never fails: errors end up in `error_message` so a
/// batch caller can move on to the next submission.
pub async fn grade_submission(
    config: &GraderConfig,
    name: &str,
    commands: &[String],
    runner: &dyn Runner,
) -> GradeReport {
    let mut report = GradeReport::new(name, config.submission_root.clone());

    if let Err(e) = process_submission(config, name, commands, runner, &mut report).await {
        error!("Failed to grade {}: {:#}", name, e);
        report.error_message = Some(format!("{:#}", e));
    }

    info!(
        "Grading finished: name={}, compile={}, tests={}, session={:?}",
        name, report.build.compile_succeeded, report.build.tests_succeeded, report.session_end
    );
    report
}

async fn process_submission(
    config: &GraderConfig,
    name: &str,
    commands: &[String],
    runner: &dyn Runner,
    report: &mut GradeReport,
) -> Result<()> {
    info!("Grading {} under {}", name, config.submission_root.display());

    // 1. Discovery
    let located = match locate_project(config, &config.submission_root) {
        Ok(located) => located,
        Err(e) => {
            warn!("Project discovery failed: {}", e);
            if let Some(path) = e.best_effort_path() {
                report.build.project_path = path.to_path_buf();
            }
            report.error_message = Some(e.to_string());
            return Ok(());
        }
    };
    report.build.project_path = located.project_dir.clone();

    let project = ProjectDescriptor::load(&located.descriptor, config)
        .context("Failed to load project descriptor")?;
    report.build.project_path = project.project_root.clone();

    // 2. Compile
    let builder = BuildDriver::new(config, runner);
    let compile = builder.compile(&project).await?;
    report.build.compile_succeeded = compile.success;
    if !compile.success {
        report.error_message = compile.message().map(str::to_string);
        report.compile = Some(compile);
        return Ok(());
    }
    report.compile = Some(compile);

    // 3. Tests (non-fatal)
    let output_dir = builder.output_dir(&project);
    let tests = TestRunner::new(config, runner)
        .run_tests(&project, &output_dir)
        .await?;
    report.build.tests_succeeded = tests.success;
    report.tests = Some(tests);

    // 4. Session
    let program = session_command(config, &project, &output_dir);
    let outcome = SessionDriver::new(&config.session)
        .run(&program, commands)
        .await
        .context("Failed to start program")?;
    report.session_end = Some(outcome.end);

    // 5. Transcript
    let path = config.transcript_path(name);
    outcome.record.write_to(&path).await?;
    info!("Transcript written to {}", path.display());
    report.transcript_path = Some(path);

    Ok(())
}

/// `java -cp <out>:<libraries> <main class>`, run from the project root with
/// a terminal type that disables colour and cursor control
fn session_command(
    config: &GraderConfig,
    project: &ProjectDescriptor,
    output_dir: &Path,
) -> CommandSpec {
    CommandSpec::new(&config.java)
        .with_work_dir(&project.project_root)
        .with_env("TERM", "dumb")
        .arg("-cp")
        .arg(project.classpath(&[output_dir.to_path_buf()]))
        .arg(&config.main_class)
}
