//! Test runner
//!
//! Discovers test classes by naming convention and runs them in one JUnit
//! process. Pass/fail is all-or-nothing at the process level; individual test
//! outcomes are not parsed.

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::config::GraderConfig;
use crate::project::ProjectDescriptor;
use crate::runner::{CommandSpec, Runner};

/// Result of a test run
#[derive(Debug, Clone, Serialize)]
pub struct TestReport {
    pub success: bool,
    pub classes: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub stdout: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub stderr: String,
}

impl TestReport {
    fn skipped() -> Self {
        Self {
            success: true,
            classes: Vec::new(),
            stdout: String::new(),
            stderr: String::new(),
        }
    }
}

/// Fully-qualified names of every test class under the test roots, sorted
pub fn find_test_classes(test_roots: &[PathBuf], suffix: &str) -> Vec<String> {
    let mut classes = BTreeSet::new();

    for root in test_roots {
        for entry in WalkDir::new(root).into_iter().filter_map(Result::ok) {
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if !name.ends_with(suffix) {
                continue;
            }
            if let Ok(rel) = entry.path().strip_prefix(root) {
                if let Some(class) = class_name(rel) {
                    classes.insert(class);
                }
            }
        }
    }

    classes.into_iter().collect()
}

/// `hk/edu/FooTest.java` -> `hk.edu.FooTest`
fn class_name(rel: &Path) -> Option<String> {
    let stem = rel.with_extension("");
    let parts: Vec<String> = stem
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("."))
    }
}

pub struct TestRunner<'a> {
    config: &'a GraderConfig,
    runner: &'a dyn Runner,
}

impl<'a> TestRunner<'a> {
    pub fn new(config: &'a GraderConfig, runner: &'a dyn Runner) -> Self {
        Self { config, runner }
    }

    /// Run every discovered test class against the compiled output.
    /// No test roots or no test classes means success without a process.
    pub async fn run_tests(
        &self,
        project: &ProjectDescriptor,
        output_dir: &Path,
    ) -> Result<TestReport> {
        if project.test_source_roots.is_empty() {
            info!("No test sources found");
            return Ok(TestReport::skipped());
        }

        let classes = find_test_classes(&project.test_source_roots, &self.config.test_suffix);
        if classes.is_empty() {
            info!("No test classes found");
            return Ok(TestReport::skipped());
        }

        info!("Running tests: {:?}", classes);
        let lib_glob = project.project_root.join(&self.config.lib_dir_name).join("*");
        let classpath = project.classpath(&[output_dir.to_path_buf(), lib_glob]);
        let mut cmd = CommandSpec::new(&self.config.java)
            .with_work_dir(&project.project_root)
            .arg("-cp")
            .arg(classpath)
            .arg(&self.config.test_runner_class);
        for class in &classes {
            cmd = cmd.arg(class.as_str());
        }

        let outcome = self
            .runner
            .run(&cmd, self.config.test_timeout())
            .await
            .with_context(|| format!("Failed to run {}", self.config.test_runner_class))?;

        if outcome.is_success() {
            info!("All tests passed!");
        } else {
            warn!("Tests failed with exit code {}", outcome.exit_code());
            if !outcome.stdout.is_empty() {
                warn!("Test output:\n{}", outcome.stdout);
            }
            if !outcome.stderr.is_empty() {
                warn!("Test errors:\n{}", outcome.stderr);
            }
        }

        Ok(TestReport {
            success: outcome.is_success(),
            classes,
            stdout: outcome.stdout,
            stderr: outcome.stderr,
        })
    }
}
