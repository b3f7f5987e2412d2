//! Compiler module - Project compilation
//!
//! Compiles the main source roots, then the test roots against the main
//! output. Every invocation is a single compiler run over the full file set;
//! the first failing phase ends the build and nothing is retried.

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::GraderConfig;
use crate::project::ProjectDescriptor;
use crate::runner::{CommandSpec, Runner};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompilePhase {
    Main,
    Tests,
}

/// Result of one compiler invocation
#[derive(Debug, Clone, Serialize)]
pub struct PhaseReport {
    pub phase: CompilePhase,
    pub success: bool,
    /// Number of source files handed to the compiler
    pub files: usize,
    /// Compiler output on failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<String>,
}

/// Result of a compilation attempt
#[derive(Debug, Clone, Serialize)]
pub struct CompileReport {
    pub success: bool,
    pub phases: Vec<PhaseReport>,
}

impl CompileReport {
    /// Diagnostics of the failing phase, if any
    pub fn message(&self) -> Option<&str> {
        self.phases
            .iter()
            .find(|p| !p.success)
            .and_then(|p| p.diagnostics.as_deref())
    }
}

/// Compiles a parsed project with the configured toolchain
pub struct BuildDriver<'a> {
    config: &'a GraderConfig,
    runner: &'a dyn Runner,
}

impl<'a> BuildDriver<'a> {
    pub fn new(config: &'a GraderConfig, runner: &'a dyn Runner) -> Self {
        Self { config, runner }
    }

    pub fn output_dir(&self, project: &ProjectDescriptor) -> PathBuf {
        project.project_root.join(&self.config.output_dir_name)
    }

    /// Compile main then test sources. Empty source sets succeed vacuously.
    pub async fn compile(&self, project: &ProjectDescriptor) -> Result<CompileReport> {
        let output_dir = self.output_dir(project);
        tokio::fs::create_dir_all(&output_dir)
            .await
            .with_context(|| format!("Failed to create {}", output_dir.display()))?;

        let mut phases = Vec::new();

        if !project.source_roots.is_empty() {
            info!("Compiling source files...");
            let classpath = project.classpath(&[]);
            let report = self
                .compile_phase(CompilePhase::Main, project, &project.source_roots, &classpath)
                .await?;
            let failed = !report.success;
            phases.push(report);
            if failed {
                return Ok(CompileReport {
                    success: false,
                    phases,
                });
            }
        }

        if !project.test_source_roots.is_empty() {
            info!("Compiling test files...");
            let classpath = project.classpath(&[output_dir.clone()]);
            let report = self
                .compile_phase(
                    CompilePhase::Tests,
                    project,
                    &project.test_source_roots,
                    &classpath,
                )
                .await?;
            let failed = !report.success;
            phases.push(report);
            if failed {
                return Ok(CompileReport {
                    success: false,
                    phases,
                });
            }
        }

        info!("Compilation successful!");
        Ok(CompileReport {
            success: true,
            phases,
        })
    }

    async fn compile_phase(
        &self,
        phase: CompilePhase,
        project: &ProjectDescriptor,
        roots: &[PathBuf],
        classpath: &str,
    ) -> Result<PhaseReport> {
        let files = find_sources(roots, &self.config.source_extension);
        if files.is_empty() {
            debug!("No sources under {:?}, skipping {:?} phase", roots, phase);
            return Ok(PhaseReport {
                phase,
                success: true,
                files: 0,
                diagnostics: None,
            });
        }

        let output_dir = self.output_dir(project);
        let mut cmd = CommandSpec::new(&self.config.compiler)
            .with_work_dir(&project.project_root)
            .arg("-d")
            .arg(output_dir.to_string_lossy());
        if !classpath.is_empty() {
            cmd = cmd.arg("-cp").arg(classpath);
        }
        for file in &files {
            cmd = cmd.arg(file.to_string_lossy());
        }

        debug!("Compiling {} files with {:?}", files.len(), cmd.program);
        let outcome = self
            .runner
            .run(&cmd, self.config.compile_timeout())
            .await
            .with_context(|| format!("Failed to run {}", self.config.compiler))?;

        if outcome.is_success() {
            Ok(PhaseReport {
                phase,
                success: true,
                files: files.len(),
                diagnostics: None,
            })
        } else {
            warn!(
                "Compilation failed ({:?} phase, exit code {})",
                phase,
                outcome.exit_code()
            );
            Ok(PhaseReport {
                phase,
                success: false,
                files: files.len(),
                diagnostics: Some(outcome.diagnostics()),
            })
        }
    }
}

/// All files with the given extension under the roots, recursively, sorted
pub fn find_sources(roots: &[PathBuf], ext: &str) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = roots
        .iter()
        .flat_map(|root| {
            WalkDir::new(root)
                .into_iter()
                .filter_map(Result::ok)
                .filter(|e| e.file_type().is_file() && has_extension(e.path(), ext))
                .map(|e| e.into_path())
        })
        .collect();
    files.sort();
    files
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(ext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::testing::RecordingRunner;
    use std::collections::BTreeSet;
    use std::fs;
    use tempfile::TempDir;

    fn project(root: &Path, libs: &[&str]) -> ProjectDescriptor {
        ProjectDescriptor {
            project_root: root.to_path_buf(),
            source_roots: vec![root.join("src")],
            test_source_roots: vec![root.join("test")],
            library_paths: libs.iter().map(PathBuf::from).collect::<BTreeSet<_>>(),
        }
    }

    fn write(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, "class X {}").unwrap();
    }

    #[tokio::test]
    async fn test_compiles_main_then_tests() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        write(&root.join("src/app/Main.java"));
        write(&root.join("src/app/model/Disk.java"));
        write(&root.join("src/app/notes.txt"));
        write(&root.join("test/app/MainTest.java"));

        let config = GraderConfig::default();
        let runner = RecordingRunner::succeeding();
        let report = BuildDriver::new(&config, &runner)
            .compile(&project(root, &["/libs/junit.jar"]))
            .await
            .unwrap();

        assert!(report.success);
        assert!(root.join("out").is_dir());

        let calls = runner.calls();
        assert_eq!(calls.len(), 2);

        let out = root.join("out").to_string_lossy().into_owned();
        let main = &calls[0];
        assert_eq!(main.program, "javac");
        assert_eq!(main.args[..4], ["-d", out.as_str(), "-cp", "/libs/junit.jar"]);
        assert_eq!(main.args.len(), 6);
        assert!(main.args.iter().all(|a| !a.ends_with(".txt")));

        let tests = &calls[1];
        assert_eq!(tests.args[3], format!("{}:/libs/junit.jar", out));
        assert!(tests.args[4].ends_with("MainTest.java"));
        assert_eq!(report.phases.len(), 2);
        assert_eq!(report.phases[0].files, 2);
    }

    #[tokio::test]
    async fn test_no_classpath_flag_without_libraries() {
        let dir = TempDir::new().unwrap();
        write(&dir.path().join("src/Main.java"));

        let mut descriptor = project(dir.path(), &[]);
        descriptor.test_source_roots.clear();

        let config = GraderConfig::default();
        let runner = RecordingRunner::succeeding();
        let report = BuildDriver::new(&config, &runner)
            .compile(&descriptor)
            .await
            .unwrap();

        assert!(report.success);
        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        assert!(!calls[0].args.contains(&"-cp".to_string()));
    }

    #[tokio::test]
    async fn test_main_failure_short_circuits_tests() {
        let dir = TempDir::new().unwrap();
        write(&dir.path().join("src/Main.java"));
        write(&dir.path().join("test/MainTest.java"));

        let config = GraderConfig::default();
        let runner = RecordingRunner::with_exit_code(1);
        let report = BuildDriver::new(&config, &runner)
            .compile(&project(dir.path(), &[]))
            .await
            .unwrap();

        assert!(!report.success);
        assert_eq!(runner.calls().len(), 1);
        assert_eq!(report.phases.len(), 1);
        assert_eq!(report.message(), Some("javac: error"));
    }

    #[tokio::test]
    async fn test_empty_source_set_is_vacuously_successful() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();

        let config = GraderConfig::default();
        let runner = RecordingRunner::succeeding();
        let report = BuildDriver::new(&config, &runner)
            .compile(&project(dir.path(), &[]))
            .await
            .unwrap();

        assert!(report.success);
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn test_find_sources_sorted_across_roots() {
        let dir = TempDir::new().unwrap();
        write(&dir.path().join("b/Z.java"));
        write(&dir.path().join("a/deep/er/Y.java"));
        write(&dir.path().join("a/X.kt"));

        let files = find_sources(&[dir.path().join("b"), dir.path().join("a")], "java");
        assert_eq!(
            files,
            vec![dir.path().join("a/deep/er/Y.java"), dir.path().join("b/Z.java")]
        );
    }
}
