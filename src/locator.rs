//! Project locator
//!
//! Finds the project descriptor inside an unpacked submission whose nesting is
//! not known in advance. Layout resolution is an ordered list of strategies;
//! the first one that yields a descriptor wins and is logged.

use std::fmt;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::config::GraderConfig;

#[derive(Debug, Error)]
pub enum LocateError {
    #[error("no submission directory under {}", .0.display())]
    NoSubmissionDir(PathBuf),
    #[error("no .{extension} descriptor found under {}", .best_effort.display())]
    DescriptorNotFound {
        extension: String,
        best_effort: PathBuf,
    },
    #[error("{} descriptors at the same level under {}", .candidates.len(), .dir.display())]
    AmbiguousDescriptor {
        dir: PathBuf,
        candidates: Vec<PathBuf>,
    },
    #[error("failed to list {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl LocateError {
    /// Directory that best represents the project despite the failure
    pub fn best_effort_path(&self) -> Option<&Path> {
        match self {
            LocateError::DescriptorNotFound { best_effort, .. } => Some(best_effort),
            LocateError::AmbiguousDescriptor { dir, .. } => Some(dir),
            _ => None,
        }
    }
}

/// Layout resolution strategy, in the order they are tried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Descriptor sits directly in the source directory
    Direct,
    /// Source directory wraps exactly one project directory
    SingleNested,
    /// Shallowest descriptor found by a bounded walk
    Recursive,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Strategy::Direct => "direct",
            Strategy::SingleNested => "single_nested",
            Strategy::Recursive => "recursive",
        };
        write!(f, "{}", s)
    }
}

/// A located project
#[derive(Debug, Clone, PartialEq)]
pub struct Located {
    /// Directory directly containing the descriptor
    pub project_dir: PathBuf,
    pub descriptor: PathBuf,
    pub strategy: Strategy,
}

/// Locate the project below a submission root.
///
/// The root holds one submission directory, which holds the fixed source
/// directory (falling back to the submission directory itself when that
/// child is missing).
pub fn locate_project(config: &GraderConfig, root: &Path) -> Result<Located, LocateError> {
    let submission_dir = subdirectories(root)?
        .into_iter()
        .next()
        .ok_or_else(|| LocateError::NoSubmissionDir(root.to_path_buf()))?;

    let source_dir = submission_dir.join(&config.source_dir_name);
    let source_dir = if source_dir.is_dir() {
        source_dir
    } else {
        warn!(
            "{} has no {} directory, searching it directly",
            submission_dir.display(),
            config.source_dir_name
        );
        submission_dir
    };

    let located = resolve(config, &source_dir)?;
    info!(
        "Located descriptor {} via {} strategy",
        located.descriptor.display(),
        located.strategy
    );
    Ok(located)
}

fn resolve(config: &GraderConfig, source_dir: &Path) -> Result<Located, LocateError> {
    let ext = config.descriptor_extension.as_str();

    let direct = descriptors_in(source_dir, ext)?;
    if !direct.is_empty() {
        return pick(config, source_dir, direct, Strategy::Direct);
    }

    let subdirs = subdirectories(source_dir)?;
    if let [only] = subdirs.as_slice() {
        let nested = descriptors_in(only, ext)?;
        if !nested.is_empty() {
            return pick(config, only, nested, Strategy::SingleNested);
        }
    }

    if let Some((dir, candidates)) = shallowest_descriptors(source_dir, ext, config.max_search_depth)
    {
        return pick(config, &dir, candidates, Strategy::Recursive);
    }

    let best_effort = match subdirs.as_slice() {
        [only] => only.clone(),
        _ => source_dir.to_path_buf(),
    };
    Err(LocateError::DescriptorNotFound {
        extension: ext.to_string(),
        best_effort,
    })
}

/// Deterministic choice among candidates: first in sorted order.
fn pick(
    config: &GraderConfig,
    dir: &Path,
    candidates: Vec<PathBuf>,
    strategy: Strategy,
) -> Result<Located, LocateError> {
    if candidates.len() > 1 {
        if config.strict_layout {
            return Err(LocateError::AmbiguousDescriptor {
                dir: dir.to_path_buf(),
                candidates,
            });
        }
        warn!(
            "{} descriptors found in {}: {:?}; using the first",
            candidates.len(),
            dir.display(),
            candidates
        );
    }

    let descriptor = candidates
        .into_iter()
        .next()
        .ok_or_else(|| LocateError::DescriptorNotFound {
            extension: config.descriptor_extension.clone(),
            best_effort: dir.to_path_buf(),
        })?;
    let project_dir = descriptor
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| dir.to_path_buf());

    Ok(Located {
        project_dir,
        descriptor,
        strategy,
    })
}

fn shallowest_descriptors(
    root: &Path,
    ext: &str,
    max_depth: usize,
) -> Option<(PathBuf, Vec<PathBuf>)> {
    let mut best_depth = usize::MAX;
    let mut found: Vec<PathBuf> = Vec::new();

    for entry in WalkDir::new(root)
        .min_depth(1)
        .max_depth(max_depth)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_archive_noise(e.path()))
        .filter_map(Result::ok)
    {
        if !entry.file_type().is_file() || !has_extension(entry.path(), ext) {
            continue;
        }
        if entry.depth() < best_depth {
            best_depth = entry.depth();
            found.clear();
        }
        if entry.depth() == best_depth {
            found.push(entry.into_path());
        }
    }

    found.sort();
    let first = found.first()?;
    let dir = first.parent()?.to_path_buf();
    // Only candidates sharing the winning directory compete for selection
    let candidates = found
        .iter()
        .filter(|p| p.parent() == Some(dir.as_path()))
        .cloned()
        .collect();
    if found.len() > 1 {
        warn!(
            "{} descriptors at depth {} under {}",
            found.len(),
            best_depth,
            root.display()
        );
    }
    Some((dir, candidates))
}

fn descriptors_in(dir: &Path, ext: &str) -> Result<Vec<PathBuf>, LocateError> {
    Ok(sorted_entries(dir)?
        .into_iter()
        .filter(|p| p.is_file() && has_extension(p, ext))
        .collect())
}

fn subdirectories(dir: &Path) -> Result<Vec<PathBuf>, LocateError> {
    Ok(sorted_entries(dir)?
        .into_iter()
        .filter(|p| p.is_dir())
        .collect())
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>, LocateError> {
    let io_err = |source| LocateError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(io_err)? {
        let path = entry.map_err(io_err)?.path();
        if !is_archive_noise(&path) {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

/// `__MACOSX` resource forks and dot-prefixed entries (`._x.iml`, `.idea`)
fn is_archive_noise(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n == "__MACOSX" || n.starts_with('.'))
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(ext)
}
