//! Project model
//!
//! Parses an IntelliJ module file (`.iml`) into the build graph the compiler
//! and test runner work from.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::config::GraderConfig;

const MODULE_DIR: &str = "$MODULE_DIR$";
const PROJECT_DIR: &str = "$PROJECT_DIR$";
const APPLICATION_HOME_DIR: &str = "$APPLICATION_HOME_DIR$";

#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("failed to read descriptor {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed descriptor {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: roxmltree::Error,
    },
}

/// Placeholder anchors used while resolving descriptor URLs
#[derive(Debug, Clone, Copy)]
pub struct Anchors<'a> {
    pub project_root: &'a Path,
    pub idea_home: &'a Path,
}

impl Anchors<'_> {
    /// Turn a `file://` / `jar://` URL into an absolute filesystem path
    fn resolve(&self, url: &str) -> PathBuf {
        let raw = url
            .strip_prefix("jar://")
            .or_else(|| url.strip_prefix("file://"))
            .unwrap_or(url);
        let raw = raw.strip_suffix("!/").unwrap_or(raw);

        let root = self.project_root.to_string_lossy();
        let resolved = raw
            .replace(MODULE_DIR, &root)
            .replace(PROJECT_DIR, &root)
            .replace(APPLICATION_HOME_DIR, &self.idea_home.to_string_lossy());

        let path = PathBuf::from(resolved);
        if path.is_absolute() {
            path
        } else {
            self.project_root.join(path)
        }
    }
}

/// Declared structure of a project. Built once per build attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectDescriptor {
    pub project_root: PathBuf,
    pub source_roots: Vec<PathBuf>,
    pub test_source_roots: Vec<PathBuf>,
    /// Declared module libraries plus archives found in the local lib directory
    pub library_paths: BTreeSet<PathBuf>,
}

impl ProjectDescriptor {
    /// Read and parse a descriptor file, then union in the local libraries.
    pub fn load(path: &Path, config: &GraderConfig) -> Result<Self, DescriptorError> {
        let read_err = |source| DescriptorError::Read {
            path: path.to_path_buf(),
            source,
        };
        let content = std::fs::read_to_string(path).map_err(read_err)?;
        let project_root = path
            .parent()
            .unwrap_or(Path::new("."))
            .canonicalize()
            .map_err(read_err)?;

        let anchors = Anchors {
            project_root: &project_root,
            idea_home: &config.idea_home,
        };
        let mut descriptor =
            Self::parse(&content, anchors).map_err(|source| DescriptorError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        let lib_dir = project_root.join(&config.lib_dir_name);
        for jar in local_libraries(&lib_dir, &config.library_extension) {
            descriptor.library_paths.insert(jar);
        }

        debug!(
            "Parsed {}: {} source roots, {} test roots, {} libraries",
            path.display(),
            descriptor.source_roots.len(),
            descriptor.test_source_roots.len(),
            descriptor.library_paths.len()
        );
        Ok(descriptor)
    }

    /// Parse descriptor XML. Pure: touches no filesystem state.
    pub fn parse(content: &str, anchors: Anchors<'_>) -> Result<Self, roxmltree::Error> {
        let doc = roxmltree::Document::parse(content)?;

        let mut source_roots = Vec::new();
        let mut test_source_roots = Vec::new();
        for content in doc.descendants().filter(|n| n.has_tag_name("content")) {
            for folder in content.children().filter(|n| n.has_tag_name("sourceFolder")) {
                let Some(url) = folder.attribute("url") else {
                    continue;
                };
                let path = anchors.resolve(url);
                if folder.attribute("isTestSource") == Some("true") {
                    test_source_roots.push(path);
                } else {
                    source_roots.push(path);
                }
            }
        }

        let mut library_paths = BTreeSet::new();
        let module_libraries = doc.descendants().filter(|n| {
            n.has_tag_name("orderEntry") && n.attribute("type") == Some("module-library")
        });
        for entry in module_libraries {
            let Some(library) = entry.descendants().find(|n| n.has_tag_name("library")) else {
                continue;
            };
            for classes in library.descendants().filter(|n| n.has_tag_name("CLASSES")) {
                let urls = classes
                    .children()
                    .filter(|n| n.has_tag_name("root"))
                    .filter_map(|n| n.attribute("url"))
                    .filter(|url| !url.is_empty());
                for url in urls {
                    library_paths.insert(anchors.resolve(url));
                }
            }
        }

        Ok(Self {
            project_root: anchors.project_root.to_path_buf(),
            source_roots,
            test_source_roots,
            library_paths,
        })
    }

    /// Colon-separated classpath: `leading` entries first, then every library
    pub fn classpath(&self, leading: &[PathBuf]) -> String {
        leading
            .iter()
            .chain(self.library_paths.iter())
            .map(|p| p.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(":")
    }
}

fn local_libraries(lib_dir: &Path, ext: &str) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(lib_dir) else {
        return Vec::new();
    };
    entries
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.is_file() && p.extension().and_then(|e| e.to_str()) == Some(ext))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const SAMPLE_IML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<module type="JAVA_MODULE" version="4">
  <component name="NewModuleRootManager" inherit-compiler-output="true">
    <exclude-output />
    <content url="file://$MODULE_DIR$">
      <sourceFolder url="file://$MODULE_DIR$/src" isTestSource="false" />
      <sourceFolder url="file://$MODULE_DIR$/test" isTestSource="true" />
    </content>
    <orderEntry type="inheritedJdk" />
    <orderEntry type="sourceFolder" forTests="false" />
    <orderEntry type="module-library" scope="TEST">
      <library name="JUnit4">
        <CLASSES>
          <root url="jar://$APPLICATION_HOME_DIR$/lib/junit-4.13.2.jar!/" />
          <root url="jar://$APPLICATION_HOME_DIR$/lib/hamcrest-core-1.3.jar!/" />
        </CLASSES>
        <JAVADOC />
        <SOURCES />
      </library>
    </orderEntry>
    <orderEntry type="module-library">
      <library>
        <CLASSES>
          <root url="jar://$MODULE_DIR$/vendor/gson.jar!/" />
        </CLASSES>
      </library>
    </orderEntry>
    <orderEntry type="library" name="ignored-project-library" level="project" />
  </component>
</module>
"#;

    fn anchors<'a>(root: &'a Path, home: &'a Path) -> Anchors<'a> {
        Anchors {
            project_root: root,
            idea_home: home,
        }
    }

    #[test]
    fn test_parse_source_and_test_roots() {
        let root = Path::new("/work/proj");
        let home = Path::new("/opt/idea");
        let descriptor = ProjectDescriptor::parse(SAMPLE_IML, anchors(root, home)).unwrap();

        assert_eq!(descriptor.source_roots, vec![PathBuf::from("/work/proj/src")]);
        assert_eq!(
            descriptor.test_source_roots,
            vec![PathBuf::from("/work/proj/test")]
        );
    }

    #[test]
    fn test_parse_module_libraries() {
        let root = Path::new("/work/proj");
        let home = Path::new("/opt/idea");
        let descriptor = ProjectDescriptor::parse(SAMPLE_IML, anchors(root, home)).unwrap();

        let expected: BTreeSet<PathBuf> = [
            "/opt/idea/lib/junit-4.13.2.jar",
            "/opt/idea/lib/hamcrest-core-1.3.jar",
            "/work/proj/vendor/gson.jar",
        ]
        .into_iter()
        .map(PathBuf::from)
        .collect();
        assert_eq!(descriptor.library_paths, expected);
    }

    #[test]
    fn test_relative_url_is_anchored() {
        let xml = r#"<module><component><content url="file://$MODULE_DIR$">
            <sourceFolder url="file://app/src" isTestSource="false" />
        </content></component></module>"#;
        let descriptor =
            ProjectDescriptor::parse(xml, anchors(Path::new("/p"), Path::new("/h"))).unwrap();
        assert_eq!(descriptor.source_roots, vec![PathBuf::from("/p/app/src")]);
    }

    #[test]
    fn test_malformed_descriptor() {
        let result =
            ProjectDescriptor::parse("<module><content>", anchors(Path::new("/p"), Path::new("/h")));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_unions_local_libraries_and_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let iml = dir.path().join("cvfs.iml");
        fs::write(&iml, SAMPLE_IML).unwrap();
        fs::create_dir_all(dir.path().join("lib")).unwrap();
        fs::write(dir.path().join("lib/junit-4.13.2.jar"), "").unwrap();
        fs::write(dir.path().join("lib/notes.txt"), "").unwrap();

        let config = GraderConfig {
            idea_home: PathBuf::from("/opt/idea"),
            ..Default::default()
        };
        let first = ProjectDescriptor::load(&iml, &config).unwrap();
        let second = ProjectDescriptor::load(&iml, &config).unwrap();
        assert_eq!(first, second);

        let root = dir.path().canonicalize().unwrap();
        assert_eq!(first.project_root, root);
        assert!(first.library_paths.contains(&root.join("lib/junit-4.13.2.jar")));
        assert!(!first.library_paths.contains(&root.join("lib/notes.txt")));
        assert_eq!(first.library_paths.len(), 4);
        assert!(first.library_paths.iter().all(|p| p.is_absolute()));
    }

    #[test]
    fn test_classpath_order() {
        let descriptor = ProjectDescriptor {
            project_root: PathBuf::from("/p"),
            source_roots: vec![],
            test_source_roots: vec![],
            library_paths: [PathBuf::from("/l/b.jar"), PathBuf::from("/l/a.jar")]
                .into_iter()
                .collect(),
        };
        assert_eq!(
            descriptor.classpath(&[PathBuf::from("/p/out")]),
            "/p/out:/l/a.jar:/l/b.jar"
        );
        assert_eq!(descriptor.classpath(&[]), "/l/a.jar:/l/b.jar");
    }

    #[test]
    fn test_load_missing_file() {
        let err = ProjectDescriptor::load(Path::new("/nonexistent/x.iml"), &GraderConfig::default())
            .unwrap_err();
        assert!(matches!(err, DescriptorError::Read { .. }));
    }
}
