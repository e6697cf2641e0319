use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::config::{CONFIG_FILE, ProjectConfig};
use crate::route::RouteRegistry;
use crate::source::{SourceFile, SourceSet, fingerprint};

/// Project under test: its root directory and parsed `smart-mutant.toml`.
#[derive(Debug, Clone)]
pub struct Project {
    /// Directory holding `smart-mutant.toml`.
    pub root: PathBuf,

    pub config: ProjectConfig,

    /// Fingerprint of the raw config text; cached outcomes are only valid for the same config.
    pub config_fingerprint: String,
}

impl Project {
    /// Load the project whose config lives at `path` or in the nearest ancestor directory.
    pub fn from_root(path: PathBuf) -> Result<Self> {
        let root = find_root(&path).with_context(|| {
            format!("no {CONFIG_FILE} found in {path:?} or any parent directory")
        })?;

        let config_path = root.join(CONFIG_FILE);
        let text = fs::read_to_string(&config_path)
            .with_context(|| format!("failed to read {config_path:?}"))?;
        let config = ProjectConfig::parse(&text)
            .with_context(|| format!("invalid project config {config_path:?}"))?;

        Ok(Self {
            root,
            config,
            config_fingerprint: fingerprint(&text),
        })
    }

    /// Root directory as a `Path`.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Take this pass's read-only snapshot of the route registry.
    pub fn registry(&self) -> Result<RouteRegistry> {
        Ok(RouteRegistry::snapshot(&self.config)?)
    }

    /// Every file referenced by a route, schema or shared region, sorted by path.
    pub fn source_files(&self) -> Vec<SourceFile> {
        let mut files = BTreeSet::new();
        for route in &self.config.routes {
            files.insert(route.handler.file.clone());
            if let Some(schema) = &route.schema {
                files.insert(schema.file.clone());
            }
        }
        for shared in &self.config.shared {
            files.insert(shared.file.clone());
        }

        files
            .iter()
            .map(|rel| SourceFile::from_relative(&self.root, rel))
            .collect()
    }

    /// Look up a registered source file by its project-relative path.
    pub fn find_source(&self, rel: &Path) -> Option<SourceFile> {
        self.source_files()
            .into_iter()
            .find(|s| s.relative_path() == rel)
    }
}

impl SourceSet for Project {
    fn load(&self, rel: &Path) -> Result<String> {
        SourceFile::from_relative(&self.root, rel).read_to_string()
    }
}

fn find_root(start: &Path) -> Option<PathBuf> {
    let start = if start.is_file() { start.parent()? } else { start };
    let lookup = |from: &Path| {
        from.ancestors()
            .find(|dir| dir.join(CONFIG_FILE).is_file())
            .map(Path::to_path_buf)
    };

    // Relative paths only walk up as far as they spell out; `.` needs the absolute form.
    lookup(start).or_else(|| lookup(&start.canonicalize().ok()?))
}
