use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Handler, schema or helper source file within a project.
#[derive(Debug, Clone)]
pub struct SourceFile {
    /// Path relative to the project root (for example `app/users.py`).
    pub root_relative: PathBuf,

    /// Absolute path on disk.
    pub absolute_path: PathBuf,
}

impl SourceFile {
    /// Construct a `SourceFile` from a project root and a relative path.
    pub fn from_relative(root: &Path, rel: &Path) -> Self {
        Self {
            root_relative: rel.to_path_buf(),
            absolute_path: root.join(rel),
        }
    }

    /// Path relative to the project root
    pub fn relative_path(&self) -> &Path {
        &self.root_relative
    }

    /// Load the full file contents as UTF-8 text.
    pub fn read_to_string(&self) -> Result<String> {
        fs::read_to_string(&self.absolute_path)
            .with_context(|| format!("failed to read source file {:?}", self.absolute_path))
    }

    /// Content fingerprint of the file as it is on disk now.
    pub fn fingerprint(&self) -> Result<String> {
        Ok(fingerprint(&self.read_to_string()?))
    }
}

/// Hex blake3 digest of `contents`.
pub fn fingerprint(contents: &str) -> String {
    blake3::hash(contents.as_bytes()).to_hex().to_string()
}

/// Read access to project sources by project-relative path.
pub trait SourceSet {
    fn load(&self, rel: &Path) -> Result<String>;
}

#[cfg(test)]
impl SourceSet for std::collections::BTreeMap<PathBuf, String> {
    fn load(&self, rel: &Path) -> Result<String> {
        self.get(rel)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no such file: {}", rel.display()))
    }
}
