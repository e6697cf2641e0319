use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::DiffUnavailable;

/// Ordered set of project-relative paths changed between two references.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    files: BTreeSet<PathBuf>,
}

impl ChangeSet {
    pub fn from_paths(paths: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            files: paths.into_iter().collect(),
        }
    }

    /// Parse `git diff --name-only` output.
    pub fn from_name_only(output: &str) -> Self {
        Self::from_paths(
            output
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(PathBuf::from),
        )
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PathBuf> {
        self.files.iter()
    }
}

/// Source of change-sets; the engine never talks to version control directly.
pub trait DiffProvider: Sync {
    /// Files changed between `base` and `head` (the working tree when `head` is `None`).
    fn changed_files(
        &self,
        root: &Path,
        base: &str,
        head: Option<&str>,
    ) -> Result<ChangeSet, DiffUnavailable>;
}

/// `git diff --name-only` in the project root.
#[derive(Debug, Default, Clone, Copy)]
pub struct GitDiff;

impl DiffProvider for GitDiff {
    fn changed_files(
        &self,
        root: &Path,
        base: &str,
        head: Option<&str>,
    ) -> Result<ChangeSet, DiffUnavailable> {
        let output = Command::new("git")
            .args(["diff", "--name-only", "--relative", base])
            .args(head)
            .current_dir(root)
            .output()
            .map_err(|e| DiffUnavailable(format!("failed to run git in {root:?}: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = stderr.lines().next().unwrap_or("").trim();
            return Err(DiffUnavailable(if detail.is_empty() {
                format!("git diff exited with {}", output.status)
            } else {
                detail.to_string()
            }));
        }

        let changes = ChangeSet::from_name_only(&String::from_utf8_lossy(&output.stdout));
        log::debug!("git diff {base}..{} -> {} changed files", head.unwrap_or("worktree"), changes.len());
        Ok(changes)
    }
}
