use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;

use crate::route::RouteKey;

/// Problems with `smart-mutant.toml`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("route {0} is declared more than once")]
    DuplicateRoute(String),

    #[error("shared region refers to unknown route {0}")]
    UnknownRoute(String),
}

/// A route or a single target could not be turned into mutation targets.
///
/// The affected route (or target) is excluded from mutation and listed in the report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[error("{}: {reason}", location(.route, .file, .line))]
pub struct AnalysisError {
    /// Route whose region failed; `None` for shared regions.
    pub route: Option<RouteKey>,
    pub file: PathBuf,

    /// 1-based line of the offending target, when the error concerns one target.
    pub line: Option<usize>,
    pub reason: String,
}

fn location(route: &Option<RouteKey>, file: &Path, line: &Option<usize>) -> String {
    let place = match line {
        Some(line) => format!("{}:{line}", file.display()),
        None => file.display().to_string(),
    };
    match route {
        Some(route) => format!("{route} ({place})"),
        None => place,
    }
}

/// An operator produced a mutant that cannot be applied safely.
///
/// Discarded before id assignment, so it never reaches the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[error("{}@{start} {operator}: {reason}", .file.display())]
pub struct GenerationError {
    pub target_id: u64,
    pub file: PathBuf,
    pub start: u32,
    pub operator: String,
    pub reason: String,
}

/// Failures while executing mutants against the working copy.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The mutation could not be written; the file is untouched.
    #[error("could not apply mutant {mutant_id} to {}: {reason}", .file.display())]
    Apply {
        mutant_id: u64,
        file: PathBuf,
        reason: String,
    },

    /// The original source could not be restored. Fatal for the whole run.
    #[error(
        "failed to restore {} after mutant {mutant_id}, the working copy can no longer be trusted: {source}",
        .file.display()
    )]
    RevertFailure {
        mutant_id: u64,
        file: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("mutation run cancelled")]
    Cancelled,
}

impl ExecError {
    /// Errors after which no outcome of the current pass may be reported.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ExecError::RevertFailure { .. } | ExecError::Cancelled)
    }
}

/// A coverage trace line could not be understood.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("coverage trace line {line}: {reason}")]
pub struct TraceError {
    pub line: usize,
    pub reason: String,
}

/// The version-control diff could not be computed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("version-control diff unavailable: {0}")]
pub struct DiffUnavailable(pub String);
