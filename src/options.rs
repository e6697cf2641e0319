use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::config::{ProjectConfig, Thresholds, TimeoutPolicy};
use crate::mutant::OperatorCategory;
use crate::out::OUT_DIR_NAME;

/// How much of the mutant population a pass executes, and against which tests.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Every mutant, entire suite per mutant.
    Full,

    /// Every mutant, only the tests covering its routes.
    #[default]
    Smart,

    /// Like smart, but reuse cached outcomes of unchanged files.
    Incremental,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunMode::Full => "full",
            RunMode::Smart => "smart",
            RunMode::Incremental => "incremental",
        })
    }
}

/// Configuration for one `run`: `smart-mutant.toml` merged with CLI flags.
#[derive(Debug, Clone)]
pub struct Options {
    pub mode: RunMode,

    /// Base reference for the change-set in incremental mode.
    pub base: String,

    /// Head reference; `None` compares against the working tree.
    pub head: Option<String>,

    /// Re-run the executed set in full mode and compare classifications.
    pub audit: bool,

    pub watch: bool,

    pub workers: usize,

    /// Per-mutant test budget in milliseconds.
    pub timeout_ms: u64,

    pub exclude: Vec<OperatorCategory>,

    pub timeout_policy: TimeoutPolicy,

    pub thresholds: Thresholds,

    /// Optional limit for the number of mutants to execute.
    pub mutant_limit: Option<usize>,

    /// When true, emit JSON output instead of human-readable summary.
    pub json_output: bool,

    pub verbose: bool,

    /// Where reports and the cache go; `None` disables the output directory.
    pub out_dir: Option<PathBuf>,
}

impl Options {
    /// Options for `project_root` with the values from its config file.
    pub fn from_config(project_root: PathBuf, config: &ProjectConfig) -> Self {
        Self {
            out_dir: Some(project_root.join(OUT_DIR_NAME)),
            mode: RunMode::default(),
            base: "HEAD".to_string(),
            head: None,
            audit: false,
            watch: false,
            workers: config.mutation.workers.unwrap_or_else(num_cpus::get),
            timeout_ms: config.tests.timeout_ms,
            exclude: config.mutation.exclude.clone(),
            timeout_policy: config.mutation.timeout_policy,
            thresholds: config.thresholds,
            mutant_limit: None,
            json_output: false,
            verbose: false,
        }
    }
}
