use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::mutant::OperatorCategory;

/// Name of the per-project config file, looked up in the project root.
pub const CONFIG_FILE: &str = "smart-mutant.toml";

const DEFAULT_TIMEOUT_MS: u64 = 10_000;

/// Contents of `smart-mutant.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectConfig {
    /// How to invoke the project's test framework.
    pub tests: TestsConfig,

    #[serde(default)]
    pub mutation: MutationConfig,

    #[serde(default)]
    pub thresholds: Thresholds,

    /// The route registry snapshot.
    #[serde(default, rename = "route")]
    pub routes: Vec<RouteEntry>,

    /// Helper code reachable from several routes.
    #[serde(default)]
    pub shared: Vec<SharedEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TestsConfig {
    /// Test command argv. Selected test ids are appended as extra arguments.
    pub command: Vec<String>,

    /// Optional compile/syntax check run after applying a mutant.
    #[serde(default)]
    pub check: Option<Vec<String>>,

    /// Per-mutant budget for the selected tests.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Exit codes meaning "the suite could not even start" (for example a collection error).
    #[serde(default)]
    pub errored_exit_codes: Vec<i32>,

    /// Pre-recorded coverage trace, used instead of instrumenting the baseline run.
    #[serde(default)]
    pub trace: Option<PathBuf>,
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

/// How a timed-out mutant counts towards the score.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPolicy {
    /// Neither killed nor survived.
    #[default]
    Exclude,

    /// Counted as survived.
    Survived,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MutationConfig {
    /// Operator categories known to produce only equivalent mutants.
    #[serde(default = "default_exclude")]
    pub exclude: Vec<OperatorCategory>,

    #[serde(default)]
    pub timeout_policy: TimeoutPolicy,

    /// Worker threads; defaults to the number of CPUs.
    #[serde(default)]
    pub workers: Option<usize>,
}

fn default_exclude() -> Vec<OperatorCategory> {
    vec![OperatorCategory::StringLiteral]
}

impl Default for MutationConfig {
    fn default() -> Self {
        Self {
            exclude: default_exclude(),
            timeout_policy: TimeoutPolicy::default(),
            workers: None,
        }
    }
}

/// Score thresholds in percent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Thresholds {
    #[serde(default = "default_high")]
    pub high: f64,

    #[serde(default = "default_low")]
    pub low: f64,

    /// A score below this fails the run.
    #[serde(default, rename = "break")]
    pub break_at: Option<f64>,
}

fn default_high() -> f64 {
    80.0
}

fn default_low() -> f64 {
    60.0
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            high: default_high(),
            low: default_low(),
            break_at: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteEntry {
    pub method: String,
    pub path: String,
    pub handler: RegionEntry,
    #[serde(default)]
    pub schema: Option<RegionEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegionEntry {
    pub file: PathBuf,

    /// 1-based inclusive `[start, end]`.
    pub lines: [usize; 2],
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SharedEntry {
    pub file: PathBuf,
    pub lines: [usize; 2],

    /// Routes (`METHOD /path`) that reach this code.
    pub used_by: Vec<String>,
}

impl ProjectConfig {
    /// Parse and validate config text.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let config: ProjectConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.tests.command.is_empty() || self.tests.command[0].trim().is_empty() {
            return Err(ConfigError::Invalid(
                "tests.command must name a program".to_string(),
            ));
        }

        if matches!(&self.tests.check, Some(argv) if argv.is_empty()) {
            return Err(ConfigError::Invalid(
                "tests.check must name a program when present".to_string(),
            ));
        }

        if self.tests.timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "tests.timeout_ms must be positive".to_string(),
            ));
        }

        if self.mutation.workers == Some(0) {
            return Err(ConfigError::Invalid(
                "mutation.workers must be at least 1".to_string(),
            ));
        }

        let t = &self.thresholds;
        let in_range = |v: f64| (0.0..=100.0).contains(&v);
        if !in_range(t.high) || !in_range(t.low) || t.low > t.high {
            return Err(ConfigError::Invalid(format!(
                "thresholds must satisfy 0 <= low <= high <= 100 (low={}, high={})",
                t.low, t.high
            )));
        }
        if let Some(b) = t.break_at {
            if !in_range(b) || b > t.low {
                return Err(ConfigError::Invalid(format!(
                    "thresholds.break must be within 0..=low (break={b}, low={})",
                    t.low
                )));
            }
        }

        let regions = self
            .routes
            .iter()
            .flat_map(|r| std::iter::once(&r.handler).chain(r.schema.as_ref()))
            .map(|r| (&r.file, r.lines))
            .chain(self.shared.iter().map(|s| (&s.file, s.lines)));

        for (file, [start, end]) in regions {
            if start == 0 || start > end {
                return Err(ConfigError::Invalid(format!(
                    "invalid line range [{start}, {end}] for {}",
                    file.display()
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[tests]
command = ["pytest", "-q"]
"#;

    #[test]
    fn defaults_apply_to_minimal_config() {
        let config = ProjectConfig::parse(MINIMAL).unwrap();

        assert_eq!(config.tests.timeout_ms, DEFAULT_TIMEOUT_MS);
        assert_eq!(config.mutation.exclude, vec![OperatorCategory::StringLiteral]);
        assert_eq!(config.mutation.timeout_policy, TimeoutPolicy::Exclude);
        assert_eq!(config.thresholds, Thresholds::default());
        assert!(config.routes.is_empty());
    }

    #[test]
    fn full_config_round_trips_through_toml() {
        let text = r#"
[tests]
command = ["sh", "run_tests.sh"]
check = ["python", "-m", "compileall", "-q", "app"]
timeout_ms = 2500
errored_exit_codes = [2, 4]

[mutation]
exclude = ["string_literal", "logical"]
timeout_policy = "survived"
workers = 3

[thresholds]
high = 90
low = 70
break = 50

[[route]]
method = "POST"
path = "/users"
handler = { file = "app/users.py", lines = [4, 5] }
"#;
        let config = ProjectConfig::parse(text).unwrap();

        assert_eq!(config.tests.errored_exit_codes, vec![2, 4]);
        assert_eq!(
            config.mutation.exclude,
            vec![OperatorCategory::StringLiteral, OperatorCategory::Logical]
        );
        assert_eq!(config.mutation.timeout_policy, TimeoutPolicy::Survived);
        assert_eq!(config.mutation.workers, Some(3));
        assert_eq!(config.thresholds.break_at, Some(50.0));
        assert_eq!(config.routes[0].handler.lines, [4, 5]);
    }

    #[test]
    fn empty_command_is_rejected() {
        let err = ProjectConfig::parse("[tests]\ncommand = []\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn inverted_thresholds_are_rejected() {
        let text = format!("{MINIMAL}\n[thresholds]\nhigh = 50\nlow = 70\n");
        assert!(ProjectConfig::parse(&text).is_err());

        let text = format!("{MINIMAL}\n[thresholds]\nlow = 40\nbreak = 45\n");
        assert!(ProjectConfig::parse(&text).is_err());
    }

    #[test]
    fn zero_line_ranges_are_rejected() {
        let text = format!(
            "{MINIMAL}\n[[route]]\nmethod = \"GET\"\npath = \"/\"\nhandler = {{ file = \"a.py\", lines = [0, 3] }}\n"
        );
        assert!(ProjectConfig::parse(&text).is_err());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let text = format!("{MINIMAL}\n[mutation]\nexclude_all = true\n");
        assert!(matches!(
            ProjectConfig::parse(&text),
            Err(ConfigError::Parse(_))
        ));
    }
}
