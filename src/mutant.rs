use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::frontend::Dialect;
use crate::route::RouteKey;
use crate::span::SourceSpan;

/// Category of a mutation operator. Exclusion policies work at this granularity.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
#[serde(rename_all = "snake_case")]
pub enum OperatorCategory {
    /// Validation bounds (for example `ge=18` -> `ge=17`, or dropping the bound).
    Boundary,

    /// Comparisons in handler control flow (`>=` -> `<`, `>=` -> `>`, whole condition -> constant).
    Comparison,

    /// Boolean connectives (`and` <-> `or`, `&&` <-> `||`).
    Logical,

    /// HTTP status literals (`201` -> `200`).
    StatusLiteral,

    /// `true` <-> `false`.
    BooleanLiteral,

    /// String literals emptied or filled.
    StringLiteral,
}

impl OperatorCategory {
    pub const ALL: [OperatorCategory; 6] = [
        OperatorCategory::Boundary,
        OperatorCategory::Comparison,
        OperatorCategory::Logical,
        OperatorCategory::StatusLiteral,
        OperatorCategory::BooleanLiteral,
        OperatorCategory::StringLiteral,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            OperatorCategory::Boundary => "boundary",
            OperatorCategory::Comparison => "comparison",
            OperatorCategory::Logical => "logical",
            OperatorCategory::StatusLiteral => "status_literal",
            OperatorCategory::BooleanLiteral => "boolean_literal",
            OperatorCategory::StringLiteral => "string_literal",
        }
    }
}

impl fmt::Display for OperatorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperatorCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().replace('-', "_");
        OperatorCategory::ALL
            .into_iter()
            .find(|c| c.as_str() == wanted)
            .ok_or_else(|| {
                let names: Vec<&str> = OperatorCategory::ALL.iter().map(|c| c.as_str()).collect();
                format!("unknown operator category {s:?} (expected one of {})", names.join(", "))
            })
    }
}

/// Identifier for a specific mutation operator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MutationOperator {
    /// Category this operator belongs to.
    pub category: OperatorCategory,

    /// Short, stable identifier for the operator variant (for example `bound_decrement`).
    pub name: String,
}

/// Operator-specific facts about a target, captured at analysis time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TargetDetail {
    /// Numeric validation bound; `clause` is what "remove constraint" deletes.
    Bound { value: i64, clause: SourceSpan },

    /// Comparison operator; `expr` is the whole comparison for the constant variants.
    Comparison { op: String, expr: SourceSpan },

    Logical { op: String },

    Status { code: u16 },

    Boolean { value: bool },

    Text,
}

/// A single mutable point found by the analyzer.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MutationTarget {
    pub id: u64,
    pub span: SourceSpan,
    pub category: OperatorCategory,
    pub detail: TargetDetail,

    /// Original text at `span`.
    pub original: String,

    /// Owning route, `None` when the code is reachable from several routes.
    pub owner: Option<RouteKey>,
    pub shared: bool,

    /// Every route whose behavior depends on this code.
    pub blast_radius: Vec<RouteKey>,
    pub dialect: Dialect,
}

/// Outcome of running the selected tests against a single mutant.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum MutantOutcome {
    /// Mutant has not been executed.
    NotRun,

    /// At least one relevant test failed under mutation.
    Killed,

    /// All relevant tests still passed.
    Survived,

    /// The test run exceeded its budget.
    Timeout,

    /// The mutant could not be applied, compiled or run.
    Errored,
}

impl MutantOutcome {
    pub fn label(self) -> &'static str {
        match self {
            MutantOutcome::NotRun => "not_run",
            MutantOutcome::Killed => "killed",
            MutantOutcome::Survived => "survived",
            MutantOutcome::Timeout => "timeout",
            MutantOutcome::Errored => "errored",
        }
    }
}

/// Representation of a single first-order mutant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Mutant {
    /// Position in the run's deterministic order (file, then offset), 1-based.
    pub id: u64,

    /// Target this mutant was derived from.
    pub target_id: u64,

    /// Operator applied to create this mutant.
    pub operator: MutationOperator,

    /// Location of the rewritten snippet.
    pub span: SourceSpan,

    /// Original source snippet (before mutation).
    pub original_snippet: String,

    /// Mutated source snippet (after mutation).
    pub mutated_snippet: String,

    pub owner: Option<RouteKey>,
    pub shared: bool,
    pub blast_radius: Vec<RouteKey>,

    pub outcome: MutantOutcome,

    /// Duration of the test run for this mutant in milliseconds.
    ///
    /// `None` means the mutant has not been executed.
    pub duration_ms: Option<u64>,

    /// Number of tests selected for this mutant; `None` means the entire suite.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tests_run: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,

    /// No registered test reaches this mutant's routes.
    #[serde(default, skip_serializing_if = "is_false")]
    pub no_coverage: bool,

    /// Outcome reused from the previous run's cache.
    #[serde(default, skip_serializing_if = "is_false")]
    pub carried_forward: bool,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl Mutant {
    /// Ordering key used for id assignment: file path, then source offsets.
    pub fn order_key(&self) -> (&std::path::Path, u32, u32, u64, &str) {
        (
            self.span.file.as_path(),
            self.span.start,
            self.span.end,
            self.target_id,
            self.operator.name.as_str(),
        )
    }

    pub fn record(&mut self, outcome: &MutationOutcome) {
        self.outcome = outcome.status;
        self.duration_ms = Some(outcome.duration_ms);
        self.tests_run = outcome.tests_run;
        self.note = outcome.note.clone();
    }

    /// Reset execution state, keeping identity.
    pub fn clear_outcome(&mut self) {
        self.outcome = MutantOutcome::NotRun;
        self.duration_ms = None;
        self.tests_run = None;
        self.note = None;
        self.no_coverage = false;
        self.carried_forward = false;
    }

    /// Label used for per-route breakdowns.
    pub fn route_label(&self) -> String {
        match &self.owner {
            Some(route) => route.to_string(),
            None => SHARED_BUCKET.to_string(),
        }
    }
}

/// Breakdown bucket for mutants in code reachable from several routes.
pub const SHARED_BUCKET: &str = "<shared>";

/// What the executor learned about one mutant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationOutcome {
    pub mutant_id: u64,
    pub status: MutantOutcome,
    pub tests_run: Option<usize>,
    pub duration_ms: u64,
    pub note: Option<String>,
}

/// Sort mutants into their deterministic order and renumber them 1..n.
pub fn assign_ids(mutants: &mut [Mutant]) {
    mutants.sort_by(|a, b| a.order_key().cmp(&b.order_key()));
    for (idx, m) in mutants.iter_mut().enumerate() {
        m.id = (idx as u64) + 1;
    }
}
