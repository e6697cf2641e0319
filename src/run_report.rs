use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Serialize;

use crate::config::{Thresholds, TimeoutPolicy};
use crate::error::{AnalysisError, GenerationError};
use crate::mutant::{Mutant, MutantOutcome, OperatorCategory, SHARED_BUCKET};
use crate::options::RunMode;
use crate::route::RouteKey;

/// Why a pass ran in `full` mode although another mode was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FallbackReason {
    DiffUnavailable,
    CoverageUnavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GateLevel {
    High,
    Warning,
    Low,
}

/// Score compared against the configured thresholds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Gate {
    /// `None` when there is no score.
    pub level: Option<GateLevel>,

    /// The score is below `thresholds.break`.
    pub break_failed: bool,
}

impl Gate {
    pub fn evaluate(score: Option<f64>, thresholds: &Thresholds) -> Self {
        let Some(score) = score else {
            return Self::default();
        };

        let level = if score >= thresholds.high {
            GateLevel::High
        } else if score >= thresholds.low {
            GateLevel::Warning
        } else {
            GateLevel::Low
        };

        Self {
            level: Some(level),
            break_failed: thresholds.break_at.is_some_and(|b| score < b),
        }
    }
}

/// Summary counts for a mutation-testing run.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub total: usize,

    /// Number of mutants whose tests failed under mutation.
    pub killed: usize,

    /// Number of mutants for which tests still passed (including uncovered ones).
    pub survived: usize,

    pub timeouts: usize,

    /// Number of mutants that could not be applied, checked or run.
    pub errored: usize,

    /// Survivors no test reaches.
    pub no_coverage: usize,

    /// Mutants whose tests ran in this pass.
    pub executed: usize,

    pub carried_forward: usize,

    pub not_run: usize,
}

impl RunSummary {
    pub fn tally<'a>(mutants: impl IntoIterator<Item = &'a Mutant>) -> Self {
        let mut s = Self::default();
        for m in mutants {
            s.total += 1;
            match m.outcome {
                MutantOutcome::Killed => s.killed += 1,
                MutantOutcome::Survived => s.survived += 1,
                MutantOutcome::Timeout => s.timeouts += 1,
                MutantOutcome::Errored => s.errored += 1,
                MutantOutcome::NotRun => s.not_run += 1,
            }
            if m.no_coverage {
                s.no_coverage += 1;
            }
            if m.carried_forward {
                s.carried_forward += 1;
            } else if m.outcome != MutantOutcome::NotRun && !m.no_coverage {
                s.executed += 1;
            }
        }
        s
    }

    /// Killed share of the scored mutants, in percent; `None` when nothing was scored.
    pub fn score(&self, policy: TimeoutPolicy) -> Option<f64> {
        let survived = match policy {
            TimeoutPolicy::Exclude => self.survived,
            TimeoutPolicy::Survived => self.survived + self.timeouts,
        };
        let scored = self.killed + survived;
        (scored > 0).then(|| round2(self.killed as f64 * 100.0 / scored as f64))
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Per-route view of the outcomes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteBreakdown {
    /// `METHOD /path`, or `<shared>` for code reachable from several routes.
    pub route: String,

    pub summary: RunSummary,
    pub score: Option<f64>,

    /// Surviving boundary mutants: validation bounds no test pins down.
    pub untested_boundaries: Vec<u64>,
}

impl RouteBreakdown {
    /// One entry per route that has mutants, sorted by route, with `<shared>` last.
    pub fn collect(mutants: &[Mutant], policy: TimeoutPolicy) -> Vec<Self> {
        let mut buckets: BTreeMap<(bool, Option<&RouteKey>), Vec<&Mutant>> = BTreeMap::new();
        for m in mutants {
            let owner = if m.shared { None } else { m.owner.as_ref() };
            buckets.entry((owner.is_none(), owner)).or_default().push(m);
        }

        buckets
            .into_iter()
            .map(|((_, owner), members)| {
                let summary = RunSummary::tally(members.iter().copied());
                let untested_boundaries = members
                    .iter()
                    .filter(|m| {
                        m.operator.category == OperatorCategory::Boundary
                            && m.outcome == MutantOutcome::Survived
                    })
                    .map(|m| m.id)
                    .collect();
                Self {
                    route: owner.map_or_else(|| SHARED_BUCKET.to_string(), |r| r.to_string()),
                    score: summary.score(policy),
                    summary,
                    untested_boundaries,
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditDivergence {
    pub mutant_id: u64,
    pub smart: MutantOutcome,
    pub full: MutantOutcome,
}

/// Comparison of the optimized pass against a full re-run of the same mutants.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditReport {
    pub compared: usize,
    pub smart_score: Option<f64>,
    pub full_score: Option<f64>,
    pub divergent: Vec<AuditDivergence>,
}

impl AuditReport {
    /// Compare classifications of the same mutants from two passes (matched by id).
    pub fn compare(smart: &[Mutant], full: &[Mutant], policy: TimeoutPolicy) -> Self {
        let full_by_id: BTreeMap<u64, &Mutant> = full.iter().map(|m| (m.id, m)).collect();

        let mut compared = 0;
        let mut divergent = Vec::new();
        let mut smart_side = Vec::new();
        let mut full_side = Vec::new();
        for m in smart {
            let Some(f) = full_by_id.get(&m.id) else {
                continue;
            };
            compared += 1;
            smart_side.push(m);
            full_side.push(*f);
            if m.outcome != f.outcome {
                divergent.push(AuditDivergence {
                    mutant_id: m.id,
                    smart: m.outcome,
                    full: f.outcome,
                });
            }
        }

        Self {
            compared,
            smart_score: RunSummary::tally(smart_side).score(policy),
            full_score: RunSummary::tally(full_side).score(policy),
            divergent,
        }
    }

    pub fn passed(&self) -> bool {
        self.divergent.is_empty() && self.smart_score == self.full_score
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExcludedCategory {
    pub category: OperatorCategory,

    /// Targets skipped because of the exclusion.
    pub targets: usize,
}

/// Machine-readable report for a mutation test run.
///
/// In `--json` mode we print this to stdout as pretty JSON.
#[derive(Debug, Clone, Serialize)]
pub struct MutationReport {
    /// Tool name, stable across versions.
    pub tool: &'static str,

    /// Current crate version.
    pub version: &'static str,

    /// The project root used for this run.
    pub project_root: PathBuf,

    pub requested_mode: RunMode,

    /// Mode the pass actually ran in.
    pub mode: RunMode,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<FallbackReason>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_detail: Option<String>,

    pub score: Option<f64>,
    pub thresholds: Thresholds,
    pub gate: Gate,
    pub summary: RunSummary,
    pub routes: Vec<RouteBreakdown>,
    pub uninstrumented_tests: Vec<String>,
    pub excluded_categories: Vec<ExcludedCategory>,
    pub analysis_errors: Vec<AnalysisError>,
    pub generation_errors: Vec<GenerationError>,

    /// Changed files the incremental pass worked from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changed_files: Option<Vec<PathBuf>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub audit: Option<AuditReport>,

    /// Mutants sorted by id, with their outcomes.
    pub mutants: Vec<Mutant>,

    /// Optional high-level error message (for example baseline failure).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl MutationReport {
    pub fn success(
        project_root: PathBuf,
        requested_mode: RunMode,
        mode: RunMode,
        thresholds: Thresholds,
        timeout_policy: TimeoutPolicy,
        mut mutants: Vec<Mutant>,
    ) -> Self {
        mutants.sort_by_key(|m| m.id);
        let summary = RunSummary::tally(&mutants);
        let score = summary.score(timeout_policy);

        Self {
            tool: "smart-mutant",
            version: env!("CARGO_PKG_VERSION"),
            project_root,
            requested_mode,
            mode,
            fallback_reason: None,
            fallback_detail: None,
            score,
            thresholds,
            gate: Gate::evaluate(score, &thresholds),
            summary,
            routes: RouteBreakdown::collect(&mutants, timeout_policy),
            uninstrumented_tests: Vec::new(),
            excluded_categories: Vec::new(),
            analysis_errors: Vec::new(),
            generation_errors: Vec::new(),
            changed_files: None,
            audit: None,
            mutants,
            error: None,
        }
    }

    pub fn failure(
        project_root: PathBuf,
        requested_mode: RunMode,
        thresholds: Thresholds,
        error: String,
    ) -> Self {
        Self {
            tool: "smart-mutant",
            version: env!("CARGO_PKG_VERSION"),
            project_root,
            requested_mode,
            mode: requested_mode,
            fallback_reason: None,
            fallback_detail: None,
            score: None,
            thresholds,
            gate: Gate::default(),
            summary: RunSummary::default(),
            routes: Vec::new(),
            uninstrumented_tests: Vec::new(),
            excluded_categories: Vec::new(),
            analysis_errors: Vec::new(),
            generation_errors: Vec::new(),
            changed_files: None,
            audit: None,
            mutants: Vec::new(),
            error: Some(error),
        }
    }

    /// The run failed outright: an error or a diverging audit.
    pub fn failed(&self) -> bool {
        self.error.is_some() || self.audit.as_ref().is_some_and(|a| !a.passed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutant::MutationOperator;
    use crate::mutant::fixtures::mutant;

    fn with(id: u64, owner: Option<&str>, outcome: MutantOutcome) -> Mutant {
        let mut m = mutant(id, "app/users.py", id as u32 * 10, owner);
        m.outcome = outcome;
        m
    }

    fn thresholds(break_at: Option<f64>) -> Thresholds {
        Thresholds {
            high: 80.0,
            low: 60.0,
            break_at,
        }
    }

    #[test]
    fn score_ignores_errored_and_applies_timeout_policy() {
        let mutants = vec![
            with(1, Some("GET /a"), MutantOutcome::Killed),
            with(2, Some("GET /a"), MutantOutcome::Killed),
            with(3, Some("GET /a"), MutantOutcome::Survived),
            with(4, Some("GET /a"), MutantOutcome::Timeout),
            with(5, Some("GET /a"), MutantOutcome::Errored),
        ];
        let summary = RunSummary::tally(&mutants);

        assert_eq!(summary.total, 5);
        assert_eq!(summary.executed, 5);
        assert_eq!(summary.score(TimeoutPolicy::Exclude), Some(66.67));
        assert_eq!(summary.score(TimeoutPolicy::Survived), Some(50.0));
    }

    #[test]
    fn carried_and_uncovered_mutants_count_but_are_not_executed() {
        let mut carried = with(1, Some("GET /a"), MutantOutcome::Killed);
        carried.carried_forward = true;
        let mut uncovered = with(2, Some("GET /b"), MutantOutcome::Survived);
        uncovered.no_coverage = true;
        let pending = with(3, Some("GET /a"), MutantOutcome::NotRun);

        let summary = RunSummary::tally(&[carried, uncovered, pending]);

        assert_eq!(summary.carried_forward, 1);
        assert_eq!(summary.no_coverage, 1);
        assert_eq!(summary.not_run, 1);
        assert_eq!(summary.executed, 0);
        assert_eq!(summary.score(TimeoutPolicy::Exclude), Some(50.0));
    }

    #[test]
    fn nothing_scored_means_no_score_and_no_gate() {
        let summary = RunSummary::tally(&[with(1, Some("GET /a"), MutantOutcome::Errored)]);
        let score = summary.score(TimeoutPolicy::Exclude);
        assert_eq!(score, None);
        assert_eq!(Gate::evaluate(score, &thresholds(Some(50.0))), Gate::default());
    }

    #[test]
    fn gate_levels_and_break() {
        let t = thresholds(Some(50.0));
        assert_eq!(Gate::evaluate(Some(80.0), &t).level, Some(GateLevel::High));
        assert_eq!(Gate::evaluate(Some(60.0), &t).level, Some(GateLevel::Warning));
        let low = Gate::evaluate(Some(49.9), &t);
        assert_eq!(low.level, Some(GateLevel::Low));
        assert!(low.break_failed);
        assert!(!Gate::evaluate(Some(10.0), &thresholds(None)).break_failed);
    }

    #[test]
    fn breakdown_lists_routes_then_shared_with_untested_boundaries() {
        let mut bound = with(3, Some("POST /users"), MutantOutcome::Survived);
        bound.operator = MutationOperator {
            category: OperatorCategory::Boundary,
            name: "bound_decrement".to_string(),
        };
        let mutants = vec![
            with(1, None, MutantOutcome::Killed),
            with(2, Some("POST /users"), MutantOutcome::Killed),
            bound,
            with(4, Some("GET /users"), MutantOutcome::Killed),
        ];

        let routes = RouteBreakdown::collect(&mutants, TimeoutPolicy::Exclude);

        let names: Vec<&str> = routes.iter().map(|r| r.route.as_str()).collect();
        assert_eq!(names, vec!["GET /users", "POST /users", "<shared>"]);
        assert_eq!(routes[1].untested_boundaries, vec![3]);
        assert_eq!(routes[1].score, Some(50.0));
        assert_eq!(routes[2].summary.killed, 1);
    }

    #[test]
    fn audit_reports_divergent_classifications() {
        let smart = vec![
            with(1, Some("GET /a"), MutantOutcome::Killed),
            with(2, Some("GET /a"), MutantOutcome::Survived),
        ];
        let same = smart.clone();
        assert!(AuditReport::compare(&smart, &same, TimeoutPolicy::Exclude).passed());

        let mut full = smart.clone();
        full[1].outcome = MutantOutcome::Killed;
        let audit = AuditReport::compare(&smart, &full, TimeoutPolicy::Exclude);
        assert!(!audit.passed());
        assert_eq!(
            audit.divergent,
            vec![AuditDivergence {
                mutant_id: 2,
                smart: MutantOutcome::Survived,
                full: MutantOutcome::Killed,
            }]
        );
        assert_eq!(audit.full_score, Some(100.0));
    }

    #[test]
    fn report_sorts_mutants_and_failure_carries_error() {
        let report = MutationReport::success(
            PathBuf::from("/p"),
            RunMode::Smart,
            RunMode::Smart,
            thresholds(None),
            TimeoutPolicy::Exclude,
            vec![
                with(2, Some("GET /a"), MutantOutcome::Killed),
                with(1, Some("GET /a"), MutantOutcome::Killed),
            ],
        );
        assert_eq!(report.mutants[0].id, 1);
        assert_eq!(report.score, Some(100.0));
        assert!(!report.failed());

        let failure = MutationReport::failure(
            PathBuf::from("/p"),
            RunMode::Incremental,
            thresholds(None),
            "baseline failed".to_string(),
        );
        assert!(failure.failed());
        let json = serde_json::to_value(&failure).unwrap();
        assert_eq!(json["error"], "baseline failed");
        assert_eq!(json["mode"], "incremental");
        assert!(json["score"].is_null());
    }
}
