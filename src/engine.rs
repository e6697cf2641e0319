use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use anyhow::Result;
use serde::Serialize;

use crate::coverage::CoverageRegistry;
use crate::mutant::{Mutant, OperatorCategory};
use crate::options::RunMode;
use crate::pipeline::{
    ModeDecision, PassContext, baseline_coverage, copy_working_tree, partition_incremental,
    prepare, resolve_mode,
};
use crate::run_report::FallbackReason;
use crate::schedule::{TestSelection, select_tests};

/// Configuration handed to an exhaustive mutation engine so it only does the scoped work.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineConfig {
    pub mode: RunMode,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<FallbackReason>,

    /// Files with mutants to execute, sorted.
    pub mutate: Vec<PathBuf>,

    pub excluded_categories: Vec<OperatorCategory>,
    pub concurrency: usize,
    pub timeout_ms: u64,
    pub test_command: Vec<String>,

    /// Tests to run per mutated file; `None` runs the entire suite everywhere.
    pub test_filter: Option<BTreeMap<PathBuf, Vec<String>>>,

    /// Mutants the engine is expected to produce.
    pub mutants: usize,
}

impl EngineConfig {
    pub fn build(
        ctx: &PassContext,
        decision: &ModeDecision,
        mutants: &[Mutant],
        coverage: Option<&CoverageRegistry>,
    ) -> Self {
        let mutate: BTreeSet<PathBuf> = mutants.iter().map(|m| m.span.file.clone()).collect();

        let test_filter = coverage.map(|coverage| {
            let mut filter: BTreeMap<PathBuf, BTreeSet<String>> = BTreeMap::new();
            for m in mutants {
                let tests = filter.entry(m.span.file.clone()).or_default();
                if let TestSelection::Only(ids) = select_tests(m, Some(coverage)) {
                    tests.extend(ids);
                }
            }
            filter
                .into_iter()
                .map(|(file, tests)| (file, tests.into_iter().collect()))
                .collect()
        });

        let mut excluded = ctx.options.exclude.clone();
        excluded.sort();
        excluded.dedup();

        Self {
            mode: decision.mode,
            fallback_reason: decision.fallback.as_ref().map(|(reason, _)| *reason),
            mutate: mutate.into_iter().collect(),
            excluded_categories: excluded,
            concurrency: ctx.options.workers,
            timeout_ms: ctx.options.timeout_ms,
            test_command: ctx.project.config.tests.command.clone(),
            test_filter,
            mutants: mutants.len(),
        }
    }
}

/// Work out what a pass would execute without executing any mutant.
///
/// Outside full mode this still runs the instrumented baseline to learn coverage.
pub fn plan(ctx: &PassContext) -> Result<EngineConfig> {
    let prepared = prepare(ctx.project, &ctx.options.exclude)?;
    let mut decision = resolve_mode(ctx);

    let coverage = if decision.mode == RunMode::Full {
        None
    } else {
        let workdir = copy_working_tree(ctx.project, ctx.options.out_dir.as_deref())?;
        baseline_coverage(ctx, workdir.path(), &mut decision)?
    };

    let execute = match &decision.changes {
        Some(changes) if decision.mode == RunMode::Incremental => {
            partition_incremental(ctx, &prepared, changes).0
        }
        _ => prepared.generation.mutants.clone(),
    };

    Ok(EngineConfig::build(ctx, &decision, &execute, coverage.as_ref()))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::path::{Path, PathBuf};

    use super::*;
    use crate::options::Options;
    use crate::pipeline::fixtures::{FIXTURE, FakeDiff, FixtureRunner};
    use crate::project::Project;
    use crate::runner::CancelToken;

    fn plan_for(mode: RunMode, diff: FakeDiff) -> EngineConfig {
        let project = Project::from_root(PathBuf::from(FIXTURE)).unwrap();
        let mut options = Options::from_config(project.root().to_path_buf(), &project.config);
        options.mode = mode;
        options.workers = 3;
        options.out_dir = None;
        let runner = FixtureRunner::default();
        let ctx = PassContext {
            project: &project,
            options: &options,
            runner: &runner,
            diff: &diff,
            cancel: CancelToken::new(),
        };
        plan(&ctx).unwrap()
    }

    #[test]
    fn smart_plan_filters_tests_per_file() {
        let config = plan_for(RunMode::Smart, FakeDiff(Ok(BTreeSet::new())));

        assert_eq!(config.mode, RunMode::Smart);
        assert_eq!(
            config.mutate,
            vec![PathBuf::from("app/models.py"), PathBuf::from("app/users.py")]
        );
        assert_eq!(config.mutants, 10);
        assert_eq!(config.concurrency, 3);
        assert_eq!(config.excluded_categories, vec![OperatorCategory::StringLiteral]);

        let filter = config.test_filter.expect("smart plans carry a filter");
        assert_eq!(filter[Path::new("app/models.py")], vec!["test_create_user_adult"]);
        assert_eq!(
            filter[Path::new("app/users.py")],
            vec!["test_create_user_adult", "test_list_users_limit"]
        );
    }

    #[test]
    fn full_plan_runs_the_whole_suite() {
        let config = plan_for(RunMode::Full, FakeDiff(Ok(BTreeSet::new())));
        assert_eq!(config.test_filter, None);
        assert_eq!(config.test_command, vec!["sh", "run_tests.sh"]);
    }

    #[test]
    fn incremental_plan_without_diff_falls_back() {
        let config = plan_for(RunMode::Incremental, FakeDiff(Err("no repository")));
        assert_eq!(config.mode, RunMode::Full);
        assert_eq!(config.fallback_reason, Some(FallbackReason::DiffUnavailable));
        assert_eq!(config.mutants, 10);
    }

    #[test]
    fn cold_incremental_plan_mutates_everything() {
        let config = plan_for(
            RunMode::Incremental,
            FakeDiff(Ok(BTreeSet::from(["app/users.py"]))),
        );
        assert_eq!(config.mode, RunMode::Incremental);
        assert_eq!(config.mutants, 10);
    }
}
