//! One mutation pass: analyze, generate, select, schedule, execute, aggregate.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tempfile::TempDir;

use crate::analyze::{Analysis, analyze};
use crate::cache::{IncrementalCache, context_fingerprint};
use crate::changes::{ChangeSet, DiffProvider};
use crate::coverage::CoverageRegistry;
use crate::error::ExecError;
use crate::executor::Executor;
use crate::frontend::TextFrontend;
use crate::generate::{ExclusionPolicy, Generation, generate_mutants};
use crate::mutant::{Mutant, MutantOutcome, OperatorCategory};
use crate::options::{Options, RunMode};
use crate::project::Project;
use crate::run_report::{AuditReport, ExcludedCategory, FallbackReason, MutationReport};
use crate::runner::{CancelToken, RunStatus, TestRunResult, TestRunner};
use crate::schedule::{self, Schedule, TestSelection};
use crate::ui::Ui;

/// The baseline runs the whole suite, so it gets a larger budget than a single mutant.
const BASELINE_TIMEOUT_FACTOR: u32 = 10;

/// Everything a pass needs from the outside world.
pub struct PassContext<'a> {
    pub project: &'a Project,
    pub options: &'a Options,
    pub runner: &'a dyn TestRunner,
    pub diff: &'a dyn DiffProvider,
    pub cancel: CancelToken,
}

/// Targets and mutants of the current sources, before any execution.
pub struct Prepared {
    pub analysis: Analysis,
    pub generation: Generation,

    /// Content fingerprint per registered source file.
    pub fingerprints: BTreeMap<PathBuf, String>,
}

/// Effective mode of a pass and why it differs from the requested one.
#[derive(Debug, Clone)]
pub struct ModeDecision {
    pub mode: RunMode,
    pub fallback: Option<(FallbackReason, String)>,

    /// Change-set of an incremental pass.
    pub changes: Option<ChangeSet>,
}

impl ModeDecision {
    fn fall_back(&mut self, reason: FallbackReason, detail: String) {
        self.mode = RunMode::Full;
        self.fallback = Some((reason, detail));
        self.changes = None;
    }
}

pub fn prepare(project: &Project, exclude: &[OperatorCategory]) -> Result<Prepared> {
    let registry = project.registry()?;
    let analysis = analyze(&registry, project, &TextFrontend);
    for e in &analysis.errors {
        log::warn!("analysis: {e}");
    }

    let policy = ExclusionPolicy::new(exclude.iter().copied());
    let excluded: Vec<String> = policy.categories().map(|c| c.to_string()).collect();
    if !excluded.is_empty() {
        log::info!("excluding operator categories: {}", excluded.join(", "));
    }
    let generation = generate_mutants(&analysis.targets, &policy, project);
    for e in &generation.errors {
        log::warn!("discarded mutant: {e}");
    }

    let fingerprints = project
        .source_files()
        .into_iter()
        .filter_map(|src| {
            let fp = src.fingerprint().ok()?;
            Some((src.relative_path().to_path_buf(), fp))
        })
        .collect();

    Ok(Prepared {
        analysis,
        generation,
        fingerprints,
    })
}

/// Decide the effective mode; an incremental pass without a diff runs in full mode.
pub fn resolve_mode(ctx: &PassContext) -> ModeDecision {
    let opts = ctx.options;
    let mut decision = ModeDecision {
        mode: opts.mode,
        fallback: None,
        changes: None,
    };

    if opts.mode == RunMode::Incremental {
        match ctx
            .diff
            .changed_files(ctx.project.root(), &opts.base, opts.head.as_deref())
        {
            Ok(changes) => {
                if changes.is_empty() {
                    log::info!("no files changed since {}", opts.base);
                } else {
                    log::info!("{} files changed since {}", changes.len(), opts.base);
                }
                decision.changes = Some(changes);
            }
            Err(e) => {
                log::warn!("{e}; falling back to full mode");
                decision.fall_back(FallbackReason::DiffUnavailable, e.to_string());
            }
        }
    }

    decision
}

/// Copy the project into a temporary working copy, leaving out `.git` and the output dir.
pub fn copy_working_tree(project: &Project, out_dir: Option<&Path>) -> Result<TempDir> {
    let temp = TempDir::new().context("failed to create temporary directory")?;

    let mut skip = vec![project.root().join(".git")];
    skip.extend(out_dir.map(Path::to_path_buf));
    let skip: Vec<PathBuf> = skip
        .iter()
        .filter_map(|p| p.canonicalize().ok())
        .collect();

    copy_dir_recursive(project.root(), temp.path(), &skip).with_context(|| {
        format!(
            "failed to copy project from {:?} to {:?}",
            project.root(),
            temp.path()
        )
    })?;

    Ok(temp)
}

/// Recursively copy all files and directories from `src` into `dst`, except `skip`.
fn copy_dir_recursive(src: &Path, dst: &Path, skip: &[PathBuf]) -> Result<()> {
    fs::create_dir_all(dst).with_context(|| format!("failed to create dir {:?}", dst))?;

    for entry in fs::read_dir(src).with_context(|| format!("failed to read dir {:?}", src))? {
        let entry = entry?;
        let path = entry.path();
        let target = dst.join(entry.file_name());

        if path.is_dir() {
            let canonical = path.canonicalize()?;
            if skip.contains(&canonical) {
                continue;
            }
            copy_dir_recursive(&path, &target, skip)?;
        } else {
            fs::copy(&path, &target)
                .with_context(|| format!("failed to copy file {:?} to {:?}", path, target))?;
        }
    }

    Ok(())
}

fn baseline_timeout(options: &Options) -> Duration {
    Duration::from_millis(options.timeout_ms) * BASELINE_TIMEOUT_FACTOR
}

fn ensure_green(result: &TestRunResult) -> Result<()> {
    if result.passed() {
        return Ok(());
    }
    let what = match result.status {
        RunStatus::Cancelled => return Err(ExecError::Cancelled.into()),
        RunStatus::Passed | RunStatus::Failed => "failed",
        RunStatus::TimedOut => "timed out",
        RunStatus::Errored => "could not run",
    };
    bail!(
        "baseline test run {what} (exit code {:?}): {}",
        result.exit_code,
        result.summary_line().unwrap_or("no output")
    )
}

/// Run the unmutated suite once. Outside full mode this also builds the coverage registry.
pub fn run_baseline(
    ctx: &PassContext,
    workdir: &Path,
    mode: RunMode,
) -> Result<Option<CoverageRegistry>> {
    let timeout = baseline_timeout(ctx.options);

    if mode == RunMode::Full {
        let result = ctx
            .runner
            .run_tests(workdir, &TestSelection::All, timeout, &ctx.cancel)?;
        ensure_green(&result)?;
        log::info!("baseline passed in {:?}", result.duration);
        return Ok(None);
    }

    if let Some(trace) = &ctx.project.config.tests.trace {
        let result = ctx
            .runner
            .run_tests(workdir, &TestSelection::All, timeout, &ctx.cancel)?;
        ensure_green(&result)?;
        return CoverageRegistry::load_trace(&ctx.project.root().join(trace)).map(Some);
    }

    let trace_dir = tempfile::tempdir().context("failed to create trace directory")?;
    let trace = trace_dir.path().join("trace.tsv");
    let result = ctx
        .runner
        .run_instrumented(workdir, &trace, timeout, &ctx.cancel)?;
    ensure_green(&result)?;
    log::info!("instrumented baseline passed in {:?}", result.duration);

    if !trace.exists() {
        return Ok(Some(CoverageRegistry::new()));
    }
    CoverageRegistry::load_trace(&trace).map(Some)
}

/// Baseline plus the coverage fallback shared by `run` and `plan`.
pub fn baseline_coverage(
    ctx: &PassContext,
    workdir: &Path,
    decision: &mut ModeDecision,
) -> Result<Option<CoverageRegistry>> {
    match run_baseline(ctx, workdir, decision.mode)? {
        Some(coverage) if coverage.is_empty() => {
            let detail = "the instrumented baseline registered no tests".to_string();
            log::warn!("{detail}; falling back to full mode");
            decision.fall_back(FallbackReason::CoverageUnavailable, detail);
            Ok(None)
        }
        Some(coverage) => {
            log::info!(
                "coverage map: {} tests, {} never reach a route",
                coverage.test_count(),
                coverage.uninstrumented().len()
            );
            Ok(Some(coverage))
        }
        None => Ok(None),
    }
}

/// Output-dir path relative to the project root, when it lives inside it.
fn out_dir_in_root(project: &Project, out_dir: Option<&Path>) -> Option<PathBuf> {
    let out = out_dir?.canonicalize().ok()?;
    let root = project.root().canonicalize().ok()?;
    out.strip_prefix(root).ok().map(Path::to_path_buf)
}

/// Fingerprint of the changed non-source files.
fn change_context(
    ctx: &PassContext,
    changes: &ChangeSet,
    fingerprints: &BTreeMap<PathBuf, String>,
) -> String {
    let out = out_dir_in_root(ctx.project, ctx.options.out_dir.as_deref());
    let mut ignore = vec![Path::new(".git")];
    ignore.extend(out.as_deref());
    context_fingerprint(
        ctx.project.root(),
        changes,
        |p| fingerprints.contains_key(p),
        &ignore,
    )
}

/// Mutants to execute and outcomes reused from the cache.
pub fn partition_incremental(
    ctx: &PassContext,
    prepared: &Prepared,
    changes: &ChangeSet,
) -> (Vec<Mutant>, Vec<Mutant>) {
    let cache = match &ctx.options.out_dir {
        Some(dir) => IncrementalCache::load(dir, &ctx.project.config_fingerprint),
        None => IncrementalCache::new(&ctx.project.config_fingerprint, None),
    };
    let context = change_context(ctx, changes, &prepared.fingerprints);
    let partition = cache.partition(
        prepared.generation.mutants.clone(),
        &prepared.fingerprints,
        Some(&context),
    );
    (partition.execute, partition.carried)
}

/// Run one full pass and build its report.
///
/// Execution outcomes never fail the pass; a failed baseline, a failed revert or
/// cancellation do.
pub fn run_pass(ctx: &PassContext, ui: &mut Ui) -> Result<MutationReport> {
    let opts = ctx.options;
    let prepared = prepare(ctx.project, &opts.exclude)?;
    ui.line(format!(
        "{} targets, {} mutants ({} discarded)",
        prepared.analysis.targets.len(),
        prepared.generation.mutants.len(),
        prepared.generation.errors.len()
    ));

    let mut decision = resolve_mode(ctx);
    let workdir = copy_working_tree(ctx.project, opts.out_dir.as_deref())?;
    let coverage = baseline_coverage(ctx, workdir.path(), &mut decision)?;
    if let Some((_, detail)) = &decision.fallback {
        ui.warn(format!("{detail}; running in full mode"));
    }

    let (mut execute, carried) = match &decision.changes {
        Some(changes) if decision.mode == RunMode::Incremental => {
            partition_incremental(ctx, &prepared, changes)
        }
        _ => (prepared.generation.mutants.clone(), Vec::new()),
    };

    let pending = match opts.mutant_limit {
        Some(limit) if execute.len() > limit => execute.split_off(limit),
        _ => Vec::new(),
    };

    ui.line(format!(
        "mode {}: running {} mutants ({} carried forward)",
        decision.mode,
        execute.len(),
        carried.len()
    ));

    let schedule = schedule::plan(execute, coverage.as_ref());
    let group_ids = schedule.group_ids();
    let executor = Executor::new(
        workdir.path(),
        ctx.runner,
        Duration::from_millis(opts.timeout_ms),
        ctx.cancel.clone(),
    );

    let mut classified = classify_uncovered(&schedule, ui);
    classified.extend(execute_schedule(&executor, &schedule, opts.workers, ui)?);

    let conflicts = executor.trace().file_conflicts();
    if !conflicts.is_empty() {
        log::error!("mutants overlapped on the same file: {conflicts:?}");
    }
    log::debug!(
        "peak concurrency {} across {} groups",
        executor.trace().max_concurrency(),
        schedule.independent.len()
    );

    let audit = match (opts.audit, decision.mode) {
        (false, _) => None,
        (true, RunMode::Full) => {
            log::info!("pass already ran in full mode, nothing to audit");
            None
        }
        (true, _) => Some(run_audit(ctx, &executor, &classified, ui)?),
    };

    let mut mutants = carried;
    mutants.extend(classified.into_values());
    mutants.extend(pending);

    let mut report = MutationReport::success(
        ctx.project.root().to_path_buf(),
        opts.mode,
        decision.mode,
        opts.thresholds,
        opts.timeout_policy,
        mutants,
    );
    if let Some((reason, detail)) = &decision.fallback {
        report.fallback_reason = Some(*reason);
        report.fallback_detail = Some(detail.clone());
    }
    report.uninstrumented_tests = coverage
        .as_ref()
        .map(CoverageRegistry::uninstrumented)
        .unwrap_or_default();
    report.excluded_categories = prepared
        .generation
        .excluded
        .iter()
        .map(|(category, targets)| ExcludedCategory {
            category: *category,
            targets: *targets,
        })
        .collect();
    report.analysis_errors = prepared.analysis.errors.clone();
    report.generation_errors = prepared.generation.errors.clone();
    report.changed_files = decision
        .changes
        .as_ref()
        .map(|c| c.iter().cloned().collect());
    report.audit = audit;

    save_cache(ctx, &decision, &prepared, &report, &group_ids);

    Ok(report)
}

/// Mutants no test reaches survive without running.
fn classify_uncovered(schedule: &Schedule, ui: &mut Ui) -> BTreeMap<u64, Mutant> {
    let mut classified = BTreeMap::new();
    for m in &schedule.uncovered {
        let routes: Vec<String> = m.blast_radius.iter().map(|r| r.to_string()).collect();
        let routes = routes.join(", ");
        log::warn!("mutant {} has no covering test (routes: {routes})", m.id);

        let mut m = m.clone();
        m.outcome = MutantOutcome::Survived;
        m.no_coverage = true;
        m.tests_run = Some(0);
        m.duration_ms = Some(0);
        m.note = Some(format!("no test reaches {routes}"));
        ui.mutant_progress(&m);
        classified.insert(m.id, m);
    }
    if !classified.is_empty() {
        ui.warn(format!(
            "{} mutants have no covering test and count as survived",
            classified.len()
        ));
    }
    classified
}

fn execute_schedule(
    executor: &Executor,
    schedule: &Schedule,
    workers: usize,
    ui: &mut Ui,
) -> Result<BTreeMap<u64, Mutant>> {
    let mut by_id: BTreeMap<u64, Mutant> = schedule
        .groups()
        .flat_map(|g| g.mutants.iter())
        .map(|s| (s.mutant.id, s.mutant.clone()))
        .collect();

    executor.run_schedule(schedule, workers, |outcome| {
        if let Some(m) = by_id.get_mut(&outcome.mutant_id) {
            m.record(outcome);
            ui.mutant_progress(m);
        }
    })?;

    Ok(by_id)
}

/// Re-run the classified mutants against the entire suite and compare.
fn run_audit(
    ctx: &PassContext,
    executor: &Executor,
    classified: &BTreeMap<u64, Mutant>,
    ui: &mut Ui,
) -> Result<AuditReport> {
    ui.title(format!("auditing {} mutants in full mode", classified.len()));

    let fresh = classified
        .values()
        .cloned()
        .map(|mut m| {
            m.clear_outcome();
            m
        })
        .collect();
    let schedule = schedule::plan(fresh, None);

    let full = execute_schedule(executor, &schedule, ctx.options.workers, ui)?;

    let smart: Vec<Mutant> = classified.values().cloned().collect();
    let full: Vec<Mutant> = full.into_values().collect();
    let audit = AuditReport::compare(&smart, &full, ctx.options.timeout_policy);
    for d in &audit.divergent {
        log::error!(
            "audit: mutant {} is {} in {} mode but {} in full mode",
            d.mutant_id,
            d.smart.label(),
            ctx.options.mode,
            d.full.label()
        );
    }
    Ok(audit)
}

/// Persist outcomes for the next incremental pass. Partial (`--limit`) passes are not cached.
fn save_cache(
    ctx: &PassContext,
    decision: &ModeDecision,
    prepared: &Prepared,
    report: &MutationReport,
    group_ids: &BTreeMap<u64, u64>,
) {
    let Some(out_dir) = &ctx.options.out_dir else {
        return;
    };
    if ctx.options.mutant_limit.is_some() {
        return;
    }

    let context = match &decision.changes {
        Some(changes) => Some(change_context(ctx, changes, &prepared.fingerprints)),
        None => ctx
            .diff
            .changed_files(
                ctx.project.root(),
                &ctx.options.base,
                ctx.options.head.as_deref(),
            )
            .ok()
            .map(|changes| change_context(ctx, &changes, &prepared.fingerprints)),
    };

    let mut cache = IncrementalCache::new(&ctx.project.config_fingerprint, context);
    cache.record(&prepared.fingerprints, &report.mutants, group_ids);
    if let Err(e) = cache.save(out_dir) {
        log::warn!("failed to save incremental cache: {e:#}");
    }
}


#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::fixtures::{FIXTURE, FakeDiff, FixtureRunner};
    use super::*;

    fn options(project: &Project, mode: RunMode, out_dir: Option<PathBuf>) -> Options {
        let mut opts = Options::from_config(project.root().to_path_buf(), &project.config);
        opts.mode = mode;
        opts.workers = 2;
        opts.out_dir = out_dir;
        opts
    }

    fn pass(
        project: &Project,
        opts: &Options,
        runner: &FixtureRunner,
        diff: &FakeDiff,
    ) -> MutationReport {
        let ctx = PassContext {
            project,
            options: opts,
            runner,
            diff,
            cancel: CancelToken::new(),
        };
        run_pass(&ctx, &mut Ui::silent()).expect("pass should succeed")
    }

    fn outcomes(report: &MutationReport) -> Vec<(u64, MutantOutcome)> {
        report.mutants.iter().map(|m| (m.id, m.outcome)).collect()
    }

    fn no_changes() -> FakeDiff {
        FakeDiff(Ok(BTreeSet::new()))
    }

    /// Copy of the fixture that a test may edit.
    fn scratch_project() -> (TempDir, Project) {
        let dir = tempfile::tempdir().unwrap();
        copy_dir_recursive(Path::new(FIXTURE), dir.path(), &[]).unwrap();
        let project = Project::from_root(dir.path().to_path_buf()).unwrap();
        (dir, project)
    }

    #[test]
    fn smart_pass_kills_everything_with_scoped_tests() {
        let project = Project::from_root(PathBuf::from(FIXTURE)).unwrap();
        let opts = options(&project, RunMode::Smart, None);

        let report = pass(&project, &opts, &FixtureRunner::default(), &no_changes());

        assert_eq!(report.mode, RunMode::Smart);
        assert_eq!(report.summary.total, 10);
        assert_eq!(report.summary.killed, 10);
        assert_eq!(report.score, Some(100.0));
        assert_eq!(report.uninstrumented_tests, vec!["test_health".to_string()]);
        assert!(report.mutants.iter().all(|m| m.tests_run == Some(1)));
        let post = report.routes.iter().find(|r| r.route == "POST /users").unwrap();
        assert_eq!(post.score, Some(100.0));
        assert!(post.untested_boundaries.is_empty());
        assert_eq!(
            report.excluded_categories,
            vec![ExcludedCategory {
                category: OperatorCategory::StringLiteral,
                targets: 4
            }]
        );
    }

    #[test]
    fn smart_and_full_classify_identically() {
        let project = Project::from_root(PathBuf::from(FIXTURE)).unwrap();
        let runner = FixtureRunner::default();

        let smart = pass(&project, &options(&project, RunMode::Smart, None), &runner, &no_changes());
        let full = pass(&project, &options(&project, RunMode::Full, None), &runner, &no_changes());

        assert_eq!(outcomes(&smart), outcomes(&full));
        assert_eq!(smart.score, full.score);
        assert!(full.mutants.iter().all(|m| m.tests_run.is_none()));
    }

    #[test]
    fn audit_passes_when_coverage_is_complete() {
        let project = Project::from_root(PathBuf::from(FIXTURE)).unwrap();
        let mut opts = options(&project, RunMode::Smart, None);
        opts.audit = true;

        let report = pass(&project, &opts, &FixtureRunner::default(), &no_changes());

        let audit = report.audit.as_ref().expect("audit section");
        assert_eq!(audit.compared, 10);
        assert!(audit.passed());
        assert!(!report.failed());
    }

    #[test]
    fn uncovered_route_survives_and_audit_catches_it() {
        let project = Project::from_root(PathBuf::from(FIXTURE)).unwrap();
        let mut opts = options(&project, RunMode::Smart, None);
        opts.audit = true;
        let runner = FixtureRunner {
            trace_list: false,
            ..FixtureRunner::default()
        };

        let report = pass(&project, &opts, &runner, &no_changes());

        assert_eq!(report.summary.no_coverage, 6);
        assert_eq!(report.summary.survived, 6);
        assert_eq!(report.score, Some(40.0));
        let uncovered = report.mutants.iter().find(|m| m.no_coverage).unwrap();
        assert_eq!(uncovered.note.as_deref(), Some("no test reaches GET /users"));

        let audit = report.audit.as_ref().unwrap();
        assert_eq!(audit.divergent.len(), 6);
        assert_eq!(audit.full_score, Some(100.0));
        assert!(report.failed());
    }

    #[test]
    fn missing_diff_falls_back_to_full() {
        let project = Project::from_root(PathBuf::from(FIXTURE)).unwrap();
        let opts = options(&project, RunMode::Incremental, None);

        let report = pass(
            &project,
            &opts,
            &FixtureRunner::default(),
            &FakeDiff(Err("not a git repository")),
        );

        assert_eq!(report.requested_mode, RunMode::Incremental);
        assert_eq!(report.mode, RunMode::Full);
        assert_eq!(report.fallback_reason, Some(FallbackReason::DiffUnavailable));
        assert!(report.fallback_detail.unwrap().contains("not a git repository"));
        assert_eq!(report.summary.killed, 10);
    }

    #[test]
    fn empty_trace_falls_back_to_full() {
        let project = Project::from_root(PathBuf::from(FIXTURE)).unwrap();
        let opts = options(&project, RunMode::Smart, None);
        let runner = FixtureRunner {
            write_trace: false,
            ..FixtureRunner::default()
        };

        let report = pass(&project, &opts, &runner, &no_changes());

        assert_eq!(report.mode, RunMode::Full);
        assert_eq!(report.fallback_reason, Some(FallbackReason::CoverageUnavailable));
        assert_eq!(report.summary.killed, 10);
    }

    #[test]
    fn incremental_pass_reruns_only_changed_files() {
        let (dir, project) = scratch_project();
        let out = dir.path().join("smart-mutant.out");
        let runner = FixtureRunner::default();

        let first = pass(&project, &options(&project, RunMode::Smart, Some(out.clone())), &runner, &no_changes());
        assert!(out.join("cache.json").exists());

        let users = dir.path().join("app/users.py");
        let edited = fs::read_to_string(&users)
            .unwrap()
            .replace("limit too large", "too large");
        fs::write(&users, edited).unwrap();

        let changed = FakeDiff(Ok(BTreeSet::from(["app/users.py"])));
        let second = pass(&project, &options(&project, RunMode::Incremental, Some(out)), &runner, &changed);

        assert_eq!(second.mode, RunMode::Incremental);
        assert_eq!(second.summary.carried_forward, 3);
        assert_eq!(second.summary.executed, 7);
        assert!(second
            .mutants
            .iter()
            .filter(|m| m.carried_forward)
            .all(|m| m.span.file == Path::new("app/models.py") && m.duration_ms == Some(0)));
        assert_eq!(outcomes(&first), outcomes(&second));
        assert_eq!(second.changed_files, Some(vec![PathBuf::from("app/users.py")]));
    }

    #[test]
    fn back_to_back_incremental_passes_converge() {
        let (dir, project) = scratch_project();
        let out = dir.path().join("smart-mutant.out");
        let runner = FixtureRunner::default();
        let changed = FakeDiff(Ok(BTreeSet::from(["app/users.py"])));
        let opts = options(&project, RunMode::Incremental, Some(out));

        let first = pass(&project, &opts, &runner, &changed);
        let second = pass(&project, &opts, &runner, &changed);
        let third = pass(&project, &opts, &runner, &changed);

        assert_eq!(first.summary.executed, 10);
        assert_eq!(second.summary.executed, 0);
        assert_eq!(second.summary.carried_forward, 10);
        assert_eq!(outcomes(&first), outcomes(&second));
        assert!(second.mutants.iter().all(|m| m.duration_ms == Some(0)));

        assert_eq!(second.summary, third.summary);
        assert_eq!(second.routes, third.routes);
        assert_eq!(second.score, third.score);
        assert_eq!(
            serde_json::to_value(&second.mutants).unwrap(),
            serde_json::to_value(&third.mutants).unwrap()
        );
    }

    #[test]
    fn missing_rejection_case_leaves_boundary_untested() {
        let project = Project::from_root(PathBuf::from(FIXTURE)).unwrap();
        let runner = FixtureRunner {
            rejects_minor: false,
            ..FixtureRunner::default()
        };

        let report = pass(&project, &options(&project, RunMode::Smart, None), &runner, &no_changes());

        let survived: Vec<&str> = report
            .mutants
            .iter()
            .filter(|m| m.outcome == MutantOutcome::Survived)
            .map(|m| m.operator.name.as_str())
            .collect();
        assert_eq!(survived, vec!["remove_constraint", "bound_decrement"]);

        let post = report.routes.iter().find(|r| r.route == "POST /users").unwrap();
        assert_eq!(post.untested_boundaries, vec![1, 2]);
        assert_eq!(post.score, Some(50.0));
        assert_eq!(report.score, Some(80.0));
    }

    #[test]
    fn changed_tests_invalidate_the_cache() {
        let (dir, project) = scratch_project();
        let out = dir.path().join("smart-mutant.out");
        let runner = FixtureRunner::default();

        pass(&project, &options(&project, RunMode::Smart, Some(out.clone())), &runner, &no_changes());

        fs::create_dir_all(dir.path().join("tests")).unwrap();
        fs::write(dir.path().join("tests/test_users.py"), "def test_new(): pass\n").unwrap();
        let changed = FakeDiff(Ok(BTreeSet::from(["tests/test_users.py"])));
        let report = pass(&project, &options(&project, RunMode::Incremental, Some(out)), &runner, &changed);

        assert_eq!(report.summary.carried_forward, 0);
        assert_eq!(report.summary.executed, 10);
    }

    #[test]
    fn limit_leaves_the_rest_not_run_and_skips_the_cache() {
        let (dir, project) = scratch_project();
        let out = dir.path().join("smart-mutant.out");
        let mut opts = options(&project, RunMode::Smart, Some(out.clone()));
        opts.mutant_limit = Some(4);

        let report = pass(&project, &opts, &FixtureRunner::default(), &no_changes());

        assert_eq!(report.summary.killed, 4);
        assert_eq!(report.summary.not_run, 6);
        assert!(!out.join("cache.json").exists());
    }

    #[test]
    fn working_copy_skips_git_and_output() {
        let (dir, project) = scratch_project();
        fs::create_dir_all(dir.path().join(".git")).unwrap();
        fs::write(dir.path().join(".git/HEAD"), "ref: refs/heads/main\n").unwrap();
        let out = dir.path().join("smart-mutant.out");
        fs::create_dir_all(&out).unwrap();

        let copy = copy_working_tree(&project, Some(&out)).unwrap();

        assert!(copy.path().join("app/users.py").exists());
        assert!(!copy.path().join(".git").exists());
        assert!(!copy.path().join("smart-mutant.out").exists());
    }
}
