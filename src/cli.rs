use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;

use crate::changes::{DiffProvider, GitDiff};
use crate::engine;
use crate::mutant::OperatorCategory;
use crate::options::{Options, RunMode};
use crate::out;
use crate::pipeline::{PassContext, run_pass};
use crate::project::Project;
use crate::report::print_report;
use crate::run_report::MutationReport;
use crate::runner::{CancelToken, CommandRunner};
use crate::scan::{ProjectOverview, scan_project};
use crate::ui::Ui;
use crate::watch::{self, WatchSession};

const EXIT_OK: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_BELOW_BREAK: i32 = 2;

/// Top-level CLI arguments for the `smart-mutant` binary.
#[derive(Debug, Parser)]
#[command(
    name = "smart-mutant",
    version,
    about = "Targeted mutation testing for declarative route handlers"
)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands supported by `smart-mutant`.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Show the route registry and the mutation targets it yields.
    Scan {
        /// Project root, or any path inside it.
        #[arg(long, default_value = ".")]
        project: PathBuf,

        /// Emit the overview as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Run mutation testing.
    Run(RunArgs),

    /// Print the configuration an exhaustive mutation engine needs for the same scope.
    Plan {
        /// Project root, or any path inside it.
        #[arg(long, default_value = ".")]
        project: PathBuf,

        #[arg(long, value_enum, default_value_t = RunMode::Smart)]
        mode: RunMode,

        /// Base reference for incremental mode.
        #[arg(long, default_value = "HEAD")]
        base: String,

        /// Head reference; defaults to the working tree.
        #[arg(long)]
        head: Option<String>,
    },
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Project root, or any path inside it.
    #[arg(long, default_value = ".")]
    project: PathBuf,

    #[arg(long, value_enum, default_value_t = RunMode::Smart)]
    mode: RunMode,

    /// Base reference for incremental mode.
    #[arg(long, default_value = "HEAD")]
    base: String,

    /// Head reference; defaults to the working tree.
    #[arg(long)]
    head: Option<String>,

    /// Re-run the executed mutants against the entire suite and compare.
    #[arg(long)]
    audit: bool,

    /// Run again whenever the project changes.
    #[arg(long)]
    watch: bool,

    /// Worker threads (defaults to the config value, then the CPU count).
    #[arg(long)]
    workers: Option<usize>,

    /// Per-mutant test budget in milliseconds.
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Operator category to leave out; replaces the configured list.
    #[arg(long = "exclude", value_name = "CATEGORY")]
    exclude: Vec<OperatorCategory>,

    /// Execute only the first N mutants (deterministic order).
    #[arg(long)]
    limit: Option<usize>,

    /// Emit a machine-readable JSON report to stdout.
    #[arg(long)]
    json: bool,

    /// Output directory (defaults to `smart-mutant.out` in the project root).
    #[arg(long, conflicts_with = "no_out")]
    out: Option<PathBuf>,

    /// Do not write an output directory (and no incremental cache).
    #[arg(long)]
    no_out: bool,

    /// Print a detailed list of all mutants and their outcomes.
    #[arg(long, short = 'v')]
    verbose: bool,
}

fn print_json_and_exit<T: Serialize>(value: &T, exit_code: i32) -> ! {
    print_json(value);
    std::process::exit(exit_code);
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{json}"),
        Err(e) => {
            eprintln!("failed to serialize JSON output: {e}");
            std::process::exit(EXIT_ERROR);
        }
    }
}

/// Parse CLI arguments and dispatch the selected command.
pub fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Scan { project, json } => scan(&project, json),
        Command::Run(args) => run_mutants(args),
        Command::Plan {
            project,
            mode,
            base,
            head,
        } => plan(project, mode, base, head),
    }
}

fn scan(project: &Path, json: bool) -> Result<()> {
    let ui = Ui::new(json);
    let overview = match scan_project(project) {
        Ok(o) => o,
        Err(e) => {
            ui.error(format!("failed to analyze project at {project:?}: {e:#}"));
            return Err(e);
        }
    };

    if json {
        print_json(&overview);
    } else {
        print_scan_summary(&ui, &overview);
    }
    Ok(())
}

/// Print a short summary based on the project overview.
fn print_scan_summary(ui: &Ui, overview: &ProjectOverview) {
    ui.title("--- project overview ---");
    ui.line(format!("project root:   {}", overview.root.display()));
    ui.line(format!("source files:   {}", overview.files));
    ui.line(format!("routes:         {}", overview.routes.len()));
    ui.line(format!("shared regions: {}", overview.shared.len()));
    ui.line(format!("targets:        {}", overview.targets));
    ui.line(format!("mutants:        {}", overview.mutants));

    for r in &overview.routes {
        ui.line(format!(
            "  {:<24} {} targets, {} mutants",
            r.route.to_string(),
            r.targets,
            r.mutants
        ));
    }
    for (category, count) in &overview.targets_by_category {
        let excluded = overview.excluded.get(category).copied().unwrap_or(0);
        if excluded > 0 {
            ui.line(format!("  {category}: {count} targets (excluded)"));
        } else {
            ui.line(format!("  {category}: {count} targets"));
        }
    }
    for e in &overview.analysis_errors {
        ui.error(format!("skipped: {e}"));
    }
}

fn load_project(path: PathBuf, mode: RunMode, json: bool, ui: &Ui) -> Result<Project> {
    match Project::from_root(path.clone()) {
        Ok(p) => Ok(p),
        Err(e) => {
            if json {
                let report = MutationReport::failure(
                    path,
                    mode,
                    Default::default(),
                    format!("failed to load project: {e:#}"),
                );
                print_json_and_exit(&report, EXIT_ERROR);
            }
            ui.error(format!("failed to load project at {path:?}: {e:#}"));
            Err(e)
        }
    }
}

fn run_options(args: &RunArgs, project: &Project) -> Options {
    let mut options = Options::from_config(project.root().to_path_buf(), &project.config);
    options.mode = args.mode;
    options.base = args.base.clone();
    options.head = args.head.clone();
    options.audit = args.audit;
    options.watch = args.watch;
    if let Some(workers) = args.workers {
        options.workers = workers.max(1);
    }
    if let Some(timeout_ms) = args.timeout_ms {
        options.timeout_ms = timeout_ms;
    }
    if !args.exclude.is_empty() {
        options.exclude = args.exclude.clone();
    }
    options.mutant_limit = args.limit;
    options.json_output = args.json;
    options.verbose = args.verbose;
    options.out_dir = match (&args.out, args.no_out) {
        (_, true) => None,
        (Some(dir), false) => Some(dir.clone()),
        (None, false) => options.out_dir,
    };
    options
}

fn run_mutants(args: RunArgs) -> Result<()> {
    let mut ui = Ui::new(args.json);
    ui.title("smart-mutant: run");

    let project = load_project(args.project.clone(), args.mode, args.json, &ui)?;
    let options = run_options(&args, &project);
    ui.line(format!("project: {:?}", project.root()));

    if options.watch {
        let session = WatchSession::new();
        let handler = session.clone();
        ctrlc::set_handler(move || handler.interrupt()).context("failed to install Ctrl-C handler")?;

        return watch::watch(
            project.root(),
            options.out_dir.as_deref(),
            &session,
            |cancel| {
                let result = watch_pass(&args, &mut ui, &GitDiff, cancel);
                ui.line("watching for changes (Ctrl-C to stop)");
                result.map(|_| ())
            },
        );
    }

    let runner = CommandRunner::from_config(&project.config.tests);
    let diff = GitDiff;

    let cancel = CancelToken::new();
    let handler = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || handler.cancel()) {
        log::warn!("failed to install Ctrl-C handler: {e}");
    }

    let ctx = PassContext {
        project: &project,
        options: &options,
        runner: &runner,
        diff: &diff,
        cancel,
    };

    let report = match run_pass(&ctx, &mut ui) {
        Ok(r) => r,
        Err(e) => {
            if options.json_output {
                let report = MutationReport::failure(
                    project.root().to_path_buf(),
                    options.mode,
                    options.thresholds,
                    format!("{e:#}"),
                );
                print_json_and_exit(&report, EXIT_ERROR);
            }
            ui.error(format!("mutation run failed: {e:#}"));
            return Err(e);
        }
    };

    let exit_code = publish(&mut ui, &project, &options, &report);
    if exit_code != EXIT_OK {
        std::process::exit(exit_code);
    }
    Ok(())
}

/// One pass of `run --watch`.
///
/// The project is loaded again for every pass so edits to `smart-mutant.toml` take
/// effect. A project that fails to load fails this pass only; `None` is returned.
fn watch_pass(
    args: &RunArgs,
    ui: &mut Ui,
    diff: &dyn DiffProvider,
    cancel: CancelToken,
) -> Result<Option<MutationReport>> {
    let project = match Project::from_root(args.project.clone()) {
        Ok(p) => p,
        Err(e) => {
            let message = format!("failed to load project: {e:#}");
            if args.json {
                print_json(&MutationReport::failure(
                    args.project.clone(),
                    args.mode,
                    Default::default(),
                    message.clone(),
                ));
            }
            ui.error(message);
            return Ok(None);
        }
    };

    let options = run_options(args, &project);
    let runner = CommandRunner::from_config(&project.config.tests);
    let ctx = PassContext {
        project: &project,
        options: &options,
        runner: &runner,
        diff,
        cancel,
    };

    let report = run_pass(&ctx, ui)?;
    publish(ui, &project, &options, &report);
    Ok(Some(report))
}

/// Write the output directory and print the report; returns the exit code.
fn publish(ui: &mut Ui, project: &Project, options: &Options, report: &MutationReport) -> i32 {
    if let Some(dir) = &options.out_dir {
        if let Err(e) = out::write_all(dir, project, report) {
            ui.warn(format!("failed to write output directory {dir:?}: {e:#}"));
        }
    }

    let exit_code = if report.failed() {
        EXIT_ERROR
    } else if report.gate.break_failed {
        EXIT_BELOW_BREAK
    } else {
        EXIT_OK
    };

    if options.json_output {
        print_json(report);
    } else {
        print_report(ui, project, report, options.verbose);
    }
    exit_code
}

fn plan(project: PathBuf, mode: RunMode, base: String, head: Option<String>) -> Result<()> {
    let project = Project::from_root(project)?;
    let mut options = Options::from_config(project.root().to_path_buf(), &project.config);
    options.mode = mode;
    options.base = base;
    options.head = head;

    let runner = CommandRunner::from_config(&project.config.tests);
    let cancel = CancelToken::new();
    let handler = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || handler.cancel()) {
        log::warn!("failed to install Ctrl-C handler: {e}");
    }

    let ctx = PassContext {
        project: &project,
        options: &options,
        runner: &runner,
        diff: &GitDiff,
        cancel,
    };
    let config = engine::plan(&ctx)?;
    print_json(&config);
    Ok(())
}
