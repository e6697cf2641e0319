mod analyze;
mod cache;
mod changes;
mod cli;
mod config;
mod coverage;
mod engine;
mod error;
mod executor;
mod frontend;
mod generate;
mod mutant;
mod options;
mod out;
mod patch;
mod pipeline;
mod project;
mod report;
mod route;
mod run_report;
mod runner;
mod scan;
mod schedule;
mod source;
mod span;
mod ui;
mod watch;

use env_logger::Env;

/// Entry point for the `smart-mutant` binary.
fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("warn")).init();
    cli::run()
}
