use console::{Term, style};
use std::{env, fmt::Display};

use crate::mutant::{Mutant, MutantOutcome};

/// Small UI helper:
/// - normal mode: human output to stdout, warnings and errors to stderr
/// - `--json` mode: ALL human output to stderr (stdout stays machine-readable JSON)
/// - fancy styling only on a real TTY and when NO_COLOR/CI are not set
#[derive(Debug, Clone)]
pub struct Ui {
    out: Term,
    err: Term,
    fancy: bool,
    enabled: bool,

    // Progress counters; they do not affect output formatting.
    progress_killed: u64,
    progress_survived: u64,
    progress_timeout: u64,
    progress_errored: u64,
    warnings: u64,
}

impl Ui {
    pub fn new(json: bool) -> Self {
        // In --json mode, keep stdout clean for JSON and send all human output to stderr.
        let out = if json { Term::stderr() } else { Term::stdout() };
        let err = Term::stderr();

        // Fancy output must only activate when the actual stream used for human output is a TTY.
        let out_is_tty = out.is_term();

        let no_color = env::var_os("NO_COLOR").is_some();
        let in_ci = env::var_os("CI").is_some();

        Self {
            out,
            err,
            fancy: out_is_tty && !no_color && !in_ci,
            enabled: true,
            progress_killed: 0,
            progress_survived: 0,
            progress_timeout: 0,
            progress_errored: 0,
            warnings: 0,
        }
    }

    /// Useful for unit tests to avoid noisy output.
    #[cfg(test)]
    pub fn silent() -> Self {
        Self {
            enabled: false,
            fancy: false,
            ..Self::new(false)
        }
    }

    fn write_out(&self, s: &str) {
        if self.enabled {
            let _ = self.out.write_line(s);
        }
    }

    fn write_err(&self, s: &str) {
        if self.enabled {
            let _ = self.err.write_line(s);
        }
    }

    pub fn line(&self, msg: impl Display) {
        self.write_out(&msg.to_string());
    }

    pub fn title(&self, msg: impl Display) {
        let s = msg.to_string();
        if self.fancy {
            self.write_out(&style(s).bold().to_string());
        } else {
            self.write_out(&s);
        }
    }

    /// Degraded-mode notices and skipped work.
    pub fn warn(&mut self, msg: impl Display) {
        self.warnings = self.warnings.saturating_add(1);
        let s = format!("warning: {msg}");
        if self.fancy {
            self.write_err(&style(s).yellow().to_string());
        } else {
            self.write_err(&s);
        }
    }

    pub fn error(&self, msg: impl Display) {
        let s = msg.to_string();
        if self.fancy {
            self.write_err(&style(s).red().bold().to_string());
        } else {
            self.write_err(&s);
        }
    }

    /// Per-mutant progress line.
    ///
    /// Non-fancy lines are plain and stable; integration tests run with NO_COLOR=1.
    pub fn mutant_progress(&mut self, m: &Mutant) {
        let counter = match m.outcome {
            MutantOutcome::Killed => &mut self.progress_killed,
            MutantOutcome::Survived => &mut self.progress_survived,
            MutantOutcome::Timeout => &mut self.progress_timeout,
            MutantOutcome::Errored => &mut self.progress_errored,
            MutantOutcome::NotRun => return,
        };
        *counter = counter.saturating_add(1);

        if !self.is_fancy() {
            let what = match m.outcome {
                MutantOutcome::Killed => "killed (tests failed under mutation)",
                MutantOutcome::Survived if m.no_coverage => "survived (no test reaches it)",
                MutantOutcome::Survived => "survived (tests still pass)",
                MutantOutcome::Timeout => "timed out",
                MutantOutcome::Errored => "errored",
                MutantOutcome::NotRun => return,
            };
            self.line(format!("mutant {} {what}", m.id));
            return;
        }

        let tag = match m.outcome {
            MutantOutcome::Killed => style("KILLED").green().bold(),
            MutantOutcome::Survived => style("SURVIVED").red().bold(),
            MutantOutcome::Timeout => style("TIMEOUT").yellow().bold(),
            MutantOutcome::Errored => style("ERRORED").yellow().bold(),
            MutantOutcome::NotRun => return,
        };

        let dur = m
            .duration_ms
            .map(|ms| format!("{ms}ms"))
            .unwrap_or_else(|| "-".to_string());

        self.line(format!(
            "{tag} {dur:>6}  #{id} {route} {file} [{start}..{end}] {cat}/{op}: {orig:?} -> {mutated:?}",
            id = m.id,
            route = m.route_label(),
            file = m.span.file.display(),
            start = m.span.start,
            end = m.span.end,
            cat = m.operator.category,
            op = m.operator.name,
            orig = m.original_snippet,
            mutated = m.mutated_snippet,
        ));
    }

    pub fn is_fancy(&self) -> bool {
        self.fancy && self.enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutant::fixtures::mutant;

    #[test]
    fn is_fancy_requires_fancy_and_enabled() {
        let base = Ui::silent();

        let mut a = base.clone();
        a.fancy = true;
        assert!(!a.is_fancy());

        let mut b = base.clone();
        b.enabled = true;
        assert!(!b.is_fancy());

        let mut c = base;
        c.fancy = true;
        c.enabled = true;
        assert!(c.is_fancy());
    }

    #[test]
    fn warn_increments_counter() {
        let mut ui = Ui::silent();
        ui.warn("diff unavailable");
        ui.warn("no coverage");
        assert_eq!(ui.warnings, 2);
    }

    #[test]
    fn mutant_progress_tracks_every_classification() {
        let mut ui = Ui::silent();
        let mut m = mutant(1, "app/users.py", 10, Some("GET /users"));

        ui.mutant_progress(&m);
        assert_eq!(ui.progress_killed + ui.progress_survived, 0);

        for outcome in [
            MutantOutcome::Killed,
            MutantOutcome::Survived,
            MutantOutcome::Timeout,
            MutantOutcome::Errored,
            MutantOutcome::Killed,
        ] {
            m.outcome = outcome;
            ui.mutant_progress(&m);
        }

        assert_eq!(ui.progress_killed, 2);
        assert_eq!(ui.progress_survived, 1);
        assert_eq!(ui.progress_timeout, 1);
        assert_eq!(ui.progress_errored, 1);
    }
}
