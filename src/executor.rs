use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::ExecError;
use crate::mutant::{Mutant, MutantOutcome, MutationOutcome};
use crate::patch::apply_checked_patch;
use crate::runner::{CancelToken, RunStatus, TestRunner};
use crate::schedule::{Schedule, TestSelection};

/// Per-file mutual exclusion: at most one mutant is applied to a file at any time.
#[derive(Debug, Default)]
pub struct FileLocks {
    held: Mutex<BTreeSet<PathBuf>>,
    released: Condvar,
}

impl FileLocks {
    /// Block until `file` is free, then hold it until the returned guard drops.
    pub fn lock(&self, file: &Path) -> FileLock<'_> {
        let mut held = self.held.lock();
        while held.contains(file) {
            self.released.wait(&mut held);
        }
        held.insert(file.to_path_buf());
        FileLock {
            locks: self,
            file: file.to_path_buf(),
        }
    }
}

pub struct FileLock<'a> {
    locks: &'a FileLocks,
    file: PathBuf,
}

impl Drop for FileLock<'_> {
    fn drop(&mut self) {
        self.locks.held.lock().remove(&self.file);
        self.locks.released.notify_all();
    }
}

/// A mutant applied to the working copy.
///
/// [`MutationGuard::revert`] restores the file and verifies it; dropping an unreverted guard
/// restores the file best-effort.
pub struct MutationGuard {
    mutant_id: u64,
    path: PathBuf,
    rel: PathBuf,
    original: String,
    restored: bool,
}

impl MutationGuard {
    pub fn apply(workdir: &Path, mutant: &Mutant) -> Result<Self, ExecError> {
        let rel = mutant.span.file.clone();
        let path = workdir.join(&rel);
        let apply_err = |reason: String| ExecError::Apply {
            mutant_id: mutant.id,
            file: rel.clone(),
            reason,
        };

        let original = fs::read_to_string(&path).map_err(|e| apply_err(e.to_string()))?;
        let mutated = apply_checked_patch(
            &original,
            &mutant.span,
            &mutant.original_snippet,
            &mutant.mutated_snippet,
        )
        .map_err(|e| apply_err(e.to_string()))?;

        let guard = Self {
            mutant_id: mutant.id,
            path,
            rel: rel.clone(),
            original,
            restored: false,
        };
        fs::write(&guard.path, mutated).map_err(|e| apply_err(e.to_string()))?;
        Ok(guard)
    }

    /// Write the original contents back and read them again to make sure they stuck.
    pub fn revert(mut self) -> Result<(), ExecError> {
        let fail = |source: io::Error| ExecError::RevertFailure {
            mutant_id: self.mutant_id,
            file: self.rel.clone(),
            source,
        };

        fs::write(&self.path, &self.original).map_err(fail)?;
        let back = fs::read_to_string(&self.path).map_err(fail)?;
        if back != self.original {
            return Err(fail(io::Error::other("file contents differ after restore")));
        }

        self.restored = true;
        Ok(())
    }
}

impl Drop for MutationGuard {
    fn drop(&mut self) {
        if self.restored {
            return;
        }
        if let Err(e) = fs::write(&self.path, &self.original) {
            log::error!(
                "failed to restore {:?} after mutant {}: {e}",
                self.rel,
                self.mutant_id
            );
        }
    }
}

/// Active interval of one mutant: from acquiring its file until the file was restored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceSpan {
    pub mutant_id: u64,
    pub file: PathBuf,
    pub worker: usize,
    pub started_us: u64,
    pub finished_us: u64,
}

impl TraceSpan {
    fn overlaps(&self, other: &TraceSpan) -> bool {
        self.started_us < other.finished_us && other.started_us < self.finished_us
    }
}

/// Record of when each mutant was live, for checking scheduling safety after the fact.
#[derive(Debug)]
pub struct ExecutionTrace {
    origin: Instant,
    spans: Mutex<Vec<TraceSpan>>,
}

impl Default for ExecutionTrace {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
            spans: Mutex::new(Vec::new()),
        }
    }
}

impl ExecutionTrace {
    fn now_us(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }

    fn record(&self, span: TraceSpan) {
        self.spans.lock().push(span);
    }

    pub fn spans(&self) -> Vec<TraceSpan> {
        let mut spans = self.spans.lock().clone();
        spans.sort_by_key(|s| (s.started_us, s.mutant_id));
        spans
    }

    /// Pairs of mutants that were live on the same file at the same time.
    pub fn file_conflicts(&self) -> Vec<(u64, u64)> {
        let spans = self.spans();
        let mut conflicts = Vec::new();
        for (i, a) in spans.iter().enumerate() {
            for b in &spans[i + 1..] {
                if a.file == b.file && a.overlaps(b) {
                    conflicts.push((a.mutant_id.min(b.mutant_id), a.mutant_id.max(b.mutant_id)));
                }
            }
        }
        conflicts
    }

    /// Largest number of mutants live at once.
    pub fn max_concurrency(&self) -> usize {
        let spans = self.spans();
        spans
            .iter()
            .map(|a| {
                spans
                    .iter()
                    .filter(|b| b.started_us <= a.started_us && a.started_us < b.finished_us)
                    .count()
            })
            .max()
            .unwrap_or(0)
    }
}

/// Applies mutants to a working copy and runs their selected tests.
pub struct Executor<'a> {
    workdir: &'a Path,
    runner: &'a dyn TestRunner,
    timeout: Duration,
    cancel: CancelToken,
    locks: FileLocks,
    trace: ExecutionTrace,
}

enum Verdict {
    Outcome(MutantOutcome, Option<String>),
    Cancelled,
}

impl<'a> Executor<'a> {
    pub fn new(
        workdir: &'a Path,
        runner: &'a dyn TestRunner,
        timeout: Duration,
        cancel: CancelToken,
    ) -> Self {
        Self {
            workdir,
            runner,
            timeout,
            cancel,
            locks: FileLocks::default(),
            trace: ExecutionTrace::default(),
        }
    }

    pub fn trace(&self) -> &ExecutionTrace {
        &self.trace
    }

    /// Execute a single mutant: lock, apply, check, test, revert, classify.
    ///
    /// Test outcomes are never errors; only a failed revert or cancellation is.
    pub fn execute(
        &self,
        mutant: &Mutant,
        tests: &TestSelection,
        worker: usize,
    ) -> Result<MutationOutcome, ExecError> {
        if self.cancel.is_cancelled() {
            return Err(ExecError::Cancelled);
        }

        let _lock = self.locks.lock(&mutant.span.file);
        let started_us = self.trace.now_us();
        let start = Instant::now();

        let verdict = match MutationGuard::apply(self.workdir, mutant) {
            Ok(guard) => {
                let verdict = self.run_mutated(mutant, tests);
                guard.revert()?;
                verdict
            }
            Err(e) => {
                log::warn!("{e}");
                Verdict::Outcome(MutantOutcome::Errored, Some(e.to_string()))
            }
        };

        let span = TraceSpan {
            mutant_id: mutant.id,
            file: mutant.span.file.clone(),
            worker,
            started_us,
            finished_us: self.trace.now_us(),
        };
        log::trace!(
            "worker {} held {:?} for mutant {} ({} us)",
            span.worker,
            span.file,
            span.mutant_id,
            span.finished_us - span.started_us
        );
        self.trace.record(span);

        let duration_ms = start.elapsed().as_millis() as u64;
        let (status, note) = match verdict {
            Verdict::Outcome(status, note) => (status, note),
            Verdict::Cancelled => return Err(ExecError::Cancelled),
        };

        if status == MutantOutcome::Timeout {
            log::warn!(
                "mutant {} ({}) timed out after {duration_ms} ms",
                mutant.id,
                mutant.operator.name
            );
        }

        Ok(MutationOutcome {
            mutant_id: mutant.id,
            status,
            tests_run: tests.len(),
            duration_ms,
            note,
        })
    }

    fn run_mutated(&self, mutant: &Mutant, tests: &TestSelection) -> Verdict {
        match self.runner.check(self.workdir, self.timeout, &self.cancel) {
            Ok(None) => {}
            Ok(Some(check)) => match check.status {
                RunStatus::Passed => {}
                RunStatus::Cancelled => return Verdict::Cancelled,
                _ => {
                    let detail = check.summary_line().unwrap_or("no output");
                    return Verdict::Outcome(
                        MutantOutcome::Errored,
                        Some(format!("check failed: {detail}")),
                    );
                }
            },
            Err(e) => {
                log::warn!("check for mutant {} could not run: {e:#}", mutant.id);
                return Verdict::Outcome(MutantOutcome::Errored, Some(format!("{e:#}")));
            }
        }

        match self.runner.run_tests(self.workdir, tests, self.timeout, &self.cancel) {
            Ok(result) => match result.status {
                RunStatus::Passed => Verdict::Outcome(MutantOutcome::Survived, None),
                RunStatus::Failed => Verdict::Outcome(MutantOutcome::Killed, None),
                RunStatus::TimedOut => Verdict::Outcome(
                    MutantOutcome::Timeout,
                    Some(format!("exceeded {} ms", self.timeout.as_millis())),
                ),
                RunStatus::Errored => Verdict::Outcome(
                    MutantOutcome::Errored,
                    result.summary_line().map(str::to_string),
                ),
                RunStatus::Cancelled => Verdict::Cancelled,
            },
            Err(e) => {
                log::warn!("tests for mutant {} could not run: {e:#}", mutant.id);
                Verdict::Outcome(MutantOutcome::Errored, Some(format!("{e:#}")))
            }
        }
    }

    /// Run every scheduled mutant: independent groups on a worker pool, then the tail alone.
    ///
    /// `on_outcome` sees each outcome as it arrives. A fatal error cancels the remaining work
    /// and is returned instead of the outcomes.
    pub fn run_schedule(
        &self,
        schedule: &Schedule,
        workers: usize,
        mut on_outcome: impl FnMut(&MutationOutcome),
    ) -> Result<Vec<MutationOutcome>, ExecError> {
        let mut outcomes = Vec::with_capacity(schedule.scheduled_len());
        let mut failure: Option<ExecError> = None;
        let workers = workers.clamp(1, schedule.independent.len().max(1));

        thread::scope(|scope| {
            let (job_tx, job_rx) = crossbeam_channel::unbounded();
            let (result_tx, result_rx) = crossbeam_channel::unbounded();

            for group in &schedule.independent {
                // Receivers are alive until the scope ends.
                let _ = job_tx.send(group);
            }
            drop(job_tx);

            for worker in 0..workers {
                let job_rx = job_rx.clone();
                let result_tx = result_tx.clone();
                scope.spawn(move || {
                    for group in job_rx.iter() {
                        log::debug!(
                            "worker {worker} takes {:?} group {} ({})",
                            group.isolation,
                            group.id,
                            group.route.as_ref().map_or_else(String::new, |r| r.to_string())
                        );
                        for scheduled in &group.mutants {
                            let result =
                                self.execute(&scheduled.mutant, &scheduled.tests, worker);
                            let fatal = result.as_ref().is_err_and(ExecError::is_fatal);
                            if result_tx.send(result).is_err() || fatal {
                                return;
                            }
                        }
                    }
                });
            }
            drop(result_tx);

            for result in result_rx.iter() {
                match result {
                    Ok(outcome) => {
                        on_outcome(&outcome);
                        outcomes.push(outcome);
                    }
                    Err(e) => {
                        self.cancel.cancel();
                        failure = Some(more_severe(failure.take(), e));
                    }
                }
            }
        });

        if let Some(e) = failure {
            return Err(e);
        }

        if let Some(tail) = &schedule.serialized {
            log::debug!("running {} serialized mutants", tail.mutants.len());
            for scheduled in &tail.mutants {
                let outcome = self.execute(&scheduled.mutant, &scheduled.tests, 0)?;
                on_outcome(&outcome);
                outcomes.push(outcome);
            }
        }

        Ok(outcomes)
    }
}

fn more_severe(current: Option<ExecError>, new: ExecError) -> ExecError {
    match current {
        Some(e @ ExecError::RevertFailure { .. }) => e,
        _ => new,
    }
}
