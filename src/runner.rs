use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use crate::config::TestsConfig;
use crate::coverage::TRACE_ENV;
use crate::schedule::TestSelection;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Shared cancellation flag checked by every running test process.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Passed,

    /// At least one test failed.
    Failed,

    /// The deadline passed and the process was killed.
    TimedOut,

    /// The suite could not run at all (configured `errored_exit_codes`).
    Errored,

    /// Killed because the run was cancelled.
    Cancelled,
}

/// Result of one invocation of the project's test command.
#[derive(Debug, Clone)]
pub struct TestRunResult {
    pub status: RunStatus,

    /// Exit code returned by the command (if it exited normally).
    pub exit_code: Option<i32>,

    /// Captured standard output of the command.
    pub stdout: String,

    /// Captured standard error of the command.
    pub stderr: String,

    /// How long the command ran.
    pub duration: Duration,
}

impl TestRunResult {
    pub fn passed(&self) -> bool {
        self.status == RunStatus::Passed
    }

    /// Last non-empty line of stderr (or stdout), for one-line notes.
    pub fn summary_line(&self) -> Option<&str> {
        self.stderr
            .lines()
            .chain(self.stdout.lines())
            .rev()
            .map(str::trim)
            .find(|l| !l.is_empty())
    }
}

/// The project's test framework, as seen by the executor.
pub trait TestRunner: Sync {
    /// Run `tests` in `workdir`.
    fn run_tests(
        &self,
        workdir: &Path,
        tests: &TestSelection,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<TestRunResult>;

    /// Run the compile/syntax check; `None` when the project has none.
    fn check(
        &self,
        workdir: &Path,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<Option<TestRunResult>>;

    /// Run the entire suite with route tracing written to `trace`.
    fn run_instrumented(
        &self,
        workdir: &Path,
        trace: &Path,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<TestRunResult>;
}

/// Runs the argv from `[tests]` in `smart-mutant.toml`.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    command: Vec<String>,
    check: Option<Vec<String>>,
    errored_exit_codes: Vec<i32>,
}

impl CommandRunner {
    pub fn from_config(config: &TestsConfig) -> Self {
        Self {
            command: config.command.clone(),
            check: config.check.clone(),
            errored_exit_codes: config.errored_exit_codes.clone(),
        }
    }

    fn spawn(
        &self,
        argv: &[String],
        extra: &[String],
        env: Option<(&str, &Path)>,
        workdir: &Path,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<TestRunResult> {
        let (program, args) = argv.split_first().context("empty command line")?;

        let mut stdout = tempfile::tempfile().context("failed to create stdout capture file")?;
        let mut stderr = tempfile::tempfile().context("failed to create stderr capture file")?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .args(extra)
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(stdout.try_clone()?)
            .stderr(stderr.try_clone()?);
        if let Some((key, value)) = env {
            cmd.env(key, value);
        }
        // Own process group; forced stops kill the whole group.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let start = Instant::now();
        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to run `{}` in {workdir:?}", argv.join(" ")))?;

        let (status, exit) = wait_with_deadline(&mut child, start + timeout, cancel)?;
        let duration = start.elapsed();

        let status = match (status, exit) {
            (Some(s), _) => s,
            (None, Some(exit)) if exit.success() => RunStatus::Passed,
            (None, Some(exit)) => match exit.code() {
                Some(code) if self.errored_exit_codes.contains(&code) => RunStatus::Errored,
                _ => RunStatus::Failed,
            },
            (None, None) => RunStatus::Failed,
        };

        Ok(TestRunResult {
            status,
            exit_code: exit.and_then(|e| e.code()),
            stdout: read_capture(&mut stdout)?,
            stderr: read_capture(&mut stderr)?,
            duration,
        })
    }
}

impl TestRunner for CommandRunner {
    fn run_tests(
        &self,
        workdir: &Path,
        tests: &TestSelection,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<TestRunResult> {
        let extra: Vec<String> = match tests {
            TestSelection::All => Vec::new(),
            TestSelection::Only(ids) => ids.iter().cloned().collect(),
        };
        self.spawn(&self.command, &extra, None, workdir, timeout, cancel)
    }

    fn check(
        &self,
        workdir: &Path,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<Option<TestRunResult>> {
        match &self.check {
            Some(argv) => self.spawn(argv, &[], None, workdir, timeout, cancel).map(Some),
            None => Ok(None),
        }
    }

    fn run_instrumented(
        &self,
        workdir: &Path,
        trace: &Path,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<TestRunResult> {
        self.spawn(
            &self.command,
            &[],
            Some((TRACE_ENV, trace)),
            workdir,
            timeout,
            cancel,
        )
    }
}

/// Poll `child` until it exits, the deadline passes or the run is cancelled.
///
/// Returns an overriding status when the process had to be killed.
fn wait_with_deadline(
    child: &mut Child,
    deadline: Instant,
    cancel: &CancelToken,
) -> Result<(Option<RunStatus>, Option<ExitStatus>)> {
    loop {
        if let Some(exit) = child.try_wait().context("failed to poll test process")? {
            return Ok((None, Some(exit)));
        }

        let forced = if cancel.is_cancelled() {
            Some(RunStatus::Cancelled)
        } else if Instant::now() >= deadline {
            Some(RunStatus::TimedOut)
        } else {
            None
        };

        if let Some(status) = forced {
            // The process may exit between the poll and the kill.
            kill_tree(child);
            let exit = child.wait().context("failed to reap killed test process")?;
            return Ok((Some(status), Some(exit)));
        }

        thread::sleep(POLL_INTERVAL);
    }
}

/// Kill the test process and everything it spawned.
#[cfg(unix)]
fn kill_tree(child: &mut Child) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    if let Err(e) = killpg(Pid::from_raw(child.id() as i32), Signal::SIGKILL) {
        log::debug!("failed to kill process group {}: {e}", child.id());
        let _ = child.kill();
    }
}

#[cfg(not(unix))]
fn kill_tree(child: &mut Child) {
    let _ = child.kill();
}

fn read_capture(file: &mut File) -> Result<String> {
    let mut bytes = Vec::new();
    file.seek(SeekFrom::Start(0))?;
    file.read_to_end(&mut bytes)
        .context("failed to read captured output")?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

#[cfg(all(test, unix))]
mod tests {
    use std::collections::BTreeSet;

    use super::*;

    fn sh(script: &str) -> CommandRunner {
        CommandRunner {
            command: vec!["sh".into(), "-c".into(), script.into(), "sh".into()],
            check: None,
            errored_exit_codes: vec![4],
        }
    }

    fn run(runner: &CommandRunner, tests: &TestSelection, timeout_ms: u64) -> TestRunResult {
        let dir = tempfile::tempdir().unwrap();
        runner
            .run_tests(
                dir.path(),
                tests,
                Duration::from_millis(timeout_ms),
                &CancelToken::new(),
            )
            .unwrap()
    }

    #[test]
    fn exit_codes_map_to_statuses() {
        assert_eq!(run(&sh("exit 0"), &TestSelection::All, 5000).status, RunStatus::Passed);
        assert_eq!(run(&sh("exit 1"), &TestSelection::All, 5000).status, RunStatus::Failed);

        let errored = run(&sh("echo boom >&2; exit 4"), &TestSelection::All, 5000);
        assert_eq!(errored.status, RunStatus::Errored);
        assert_eq!(errored.exit_code, Some(4));
        assert_eq!(errored.summary_line(), Some("boom"));
    }

    #[test]
    fn selected_tests_are_appended_as_arguments() {
        let tests = TestSelection::Only(BTreeSet::from(["t_b".to_string(), "t_a".to_string()]));
        let result = run(&sh("echo \"$@\""), &tests, 5000);
        assert_eq!(result.stdout, "t_a t_b\n");

        let result = run(&sh("echo \"$#\""), &TestSelection::All, 5000);
        assert_eq!(result.stdout, "0\n");
    }

    #[test]
    fn slow_run_is_killed_at_the_deadline() {
        let result = run(&sh("sleep 5"), &TestSelection::All, 100);
        assert_eq!(result.status, RunStatus::TimedOut);
        assert!(result.duration < Duration::from_secs(4));
    }

    #[test]
    fn timed_out_run_takes_its_subprocesses_down() {
        let dir = tempfile::tempdir().unwrap();
        let result = sh("sh -c 'sleep 1; touch leaked'; true")
            .run_tests(
                dir.path(),
                &TestSelection::All,
                Duration::from_millis(200),
                &CancelToken::new(),
            )
            .unwrap();
        assert_eq!(result.status, RunStatus::TimedOut);

        thread::sleep(Duration::from_millis(1500));
        assert!(!dir.path().join("leaked").exists());
    }

    #[test]
    fn cancelled_token_stops_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();

        let result = sh("sleep 5")
            .run_tests(dir.path(), &TestSelection::All, Duration::from_secs(10), &cancel)
            .unwrap();
        assert_eq!(result.status, RunStatus::Cancelled);
    }

    #[test]
    fn instrumented_run_exposes_the_trace_path() {
        let dir = tempfile::tempdir().unwrap();
        let trace = dir.path().join("trace.tsv");

        let result = sh("printf 'test\\tt_a\\n' > \"$SMART_MUTANT_TRACE\"")
            .run_instrumented(dir.path(), &trace, Duration::from_secs(5), &CancelToken::new())
            .unwrap();

        assert!(result.passed());
        assert_eq!(std::fs::read_to_string(&trace).unwrap(), "test\tt_a\n");
    }

    #[test]
    fn missing_check_is_skipped_and_failing_check_reported() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancelToken::new();
        let timeout = Duration::from_secs(5);

        assert!(sh("exit 0").check(dir.path(), timeout, &cancel).unwrap().is_none());

        let mut runner = sh("exit 0");
        runner.check = Some(vec!["sh".into(), "-c".into(), "exit 2".into()]);
        let checked = runner.check(dir.path(), timeout, &cancel).unwrap().unwrap();
        assert_eq!(checked.status, RunStatus::Failed);
    }

    #[test]
    fn unknown_program_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let runner = CommandRunner {
            command: vec!["definitely-not-a-real-program-xyz".into()],
            check: None,
            errored_exit_codes: Vec::new(),
        };
        let err = runner
            .run_tests(dir.path(), &TestSelection::All, Duration::from_secs(1), &CancelToken::new())
            .unwrap_err();
        assert!(err.to_string().contains("failed to run"));
    }
}
