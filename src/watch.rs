//! `run --watch`: re-run the pass whenever the project changes.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, unbounded};
use notify::{Event, EventKind, RecursiveMode, Watcher};
use parking_lot::Mutex;

use crate::error::ExecError;
use crate::runner::CancelToken;

/// Quiet period after the last change before a new pass starts.
const DEBOUNCE: Duration = Duration::from_millis(300);

/// How often an idle wait checks for Ctrl-C.
const POLL: Duration = Duration::from_millis(100);

/// Cancellation state of a watch loop.
///
/// Each pass gets a fresh token; a file change cancels the pass in flight, Ctrl-C
/// cancels it and ends the loop.
#[derive(Debug, Clone, Default)]
pub struct WatchSession {
    current: Arc<Mutex<CancelToken>>,
    quit: CancelToken,
}

impl WatchSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called from the Ctrl-C handler.
    pub fn interrupt(&self) {
        self.quit.cancel();
        self.current.lock().cancel();
    }

    /// Cancel the running pass so the next one can start.
    pub fn retrigger(&self) {
        self.current.lock().cancel();
    }

    pub fn is_quit(&self) -> bool {
        self.quit.is_cancelled()
    }

    fn begin_pass(&self) -> CancelToken {
        let token = CancelToken::new();
        *self.current.lock() = token.clone();
        token
    }
}

/// Whether a file-system event should trigger a new pass.
pub fn is_relevant(event: &Event, ignore: &[PathBuf]) -> bool {
    if !matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    ) {
        return false;
    }
    event
        .paths
        .iter()
        .any(|p| !ignore.iter().any(|dir| p.starts_with(dir)))
}

/// Wait for the next relevant change, then for the project to go quiet.
///
/// Returns `false` when the session was interrupted instead.
fn wait_for_change(rx: &Receiver<()>, session: &WatchSession) -> bool {
    loop {
        if session.is_quit() {
            return false;
        }
        match rx.recv_timeout(POLL) {
            Ok(()) => break,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return false,
        }
    }

    loop {
        match rx.recv_timeout(DEBOUNCE) {
            Ok(()) => continue,
            Err(RecvTimeoutError::Timeout) => return !session.is_quit(),
            Err(RecvTimeoutError::Disconnected) => return false,
        }
    }
}

/// Run `pass` now and again after every change under `root`, until Ctrl-C.
///
/// Changes inside `.git` and `out_dir` are ignored. A failing pass is logged and the
/// loop keeps watching.
pub fn watch(
    root: &Path,
    out_dir: Option<&Path>,
    session: &WatchSession,
    mut pass: impl FnMut(CancelToken) -> Result<()>,
) -> Result<()> {
    let root = root
        .canonicalize()
        .with_context(|| format!("failed to canonicalize {}", root.display()))?;

    let mut ignore = vec![root.join(".git")];
    if let Some(out) = out_dir {
        // The output dir may not exist before the first pass.
        let out = if out.is_absolute() {
            out.to_path_buf()
        } else {
            root.join(out)
        };
        ignore.push(out.canonicalize().unwrap_or(out));
    }

    let (tx, rx) = unbounded();
    let trigger = session.clone();
    let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
        match result {
            Ok(event) if is_relevant(&event, &ignore) => {
                log::debug!("change detected: {:?}", event.paths);
                trigger.retrigger();
                let _ = tx.send(());
            }
            Ok(_) => {}
            Err(e) => log::warn!("watch error: {e}"),
        }
    })?;
    watcher
        .watch(&root, RecursiveMode::Recursive)
        .with_context(|| format!("failed to watch {}", root.display()))?;
    log::info!("watching {}", root.display());

    loop {
        let token = session.begin_pass();
        if let Err(e) = pass(token) {
            match e.downcast_ref::<ExecError>() {
                Some(ExecError::Cancelled) => log::info!("pass cancelled"),
                _ => log::error!("pass failed: {e:#}"),
            }
        }

        if !wait_for_change(&rx, session) {
            break;
        }
    }

    log::info!("stopped watching {}", root.display());
    Ok(())
}
