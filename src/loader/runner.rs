//! Loader driver: the `Idle → Running → Stopping → Idle` state machine.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{AppError, Result};
use crate::loader::Loader;
use crate::loader::signal::{StopHandle, StopSignal};
use crate::models::{LoaderKind, RunMode};
use crate::utils::log::LoaderLog;

/// Observable loader state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderState {
    Idle,
    Running,
    Stopping,
}

/// Clears the run-flag when dropped, whichever way `run` exits.
struct RunGuard<'a>(&'a watch::Sender<bool>);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.send_replace(false);
    }
}

/// Drive a loader until it is done or stopped.
///
/// Passes run back to back in `Continuous` mode, separated by the loader's
/// idle period. A failing pass is logged and ends the run cleanly; an
/// interrupt is returned to the caller.
pub async fn run(
    loader: &mut dyn Loader,
    mode: RunMode,
    signal: &StopSignal,
    running: &watch::Sender<bool>,
) -> Result<()> {
    running.send_replace(true);
    let _guard = RunGuard(running);
    let log = LoaderLog::new(loader.kind(), loader.community());

    loop {
        if signal.is_stopped() {
            break;
        }

        match loader.run_pass(signal).await {
            Ok(summary) => log.debug(format!(
                "pass finished: {} rows over {} record types, {} failed",
                summary.rows, summary.record_types, summary.failures
            )),
            Err(e) if e.is_interrupted() => {
                log.warn("pass interrupted");
                return Err(e);
            }
            Err(e) => {
                log.error(format!("run error {e}"));
                break;
            }
        }

        if mode == RunMode::Once || signal.is_stopped() {
            break;
        }

        let idle = loader.idle_period();
        log.info(format!("sleep for {} seconds", idle.as_secs()));
        if signal.sleep(idle).await.is_stopped() {
            break;
        }
    }

    Ok(())
}

/// Handle to a loader running as a background task.
pub struct LoaderHandle {
    kind: LoaderKind,
    community: String,
    stop: StopHandle,
    running: watch::Receiver<bool>,
    task: JoinHandle<Result<()>>,
}

impl LoaderHandle {
    /// Start `loader` on the tokio runtime.
    pub fn spawn(mut loader: Box<dyn Loader>, mode: RunMode) -> Self {
        let (stop, signal) = StopSignal::channel();
        let (running_tx, running) = watch::channel(true);
        let kind = loader.kind();
        let community = loader.community().to_string();

        let task = tokio::spawn(async move {
            run(loader.as_mut(), mode, &signal, &running_tx).await
        });

        Self {
            kind,
            community,
            stop,
            running,
            task,
        }
    }

    pub fn kind(&self) -> LoaderKind {
        self.kind
    }

    pub fn community(&self) -> &str {
        &self.community
    }

    pub fn state(&self) -> LoaderState {
        match (*self.running.borrow(), self.stop.is_stopped()) {
            (false, _) => LoaderState::Idle,
            (true, true) => LoaderState::Stopping,
            (true, false) => LoaderState::Running,
        }
    }

    pub fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    /// Resolve once the run-flag is cleared.
    pub async fn wait(&self) {
        let mut running = self.running.clone();
        let _ = running.wait_for(|r| !*r).await;
    }

    /// Request a stop and wait up to `timeout` for the run-flag to clear.
    ///
    /// Returns `false` when the loader is still running afterwards; the caller
    /// decides whether to [`abort`](Self::abort) it.
    pub async fn stop(&self, timeout: Duration) -> bool {
        self.stop.stop();
        let mut running = self.running.clone();
        match tokio::time::timeout(timeout, running.wait_for(|r| !*r)).await {
            Ok(_) => true,
            Err(_) => !self.is_running(),
        }
    }

    /// Cancel the task at its next await point.
    pub fn abort(&self) {
        self.task.abort();
    }

    /// Wait for the task and return the run result.
    pub async fn join(self) -> Result<()> {
        match self.task.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(AppError::Interrupted),
            Err(e) => Err(AppError::Task(format!(
                "{} loader for r/{}: {e}",
                self.kind, self.community
            ))),
        }
    }
}
