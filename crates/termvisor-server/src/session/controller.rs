//! Single-session controller.
//!
//! Owns the one supervised session behind a single lock, decides between
//! fresh start and reattach, routes input and resizes, and runs the
//! interrupt-then-kill shutdown.

use super::broadcast::{Broadcaster, ViewerId};
use super::history::History;
use super::launcher::{ChildProcess, LaunchSpec, Launcher, Signal};
use super::pty::Terminal;
use super::{pump, watcher};
use crate::config_store::ConfigStore;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use termvisor_core::{HeartbeatState, ServerEvent, SupervisorError, SupervisorResult};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

/// Window size used when no viewer supplied one (boot launch, heartbeat).
pub const DEFAULT_ROWS: u16 = 24;
pub const DEFAULT_COLS: u16 = 80;

/// How the worker is launched.
#[derive(Debug, Clone)]
pub struct LaunchSettings {
    pub command: String,
    pub args: Vec<String>,
    /// Appended to `args` for instant starts.
    pub instant_flag: String,
    /// Environment variable carrying the encoded config blob.
    pub config_env: String,
    /// History cap in bytes.
    pub history_bytes: usize,
}

/// Supervisor timing knobs.
#[derive(Debug, Clone, Copy)]
pub struct Timing {
    /// Bounded wait of the output pump between session checks.
    pub poll_timeout: Duration,
    /// Pause between a reattach resize and the history replay.
    pub reattach_settle: Duration,
    /// Interval between exit checks after the interrupt.
    pub kill_poll_interval: Duration,
    /// Exit checks before the forced kill.
    pub kill_poll_attempts: u32,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(1),
            reattach_settle: Duration::from_millis(100),
            kill_poll_interval: Duration::from_millis(100),
            kill_poll_attempts: 10,
        }
    }
}

/// Result of a `start` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// A new worker was launched.
    Launched { pid: Option<u32> },
    /// The live session was joined and its history replayed.
    Reattached,
}

/// Result of a `kill` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillOutcome {
    /// There was no session.
    NotRunning,
    /// The worker exited (on its own or after the interrupt).
    Exited,
    /// The worker ignored the interrupt and was force-killed.
    ForceKilled,
}

/// Point-in-time view of the current session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionInfo {
    pub generation: u64,
    pub pid: Option<u32>,
    pub alive: bool,
    pub history_len: usize,
}

/// A session already removed from the slot whose worker still has to stop.
pub struct Teardown {
    generation: u64,
    terminal: Arc<dyn Terminal>,
    child: Arc<dyn ChildProcess>,
    exit_rx: watch::Receiver<Option<i32>>,
    timing: Timing,
}

impl Teardown {
    /// Interrupt, wait, then force-kill the worker.
    pub async fn finish(self) -> KillOutcome {
        let outcome = shutdown(self.child.as_ref(), &self.exit_rx, self.timing).await;
        info!(generation = self.generation, ?outcome, "worker stopped");
        // Closing the master earlier would hang up the worker before it
        // could handle the interrupt.
        drop(self.terminal);
        outcome
    }
}

/// The supervised unit: process, terminal and output history.
pub(super) struct Session {
    pub(super) generation: u64,
    pub(super) terminal: Arc<dyn Terminal>,
    pub(super) child: Arc<dyn ChildProcess>,
    /// Filled in by the exit watcher once the process has terminated.
    pub(super) exit_rx: watch::Receiver<Option<i32>>,
    pub(super) history: History,
}

impl Session {
    pub(super) fn is_alive(&self) -> bool {
        self.exit_rx.borrow().is_none()
    }
}

/// State shared with the background tasks.
pub(super) struct Shared {
    /// The single session slot. `None` is the idle state.
    pub(super) slot: Mutex<Option<Session>>,
    pub(super) broadcaster: Arc<dyn Broadcaster>,
    pub(super) timing: Timing,
    launcher: Arc<dyn Launcher>,
    settings: LaunchSettings,
    config: Arc<ConfigStore>,
    next_generation: AtomicU64,
}

/// Cloneable handle to the supervisor.
#[derive(Clone)]
pub struct SessionController {
    shared: Arc<Shared>,
}

impl SessionController {
    pub fn new(
        launcher: Arc<dyn Launcher>,
        broadcaster: Arc<dyn Broadcaster>,
        config: Arc<ConfigStore>,
        settings: LaunchSettings,
        timing: Timing,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                slot: Mutex::new(None),
                broadcaster,
                timing,
                launcher,
                settings,
                config,
                next_generation: AtomicU64::new(0),
            }),
        }
    }

    /// Start the worker, or reattach `viewer` to the live one.
    ///
    /// On reattach the history is sent to `viewer` alone; everyone already
    /// attached keeps receiving only the live stream.
    pub async fn start(
        &self,
        viewer: Option<ViewerId>,
        rows: u16,
        cols: u16,
        instant: bool,
    ) -> SupervisorResult<StartOutcome> {
        let mut slot = self.shared.slot.lock().await;

        if let Some(session) = slot.as_ref().filter(|s| s.is_alive()) {
            debug!(generation = session.generation, ?viewer, "live session found, reattaching");
            apply_resize(session.terminal.as_ref(), rows, cols);
            if let Some(viewer) = viewer {
                tokio::time::sleep(self.shared.timing.reattach_settle).await;
                let history = session.history.replay();
                debug!(viewer, bytes = history.len(), "replaying history");
                self.shared
                    .broadcaster
                    .send_to(viewer, ServerEvent::output(history));
                self.shared.broadcaster.attach(viewer);
            }
            return Ok(StartOutcome::Reattached);
        }

        let pid = self.launch_into(&mut slot, viewer, rows, cols, instant)?;
        Ok(StartOutcome::Launched { pid })
    }

    /// Make sure a worker is running without attaching anyone.
    pub async fn ensure_running(
        &self,
        instant: bool,
    ) -> SupervisorResult<(HeartbeatState, Option<u32>)> {
        let mut slot = self.shared.slot.lock().await;
        if let Some(session) = slot.as_ref().filter(|s| s.is_alive()) {
            return Ok((HeartbeatState::Running, session.child.pid()));
        }
        let pid = self.launch_into(&mut slot, None, DEFAULT_ROWS, DEFAULT_COLS, instant)?;
        Ok((HeartbeatState::Restarted, pid))
    }

    /// Forward keystrokes. Silently ignored without a live session.
    pub async fn input(&self, data: &[u8]) {
        let slot = self.shared.slot.lock().await;
        let Some(session) = slot.as_ref() else {
            debug!(bytes = data.len(), "input without a session, dropped");
            return;
        };
        match session.terminal.write(data) {
            Ok(()) => {}
            Err(SupervisorError::ChannelClosed) => {
                debug!(generation = session.generation, "input raced with exit, dropped");
            }
            Err(e) => warn!(generation = session.generation, error = %e, "PTY write failed"),
        }
    }

    /// Resize the live session's terminal. Silently ignored without one.
    pub async fn resize(&self, rows: u16, cols: u16) {
        let slot = self.shared.slot.lock().await;
        if let Some(session) = slot.as_ref() {
            apply_resize(session.terminal.as_ref(), rows, cols);
        }
    }

    /// Tear the session down and stop its worker.
    ///
    /// Shared state is cleared before any signal is sent, so a following
    /// `start` always launches a fresh worker.
    pub async fn kill(&self) -> KillOutcome {
        match self.detach().await {
            Some(teardown) => teardown.finish().await,
            None => KillOutcome::NotRunning,
        }
    }

    /// Clear the slot and hand back what is needed to stop the worker.
    ///
    /// Once this returns, `start` launches a fresh session even while the
    /// returned [`Teardown`] is still running elsewhere.
    pub async fn detach(&self) -> Option<Teardown> {
        let session = self.shared.slot.lock().await.take()?;
        let Session {
            generation,
            terminal,
            child,
            exit_rx,
            history,
        } = session;
        drop(history);
        info!(generation, pid = ?child.pid(), "session detached, stopping worker");
        Some(Teardown {
            generation,
            terminal,
            child,
            exit_rx,
            timing: self.shared.timing,
        })
    }

    /// Snapshot of the current session, if any.
    pub async fn info(&self) -> Option<SessionInfo> {
        let slot = self.shared.slot.lock().await;
        slot.as_ref().map(|s| SessionInfo {
            generation: s.generation,
            pid: s.child.pid(),
            alive: s.is_alive(),
            history_len: s.history.len(),
        })
    }

    /// Launch a fresh session into `slot`, replacing any dead one.
    fn launch_into(
        &self,
        slot: &mut Option<Session>,
        viewer: Option<ViewerId>,
        rows: u16,
        cols: u16,
        instant: bool,
    ) -> SupervisorResult<Option<u32>> {
        if let Some(stale) = slot.take() {
            debug!(generation = stale.generation, "discarding exited session");
        }

        let spec = self.launch_spec(rows, cols, instant);
        let spawned = self.shared.launcher.launch(&spec)?;

        let generation = self.shared.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (exit_tx, exit_rx) = watch::channel(None);
        let pid = spawned.child.pid();

        *slot = Some(Session {
            generation,
            terminal: spawned.terminal.clone(),
            child: spawned.child.clone(),
            exit_rx,
            history: History::new(self.shared.settings.history_bytes),
        });
        if let Some(viewer) = viewer {
            self.shared.broadcaster.attach(viewer);
        }

        watcher::spawn(self.shared.clone(), generation, spawned.child, exit_tx);
        pump::spawn(self.shared.clone(), generation, Arc::downgrade(&spawned.terminal));
        apply_resize(spawned.terminal.as_ref(), rows, cols);

        info!(generation, ?pid, instant, "session started");
        Ok(pid)
    }

    fn launch_spec(&self, rows: u16, cols: u16, instant: bool) -> LaunchSpec {
        let settings = &self.shared.settings;
        let mut args = settings.args.clone();
        if instant && !settings.instant_flag.is_empty() {
            args.push(settings.instant_flag.clone());
        }
        LaunchSpec {
            command: settings.command.clone(),
            args,
            env: vec![(settings.config_env.clone(), self.shared.config.encoded())],
            rows,
            cols,
        }
    }
}

/// Resize, logging instead of failing: resizes race with teardown.
fn apply_resize(terminal: &dyn Terminal, rows: u16, cols: u16) {
    match terminal.resize(rows, cols) {
        Ok(true) => debug!(rows, cols, "terminal resized"),
        Ok(false) => {}
        Err(e) => debug!(rows, cols, error = %e, "resize failed"),
    }
}

/// Interrupt the process group, wait a bounded time, then force-kill.
async fn shutdown(
    child: &dyn ChildProcess,
    exit_rx: &watch::Receiver<Option<i32>>,
    timing: Timing,
) -> KillOutcome {
    if exit_rx.borrow().is_some() {
        return KillOutcome::Exited;
    }
    if let Err(e) = child.signal(Signal::Interrupt) {
        warn!(error = %e, "failed to interrupt worker");
    }
    for _ in 0..timing.kill_poll_attempts {
        tokio::time::sleep(timing.kill_poll_interval).await;
        if exit_rx.borrow().is_some() {
            return KillOutcome::Exited;
        }
    }
    warn!(pid = ?child.pid(), "worker ignored interrupt, killing");
    if let Err(e) = child.signal(Signal::Kill) {
        warn!(error = %e, "failed to kill worker");
    }
    KillOutcome::ForceKilled
}
