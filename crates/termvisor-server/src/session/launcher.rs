//! Process launcher: spawns the worker on the slave side of a fresh PTY.
//!
//! portable-pty starts the child as a session leader (`setsid`) with the
//! PTY as its controlling terminal, so the child's pid is also its process
//! group id and signals can target the whole group.

use super::pty::{self, PtyTerminal, Terminal};
use portable_pty::CommandBuilder;
use std::io;
use std::sync::{Arc, Mutex};
use termvisor_core::{SupervisorError, SupervisorResult};
use tracing::{debug, info};

/// Signals the supervisor delivers to the worker's process group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// SIGINT: ask the worker to wind down.
    Interrupt,
    /// SIGKILL: force termination.
    Kill,
}

/// Handle to a launched worker process.
pub trait ChildProcess: Send + Sync {
    fn pid(&self) -> Option<u32>;

    /// Block until the process exits and return its exit code.
    fn wait(&self) -> SupervisorResult<i32>;

    /// Deliver a signal to the process group. A group that is already gone
    /// is not an error.
    fn signal(&self, signal: Signal) -> SupervisorResult<()>;
}

/// What to run and how big its terminal starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub command: String,
    pub args: Vec<String>,
    /// Extra environment on top of the supervisor's own.
    pub env: Vec<(String, String)>,
    pub rows: u16,
    pub cols: u16,
}

/// A freshly launched PTY + process pair. Both halves always travel
/// together.
pub struct Spawned {
    pub terminal: Arc<dyn Terminal>,
    pub child: Arc<dyn ChildProcess>,
}

/// Creates PTY + process pairs.
pub trait Launcher: Send + Sync {
    fn launch(&self, spec: &LaunchSpec) -> SupervisorResult<Spawned>;
}

/// Launcher backed by the native PTY system.
#[derive(Debug, Default, Clone, Copy)]
pub struct PtyLauncher;

impl Launcher for PtyLauncher {
    fn launch(&self, spec: &LaunchSpec) -> SupervisorResult<Spawned> {
        let (terminal, child) = self.spawn(spec)?;
        Ok(Spawned {
            terminal: Arc::new(terminal),
            child: Arc::new(child),
        })
    }
}

impl PtyLauncher {
    fn spawn(&self, spec: &LaunchSpec) -> SupervisorResult<(PtyTerminal, PtyChild)> {
        if spec.command.trim().is_empty() {
            return Err(SupervisorError::LaunchFailed("empty command".into()));
        }

        let (terminal, slave) = pty::open(spec.rows, spec.cols)?;

        let mut cmd = CommandBuilder::new(&spec.command);
        cmd.args(&spec.args);
        // portable-pty would otherwise start in $HOME.
        if let Ok(cwd) = std::env::current_dir() {
            cmd.cwd(cwd);
        }
        if std::env::var_os("TERM").is_none() {
            cmd.env("TERM", "xterm-256color");
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        // On failure `terminal` and `slave` drop here, closing both sides.
        let child = slave.spawn_command(cmd).map_err(|e| {
            SupervisorError::LaunchFailed(format!("failed to spawn {}: {e}", spec.command))
        })?;
        drop(slave);

        let pid = child.process_id();
        info!(pid = ?pid, command = %spec.command, args = ?spec.args, "worker launched");

        let child = PtyChild {
            pid,
            child: Mutex::new(child),
            reaped: Mutex::new(false),
        };
        Ok((terminal, child))
    }
}

/// A worker spawned through portable-pty.
pub struct PtyChild {
    pid: Option<u32>,
    child: Mutex<Box<dyn portable_pty::Child + Send + Sync>>,
    /// Set once the exit status has been collected. After that the pid may
    /// belong to an unrelated process, so no more signals go out. Held
    /// across the reap and across every `killpg`.
    reaped: Mutex<bool>,
}

impl PtyChild {
    /// Block until the child can be reaped, without reaping it.
    fn wait_exitable(&self) {
        let Some(pid) = self.pid else { return };
        loop {
            let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
            let rc = unsafe {
                libc::waitid(
                    libc::P_PID,
                    pid as libc::id_t,
                    &mut info,
                    libc::WEXITED | libc::WNOWAIT,
                )
            };
            if rc == 0 || io::Error::last_os_error().kind() != io::ErrorKind::Interrupted {
                return;
            }
        }
    }

    #[cfg(test)]
    fn is_reaped(&self) -> bool {
        self.reaped.lock().map(|r| *r).unwrap_or(true)
    }
}

impl ChildProcess for PtyChild {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn wait(&self) -> SupervisorResult<i32> {
        self.wait_exitable();
        let mut reaped = self
            .reaped
            .lock()
            .map_err(|_| SupervisorError::Other("reap lock poisoned".into()))?;
        let mut child = self
            .child
            .lock()
            .map_err(|_| SupervisorError::Other("child lock poisoned".into()))?;
        let status = child.wait()?;
        *reaped = true;
        Ok(i32::try_from(status.exit_code()).unwrap_or(-1))
    }

    fn signal(&self, signal: Signal) -> SupervisorResult<()> {
        let pid = self
            .pid
            .ok_or_else(|| SupervisorError::Other("worker has no pid".into()))?;
        let pgid = libc::pid_t::try_from(pid)
            .map_err(|_| SupervisorError::Other(format!("pid {pid} out of range")))?;
        let sig = match signal {
            Signal::Interrupt => libc::SIGINT,
            Signal::Kill => libc::SIGKILL,
        };

        let reaped = self
            .reaped
            .lock()
            .map_err(|_| SupervisorError::Other("reap lock poisoned".into()))?;
        if *reaped {
            debug!(pid, ?signal, "worker already reaped, not signalling");
            return Ok(());
        }
        let result = unsafe { libc::killpg(pgid, sig) };
        if result == 0 {
            debug!(pid, ?signal, "signal delivered");
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            debug!(pid, ?signal, "process group already gone");
            return Ok(());
        }
        Err(SupervisorError::Io(err))
    }
}
