//! Output pump: drains a session's PTY into history and out to viewers.
//!
//! The bounded wait for output happens without the session lock; only the
//! read, append and broadcast step is serialized with other operations.

use super::controller::Shared;
use super::pty::Terminal;
use std::sync::{Arc, Weak};
use termvisor_core::{ServerEvent, SupervisorError};
use tracing::{debug, warn};

/// Largest chunk read from the PTY in one step (20 KiB).
pub const CHUNK_SIZE: usize = 20 * 1024;

/// Start the pump for session `generation` on a blocking thread.
pub(super) fn spawn(shared: Arc<Shared>, generation: u64, terminal: Weak<dyn Terminal>) {
    tokio::task::spawn_blocking(move || run(&shared, generation, &terminal));
}

fn run(shared: &Shared, generation: u64, terminal: &Weak<dyn Terminal>) {
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        // The session dropping its handle ends the pump.
        let Some(term) = terminal.upgrade() else {
            break;
        };

        let readable = match term.wait_readable(shared.timing.poll_timeout) {
            Ok(readable) => readable,
            Err(e) => {
                debug!(generation, error = %e, "PTY wait failed, pump stopping");
                break;
            }
        };

        // Checked on every wake-up, so a torn-down session ends the pump
        // within one poll timeout even when the worker is silent.
        let mut slot = shared.slot.blocking_lock();
        let Some(session) = slot.as_mut().filter(|s| s.generation == generation) else {
            debug!(generation, "session gone, pump stopping");
            break;
        };
        if !readable {
            continue;
        }

        match term.read(&mut buf) {
            Ok(0) => {}
            Ok(n) => {
                if let Some(text) = session.history.ingest(&buf[..n]) {
                    shared.broadcaster.broadcast(ServerEvent::output(text));
                }
            }
            Err(SupervisorError::ChannelClosed) => {
                debug!(generation, "PTY closed, pump stopping");
                break;
            }
            Err(e) => {
                warn!(generation, error = %e, "PTY read failed, pump stopping");
                break;
            }
        }
    }
    debug!(generation, "output pump ended");
}
