//! Exit watcher: waits for a session's worker to terminate and retires
//! the session if it is still the current one.

use super::controller::Shared;
use super::launcher::ChildProcess;
use std::sync::Arc;
use termvisor_core::ServerEvent;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Upper bound on reads when draining output left behind by the worker.
const DRAIN_READS: usize = 64;

pub(super) fn spawn(
    shared: Arc<Shared>,
    generation: u64,
    child: Arc<dyn ChildProcess>,
    exit_tx: watch::Sender<Option<i32>>,
) {
    tokio::spawn(async move {
        let waiter = child.clone();
        let code = match tokio::task::spawn_blocking(move || waiter.wait()).await {
            Ok(Ok(code)) => code,
            Ok(Err(e)) => {
                warn!(generation, error = %e, "waiting for worker failed");
                -1
            }
            Err(e) => {
                warn!(generation, error = %e, "exit watcher join error");
                -1
            }
        };
        let _ = exit_tx.send(Some(code));
        retire(&shared, generation, code).await;
    });
}

/// Announce the exit and clear the slot, unless a newer session owns it.
async fn retire(shared: &Shared, generation: u64, code: i32) {
    let mut slot = shared.slot.lock().await;
    let Some(mut session) = slot.take() else {
        debug!(generation, code, "worker exited after teardown");
        return;
    };
    if session.generation != generation {
        debug!(generation, current = session.generation, "stale exit watcher discarded");
        *slot = Some(session);
        return;
    }

    info!(generation, code, "worker exited");
    let mut buf = vec![0u8; super::pump::CHUNK_SIZE];
    for _ in 0..DRAIN_READS {
        match session.terminal.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if let Some(text) = session.history.ingest(&buf[..n]) {
                    shared.broadcaster.broadcast(ServerEvent::output(text));
                }
            }
        }
    }

    let notice = exit_notice(code);
    session.history.append(&notice);
    shared.broadcaster.broadcast(ServerEvent::output(notice));
}

/// Notice shown to viewers when the worker terminates.
pub fn exit_notice(code: i32) -> String {
    format!("\r\n\nProcess exited with code {code}.\r\nPlease refresh the page to restart it.")
}
