//! Registry of connected viewers and their outbound queues.

use crate::session::{Broadcaster, ViewerId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use termvisor_core::ServerEvent;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Outbound queue depth per viewer.
pub const VIEWER_QUEUE: usize = 1024;

struct ViewerEntry {
    tx: mpsc::Sender<ServerEvent>,
    /// Receives broadcasts once the viewer has started or reattached.
    attached: bool,
}

/// Connected viewers, keyed by connection id.
#[derive(Default)]
pub struct ViewerRegistry {
    viewers: RwLock<HashMap<ViewerId, ViewerEntry>>,
    next_id: AtomicU64,
}

impl ViewerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection; it gets replies immediately and broadcasts
    /// only after [`Broadcaster::attach`].
    pub fn register(&self) -> (ViewerId, mpsc::Receiver<ServerEvent>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::channel(VIEWER_QUEUE);
        self.write().insert(id, ViewerEntry { tx, attached: false });
        debug!(viewer = id, "viewer registered");
        (id, rx)
    }

    pub fn unregister(&self, viewer: ViewerId) {
        if self.write().remove(&viewer).is_some() {
            debug!(viewer, "viewer unregistered");
        }
    }

    pub fn count(&self) -> usize {
        self.read().len()
    }

    pub fn attached_count(&self) -> usize {
        self.read().values().filter(|v| v.attached).count()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<ViewerId, ViewerEntry>> {
        self.viewers.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<ViewerId, ViewerEntry>> {
        self.viewers.write().unwrap_or_else(|p| p.into_inner())
    }
}

fn deliver(viewer: ViewerId, tx: &mpsc::Sender<ServerEvent>, event: ServerEvent) {
    match tx.try_send(event) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!(viewer, "viewer queue full, output dropped");
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!(viewer, "viewer gone");
        }
    }
}

impl Broadcaster for ViewerRegistry {
    fn broadcast(&self, event: ServerEvent) {
        let viewers = self.read();
        for (id, entry) in viewers.iter().filter(|(_, v)| v.attached) {
            deliver(*id, &entry.tx, event.clone());
        }
    }

    fn send_to(&self, viewer: ViewerId, event: ServerEvent) {
        if let Some(entry) = self.read().get(&viewer) {
            deliver(viewer, &entry.tx, event);
        }
    }

    fn attach(&self, viewer: ViewerId) {
        if let Some(entry) = self.write().get_mut(&viewer) {
            entry.attached = true;
        }
    }
}
