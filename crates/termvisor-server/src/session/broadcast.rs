//! Seam between the supervisor and the viewer transport.

use termvisor_core::ServerEvent;

/// Transport-assigned connection id.
pub type ViewerId = u64;

/// Delivers supervisor output to viewers.
///
/// Implementations must not block: the output pump calls these while it
/// holds the session lock.
pub trait Broadcaster: Send + Sync {
    /// Send to every attached viewer.
    fn broadcast(&self, event: ServerEvent);

    /// Reply to one viewer, attached or not.
    fn send_to(&self, viewer: ViewerId, event: ServerEvent);

    /// Start including `viewer` in broadcasts.
    fn attach(&self, viewer: ViewerId);
}
