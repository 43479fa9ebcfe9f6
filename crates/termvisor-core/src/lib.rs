//! termvisor-core: shared protocol library for the terminal supervisor.
//!
//! Provides the viewer-facing JSON event types, the text-frame codec and the
//! error taxonomy shared by the server crate.

pub mod codec;
pub mod error;
pub mod messages;

// Re-export commonly used items at crate root.
pub use codec::{decode_event, encode_event, MAX_FRAME_SIZE};
pub use error::{SupervisorError, SupervisorResult};
pub use messages::{ClientEvent, HeartbeatState, ServerEvent};
