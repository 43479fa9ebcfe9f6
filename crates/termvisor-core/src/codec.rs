//! JSON text-frame codec for the viewer protocol.
//!
//! Wire format: one UTF-8 JSON object per WebSocket text frame.

use crate::error::{SupervisorError, SupervisorResult};
use crate::messages::{ClientEvent, ServerEvent};

/// Maximum accepted frame size (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1_048_576;

/// Encode a server event into a text frame.
pub fn encode_event(event: &ServerEvent) -> SupervisorResult<String> {
    Ok(serde_json::to_string(event)?)
}

/// Decode a text frame into a client event.
///
/// Oversized frames are rejected before parsing.
pub fn decode_event(frame: &str) -> SupervisorResult<ClientEvent> {
    if frame.len() > MAX_FRAME_SIZE {
        return Err(SupervisorError::InvalidMessage(format!(
            "frame too large: {} bytes (max {})",
            frame.len(),
            MAX_FRAME_SIZE
        )));
    }
    Ok(serde_json::from_str(frame)?)
}
