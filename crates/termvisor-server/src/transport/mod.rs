//! Viewer transport: WebSocket listener and viewer registry.

pub mod viewers;
pub mod websocket;

pub use viewers::ViewerRegistry;
