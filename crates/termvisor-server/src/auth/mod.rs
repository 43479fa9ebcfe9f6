//! Viewer authentication: password gate and failed-login throttle.

pub mod gate;
pub mod throttle;

pub use gate::AuthGate;
