//! Terminal session supervision: PTY channel, launcher, output pump, exit
//! watcher and the single-session controller.

pub mod broadcast;
pub mod controller;
pub mod history;
pub mod launcher;
pub mod pty;
mod pump;
pub mod ring_buffer;
mod watcher;

#[cfg(test)]
pub(crate) mod tests;

pub use broadcast::{Broadcaster, ViewerId};
pub use controller::{
    KillOutcome, LaunchSettings, SessionController, SessionInfo, StartOutcome, Timing,
};
pub use launcher::{ChildProcess, LaunchSpec, Launcher, PtyLauncher, Signal, Spawned};
pub use pty::Terminal;
pub use watcher::exit_notice;
