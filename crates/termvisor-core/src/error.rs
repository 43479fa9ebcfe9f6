use thiserror::Error;

/// Errors produced by the supervisor and its protocol layer.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The worker process could not be spawned (missing executable,
    /// permission denied, ...).
    #[error("launch failed: {0}")]
    LaunchFailed(String),

    /// The OS could not allocate a pseudo-terminal.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The PTY handle is gone (process exited or session torn down).
    #[error("channel closed")]
    ChannelClosed,

    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for SupervisorError {
    fn from(e: serde_json::Error) -> Self {
        SupervisorError::Codec(e.to_string())
    }
}

impl SupervisorError {
    /// Whether this error is reported back to a viewer as a failed `start`.
    pub fn is_launch_failure(&self) -> bool {
        matches!(
            self,
            SupervisorError::LaunchFailed(_) | SupervisorError::ResourceExhausted(_)
        )
    }
}

pub type SupervisorResult<T> = Result<T, SupervisorError>;
