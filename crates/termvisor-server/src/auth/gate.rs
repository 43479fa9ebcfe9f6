//! Password gate for viewer connections.

use super::throttle::FailureLog;
use std::sync::Mutex;
use termvisor_core::{SupervisorError, SupervisorResult};
use tracing::{info, warn};

/// Decides whether a connection may observe and drive the session.
#[derive(Debug)]
pub struct AuthGate {
    /// `None` disables the gate entirely.
    password: Option<String>,
    failures: Mutex<FailureLog>,
}

impl AuthGate {
    pub fn new(password: Option<String>, max_failures: u32, window_secs: u64) -> Self {
        let password = password.filter(|p| !p.is_empty());
        if password.is_none() {
            warn!("no console password configured, viewers are not authenticated");
        }
        Self {
            password,
            failures: Mutex::new(FailureLog::new(max_failures, window_secs)),
        }
    }

    /// Whether connections are authorized without logging in.
    pub fn is_open(&self) -> bool {
        self.password.is_none()
    }

    /// Check a login attempt, recording it if it fails.
    pub fn login(&self, password: &str) -> SupervisorResult<()> {
        let Some(expected) = self.password.as_deref() else {
            return Err(SupervisorError::AuthFailed(
                "no console password configured".into(),
            ));
        };

        let mut failures = self
            .failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if failures.is_locked() {
            warn!("login refused, too many recent failures");
            return Err(SupervisorError::AuthFailed(
                "too many failed attempts, try again later".into(),
            ));
        }
        if password == expected {
            info!("viewer logged in");
            Ok(())
        } else {
            failures.record();
            warn!(recent_failures = failures.len(), "wrong console password");
            Err(SupervisorError::AuthFailed("wrong password".into()))
        }
    }

    /// Password check without throttling, for the heartbeat.
    pub fn check_password(&self, password: &str) -> bool {
        match self.password.as_deref() {
            Some(expected) => !password.is_empty() && password == expected,
            None => false,
        }
    }
}
