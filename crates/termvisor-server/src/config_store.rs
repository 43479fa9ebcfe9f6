//! Opaque configuration blob handed to the worker.
//!
//! The blob is base64-encoded TOML. The supervisor never interprets it
//! beyond decoding it for display and re-encoding an edited copy; the
//! worker receives it verbatim through its environment.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::sync::{RwLock, RwLockReadGuard};
use termvisor_core::{SupervisorError, SupervisorResult};
use tracing::info;

#[derive(Debug, Default)]
pub struct ConfigStore {
    encoded: RwLock<String>,
}

impl ConfigStore {
    pub fn new(encoded: impl Into<String>) -> Self {
        Self {
            encoded: RwLock::new(encoded.into()),
        }
    }

    /// The blob exactly as it will be passed to the next launched worker.
    pub fn encoded(&self) -> String {
        self.read().clone()
    }

    /// Decode the blob back to TOML text.
    pub fn decoded(&self) -> SupervisorResult<String> {
        let compact: String = self.read().split_whitespace().collect();
        if compact.is_empty() {
            return Err(SupervisorError::Config("config missing".into()));
        }
        let bytes = STANDARD
            .decode(compact.as_bytes())
            .map_err(|_| SupervisorError::Config("config malformed".into()))?;
        String::from_utf8(bytes).map_err(|_| SupervisorError::Config("config malformed".into()))
    }

    /// Replace the blob with a normalized encoding of `toml_text`.
    ///
    /// Comments and formatting are dropped. Invalid TOML leaves the stored
    /// blob untouched.
    pub fn save(&self, toml_text: &str) -> SupervisorResult<String> {
        let table: toml::Table = toml::from_str(toml_text)
            .map_err(|e| SupervisorError::Config(format!("invalid TOML: {e}")))?;
        let clean = toml::to_string(&table)
            .map_err(|e| SupervisorError::Config(format!("cannot serialize TOML: {e}")))?;
        let encoded = STANDARD.encode(clean.as_bytes());

        let mut slot = self
            .encoded
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = encoded.clone();
        info!(bytes = encoded.len(), "config blob replaced");
        Ok(encoded)
    }

    fn read(&self) -> RwLockReadGuard<'_, String> {
        self.encoded
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
