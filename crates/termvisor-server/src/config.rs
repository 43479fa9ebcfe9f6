//! Server configuration: TOML file + CLI overrides + environment.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use termvisor_core::{SupervisorError, SupervisorResult};
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub process: ProcessSection,
    #[serde(default)]
    pub auth: AuthSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// `[process]` section: the supervised worker.
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessSection {
    #[serde(default = "default_command")]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_instant_flag")]
    pub instant_flag: String,
    #[serde(default = "default_config_env")]
    pub config_env: String,
    #[serde(default = "default_history_bytes")]
    pub history_bytes: usize,
}

impl Default for ProcessSection {
    fn default() -> Self {
        Self {
            command: default_command(),
            args: Vec::new(),
            instant_flag: default_instant_flag(),
            config_env: default_config_env(),
            history_bytes: default_history_bytes(),
        }
    }
}

/// `[auth]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthSection {
    #[serde(default = "default_password_env")]
    pub password_env: String,
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
    #[serde(default = "default_failure_window")]
    pub failure_window_secs: u64,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            password_env: default_password_env(),
            max_failures: default_max_failures(),
            failure_window_secs: default_failure_window(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    1818
}
fn default_command() -> String {
    "embykeeper".to_string()
}
fn default_instant_flag() -> String {
    "--instant".to_string()
}
fn default_config_env() -> String {
    "EK_CONFIG".to_string()
}
fn default_history_bytes() -> usize {
    256 * 1024
}
fn default_password_env() -> String {
    "EK_WEBPASS".to_string()
}
fn default_max_failures() -> u32 {
    5
}
fn default_failure_window() -> u64 {
    3600
}

/// Command-line values that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub command: Option<String>,
    /// Non-empty trailing arguments replace `[process].args`.
    pub args: Vec<String>,
}

/// Resolved server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub command: String,
    pub args: Vec<String>,
    pub instant_flag: String,
    pub config_env: String,
    pub history_bytes: usize,
    /// Console password; `None` leaves the console open.
    pub password: Option<String>,
    pub max_failures: u32,
    pub failure_window_secs: u64,
    /// Initial encoded config blob for the worker.
    pub encoded_config: String,
}

impl ServerConfig {
    /// Load config from TOML file, apply CLI overrides, then read the
    /// password and config blob from the environment.
    pub fn load(config_path: Option<&Path>, cli: CliOverrides) -> SupervisorResult<Self> {
        let file_config = match config_path {
            Some(path) => load_file(path)?,
            None => ConfigFile::default(),
        };
        Ok(Self::resolve(file_config, cli, |key| std::env::var(key).ok()))
    }

    pub(crate) fn resolve(
        file: ConfigFile,
        cli: CliOverrides,
        env: impl Fn(&str) -> Option<String>,
    ) -> Self {
        let args = if cli.args.is_empty() {
            file.process.args
        } else {
            cli.args
        };
        let password = env(&file.auth.password_env).filter(|p| !p.is_empty());
        let encoded_config = env(&file.process.config_env).unwrap_or_default();

        Self {
            host: cli.host.unwrap_or(file.server.host),
            port: cli.port.unwrap_or(file.server.port),
            command: cli.command.unwrap_or(file.process.command),
            args,
            instant_flag: file.process.instant_flag,
            config_env: file.process.config_env,
            history_bytes: file.process.history_bytes,
            password,
            max_failures: file.auth.max_failures,
            failure_window_secs: file.auth.failure_window_secs,
            encoded_config,
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn load_file(path: &Path) -> SupervisorResult<ConfigFile> {
    let expanded = expand_tilde(path);
    if !expanded.exists() {
        info!(path = %expanded.display(), "config file not found, using defaults");
        return Ok(ConfigFile::default());
    }
    info!(path = %expanded.display(), "loading config file");
    let content = std::fs::read_to_string(&expanded)?;
    toml::from_str::<ConfigFile>(&content)
        .map_err(|e| SupervisorError::Config(format!("config parse error: {e}")))
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
