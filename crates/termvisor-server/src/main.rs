//! termvisor: browser-attached terminal supervisor.
//!
//! Runs one worker process on a pseudo-terminal and lets viewers watch and
//! drive it over WebSocket, with history replay for late joiners.

mod auth;
mod config;
mod config_store;
mod server;
mod session;
mod transport;

use clap::Parser;
use config::{CliOverrides, ServerConfig};
use server::TermvisorServer;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

/// Command-line options.
#[derive(Parser, Debug)]
#[command(name = "termvisor", version, about = "Terminal supervisor")]
struct Cli {
    /// Listen port
    #[arg(short, long, env = "PORT")]
    port: Option<u16>,

    /// Listen address
    #[arg(long)]
    host: Option<String>,

    /// Worker executable
    #[arg(long)]
    command: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.termvisor/config.toml")]
    config: String,

    /// Do not launch the worker at boot; wait for a viewer
    #[arg(long)]
    wait: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Arguments passed to the worker
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting termvisor");

    let config_path = PathBuf::from(&cli.config);
    let overrides = CliOverrides {
        host: cli.host,
        port: cli.port,
        command: cli.command,
        args: cli.args,
    };
    let server_config = match ServerConfig::load(Some(&config_path), overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let server = Arc::new(TermvisorServer::new(server_config));
    if !cli.wait {
        server.boot().await;
    }

    let mut failed = false;
    tokio::select! {
        result = server.clone().run() => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                failed = true;
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    server.shutdown().await;
    info!("termvisor stopped");
    if failed {
        std::process::exit(1);
    }
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
