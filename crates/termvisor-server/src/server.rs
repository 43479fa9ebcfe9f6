//! Core server: accepts viewer connections and dispatches their events.
//!
//! Owns the authentication gate, the config-blob store, the viewer registry
//! and the session controller. Every connection gets its own loop that
//! interleaves inbound frames with the viewer's outbound queue.

use crate::auth::AuthGate;
use crate::config::ServerConfig;
use crate::config_store::ConfigStore;
use crate::session::{
    LaunchSettings, Launcher, PtyLauncher, SessionController, StartOutcome, Timing, ViewerId,
};
use crate::transport::websocket::{self, WsStream};
use crate::transport::ViewerRegistry;
use std::sync::Arc;
use termvisor_core::{
    decode_event, encode_event, ClientEvent, ServerEvent, SupervisorError, SupervisorResult,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Per-connection state threaded through the dispatcher.
struct ConnectionContext {
    viewer: ViewerId,
    /// Logged in, or the gate is open.
    authorized: bool,
}

/// The termvisor server instance.
pub struct TermvisorServer {
    config: ServerConfig,
    auth: AuthGate,
    config_store: Arc<ConfigStore>,
    viewers: Arc<ViewerRegistry>,
    controller: SessionController,
}

impl TermvisorServer {
    /// Create a server that launches the worker on a native PTY.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_launcher(config, Arc::new(PtyLauncher), Timing::default())
    }

    pub fn with_launcher(config: ServerConfig, launcher: Arc<dyn Launcher>, timing: Timing) -> Self {
        let auth = AuthGate::new(
            config.password.clone(),
            config.max_failures,
            config.failure_window_secs,
        );
        let config_store = Arc::new(ConfigStore::new(config.encoded_config.clone()));
        let viewers = Arc::new(ViewerRegistry::new());
        let settings = LaunchSettings {
            command: config.command.clone(),
            args: config.args.clone(),
            instant_flag: config.instant_flag.clone(),
            config_env: config.config_env.clone(),
            history_bytes: config.history_bytes,
        };
        let controller = SessionController::new(
            launcher,
            viewers.clone(),
            config_store.clone(),
            settings,
            timing,
        );

        Self {
            config,
            auth,
            config_store,
            viewers,
            controller,
        }
    }

    /// Launch the worker at boot with the instant flag. Nobody is attached
    /// yet, so its first output lands in history only.
    pub async fn boot(&self) {
        match self.controller.ensure_running(true).await {
            Ok((_, pid)) => info!(?pid, command = %self.config.command, "worker launched at boot"),
            Err(e) => warn!(error = %e, "boot launch failed, waiting for a viewer"),
        }
    }

    /// Stop the worker, if any. Used by the shutdown hook.
    pub async fn shutdown(&self) {
        let outcome = self.controller.kill().await;
        info!(?outcome, "supervisor shut down");
    }

    /// Accept viewer connections until the listener closes.
    pub async fn run(self: Arc<Self>) -> SupervisorResult<()> {
        let (local_addr, mut ws_rx) = websocket::start_listener(&self.config.bind_addr()).await?;

        info!(
            addr = %local_addr,
            command = %self.config.command,
            auth = !self.auth.is_open(),
            "termvisor ready"
        );

        while let Some(conn) = ws_rx.recv().await {
            let srv = self.clone();
            tokio::spawn(async move {
                let remote = conn.remote_addr;
                if let Err(e) = srv.handle_websocket(conn.ws_stream).await {
                    warn!(remote = %remote, error = %e, "WebSocket connection error");
                }
            });
        }

        info!("listener closed, shutting down");
        Ok(())
    }

    async fn handle_websocket(&self, mut ws: WsStream) -> SupervisorResult<()> {
        let (viewer, outbound) = self.viewers.register();
        let mut ctx = ConnectionContext {
            viewer,
            authorized: self.auth.is_open(),
        };
        info!(viewer, authorized = ctx.authorized, "viewer connected");

        let result = self.connection_loop(&mut ws, &mut ctx, outbound).await;

        self.viewers.unregister(viewer);
        info!(viewer, "viewer disconnected");
        result
    }

    async fn connection_loop(
        &self,
        ws: &mut WsStream,
        ctx: &mut ConnectionContext,
        mut outbound: mpsc::Receiver<ServerEvent>,
    ) -> SupervisorResult<()> {
        loop {
            tokio::select! {
                Some(event) = outbound.recv() => {
                    send_event(ws, &event).await?;
                }

                frame = websocket::ws_recv_text(ws) => {
                    match frame {
                        Ok(Some(text)) => {
                            let reply = match decode_event(&text) {
                                Ok(event) => self.dispatch(ctx, event).await,
                                Err(e) => {
                                    debug!(viewer = ctx.viewer, error = %e, "undecodable frame");
                                    Some(ServerEvent::error(e.to_string()))
                                }
                            };
                            if let Some(reply) = reply {
                                send_event(ws, &reply).await?;
                            }
                        }
                        Ok(None) => {
                            debug!(viewer = ctx.viewer, "WebSocket closed by peer");
                            break;
                        }
                        Err(SupervisorError::InvalidMessage(reason)) => {
                            send_event(ws, &ServerEvent::error(reason)).await?;
                        }
                        Err(e) => {
                            debug!(viewer = ctx.viewer, error = %e, "WebSocket session ended");
                            break;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Handle one decoded event, returning the direct reply if there is one.
    async fn dispatch(&self, ctx: &mut ConnectionContext, event: ClientEvent) -> Option<ServerEvent> {
        match event {
            ClientEvent::Login { password } => Some(match self.auth.login(&password) {
                Ok(()) => {
                    ctx.authorized = true;
                    ServerEvent::LoginOk {}
                }
                Err(SupervisorError::AuthFailed(reason)) => ServerEvent::LoginFail { reason },
                Err(e) => ServerEvent::LoginFail {
                    reason: e.to_string(),
                },
            }),

            ClientEvent::Heartbeat { password } => Some(self.heartbeat(&password).await),

            _ if !ctx.authorized => {
                debug!(viewer = ctx.viewer, "unauthorized event dropped");
                None
            }

            ClientEvent::Start { rows, cols, instant } => {
                match self.controller.start(Some(ctx.viewer), rows, cols, instant).await {
                    Ok(StartOutcome::Launched { pid }) => {
                        info!(viewer = ctx.viewer, ?pid, "worker started");
                        None
                    }
                    Ok(StartOutcome::Reattached) => {
                        info!(viewer = ctx.viewer, "viewer reattached");
                        None
                    }
                    Err(e) => {
                        warn!(viewer = ctx.viewer, error = %e, "start failed");
                        Some(ServerEvent::output(format!("\r\nFailed to start: {e}\r\n")))
                    }
                }
            }

            ClientEvent::Input { data } => {
                self.controller.input(data.as_bytes()).await;
                None
            }

            ClientEvent::Resize { rows, cols } => {
                self.controller.resize(rows, cols).await;
                None
            }

            ClientEvent::Kill {} => {
                // The slot is cleared before the next event is read; only the
                // up-to-a-second signal phase runs in the background.
                let Some(teardown) = self.controller.detach().await else {
                    debug!(viewer = ctx.viewer, "kill without a session");
                    return None;
                };
                let viewer = ctx.viewer;
                tokio::spawn(async move {
                    let outcome = teardown.finish().await;
                    info!(viewer, ?outcome, "kill requested");
                });
                None
            }

            ClientEvent::ConfigGet {} => Some(match self.config_store.decoded() {
                Ok(config) => ServerEvent::Config { config },
                Err(e) => ServerEvent::ConfigError {
                    reason: e.to_string(),
                },
            }),

            ClientEvent::ConfigSave { config } => Some(match self.config_store.save(&config) {
                Ok(encoded) => {
                    info!(viewer = ctx.viewer, "config saved, applies at next start");
                    ServerEvent::ConfigSaved { encoded }
                }
                Err(e) => ServerEvent::ConfigError {
                    reason: e.to_string(),
                },
            }),

            ClientEvent::Ping {} => Some(ServerEvent::Pong {}),
        }
    }

    async fn heartbeat(&self, password: &str) -> ServerEvent {
        if !self.auth.check_password(password) {
            return ServerEvent::error("invalid password");
        }
        match self.controller.ensure_running(false).await {
            Ok((state, pid)) => {
                debug!(?state, ?pid, "heartbeat");
                ServerEvent::Status { state, pid }
            }
            Err(e) => {
                warn!(error = %e, "heartbeat could not start the worker");
                ServerEvent::error(e.to_string())
            }
        }
    }
}

async fn send_event(ws: &mut WsStream, event: &ServerEvent) -> SupervisorResult<()> {
    let frame = encode_event(event)?;
    websocket::ws_send_text(ws, frame).await
}
