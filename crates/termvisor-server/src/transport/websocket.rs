//! WebSocket listener using tokio-tungstenite.
//!
//! Viewers speak JSON over text frames; each accepted connection is handed
//! to the server through a channel.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use termvisor_core::{SupervisorError, SupervisorResult, MAX_FRAME_SIZE};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

pub type WsStream = tokio_tungstenite::WebSocketStream<TcpStream>;

/// A handle to an accepted WebSocket connection.
pub struct WebSocketConnection {
    pub ws_stream: WsStream,
    pub remote_addr: SocketAddr,
}

/// Start the WebSocket listener.
///
/// Returns the bound address and a receiver that yields accepted
/// connections.
pub async fn start_listener(
    bind_addr: &str,
) -> SupervisorResult<(SocketAddr, mpsc::Receiver<WebSocketConnection>)> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| SupervisorError::Transport(format!("WS bind {bind_addr} failed: {e}")))?;
    let local_addr = tcp_listener.local_addr()?;

    info!(addr = %local_addr, "WebSocket listener started");

    let (tx, rx) = mpsc::channel::<WebSocketConnection>(64);

    tokio::spawn(async move {
        loop {
            match tcp_listener.accept().await {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        match tokio_tungstenite::accept_async(stream).await {
                            Ok(ws_stream) => {
                                debug!(remote = %addr, "WebSocket connection accepted");
                                let conn = WebSocketConnection {
                                    ws_stream,
                                    remote_addr: addr,
                                };
                                if tx.send(conn).await.is_err() {
                                    warn!("WebSocket connection channel closed");
                                }
                            }
                            Err(e) => {
                                warn!(remote = %addr, error = %e, "WebSocket handshake failed");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
    });

    Ok((local_addr, rx))
}

/// Send a text frame.
pub async fn ws_send_text(ws: &mut WsStream, text: String) -> SupervisorResult<()> {
    ws.send(Message::Text(text.into()))
        .await
        .map_err(|e| SupervisorError::Transport(format!("WS send failed: {e}")))
}

/// Receive the next text frame.
///
/// Returns `None` once the connection is closed. Binary frames are treated
/// as UTF-8 text; frames over the size limit are rejected. Control frames
/// are skipped.
pub async fn ws_recv_text(ws: &mut WsStream) -> SupervisorResult<Option<String>> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                let text = text.to_string();
                check_size(text.len())?;
                return Ok(Some(text));
            }
            Some(Ok(Message::Binary(data))) => {
                check_size(data.len())?;
                let text = String::from_utf8(data.to_vec()).map_err(|_| {
                    SupervisorError::InvalidMessage("binary frame is not UTF-8".into())
                })?;
                return Ok(Some(text));
            }
            Some(Ok(Message::Close(_))) => return Ok(None),
            // tungstenite answers pings itself on the next write.
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                return Err(SupervisorError::Transport(format!("WS recv failed: {e}")));
            }
            None => return Ok(None),
        }
    }
}

fn check_size(len: usize) -> SupervisorResult<()> {
    if len > MAX_FRAME_SIZE {
        return Err(SupervisorError::InvalidMessage(format!(
            "WS frame too large: {len} bytes (max {MAX_FRAME_SIZE})"
        )));
    }
    Ok(())
}
