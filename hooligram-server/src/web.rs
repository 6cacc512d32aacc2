//! WebSocket transport and health endpoint.
//!
//! The WebSocket endpoint (`/v2`) upgrades to a WebSocket connection, then
//! bridges it to the connection handler via a `DuplexStream`. Each text
//! frame carries one action; from the handler's side a WebSocket client is
//! just another line-oriented stream.

use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};
use std::time::SystemTime;

use axum::Router;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tower_http::cors::CorsLayer;

use crate::server::SharedState;

static START_TIME: OnceLock<SystemTime> = OnceLock::new();

// ── WebSocket ↔ line bridge ────────────────────────────────────────────

/// A WebSocket bridged as `AsyncRead + AsyncWrite` for the connection handler.
///
/// Uses a `tokio::io::DuplexStream` pair with two background tasks:
/// - **rx task:** reads WebSocket frames → one line each → writes to bridge
/// - **tx task:** reads from bridge → splits on `\r\n` → sends as WS text frames
pub struct WsBridge {
    reader: tokio::io::ReadHalf<tokio::io::DuplexStream>,
    writer: tokio::io::WriteHalf<tokio::io::DuplexStream>,
}

/// Turn one WebSocket payload into exactly one line. Raw line breaks inside
/// the payload are outside any JSON string, so replacing them is harmless.
fn frame_to_line(data: &[u8]) -> Vec<u8> {
    let mut bytes: Vec<u8> = data
        .iter()
        .map(|b| if *b == b'\r' || *b == b'\n' { b' ' } else { *b })
        .collect();
    bytes.extend_from_slice(b"\r\n");
    bytes
}

fn bridge_ws(socket: WebSocket) -> WsBridge {
    let (ws_tx, mut ws_rx) = tokio::sync::mpsc::channel::<WsMessage>(64);

    // handler_side is what the connection handler reads/writes.
    let (handler_side, bridge_side) = tokio::io::duplex(64 * 1024);
    let (handler_read, handler_write) = tokio::io::split(handler_side);
    let (mut bridge_read, mut bridge_write) = tokio::io::split(bridge_side);

    // Task 1: owns the WebSocket, frames → bridge_write, ws_rx → frames
    tokio::spawn(async move {
        let mut socket = socket;
        let ws_send_timeout = tokio::time::Duration::from_secs(30);
        loop {
            tokio::select! {
                frame = socket.recv() => {
                    let bytes = match frame {
                        Some(Ok(WsMessage::Text(text))) => frame_to_line(text.as_bytes()),
                        Some(Ok(WsMessage::Binary(data))) => frame_to_line(&data),
                        Some(Ok(WsMessage::Close(_))) | None => break,
                        Some(Ok(_)) => continue, // Ping/Pong handled by axum
                        Some(Err(_)) => break,
                    };
                    if bridge_write.write_all(&bytes).await.is_err() {
                        break;
                    }
                }
                msg = ws_rx.recv() => {
                    let Some(ws_msg) = msg else { break };
                    match tokio::time::timeout(ws_send_timeout, socket.send(ws_msg)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(_)) | Err(_) => {
                            tracing::debug!("WebSocket send failed or timed out, closing bridge");
                            break;
                        }
                    }
                }
            }
        }
        let _ = bridge_write.shutdown().await;
        let _ = socket.send(WsMessage::Close(None)).await;
    });

    // Task 2: bridge_read (handler output) → WS text frames via channel
    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        let mut line_buf = Vec::new();
        loop {
            match bridge_read.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    line_buf.extend_from_slice(&buf[..n]);
                    while let Some(pos) = line_buf.windows(2).position(|w| w == b"\r\n") {
                        let line = String::from_utf8_lossy(&line_buf[..pos]).to_string();
                        line_buf.drain(..pos + 2);
                        if ws_tx.send(WsMessage::Text(line.into())).await.is_err() {
                            return;
                        }
                    }
                }
                Err(_) => break,
            }
        }
    });

    WsBridge {
        reader: handler_read,
        writer: handler_write,
    }
}

impl AsyncRead for WsBridge {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}

impl AsyncWrite for WsBridge {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.writer).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.writer).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.writer).poll_shutdown(cx)
    }
}

// ── Axum router ────────────────────────────────────────────────────────

/// Build the axum router with the WebSocket and health endpoints.
pub fn router(state: Arc<SharedState>) -> Router {
    START_TIME.get_or_init(SystemTime::now);
    Router::new()
        .route("/v2", get(ws_upgrade))
        .route("/api/v1/health", get(api_health))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<Arc<SharedState>>) -> impl IntoResponse {
    // Frame size is enforced by the read loop, which answers 2001 and keeps going.
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

async fn handle_ws(socket: WebSocket, state: Arc<SharedState>) {
    let stream = bridge_ws(socket);
    if let Err(e) = crate::connection::handle_generic(stream, state).await {
        tracing::error!("WebSocket connection error: {e}");
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    connections: usize,
    signed_in: usize,
    uptime_secs: u64,
}

async fn api_health(State(state): State<Arc<SharedState>>) -> Json<HealthResponse> {
    let start = START_TIME.get_or_init(SystemTime::now);
    let uptime = start.elapsed().unwrap_or_default().as_secs();
    Json(HealthResponse {
        status: "ok",
        connections: state.registry.len(),
        signed_in: state.registry.signed_in_count(),
        uptime_secs: uptime,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_becomes_single_line() {
        assert_eq!(frame_to_line(b"{\"a\":1}"), b"{\"a\":1}\r\n".to_vec());
        assert_eq!(frame_to_line(b"{\n\"a\":1\r\n}"), b"{ \"a\":1  }\r\n".to_vec());
    }
}
