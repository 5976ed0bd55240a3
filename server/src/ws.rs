//! WebSocket transport for the gateway.
//!
//! Flow per connection:
//! 1. Accept WS upgrade
//! 2. Handshake through the gateway (register + initial state)
//! 3. Pump loop: client frames → gateway, queued frames → socket. While a
//!    command is in flight the queue keeps draining and eviction is honoured.
//! 4. On close, error, or eviction: unregister

use std::future::Future;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::GatewayError;
use crate::registry::{ConnectionHandle, Outbound};
use crate::state::AppState;
use crate::types::{ConnectionId, ServerErrorMsg, ServerMessage};

type Sender = SplitSink<WebSocket, Message>;

enum Flow {
    Continue,
    Stop,
}

/// Axum handler for GET /ws; upgrades to WebSocket.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Per-connection pump.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();

    // ── Handshake ───────────────────────────────────────────
    let ConnectionHandle { id, mut rx, closed } = match state.gateway.connect().await {
        Ok(handle) => handle,
        Err(e) => {
            warn!("handshake failed: {e}");
            let _ = send_error(&mut sender, &e).await;
            let _ = sender.send(Message::Close(None)).await;
            return;
        }
    };

    // ── Pump ────────────────────────────────────────────────
    loop {
        tokio::select! {
            biased;

            _ = closed.cancelled() => {
                info!(connection_id = %id, "closing evicted connection");
                let _ = sender.send(Message::Close(None)).await;
                break;
            }
            out = rx.recv() => {
                let Some(msg) = out else { break };
                if let Err(e) = send_msg(&mut sender, &msg).await {
                    warn!(connection_id = %id, "ws send error: {e}");
                    break;
                }
            }
            frame = receiver.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        let dispatch = state.gateway.dispatch(id, &text);
                        if let Flow::Stop = drive(dispatch, &mut sender, &mut rx, &closed, id).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(_))) => { /* axum auto-pongs */ }
                    Some(Ok(_)) => debug!(connection_id = %id, "ignoring non-text frame"),
                    Some(Err(e)) => {
                        warn!(connection_id = %id, "ws recv error: {e}");
                        break;
                    }
                }
            }
        }
    }

    // ── Cleanup ─────────────────────────────────────────────
    state.gateway.disconnect(id);
}

/// Run one command to completion while still flushing this connection's
/// queue. On eviction the Close goes out at once and the command still runs
/// to completion.
async fn drive(
    dispatch: impl Future<Output = ()>,
    sender: &mut Sender,
    rx: &mut mpsc::Receiver<Outbound>,
    closed: &CancellationToken,
    id: ConnectionId,
) -> Flow {
    tokio::pin!(dispatch);
    loop {
        tokio::select! {
            biased;

            () = &mut dispatch => return Flow::Continue,
            _ = closed.cancelled() => {
                info!(connection_id = %id, "closing evicted connection");
                let _ = sender.send(Message::Close(None)).await;
                dispatch.await;
                return Flow::Stop;
            }
            Some(msg) = rx.recv() => {
                if let Err(e) = send_msg(sender, &msg).await {
                    warn!(connection_id = %id, "ws send error: {e}");
                    dispatch.await;
                    return Flow::Stop;
                }
            }
        }
    }
}

async fn send_msg(sender: &mut Sender, msg: &ServerMessage) -> Result<(), GatewayError> {
    let json = serde_json::to_string(msg)
        .map_err(|e| GatewayError::Protocol(format!("serialize error: {e}")))?;
    sender
        .send(Message::Text(json.into()))
        .await
        .map_err(|e| GatewayError::Protocol(format!("send error: {e}")))
}

async fn send_error(sender: &mut Sender, err: &GatewayError) -> Result<(), GatewayError> {
    let msg = ServerMessage::Error(ServerErrorMsg {
        code: err.code().into(),
        message: err.to_string(),
    });
    send_msg(sender, &msg).await
}
