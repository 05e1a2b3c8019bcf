//! WebSocket connection lifecycle.
//!
//! `Unauthenticated → Authenticated → Closed`. The credential presented on
//! the upgrade request is verified once; a refusal closes the socket with an
//! application close code. Frames of an authenticated connection are handled
//! in order on the connection's own task.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use convoy_core::{AuthFailure, ServerEnvelope};

use crate::auth::{self, CredentialVerifier};
use crate::gateway::{ConnectionContext, Gateway};

/// Normal closure sent when the server ends a connection it accepted.
const CLOSE_NORMAL: u16 = 1000;

pub enum ConnectionState {
    Unauthenticated,
    Authenticated {
        ctx: ConnectionContext,
        outbound: mpsc::Receiver<String>,
    },
    Closed(CloseCause),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseCause {
    Rejected(AuthFailure),
    /// Peer closed, socket errored, or the connection was superseded.
    Ended,
    Shutdown,
}

/// Everything a connection task needs from the server.
#[derive(Clone)]
pub struct ConnectionDeps {
    pub gateway: Arc<Gateway>,
    pub verifier: Arc<dyn CredentialVerifier>,
    pub heartbeat: Duration,
    pub shutdown: CancellationToken,
}

/// Drive one upgraded socket through its state machine until closed.
pub async fn serve_connection(socket: WebSocket, credential: Option<String>, deps: ConnectionDeps) -> CloseCause {
    let mut socket = Some(socket);
    let mut state = ConnectionState::Unauthenticated;
    loop {
        state = match state {
            ConnectionState::Unauthenticated => {
                match auth::authenticate(deps.verifier.as_ref(), credential.as_deref()) {
                    Ok(principal) => {
                        let (ctx, outbound) = deps.gateway.connect(principal).await;
                        ctx.reply(&ServerEnvelope::ConnectionEstablished { user_id: ctx.user_id() });
                        ConnectionState::Authenticated { ctx, outbound }
                    }
                    Err(failure) => {
                        tracing::info!(reason = failure.reason(), "Connection rejected");
                        if let Some(mut ws) = socket.take() {
                            let frame = CloseFrame {
                                code: failure.close_code(),
                                reason: failure.reason().to_string().into(),
                            };
                            let _ = ws.send(WsMessage::Close(Some(frame))).await;
                        }
                        ConnectionState::Closed(CloseCause::Rejected(failure))
                    }
                }
            }
            ConnectionState::Authenticated { ctx, outbound } => {
                let cause = match socket.take() {
                    Some(ws) => run_authenticated(ws, &ctx, outbound, &deps).await,
                    None => CloseCause::Ended,
                };
                deps.gateway.disconnect(&ctx);
                ConnectionState::Closed(cause)
            }
            ConnectionState::Closed(cause) => return cause,
        };
    }
}

/// Writer forwards the outbound queue plus heartbeat pings; the reader
/// dispatches frames to the gateway. Either side ending closes both.
async fn run_authenticated(
    socket: WebSocket,
    ctx: &ConnectionContext,
    mut rx: mpsc::Receiver<String>,
    deps: &ConnectionDeps,
) -> CloseCause {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let writer_conn = ctx.connection_id.clone();
    let heartbeat = deps.heartbeat;
    let writer_stop = deps.shutdown.child_token();
    let writer_cancel = writer_stop.clone();
    let mut writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(heartbeat);
        ping_interval.tick().await;

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Some(text) => {
                            if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                                return;
                            }
                        }
                        // Superseded or registry cleared
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_tx.send(WsMessage::Ping(Vec::<u8>::new().into())).await.is_err() {
                        return;
                    }
                    tracing::trace!(connection_id = %writer_conn, "Sent ping");
                }
                _ = writer_cancel.cancelled() => break,
            }
        }

        let frame = CloseFrame {
            code: CLOSE_NORMAL,
            reason: String::new().into(),
        };
        let _ = ws_tx.send(WsMessage::Close(Some(frame))).await;
    });

    let cause = loop {
        tokio::select! {
            _ = deps.shutdown.cancelled() => break CloseCause::Shutdown,
            _ = &mut writer => break CloseCause::Ended,
            frame = ws_rx.next() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        if let Some(reply) = deps.gateway.handle_text(ctx, text.as_str()).await {
                            ctx.reply(&reply);
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break CloseCause::Ended,
                    Some(Err(e)) => {
                        tracing::debug!(connection_id = %ctx.connection_id, error = %e, "Socket error");
                        break CloseCause::Ended;
                    }
                    // Pings are answered by axum; binary frames are not part of the protocol
                    Some(Ok(_)) => {}
                }
            }
        }
    };

    writer_stop.cancel();
    if !writer.is_finished() {
        let _ = tokio::time::timeout(Duration::from_secs(1), &mut writer).await;
    }
    cause
}
