//! Realtime link to the chat server.
//!
//! A connect succeeds only once the server has accepted the credential and
//! sent `connection_established`. An auth refusal arrives as a close frame
//! right after the upgrade and is reported as `TransportError::Auth`.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use convoy_core::ids::UserId;
use convoy_core::{AuthFailure, ClientEnvelope, ServerEnvelope};

use crate::error::TransportError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const LINK_QUEUE: usize = 64;

#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, url: &str, credential: &SecretString) -> Result<TransportLink, TransportError>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed by this side.
    Local,
    Auth(AuthFailure),
    Server { code: u16, reason: String },
    Lost(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    Envelope(ServerEnvelope),
    Closed(CloseReason),
}

/// A frame queued for writing; `ack` reports whether the write went out.
pub struct Outbound {
    pub envelope: ClientEnvelope,
    pub ack: oneshot::Sender<Result<(), TransportError>>,
}

/// Cloneable write half of a link.
#[derive(Clone)]
pub struct LinkSender {
    tx: mpsc::Sender<Outbound>,
    close: CancellationToken,
}

impl LinkSender {
    /// Queue a frame and wait until it has been written.
    pub async fn send(&self, envelope: ClientEnvelope) -> Result<(), TransportError> {
        if self.close.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let (ack, written) = oneshot::channel();
        self.tx
            .send(Outbound { envelope, ack })
            .await
            .map_err(|_| TransportError::Closed)?;
        written.await.map_err(|_| TransportError::Closed)?
    }

    pub fn close(&self) {
        self.close.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.close.is_cancelled() || self.tx.is_closed()
    }
}

/// An established link: the user the server authenticated, the write half,
/// and the stream of incoming events. `Closed` is always the last event.
pub struct TransportLink {
    pub user_id: UserId,
    pub sender: LinkSender,
    pub events: mpsc::Receiver<TransportEvent>,
}

/// The transport-side ends of a link.
pub struct LinkDriver {
    pub outbound: mpsc::Receiver<Outbound>,
    pub events: mpsc::Sender<TransportEvent>,
    pub close: CancellationToken,
}

pub fn link_pair(user_id: UserId) -> (TransportLink, LinkDriver) {
    let (out_tx, out_rx) = mpsc::channel(LINK_QUEUE);
    let (ev_tx, ev_rx) = mpsc::channel(LINK_QUEUE);
    let close = CancellationToken::new();
    let link = TransportLink {
        user_id,
        sender: LinkSender {
            tx: out_tx,
            close: close.clone(),
        },
        events: ev_rx,
    };
    let driver = LinkDriver {
        outbound: out_rx,
        events: ev_tx,
        close,
    };
    (link, driver)
}

/// WebSocket transport over tokio-tungstenite.
pub struct WsTransport {
    handshake_timeout: Duration,
}

impl WsTransport {
    pub fn new(handshake_timeout: Duration) -> Self {
        Self { handshake_timeout }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self, url: &str, credential: &SecretString) -> Result<TransportLink, TransportError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", credential.expose_secret()))
            .map_err(|_| TransportError::Auth(AuthFailure::Invalid))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (mut ws, _) = connect_async(request)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let user_id = tokio::time::timeout(self.handshake_timeout, await_established(&mut ws))
            .await
            .map_err(|_| TransportError::Handshake("timed out waiting for connection_established".into()))??;

        tracing::debug!(user_id = %user_id, "WebSocket link established");
        let (link, driver) = link_pair(user_id);
        tokio::spawn(pump(ws, driver));
        Ok(link)
    }
}

async fn await_established(ws: &mut WsStream) -> Result<UserId, TransportError> {
    while let Some(frame) = ws.next().await {
        match frame.map_err(|e| TransportError::Handshake(e.to_string()))? {
            Message::Text(text) => {
                return match ServerEnvelope::decode(text.as_str()) {
                    Ok(ServerEnvelope::ConnectionEstablished { user_id }) => Ok(user_id),
                    Ok(other) => Err(TransportError::Handshake(format!("unexpected first frame: {other:?}"))),
                    Err(e) => Err(TransportError::Handshake(e.to_string())),
                };
            }
            Message::Close(frame) => {
                return Err(match close_reason(frame) {
                    CloseReason::Auth(failure) => TransportError::Auth(failure),
                    _ => TransportError::Closed,
                });
            }
            _ => {}
        }
    }
    Err(TransportError::Closed)
}

fn close_reason(frame: Option<CloseFrame>) -> CloseReason {
    let Some(frame) = frame else {
        return CloseReason::Server {
            code: 1005,
            reason: String::new(),
        };
    };
    let code = u16::from(frame.code);
    match AuthFailure::from_close(code, frame.reason.as_str()) {
        Some(failure) => CloseReason::Auth(failure),
        None => CloseReason::Server {
            code,
            reason: frame.reason.as_str().to_string(),
        },
    }
}

async fn pump(ws: WsStream, mut driver: LinkDriver) {
    let (mut sink, mut stream) = ws.split();

    let reason = loop {
        tokio::select! {
            _ = driver.close.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                break CloseReason::Local;
            }
            item = driver.outbound.recv() => {
                let Some(Outbound { envelope, ack }) = item else {
                    let _ = sink.send(Message::Close(None)).await;
                    break CloseReason::Local;
                };
                let result = match envelope.encode() {
                    Ok(text) => sink
                        .send(Message::Text(text.into()))
                        .await
                        .map_err(|e| TransportError::Send(e.to_string())),
                    Err(e) => Err(TransportError::Send(e.to_string())),
                };
                let write_failed = result.is_err();
                let _ = ack.send(result);
                if write_failed {
                    break CloseReason::Lost("write failed".into());
                }
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => match ServerEnvelope::decode(text.as_str()) {
                    Ok(envelope) => {
                        if driver.events.send(TransportEvent::Envelope(envelope)).await.is_err() {
                            break CloseReason::Local;
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "Dropping undecodable server frame"),
                },
                Some(Ok(Message::Close(frame))) => break close_reason(frame),
                Some(Ok(_)) => {}
                Some(Err(e)) => break CloseReason::Lost(e.to_string()),
                None => break CloseReason::Lost("stream ended".into()),
            }
        }
    };

    tracing::debug!(?reason, "WebSocket link closed");
    driver.close.cancel();
    let _ = driver.events.send(TransportEvent::Closed(reason)).await;
}
