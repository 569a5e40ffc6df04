//! WebSocket transport, for the browser-facing connection.
//!
//! A pump task owns the socket: it drains an outbound channel into the
//! sink and forwards inbound binary messages to the receiver side, so
//! `try_send` stays synchronous. Ping/pong/text frames are skipped.
//!
//! Close-code semantics: 1008 (policy violation) is how the bridge
//! signals session termination; it maps to
//! [`TransportError::SessionTerminated`] and is fatal. Every other
//! close maps to [`TransportError::Closed`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;

use crate::TransportError;

/// Close code carried on a session-termination close.
pub const CLOSE_CODE_SESSION_TERMINATED: u16 = 1008;

/// Abstraction over WebSocket message types so one pump serves both
/// `tokio-tungstenite` and `axum` sockets.
pub trait WsMessage: Sized + Send + 'static {
    /// Create a binary message.
    fn binary(data: Vec<u8>) -> Self;

    /// Create a close message.
    fn close() -> Self;

    /// Returns `true` if this is a close message.
    fn is_close(&self) -> bool;

    /// Close code, for close messages that carry one.
    fn close_code(&self) -> Option<u16>;

    /// Extract binary data. `None` if not a binary message.
    fn into_binary(self) -> Option<Vec<u8>>;

    /// Returns `true` for messages with no protocol meaning here
    /// (ping, pong, text).
    fn should_skip(&self) -> bool;
}

#[derive(Debug)]
enum Outbound {
    Message(Vec<u8>),
    Close,
}

#[derive(Debug, Default)]
struct SocketState {
    closed: AtomicBool,
    terminated: AtomicBool,
}

#[derive(Clone, Debug)]
pub struct WebSocketTransport {
    outbound: mpsc::UnboundedSender<Outbound>,
    inbound: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>>,
    state: Arc<SocketState>,
}

impl WebSocketTransport {
    #[cfg(feature = "websocket")]
    pub fn new<S>(ws: tokio_tungstenite::WebSocketStream<S>) -> Self
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        Self::from_socket(ws)
    }

    #[cfg(feature = "websocket-axum")]
    pub fn from_axum(ws: axum::extract::ws::WebSocket) -> Self {
        Self::from_socket(ws)
    }

    fn from_socket<S, M, E>(ws: S) -> Self
    where
        S: Stream<Item = Result<M, E>> + Sink<M, Error = E> + Send + Unpin + 'static,
        M: WsMessage,
        E: std::fmt::Display + Send + 'static,
    {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let state = Arc::new(SocketState::default());

        tokio::spawn(pump(ws, outbound_rx, inbound_tx, state.clone()));

        Self {
            outbound: outbound_tx,
            inbound: Arc::new(tokio::sync::Mutex::new(inbound_rx)),
            state,
        }
    }

    pub fn try_send(&self, message: Vec<u8>) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::NotWritable);
        }
        self.outbound
            .send(Outbound::Message(message))
            .map_err(|_| TransportError::NotWritable)
    }

    pub async fn recv(&self) -> Result<Vec<u8>, TransportError> {
        let mut rx = self.inbound.lock().await;
        match rx.recv().await {
            Some(bytes) => Ok(bytes),
            None if self.state.terminated.load(Ordering::Acquire) => {
                Err(TransportError::SessionTerminated)
            }
            None => Err(TransportError::Closed),
        }
    }

    pub fn close(&self) {
        if !self.state.closed.swap(true, Ordering::AcqRel) {
            let _ = self.outbound.send(Outbound::Close);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::Acquire)
    }
}

/// Owns the socket: serializes outbound sends, forwards inbound binary
/// messages, and records how the socket ended.
async fn pump<S, M, E>(
    mut ws: S,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    inbound: mpsc::UnboundedSender<Vec<u8>>,
    state: Arc<SocketState>,
) where
    S: Stream<Item = Result<M, E>> + Sink<M, Error = E> + Send + Unpin + 'static,
    M: WsMessage,
    E: std::fmt::Display + Send + 'static,
{
    loop {
        tokio::select! {
            out = outbound.recv() => match out {
                Some(Outbound::Message(bytes)) => {
                    if let Err(e) = ws.send(M::binary(bytes)).await {
                        tracing::warn!(error = %e, "websocket send failed");
                        break;
                    }
                }
                Some(Outbound::Close) | None => {
                    let _ = ws.send(M::close()).await;
                    break;
                }
            },
            incoming = ws.next() => match incoming {
                Some(Ok(msg)) if msg.is_close() => {
                    if msg.close_code() == Some(CLOSE_CODE_SESSION_TERMINATED) {
                        tracing::warn!("websocket closed: session terminated");
                        state.terminated.store(true, Ordering::Release);
                    } else {
                        tracing::debug!(code = ?msg.close_code(), "websocket closed by peer");
                    }
                    break;
                }
                Some(Ok(msg)) if msg.should_skip() => {}
                Some(Ok(msg)) => {
                    if let Some(bytes) = msg.into_binary() {
                        if inbound.send(bytes).is_err() {
                            break;
                        }
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "websocket receive failed");
                    break;
                }
                None => break,
            },
        }
    }
    state.closed.store(true, Ordering::Release);
}

#[cfg(feature = "websocket")]
impl WsMessage for tokio_tungstenite::tungstenite::Message {
    fn binary(data: Vec<u8>) -> Self {
        Self::Binary(data)
    }

    fn close() -> Self {
        Self::Close(None)
    }

    fn is_close(&self) -> bool {
        matches!(self, Self::Close(_))
    }

    fn close_code(&self) -> Option<u16> {
        match self {
            Self::Close(Some(frame)) => Some(frame.code.into()),
            _ => None,
        }
    }

    fn into_binary(self) -> Option<Vec<u8>> {
        match self {
            Self::Binary(data) => Some(data),
            _ => None,
        }
    }

    fn should_skip(&self) -> bool {
        matches!(self, Self::Ping(_) | Self::Pong(_) | Self::Text(_) | Self::Frame(_))
    }
}

#[cfg(feature = "websocket-axum")]
impl WsMessage for axum::extract::ws::Message {
    fn binary(data: Vec<u8>) -> Self {
        Self::Binary(data)
    }

    fn close() -> Self {
        Self::Close(None)
    }

    fn is_close(&self) -> bool {
        matches!(self, Self::Close(_))
    }

    fn close_code(&self) -> Option<u16> {
        match self {
            Self::Close(Some(frame)) => Some(frame.code),
            _ => None,
        }
    }

    fn into_binary(self) -> Option<Vec<u8>> {
        match self {
            Self::Binary(data) => Some(data),
            _ => None,
        }
    }

    fn should_skip(&self) -> bool {
        matches!(self, Self::Ping(_) | Self::Pong(_) | Self::Text(_))
    }
}
