//! Transport enum and backends.
//!
//! The public API is the [`Transport`] enum. Each backend lives in its
//! own module under `transport/`. The underlying connection is
//! message-oriented: whole binary messages in, whole binary messages
//! out, one transport frame per message.
//!
//! `try_send` is deliberately synchronous: a transport that is not
//! currently writable is a definite, immediate failure surfaced to the
//! caller, never a retryable condition at this layer.

use crate::TransportError;

pub mod mem;
#[cfg(any(feature = "websocket", feature = "websocket-axum"))]
pub mod websocket;

/// One physical connection carrying transport frames.
#[derive(Clone, Debug)]
pub enum Transport {
    Mem(mem::MemTransport),
    #[cfg(any(feature = "websocket", feature = "websocket-axum"))]
    WebSocket(websocket::WebSocketTransport),
}

impl Transport {
    /// Send one wire message. Fails synchronously when the transport is
    /// not writable; nothing is buffered on failure.
    pub fn try_send(&self, message: Vec<u8>) -> Result<(), TransportError> {
        match self {
            Transport::Mem(t) => t.try_send(message),
            #[cfg(any(feature = "websocket", feature = "websocket-axum"))]
            Transport::WebSocket(t) => t.try_send(message),
        }
    }

    /// Receive the next wire message. The terminal error distinguishes
    /// a normal close from a session-termination close.
    pub async fn recv(&self) -> Result<Vec<u8>, TransportError> {
        match self {
            Transport::Mem(t) => t.recv().await,
            #[cfg(any(feature = "websocket", feature = "websocket-axum"))]
            Transport::WebSocket(t) => t.recv().await,
        }
    }

    /// Initiate shutdown. Idempotent.
    pub fn close(&self) {
        match self {
            Transport::Mem(t) => t.close(),
            #[cfg(any(feature = "websocket", feature = "websocket-axum"))]
            Transport::WebSocket(t) => t.close(),
        }
    }

    pub fn is_closed(&self) -> bool {
        match self {
            Transport::Mem(t) => t.is_closed(),
            #[cfg(any(feature = "websocket", feature = "websocket-axum"))]
            Transport::WebSocket(t) => t.is_closed(),
        }
    }

    /// Connected in-process pair, for tests and local harnesses.
    pub fn mem_pair() -> (Self, Self) {
        let (a, b) = mem::MemTransport::pair();
        (Transport::Mem(a), Transport::Mem(b))
    }

    #[cfg(feature = "websocket")]
    pub fn websocket<S>(ws: tokio_tungstenite::WebSocketStream<S>) -> Self
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        Transport::WebSocket(websocket::WebSocketTransport::new(ws))
    }

    #[cfg(feature = "websocket-axum")]
    pub fn websocket_axum(ws: axum::extract::ws::WebSocket) -> Self {
        Transport::WebSocket(websocket::WebSocketTransport::from_axum(ws))
    }
}
