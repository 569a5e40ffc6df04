//! What a stream handler gets to work with: inbound events, an
//! outbound sender, and a cancellation token fired on Abort.

use bridgemux_core::{FrameFlags, Opcode, StreamFrame, Transport, TransportError, TransportFrame};
use bytes::Bytes;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Inbound events for one relay-side stream.
#[derive(Debug)]
pub enum StreamEvent {
    /// Application bytes from the client.
    Data(Bytes),
    /// New terminal geometry.
    Resize { cols: u32, rows: u32 },
    /// The client half-closed; no more input will arrive.
    InputClosed,
}

/// Outbound side of one relay stream. Cheap to clone.
#[derive(Clone, Debug)]
pub struct StreamSender {
    transport: Transport,
    id: u32,
}

impl StreamSender {
    pub(crate) fn new(transport: Transport, id: u32) -> Self {
        Self { transport, id }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    fn subframe(&self, opcode: Opcode, payload: Bytes) -> Result<(), TransportError> {
        let sub = StreamFrame::new(opcode, self.id, payload);
        let frame = TransportFrame::new(self.id, FrameFlags::DATA, sub.encode());
        self.transport.try_send(frame.encode())
    }

    /// Send application bytes to the client.
    pub fn send(&self, bytes: impl Into<Bytes>) -> Result<(), TransportError> {
        self.subframe(Opcode::Data, bytes.into())
    }

    /// Send a JSON progress report.
    pub fn progress(&self, value: &impl Serialize) -> Result<(), TransportError> {
        let payload = serde_json::to_vec(value)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        self.subframe(Opcode::Progress, payload.into())
    }

    /// Send the successful terminal outcome.
    pub fn result_ok(&self, data: &impl Serialize) -> Result<(), TransportError> {
        let payload = serde_json::to_vec(&serde_json::json!({
            "status": "ok",
            "data": data,
        }))
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        self.subframe(Opcode::Result, payload.into())
    }

    /// Send the failed terminal outcome.
    pub fn result_err(&self, message: &str, code: Option<&str>) -> Result<(), TransportError> {
        let mut body = serde_json::json!({
            "status": "error",
            "error": message,
        });
        if let Some(code) = code {
            body["code"] = serde_json::Value::String(code.to_owned());
        }
        let payload = serde_json::to_vec(&body)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        self.subframe(Opcode::Result, payload.into())
    }

    /// Graceful close from this side.
    pub(crate) fn fin(&self) -> Result<(), TransportError> {
        let close = StreamFrame::new(Opcode::Close, self.id, Bytes::new());
        let frame = TransportFrame::new(self.id, FrameFlags::FIN, close.encode());
        self.transport.try_send(frame.encode())
    }

    /// Hard close from this side.
    pub(crate) fn rst(&self) -> Result<(), TransportError> {
        let frame = TransportFrame::new(self.id, FrameFlags::RST, Bytes::new());
        self.transport.try_send(frame.encode())
    }
}

/// Everything a handler needs for one stream's lifetime.
pub struct StreamContext {
    id: u32,
    kind: String,
    initial: Bytes,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    sender: StreamSender,
    cancel: CancellationToken,
}

impl StreamContext {
    pub(crate) fn new(
        id: u32,
        kind: String,
        initial: Bytes,
        events: mpsc::UnboundedReceiver<StreamEvent>,
        sender: StreamSender,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            kind,
            initial,
            events,
            sender,
            cancel,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// The open payload the client sent with its SYN.
    pub fn initial(&self) -> &Bytes {
        &self.initial
    }

    pub fn sender(&self) -> &StreamSender {
        &self.sender
    }

    /// Fired when the client aborts the operation. Workers should stop
    /// promptly; any Result sent after an abort is not honored.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Next inbound event. `None` once the stream is torn down.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }
}

impl std::fmt::Debug for StreamContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamContext")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}
