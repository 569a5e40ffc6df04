//! Per-stream state machine and the public stream handle.
//!
//! A stream is one logical operation multiplexed onto the connection.
//! The connection owns the state ([`StreamEntry`]) and mutates it
//! synchronously from the demux loop; [`StreamHandle`] is the cheap
//! clonable API callers hold.
//!
//! Subscription model: no bare callbacks. `attach()` hands out an mpsc
//! receiver and at most one may be live at a time; a dropped receiver
//! counts as detached. Close notifications are oneshot receivers, any
//! number of them.

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::scrollback::{DetachedQueue, Scrollback};
use crate::subframe::Reassembler;
use crate::{Connection, StreamError};

/// Stream lifecycle. Monotonic, except that `abort` forces the RST path
/// over a pending graceful close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    Opening,
    Open,
    Closing,
    Closed,
}

/// Why a stream reached `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Graceful close: the peer sent FIN (or agreed to ours).
    Fin,
    /// Hard close: an RST was sent or received.
    Rst,
    /// The whole connection went down.
    ConnectionClosed,
}

/// Connection-side state for one stream.
pub(crate) struct StreamEntry {
    pub(crate) id: u32,
    pub(crate) kind: String,
    pub(crate) status: StreamStatus,
    pub(crate) scrollback: Scrollback,
    pub(crate) detached: DetachedQueue,
    pub(crate) reassembler: Reassembler,
    data_tx: Option<mpsc::UnboundedSender<Bytes>>,
    progress_tx: Option<mpsc::UnboundedSender<Value>>,
    result_tx: Option<oneshot::Sender<Value>>,
    close_txs: Vec<oneshot::Sender<CloseReason>>,
}

impl StreamEntry {
    pub(crate) fn new(id: u32, kind: &str, scrollback_bytes: usize, detached_bytes: usize) -> Self {
        Self {
            id,
            kind: kind.to_owned(),
            status: StreamStatus::Opening,
            scrollback: Scrollback::new(scrollback_bytes),
            detached: DetachedQueue::new(detached_bytes),
            reassembler: Reassembler::new(),
            data_tx: None,
            progress_tx: None,
            result_tx: None,
            close_txs: Vec::new(),
        }
    }

    pub(crate) fn writable(&self) -> bool {
        matches!(self.status, StreamStatus::Opening | StreamStatus::Open)
    }

    /// Route one inbound data chunk: always into the scrollback, then
    /// either live to the subscriber or into the detached queue.
    pub(crate) fn deliver_data(&mut self, payload: Bytes) {
        self.scrollback.push(&payload);
        let delivered = match &self.data_tx {
            Some(tx) => tx.send(payload.clone()).is_ok(),
            None => false,
        };
        if !delivered {
            self.data_tx = None;
            self.detached.push(payload);
        }
    }

    /// Progress is control-plane: delivered only to a live, registered
    /// receiver, never buffered, never replayed.
    pub(crate) fn deliver_progress(&mut self, value: Value) {
        if let Some(tx) = &self.progress_tx {
            if tx.send(value).is_err() {
                self.progress_tx = None;
            }
        } else {
            tracing::debug!(stream_id = self.id, "progress with no receiver, dropped");
        }
    }

    /// Result is delivered at most once, to the receiver registered at
    /// arrival time.
    pub(crate) fn deliver_result(&mut self, value: Value) {
        match self.result_tx.take() {
            Some(tx) => {
                let _ = tx.send(value);
            }
            None => {
                tracing::debug!(stream_id = self.id, "result with no receiver, dropped");
            }
        }
    }

    /// Install a data subscriber: replay scrollback minus the trailing
    /// span still queued in the detached buffer, flush the queue in
    /// order, then deliver live. The trim is what keeps the handoff
    /// exactly-once: during the detached window the queue contents are
    /// a suffix of the scrollback.
    pub(crate) fn attach(&mut self) -> Result<mpsc::UnboundedReceiver<Bytes>, StreamError> {
        if let Some(tx) = &self.data_tx {
            if !tx.is_closed() {
                return Err(StreamError::AlreadyAttached);
            }
        }
        let (tx, rx) = mpsc::unbounded_channel();

        let history = self.scrollback.contents();
        let overlap = self.detached.byte_len().min(history.len());
        let replay = &history[..history.len() - overlap];
        if !replay.is_empty() {
            let _ = tx.send(Bytes::copy_from_slice(replay));
        }
        for chunk in self.detached.drain() {
            let _ = tx.send(chunk);
        }

        self.data_tx = Some(tx);
        Ok(rx)
    }

    pub(crate) fn register_progress(
        &mut self,
    ) -> Result<mpsc::UnboundedReceiver<Value>, StreamError> {
        if let Some(tx) = &self.progress_tx {
            if !tx.is_closed() {
                return Err(StreamError::ProgressTaken);
            }
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.progress_tx = Some(tx);
        Ok(rx)
    }

    pub(crate) fn register_result(&mut self) -> Result<oneshot::Receiver<Value>, StreamError> {
        if let Some(tx) = &self.result_tx {
            if !tx.is_closed() {
                return Err(StreamError::ResultTaken);
            }
        }
        let (tx, rx) = oneshot::channel();
        self.result_tx = Some(tx);
        Ok(rx)
    }

    pub(crate) fn register_close(&mut self) -> oneshot::Receiver<CloseReason> {
        let (tx, rx) = oneshot::channel();
        self.close_txs.push(tx);
        rx
    }

    /// Drive to the terminal state and wake everything that watches
    /// this stream. Idempotent.
    pub(crate) fn finish(&mut self, reason: CloseReason) {
        self.status = StreamStatus::Closed;
        self.data_tx = None;
        self.progress_tx = None;
        self.result_tx = None;
        for tx in self.close_txs.drain(..) {
            let _ = tx.send(reason);
        }
    }
}

/// Caller-facing handle to one stream. Cheap to clone; all state lives
/// in the connection's tables.
#[derive(Clone)]
pub struct StreamHandle {
    pub(crate) conn: Connection,
    pub(crate) id: u32,
    pub(crate) kind: String,
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

impl StreamHandle {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Current lifecycle status. A stream the connection no longer
    /// tracks reports `Closed`.
    pub fn status(&self) -> StreamStatus {
        self.conn.stream_status(self.id)
    }

    /// Write application bytes. Rejected locally once the stream is
    /// closing or closed.
    pub fn send(&self, bytes: impl Into<Bytes>) -> Result<(), StreamError> {
        self.conn.stream_send(self.id, bytes.into())
    }

    /// Announce new terminal geometry (PTY-like streams).
    pub fn resize(&self, cols: u32, rows: u32) -> Result<(), StreamError> {
        self.conn.stream_resize(self.id, cols, rows)
    }

    /// Graceful close: FIN. The peer may still finish and emit a final
    /// Result before agreeing.
    pub fn close(&self) -> Result<(), StreamError> {
        self.conn.stream_close(self.id)
    }

    /// Hard close: Abort sub-frame then RST. Always wins, including
    /// over a close() already in flight.
    pub fn abort(&self) {
        self.conn.stream_abort(self.id)
    }

    /// Subscribe to data. Replays retained history first (exactly-once
    /// across the detached window), then delivers live. At most one
    /// live subscriber; a dropped receiver detaches.
    pub fn attach(&self) -> Result<mpsc::UnboundedReceiver<Bytes>, StreamError> {
        self.conn.stream_attach(self.id)
    }

    /// Subscribe to JSON progress reports. Not buffered, not replayed.
    pub fn progress(&self) -> Result<mpsc::UnboundedReceiver<Value>, StreamError> {
        self.conn.stream_progress(self.id)
    }

    /// Subscribe to the single JSON result.
    pub fn result(&self) -> Result<oneshot::Receiver<Value>, StreamError> {
        self.conn.stream_result(self.id)
    }

    /// A receiver resolved exactly once when the stream closes. Streams
    /// already closed resolve immediately.
    pub fn closed(&self) -> oneshot::Receiver<CloseReason> {
        self.conn.stream_closed(self.id)
    }
}
