//! Connection: the multiplexer endpoint that owns the physical
//! transport.
//!
//! # Key invariant
//!
//! Only [`Connection::run`] receives from the transport, and the stream
//! tables are mutated only here, synchronously, in direct response to
//! open/close/dispatch events. Within one stream, deliveries therefore
//! happen in arrival order; across streams no ordering is promised.
//!
//! One connection exists per authenticated session. The process-wide
//! accessor ([`init_global`]/[`global`]/[`take_global`]) is bound to
//! login/logout by the embedding application.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::stream::StreamEntry;
use crate::subframe::{StreamFrame, encode_open_payload};
use crate::{
    CloseReason, ConnectionConfig, FrameFlags, Opcode, OpenError, StreamError, StreamHandle,
    StreamStatus, Transport, TransportError, TransportFrame,
};

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Transport not yet ready.
    Connecting,
    /// Frames flowing.
    Open,
    /// Transport ended for a potentially transient reason. A new
    /// connection may be built; no stream state carries over.
    Closed,
    /// The session was terminated by the peer (close code 1008).
    /// Fatal: re-authentication required.
    Error,
}

struct ConnState {
    streams: HashMap<u32, StreamEntry>,
    /// Reusable ("persistent") stream kinds: kind -> live stream id.
    persistent: HashMap<String, u32>,
}

struct Shared {
    transport: Transport,
    config: ConnectionConfig,
    state: Mutex<ConnState>,
    status_tx: watch::Sender<ConnectionStatus>,
    /// Client-issued stream IDs are odd and increment by 2, leaving the
    /// even space free for peer-issued IDs.
    next_stream_id: AtomicU32,
}

/// The multiplexed connection endpoint. Cheap to clone.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub fn new(transport: Transport) -> Self {
        Self::with_config(transport, ConnectionConfig::default())
    }

    pub fn with_config(transport: Transport, config: ConnectionConfig) -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus::Connecting);
        Self {
            shared: Arc::new(Shared {
                transport,
                config,
                state: Mutex::new(ConnState {
                    streams: HashMap::new(),
                    persistent: HashMap::new(),
                }),
                status_tx,
                next_stream_id: AtomicU32::new(1),
            }),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.shared.status_tx.borrow()
    }

    /// Watch status transitions.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status_tx.subscribe()
    }

    /// Wait for the transport to become ready. Independent of any
    /// per-call timeout.
    pub async fn ready(&self, timeout: Duration) -> Result<(), TransportError> {
        let mut rx = self.shared.status_tx.subscribe();
        let wait = rx.wait_for(|s| !matches!(s, ConnectionStatus::Connecting));
        let result = match tokio::time::timeout(timeout, wait).await {
            Ok(Ok(status)) => match *status {
                ConnectionStatus::Open => Ok(()),
                ConnectionStatus::Error => Err(TransportError::SessionTerminated),
                _ => Err(TransportError::Closed),
            },
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "transport not ready",
            ))),
        };
        result
    }

    /// Stream IDs currently tracked (diagnostics).
    pub fn stream_ids(&self) -> Vec<u32> {
        let state = self.shared.state.lock();
        let mut ids: Vec<u32> = state.streams.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Open a stream of the given kind.
    ///
    /// Persistent kinds are reused: an existing stream of that kind in
    /// `Open` status is returned unchanged, with no second SYN; this
    /// is how a reattaching consumer finds its session again. All other
    /// kinds always allocate a fresh stream.
    ///
    /// The stream is optimistically `Open` as soon as the SYN is sent:
    /// the relay creates its side synchronously on receipt, so there is
    /// no acknowledgement round trip. A failed send tears the stream
    /// down before the handle ever escapes, so the caller observes a
    /// definite "never opened" outcome.
    pub fn open_stream(&self, kind: &str, initial: &[u8]) -> Result<StreamHandle, OpenError> {
        let status = self.status();
        if status != ConnectionStatus::Open {
            return Err(OpenError::ConnectionDown(status));
        }

        let persistent = self.shared.config.persistent_kinds.contains(kind);
        let mut state = self.shared.state.lock();

        if persistent {
            if let Some(&id) = state.persistent.get(kind) {
                if state
                    .streams
                    .get(&id)
                    .is_some_and(|e| e.status == StreamStatus::Open)
                {
                    tracing::debug!(stream_id = id, kind, "reusing persistent stream");
                    return Ok(self.handle(id, kind));
                }
            }
        }

        let id = self.shared.next_stream_id.fetch_add(2, Ordering::Relaxed);
        let mut entry = StreamEntry::new(
            id,
            kind,
            self.shared.config.scrollback_bytes,
            self.shared.config.detached_bytes,
        );

        let open = StreamFrame::new(Opcode::Open, id, encode_open_payload(kind, initial));
        let syn = TransportFrame::new(id, FrameFlags::SYN, open.encode());
        match self.shared.transport.try_send(syn.encode()) {
            Ok(()) => {
                entry.status = StreamStatus::Open;
                state.streams.insert(id, entry);
                if persistent {
                    state.persistent.insert(kind.to_owned(), id);
                }
                tracing::debug!(stream_id = id, kind, "stream opened");
                Ok(self.handle(id, kind))
            }
            Err(e) => {
                tracing::warn!(stream_id = id, kind, error = %e, "stream open failed");
                Err(OpenError::Transport(e))
            }
        }
    }

    fn handle(&self, id: u32, kind: &str) -> StreamHandle {
        StreamHandle {
            conn: self.clone(),
            id,
            kind: kind.to_owned(),
        }
    }

    /// Shut down locally: close the transport and force-close every
    /// stream.
    pub fn close(&self) {
        self.shared.transport.close();
        self.teardown_all(CloseReason::ConnectionClosed);
        self.set_status(ConnectionStatus::Closed);
    }

    /// The demux loop. Drives the connection until the transport ends;
    /// the return value mirrors the final status.
    pub async fn run(&self) -> Result<(), TransportError> {
        self.set_status(ConnectionStatus::Open);
        tracing::debug!("connection open, demux loop running");
        loop {
            match self.shared.transport.recv().await {
                Ok(message) => self.dispatch_message(&message),
                Err(TransportError::SessionTerminated) => {
                    tracing::warn!("session terminated by peer");
                    self.teardown_all(CloseReason::ConnectionClosed);
                    self.set_status(ConnectionStatus::Error);
                    return Err(TransportError::SessionTerminated);
                }
                Err(e) => {
                    tracing::debug!(error = %e, "transport ended");
                    self.teardown_all(CloseReason::ConnectionClosed);
                    self.set_status(ConnectionStatus::Closed);
                    return match e {
                        TransportError::Closed => Ok(()),
                        other => Err(other),
                    };
                }
            }
        }
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.shared.status_tx.send_if_modified(|current| {
            // Closed and Error are terminal.
            if matches!(*current, ConnectionStatus::Closed | ConnectionStatus::Error)
                || *current == status
            {
                false
            } else {
                *current = status;
                true
            }
        });
    }

    fn dispatch_message(&self, message: &[u8]) {
        let frame = match TransportFrame::decode(message) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, len = message.len(), "dropping malformed frame");
                return;
            }
        };

        let mut state = self.shared.state.lock();
        let id = frame.stream_id;

        if frame.flags.contains(FrameFlags::RST) {
            if !Self::teardown_locked(&mut state, id, CloseReason::Rst) {
                tracing::debug!(stream_id = id, "RST for unknown stream, dropped");
            }
            return;
        }
        if frame.flags.contains(FrameFlags::FIN) {
            if !Self::teardown_locked(&mut state, id, CloseReason::Fin) {
                tracing::debug!(stream_id = id, "FIN for unknown stream, dropped");
            }
            return;
        }
        if frame.flags.contains(FrameFlags::SYN) {
            // Peer-issued streams are a future extension; the even ID
            // space is reserved for them.
            tracing::debug!(stream_id = id, "peer-initiated SYN not supported, dropped");
            return;
        }
        if frame.flags.contains(FrameFlags::DATA) {
            let Some(entry) = state.streams.get_mut(&id) else {
                // Expected transiently right after a local close.
                tracing::debug!(stream_id = id, "data for unknown stream, dropped");
                return;
            };
            entry.reassembler.push(&frame.payload);
            loop {
                match entry.reassembler.next_frame() {
                    Ok(Some(sub)) => dispatch_subframe(entry, sub),
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(stream_id = id, error = %e, "dropping bad sub-frame");
                    }
                }
            }
        }
    }

    /// Remove and finish one stream. Returns false when untracked.
    fn teardown_locked(state: &mut ConnState, id: u32, reason: CloseReason) -> bool {
        let Some(mut entry) = state.streams.remove(&id) else {
            return false;
        };
        tracing::debug!(stream_id = id, kind = %entry.kind, ?reason, "stream closed");
        if state.persistent.get(&entry.kind) == Some(&id) {
            state.persistent.remove(&entry.kind);
        }
        entry.finish(reason);
        true
    }

    fn teardown_all(&self, reason: CloseReason) {
        let mut state = self.shared.state.lock();
        let count = state.streams.len();
        if count > 0 {
            tracing::debug!(count, ?reason, "force-closing all streams");
        }
        for (_, mut entry) in state.streams.drain() {
            entry.finish(reason);
        }
        state.persistent.clear();
    }

    // ------------------------------------------------------------------
    // Per-stream operations, called through StreamHandle.
    // ------------------------------------------------------------------

    pub(crate) fn stream_status(&self, id: u32) -> StreamStatus {
        let state = self.shared.state.lock();
        state
            .streams
            .get(&id)
            .map(|e| e.status)
            .unwrap_or(StreamStatus::Closed)
    }

    fn send_subframe(&self, id: u32, opcode: Opcode, payload: Bytes) -> Result<(), StreamError> {
        let sub = StreamFrame::new(opcode, id, payload);
        let frame = TransportFrame::new(id, FrameFlags::DATA, sub.encode());
        self.shared
            .transport
            .try_send(frame.encode())
            .map_err(StreamError::Transport)
    }

    pub(crate) fn stream_send(&self, id: u32, bytes: Bytes) -> Result<(), StreamError> {
        {
            let state = self.shared.state.lock();
            let entry = state.streams.get(&id).ok_or(StreamError::Gone)?;
            if !entry.writable() {
                return Err(StreamError::NotWritable {
                    status: entry.status,
                });
            }
        }
        self.send_subframe(id, Opcode::Data, bytes)
    }

    pub(crate) fn stream_resize(&self, id: u32, cols: u32, rows: u32) -> Result<(), StreamError> {
        {
            let state = self.shared.state.lock();
            let entry = state.streams.get(&id).ok_or(StreamError::Gone)?;
            if !entry.writable() {
                return Err(StreamError::NotWritable {
                    status: entry.status,
                });
            }
        }
        let mut payload = Vec::with_capacity(8);
        payload.extend_from_slice(&cols.to_be_bytes());
        payload.extend_from_slice(&rows.to_be_bytes());
        self.send_subframe(id, Opcode::Resize, payload.into())
    }

    pub(crate) fn stream_close(&self, id: u32) -> Result<(), StreamError> {
        {
            let mut state = self.shared.state.lock();
            let entry = state.streams.get_mut(&id).ok_or(StreamError::Gone)?;
            if !entry.writable() {
                // Already closing or closed; nothing more to do.
                return Ok(());
            }
            entry.status = StreamStatus::Closing;
        }
        tracing::debug!(stream_id = id, "closing stream");
        let close = StreamFrame::new(Opcode::Close, id, Bytes::new());
        let frame = TransportFrame::new(id, FrameFlags::FIN, close.encode());
        self.shared
            .transport
            .try_send(frame.encode())
            .map_err(StreamError::Transport)
    }

    /// Abort always wins: the Abort sub-frame tells the relay to cancel
    /// the underlying work, the RST forces transport-level teardown,
    /// and the terminal state is reached via the RST path even when a
    /// graceful close was already pending.
    pub(crate) fn stream_abort(&self, id: u32) {
        {
            let state = self.shared.state.lock();
            if !state.streams.contains_key(&id) {
                return;
            }
        }
        tracing::debug!(stream_id = id, "aborting stream");
        // Best effort: if the transport is gone, teardown still happens.
        let _ = self.send_subframe(id, Opcode::Abort, Bytes::new());
        let rst = TransportFrame::new(id, FrameFlags::RST, Bytes::new());
        let _ = self.shared.transport.try_send(rst.encode());

        let mut state = self.shared.state.lock();
        Self::teardown_locked(&mut state, id, CloseReason::Rst);
    }

    pub(crate) fn stream_attach(
        &self,
        id: u32,
    ) -> Result<tokio::sync::mpsc::UnboundedReceiver<Bytes>, StreamError> {
        let mut state = self.shared.state.lock();
        let entry = state.streams.get_mut(&id).ok_or(StreamError::Gone)?;
        entry.attach()
    }

    pub(crate) fn stream_progress(
        &self,
        id: u32,
    ) -> Result<tokio::sync::mpsc::UnboundedReceiver<serde_json::Value>, StreamError> {
        let mut state = self.shared.state.lock();
        let entry = state.streams.get_mut(&id).ok_or(StreamError::Gone)?;
        entry.register_progress()
    }

    pub(crate) fn stream_result(
        &self,
        id: u32,
    ) -> Result<tokio::sync::oneshot::Receiver<serde_json::Value>, StreamError> {
        let mut state = self.shared.state.lock();
        let entry = state.streams.get_mut(&id).ok_or(StreamError::Gone)?;
        entry.register_result()
    }

    pub(crate) fn stream_closed(&self, id: u32) -> tokio::sync::oneshot::Receiver<CloseReason> {
        let mut state = self.shared.state.lock();
        match state.streams.get_mut(&id) {
            Some(entry) => entry.register_close(),
            None => {
                let (tx, rx) = tokio::sync::oneshot::channel();
                let _ = tx.send(CloseReason::ConnectionClosed);
                rx
            }
        }
    }
}

/// Dispatch one reassembled sub-frame into its stream.
fn dispatch_subframe(entry: &mut StreamEntry, sub: StreamFrame) {
    match sub.opcode {
        Opcode::Data => entry.deliver_data(sub.payload),
        Opcode::Progress => match serde_json::from_slice(&sub.payload) {
            Ok(value) => entry.deliver_progress(value),
            Err(e) => {
                tracing::warn!(stream_id = entry.id, error = %e, "bad progress payload");
            }
        },
        Opcode::Result => match serde_json::from_slice(&sub.payload) {
            Ok(value) => entry.deliver_result(value),
            Err(e) => {
                tracing::warn!(stream_id = entry.id, error = %e, "bad result payload");
            }
        },
        Opcode::Close => {
            // Advisory; the FIN transport flag drives the state change.
            tracing::debug!(stream_id = entry.id, "peer close notice");
        }
        Opcode::Open | Opcode::Resize | Opcode::Abort => {
            tracing::debug!(
                stream_id = entry.id,
                opcode = ?sub.opcode,
                "unexpected sub-frame at this endpoint, dropped"
            );
        }
    }
}

// ----------------------------------------------------------------------
// Process-wide connection accessor.
// ----------------------------------------------------------------------

static CURRENT: Mutex<Option<Connection>> = Mutex::new(None);

/// Install the session's connection at login. Returns the previous one,
/// if any, so the caller can close it.
pub fn init_global(conn: &Connection) -> Option<Connection> {
    CURRENT.lock().replace(conn.clone())
}

/// The current session's connection.
pub fn global() -> Option<Connection> {
    CURRENT.lock().clone()
}

/// Remove the connection at logout. The caller closes it.
pub fn take_global() -> Option<Connection> {
    CURRENT.lock().take()
}
