//! The relay endpoint: the backend's side of the multiplexed
//! connection.
//!
//! The relay accepts each SYN synchronously (the local stream entry
//! exists, keyed by the client's stream ID, before the demux loop moves
//! on), then runs the kind's worker on its own task. The wire protocol
//! is the only synchronization boundary with the client endpoint:
//! frames for one stream arrive in send order, nothing is promised
//! across streams.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use bridgemux_core::{
    FrameFlags, Opcode, Reassembler, Transport, TransportError, TransportFrame,
    decode_open_payload,
};
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::context::{StreamContext, StreamEvent, StreamSender};
use crate::registry::StreamRegistry;

struct RelayEntry {
    events: mpsc::UnboundedSender<StreamEvent>,
    cancel: CancellationToken,
    reassembler: Reassembler,
}

struct Shared {
    transport: Transport,
    registry: StreamRegistry,
    streams: Mutex<HashMap<u32, RelayEntry>>,
}

/// The relay endpoint. Cheap to clone; `run` drives it.
#[derive(Clone)]
pub struct Relay {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay").finish_non_exhaustive()
    }
}

impl Relay {
    pub fn new(transport: Transport, registry: StreamRegistry) -> Self {
        Self {
            shared: Arc::new(Shared {
                transport,
                registry,
                streams: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Stream IDs currently served (diagnostics).
    pub fn stream_ids(&self) -> Vec<u32> {
        let streams = self.shared.streams.lock();
        let mut ids: Vec<u32> = streams.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn close(&self) {
        self.shared.transport.close();
        self.teardown_all();
    }

    /// The demux loop. Runs until the transport ends.
    pub async fn run(&self) -> Result<(), TransportError> {
        tracing::debug!("relay demux loop running");
        loop {
            match self.shared.transport.recv().await {
                Ok(message) => self.dispatch_message(&message),
                Err(e) => {
                    tracing::debug!(error = %e, "relay transport ended");
                    self.teardown_all();
                    return match e {
                        TransportError::Closed => Ok(()),
                        other => Err(other),
                    };
                }
            }
        }
    }

    fn dispatch_message(&self, message: &[u8]) {
        let frame = match TransportFrame::decode(message) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, len = message.len(), "dropping malformed frame");
                return;
            }
        };
        let id = frame.stream_id;

        if frame.flags.contains(FrameFlags::RST) {
            self.teardown(id);
            return;
        }
        if frame.flags.contains(FrameFlags::FIN) {
            let streams = self.shared.streams.lock();
            match streams.get(&id) {
                Some(entry) => {
                    let _ = entry.events.send(StreamEvent::InputClosed);
                }
                None => tracing::debug!(stream_id = id, "FIN for unknown stream, dropped"),
            }
            return;
        }
        if frame.flags.contains(FrameFlags::SYN) {
            self.accept(id, &frame.payload);
            return;
        }
        if frame.flags.contains(FrameFlags::DATA) {
            self.deliver(id, &frame.payload);
        }
    }

    /// Accept a SYN: the local operation exists, keyed by the client's
    /// ID, before this returns.
    fn accept(&self, id: u32, payload: &[u8]) {
        let mut opener = Reassembler::new();
        opener.push(payload);
        let open = match opener.next_frame() {
            Ok(Some(sub)) if sub.opcode == Opcode::Open => sub,
            other => {
                tracing::warn!(stream_id = id, ?other, "SYN without a valid open sub-frame");
                let _ = StreamSender::new(self.shared.transport.clone(), id).rst();
                return;
            }
        };
        let Some((kind, initial)) = decode_open_payload(&open.payload) else {
            tracing::warn!(stream_id = id, "open payload missing kind, resetting");
            let _ = StreamSender::new(self.shared.transport.clone(), id).rst();
            return;
        };

        let sender = StreamSender::new(self.shared.transport.clone(), id);
        let Some(handler) = self.shared.registry.get(&kind) else {
            tracing::warn!(stream_id = id, %kind, "no handler for stream kind, resetting");
            let _ = sender.rst();
            return;
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        {
            let mut streams = self.shared.streams.lock();
            if streams.contains_key(&id) {
                tracing::warn!(stream_id = id, "duplicate SYN for live stream, resetting");
                let _ = sender.rst();
                return;
            }
            streams.insert(
                id,
                RelayEntry {
                    events: events_tx,
                    cancel: cancel.clone(),
                    reassembler: Reassembler::new(),
                },
            );
        }
        tracing::debug!(stream_id = id, %kind, "stream accepted");

        let ctx = StreamContext::new(id, kind.clone(), initial, events_rx, sender, cancel);
        let worker = handler(ctx);

        let relay = self.clone();
        tokio::spawn(async move {
            // Contain panics: a dead worker must still FIN, or the
            // client hangs until its own timeout.
            if AssertUnwindSafe(worker).catch_unwind().await.is_err() {
                tracing::error!(stream_id = id, "stream worker panicked");
            }
            relay.finish(id);
        });
    }

    fn deliver(&self, id: u32, payload: &[u8]) {
        let mut streams = self.shared.streams.lock();
        let Some(entry) = streams.get_mut(&id) else {
            tracing::debug!(stream_id = id, "data for unknown stream, dropped");
            return;
        };
        entry.reassembler.push(payload);
        loop {
            match entry.reassembler.next_frame() {
                Ok(Some(sub)) => match sub.opcode {
                    Opcode::Data => {
                        let _ = entry.events.send(StreamEvent::Data(sub.payload));
                    }
                    Opcode::Resize => {
                        if sub.payload.len() == 8 {
                            let cols = u32::from_be_bytes([
                                sub.payload[0],
                                sub.payload[1],
                                sub.payload[2],
                                sub.payload[3],
                            ]);
                            let rows = u32::from_be_bytes([
                                sub.payload[4],
                                sub.payload[5],
                                sub.payload[6],
                                sub.payload[7],
                            ]);
                            let _ = entry.events.send(StreamEvent::Resize { cols, rows });
                        } else {
                            tracing::warn!(
                                stream_id = id,
                                len = sub.payload.len(),
                                "bad resize payload"
                            );
                        }
                    }
                    Opcode::Abort => {
                        tracing::debug!(stream_id = id, "abort received, cancelling worker");
                        entry.cancel.cancel();
                    }
                    Opcode::Close => {
                        tracing::debug!(stream_id = id, "peer close notice");
                    }
                    Opcode::Open | Opcode::Progress | Opcode::Result => {
                        tracing::debug!(
                            stream_id = id,
                            opcode = ?sub.opcode,
                            "unexpected sub-frame at relay, dropped"
                        );
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(stream_id = id, error = %e, "dropping bad sub-frame");
                }
            }
        }
    }

    /// Worker completed: graceful FIN, unless the stream was already
    /// torn down by an RST or transport loss.
    fn finish(&self, id: u32) {
        let removed = self.shared.streams.lock().remove(&id);
        if removed.is_some() {
            tracing::debug!(stream_id = id, "worker finished, sending FIN");
            let _ = StreamSender::new(self.shared.transport.clone(), id).fin();
        }
    }

    /// Hard teardown from an inbound RST.
    fn teardown(&self, id: u32) {
        match self.shared.streams.lock().remove(&id) {
            Some(entry) => {
                tracing::debug!(stream_id = id, "stream reset by client");
                entry.cancel.cancel();
            }
            None => tracing::debug!(stream_id = id, "RST for unknown stream, dropped"),
        }
    }

    fn teardown_all(&self) {
        let mut streams = self.shared.streams.lock();
        let count = streams.len();
        if count > 0 {
            tracing::debug!(count, "cancelling all stream workers");
        }
        for (_, entry) in streams.drain() {
            entry.cancel.cancel();
        }
    }
}
