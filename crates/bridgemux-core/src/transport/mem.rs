//! In-process transport over unbounded channels. Message boundaries
//! are preserved, same as the real socket, and closing either half
//! ends the pair, same as the real socket.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use crate::TransportError;

#[derive(Clone, Debug)]
pub struct MemTransport {
    inner: Arc<MemInner>,
}

#[derive(Debug)]
struct MemInner {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    /// Shared by both halves: true once either side closes.
    closed: watch::Sender<bool>,
}

impl MemTransport {
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);

        let a = Self {
            inner: Arc::new(MemInner {
                tx: tx_b,
                rx: tokio::sync::Mutex::new(rx_a),
                closed: closed.clone(),
            }),
        };
        let b = Self {
            inner: Arc::new(MemInner {
                tx: tx_a,
                rx: tokio::sync::Mutex::new(rx_b),
                closed,
            }),
        };
        (a, b)
    }

    pub fn try_send(&self, message: Vec<u8>) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::NotWritable);
        }
        self.inner
            .tx
            .send(message)
            .map_err(|_| TransportError::NotWritable)
    }

    pub async fn recv(&self) -> Result<Vec<u8>, TransportError> {
        let mut closed_rx = self.inner.closed.subscribe();
        if *closed_rx.borrow() {
            return Err(TransportError::Closed);
        }
        let mut rx = self.inner.rx.lock().await;
        tokio::select! {
            message = rx.recv() => message.ok_or(TransportError::Closed),
            _ = closed_rx.wait_for(|closed| *closed) => Err(TransportError::Closed),
        }
    }

    pub fn close(&self) {
        self.inner.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }
}
