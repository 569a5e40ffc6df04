//! Per-stream output retention: the scrollback ring buffer and the
//! detached-data queue.
//!
//! Every inbound data chunk lands in the scrollback so a subscriber that
//! attaches later can recover recent history. Chunks that arrive while
//! no subscriber is attached additionally sit in the detached queue so
//! they are delivered exactly once on reattach. During the detached
//! window the queue contents are always a suffix of the scrollback
//! contents; the reattach replay trims that suffix off the scrollback
//! before flushing the queue.

use std::collections::VecDeque;

use bytes::Bytes;

/// Fixed-capacity byte ring with overwrite-oldest semantics.
#[derive(Debug)]
pub struct Scrollback {
    buf: VecDeque<u8>,
    capacity: usize,
}

impl Scrollback {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(capacity.min(4096)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Append bytes, dropping exactly the oldest bytes needed to fit.
    pub fn push(&mut self, bytes: &[u8]) {
        if bytes.len() >= self.capacity {
            self.buf.clear();
            self.buf
                .extend(&bytes[bytes.len() - self.capacity..]);
            return;
        }
        let overflow = (self.buf.len() + bytes.len()).saturating_sub(self.capacity);
        if overflow > 0 {
            self.buf.drain(..overflow);
        }
        self.buf.extend(bytes);
    }

    /// Copy out the current contents, oldest first.
    pub fn contents(&self) -> Vec<u8> {
        let (a, b) = self.buf.as_slices();
        let mut out = Vec::with_capacity(a.len() + b.len());
        out.extend_from_slice(a);
        out.extend_from_slice(b);
        out
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

/// Bounded FIFO of data chunks held while no subscriber is attached.
///
/// Overflow trims byte-accurately from the front so the queue stays in
/// lockstep with the scrollback's drop-oldest behavior.
#[derive(Debug)]
pub struct DetachedQueue {
    chunks: VecDeque<Bytes>,
    bytes: usize,
    budget: usize,
}

impl DetachedQueue {
    pub fn new(budget: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            bytes: 0,
            budget,
        }
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    pub fn byte_len(&self) -> usize {
        self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn push(&mut self, chunk: Bytes) {
        if chunk.len() >= self.budget {
            self.chunks.clear();
            self.bytes = chunk.len().min(self.budget);
            self.chunks
                .push_back(chunk.slice(chunk.len() - self.bytes..));
            return;
        }
        self.bytes += chunk.len();
        self.chunks.push_back(chunk);
        while self.bytes > self.budget {
            let overflow = self.bytes - self.budget;
            let front = self.chunks.front_mut().expect("bytes > 0 implies a chunk");
            if front.len() <= overflow {
                self.bytes -= front.len();
                self.chunks.pop_front();
            } else {
                *front = front.slice(overflow..);
                self.bytes -= overflow;
            }
        }
    }

    /// Take every queued chunk, in arrival order.
    pub fn drain(&mut self) -> Vec<Bytes> {
        self.bytes = 0;
        self.chunks.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scrollback_never_exceeds_capacity() {
        let mut sb = Scrollback::new(8);
        for chunk in [&b"abc"[..], b"defg", b"hij", b"klmnop"] {
            sb.push(chunk);
            assert!(sb.len() <= 8);
        }
        // 16 bytes total pushed; only the newest 8 remain.
        assert_eq!(sb.contents(), b"ijklmnop");
    }

    #[test]
    fn scrollback_drops_exactly_oldest() {
        let mut sb = Scrollback::new(5);
        sb.push(b"abcde");
        sb.push(b"fg");
        assert_eq!(sb.contents(), b"cdefg");
    }

    #[test]
    fn scrollback_oversized_push_keeps_tail() {
        let mut sb = Scrollback::new(4);
        sb.push(b"0123456789");
        assert_eq!(sb.contents(), b"6789");
    }

    #[test]
    fn detached_queue_trims_front_bytes() {
        let mut q = DetachedQueue::new(6);
        q.push(Bytes::from_static(b"abcd"));
        q.push(Bytes::from_static(b"efgh"));
        assert_eq!(q.byte_len(), 6);
        let drained: Vec<u8> = q.drain().iter().flat_map(|b| b.to_vec()).collect();
        assert_eq!(drained, b"cdefgh");
        assert_eq!(q.byte_len(), 0);
    }

    #[test]
    fn detached_queue_single_oversized_chunk() {
        let mut q = DetachedQueue::new(3);
        q.push(Bytes::from_static(b"abcdef"));
        assert_eq!(q.byte_len(), 3);
        let drained: Vec<u8> = q.drain().iter().flat_map(|b| b.to_vec()).collect();
        assert_eq!(drained, b"def");
    }

    #[test]
    fn queue_matches_scrollback_suffix_under_pressure() {
        let mut sb = Scrollback::new(16);
        let mut q = DetachedQueue::new(8);
        for chunk in [&b"aaaa"[..], b"bbbb", b"cccc", b"dd"] {
            sb.push(chunk);
            q.push(Bytes::copy_from_slice(chunk));
        }
        let sb_bytes = sb.contents();
        let queued: Vec<u8> = q.drain().iter().flat_map(|b| b.to_vec()).collect();
        assert_eq!(&sb_bytes[sb_bytes.len() - queued.len()..], &queued[..]);
    }
}
