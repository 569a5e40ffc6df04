//! Error types for the frame codec, transport, streams, and RPC layer.

use core::fmt;

/// Errors produced while decoding wire frames.
///
/// A malformed frame is always a single-frame problem: the offending
/// frame is logged and dropped, the connection keeps running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Transport frame shorter than the 5-byte header.
    Truncated { len: usize },
    /// Sub-frame header declares an opcode we do not know.
    UnknownOpcode(u8),
    /// Sub-frame length field exceeds the sanity cap.
    Oversized { len: u32, max: u32 },
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated { len } => {
                write!(f, "transport frame too short: {len} bytes (need 5)")
            }
            Self::UnknownOpcode(op) => write!(f, "unknown sub-frame opcode {op:#04x}"),
            Self::Oversized { len, max } => {
                write!(f, "sub-frame payload {len} bytes exceeds cap {max}")
            }
        }
    }
}

impl std::error::Error for FrameError {}

/// Transport-level errors.
#[derive(Debug)]
pub enum TransportError {
    /// The transport is not currently writable. Synchronous, definite,
    /// nothing was sent.
    NotWritable,
    /// The transport closed normally or with a non-fatal close code.
    Closed,
    /// The peer terminated the session (close code 1008). Fatal:
    /// re-authentication is required, not a reconnect.
    SessionTerminated,
    /// Underlying I/O failure.
    Io(std::io::Error),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotWritable => write!(f, "transport not writable"),
            Self::Closed => write!(f, "transport closed"),
            Self::SessionTerminated => write!(f, "session terminated by peer"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Errors from per-stream operations.
#[derive(Debug)]
pub enum StreamError {
    /// Write attempted while the stream is closing or closed.
    NotWritable { status: crate::StreamStatus },
    /// A live data subscriber is already attached.
    AlreadyAttached,
    /// The result receiver was already handed out for this stream.
    ResultTaken,
    /// The progress receiver was already handed out for this stream.
    ProgressTaken,
    /// The stream no longer exists on this connection.
    Gone,
    /// Sending on the underlying transport failed.
    Transport(TransportError),
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotWritable { status } => {
                write!(f, "stream not writable in status {status:?}")
            }
            Self::AlreadyAttached => write!(f, "a data subscriber is already attached"),
            Self::ResultTaken => write!(f, "result receiver already taken"),
            Self::ProgressTaken => write!(f, "progress receiver already taken"),
            Self::Gone => write!(f, "stream no longer exists"),
            Self::Transport(e) => write!(f, "transport error: {e}"),
        }
    }
}

impl std::error::Error for StreamError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TransportError> for StreamError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

/// Errors from `Connection::open_stream`.
#[derive(Debug)]
pub enum OpenError {
    /// The connection is not in `Open` status.
    ConnectionDown(crate::ConnectionStatus),
    /// The SYN could not be sent; the stream was torn down and never
    /// existed as far as the peer is concerned.
    Transport(TransportError),
}

impl fmt::Display for OpenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionDown(status) => {
                write!(f, "connection is {status:?}, cannot open stream")
            }
            Self::Transport(e) => write!(f, "failed to send open frame: {e}"),
        }
    }
}

impl std::error::Error for OpenError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TransportError> for OpenError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

/// Caller-visible RPC failures.
#[derive(Debug)]
pub enum RpcError {
    /// No Result arrived before the per-call deadline. The stream was
    /// gracefully closed as a side effect.
    Timeout,
    /// The stream (or the whole connection) closed before any Result
    /// was observed. Distinct from a remote error result.
    ConnectionClosed,
    /// The peer answered with `status: "error"`; message and code are
    /// surfaced verbatim.
    Remote {
        message: String,
        code: Option<String>,
    },
    /// An argument failed validation before any frame was built.
    InvalidArgument(String),
    /// The Result payload was not the expected JSON shape.
    Decode(serde_json::Error),
    /// Opening the call stream failed.
    Open(OpenError),
    /// Writing to the call stream failed.
    Stream(StreamError),
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "call timed out"),
            Self::ConnectionClosed => write!(f, "connection closed before result"),
            Self::Remote { message, code } => match code {
                Some(code) => write!(f, "{message} ({code})"),
                None => write!(f, "{message}"),
            },
            Self::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Self::Decode(e) => write!(f, "malformed result payload: {e}"),
            Self::Open(e) => write!(f, "failed to open call stream: {e}"),
            Self::Stream(e) => write!(f, "stream error: {e}"),
        }
    }
}

impl std::error::Error for RpcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Decode(e) => Some(e),
            Self::Open(e) => Some(e),
            Self::Stream(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode(e)
    }
}

impl From<OpenError> for RpcError {
    fn from(e: OpenError) -> Self {
        Self::Open(e)
    }
}

impl From<StreamError> for RpcError {
    fn from(e: StreamError) -> Self {
        Self::Stream(e)
    }
}
