//! Request/response calls layered on ephemeral streams.
//!
//! A call opens one stream of the reserved `"bridge"` kind whose open
//! payload is the entire invocation: protocol tag, handler name,
//! command name and string arguments, NUL-joined. Exactly one Result
//! sub-frame resolves the call; the stream closing first or the
//! deadline expiring first resolve it instead, and whichever of the
//! three happens first is final.

use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::{CloseReason, Connection, RpcError, StreamError, StreamHandle, config};

/// Stream kind reserved for RPC calls.
pub const RPC_STREAM_KIND: &str = "bridge";

/// Leading protocol tag of every call payload.
pub const PROTOCOL_TAG: &str = "bridge1";

/// A (handler, command) address. The command set itself is an open
/// registry owned by the relay; this type only keeps the addressing
/// well-formed before anything reaches the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Method {
    pub handler: String,
    pub command: String,
}

impl Method {
    pub fn new(handler: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            handler: handler.into(),
            command: command.into(),
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.handler, self.command)
    }
}

/// Conversion of typed values into wire arguments.
pub trait ToArg {
    fn to_arg(&self) -> String;
}

impl ToArg for &str {
    fn to_arg(&self) -> String {
        (*self).to_owned()
    }
}

impl ToArg for String {
    fn to_arg(&self) -> String {
        self.clone()
    }
}

impl ToArg for bool {
    fn to_arg(&self) -> String {
        if *self { "true" } else { "false" }.to_owned()
    }
}

impl ToArg for &std::path::Path {
    fn to_arg(&self) -> String {
        self.to_string_lossy().into_owned()
    }
}

macro_rules! int_to_arg {
    ($($ty:ty),*) => {
        $(impl ToArg for $ty {
            fn to_arg(&self) -> String {
                self.to_string()
            }
        })*
    };
}
int_to_arg!(u16, u32, u64, usize, i32, i64);

/// Ordered call arguments.
#[derive(Debug, Clone, Default)]
pub struct Args(Vec<String>);

impl Args {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arg(mut self, value: impl ToArg) -> Self {
        self.0.push(value.to_arg());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<S: ToArg> FromIterator<S> for Args {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(|v| v.to_arg()).collect())
    }
}

/// Build the NUL-joined call payload, rejecting any field that could
/// corrupt the separator framing. Runs before any frame is built.
fn encode_call(method: &Method, args: &Args) -> Result<Vec<u8>, RpcError> {
    if method.handler.is_empty() || method.command.is_empty() {
        return Err(RpcError::InvalidArgument(format!(
            "empty handler or command in {method:?}"
        )));
    }
    let mut fields: Vec<&str> = Vec::with_capacity(3 + args.0.len());
    fields.push(PROTOCOL_TAG);
    fields.push(&method.handler);
    fields.push(&method.command);
    for arg in &args.0 {
        fields.push(arg);
    }
    for field in &fields {
        if field.contains('\0') {
            return Err(RpcError::InvalidArgument(format!(
                "NUL byte in field of {method}"
            )));
        }
    }
    Ok(fields.join("\0").into_bytes())
}

/// Decode the JSON Result envelope: `{status, data?, error?, code?}`.
fn decode_result<T: DeserializeOwned>(value: Value) -> Result<T, RpcError> {
    #[derive(serde::Deserialize)]
    struct WireResult {
        status: String,
        #[serde(default)]
        data: Option<Value>,
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        code: Option<String>,
    }

    let wire: WireResult = serde_json::from_value(value)?;
    if wire.status == "ok" {
        Ok(serde_json::from_value(wire.data.unwrap_or(Value::Null))?)
    } else {
        Err(RpcError::Remote {
            message: wire.error.unwrap_or_else(|| "unspecified error".to_owned()),
            code: wire.code,
        })
    }
}

/// RPC client bound to one connection.
#[derive(Clone, Debug)]
pub struct RpcClient {
    conn: Connection,
    timeout: Duration,
}

impl RpcClient {
    pub fn new(conn: &Connection) -> Self {
        Self {
            conn: conn.clone(),
            timeout: config::call_timeout(),
        }
    }

    /// Override the default per-call deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// One-shot call: resolves from the single Result sub-frame, or
    /// fails on close-before-result or on the deadline. The deadline
    /// gracefully closes the call stream as a side effect.
    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &Method,
        args: Args,
    ) -> Result<T, RpcError> {
        let call = self.spawn(method, args)?;
        call.wait().await
    }

    /// Streaming variant: returns a handle for incremental data,
    /// progress, and stdin-style input while the terminal outcome is
    /// still pending.
    pub fn spawn(&self, method: &Method, args: Args) -> Result<RpcCall, RpcError> {
        let payload = encode_call(method, &args)?;
        let stream = self.conn.open_stream(RPC_STREAM_KIND, &payload)?;
        // Register outcome receivers before anything can arrive.
        let result_rx = stream.result()?;
        let closed_rx = stream.closed();
        tracing::debug!(stream_id = stream.id(), method = %method, "call started");
        Ok(RpcCall {
            stream,
            result_rx,
            closed_rx,
            timeout: self.timeout,
        })
    }
}

/// An in-flight call.
pub struct RpcCall {
    stream: StreamHandle,
    result_rx: oneshot::Receiver<Value>,
    closed_rx: oneshot::Receiver<CloseReason>,
    timeout: Duration,
}

impl std::fmt::Debug for RpcCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcCall")
            .field("stream_id", &self.stream.id())
            .finish_non_exhaustive()
    }
}

impl RpcCall {
    pub fn stream(&self) -> &StreamHandle {
        &self.stream
    }

    /// Subscribe to incremental output.
    pub fn data(&self) -> Result<mpsc::UnboundedReceiver<Bytes>, StreamError> {
        self.stream.attach()
    }

    /// Subscribe to progress reports.
    pub fn progress(&self) -> Result<mpsc::UnboundedReceiver<Value>, StreamError> {
        self.stream.progress()
    }

    /// Feed bytes to the remote operation (stdin-style) while the call
    /// is still in flight.
    pub fn input(&self, bytes: impl Into<Bytes>) -> Result<(), StreamError> {
        self.stream.send(bytes)
    }

    /// Cancel hard: Abort then RST. `wait` resolves as closed.
    pub fn abort(&self) {
        self.stream.abort();
    }

    /// Resolve the single terminal outcome: first of Result, close, or
    /// the deadline. Later arrivals are ignored.
    pub async fn wait<T: DeserializeOwned>(self) -> Result<T, RpcError> {
        let RpcCall {
            stream,
            result_rx,
            closed_rx,
            timeout,
        } = self;
        tokio::select! {
            biased;
            result = result_rx => match result {
                Ok(value) => decode_result(value),
                // Sender dropped without a Result: the stream closed.
                Err(_) => Err(RpcError::ConnectionClosed),
            },
            _ = closed_rx => Err(RpcError::ConnectionClosed),
            _ = tokio::time::sleep(timeout) => {
                tracing::warn!(stream_id = stream.id(), timeout_ms = timeout.as_millis() as u64,
                    "call timed out waiting for result");
                let _ = stream.close();
                Err(RpcError::Timeout)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_payload_is_nul_joined() {
        let method = Method::new("file", "read");
        let payload = encode_call(&method, &Args::new().arg("/etc/hosts").arg(64u32)).unwrap();
        assert_eq!(payload, b"bridge1\0file\0read\0/etc/hosts\x0064");
    }

    #[test]
    fn nul_in_argument_is_rejected_before_send() {
        let method = Method::new("file", "read");
        let err = encode_call(&method, &Args::new().arg("bad\0arg")).unwrap_err();
        assert!(matches!(err, RpcError::InvalidArgument(_)));
    }

    #[test]
    fn nul_in_handler_is_rejected() {
        let method = Method::new("fi\0le", "read");
        assert!(matches!(
            encode_call(&method, &Args::new()),
            Err(RpcError::InvalidArgument(_))
        ));
    }

    #[test]
    fn ok_result_decodes_data() {
        let value = serde_json::json!({"status": "ok", "data": {"n": 3}});
        #[derive(serde::Deserialize)]
        struct Out {
            n: u32,
        }
        let out: Out = decode_result(value).unwrap();
        assert_eq!(out.n, 3);
    }

    #[test]
    fn error_result_surfaces_message_and_code() {
        let value = serde_json::json!({"status": "error", "error": "no such file", "code": "not-found"});
        let err = decode_result::<Value>(value).unwrap_err();
        match err {
            RpcError::Remote { message, code } => {
                assert_eq!(message, "no such file");
                assert_eq!(code.as_deref(), Some("not-found"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn unit_result_accepts_missing_data() {
        let value = serde_json::json!({"status": "ok"});
        decode_result::<()>(value).unwrap();
    }
}
