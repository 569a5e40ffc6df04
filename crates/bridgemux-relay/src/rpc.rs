//! Built-in handler for the `"bridge"` stream kind: RPC dispatch.
//!
//! The open payload is the whole invocation,
//! `tag \0 handler \0 command \0 args...`, and the answer is exactly
//! one Result sub-frame followed by FIN. Unknown commands, bad
//! addressing, and handler panics all become error Results; an aborted
//! call sends no Result at all, since the client no longer honors one.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use bridgemux_core::PROTOCOL_TAG;
use futures::FutureExt;
use serde_json::Value;

use crate::context::StreamContext;
use crate::registry::StreamRegistry;

/// A failed command: message and optional machine-readable code, both
/// surfaced verbatim to the caller.
#[derive(Debug, Clone)]
pub struct RpcFailure {
    pub message: String,
    pub code: Option<String>,
}

impl RpcFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: Some(code.into()),
        }
    }
}

impl std::fmt::Display for RpcFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{} ({code})", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for RpcFailure {}

/// Type alias for a boxed async command handler.
///
/// Commands receive their string arguments plus the stream context, so
/// long-running ("spawn"-style) commands can emit data and progress and
/// consume client input before returning their Result.
pub type BoxedCommand = Box<
    dyn Fn(Vec<String>, StreamContext) -> Pin<Box<dyn Future<Output = Result<Value, RpcFailure>> + Send>>
        + Send
        + Sync,
>;

/// Open-ended command registry: (handler, command) -> implementation.
#[derive(Default)]
pub struct RpcRegistry {
    commands: HashMap<(String, String), BoxedCommand>,
}

impl RpcRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a command. Replaces any previous registration for the
    /// same (handler, command) pair.
    pub fn register<F, Fut>(&mut self, handler: &str, command: &str, f: F)
    where
        F: Fn(Vec<String>, StreamContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcFailure>> + Send + 'static,
    {
        let boxed: BoxedCommand = Box::new(move |args, ctx| Box::pin(f(args, ctx)));
        self.commands.insert((handler.to_owned(), command.to_owned()), boxed);
    }

    fn get(&self, handler: &str, command: &str) -> Option<&BoxedCommand> {
        self.commands
            .get(&(handler.to_owned(), command.to_owned()))
    }
}

impl std::fmt::Debug for RpcRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcRegistry")
            .field("commands", &self.commands.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Split the NUL-joined invocation payload into
/// `(handler, command, args)`.
fn parse_invocation(payload: &[u8]) -> Result<(String, String, Vec<String>), RpcFailure> {
    let text = std::str::from_utf8(payload)
        .map_err(|_| RpcFailure::with_code("invocation is not UTF-8", "protocol-error"))?;
    let mut fields = text.split('\0');
    let tag = fields.next().unwrap_or_default();
    if tag != PROTOCOL_TAG {
        return Err(RpcFailure::with_code(
            format!("unknown protocol tag {tag:?}"),
            "protocol-error",
        ));
    }
    let handler = fields
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| RpcFailure::with_code("missing handler name", "protocol-error"))?;
    let command = fields
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| RpcFailure::with_code("missing command name", "protocol-error"))?;
    let args = fields.map(str::to_owned).collect();
    Ok((handler.to_owned(), command.to_owned(), args))
}

/// Register the `"bridge"` stream kind backed by the given command
/// registry.
pub fn register_bridge(streams: &mut StreamRegistry, commands: Arc<RpcRegistry>) {
    streams.register(bridgemux_core::RPC_STREAM_KIND, move |ctx| {
        dispatch(commands.clone(), ctx)
    });
}

async fn dispatch(commands: Arc<RpcRegistry>, ctx: StreamContext) {
    let sender = ctx.sender().clone();
    let cancel = ctx.cancel_token().clone();

    let (handler, command, args) = match parse_invocation(ctx.initial()) {
        Ok(parsed) => parsed,
        Err(failure) => {
            tracing::warn!(stream_id = ctx.id(), %failure, "rejecting call");
            let _ = sender.result_err(&failure.message, failure.code.as_deref());
            return;
        }
    };

    let Some(cmd) = commands.get(&handler, &command) else {
        tracing::warn!(stream_id = ctx.id(), %handler, %command, "unknown command");
        let _ = sender.result_err(
            &format!("no such command {handler}.{command}"),
            Some("not-found"),
        );
        return;
    };

    tracing::debug!(stream_id = ctx.id(), %handler, %command, "dispatching call");
    let work = AssertUnwindSafe(cmd(args, ctx)).catch_unwind();
    tokio::select! {
        outcome = work => {
            let result = match outcome {
                Ok(Ok(data)) => sender.result_ok(&data),
                Ok(Err(failure)) => sender.result_err(&failure.message, failure.code.as_deref()),
                Err(_) => {
                    tracing::error!(%handler, %command, "command handler panicked");
                    sender.result_err("internal error", Some("internal"))
                }
            };
            if let Err(e) = result {
                tracing::debug!(error = %e, "could not send result");
            }
        }
        _ = cancel.cancelled() => {
            tracing::debug!(%handler, %command, "call aborted before completion");
        }
    }
}
