//! bridgemux-testkit: shared harness for exercising both endpoints of
//! the bridge connection over an in-memory transport pair.
//!
//! The harness wires a [`Connection`] to a [`Relay`] loaded with canned
//! handlers, runs both demux loops, and hands tests the pieces:
//!
//! ```ignore
//! let harness = TestHarness::start().await;
//! let total: i64 = harness
//!     .client()
//!     .call(&Method::new("test", "add"), Args::new().arg(2u32).arg(3u32))
//!     .await?;
//! harness.shutdown().await;
//! ```
//!
//! Canned stream kinds: `echo`, `terminal` (persistent), `download`,
//! `archive`. Canned commands under the `test` handler: `add`, `fail`,
//! `sleep` (never resolves), `progress`, `cat` (consumes input until
//! the client half-closes).

use std::sync::Arc;
use std::time::Duration;

use bridgemux_core::{Connection, ConnectionConfig, RpcClient, Transport, TransportError};
use bridgemux_relay::{
    Relay, RpcFailure, RpcRegistry, StreamEvent, StreamRegistry, register_bridge,
};
use serde_json::json;
use tokio::task::JoinHandle;

/// Install a subscriber for test logs, honoring `RUST_LOG`. Safe to
/// call from every test; only the first call wins.
pub fn init_tracing() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

/// The stream-kind and command registries every harness relay serves.
pub fn test_registry() -> StreamRegistry {
    let mut streams = StreamRegistry::new();

    // Echoes the initial payload, then every data chunk, until the
    // client half-closes.
    streams.register("echo", |mut ctx| async move {
        let sender = ctx.sender().clone();
        if !ctx.initial().is_empty() {
            let _ = sender.send(ctx.initial().clone());
        }
        while let Some(event) = ctx.next_event().await {
            match event {
                StreamEvent::Data(bytes) => {
                    let _ = sender.send(bytes);
                }
                StreamEvent::InputClosed => break,
                StreamEvent::Resize { .. } => {}
            }
        }
    });

    // Interactive session stand-in for the persistent-kind tests:
    // prints a prompt, echoes input, acknowledges resizes.
    streams.register("terminal", |mut ctx| async move {
        let sender = ctx.sender().clone();
        let cancel = ctx.cancel_token().clone();
        let _ = sender.send(&b"$ "[..]);
        loop {
            tokio::select! {
                event = ctx.next_event() => match event {
                    Some(StreamEvent::Data(bytes)) => {
                        let _ = sender.send(bytes);
                    }
                    Some(StreamEvent::Resize { cols, rows }) => {
                        tracing::debug!(cols, rows, "terminal resized");
                    }
                    Some(StreamEvent::InputClosed) | None => break,
                },
                _ = cancel.cancelled() => break,
            }
        }
    });

    // Download stand-ins: answer with a recognizable rendering of the
    // requested paths, then finish (the relay FINs for us).
    streams.register("download", |ctx| async move {
        let _ = ctx.sender().send(ctx.initial().clone());
    });
    streams.register("archive", |ctx| async move {
        let paths = ctx.initial().clone();
        let mut body = b"archive:".to_vec();
        body.extend_from_slice(&paths);
        let _ = ctx.sender().send(body);
    });

    let mut commands = RpcRegistry::new();

    commands.register("test", "add", |args, _ctx| async move {
        let mut total = 0i64;
        for arg in &args {
            total += arg
                .parse::<i64>()
                .map_err(|_| RpcFailure::with_code(format!("not a number: {arg}"), "invalid-argument"))?;
        }
        Ok(json!(total))
    });

    commands.register("test", "fail", |_args, _ctx| async move {
        Err::<serde_json::Value, _>(RpcFailure::with_code("expected failure", "boom"))
    });

    // Never resolves; exists so timeout and abort paths are testable.
    commands.register("test", "sleep", |_args, _ctx| async move {
        futures::future::pending::<()>().await;
        unreachable!()
    });

    commands.register("test", "progress", |args, ctx| async move {
        let steps: u32 = args
            .first()
            .and_then(|a| a.parse().ok())
            .unwrap_or(3);
        for step in 1..=steps {
            let _ = ctx
                .sender()
                .progress(&json!({ "step": step, "of": steps }));
        }
        Ok(json!("done"))
    });

    // Spawn-style: stream input back as data until the client
    // half-closes, then report how much was seen.
    commands.register("test", "cat", |_args, mut ctx| async move {
        let sender = ctx.sender().clone();
        let mut total = 0usize;
        while let Some(event) = ctx.next_event().await {
            match event {
                StreamEvent::Data(bytes) => {
                    total += bytes.len();
                    let _ = sender.send(bytes);
                }
                StreamEvent::InputClosed => break,
                StreamEvent::Resize { .. } => {}
            }
        }
        Ok(json!({ "bytes": total }))
    });

    register_bridge(&mut streams, Arc::new(commands));
    streams
}

/// A connected Connection/Relay pair with both demux loops running.
pub struct TestHarness {
    pub conn: Connection,
    pub relay: Relay,
    conn_task: JoinHandle<Result<(), TransportError>>,
    relay_task: JoinHandle<Result<(), TransportError>>,
}

impl TestHarness {
    pub async fn start() -> Self {
        Self::start_with(ConnectionConfig::default()).await
    }

    pub async fn start_with(config: ConnectionConfig) -> Self {
        let (client_side, relay_side) = Transport::mem_pair();
        let conn = Connection::with_config(client_side, config);
        let relay = Relay::new(relay_side, test_registry());

        let conn_task = tokio::spawn({
            let conn = conn.clone();
            async move { conn.run().await }
        });
        let relay_task = tokio::spawn({
            let relay = relay.clone();
            async move { relay.run().await }
        });

        conn.ready(Duration::from_secs(5))
            .await
            .expect("harness connection should become ready");

        Self {
            conn,
            relay,
            conn_task,
            relay_task,
        }
    }

    /// An RPC client on the harness connection.
    pub fn client(&self) -> RpcClient {
        RpcClient::new(&self.conn)
    }

    /// Close both endpoints and wait for their loops.
    pub async fn shutdown(self) {
        self.conn.close();
        self.relay.close();
        let _ = self.conn_task.await;
        let _ = self.relay_task.await;
    }
}
