//! Relay conformance tests: the test plays the client endpoint with
//! hand-encoded frames over an in-memory pair.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bridgemux_core::{
    FrameFlags, Opcode, Reassembler, StreamFrame, Transport, TransportFrame, encode_open_payload,
};
use bridgemux_relay::{
    Relay, RpcFailure, RpcRegistry, StreamEvent, StreamRegistry, register_bridge,
};
use bytes::Bytes;
use serde_json::json;

const TICK: Duration = Duration::from_secs(1);

fn echo_registry() -> StreamRegistry {
    let mut streams = StreamRegistry::new();
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
    streams
}

fn start(registry: StreamRegistry) -> (Relay, Transport) {
    let (client, server) = Transport::mem_pair();
    let relay = Relay::new(server, registry);
    tokio::spawn({
        let relay = relay.clone();
        async move {
            let _ = relay.run().await;
        }
    });
    (relay, client)
}

fn send_syn(client: &Transport, id: u32, kind: &str, initial: &[u8]) {
    let open = StreamFrame::new(Opcode::Open, id, encode_open_payload(kind, initial));
    client
        .try_send(TransportFrame::new(id, FrameFlags::SYN, open.encode()).encode())
        .unwrap();
}

fn send_sub(client: &Transport, id: u32, opcode: Opcode, payload: &[u8]) {
    let sub = StreamFrame::new(opcode, id, Bytes::copy_from_slice(payload));
    client
        .try_send(TransportFrame::new(id, FrameFlags::DATA, sub.encode()).encode())
        .unwrap();
}

async fn recv_frame(client: &Transport) -> TransportFrame {
    let message = tokio::time::timeout(TICK, client.recv())
        .await
        .expect("recv timed out")
        .expect("transport closed");
    TransportFrame::decode(&message).expect("well-formed frame")
}

/// Receive one DATA frame and parse its (single) sub-frame.
async fn recv_sub(client: &Transport) -> StreamFrame {
    let frame = recv_frame(client).await;
    assert!(frame.flags.contains(FrameFlags::DATA));
    let mut r = Reassembler::new();
    r.push(&frame.payload);
    r.next_frame().unwrap().expect("complete sub-frame")
}

#[tokio::test]
async fn syn_creates_the_operation_and_data_flows_both_ways() {
    let (relay, client) = start(echo_registry());

    send_syn(&client, 1, "echo", b"hi");
    let echoed = recv_sub(&client).await;
    assert_eq!(echoed.opcode, Opcode::Data);
    assert_eq!(&echoed.payload[..], b"hi");
    assert_eq!(relay.stream_ids(), vec![1]);

    send_sub(&client, 1, Opcode::Data, b"more");
    let echoed = recv_sub(&client).await;
    assert_eq!(&echoed.payload[..], b"more");
}

#[tokio::test]
async fn fin_from_client_finishes_the_worker_and_fins_back() {
    let (relay, client) = start(echo_registry());

    send_syn(&client, 1, "echo", b"");
    client
        .try_send(TransportFrame::new(1, FrameFlags::FIN, Bytes::new()).encode())
        .unwrap();

    let fin = recv_frame(&client).await;
    assert!(fin.flags.contains(FrameFlags::FIN));
    assert_eq!(fin.stream_id, 1);
    assert!(relay.stream_ids().is_empty());
}

#[tokio::test]
async fn unknown_kind_is_reset() {
    let (_relay, client) = start(echo_registry());
    send_syn(&client, 1, "no-such-kind", b"");
    let rst = recv_frame(&client).await;
    assert!(rst.flags.contains(FrameFlags::RST));
    assert_eq!(rst.stream_id, 1);
}

#[tokio::test]
async fn duplicate_syn_for_a_live_stream_is_reset() {
    let (relay, client) = start(echo_registry());
    send_syn(&client, 1, "echo", b"first");
    let _echo = recv_sub(&client).await;
    send_syn(&client, 1, "echo", b"again");
    let rst = recv_frame(&client).await;
    assert!(rst.flags.contains(FrameFlags::RST));
    assert_eq!(relay.stream_ids(), vec![1]);
}

#[tokio::test]
async fn abort_cancels_the_running_operation() {
    let cancelled = Arc::new(Mutex::new(None::<tokio::sync::oneshot::Sender<()>>));
    let (tx, rx) = tokio::sync::oneshot::channel();
    *cancelled.lock().unwrap() = Some(tx);

    let mut streams = StreamRegistry::new();
    let slot = cancelled.clone();
    streams.register("job", move |ctx| {
        let slot = slot.clone();
        async move {
            ctx.cancel_token().clone().cancelled_owned().await;
            if let Some(tx) = slot.lock().unwrap().take() {
                let _ = tx.send(());
            }
        }
    });

    let (relay, client) = start(streams);
    send_syn(&client, 1, "job", b"");
    send_sub(&client, 1, Opcode::Abort, b"");
    client
        .try_send(TransportFrame::new(1, FrameFlags::RST, Bytes::new()).encode())
        .unwrap();

    tokio::time::timeout(TICK, rx)
        .await
        .expect("worker was not cancelled")
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(relay.stream_ids().is_empty());
}

#[tokio::test]
async fn resize_reaches_the_worker_as_geometry() {
    let mut streams = StreamRegistry::new();
    streams.register("term", |mut ctx| async move {
        let sender = ctx.sender().clone();
        while let Some(event) = ctx.next_event().await {
            match event {
                StreamEvent::Resize { cols, rows } => {
                    let _ = sender.send(format!("{cols}x{rows}").into_bytes());
                }
                StreamEvent::InputClosed => break,
                StreamEvent::Data(_) => {}
            }
        }
    });
    let (_relay, client) = start(streams);

    send_syn(&client, 1, "term", b"");
    let mut resize = Vec::new();
    resize.extend_from_slice(&120u32.to_be_bytes());
    resize.extend_from_slice(&40u32.to_be_bytes());
    send_sub(&client, 1, Opcode::Resize, &resize);

    let answer = recv_sub(&client).await;
    assert_eq!(&answer.payload[..], b"120x40");
}

#[tokio::test]
async fn malformed_frames_do_not_kill_the_relay() {
    let (_relay, client) = start(echo_registry());

    client.try_send(vec![0, 0, 1]).unwrap();
    send_syn(&client, 3, "echo", b"still alive");
    let echoed = recv_sub(&client).await;
    assert_eq!(&echoed.payload[..], b"still alive");
}

#[tokio::test]
async fn workers_run_concurrently_per_stream() {
    let mut streams = StreamRegistry::new();
    streams.register("slow", |ctx| async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        let _ = ctx.sender().send(&b"slow"[..]);
    });
    streams.register("fast", |ctx| async move {
        let _ = ctx.sender().send(&b"fast"[..]);
    });

    let (_relay, client) = start(streams);
    send_syn(&client, 1, "slow", b"");
    send_syn(&client, 3, "fast", b"");

    // The fast stream answers while the slow worker is still asleep.
    let first = recv_sub(&client).await;
    assert_eq!(&first.payload[..], b"fast");
    let fin = recv_frame(&client).await;
    assert!(fin.flags.contains(FrameFlags::FIN));
    assert_eq!(fin.stream_id, 3);
    let second = recv_sub(&client).await;
    assert_eq!(&second.payload[..], b"slow");
}

#[tokio::test]
async fn bridge_invocation_yields_one_result_then_fin() {
    let mut commands = RpcRegistry::new();
    commands.register("sys", "ping", |_args, _ctx| async move { Ok(json!("pong")) });
    commands.register("sys", "boom", |_args, _ctx| async move {
        Err::<serde_json::Value, _>(RpcFailure::with_code("it broke", "internal"))
    });
    let mut streams = StreamRegistry::new();
    register_bridge(&mut streams, Arc::new(commands));
    let (_relay, client) = start(streams);

    send_syn(&client, 1, "bridge", b"bridge1\0sys\0ping");
    let result = recv_sub(&client).await;
    assert_eq!(result.opcode, Opcode::Result);
    let body: serde_json::Value = serde_json::from_slice(&result.payload).unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["data"], "pong");
    let fin = recv_frame(&client).await;
    assert!(fin.flags.contains(FrameFlags::FIN));

    // Failures are still Results, not dead streams.
    send_syn(&client, 3, "bridge", b"bridge1\0sys\0boom");
    let result = recv_sub(&client).await;
    let body: serde_json::Value = serde_json::from_slice(&result.payload).unwrap();
    assert_eq!(body["status"], "error");
    assert_eq!(body["error"], "it broke");
    assert_eq!(body["code"], "internal");
    let fin = recv_frame(&client).await;
    assert!(fin.flags.contains(FrameFlags::FIN));
}

#[tokio::test]
async fn unknown_command_is_a_not_found_result() {
    let mut streams = StreamRegistry::new();
    register_bridge(&mut streams, Arc::new(RpcRegistry::new()));
    let (_relay, client) = start(streams);

    send_syn(&client, 1, "bridge", b"bridge1\0ghost\0walk");
    let result = recv_sub(&client).await;
    assert_eq!(result.opcode, Opcode::Result);
    let body: serde_json::Value = serde_json::from_slice(&result.payload).unwrap();
    assert_eq!(body["status"], "error");
    assert_eq!(body["code"], "not-found");
}

#[tokio::test]
async fn wrong_protocol_tag_is_rejected() {
    let mut streams = StreamRegistry::new();
    register_bridge(&mut streams, Arc::new(RpcRegistry::new()));
    let (_relay, client) = start(streams);

    send_syn(&client, 1, "bridge", b"v0\0sys\0ping");
    let result = recv_sub(&client).await;
    let body: serde_json::Value = serde_json::from_slice(&result.payload).unwrap();
    assert_eq!(body["status"], "error");
    assert_eq!(body["code"], "protocol-error");
}
