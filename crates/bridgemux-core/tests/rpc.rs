//! RPC-layer tests with the test playing the relay peer: outcome
//! resolution order, timeout side effects, and bidirectional calls.

use std::time::Duration;

use bytes::Bytes;
use bridgemux_core::{
    Args, Connection, FrameFlags, Method, Opcode, Reassembler, RpcClient, RpcError, StreamFrame,
    StreamStatus, Transport, TransportFrame, decode_open_payload,
};
use tokio::task::JoinHandle;

const TICK: Duration = Duration::from_secs(1);

async fn setup() -> (Connection, Transport, JoinHandle<()>) {
    let (client_side, peer) = Transport::mem_pair();
    let conn = Connection::new(client_side);
    let task = tokio::spawn({
        let conn = conn.clone();
        async move {
            let _ = conn.run().await;
        }
    });
    conn.ready(TICK).await.expect("connection ready");
    (conn, peer, task)
}

/// Read the next SYN and return (stream_id, invocation payload).
async fn accept_call(peer: &Transport) -> (u32, Vec<u8>) {
    let message = tokio::time::timeout(TICK, peer.recv())
        .await
        .expect("peer recv timed out")
        .expect("peer transport closed");
    let frame = TransportFrame::decode(&message).expect("well-formed frame");
    assert!(frame.flags.contains(FrameFlags::SYN));
    let mut r = Reassembler::new();
    r.push(&frame.payload);
    let sub = r.next_frame().unwrap().unwrap();
    assert_eq!(sub.opcode, Opcode::Open);
    let (kind, initial) = decode_open_payload(&sub.payload).unwrap();
    assert_eq!(kind, "bridge");
    (frame.stream_id, initial.to_vec())
}

fn peer_send_result(peer: &Transport, id: u32, body: &str) {
    let sub = StreamFrame::new(Opcode::Result, id, Bytes::copy_from_slice(body.as_bytes()));
    let frame = TransportFrame::new(id, FrameFlags::DATA, sub.encode());
    peer.try_send(frame.encode()).unwrap();
}

fn peer_send_fin(peer: &Transport, id: u32) {
    peer.try_send(TransportFrame::new(id, FrameFlags::FIN, Bytes::new()).encode())
        .unwrap();
}

#[tokio::test]
async fn call_resolves_from_the_result_subframe() {
    let (conn, peer, _task) = setup().await;
    let client = RpcClient::new(&conn).with_timeout(TICK);

    let call = tokio::spawn(async move {
        client
            .call::<i64>(&Method::new("counter", "get"), Args::new().arg("cpu"))
            .await
    });

    let (id, invocation) = accept_call(&peer).await;
    assert_eq!(invocation, b"bridge1\0counter\0get\0cpu");
    peer_send_result(&peer, id, r#"{"status":"ok","data":42}"#);
    peer_send_fin(&peer, id);

    assert_eq!(call.await.unwrap().unwrap(), 42);
}

#[tokio::test]
async fn error_result_surfaces_message_and_code_verbatim() {
    let (conn, peer, _task) = setup().await;
    let client = RpcClient::new(&conn).with_timeout(TICK);

    let call = tokio::spawn(async move {
        client
            .call::<serde_json::Value>(&Method::new("file", "read"), Args::new().arg("/nope"))
            .await
    });

    let (id, _invocation) = accept_call(&peer).await;
    peer_send_result(
        &peer,
        id,
        r#"{"status":"error","error":"no such file","code":"not-found"}"#,
    );
    peer_send_fin(&peer, id);

    match call.await.unwrap() {
        Err(RpcError::Remote { message, code }) => {
            assert_eq!(message, "no such file");
            assert_eq!(code.as_deref(), Some("not-found"));
        }
        other => panic!("expected remote error, got {other:?}"),
    }
}

#[tokio::test]
async fn close_before_result_is_a_distinct_failure() {
    let (conn, peer, _task) = setup().await;
    let client = RpcClient::new(&conn).with_timeout(TICK);

    let call = tokio::spawn(async move {
        client
            .call::<serde_json::Value>(&Method::new("job", "run"), Args::new())
            .await
    });

    let (id, _invocation) = accept_call(&peer).await;
    peer_send_fin(&peer, id);

    assert!(matches!(
        call.await.unwrap(),
        Err(RpcError::ConnectionClosed)
    ));
}

#[tokio::test]
async fn timeout_rejects_and_gracefully_closes_the_stream() {
    let (conn, peer, _task) = setup().await;
    let client = RpcClient::new(&conn).with_timeout(Duration::from_millis(100));

    let call = client
        .spawn(&Method::new("job", "run"), Args::new())
        .unwrap();
    let stream = call.stream().clone();
    let (id, _invocation) = accept_call(&peer).await;

    // The peer never answers.
    assert!(matches!(
        call.wait::<serde_json::Value>().await,
        Err(RpcError::Timeout)
    ));
    assert_eq!(stream.status(), StreamStatus::Closing);

    // The deadline produced a graceful FIN on the wire.
    let message = tokio::time::timeout(TICK, peer.recv()).await.unwrap().unwrap();
    let frame = TransportFrame::decode(&message).unwrap();
    assert_eq!(frame.stream_id, id);
    assert!(frame.flags.contains(FrameFlags::FIN));
}

#[tokio::test]
async fn late_result_after_timeout_is_ignored() {
    let (conn, peer, _task) = setup().await;
    let client = RpcClient::new(&conn).with_timeout(Duration::from_millis(100));

    let call = client
        .spawn(&Method::new("job", "run"), Args::new())
        .unwrap();
    let (id, _invocation) = accept_call(&peer).await;

    assert!(matches!(
        call.wait::<serde_json::Value>().await,
        Err(RpcError::Timeout)
    ));

    // Result arrives after the outcome was already decided: dropped.
    peer_send_result(&peer, id, r#"{"status":"ok","data":1}"#);
    peer_send_fin(&peer, id);
    let fresh = conn.open_stream("echo", b"").unwrap();
    assert_eq!(fresh.status(), StreamStatus::Open);
}

#[tokio::test]
async fn input_and_progress_flow_while_the_call_is_pending() {
    let (conn, peer, _task) = setup().await;
    let client = RpcClient::new(&conn).with_timeout(TICK);

    let call = client
        .spawn(&Method::new("proc", "spawn"), Args::new().arg("sort"))
        .unwrap();
    let mut progress = call.progress().unwrap();
    let mut data = call.data().unwrap();
    let (id, _invocation) = accept_call(&peer).await;

    // Feed stdin while no Result has arrived.
    call.input(&b"b\na\n"[..]).unwrap();
    let message = tokio::time::timeout(TICK, peer.recv()).await.unwrap().unwrap();
    let frame = TransportFrame::decode(&message).unwrap();
    let mut r = Reassembler::new();
    r.push(&frame.payload);
    let sub = r.next_frame().unwrap().unwrap();
    assert_eq!(sub.opcode, Opcode::Data);
    assert_eq!(&sub.payload[..], b"b\na\n");

    // Progress, incremental output, then the terminal Result.
    let progress_sub = StreamFrame::new(Opcode::Progress, id, &br#"{"percent":50}"#[..]);
    peer.try_send(TransportFrame::new(id, FrameFlags::DATA, progress_sub.encode()).encode())
        .unwrap();
    let data_sub = StreamFrame::new(Opcode::Data, id, &b"a\nb\n"[..]);
    peer.try_send(TransportFrame::new(id, FrameFlags::DATA, data_sub.encode()).encode())
        .unwrap();

    let step = tokio::time::timeout(TICK, progress.recv()).await.unwrap().unwrap();
    assert_eq!(step["percent"], 50);
    let chunk = tokio::time::timeout(TICK, data.recv()).await.unwrap().unwrap();
    assert_eq!(&chunk[..], b"a\nb\n");

    peer_send_result(&peer, id, r#"{"status":"ok","data":{"exit":0}}"#);
    peer_send_fin(&peer, id);
    let out: serde_json::Value = call.wait().await.unwrap();
    assert_eq!(out["exit"], 0);
}

#[tokio::test]
async fn result_wins_over_a_simultaneous_close() {
    let (conn, peer, _task) = setup().await;
    let client = RpcClient::new(&conn).with_timeout(TICK);

    let call = client.spawn(&Method::new("job", "run"), Args::new()).unwrap();
    let (id, _invocation) = accept_call(&peer).await;

    // Both arrive before the caller polls: the Result is the outcome.
    peer_send_result(&peer, id, r#"{"status":"ok","data":"done"}"#);
    peer_send_fin(&peer, id);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let out: String = call.wait().await.unwrap();
    assert_eq!(out, "done");
}
