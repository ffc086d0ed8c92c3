//! WebSocket end-to-end behavior against scripted peers.

mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use turbine::ws::Message;
use turbine::{Client, WebSocketOptions};

const OP_TEXT: u8 = 0x1;
const OP_BINARY: u8 = 0x2;
const OP_CLOSE: u8 = 0x8;
const OP_PING: u8 = 0x9;
const OP_PONG: u8 = 0xa;

fn ws_uri(addr: std::net::SocketAddr) -> http::Uri {
    format!("ws://{}/socket", addr).parse().unwrap()
}

#[tokio::test]
async fn text_echo() {
    let addr = support::serve(1, |mut socket, _| async move {
        support::ws_server_handshake(&mut socket, None).await;
        let frame = support::ws_read_frame(&mut socket).await;
        assert_eq!(frame.opcode, OP_TEXT);
        assert!(frame.fin);
        support::ws_write_frame(&mut socket, true, false, OP_TEXT, &frame.payload).await;
        // then a clean close
        let close = support::ws_read_frame(&mut socket).await;
        assert_eq!(close.opcode, OP_CLOSE);
        support::ws_write_frame(&mut socket, true, false, OP_CLOSE, &close.payload).await;
    })
    .await;

    let client = Client::new();
    let mut ws = client.websocket(ws_uri(addr)).await.unwrap();
    ws.send(Message::Text("hello there".into())).await.unwrap();
    let echoed = ws.recv().await.unwrap().unwrap();
    assert_eq!(echoed, Message::Text("hello there".into()));
    ws.close(1000, "done").await.unwrap();
}

#[tokio::test]
async fn compressed_binary_echo() {
    // permessage-deflate with no context takeover on both sides
    let addr = support::serve(1, |mut socket, _| async move {
        let offered = support::ws_server_handshake(
            &mut socket,
            Some("permessage-deflate; server_no_context_takeover; client_no_context_takeover"),
        )
        .await
        .expect("client offers deflate");
        assert!(offered.contains("permessage-deflate"));
        assert!(offered.contains("client_no_context_takeover"));
        assert!(offered.contains("server_no_context_takeover"));

        let frame = support::ws_read_frame(&mut socket).await;
        assert_eq!(frame.opcode, OP_BINARY);
        assert!(frame.rsv1, "outbound first frame must set RSV1");
        let inflated = support::ws_inflate(&frame.payload);
        assert_eq!(inflated, vec![0u8; 4096]);

        let echoed = support::ws_deflate(&inflated);
        support::ws_write_frame(&mut socket, true, true, OP_BINARY, &echoed).await;

        let close = support::ws_read_frame(&mut socket).await;
        assert_eq!(close.opcode, OP_CLOSE);
        support::ws_write_frame(&mut socket, true, false, OP_CLOSE, &close.payload).await;
    })
    .await;

    let mut options = WebSocketOptions::default();
    options.enable_deflate = true;
    let client = Client::builder().websocket_options(options).build().unwrap();

    let mut ws = client.websocket(ws_uri(addr)).await.unwrap();
    ws.send(Message::Binary(Bytes::from(vec![0u8; 4096])))
        .await
        .unwrap();
    let echoed = ws.recv().await.unwrap().unwrap();
    assert_eq!(echoed, Message::Binary(Bytes::from(vec![0u8; 4096])));
    ws.close(1000, "").await.unwrap();
}

#[tokio::test]
async fn concurrent_closes_emit_one_close_frame() {
    let close_frames = Arc::new(AtomicUsize::new(0));
    let counter = close_frames.clone();
    let addr = support::serve(1, move |mut socket, _| {
        let counter = counter.clone();
        async move {
            support::ws_server_handshake(&mut socket, None).await;
            loop {
                let frame = support::ws_read_frame(&mut socket).await;
                if frame.opcode == OP_CLOSE {
                    counter.fetch_add(1, Ordering::SeqCst);
                    support::ws_write_frame(&mut socket, true, false, OP_CLOSE, &frame.payload)
                        .await;
                    return;
                }
            }
        }
    })
    .await;

    let client = Client::new();
    let ws = Arc::new(client.websocket(ws_uri(addr)).await.unwrap());

    let mut closers = Vec::new();
    for _ in 0..3 {
        let ws = ws.clone();
        closers.push(tokio::spawn(async move { ws.close(1000, "bye").await }));
    }
    for closer in closers {
        closer.await.unwrap().unwrap();
    }
    // give the server a beat to notice anything extra
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(close_frames.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn pings_are_answered_inline() {
    let addr = support::serve(1, |mut socket, _| async move {
        support::ws_server_handshake(&mut socket, None).await;
        support::ws_write_frame(&mut socket, true, false, OP_PING, b"marco").await;
        let pong = support::ws_read_frame(&mut socket).await;
        assert_eq!(pong.opcode, OP_PONG);
        assert_eq!(pong.payload, b"marco");
        // data afterwards proves the connection is still healthy
        support::ws_write_frame(&mut socket, true, false, OP_TEXT, b"polo").await;
    })
    .await;

    let client = Client::new();
    let mut ws = client.websocket(ws_uri(addr)).await.unwrap();
    let message = ws.recv().await.unwrap().unwrap();
    assert_eq!(message, Message::Text("polo".into()));
}

#[tokio::test]
async fn fragmented_message_reassembles() {
    let addr = support::serve(1, |mut socket, _| async move {
        support::ws_server_handshake(&mut socket, None).await;
        support::ws_write_frame(&mut socket, false, false, OP_TEXT, b"one ").await;
        // a control frame may interleave between fragments
        support::ws_write_frame(&mut socket, true, false, OP_PING, b"").await;
        support::ws_write_frame(&mut socket, false, false, 0x0, b"two ").await;
        support::ws_write_frame(&mut socket, true, false, 0x0, b"three").await;
    })
    .await;

    let client = Client::new();
    let mut ws = client.websocket(ws_uri(addr)).await.unwrap();
    let message = ws.recv().await.unwrap().unwrap();
    assert_eq!(message, Message::Text("one two three".into()));
}

#[tokio::test]
async fn invalid_utf8_text_is_protocol_error() {
    let addr = support::serve(1, |mut socket, _| async move {
        support::ws_server_handshake(&mut socket, None).await;
        support::ws_write_frame(&mut socket, true, false, OP_TEXT, &[0xff, 0xfe, 0xfd]).await;
        // the client answers with a close and goes away
        let _ = support::ws_read_frame(&mut socket).await;
    })
    .await;

    let client = Client::new();
    let mut ws = client.websocket(ws_uri(addr)).await.unwrap();
    let err = ws.recv().await.unwrap_err();
    assert!(err.is_protocol());
}

#[tokio::test]
async fn oversized_message_is_refused_with_1009() {
    let addr = support::serve(1, |mut socket, _| async move {
        support::ws_server_handshake(&mut socket, None).await;
        support::ws_write_frame(&mut socket, true, false, OP_BINARY, &vec![0u8; 2048]).await;
        let close = support::ws_read_frame(&mut socket).await;
        assert_eq!(close.opcode, OP_CLOSE);
        let code = u16::from_be_bytes([close.payload[0], close.payload[1]]);
        assert_eq!(code, 1009);
    })
    .await;

    let mut options = WebSocketOptions::default();
    options.max_message_bytes = 1024;
    let client = Client::builder().websocket_options(options).build().unwrap();

    let mut ws = client.websocket(ws_uri(addr)).await.unwrap();
    let err = ws.recv().await.unwrap_err();
    assert!(err.is_too_large());
}

#[tokio::test]
async fn server_close_is_answered_once_and_surfaces_cleanly() {
    let addr = support::serve(1, |mut socket, _| async move {
        support::ws_server_handshake(&mut socket, None).await;
        let mut payload = vec![0x03, 0xe9]; // 1001 going away
        payload.extend_from_slice(b"maintenance");
        support::ws_write_frame(&mut socket, true, false, OP_CLOSE, &payload).await;
        let echoed = support::ws_read_frame(&mut socket).await;
        assert_eq!(echoed.opcode, OP_CLOSE);
    })
    .await;

    let client = Client::new();
    let mut ws = client.websocket(ws_uri(addr)).await.unwrap();
    assert!(ws.recv().await.unwrap().is_none());
    let close = ws.peer_close().unwrap();
    assert_eq!(close.code, 1001);
    assert_eq!(close.reason, "maintenance");
}
