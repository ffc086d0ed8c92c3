//! Shared helpers for the integration suites: scripted TCP peers.

#![allow(dead_code)]

use std::net::SocketAddr;

use base64::Engine;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Binds a listener and runs `script` for each accepted connection, up to
/// `connections` of them, on a background task.
pub async fn serve<F, Fut>(connections: usize, script: F) -> SocketAddr
where
    F: Fn(TcpStream, usize) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        for nth in 0..connections {
            let (socket, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => return,
            };
            tokio::spawn(script(socket, nth));
        }
    });
    addr
}

/// Reads until the end of an HTTP request head, returning the whole head.
pub async fn read_request_head(socket: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    while !buf.ends_with(b"\r\n\r\n") {
        let n = socket.read(&mut byte).await.unwrap();
        if n == 0 {
            break;
        }
        buf.push(byte[0]);
    }
    String::from_utf8(buf).unwrap()
}

/// Pulls one header value out of a raw request head.
pub fn header_value<'a>(head: &'a str, name: &str) -> Option<&'a str> {
    head.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.trim()
            .eq_ignore_ascii_case(name)
            .then(|| value.trim())
    })
}

// ===== websocket server bits =====

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

pub fn ws_accept(key: &str) -> String {
    let mut sha = Sha1::new();
    sha.update(key.as_bytes());
    sha.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(sha.finalize())
}

/// Completes a server-side upgrade, echoing the accept key. Returns the
/// client's `Sec-WebSocket-Extensions` offer, if any.
pub async fn ws_server_handshake(
    socket: &mut TcpStream,
    extensions_reply: Option<&str>,
) -> Option<String> {
    let head = read_request_head(socket).await;
    assert!(head.starts_with("GET "), "not an upgrade request: {}", head);
    let key = header_value(&head, "sec-websocket-key").expect("missing key");
    let offered = header_value(&head, "sec-websocket-extensions").map(str::to_owned);

    let mut response = format!(
        "HTTP/1.1 101 Switching Protocols\r\nupgrade: websocket\r\nconnection: Upgrade\r\nsec-websocket-accept: {}\r\n",
        ws_accept(key)
    );
    if let Some(extensions) = extensions_reply {
        response.push_str("sec-websocket-extensions: ");
        response.push_str(extensions);
        response.push_str("\r\n");
    }
    response.push_str("\r\n");
    socket.write_all(response.as_bytes()).await.unwrap();
    offered
}

pub struct WsFrame {
    pub fin: bool,
    pub rsv1: bool,
    pub opcode: u8,
    pub payload: Vec<u8>,
}

/// Reads one client frame, unmasking the payload.
pub async fn ws_read_frame(socket: &mut TcpStream) -> WsFrame {
    let mut head = [0u8; 2];
    socket.read_exact(&mut head).await.unwrap();
    let fin = head[0] & 0x80 != 0;
    let rsv1 = head[0] & 0x40 != 0;
    let opcode = head[0] & 0x0f;
    let masked = head[1] & 0x80 != 0;
    assert!(masked, "client frames must be masked");

    let mut len = (head[1] & 0x7f) as u64;
    if len == 126 {
        let mut ext = [0u8; 2];
        socket.read_exact(&mut ext).await.unwrap();
        len = u16::from_be_bytes(ext) as u64;
    } else if len == 127 {
        let mut ext = [0u8; 8];
        socket.read_exact(&mut ext).await.unwrap();
        len = u64::from_be_bytes(ext);
    }

    let mut key = [0u8; 4];
    socket.read_exact(&mut key).await.unwrap();
    let mut payload = vec![0u8; len as usize];
    socket.read_exact(&mut payload).await.unwrap();
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
    WsFrame {
        fin,
        rsv1,
        opcode,
        payload,
    }
}

/// Writes one unmasked server frame.
pub async fn ws_write_frame(
    socket: &mut TcpStream,
    fin: bool,
    rsv1: bool,
    opcode: u8,
    payload: &[u8],
) {
    let mut head = Vec::with_capacity(10 + payload.len());
    let mut b0 = opcode;
    if fin {
        b0 |= 0x80;
    }
    if rsv1 {
        b0 |= 0x40;
    }
    head.push(b0);
    if payload.len() <= 125 {
        head.push(payload.len() as u8);
    } else if payload.len() <= u16::MAX as usize {
        head.push(126);
        head.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    } else {
        head.push(127);
        head.extend_from_slice(&(payload.len() as u64).to_be_bytes());
    }
    head.extend_from_slice(payload);
    socket.write_all(&head).await.unwrap();
}

/// Deflates a server payload with sync-flush framing, tail stripped.
pub fn ws_deflate(payload: &[u8]) -> Vec<u8> {
    use flate2::{Compress, Compression, FlushCompress};
    let mut deflater = Compress::new(Compression::default(), false);
    let mut out = Vec::with_capacity(payload.len() + 64);
    let mut consumed = 0usize;
    loop {
        out.reserve(256.max(payload.len() / 4));
        let before = deflater.total_in() as usize;
        deflater
            .compress_vec(&payload[consumed..], &mut out, FlushCompress::Sync)
            .unwrap();
        consumed += deflater.total_in() as usize - before;
        if consumed == payload.len() && out.len() < out.capacity() {
            break;
        }
    }
    assert!(out.ends_with(&[0x00, 0x00, 0xff, 0xff]));
    out.truncate(out.len() - 4);
    out
}

/// Inflates a client payload (tail restored).
pub fn ws_inflate(payload: &[u8]) -> Vec<u8> {
    use flate2::{Decompress, FlushDecompress};
    let mut input = payload.to_vec();
    input.extend_from_slice(&[0x00, 0x00, 0xff, 0xff]);
    let mut inflater = Decompress::new(false);
    let mut out = Vec::with_capacity(input.len() * 4);
    let mut consumed = 0usize;
    loop {
        out.reserve(16 * 1024);
        let before = inflater.total_in() as usize;
        inflater
            .decompress_vec(&input[consumed..], &mut out, FlushDecompress::Sync)
            .unwrap();
        consumed += inflater.total_in() as usize - before;
        if consumed == input.len() && out.len() < out.capacity() {
            break;
        }
    }
    out
}
