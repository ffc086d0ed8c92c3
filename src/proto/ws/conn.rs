//! WebSocket connection: background reader, single-writer send path, close
//! handshake and keep-alive.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::client::connect::Transport;
use crate::client::options::WebSocketOptions;
use crate::common::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::proto::h1::io::BufferedIo;
use crate::request::Request;

use super::deflate::PerMessageDeflate;
use super::frame::{self, Opcode, MAX_CONTROL_PAYLOAD};
use super::handshake;

/// Bound on waiting for the peer's close frame after ours.
const CLOSE_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Received data messages buffered ahead of the consumer.
const RECV_QUEUE_DEPTH: usize = 32;

/// Masking streams through a scratch buffer of this size; payloads are never
/// copied whole.
const MASK_CHUNK: usize = 8 * 1024;

/// An application message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Text(String),
    Binary(Bytes),
}

/// Close code and reason received from (or sent to) the peer.
#[derive(Debug, Clone, PartialEq)]
pub struct CloseFrame {
    pub code: u16,
    pub reason: String,
}

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    None,
    Connecting,
    Open,
    Closing,
    Closed,
}

const STATE_NONE: u8 = 0;
const STATE_CONNECTING: u8 = 1;
const STATE_OPEN: u8 = 2;
const STATE_CLOSING: u8 = 3;
const STATE_CLOSED: u8 = 4;

struct MaskPool {
    rng: StdRng,
    buf: [u8; 128],
    at: usize,
}

impl MaskPool {
    fn new() -> MaskPool {
        let mut pool = MaskPool {
            rng: StdRng::from_entropy(),
            buf: [0u8; 128],
            at: 128,
        };
        pool.refill();
        pool
    }

    fn refill(&mut self) {
        self.rng.fill_bytes(&mut self.buf);
        self.at = 0;
    }

    fn next(&mut self) -> [u8; 4] {
        if self.at + 4 > self.buf.len() {
            self.refill();
        }
        let key = [
            self.buf[self.at],
            self.buf[self.at + 1],
            self.buf[self.at + 2],
            self.buf[self.at + 3],
        ];
        self.at += 4;
        key
    }
}

struct WsWriter {
    io: WriteHalf<Transport>,
    masks: MaskPool,
    scratch: Box<[u8; MASK_CHUNK]>,
}

struct WsShared {
    // capacity-1 lock serializing every outbound frame
    writer: tokio::sync::Mutex<WsWriter>,
    state: AtomicU8,
    close_frame_sent: AtomicBool,
    close_received: Notify,
    abort_notify: Notify,
    peer_close: Mutex<Option<CloseFrame>>,
    terminal: Mutex<Option<Error>>,
    deflate: Option<PerMessageDeflate>,
    options: WebSocketOptions,
    /// Application data only; control frames do not touch this.
    last_data_activity: Mutex<Instant>,
    /// Deadline by which a pong must arrive, when a ping is in flight.
    pong_deadline: Mutex<Option<Instant>>,
}

impl WsShared {
    fn state(&self) -> u8 {
        self.state.load(Ordering::SeqCst)
    }

    /// Compare-and-swap transition; an invalid transition reports failure
    /// rather than panicking.
    fn try_transition(&self, from: u8, to: u8) -> bool {
        self.state
            .compare_exchange(from, to, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn touch_data_activity(&self) {
        *self.last_data_activity.lock().unwrap() = Instant::now();
    }
}

/// A connected client WebSocket.
pub struct WebSocket {
    shared: Arc<WsShared>,
    incoming: mpsc::Receiver<Message>,
    subprotocol: Option<String>,
}

impl WebSocket {
    /// Upgrades an established transport. The transport must already point
    /// at the right peer (TLS included for `wss`).
    pub(crate) async fn upgrade(
        transport: Transport,
        req: &Request,
        options: WebSocketOptions,
        cancel: &CancelToken,
    ) -> Result<WebSocket> {
        let mut io = BufferedIo::new(transport);
        let outcome =
            handshake::handshake(&mut io, req, options.enable_deflate, cancel).await?;

        let (transport, leftover) = io.into_parts();
        let (read_half, write_half) = tokio::io::split(transport);

        let shared = Arc::new(WsShared {
            writer: tokio::sync::Mutex::new(WsWriter {
                io: write_half,
                masks: MaskPool::new(),
                scratch: Box::new([0u8; MASK_CHUNK]),
            }),
            state: AtomicU8::new(STATE_CONNECTING),
            close_frame_sent: AtomicBool::new(false),
            close_received: Notify::new(),
            abort_notify: Notify::new(),
            peer_close: Mutex::new(None),
            terminal: Mutex::new(None),
            deflate: outcome.deflate.then(PerMessageDeflate::new),
            options,
            last_data_activity: Mutex::new(Instant::now()),
            pong_deadline: Mutex::new(None),
        });
        shared.try_transition(STATE_CONNECTING, STATE_OPEN);

        let (tx, rx) = mpsc::channel(RECV_QUEUE_DEPTH);
        tokio::spawn(read_loop(
            BufferedIo::from_parts(read_half, leftover),
            shared.clone(),
            tx,
        ));
        if shared.options.ping_interval.is_some() || shared.options.idle_timeout.is_some() {
            tokio::spawn(keepalive_loop(shared.clone()));
        }

        Ok(WebSocket {
            shared,
            incoming: rx,
            subprotocol: outcome.subprotocol,
        })
    }

    pub fn ready_state(&self) -> ReadyState {
        match self.shared.state() {
            STATE_NONE => ReadyState::None,
            STATE_CONNECTING => ReadyState::Connecting,
            STATE_OPEN => ReadyState::Open,
            STATE_CLOSING => ReadyState::Closing,
            _ => ReadyState::Closed,
        }
    }

    pub fn subprotocol(&self) -> Option<&str> {
        self.subprotocol.as_deref()
    }

    /// The close frame the peer sent, once the handshake completed.
    pub fn peer_close(&self) -> Option<CloseFrame> {
        self.shared.peer_close.lock().unwrap().clone()
    }

    /// Sends one message, compressing when negotiated and profitable.
    pub async fn send(&self, message: Message) -> Result<()> {
        if self.shared.state() != STATE_OPEN {
            return Err(Error::new_network("websocket is not open"));
        }
        let (opcode, payload) = match &message {
            Message::Text(text) => (Opcode::Text, Bytes::copy_from_slice(text.as_bytes())),
            Message::Binary(data) => (Opcode::Binary, data.clone()),
        };

        let (rsv1, wire_payload) = match &self.shared.deflate {
            Some(pmd) if payload.len() >= 64 => {
                let compressed = pmd.compress(&payload)?;
                if compressed.len() < payload.len() {
                    (true, compressed)
                } else {
                    (false, payload)
                }
            }
            _ => (false, payload),
        };

        write_frame(&self.shared, true, rsv1, opcode, &wire_payload).await?;
        self.shared.touch_data_activity();
        Ok(())
    }

    /// Receives the next message. `Ok(None)` is a clean close; an abort
    /// surfaces its error exactly once.
    pub async fn recv(&mut self) -> Result<Option<Message>> {
        match self.incoming.recv().await {
            Some(message) => Ok(Some(message)),
            None => match self.shared.terminal.lock().unwrap().take() {
                Some(err) => Err(err),
                None => Ok(None),
            },
        }
    }

    /// Starts (or joins) the close handshake and waits for it to finish.
    pub async fn close(&self, code: u16, reason: &str) -> Result<()> {
        if !is_sendable_close_code(code) {
            return Err(Error::new_invalid_request(format!(
                "close code {} may not be sent",
                code
            )));
        }
        let reason = truncate_reason(reason);

        match self.shared.state() {
            STATE_CLOSED => return Ok(()),
            STATE_OPEN => {
                self.shared.try_transition(STATE_OPEN, STATE_CLOSING);
            }
            _ => {}
        }

        // At most one close frame leaves the wire, however many callers race.
        if !self.shared.close_frame_sent.swap(true, Ordering::SeqCst) {
            let mut payload = BytesMut::with_capacity(2 + reason.len());
            payload.extend_from_slice(&code.to_be_bytes());
            payload.extend_from_slice(reason.as_bytes());
            write_frame(&self.shared, true, false, Opcode::Close, &payload).await?;
        }

        // Bounded wait for the peer's close (or an abort).
        let wait = async {
            loop {
                if self.shared.peer_close.lock().unwrap().is_some()
                    || self.shared.state() == STATE_CLOSED
                {
                    return;
                }
                let notified = self.shared.close_received.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.shared.peer_close.lock().unwrap().is_some()
                    || self.shared.state() == STATE_CLOSED
                {
                    return;
                }
                notified.await;
            }
        };
        let _ = tokio::time::timeout(CLOSE_HANDSHAKE_TIMEOUT, wait).await;

        self.shared.state.store(STATE_CLOSED, Ordering::SeqCst);
        let mut writer = self.shared.writer.lock().await;
        let _ = writer.io.shutdown().await;
        Ok(())
    }
}

impl std::fmt::Debug for WebSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocket")
            .field("state", &self.ready_state())
            .finish()
    }
}

/// Close codes a client may put on the wire; 1005, 1006 and 1015 never.
fn is_sendable_close_code(code: u16) -> bool {
    matches!(code, 1000..=1003 | 1007..=1011 | 3000..=4999)
}

/// Codes valid when received in a close frame.
fn is_receivable_close_code(code: u16) -> bool {
    matches!(code, 1000..=1003 | 1007..=1014 | 3000..=4999)
}

/// Truncates to 123 UTF-8 bytes on a codepoint boundary.
fn truncate_reason(reason: &str) -> &str {
    if reason.len() <= 123 {
        return reason;
    }
    let mut end = 123;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}

/// Serializes one masked frame. The header and first payload chunk share a
/// single write; longer payloads stream through the scratch buffer without
/// a whole-payload copy.
async fn write_frame(
    shared: &Arc<WsShared>,
    fin: bool,
    rsv1: bool,
    opcode: Opcode,
    payload: &[u8],
) -> Result<()> {
    let mut writer = shared.writer.lock().await;
    let WsWriter { io, masks, scratch } = &mut *writer;
    let key = masks.next();

    let first_chunk = payload.len().min(MASK_CHUNK);
    let mut head = BytesMut::with_capacity(14 + first_chunk);
    frame::put_client_header(fin, rsv1, opcode, key, payload.len(), &mut head);

    scratch[..first_chunk].copy_from_slice(&payload[..first_chunk]);
    frame::apply_mask(key, 0, &mut scratch[..first_chunk]);
    head.extend_from_slice(&scratch[..first_chunk]);
    io.write_all(&head).await.map_err(Error::new_io)?;

    let mut offset = first_chunk;
    while offset < payload.len() {
        let len = (payload.len() - offset).min(MASK_CHUNK);
        scratch[..len].copy_from_slice(&payload[offset..offset + len]);
        frame::apply_mask(key, offset, &mut scratch[..len]);
        io.write_all(&scratch[..len]).await.map_err(Error::new_io)?;
        offset += len;
    }
    io.flush().await.map_err(Error::new_io)?;
    Ok(())
}

/// Marks the connection dead. Cleanup of reader-owned buffers happens on the
/// reader's own task when it observes the notify.
async fn abort(shared: &Arc<WsShared>, err: Error) {
    {
        let mut terminal = shared.terminal.lock().unwrap();
        if terminal.is_none() {
            *terminal = Some(err);
        }
    }
    shared.state.store(STATE_CLOSED, Ordering::SeqCst);
    shared.abort_notify.notify_waiters();
    shared.close_received.notify_waiters();
    let mut writer = shared.writer.lock().await;
    let _ = writer.io.shutdown().await;
}

// ===== read loop =====

struct Assembler {
    opcode: Option<Opcode>,
    compressed: bool,
    buf: BytesMut,
    fragments: usize,
}

impl Assembler {
    fn new() -> Assembler {
        Assembler {
            opcode: None,
            compressed: false,
            buf: BytesMut::new(),
            fragments: 0,
        }
    }

    fn reset(&mut self) {
        self.opcode = None;
        self.compressed = false;
        self.buf = BytesMut::new();
        self.fragments = 0;
    }
}

async fn read_loop(
    mut io: BufferedIo<ReadHalf<Transport>>,
    shared: Arc<WsShared>,
    tx: mpsc::Sender<Message>,
) {
    let mut assembler = Assembler::new();
    loop {
        let frame_result = tokio::select! {
            res = read_one_frame(&mut io, &shared, &mut assembler, &tx) => res,
            _ = shared.abort_notify.notified() => break,
        };
        match frame_result {
            Ok(ReadOutcome::Continue) => {}
            Ok(ReadOutcome::Closed) => break,
            Err(err) => {
                let code = close_code_for(&err);
                debug!("websocket reader failed: {}", err);
                if shared.state() == STATE_OPEN
                    && !shared.close_frame_sent.swap(true, Ordering::SeqCst)
                {
                    let mut payload = BytesMut::with_capacity(2);
                    payload.extend_from_slice(&code.to_be_bytes());
                    let _ = write_close_raw(&shared, &payload).await;
                }
                abort(&shared, err).await;
                break;
            }
        }
    }
    // tx drops here; the consumer sees end-of-stream.
}

/// Writes a close frame without the state checks of the public close path.
async fn write_close_raw(shared: &Arc<WsShared>, payload: &[u8]) -> Result<()> {
    write_frame(shared, true, false, Opcode::Close, payload).await
}

fn close_code_for(err: &Error) -> u16 {
    use crate::error::Kind;
    match err.kind() {
        Kind::MessageTooLarge | Kind::FrameTooLarge => 1009,
        Kind::Decompression => 1007,
        Kind::Protocol => 1002,
        _ => 1002,
    }
}

enum ReadOutcome {
    Continue,
    Closed,
}

async fn read_one_frame(
    io: &mut BufferedIo<ReadHalf<Transport>>,
    shared: &Arc<WsShared>,
    assembler: &mut Assembler,
    tx: &mpsc::Sender<Message>,
) -> Result<ReadOutcome> {
    let header = frame::read_header(io).await?;
    trace!(
        "ws frame opcode={:?} fin={} rsv1={} len={}",
        header.opcode,
        header.fin,
        header.rsv1,
        header.payload_len
    );

    if header.mask.is_some() && !shared.options.allow_masked_frames {
        return Err(Error::new_protocol("server frames must not be masked"));
    }
    if header.rsv2 || header.rsv3 {
        return Err(Error::new_protocol("unnegotiated RSV bit set"));
    }

    if header.opcode.is_control() {
        if !header.fin {
            return Err(Error::new_protocol("fragmented control frame"));
        }
        if header.payload_len > MAX_CONTROL_PAYLOAD as u64 {
            return Err(Error::new_protocol("control frame payload above 125"));
        }
        if header.rsv1 {
            return Err(Error::new_protocol("compressed control frame"));
        }
        let payload = read_payload(io, &header).await?;
        return handle_control(shared, header.opcode, payload).await;
    }

    // data frames
    match header.opcode {
        Opcode::Text | Opcode::Binary => {
            if assembler.opcode.is_some() {
                return Err(Error::new_protocol(
                    "new data message inside a fragment sequence",
                ));
            }
            if header.rsv1 && shared.deflate.is_none() {
                return Err(Error::new_protocol("unnegotiated RSV1 bit set"));
            }
            assembler.opcode = Some(header.opcode);
            assembler.compressed = header.rsv1;
        }
        Opcode::Continuation => {
            if assembler.opcode.is_none() {
                return Err(Error::new_protocol("continuation without a message"));
            }
            // RSV1 belongs to the first frame of a message only
            if header.rsv1 {
                return Err(Error::new_protocol("RSV1 on a continuation frame"));
            }
        }
        _ => unreachable!("control handled above"),
    }

    assembler.fragments += 1;
    if assembler.fragments > shared.options.max_fragments {
        return Err(Error::new_message_too_large());
    }
    let max = shared.options.max_message_bytes;
    if header.payload_len > max as u64 {
        return Err(Error::new_frame_too_large());
    }
    if assembler.buf.len() as u64 + header.payload_len > max as u64 {
        return Err(Error::new_message_too_large());
    }

    let payload = read_payload(io, &header).await?;
    assembler.buf.extend_from_slice(&payload);

    if !header.fin {
        return Ok(ReadOutcome::Continue);
    }

    let opcode = assembler.opcode.take().expect("message in progress");
    let raw = std::mem::take(&mut assembler.buf).freeze();
    let compressed = assembler.compressed;
    assembler.reset();

    let data = if compressed {
        let pmd = shared.deflate.as_ref().expect("checked at first frame");
        pmd.decompress(&raw, max)?
    } else {
        raw
    };

    let message = match opcode {
        Opcode::Text => {
            let text = String::from_utf8(data.to_vec())
                .map_err(|_| Error::new_protocol("text message is not valid utf-8"))?;
            Message::Text(text)
        }
        _ => Message::Binary(data),
    };

    shared.touch_data_activity();
    if tx.send(message).await.is_err() {
        // consumer dropped the socket; stop reading
        return Ok(ReadOutcome::Closed);
    }
    Ok(ReadOutcome::Continue)
}

async fn read_payload(
    io: &mut BufferedIo<ReadHalf<Transport>>,
    header: &frame::FrameHeader,
) -> Result<Bytes> {
    let len = header.payload_len as usize;
    let mut payload = BytesMut::with_capacity(len);
    while payload.len() < len {
        if !io.has_buffered_input() {
            if io.fill().await.map_err(Error::new_io)? == 0 {
                return Err(Error::new_abnormal_closure(
                    "connection closed inside a frame",
                ));
            }
        }
        let taken = io.take(len - payload.len());
        payload.extend_from_slice(&taken);
    }
    let mut payload = payload;
    if let Some(key) = header.mask {
        frame::apply_mask(key, 0, &mut payload);
    }
    Ok(payload.freeze())
}

async fn handle_control(
    shared: &Arc<WsShared>,
    opcode: Opcode,
    payload: Bytes,
) -> Result<ReadOutcome> {
    match opcode {
        Opcode::Ping => {
            // echoed inline; never enqueued to the data queue
            write_frame(shared, true, false, Opcode::Pong, &payload).await?;
            Ok(ReadOutcome::Continue)
        }
        Opcode::Pong => {
            *shared.pong_deadline.lock().unwrap() = None;
            Ok(ReadOutcome::Continue)
        }
        Opcode::Close => {
            let close = parse_close_payload(&payload)?;
            debug!("peer close: {:?}", close);
            {
                let mut peer_close = shared.peer_close.lock().unwrap();
                if peer_close.is_none() {
                    *peer_close = Some(close.clone());
                }
            }
            shared.close_received.notify_waiters();

            if shared.try_transition(STATE_OPEN, STATE_CLOSING) {
                // we did not initiate: answer with one close frame
                if !shared.close_frame_sent.swap(true, Ordering::SeqCst) {
                    let mut reply = BytesMut::with_capacity(2);
                    reply.extend_from_slice(&close.code.to_be_bytes());
                    let _ = write_close_raw(shared, &reply).await;
                }
            }
            shared.state.store(STATE_CLOSED, Ordering::SeqCst);
            shared.close_received.notify_waiters();
            Ok(ReadOutcome::Closed)
        }
        _ => unreachable!("not a control opcode"),
    }
}

fn parse_close_payload(payload: &[u8]) -> Result<CloseFrame> {
    match payload.len() {
        0 => Ok(CloseFrame {
            code: 1005,
            reason: String::new(),
        }),
        1 => Err(Error::new_protocol("close frame with one-byte payload")),
        _ => {
            let code = u16::from_be_bytes([payload[0], payload[1]]);
            if !is_receivable_close_code(code) {
                return Err(Error::new_protocol(format!(
                    "invalid close code {} on the wire",
                    code
                )));
            }
            let reason = std::str::from_utf8(&payload[2..])
                .map_err(|_| Error::new_protocol("close reason is not valid utf-8"))?
                .to_owned();
            Ok(CloseFrame { code, reason })
        }
    }
}

// ===== keep-alive =====

async fn keepalive_loop(shared: Arc<WsShared>) {
    let mut next_ping = shared
        .options
        .ping_interval
        .map(|interval| Instant::now() + interval);

    loop {
        if shared.state() >= STATE_CLOSING {
            return;
        }

        let pong_deadline = *shared.pong_deadline.lock().unwrap();
        let idle_deadline = shared.options.idle_timeout.map(|idle| {
            *shared.last_data_activity.lock().unwrap() + idle
        });

        let mut wake = next_ping;
        for candidate in [pong_deadline, idle_deadline] {
            if let Some(at) = candidate {
                wake = Some(wake.map_or(at, |cur| cur.min(at)));
            }
        }
        let Some(wake) = wake else { return };

        tokio::select! {
            _ = tokio::time::sleep_until(wake) => {}
            _ = shared.abort_notify.notified() => return,
        }
        let now = Instant::now();

        let pong_deadline = *shared.pong_deadline.lock().unwrap();
        if let Some(deadline) = pong_deadline {
            if now >= deadline {
                warn!("pong not received in time, aborting");
                abort(&shared, Error::new_pong_timeout()).await;
                return;
            }
        }
        if let Some(idle) = shared.options.idle_timeout {
            if now >= *shared.last_data_activity.lock().unwrap() + idle {
                abort(&shared, Error::new_abnormal_closure("idle timeout")).await;
                return;
            }
        }
        if let (Some(at), Some(interval)) = (next_ping, shared.options.ping_interval) {
            if now >= at {
                if shared.state() == STATE_OPEN {
                    if let Err(err) = write_frame(&shared, true, false, Opcode::Ping, b"").await {
                        abort(&shared, err).await;
                        return;
                    }
                    let mut pending = shared.pong_deadline.lock().unwrap();
                    if pending.is_none() {
                        *pending = Some(now + shared.options.pong_timeout);
                    }
                }
                next_ping = Some(at + interval);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sendable_close_codes() {
        assert!(is_sendable_close_code(1000));
        assert!(is_sendable_close_code(4999));
        assert!(!is_sendable_close_code(1005));
        assert!(!is_sendable_close_code(1006));
        assert!(!is_sendable_close_code(1015));
        assert!(!is_sendable_close_code(999));
        assert!(!is_sendable_close_code(2999));
    }

    #[test]
    fn reason_truncated_on_codepoint_boundary() {
        let reason = "é".repeat(100); // 200 bytes
        let truncated = truncate_reason(&reason);
        assert!(truncated.len() <= 123);
        assert_eq!(truncated.len() % 2, 0);
        assert!(std::str::from_utf8(truncated.as_bytes()).is_ok());
    }

    #[test]
    fn close_payload_parsing() {
        assert_eq!(parse_close_payload(&[]).unwrap().code, 1005);
        assert!(parse_close_payload(&[0x03]).is_err());
        let frame = parse_close_payload(&[0x03, 0xe8, b'b', b'y', b'e']).unwrap();
        assert_eq!(frame.code, 1000);
        assert_eq!(frame.reason, "bye");
        // 1006 must never appear on the wire
        assert!(parse_close_payload(&[0x03, 0xee]).is_err());
    }

    #[test]
    fn mask_pool_yields_fresh_keys() {
        let mut pool = MaskPool::new();
        let keys: Vec<[u8; 4]> = (0..64).map(|_| pool.next()).collect();
        let distinct: std::collections::HashSet<_> = keys.iter().collect();
        assert!(distinct.len() > 32);
    }
}
