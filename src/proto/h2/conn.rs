//! Multiplexed HTTP/2 client connection.
//!
//! One background task reads frames and dispatches them to per-stream state;
//! senders serialize frame emission through a single writer lock. The stream
//! map is guarded by one mutex, and no lock is ever held across an await of
//! the transport.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, StatusCode};
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use crate::client::connect::Transport;
use crate::common::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::request::Request;

use super::complete::{CompletionPool, Producer};
use super::frame::{self, error_code, flags, kind, Frame, FrameHeader, Settings};
use super::hpack;

/// How long to wait for the peer to acknowledge our SETTINGS.
const SETTINGS_ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Headers that must not appear on an HTTP/2 message in either direction.
const CONNECTION_SPECIFIC: [&str; 5] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, Clone)]
pub(crate) struct H2Options {
    pub(crate) initial_window_size: u32,
    pub(crate) max_concurrent_streams: u32,
    pub(crate) max_frame_size: u32,
    pub(crate) max_header_block_bytes: usize,
    pub(crate) max_response_body_bytes: usize,
}

/// A fully received response, before the client facade dresses it up.
#[derive(Debug)]
pub(crate) struct ResponseParts {
    pub(crate) status: StatusCode,
    pub(crate) headers: HeaderMap,
    pub(crate) body: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Open,
    HalfClosedLocal,
}

struct StreamSlot {
    state: StreamState,
    send_window: i64,
    recv_window: i64,
    status: Option<StatusCode>,
    headers: HeaderMap,
    body: BytesMut,
    producer: Option<Producer<ResponseParts>>,
}

enum CloseCause {
    Io(String),
    Protocol(String),
}

impl CloseCause {
    fn to_error(&self) -> Error {
        match self {
            CloseCause::Io(msg) => Error::new_network(msg.clone()),
            CloseCause::Protocol(msg) => Error::new_protocol(msg.clone()),
        }
    }
}

struct ConnState {
    streams: HashMap<u32, StreamSlot>,
    next_stream_id: u32,
    active_streams: u32,
    /// Peer GOAWAY: streams above this id will never complete here.
    goaway: Option<u32>,
    closed: Option<CloseCause>,
    peer_settings: Settings,
    conn_send_window: i64,
    conn_recv_window: i64,
}

struct Writer {
    io: WriteHalf<Transport>,
    hpack: hpack::Encoder,
    buf: BytesMut,
}

/// Resettable one-shot used for the SETTINGS ACK wait; combined with a
/// linked cancellation rather than a spawned timer task.
struct AckSignal {
    acked: AtomicBool,
    notify: Notify,
}

impl AckSignal {
    fn new() -> AckSignal {
        AckSignal {
            acked: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    fn set(&self) {
        if !self.acked.swap(true, Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }

    async fn wait(&self) {
        loop {
            if self.acked.load(Ordering::SeqCst) {
                return;
            }
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.acked.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }
}

struct Shared {
    writer: tokio::sync::Mutex<Writer>,
    state: Mutex<ConnState>,
    settings_acked: AckSignal,
    /// Woken on WINDOW_UPDATE, SETTINGS and stream slot changes.
    window_changed: Notify,
    options: H2Options,
    completions: Arc<CompletionPool<ResponseParts>>,
}

#[derive(Clone)]
pub(crate) struct H2Connection {
    shared: Arc<Shared>,
}

impl H2Connection {
    /// Sends the preface and client SETTINGS, spawns the read loop and waits
    /// (bounded) for the peer to acknowledge our settings.
    pub(crate) async fn handshake(
        transport: Transport,
        options: H2Options,
        cancel: &CancelToken,
    ) -> Result<H2Connection> {
        let (read_half, mut write_half) = tokio::io::split(transport);

        let mut opening = BytesMut::with_capacity(frame::PREFACE.len() + 64);
        opening.extend_from_slice(frame::PREFACE);

        let mut settings_payload = BytesMut::new();
        Settings::encode_client(
            4096,
            options.max_concurrent_streams,
            options.initial_window_size,
            options.max_frame_size,
            &mut settings_payload,
        );
        FrameHeader {
            length: settings_payload.len() as u32,
            kind: kind::SETTINGS,
            flags: 0,
            stream_id: 0,
        }
        .put(&mut opening);
        opening.extend_from_slice(&settings_payload);

        // Raise the connection receive window to our configured size; the
        // RFC fixes its starting value at 65 535 regardless of SETTINGS.
        let conn_recv_window = i64::from(options.initial_window_size).max(65_535);
        if conn_recv_window > 65_535 {
            FrameHeader {
                length: 4,
                kind: kind::WINDOW_UPDATE,
                flags: 0,
                stream_id: 0,
            }
            .put(&mut opening);
            opening.extend_from_slice(&((conn_recv_window - 65_535) as u32).to_be_bytes());
        }

        write_half
            .write_all(&opening)
            .await
            .map_err(Error::new_io)?;
        write_half.flush().await.map_err(Error::new_io)?;

        let completions = CompletionPool::new(options.max_concurrent_streams as usize);
        let shared = Arc::new(Shared {
            writer: tokio::sync::Mutex::new(Writer {
                io: write_half,
                hpack: hpack::Encoder::new(4096),
                buf: BytesMut::with_capacity(1024),
            }),
            state: Mutex::new(ConnState {
                streams: HashMap::new(),
                next_stream_id: 1,
                active_streams: 0,
                goaway: None,
                closed: None,
                peer_settings: Settings::default(),
                conn_send_window: 65_535,
                conn_recv_window,
            }),
            settings_acked: AckSignal::new(),
            window_changed: Notify::new(),
            options,
            completions,
        });

        tokio::spawn(read_loop(read_half, shared.clone()));

        // Bounded wait on the resettable ack signal.
        let deadline = cancel.with_deadline(tokio::time::Instant::now() + SETTINGS_ACK_TIMEOUT);
        tokio::select! {
            _ = shared.settings_acked.wait() => {}
            _ = deadline.canceled() => return Err(deadline.error()),
        }

        Ok(H2Connection { shared })
    }

    /// Whether new streams may still be allocated here.
    pub(crate) fn is_open(&self) -> bool {
        let state = self.shared.state.lock().unwrap();
        state.closed.is_none() && state.goaway.is_none()
    }

    /// Best-effort graceful shutdown.
    pub(crate) async fn close(&self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.closed.is_none() {
                state.closed = Some(CloseCause::Io("connection closed locally".into()));
            }
        }
        let mut writer = self.shared.writer.lock().await;
        let mut payload = BytesMut::with_capacity(8);
        payload.extend_from_slice(&0u32.to_be_bytes());
        payload.extend_from_slice(&error_code::NO_ERROR.to_be_bytes());
        let _ = write_frame(&mut writer, kind::GOAWAY, 0, 0, &payload).await;
        let _ = writer.io.shutdown().await;
    }

    /// Sends one request over a new stream and awaits its response.
    pub(crate) async fn send_request(
        &self,
        req: &Request,
        cancel: &CancelToken,
    ) -> Result<ResponseParts> {
        let fields = request_fields(req)?;
        let has_body = req.body().map(|b| !b.is_empty()).unwrap_or(false);

        let (stream_id, consumer) = self.allocate_stream(cancel).await?;

        let sent = self
            .send_headers_and_body(stream_id, &fields, req.body(), has_body, cancel)
            .await;
        if let Err(err) = sent {
            self.abort_stream(stream_id, error_code::CANCEL).await;
            drop(consumer);
            return Err(err);
        }

        tokio::select! {
            res = consumer => res,
            _ = cancel.canceled() => {
                // The cancellation path only unhooks the stream from the map;
                // the read loop keeps ownership of anything it is writing to
                // and observes the removal at its next dispatch.
                self.abort_stream(stream_id, error_code::CANCEL).await;
                Err(cancel.error())
            }
        }
    }

    async fn allocate_stream(
        &self,
        cancel: &CancelToken,
    ) -> Result<(u32, super::complete::Consumer<ResponseParts>)> {
        loop {
            {
                let mut state = self.shared.state.lock().unwrap();
                if let Some(cause) = &state.closed {
                    return Err(cause.to_error());
                }
                // Re-checked under the same lock that assigns ids: a GOAWAY
                // that landed while we waited refuses the new stream.
                if state.goaway.is_some() {
                    return Err(Error::new_network("connection is going away"));
                }
                let limit = self
                    .shared
                    .options
                    .max_concurrent_streams
                    .min(state.peer_settings.max_concurrent_streams.unwrap_or(u32::MAX));
                if state.active_streams < limit {
                    let stream_id = state.next_stream_id;
                    state.next_stream_id += 2;
                    state.active_streams += 1;
                    let (producer, consumer) = self.shared.completions.checkout();
                    let send_window = i64::from(state.peer_settings.initial_window_size);
                    state.streams.insert(
                        stream_id,
                        StreamSlot {
                            state: StreamState::Open,
                            send_window,
                            recv_window: i64::from(self.shared.options.initial_window_size),
                            status: None,
                            headers: HeaderMap::new(),
                            body: BytesMut::new(),
                            producer: Some(producer),
                        },
                    );
                    trace!("allocated h2 stream {}", stream_id);
                    return Ok((stream_id, consumer));
                }
            }
            let notified = self.shared.window_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            tokio::select! {
                _ = &mut notified => {}
                _ = cancel.canceled() => return Err(cancel.error()),
            }
        }
    }

    async fn send_headers_and_body(
        &self,
        stream_id: u32,
        fields: &[(Vec<u8>, Vec<u8>)],
        body: Option<&Bytes>,
        has_body: bool,
        cancel: &CancelToken,
    ) -> Result<()> {
        let max_frame = {
            let state = self.shared.state.lock().unwrap();
            state.peer_settings.max_frame_size as usize
        };

        {
            // One writer hold for the whole header block: nothing may
            // interleave between HEADERS and its CONTINUATIONs.
            let mut writer = self.shared.writer.lock().await;
            let borrowed: Vec<(&[u8], &[u8])> = fields
                .iter()
                .map(|(n, v)| (n.as_slice(), v.as_slice()))
                .collect();
            let mut block = BytesMut::new();
            writer.hpack.encode(&borrowed, &mut block);

            let mut first = true;
            let mut remaining = block.freeze();
            loop {
                let take = remaining.len().min(max_frame);
                let chunk = remaining.split_to(take);
                let last = remaining.is_empty();
                let mut frame_flags = 0u8;
                if last {
                    frame_flags |= flags::END_HEADERS;
                }
                if first && !has_body {
                    frame_flags |= flags::END_STREAM;
                }
                let frame_kind = if first { kind::HEADERS } else { kind::CONTINUATION };
                write_frame(&mut writer, frame_kind, frame_flags, stream_id, &chunk)
                    .await
                    .map_err(Error::new_io)?;
                first = false;
                if last {
                    break;
                }
            }
            writer.io.flush().await.map_err(Error::new_io)?;
        }

        if !has_body {
            self.mark_half_closed_local(stream_id);
            return Ok(());
        }

        let body = body.expect("has_body implies body").clone();
        let mut offset = 0usize;
        while offset < body.len() {
            let allowance = loop {
                match self.reserve_window(stream_id, body.len() - offset, max_frame)? {
                    Reservation::Granted(n) => break n,
                    Reservation::StreamGone => {
                        // Peer finished or reset the stream early; stop
                        // pushing body and let the completion decide.
                        return Ok(());
                    }
                    Reservation::Wait => {
                        let notified = self.shared.window_changed.notified();
                        tokio::pin!(notified);
                        notified.as_mut().enable();
                        tokio::select! {
                            _ = &mut notified => {}
                            _ = cancel.canceled() => return Err(cancel.error()),
                        }
                    }
                }
            };

            let end = offset + allowance;
            let last = end == body.len();
            let chunk = body.slice(offset..end);
            let mut writer = self.shared.writer.lock().await;
            write_frame(
                &mut writer,
                kind::DATA,
                if last { flags::END_STREAM } else { 0 },
                stream_id,
                &chunk,
            )
            .await
            .map_err(Error::new_io)?;
            writer.io.flush().await.map_err(Error::new_io)?;
            drop(writer);
            offset = end;
        }

        self.mark_half_closed_local(stream_id);
        Ok(())
    }

    fn mark_half_closed_local(&self, stream_id: u32) {
        let mut state = self.shared.state.lock().unwrap();
        if let Some(slot) = state.streams.get_mut(&stream_id) {
            slot.state = StreamState::HalfClosedLocal;
        }
    }

    fn reserve_window(
        &self,
        stream_id: u32,
        remaining: usize,
        max_frame: usize,
    ) -> Result<Reservation> {
        let mut state = self.shared.state.lock().unwrap();
        if let Some(cause) = &state.closed {
            return Err(cause.to_error());
        }
        let conn_window = state.conn_send_window;
        let slot = match state.streams.get_mut(&stream_id) {
            Some(slot) => slot,
            None => return Ok(Reservation::StreamGone),
        };
        debug_assert!(
            slot.state == StreamState::Open,
            "sending on a half-closed stream"
        );
        let allowance = conn_window
            .min(slot.send_window)
            .min(remaining as i64)
            .min(max_frame as i64);
        if allowance <= 0 {
            return Ok(Reservation::Wait);
        }
        slot.send_window -= allowance;
        state.conn_send_window -= allowance;
        Ok(Reservation::Granted(allowance as usize))
    }

    /// Unhooks a canceled stream and tells the peer. Buffer teardown is the
    /// read loop's job; removal from the map is the coherent handoff point.
    async fn abort_stream(&self, stream_id: u32, code: u32) {
        let removed = {
            let mut state = self.shared.state.lock().unwrap();
            let removed = state.streams.remove(&stream_id);
            if removed.is_some() {
                state.active_streams -= 1;
            }
            removed
        };
        if removed.is_some() {
            self.shared.window_changed.notify_waiters();
            let mut writer = self.shared.writer.lock().await;
            let mut payload = BytesMut::with_capacity(4);
            payload.extend_from_slice(&code.to_be_bytes());
            let _ = write_frame(&mut writer, kind::RST_STREAM, 0, stream_id, &payload).await;
            let _ = writer.io.flush().await;
        }
    }
}

enum Reservation {
    Granted(usize),
    Wait,
    StreamGone,
}

async fn write_frame(
    writer: &mut Writer,
    frame_kind: u8,
    frame_flags: u8,
    stream_id: u32,
    payload: &[u8],
) -> io::Result<()> {
    writer.buf.clear();
    FrameHeader {
        length: payload.len() as u32,
        kind: frame_kind,
        flags: frame_flags,
        stream_id,
    }
    .put(&mut writer.buf);
    let header = writer.buf.split().freeze();
    writer.io.write_all(&header).await?;
    writer.io.write_all(payload).await?;
    Ok(())
}

/// Builds the HPACK field list: pseudo-headers first, then regular headers
/// one entry per value. Connection-specific headers are rejected before any
/// byte is emitted.
fn request_fields(req: &Request) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    for name in CONNECTION_SPECIFIC {
        if req.headers().contains_key(name) {
            return Err(Error::new_invalid_request(format!(
                "connection-specific header {} is not allowed on http/2",
                name
            )));
        }
    }

    let mut fields: Vec<(Vec<u8>, Vec<u8>)> = Vec::with_capacity(req.headers().len() + 4);
    fields.push((b":method".to_vec(), req.method().as_str().as_bytes().to_vec()));
    fields.push((b":scheme".to_vec(), req.scheme().as_str().as_bytes().to_vec()));

    let host = req.uri().host().expect("validated at build");
    let mut authority = if host.contains(':') && !host.starts_with('[') {
        format!("[{}]", host)
    } else {
        host.to_owned()
    };
    if let Some(port) = req.uri().port_u16() {
        let default = if req.is_tls() { 443 } else { 80 };
        if port != default {
            authority.push(':');
            authority.push_str(&port.to_string());
        }
    }
    fields.push((b":authority".to_vec(), authority.into_bytes()));

    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    fields.push((b":path".to_vec(), path.as_bytes().to_vec()));

    for (name, value) in req.headers() {
        if *name == http::header::HOST {
            continue;
        }
        fields.push((
            name.as_str().as_bytes().to_vec(),
            value.as_bytes().to_vec(),
        ));
    }
    Ok(fields)
}

// ===== read loop =====

struct HeaderAssembly {
    stream_id: u32,
    end_stream: bool,
    block: BytesMut,
}

async fn read_loop(mut io: ReadHalf<Transport>, shared: Arc<Shared>) {
    let mut decoder = hpack::Decoder::new(4096, shared.options.max_header_block_bytes);
    let mut assembling: Option<HeaderAssembly> = None;

    loop {
        let frame = match frame::read_frame(&mut io, shared.options.max_frame_size).await {
            Ok(frame) => frame,
            Err(err) => {
                close_connection(&shared, CloseCause::Io(err.to_string())).await;
                return;
            }
        };
        trace!(
            "h2 frame kind={} flags={:#x} stream={} len={}",
            frame.header.kind,
            frame.header.flags,
            frame.header.stream_id,
            frame.header.length
        );

        if let Some(assembly) = &assembling {
            if frame.header.kind != kind::CONTINUATION
                || frame.header.stream_id != assembly.stream_id
            {
                close_connection(
                    &shared,
                    CloseCause::Protocol("expected CONTINUATION".into()),
                )
                .await;
                return;
            }
        }

        let result = match frame.header.kind {
            kind::DATA => on_data(&shared, frame).await,
            kind::HEADERS | kind::CONTINUATION => {
                on_headers(&shared, frame, &mut assembling, &mut decoder).await
            }
            kind::RST_STREAM => on_rst_stream(&shared, frame),
            kind::SETTINGS => on_settings(&shared, frame).await,
            kind::PING => on_ping(&shared, frame).await,
            kind::GOAWAY => on_goaway(&shared, frame),
            kind::WINDOW_UPDATE => on_window_update(&shared, frame),
            kind::PUSH_PROMISE => {
                // ENABLE_PUSH=0 makes any promise a protocol error.
                send_goaway(&shared, error_code::PROTOCOL_ERROR).await;
                Err(CloseCause::Protocol("server push is disabled".into()))
            }
            kind::PRIORITY => Ok(()),
            other => {
                trace!("ignoring unknown frame kind {}", other);
                Ok(())
            }
        };

        if let Err(cause) = result {
            close_connection(&shared, cause).await;
            return;
        }
    }
}

async fn on_data(shared: &Arc<Shared>, frame: Frame) -> std::result::Result<(), CloseCause> {
    let mut payload = frame.payload;
    frame::strip_padding(&frame.header, &mut payload)
        .map_err(|e| CloseCause::Protocol(e.to_string()))?;
    let len = frame.header.length as i64;
    let end_stream = frame.header.has(flags::END_STREAM);

    let (conn_update, stream_update, completed, overflow) = {
        let mut state = self_state(shared);
        // The connection window pays for every DATA frame, even one for a
        // stream that was already canceled or reset.
        state.conn_recv_window -= len;
        let initial = i64::from(shared.options.initial_window_size);
        let conn_update = if state.conn_recv_window < initial / 2 {
            let add = initial - state.conn_recv_window;
            state.conn_recv_window += add;
            Some(add as u32)
        } else {
            None
        };

        let mut stream_update = None;
        let mut completed = None;
        let mut overflow = false;
        if let Some(slot) = state.streams.get_mut(&frame.header.stream_id) {
            slot.recv_window -= len;
            if !end_stream && slot.recv_window < initial / 2 {
                let add = initial - slot.recv_window;
                slot.recv_window += add;
                stream_update = Some(add as u32);
            }
            if slot.body.len() + payload.len() > shared.options.max_response_body_bytes {
                overflow = true;
            } else {
                slot.body.extend_from_slice(&payload);
                if end_stream {
                    completed = Some(frame.header.stream_id);
                }
            }
        }
        if overflow {
            fail_stream_locked(
                &mut state,
                frame.header.stream_id,
                Error::new_network("body too large"),
            );
        }
        (conn_update, stream_update, completed, overflow)
    };

    if overflow {
        shared.window_changed.notify_waiters();
        let mut writer = shared.writer.lock().await;
        let mut payload = BytesMut::with_capacity(4);
        payload.extend_from_slice(&error_code::FLOW_CONTROL_ERROR.to_be_bytes());
        let _ = write_frame(
            &mut writer,
            kind::RST_STREAM,
            0,
            frame.header.stream_id,
            &payload,
        )
        .await;
        let _ = writer.io.flush().await;
    }

    if conn_update.is_some() || stream_update.is_some() {
        let mut writer = shared.writer.lock().await;
        if let Some(add) = conn_update {
            let _ = write_frame(&mut writer, kind::WINDOW_UPDATE, 0, 0, &add.to_be_bytes()).await;
        }
        if let Some(add) = stream_update {
            let _ = write_frame(
                &mut writer,
                kind::WINDOW_UPDATE,
                0,
                frame.header.stream_id,
                &add.to_be_bytes(),
            )
            .await;
        }
        let _ = writer.io.flush().await;
    }

    if let Some(stream_id) = completed {
        complete_stream(shared, stream_id);
    }
    Ok(())
}

async fn on_headers(
    shared: &Arc<Shared>,
    frame: Frame,
    assembling: &mut Option<HeaderAssembly>,
    decoder: &mut hpack::Decoder,
) -> std::result::Result<(), CloseCause> {
    let mut payload = frame.payload;
    let stream_id = frame.header.stream_id;

    if frame.header.kind == kind::HEADERS {
        if stream_id == 0 || stream_id % 2 == 0 {
            return Err(CloseCause::Protocol("HEADERS on an invalid stream".into()));
        }
        frame::strip_padding(&frame.header, &mut payload)
            .map_err(|e| CloseCause::Protocol(e.to_string()))?;
        frame::strip_priority(&frame.header, &mut payload)
            .map_err(|e| CloseCause::Protocol(e.to_string()))?;
        let mut block = BytesMut::with_capacity(payload.len());
        block.extend_from_slice(&payload);
        *assembling = Some(HeaderAssembly {
            stream_id,
            end_stream: frame.header.has(flags::END_STREAM),
            block,
        });
    } else {
        let assembly = assembling
            .as_mut()
            .ok_or_else(|| CloseCause::Protocol("CONTINUATION without HEADERS".into()))?;
        assembly.block.extend_from_slice(&payload);
    }

    let assembly = assembling.as_mut().expect("assembly set above");
    if assembly.block.len() > shared.options.max_header_block_bytes {
        return Err(CloseCause::Protocol("header block too large".into()));
    }
    if !frame.header.has(flags::END_HEADERS) {
        return Ok(());
    }

    let assembly = assembling.take().expect("assembly set above");
    // The HPACK state must advance even if the stream is gone.
    let fields = decoder
        .decode(&assembly.block)
        .map_err(|e| CloseCause::Protocol(e.to_string()))?;

    apply_header_block(shared, assembly.stream_id, assembly.end_stream, fields);
    Ok(())
}

fn apply_header_block(
    shared: &Arc<Shared>,
    stream_id: u32,
    end_stream: bool,
    fields: Vec<(Bytes, Bytes)>,
) {
    enum Outcome {
        Complete,
        Failed,
        Keep,
    }

    let outcome = {
        let mut state = self_state(shared);
        let Some(slot) = state.streams.get_mut(&stream_id) else {
            trace!("discarding header block for unknown stream {}", stream_id);
            return;
        };

        let verdict = validate_response_fields(&fields, slot.status.is_some());
        let failure = match verdict {
            Ok(ValidatedBlock::Initial { status, headers }) => {
                if status.is_informational() {
                    // Interim responses carry no END_STREAM; discard them
                    // and keep waiting for the final block.
                    if end_stream {
                        Some(Error::new_protocol("informational response ended stream"))
                    } else {
                        None
                    }
                } else {
                    slot.status = Some(status);
                    slot.headers = headers;
                    None
                }
            }
            Ok(ValidatedBlock::Trailers { headers }) => {
                if end_stream {
                    for (name, value) in headers {
                        slot.headers.append(name, value);
                    }
                    None
                } else {
                    Some(Error::new_protocol("trailers without END_STREAM"))
                }
            }
            Err(err) => Some(err),
        };

        match failure {
            Some(err) => {
                fail_stream_locked(&mut state, stream_id, err);
                Outcome::Failed
            }
            None if end_stream => Outcome::Complete,
            None => Outcome::Keep,
        }
    };

    match outcome {
        Outcome::Complete => complete_stream(shared, stream_id),
        Outcome::Failed => shared.window_changed.notify_waiters(),
        Outcome::Keep => {}
    }
}

enum ValidatedBlock {
    Initial {
        status: StatusCode,
        headers: HeaderMap,
    },
    Trailers {
        headers: Vec<(HeaderName, HeaderValue)>,
    },
}

/// Pseudo-headers must come first and only `:status` is allowed on a
/// response; connection-specific headers are refused on receipt.
fn validate_response_fields(
    fields: &[(Bytes, Bytes)],
    has_status: bool,
) -> Result<ValidatedBlock> {
    let mut status: Option<StatusCode> = None;
    let mut headers = Vec::new();
    let mut seen_regular = false;

    for (name, value) in fields {
        if name.starts_with(b":") {
            if seen_regular {
                return Err(Error::new_protocol("pseudo-header after regular header"));
            }
            if &name[..] != b":status" {
                return Err(Error::new_protocol("unexpected pseudo-header in response"));
            }
            if status.is_some() || has_status {
                return Err(Error::new_protocol("duplicate :status"));
            }
            let parsed = std::str::from_utf8(value)
                .ok()
                .and_then(|s| s.parse::<u16>().ok())
                .and_then(|code| StatusCode::from_u16(code).ok())
                .ok_or_else(|| Error::new_protocol("invalid :status"))?;
            status = Some(parsed);
            continue;
        }
        seen_regular = true;
        let name_str = std::str::from_utf8(name)
            .map_err(|_| Error::new_protocol("non-ascii header name"))?;
        if CONNECTION_SPECIFIC.contains(&name_str) {
            return Err(Error::new_protocol(format!(
                "connection-specific header {} on http/2",
                name_str
            )));
        }
        let name = HeaderName::from_bytes(name)
            .map_err(|_| Error::new_protocol("invalid header name"))?;
        let value = HeaderValue::from_bytes(value)
            .map_err(|_| Error::new_protocol("invalid header value"))?;
        headers.push((name, value));
    }

    match status {
        Some(status) => {
            let mut map = HeaderMap::with_capacity(headers.len());
            for (name, value) in headers {
                map.append(name, value);
            }
            Ok(ValidatedBlock::Initial {
                status,
                headers: map,
            })
        }
        None if has_status => Ok(ValidatedBlock::Trailers { headers }),
        None => Err(Error::new_protocol("response block missing :status")),
    }
}

fn on_rst_stream(shared: &Arc<Shared>, frame: Frame) -> std::result::Result<(), CloseCause> {
    if frame.payload.len() != 4 {
        return Err(CloseCause::Protocol("RST_STREAM with bad length".into()));
    }
    let code = u32::from_be_bytes([
        frame.payload[0],
        frame.payload[1],
        frame.payload[2],
        frame.payload[3],
    ]);
    debug!("stream {} reset by peer: {:#x}", frame.header.stream_id, code);
    let mut state = self_state(shared);
    fail_stream_locked(
        &mut state,
        frame.header.stream_id,
        Error::new_network(format!("stream reset by peer ({:#x})", code)),
    );
    drop(state);
    shared.window_changed.notify_waiters();
    Ok(())
}

async fn on_settings(shared: &Arc<Shared>, frame: Frame) -> std::result::Result<(), CloseCause> {
    if frame.header.has(flags::ACK) {
        shared.settings_acked.set();
        return Ok(());
    }

    let table_size = {
        let mut state = self_state(shared);
        let before = state.peer_settings.initial_window_size;
        let table_before = state.peer_settings.header_table_size;
        state
            .peer_settings
            .apply(&frame.payload)
            .map_err(|e| CloseCause::Protocol(e.to_string()))?;
        let delta = i64::from(state.peer_settings.initial_window_size) - i64::from(before);
        if delta != 0 {
            for slot in state.streams.values_mut() {
                slot.send_window += delta;
            }
        }
        (table_before != state.peer_settings.header_table_size)
            .then_some(state.peer_settings.header_table_size)
    };
    shared.window_changed.notify_waiters();

    let mut writer = shared.writer.lock().await;
    if let Some(size) = table_size {
        // Announced to the peer as a size update at the head of the next
        // header block we encode.
        writer.hpack.set_max_table_size(size as usize);
    }
    write_frame(&mut writer, kind::SETTINGS, flags::ACK, 0, &[])
        .await
        .map_err(|e| CloseCause::Io(e.to_string()))?;
    writer
        .io
        .flush()
        .await
        .map_err(|e| CloseCause::Io(e.to_string()))?;
    Ok(())
}

async fn on_ping(shared: &Arc<Shared>, frame: Frame) -> std::result::Result<(), CloseCause> {
    if frame.header.has(flags::ACK) {
        return Ok(());
    }
    if frame.payload.len() != 8 {
        return Err(CloseCause::Protocol("PING with bad length".into()));
    }
    let mut writer = shared.writer.lock().await;
    write_frame(&mut writer, kind::PING, flags::ACK, 0, &frame.payload)
        .await
        .map_err(|e| CloseCause::Io(e.to_string()))?;
    writer
        .io
        .flush()
        .await
        .map_err(|e| CloseCause::Io(e.to_string()))?;
    Ok(())
}

fn on_goaway(shared: &Arc<Shared>, frame: Frame) -> std::result::Result<(), CloseCause> {
    if frame.payload.len() < 8 {
        return Err(CloseCause::Protocol("GOAWAY with bad length".into()));
    }
    let last_stream_id = u32::from_be_bytes([
        frame.payload[0],
        frame.payload[1],
        frame.payload[2],
        frame.payload[3],
    ]) & 0x7fff_ffff;
    let code = u32::from_be_bytes([
        frame.payload[4],
        frame.payload[5],
        frame.payload[6],
        frame.payload[7],
    ]);
    debug!("peer GOAWAY last_stream_id={} code={:#x}", last_stream_id, code);

    let mut state = self_state(shared);
    state.goaway = Some(last_stream_id);
    // Streams the peer never handled fail retryably; a retrying caller can
    // reopen them on a fresh connection. Accepted streams keep going.
    let doomed: Vec<u32> = state
        .streams
        .keys()
        .copied()
        .filter(|id| *id > last_stream_id)
        .collect();
    for stream_id in doomed {
        fail_stream_locked(
            &mut state,
            stream_id,
            Error::new_network(format!(
                "connection going away before stream completed ({:#x})",
                code
            )),
        );
    }
    drop(state);
    shared.window_changed.notify_waiters();
    Ok(())
}

fn on_window_update(shared: &Arc<Shared>, frame: Frame) -> std::result::Result<(), CloseCause> {
    if frame.payload.len() != 4 {
        return Err(CloseCause::Protocol("WINDOW_UPDATE with bad length".into()));
    }
    let increment = u32::from_be_bytes([
        frame.payload[0],
        frame.payload[1],
        frame.payload[2],
        frame.payload[3],
    ]) & 0x7fff_ffff;
    if increment == 0 {
        return Err(CloseCause::Protocol("WINDOW_UPDATE of zero".into()));
    }

    let mut state = self_state(shared);
    if frame.header.stream_id == 0 {
        state.conn_send_window += i64::from(increment);
        if state.conn_send_window > i64::from(u32::MAX >> 1) {
            return Err(CloseCause::Protocol("connection window overflow".into()));
        }
    } else if let Some(slot) = state.streams.get_mut(&frame.header.stream_id) {
        slot.send_window += i64::from(increment);
        if slot.send_window > i64::from(u32::MAX >> 1) {
            return Err(CloseCause::Protocol("stream window overflow".into()));
        }
    }
    drop(state);
    shared.window_changed.notify_waiters();
    Ok(())
}

async fn send_goaway(shared: &Arc<Shared>, code: u32) {
    let mut writer = shared.writer.lock().await;
    let mut payload = BytesMut::with_capacity(8);
    payload.extend_from_slice(&0u32.to_be_bytes());
    payload.extend_from_slice(&code.to_be_bytes());
    let _ = write_frame(&mut writer, kind::GOAWAY, 0, 0, &payload).await;
    let _ = writer.io.flush().await;
}

fn self_state(shared: &Arc<Shared>) -> std::sync::MutexGuard<'_, ConnState> {
    shared.state.lock().unwrap()
}

/// Completes a stream whose END_STREAM has arrived and releases its slot.
fn complete_stream(shared: &Arc<Shared>, stream_id: u32) {
    let mut state = self_state(shared);
    let Some(mut slot) = state.streams.remove(&stream_id) else {
        return;
    };
    state.active_streams -= 1;
    drop(state);

    let parts = match slot.status {
        Some(status) => Ok(ResponseParts {
            status,
            headers: std::mem::take(&mut slot.headers),
            body: std::mem::take(&mut slot.body).freeze(),
        }),
        None => Err(Error::new_protocol("stream ended without a response")),
    };
    if let Some(producer) = slot.producer.take() {
        producer.complete(parts);
    }
    shared.window_changed.notify_waiters();
}

/// Must be called with the state lock held.
fn fail_stream_locked(state: &mut ConnState, stream_id: u32, err: Error) {
    if let Some(mut slot) = state.streams.remove(&stream_id) {
        state.active_streams -= 1;
        if let Some(producer) = slot.producer.take() {
            producer.complete(Err(err));
        }
    }
}

/// Terminal connection failure: every open stream completes with a
/// retryable error and no new streams may be allocated.
async fn close_connection(shared: &Arc<Shared>, cause: CloseCause) {
    warn!(
        "h2 connection closed: {}",
        match &cause {
            CloseCause::Io(m) | CloseCause::Protocol(m) => m,
        }
    );
    {
        let mut state = self_state(shared);
        let doomed: Vec<u32> = state.streams.keys().copied().collect();
        for stream_id in doomed {
            fail_stream_locked(&mut state, stream_id, cause.to_error());
        }
        if state.closed.is_none() {
            state.closed = Some(cause);
        }
    }
    shared.settings_acked.set();
    shared.window_changed.notify_waiters();
}
