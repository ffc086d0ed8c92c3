//! HTTP/2 frame layer (RFC 9113 §4).

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

pub(crate) const FRAME_HEADER_LEN: usize = 9;

/// The 24-byte client connection preface.
pub(crate) const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

pub(crate) mod kind {
    pub(crate) const DATA: u8 = 0x0;
    pub(crate) const HEADERS: u8 = 0x1;
    pub(crate) const PRIORITY: u8 = 0x2;
    pub(crate) const RST_STREAM: u8 = 0x3;
    pub(crate) const SETTINGS: u8 = 0x4;
    pub(crate) const PUSH_PROMISE: u8 = 0x5;
    pub(crate) const PING: u8 = 0x6;
    pub(crate) const GOAWAY: u8 = 0x7;
    pub(crate) const WINDOW_UPDATE: u8 = 0x8;
    pub(crate) const CONTINUATION: u8 = 0x9;
}

pub(crate) mod flags {
    pub(crate) const END_STREAM: u8 = 0x1;
    pub(crate) const ACK: u8 = 0x1;
    pub(crate) const END_HEADERS: u8 = 0x4;
    pub(crate) const PADDED: u8 = 0x8;
    pub(crate) const PRIORITY: u8 = 0x20;
}

pub(crate) mod error_code {
    pub(crate) const NO_ERROR: u32 = 0x0;
    pub(crate) const PROTOCOL_ERROR: u32 = 0x1;
    pub(crate) const FLOW_CONTROL_ERROR: u32 = 0x3;
    pub(crate) const FRAME_SIZE_ERROR: u32 = 0x6;
    pub(crate) const REFUSED_STREAM: u32 = 0x7;
    pub(crate) const CANCEL: u32 = 0x8;
    pub(crate) const COMPRESSION_ERROR: u32 = 0x9;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FrameHeader {
    pub(crate) length: u32,
    pub(crate) kind: u8,
    pub(crate) flags: u8,
    pub(crate) stream_id: u32,
}

impl FrameHeader {
    pub(crate) fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    pub(crate) fn parse(raw: &[u8; FRAME_HEADER_LEN]) -> FrameHeader {
        FrameHeader {
            length: u32::from_be_bytes([0, raw[0], raw[1], raw[2]]),
            kind: raw[3],
            flags: raw[4],
            stream_id: u32::from_be_bytes([raw[5], raw[6], raw[7], raw[8]]) & 0x7fff_ffff,
        }
    }

    pub(crate) fn put(&self, dst: &mut BytesMut) {
        let len = self.length.to_be_bytes();
        dst.put_slice(&len[1..]);
        dst.put_u8(self.kind);
        dst.put_u8(self.flags);
        dst.put_u32(self.stream_id & 0x7fff_ffff);
    }
}

#[derive(Debug)]
pub(crate) struct Frame {
    pub(crate) header: FrameHeader,
    pub(crate) payload: Bytes,
}

/// Reads one frame, rejecting payloads above `max_frame_size`.
pub(crate) async fn read_frame<R>(io: &mut R, max_frame_size: u32) -> io::Result<Frame>
where
    R: AsyncRead + Unpin,
{
    let mut raw = [0u8; FRAME_HEADER_LEN];
    io.read_exact(&mut raw).await?;
    let header = FrameHeader::parse(&raw);
    if header.length > max_frame_size {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "frame exceeds SETTINGS_MAX_FRAME_SIZE",
        ));
    }
    let mut payload = vec![0u8; header.length as usize];
    io.read_exact(&mut payload).await?;
    Ok(Frame {
        header,
        payload: Bytes::from(payload),
    })
}

/// Strips the padding of a PADDED DATA or HEADERS payload.
pub(crate) fn strip_padding(header: &FrameHeader, payload: &mut Bytes) -> io::Result<()> {
    if !header.has(flags::PADDED) {
        return Ok(());
    }
    if payload.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "empty padded frame"));
    }
    let pad_len = payload[0] as usize;
    payload.advance(1);
    if pad_len > payload.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "padding longer than frame",
        ));
    }
    payload.truncate(payload.len() - pad_len);
    Ok(())
}

/// Strips the 5-byte priority block of a HEADERS frame carrying PRIORITY.
pub(crate) fn strip_priority(header: &FrameHeader, payload: &mut Bytes) -> io::Result<()> {
    if !header.has(flags::PRIORITY) {
        return Ok(());
    }
    if payload.len() < 5 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "truncated priority block",
        ));
    }
    payload.advance(5);
    Ok(())
}

// ===== settings =====

#[derive(Debug, Clone, Copy)]
pub(crate) struct Settings {
    pub(crate) header_table_size: u32,
    pub(crate) max_concurrent_streams: Option<u32>,
    pub(crate) initial_window_size: u32,
    pub(crate) max_frame_size: u32,
}

impl Default for Settings {
    fn default() -> Settings {
        Settings {
            header_table_size: 4096,
            max_concurrent_streams: None,
            initial_window_size: 65_535,
            max_frame_size: 16_384,
        }
    }
}

mod setting_id {
    pub(super) const HEADER_TABLE_SIZE: u16 = 0x1;
    pub(super) const ENABLE_PUSH: u16 = 0x2;
    pub(super) const MAX_CONCURRENT_STREAMS: u16 = 0x3;
    pub(super) const INITIAL_WINDOW_SIZE: u16 = 0x4;
    pub(super) const MAX_FRAME_SIZE: u16 = 0x5;
}

impl Settings {
    /// Applies a received SETTINGS payload on top of the current values.
    pub(crate) fn apply(&mut self, payload: &[u8]) -> io::Result<()> {
        if payload.len() % 6 != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "SETTINGS payload not a multiple of 6",
            ));
        }
        for entry in payload.chunks_exact(6) {
            let id = u16::from_be_bytes([entry[0], entry[1]]);
            let value = u32::from_be_bytes([entry[2], entry[3], entry[4], entry[5]]);
            match id {
                setting_id::HEADER_TABLE_SIZE => self.header_table_size = value,
                // push is refused at the frame level regardless
                setting_id::ENABLE_PUSH => {}
                setting_id::MAX_CONCURRENT_STREAMS => {
                    self.max_concurrent_streams = Some(value)
                }
                setting_id::INITIAL_WINDOW_SIZE => {
                    if value > 0x7fff_ffff {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "INITIAL_WINDOW_SIZE above 2^31-1",
                        ));
                    }
                    self.initial_window_size = value;
                }
                setting_id::MAX_FRAME_SIZE => {
                    if !(16_384..=16_777_215).contains(&value) {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "MAX_FRAME_SIZE out of range",
                        ));
                    }
                    self.max_frame_size = value;
                }
                // unknown settings are ignored
                _ => {}
            }
        }
        Ok(())
    }

    /// Serializes the client's opening SETTINGS payload.
    pub(crate) fn encode_client(
        header_table_size: u32,
        max_concurrent_streams: u32,
        initial_window_size: u32,
        max_frame_size: u32,
        dst: &mut BytesMut,
    ) {
        for (id, value) in [
            (setting_id::HEADER_TABLE_SIZE, header_table_size),
            (setting_id::ENABLE_PUSH, 0),
            (setting_id::MAX_CONCURRENT_STREAMS, max_concurrent_streams),
            (setting_id::INITIAL_WINDOW_SIZE, initial_window_size),
            (setting_id::MAX_FRAME_SIZE, max_frame_size),
        ] {
            dst.put_u16(id);
            dst.put_u32(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let header = FrameHeader {
            length: 0x01_02_03,
            kind: kind::HEADERS,
            flags: flags::END_HEADERS | flags::END_STREAM,
            stream_id: 7,
        };
        let mut raw = BytesMut::new();
        header.put(&mut raw);
        assert_eq!(raw.len(), FRAME_HEADER_LEN);
        let mut fixed = [0u8; FRAME_HEADER_LEN];
        fixed.copy_from_slice(&raw);
        assert_eq!(FrameHeader::parse(&fixed), header);
    }

    #[test]
    fn reserved_bit_masked() {
        let mut raw = [0u8; FRAME_HEADER_LEN];
        raw[5] = 0x80;
        raw[8] = 0x01;
        assert_eq!(FrameHeader::parse(&raw).stream_id, 1);
    }

    #[tokio::test]
    async fn oversized_frame_rejected() {
        let (client, mut server) = tokio::io::duplex(64);
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            let header = FrameHeader {
                length: 1 << 20,
                kind: kind::DATA,
                flags: 0,
                stream_id: 1,
            };
            let mut raw = BytesMut::new();
            header.put(&mut raw);
            let _ = server.write_all(&raw).await;
        });
        let mut client = client;
        let err = read_frame(&mut client, 16_384).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn padding_stripped() {
        let header = FrameHeader {
            length: 8,
            kind: kind::DATA,
            flags: flags::PADDED,
            stream_id: 1,
        };
        let mut payload = Bytes::from_static(&[3, b'h', b'i', 0, 0, 0]);
        strip_padding(&header, &mut payload).unwrap();
        assert_eq!(&payload[..], b"hi");
    }

    #[test]
    fn settings_apply_and_validate() {
        let mut settings = Settings::default();
        let mut payload = BytesMut::new();
        payload.put_u16(0x4);
        payload.put_u32(1_048_576);
        payload.put_u16(0x3);
        payload.put_u32(128);
        settings.apply(&payload).unwrap();
        assert_eq!(settings.initial_window_size, 1_048_576);
        assert_eq!(settings.max_concurrent_streams, Some(128));

        let mut bad = BytesMut::new();
        bad.put_u16(0x5);
        bad.put_u32(1);
        assert!(settings.apply(&bad).is_err());
    }
}
