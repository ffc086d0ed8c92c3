//! permessage-deflate payload transforms (RFC 7692).
//!
//! Context takeover is disabled in both directions, so every message runs
//! through a fresh raw-deflate stream. Inbound payloads inflate in bounded
//! chunks with the cumulative size checked against the message cap, which is
//! the zip-bomb guard.

use bytes::Bytes;
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress};

use crate::error::{Error, Result};

/// The sync-flush trailer stripped from (and restored to) every message.
const SYNC_FLUSH_TAIL: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// Inflate output grows in chunks of this size, checking the cap each time.
const INFLATE_CHUNK: usize = 16 * 1024;

pub(crate) struct PerMessageDeflate {
    _priv: (),
}

impl PerMessageDeflate {
    pub(crate) fn new() -> PerMessageDeflate {
        PerMessageDeflate { _priv: () }
    }

    /// Deflates one message payload with sync-flush framing and strips the
    /// `00 00 FF FF` tail.
    pub(crate) fn compress(&self, payload: &[u8]) -> Result<Bytes> {
        let mut deflater = Compress::new(Compression::default(), false);
        let mut out: Vec<u8> = Vec::with_capacity(payload.len() / 2 + 64);
        let mut consumed = 0usize;

        loop {
            out.reserve(256.max(payload.len() / 4));
            let before_in = deflater.total_in() as usize;
            deflater
                .compress_vec(&payload[consumed..], &mut out, FlushCompress::Sync)
                .map_err(Error::new_compression)?;
            consumed += deflater.total_in() as usize - before_in;
            if consumed == payload.len() && out.len() < out.capacity() {
                break;
            }
        }

        if !out.ends_with(&SYNC_FLUSH_TAIL) {
            return Err(Error::new_compression("missing sync-flush tail"));
        }
        out.truncate(out.len() - SYNC_FLUSH_TAIL.len());
        Ok(Bytes::from(out))
    }

    /// Restores the flush tail and inflates, enforcing `max_len` cumulative
    /// output per chunk.
    pub(crate) fn decompress(&self, payload: &[u8], max_len: usize) -> Result<Bytes> {
        let mut input = Vec::with_capacity(payload.len() + SYNC_FLUSH_TAIL.len());
        input.extend_from_slice(payload);
        input.extend_from_slice(&SYNC_FLUSH_TAIL);

        let mut inflater = Decompress::new(false);
        let mut out: Vec<u8> = Vec::with_capacity(INFLATE_CHUNK.min(max_len + 1));
        let mut consumed = 0usize;

        loop {
            if out.len() > max_len {
                return Err(Error::new_message_too_large());
            }
            if out.len() == out.capacity() {
                out.reserve(INFLATE_CHUNK);
            }
            let before_in = inflater.total_in() as usize;
            let before_out = inflater.total_out() as usize;
            inflater
                .decompress_vec(&input[consumed..], &mut out, FlushDecompress::Sync)
                .map_err(Error::new_decompression)?;
            consumed += inflater.total_in() as usize - before_in;
            let produced = inflater.total_out() as usize - before_out;

            if consumed == input.len() && out.len() < out.capacity() {
                break;
            }
            if produced == 0 && consumed == input.len() {
                break;
            }
        }

        if out.len() > max_len {
            return Err(Error::new_message_too_large());
        }
        Ok(Bytes::from(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let pmd = PerMessageDeflate::new();
        let payload = b"hello hello hello hello hello".repeat(10);
        let compressed = pmd.compress(&payload).unwrap();
        assert!(compressed.len() < payload.len());
        let inflated = pmd.decompress(&compressed, 1024 * 1024).unwrap();
        assert_eq!(&inflated[..], &payload[..]);
    }

    #[test]
    fn roundtrip_empty_and_incompressible() {
        let pmd = PerMessageDeflate::new();
        for payload in [&b""[..], &[0xffu8, 0x00, 0xab, 0x11, 0x77][..]] {
            let compressed = pmd.compress(payload).unwrap();
            let inflated = pmd.decompress(&compressed, 1024).unwrap();
            assert_eq!(&inflated[..], payload);
        }
    }

    #[test]
    fn no_state_survives_between_messages() {
        let pmd = PerMessageDeflate::new();
        let first = pmd.compress(b"state state state").unwrap();
        let second = pmd.compress(b"state state state").unwrap();
        // identical messages compress identically without takeover
        assert_eq!(first, second);
        // and each decompresses standalone
        assert_eq!(
            pmd.decompress(&second, 1024).unwrap(),
            Bytes::from_static(b"state state state")
        );
    }

    #[test]
    fn zip_bomb_capped() {
        let pmd = PerMessageDeflate::new();
        let bomb_source = vec![0u8; 4 * 1024 * 1024];
        let compressed = pmd.compress(&bomb_source).unwrap();
        assert!(compressed.len() < 16 * 1024);
        let err = pmd.decompress(&compressed, 64 * 1024).unwrap_err();
        assert!(err.is_too_large());
    }

    #[test]
    fn garbage_input_is_decompression_error() {
        let pmd = PerMessageDeflate::new();
        let err = pmd.decompress(&[0xde, 0xad, 0xbe, 0xef], 1024).unwrap_err();
        assert!(matches!(
            err.kind(),
            crate::error::Kind::Decompression | crate::error::Kind::MessageTooLarge
        ));
    }
}
