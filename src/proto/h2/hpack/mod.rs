//! HPACK header compression (RFC 7541).
//!
//! The encoder owns the send-side dynamic table and the decoder the
//! receive-side one; the two never share state. Decoded output is capped to
//! guard against decompression bombs.

pub(crate) mod huffman;
pub(crate) mod table;

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use self::table::{lookup, DynamicTable, STATIC_TABLE};

/// Decode failures; all of them are connection-fatal `COMPRESSION_ERROR`s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HpackError {
    /// An index pointed outside both tables.
    BadIndex,
    /// A Huffman string was malformed.
    BadHuffman,
    /// An integer representation overflowed.
    IntegerOverflow,
    /// The block ended inside a representation.
    Truncated,
    /// A size update exceeded the negotiated limit or came too late.
    BadSizeUpdate,
    /// Decoded output exceeded the configured cap.
    BombCap,
}

impl fmt::Display for HpackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            HpackError::BadIndex => "hpack index out of range",
            HpackError::BadHuffman => "malformed huffman string",
            HpackError::IntegerOverflow => "hpack integer overflow",
            HpackError::Truncated => "truncated header block",
            HpackError::BadSizeUpdate => "invalid dynamic table size update",
            HpackError::BombCap => "decoded header block exceeds cap",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for HpackError {}

// ===== integer codec (RFC 7541 §5.1) =====

pub(crate) fn encode_int(value: u64, prefix_bits: u8, flags: u8, dst: &mut BytesMut) {
    debug_assert!((1..=8).contains(&prefix_bits));
    let limit = (1u64 << prefix_bits) - 1;
    if value < limit {
        dst.put_u8(flags | value as u8);
        return;
    }
    dst.put_u8(flags | limit as u8);
    let mut rest = value - limit;
    while rest >= 128 {
        dst.put_u8((rest as u8 & 0x7f) | 0x80);
        rest >>= 7;
    }
    dst.put_u8(rest as u8);
}

pub(crate) fn decode_int(
    src: &[u8],
    at: &mut usize,
    prefix_bits: u8,
) -> Result<u64, HpackError> {
    let limit = (1u64 << prefix_bits) - 1;
    let first = *src.get(*at).ok_or(HpackError::Truncated)?;
    *at += 1;
    let mut value = (first as u64) & limit;
    if value < limit {
        return Ok(value);
    }
    let mut shift = 0u32;
    loop {
        let byte = *src.get(*at).ok_or(HpackError::Truncated)?;
        *at += 1;
        if shift > 28 {
            return Err(HpackError::IntegerOverflow);
        }
        value = value
            .checked_add(((byte & 0x7f) as u64) << shift)
            .ok_or(HpackError::IntegerOverflow)?;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

// ===== encoder =====

/// Header names that must never enter a compression table.
const NEVER_INDEX: [&[u8]; 4] = [
    b"authorization",
    b"proxy-authorization",
    b"cookie",
    b"set-cookie",
];

pub(crate) struct Encoder {
    table: DynamicTable,
    /// A pending `SETTINGS_HEADER_TABLE_SIZE` change; emitted as a size
    /// update at the start of the next block, before any representation.
    pending_size_update: Option<usize>,
}

impl Encoder {
    pub(crate) fn new(max_table_size: usize) -> Encoder {
        Encoder {
            table: DynamicTable::new(max_table_size),
            pending_size_update: None,
        }
    }

    /// Records a table size change to announce in the next block.
    pub(crate) fn set_max_table_size(&mut self, size: usize) {
        self.pending_size_update = Some(size);
    }

    pub(crate) fn encode(&mut self, fields: &[(&[u8], &[u8])], dst: &mut BytesMut) {
        if let Some(size) = self.pending_size_update.take() {
            self.table.set_max_size(size);
            encode_int(size as u64, 5, 0b0010_0000, dst);
        }

        for &(name, value) in fields {
            self.encode_field(name, value, dst);
        }
    }

    fn encode_field(&mut self, name: &[u8], value: &[u8], dst: &mut BytesMut) {
        if NEVER_INDEX.contains(&name) {
            // literal, never indexed
            self.encode_literal(name, value, 0b0001_0000, 4, dst);
            return;
        }

        // exact match: indexed representation
        if let Some(idx) = find_static(name, value) {
            encode_int(idx as u64, 7, 0b1000_0000, dst);
            return;
        }
        if let Some(idx) = self.table.find(name, value) {
            encode_int((STATIC_TABLE.len() + 1 + idx) as u64, 7, 0b1000_0000, dst);
            return;
        }

        // literal with incremental indexing, reusing a known name if any
        let name_index = find_static_name(name)
            .or_else(|| self.table.find_name(name).map(|i| STATIC_TABLE.len() + 1 + i));
        match name_index {
            Some(idx) => {
                encode_int(idx as u64, 6, 0b0100_0000, dst);
                encode_string(value, dst);
            }
            None => {
                encode_int(0, 6, 0b0100_0000, dst);
                encode_string(name, dst);
                encode_string(value, dst);
            }
        }
        self.table.insert(name.to_vec(), value.to_vec());
    }

    fn encode_literal(
        &mut self,
        name: &[u8],
        value: &[u8],
        flags: u8,
        prefix: u8,
        dst: &mut BytesMut,
    ) {
        match find_static_name(name) {
            Some(idx) => {
                encode_int(idx as u64, prefix, flags, dst);
            }
            None => {
                encode_int(0, prefix, flags, dst);
                encode_string(name, dst);
            }
        }
        encode_string(value, dst);
    }
}

fn find_static(name: &[u8], value: &[u8]) -> Option<usize> {
    STATIC_TABLE
        .iter()
        .position(|&(n, v)| n == name && v == value)
        .map(|i| i + 1)
}

fn find_static_name(name: &[u8]) -> Option<usize> {
    STATIC_TABLE
        .iter()
        .position(|&(n, _)| n == name)
        .map(|i| i + 1)
}

fn encode_string(src: &[u8], dst: &mut BytesMut) {
    let huffman_len = huffman::encoded_len(src);
    if huffman_len < src.len() {
        encode_int(huffman_len as u64, 7, 0b1000_0000, dst);
        huffman::encode(src, dst);
    } else {
        encode_int(src.len() as u64, 7, 0, dst);
        dst.put_slice(src);
    }
}

// ===== decoder =====

pub(crate) struct Decoder {
    table: DynamicTable,
    /// Upper bound a size update may set, from our SETTINGS.
    max_table_size_limit: usize,
    /// Decompression bomb cap on total decoded bytes per block.
    max_decoded_bytes: usize,
}

impl Decoder {
    pub(crate) fn new(max_table_size: usize, max_decoded_bytes: usize) -> Decoder {
        Decoder {
            table: DynamicTable::new(max_table_size),
            max_table_size_limit: max_table_size,
            max_decoded_bytes,
        }
    }

    /// Decodes one complete header block.
    pub(crate) fn decode(&mut self, src: &[u8]) -> Result<Vec<(Bytes, Bytes)>, HpackError> {
        let mut at = 0usize;
        let mut fields = Vec::new();
        let mut decoded_bytes = 0usize;
        let mut seen_field = false;

        while at < src.len() {
            let first = src[at];
            if first & 0b1000_0000 != 0 {
                // indexed
                let index = decode_int(src, &mut at, 7)? as usize;
                let (name, value) =
                    lookup(&self.table, index).ok_or(HpackError::BadIndex)?;
                let field = (
                    Bytes::copy_from_slice(name),
                    Bytes::copy_from_slice(value),
                );
                self.charge(&mut decoded_bytes, field.0.len() + field.1.len())?;
                fields.push(field);
                seen_field = true;
            } else if first & 0b0100_0000 != 0 {
                // literal with incremental indexing
                let (name, value) = self.read_literal(src, &mut at, 6, &mut decoded_bytes)?;
                self.table.insert(name.to_vec(), value.to_vec());
                fields.push((name, value));
                seen_field = true;
            } else if first & 0b0010_0000 != 0 {
                // dynamic table size update; only valid before any field
                let size = decode_int(src, &mut at, 5)? as usize;
                if seen_field || size > self.max_table_size_limit {
                    return Err(HpackError::BadSizeUpdate);
                }
                self.table.set_max_size(size);
            } else {
                // literal without indexing / never indexed (prefix 4)
                let (name, value) = self.read_literal(src, &mut at, 4, &mut decoded_bytes)?;
                fields.push((name, value));
                seen_field = true;
            }
        }
        Ok(fields)
    }

    fn read_literal(
        &mut self,
        src: &[u8],
        at: &mut usize,
        prefix: u8,
        decoded_bytes: &mut usize,
    ) -> Result<(Bytes, Bytes), HpackError> {
        let name_index = decode_int(src, at, prefix)? as usize;
        let name = if name_index == 0 {
            self.read_string(src, at, decoded_bytes)?
        } else {
            let (name, _) = lookup(&self.table, name_index).ok_or(HpackError::BadIndex)?;
            let name = Bytes::copy_from_slice(name);
            self.charge(decoded_bytes, name.len())?;
            name
        };
        let value = self.read_string(src, at, decoded_bytes)?;
        Ok((name, value))
    }

    fn read_string(
        &self,
        src: &[u8],
        at: &mut usize,
        decoded_bytes: &mut usize,
    ) -> Result<Bytes, HpackError> {
        let huffman = src.get(*at).map(|b| b & 0b1000_0000 != 0).unwrap_or(false);
        let len = decode_int(src, at, 7)? as usize;
        let end = at.checked_add(len).ok_or(HpackError::IntegerOverflow)?;
        let raw = src.get(*at..end).ok_or(HpackError::Truncated)?;
        *at = end;

        if huffman {
            let budget = self
                .max_decoded_bytes
                .saturating_sub(*decoded_bytes);
            let mut out = Vec::with_capacity(raw.len() * 2);
            huffman::decode(raw, budget, &mut out).map_err(|capped| {
                if capped {
                    HpackError::BombCap
                } else {
                    HpackError::BadHuffman
                }
            })?;
            *decoded_bytes += out.len();
            Ok(Bytes::from(out))
        } else {
            let mut total = *decoded_bytes;
            charge_raw(&mut total, len, self.max_decoded_bytes)?;
            *decoded_bytes = total;
            Ok(Bytes::copy_from_slice(raw))
        }
    }

    fn charge(&self, decoded_bytes: &mut usize, len: usize) -> Result<(), HpackError> {
        charge_raw(decoded_bytes, len, self.max_decoded_bytes)
    }
}

fn charge_raw(
    decoded_bytes: &mut usize,
    len: usize,
    cap: usize,
) -> Result<(), HpackError> {
    *decoded_bytes = decoded_bytes
        .checked_add(len)
        .ok_or(HpackError::BombCap)?;
    if *decoded_bytes > cap {
        return Err(HpackError::BombCap);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(fields: &[(&str, &str)]) -> Vec<(Vec<u8>, Vec<u8>)> {
        fields
            .iter()
            .map(|&(n, v)| (n.as_bytes().to_vec(), v.as_bytes().to_vec()))
            .collect()
    }

    fn roundtrip_with(
        encoder: &mut Encoder,
        decoder: &mut Decoder,
        fields: &[(&str, &str)],
    ) {
        let owned = pairs(fields);
        let borrowed: Vec<(&[u8], &[u8])> = owned
            .iter()
            .map(|(n, v)| (n.as_slice(), v.as_slice()))
            .collect();
        let mut block = BytesMut::new();
        encoder.encode(&borrowed, &mut block);
        let decoded = decoder.decode(&block).unwrap();
        assert_eq!(decoded.len(), owned.len());
        for (got, want) in decoded.iter().zip(owned.iter()) {
            assert_eq!(&got.0[..], want.0.as_slice());
            assert_eq!(&got.1[..], want.1.as_slice());
        }
    }

    #[test]
    fn integer_codec_rfc_examples() {
        // RFC 7541 C.1.1: 10 with 5-bit prefix
        let mut dst = BytesMut::new();
        encode_int(10, 5, 0, &mut dst);
        assert_eq!(&dst[..], &[0b0000_1010]);

        // C.1.2: 1337 with 5-bit prefix
        let mut dst = BytesMut::new();
        encode_int(1337, 5, 0, &mut dst);
        assert_eq!(&dst[..], &[0b0001_1111, 0b1001_1010, 0b0000_1010]);
        let mut at = 0;
        assert_eq!(decode_int(&dst, &mut at, 5).unwrap(), 1337);
        assert_eq!(at, 3);
    }

    #[test]
    fn integer_overflow_rejected() {
        let src = [0xff, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x01];
        let mut at = 0;
        assert_eq!(
            decode_int(&src, &mut at, 7),
            Err(HpackError::IntegerOverflow)
        );
    }

    #[test]
    fn block_roundtrip() {
        let mut encoder = Encoder::new(4096);
        let mut decoder = Decoder::new(4096, 256 * 1024);
        roundtrip_with(
            &mut encoder,
            &mut decoder,
            &[
                (":method", "GET"),
                (":scheme", "https"),
                (":path", "/search?q=hpack"),
                (":authority", "example.com"),
                ("user-agent", "turbine/0.1"),
                ("x-custom", "value-one"),
            ],
        );
        // second block exercises the dynamic table hits
        roundtrip_with(
            &mut encoder,
            &mut decoder,
            &[
                (":method", "GET"),
                (":authority", "example.com"),
                ("x-custom", "value-one"),
            ],
        );
    }

    #[test]
    fn roundtrip_with_size_updates() {
        let mut encoder = Encoder::new(4096);
        let mut decoder = Decoder::new(4096, 256 * 1024);
        roundtrip_with(&mut encoder, &mut decoder, &[("x-a", "1"), ("x-b", "2")]);

        encoder.set_max_table_size(64);
        decoder.table.set_max_size(64);
        // size update lands at the front of this block and both tables agree
        roundtrip_with(&mut encoder, &mut decoder, &[("x-a", "1"), ("x-c", "3")]);
        assert!(encoder.table.max_size() == 64);
    }

    #[test]
    fn sensitive_headers_never_indexed() {
        let mut encoder = Encoder::new(4096);
        let mut block = BytesMut::new();
        encoder.encode(&[(b"authorization", b"Bearer shhh")], &mut block);
        // 0001 prefix, and nothing entered the dynamic table
        assert_eq!(block[0] & 0b1111_0000, 0b0001_0000);
        assert_eq!(encoder.table.len(), 0);
    }

    #[test]
    fn size_update_after_field_rejected() {
        let mut decoder = Decoder::new(4096, 256 * 1024);
        let mut block = BytesMut::new();
        encode_int(2, 7, 0b1000_0000, &mut block); // :method GET
        encode_int(0, 5, 0b0010_0000, &mut block); // late size update
        assert_eq!(decoder.decode(&block), Err(HpackError::BadSizeUpdate));
    }

    #[test]
    fn size_update_above_limit_rejected() {
        let mut decoder = Decoder::new(4096, 256 * 1024);
        let mut block = BytesMut::new();
        encode_int(65536, 5, 0b0010_0000, &mut block);
        assert_eq!(decoder.decode(&block), Err(HpackError::BadSizeUpdate));
    }

    #[test]
    fn bomb_cap_enforced() {
        let mut encoder = Encoder::new(4096);
        let mut decoder = Decoder::new(4096, 64);
        let big = "v".repeat(256);
        let mut block = BytesMut::new();
        encoder.encode(&[(b"x-big", big.as_bytes())], &mut block);
        assert_eq!(decoder.decode(&block), Err(HpackError::BombCap));
    }

    #[test]
    fn bad_index_rejected() {
        let mut decoder = Decoder::new(4096, 256 * 1024);
        let mut block = BytesMut::new();
        encode_int(200, 7, 0b1000_0000, &mut block);
        assert_eq!(decoder.decode(&block), Err(HpackError::BadIndex));
    }
}
