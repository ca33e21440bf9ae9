//! Binary chunk frame format.
//!
//! # Wire format
//!
//! ```text
//! [4 bytes BE: start offset (inclusive)]
//! [4 bytes BE: end offset (inclusive)]
//! [3 bytes: reserved, ignored]
//! [1 byte: checksum = sum(payload) mod 256]
//! [rest: payload]
//! ```
//!
//! The transport parses frames into [`ChunkFrame`]s; the engine recomputes
//! the checksum itself, so a frame that decodes cleanly is not yet trusted.

/// Size of the fixed leading header.
pub const CHUNK_HEADER_LEN: usize = 12;

/// Decoded fixed-size header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub start: u32,
    pub end: u32,
    pub checksum: u8,
}

/// A header plus the payload that followed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkFrame<'a> {
    pub header: ChunkHeader,
    pub payload: &'a [u8],
}

/// Errors from frame decoding.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WireError {
    #[error("frame too short: need at least {CHUNK_HEADER_LEN} header bytes, got {got}")]
    TooShort { got: usize },
}

/// Arithmetic sum of `data` modulo 256.
pub fn additive_checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Splits a raw frame into header and payload.
pub fn parse_chunk_frame(data: &[u8]) -> Result<ChunkFrame<'_>, WireError> {
    if data.len() < CHUNK_HEADER_LEN {
        return Err(WireError::TooShort { got: data.len() });
    }

    let start = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    let end = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    let checksum = data[CHUNK_HEADER_LEN - 1];

    Ok(ChunkFrame {
        header: ChunkHeader {
            start,
            end,
            checksum,
        },
        payload: &data[CHUNK_HEADER_LEN..],
    })
}

/// Encodes a frame for `payload` covering `[start, end]`, computing the
/// checksum byte.
pub fn encode_chunk_frame(start: u32, end: u32, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(CHUNK_HEADER_LEN + payload.len());
    buf.extend_from_slice(&start.to_be_bytes());
    buf.extend_from_slice(&end.to_be_bytes());
    buf.extend_from_slice(&[0, 0, 0]);
    buf.push(additive_checksum(payload));
    buf.extend_from_slice(payload);
    buf
}
