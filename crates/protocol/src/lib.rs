//! Types shared between the rangeload engine and whatever transport sits in
//! front of it: status reports, ingest receipts, the partial-artifact
//! manifest, and the binary chunk frame codec.

pub mod types;
pub mod wire;

// Re-export primary types for convenience.
pub use types::{
    ByteRange, ContentRange, IngestReceipt, PartialManifest, StatusReport, TransferStatus,
};
pub use wire::{
    CHUNK_HEADER_LEN, ChunkFrame, ChunkHeader, WireError, additive_checksum, encode_chunk_frame,
    parse_chunk_frame,
};
