//! Resumable chunked uploads: byte-range bookkeeping, completion detection,
//! assembly, range reads and reclamation of stalled transfers.
//!
//! Every operation goes through [`TransferEngine`], which owns the session
//! registry and the blob store. Mutations of one transfer are serialized by a
//! per-transfer lock; different transfers proceed in parallel.

mod assemble;
mod config;
mod engine;
mod ingest;
mod intervals;
mod reader;
mod reclaim;
mod registry;
mod session;
mod store;
mod validation;

use std::path::PathBuf;
use std::time::Duration;

pub use config::EngineConfig;
pub use engine::TransferEngine;
pub use intervals::{IntervalSet, validate_range};
pub use reader::{BlobDescriptor, RangeRead, ReadOutcome};
pub use reclaim::ReclaimReport;
pub use session::Chunk;
pub use validation::validate_transfer_id;

pub use rangeload_protocol::{
    ByteRange, ContentRange, IngestReceipt, StatusReport, TransferStatus,
};

/// Default inactivity period after which a transfer may be reclaimed.
pub const DEFAULT_STALENESS_WINDOW: Duration = Duration::from_secs(60 * 60);

/// Default size of the blocks yielded by range reads: 4 KiB.
pub const DEFAULT_READ_BLOCK_SIZE: usize = 4096;

/// Longest accepted transfer identifier.
pub const MAX_TRANSFER_ID_LEN: usize = 128;

/// Errors produced by the transfer engine.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("malformed range: {0}")]
    MalformedRange(String),

    #[error("range {start}-{end} is outside the declared size of {total} bytes")]
    OutOfRange { start: u64, end: u64, total: u64 },

    #[error("checksum mismatch: declared {declared:#04x}, computed {computed:#04x}")]
    ChecksumMismatch { declared: u8, computed: u8 },

    #[error("size conflict: transfer is {existing} bytes, chunk declares {declared}")]
    SizeConflict { existing: u64, declared: u64 },

    #[error("transfer incomplete: {covered} bytes covered of {total:?}")]
    IncompleteTransfer { covered: u64, total: Option<u64> },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("range {start}-{end} not satisfiable for {size} bytes")]
    RangeNotSatisfiable { start: u64, end: u64, size: u64 },

    #[error("storage failure ({op} {}): {source}", path.display())]
    StorageFailure {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid transfer id: {0}")]
    InvalidTransferId(String),
}

impl From<rangeload_protocol::WireError> for TransferError {
    fn from(e: rangeload_protocol::WireError) -> Self {
        TransferError::MalformedRange(e.to_string())
    }
}
