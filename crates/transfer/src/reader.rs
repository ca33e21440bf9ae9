//! Byte-range reads of stored artifacts.
//!
//! Reads never touch session state: they only look at what the artifact
//! store holds at the time of the call.

use std::io::ErrorKind;
use std::path::PathBuf;

use futures_util::stream::{self, BoxStream, StreamExt, TryStreamExt};
use rangeload_protocol::ContentRange;
use tokio::io::AsyncReadExt;

use crate::store::{io_err, open_at};
use crate::{TransferEngine, TransferError, validate_transfer_id};

/// Result of a read request.
#[derive(Debug, Clone)]
pub enum ReadOutcome {
    /// No range was requested: the whole artifact.
    Full(BlobDescriptor),
    /// A satisfiable byte range.
    Range(RangeRead),
}

impl ReadOutcome {
    /// Size of the whole artifact, whichever variant this is.
    pub fn total_size(&self) -> u64 {
        match self {
            ReadOutcome::Full(blob) => blob.size,
            ReadOutcome::Range(read) => read.total_size,
        }
    }
}

/// Location and size of a stored artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobDescriptor {
    pub path: PathBuf,
    pub size: u64,
}

/// A validated range over one artifact.
///
/// Holding a `RangeRead` does not keep the file open; [`RangeRead::blocks`]
/// opens it when the stream is first polled.
#[derive(Debug, Clone)]
pub struct RangeRead {
    path: PathBuf,
    block_size: usize,
    pub content_range: ContentRange,
    pub total_size: u64,
}

impl RangeRead {
    pub fn content_length(&self) -> u64 {
        self.content_range.content_length()
    }

    /// Lazy stream of blocks of at most the configured block size that
    /// together cover exactly the range. Every call starts a new stream from
    /// the first byte of the range.
    pub fn blocks(&self) -> BoxStream<'static, Result<Vec<u8>, TransferError>> {
        let path = self.path.clone();
        let start = self.content_range.start;
        let block_size = self.block_size as u64;

        stream::try_unfold(
            (None::<tokio::fs::File>, self.content_length()),
            move |(file, remaining)| {
                let path = path.clone();
                async move {
                    if remaining == 0 {
                        return Ok(None);
                    }
                    let mut file = match file {
                        Some(file) => file,
                        None => open_at(&path, start).await?,
                    };

                    let mut block = vec![0u8; remaining.min(block_size) as usize];
                    file.read_exact(&mut block)
                        .await
                        .map_err(io_err("read", &path))?;
                    let remaining = remaining - block.len() as u64;
                    Ok(Some((block, (Some(file), remaining))))
                }
            },
        )
        .boxed()
    }

    /// Reads the whole range into memory.
    pub async fn read_all(&self) -> Result<Vec<u8>, TransferError> {
        self.blocks().try_concat().await
    }
}

impl TransferEngine {
    /// Reads a completed artifact, whole or by inclusive byte range.
    ///
    /// An open start reads to the end of the artifact; an open end reads from
    /// byte 0.
    pub async fn read_range(
        &self,
        transfer_id: &str,
        start: Option<u64>,
        end: Option<u64>,
    ) -> Result<ReadOutcome, TransferError> {
        validate_transfer_id(transfer_id)?;
        let path = self.store.artifact_path(transfer_id);
        self.read_blob_range(transfer_id, path, start, end).await
    }

    /// Same as [`TransferEngine::read_range`] for the partial artifact of a
    /// persisted incomplete transfer. Offsets are into the partial artifact,
    /// whose gaps are collapsed.
    pub async fn read_partial(
        &self,
        transfer_id: &str,
        start: Option<u64>,
        end: Option<u64>,
    ) -> Result<ReadOutcome, TransferError> {
        validate_transfer_id(transfer_id)?;
        let path = self.store.partial_path(transfer_id);
        self.read_blob_range(transfer_id, path, start, end).await
    }

    async fn read_blob_range(
        &self,
        transfer_id: &str,
        path: PathBuf,
        start: Option<u64>,
        end: Option<u64>,
    ) -> Result<ReadOutcome, TransferError> {
        let size = match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => meta.len(),
            Ok(_) => return Err(TransferError::NotFound(transfer_id.to_string())),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(TransferError::NotFound(transfer_id.to_string()));
            }
            Err(e) => return Err(io_err("stat", &path)(e)),
        };

        let (start, end) = match (start, end) {
            (None, None) => return Ok(ReadOutcome::Full(BlobDescriptor { path, size })),
            (Some(start), Some(end)) => (start, end),
            (Some(start), None) => (start, size.saturating_sub(1)),
            (None, Some(end)) => (0, end),
        };
        if start >= size || end >= size || start > end {
            return Err(TransferError::RangeNotSatisfiable { start, end, size });
        }

        Ok(ReadOutcome::Range(RangeRead {
            path,
            block_size: self.config.read_block_size,
            content_range: ContentRange {
                start,
                end,
                total_size: size,
            },
            total_size: size,
        }))
    }
}
