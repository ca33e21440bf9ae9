use std::fmt;

use serde::{Deserialize, Serialize};

/// Inclusive byte range `[start, end]`.
///
/// Ordering is by `start`, then `end`, which is the order fragments are
/// concatenated in during assembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Number of bytes covered (always at least 1 for a well-formed range).
    ///
    /// Saturates at `u64::MAX` for `[0, u64::MAX]`, whose true length does
    /// not fit.
    pub fn len(&self) -> u64 {
        (self.end - self.start).saturating_add(1)
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Lifecycle state of a transfer as reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferStatus {
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "partial")]
    Partial,
    #[serde(rename = "complete")]
    Complete,
    #[serde(rename = "persisted_incomplete")]
    PersistedIncomplete,
    #[serde(rename = "not_found")]
    NotFound,
}

/// Answer to a status query for one transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub transfer_id: String,
    pub status: TransferStatus,
    pub received_bytes: u64,
    #[serde(default)]
    pub total_bytes: Option<u64>,
    /// RFC 3339 timestamp of the last accepted chunk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<String>,
    /// Lowest byte offset not yet received; where a resuming client should
    /// continue from.
    pub next_byte: u64,
    #[serde(default)]
    pub covered_intervals: Vec<ByteRange>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_intervals: Vec<ByteRange>,
    /// Hex SHA-256 of the assembled artifact (complete transfers only).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub artifact_sha256: String,
}

impl StatusReport {
    /// Report for an identifier with no record in memory or in the store.
    pub fn not_found(transfer_id: &str) -> Self {
        Self {
            transfer_id: transfer_id.to_string(),
            status: TransferStatus::NotFound,
            received_bytes: 0,
            total_bytes: None,
            last_updated: None,
            next_byte: 0,
            covered_intervals: Vec::new(),
            missing_intervals: Vec::new(),
            artifact_sha256: String::new(),
        }
    }
}

/// Returned for every accepted chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestReceipt {
    /// Lowest byte not yet covered by any accepted chunk.
    pub next_expected_byte: u64,
}

/// `Content-Range` value for a served byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentRange {
    pub start: u64,
    pub end: u64,
    pub total_size: u64,
}

impl ContentRange {
    /// Number of bytes in the served range.
    pub fn content_length(&self) -> u64 {
        self.end - self.start + 1
    }
}

impl fmt::Display for ContentRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bytes {}-{}/{}", self.start, self.end, self.total_size)
    }
}

/// Sidecar written next to a persisted incomplete artifact.
///
/// The artifact holds the covered intervals back to back with the gaps
/// removed; `intervals` says where each run of bytes belongs in the full file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialManifest {
    pub transfer_id: String,
    pub total_size: u64,
    pub intervals: Vec<ByteRange>,
    pub persisted_at: String,
}

impl PartialManifest {
    /// Offset inside the partial artifact where the bytes of `intervals[index]`
    /// start.
    pub fn artifact_offset(&self, index: usize) -> u64 {
        self.intervals.iter().take(index).map(ByteRange::len).sum()
    }
}
