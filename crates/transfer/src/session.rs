use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, SecondsFormat, Utc};
use rangeload_protocol::{ByteRange, StatusReport, TransferStatus, additive_checksum};

use crate::{IntervalSet, TransferError};

/// A byte-range chunk of one transfer, as handed over by the transport.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub transfer_id: String,
    /// First byte offset (inclusive).
    pub start: u64,
    /// Last byte offset (inclusive).
    pub end: u64,
    pub payload: Vec<u8>,
    /// Declared checksum, `sum(payload) mod 256`.
    pub checksum: u8,
    /// Full file size, if the sender knows it.
    pub declared_total_size: Option<u64>,
}

impl Chunk {
    /// Builds a chunk whose checksum is computed from `payload`.
    pub fn sealed(transfer_id: impl Into<String>, start: u64, end: u64, payload: Vec<u8>) -> Self {
        let checksum = additive_checksum(&payload);
        Self {
            transfer_id: transfer_id.into(),
            start,
            end,
            payload,
            checksum,
            declared_total_size: None,
        }
    }

    /// Sets the declared full file size.
    pub fn with_total_size(mut self, total_size: u64) -> Self {
        self.declared_total_size = Some(total_size);
        self
    }
}

/// Where one accepted chunk's payload lives until assembly.
#[derive(Debug, Clone)]
pub(crate) struct FragmentRecord {
    pub path: PathBuf,
    pub checksum: u8,
    pub received_at: DateTime<Utc>,
}

/// A transfer that is still accepting chunks.
#[derive(Debug)]
pub(crate) struct ReceivingSession {
    pub total_size: Option<u64>,
    pub intervals: IntervalSet,
    /// Keyed by exact range; ordered by start, which is assembly order.
    pub fragments: BTreeMap<ByteRange, FragmentRecord>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl ReceivingSession {
    pub fn new(total_size: Option<u64>, now: DateTime<Utc>) -> Self {
        Self {
            total_size,
            intervals: IntervalSet::new(),
            fragments: BTreeMap::new(),
            created_at: now,
            last_activity: now,
        }
    }

    /// Records a fragment whose blob has already been written.
    ///
    /// An identical range replaces the previous record, so retransmits do not
    /// pile up.
    pub fn record(&mut self, range: ByteRange, fragment: FragmentRecord) -> Result<(), TransferError> {
        self.intervals.insert(range.start, range.end)?;
        if fragment.received_at > self.last_activity {
            self.last_activity = fragment.received_at;
        }
        self.fragments.insert(range, fragment);
        Ok(())
    }

    /// `true` when neither the session nor any of its fragments saw activity
    /// after `cutoff`.
    pub fn is_stale(&self, cutoff: DateTime<Utc>) -> bool {
        self.created_at <= cutoff && self.fragments.values().all(|f| f.received_at <= cutoff)
    }

    pub fn fragment_paths(&self) -> Vec<PathBuf> {
        self.fragments.values().map(|f| f.path.clone()).collect()
    }
}

/// A transfer whose artifact has been assembled.
#[derive(Debug)]
pub(crate) struct CompletedSession {
    pub total_size: u64,
    pub sha256: String,
    pub last_activity: DateTime<Utc>,
}

/// A stalled transfer whose held bytes were saved as a partial artifact.
#[derive(Debug)]
pub(crate) struct PersistedSession {
    pub total_size: u64,
    /// Intervals stored, back to back, in the partial artifact.
    pub intervals: IntervalSet,
    pub last_activity: DateTime<Utc>,
}

/// State of one transfer. Only receiving sessions carry fragments.
#[derive(Debug)]
pub(crate) enum SessionState {
    Receiving(ReceivingSession),
    Complete(CompletedSession),
    PersistedIncomplete(PersistedSession),
}

impl SessionState {
    pub fn status(&self) -> TransferStatus {
        match self {
            SessionState::Receiving(s) if s.fragments.is_empty() => TransferStatus::Pending,
            SessionState::Receiving(_) => TransferStatus::Partial,
            SessionState::Complete(_) => TransferStatus::Complete,
            SessionState::PersistedIncomplete(_) => TransferStatus::PersistedIncomplete,
        }
    }

    pub fn report(&self, transfer_id: &str) -> StatusReport {
        let mut report = StatusReport::not_found(transfer_id);
        report.status = self.status();

        match self {
            SessionState::Receiving(s) => {
                fill_coverage(&mut report, &s.intervals, s.total_size);
                report.last_updated = Some(rfc3339(s.last_activity));
            }
            SessionState::Complete(s) => {
                report.received_bytes = s.total_size;
                report.total_bytes = Some(s.total_size);
                report.next_byte = s.total_size;
                report.covered_intervals = vec![ByteRange::new(0, s.total_size - 1)];
                report.artifact_sha256 = s.sha256.clone();
                report.last_updated = Some(rfc3339(s.last_activity));
            }
            SessionState::PersistedIncomplete(s) => {
                fill_coverage(&mut report, &s.intervals, Some(s.total_size));
                report.last_updated = Some(rfc3339(s.last_activity));
            }
        }
        report
    }
}

fn fill_coverage(report: &mut StatusReport, intervals: &IntervalSet, total_size: Option<u64>) {
    report.received_bytes = intervals.covered_bytes();
    report.total_bytes = total_size;
    report.next_byte = intervals.next_expected();
    report.covered_intervals = intervals.ranges().to_vec();
    report.missing_intervals = total_size.map(|t| intervals.gaps(t)).unwrap_or_default();
}

pub(crate) fn rfc3339(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}
