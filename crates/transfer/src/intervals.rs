use rangeload_protocol::ByteRange;

use crate::TransferError;

/// Merged set of received byte ranges for one transfer.
///
/// Ranges are kept sorted by start and never overlap or touch: inserting
/// `[a, b]` next to `[b + 1, c]` leaves the single range `[a, c]`. Coverage is
/// therefore never double-counted, however often a range is retransmitted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntervalSet {
    ranges: Vec<ByteRange>,
}

impl IntervalSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts the inclusive range `[start, end]`, coalescing with every
    /// existing range it overlaps or touches.
    pub fn insert(&mut self, start: u64, end: u64) -> Result<(), TransferError> {
        validate_range(start, end, None)?;

        // First range that ends at or after `start - 1`.
        let lo = self
            .ranges
            .partition_point(|r| r.end.saturating_add(1) < start);
        // First range that begins after `end + 1`.
        let hi = self
            .ranges
            .partition_point(|r| r.start <= end.saturating_add(1));

        let mut merged = ByteRange::new(start, end);
        if lo < hi {
            merged.start = merged.start.min(self.ranges[lo].start);
            merged.end = merged.end.max(self.ranges[hi - 1].end);
        }
        self.ranges.splice(lo..hi, std::iter::once(merged));
        Ok(())
    }

    /// Total bytes covered by the merged ranges.
    pub fn covered_bytes(&self) -> u64 {
        self.ranges.iter().map(ByteRange::len).sum()
    }

    /// `true` iff the set is exactly `[0, total_size - 1]`.
    pub fn is_complete(&self, total_size: u64) -> bool {
        total_size > 0 && self.ranges == [ByteRange::new(0, total_size - 1)]
    }

    /// Lowest byte offset not covered yet.
    pub fn next_expected(&self) -> u64 {
        match self.ranges.first() {
            Some(first) if first.start == 0 => first.end + 1,
            _ => 0,
        }
    }

    /// Ranges of `[0, total_size)` that are still missing.
    pub fn gaps(&self, total_size: u64) -> Vec<ByteRange> {
        let mut gaps = Vec::new();
        let mut cursor = 0u64;
        for r in &self.ranges {
            if r.start >= total_size {
                break;
            }
            if r.start > cursor {
                gaps.push(ByteRange::new(cursor, r.start - 1));
            }
            cursor = r.end + 1;
        }
        if cursor < total_size {
            gaps.push(ByteRange::new(cursor, total_size - 1));
        }
        gaps
    }

    /// Highest covered byte offset, if any.
    pub fn max_end(&self) -> Option<u64> {
        self.ranges.last().map(|r| r.end)
    }

    pub fn ranges(&self) -> &[ByteRange] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

/// Checks that `[start, end]` is well formed and, when the total size is
/// known, lies inside `[0, total_size)`.
///
/// `u64::MAX` is never a valid end: the byte after it, and so the length of
/// any range reaching it, is not representable.
pub fn validate_range(start: u64, end: u64, total_size: Option<u64>) -> Result<(), TransferError> {
    if start > end {
        return Err(TransferError::MalformedRange(format!(
            "start {start} is after end {end}"
        )));
    }
    if end == u64::MAX {
        return Err(TransferError::MalformedRange(format!(
            "end offset {end} is out of the addressable range"
        )));
    }
    if let Some(total) = total_size {
        if end >= total {
            return Err(TransferError::OutOfRange { start, end, total });
        }
    }
    Ok(())
}
