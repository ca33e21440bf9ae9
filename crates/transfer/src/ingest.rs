use chrono::{DateTime, Utc};
use rangeload_protocol::{ByteRange, IngestReceipt, additive_checksum, parse_chunk_frame};
use tracing::debug;

use crate::registry::SessionSlot;
use crate::session::{Chunk, FragmentRecord, ReceivingSession, SessionState};
use crate::{TransferEngine, TransferError, validate_range, validate_transfer_id};

/// What accepting one fragment did to its session.
struct Accepted {
    next_expected: u64,
    complete: bool,
}

impl TransferEngine {
    /// Accepts one chunk of a transfer.
    ///
    /// The payload is verified and written to its own fragment blob before
    /// the range is registered, so a failed or aborted write never shows up
    /// in the coverage. When the chunk completes the transfer, the artifact is
    /// assembled before this returns.
    ///
    /// Returns the lowest byte offset still missing.
    pub async fn ingest_chunk(&self, chunk: Chunk) -> Result<IngestReceipt, TransferError> {
        validate_transfer_id(&chunk.transfer_id)?;
        let range = check_shape(&chunk)?;
        verify_payload(&chunk.payload, chunk.checksum)?;

        let (handle, mut slot) = self.registry.lock_or_create(&chunk.transfer_id).await;
        let result = match self.restore_locked(&chunk.transfer_id, &mut slot).await {
            Ok(()) => self.ingest_locked(&mut slot, &chunk, range).await,
            Err(e) => Err(e),
        };
        if slot.state.is_none() {
            // First chunk of an unknown transfer was refused.
            self.registry
                .retire(&chunk.transfer_id, &handle, &mut slot)
                .await;
        }
        result
    }

    /// Parses a raw chunk frame (see [`rangeload_protocol::wire`]) and
    /// ingests it.
    pub async fn ingest_frame(
        &self,
        transfer_id: &str,
        frame: &[u8],
        declared_total_size: Option<u64>,
    ) -> Result<IngestReceipt, TransferError> {
        let frame = parse_chunk_frame(frame)?;
        self.ingest_chunk(Chunk {
            transfer_id: transfer_id.to_string(),
            start: u64::from(frame.header.start),
            end: u64::from(frame.header.end),
            payload: frame.payload.to_vec(),
            checksum: frame.header.checksum,
            declared_total_size,
        })
        .await
    }

    async fn ingest_locked(
        &self,
        slot: &mut SessionSlot,
        chunk: &Chunk,
        range: ByteRange,
    ) -> Result<IngestReceipt, TransferError> {
        let id = chunk.transfer_id.as_str();
        let now = Utc::now();

        // A persisted transfer is revived off to the side; the slot keeps
        // pointing at the partial artifact until the new fragment is stored.
        let mut revived = None;
        match &slot.state {
            Some(SessionState::Complete(done)) => {
                reconcile_size(Some(done.total_size), chunk.declared_total_size)?;
                validate_range(range.start, range.end, Some(done.total_size))?;
                debug!(transfer_id = %id, %range, "chunk for completed transfer ignored");
                return Ok(IngestReceipt {
                    next_expected_byte: done.total_size,
                });
            }
            Some(SessionState::PersistedIncomplete(persisted)) => {
                reconcile_size(Some(persisted.total_size), chunk.declared_total_size)?;
                validate_range(range.start, range.end, Some(persisted.total_size))?;
                revived = Some(self.revive(id, persisted, now).await?);
            }
            _ => {}
        }

        let current = revived.as_ref().or(match &slot.state {
            Some(SessionState::Receiving(s)) => Some(s),
            _ => None,
        });
        let stored = self.store_chunk(current, chunk, range, now).await;
        let (fragment, total) = match stored {
            Ok(stored) => stored,
            Err(e) => {
                if let Some(session) = revived {
                    for path in session.fragment_paths() {
                        self.store.remove_blob(&path).await;
                    }
                }
                return Err(e);
            }
        };
        if let Some(session) = revived {
            slot.state = Some(SessionState::Receiving(session));
            self.discard_partial(id).await;
        }

        let accepted = match &mut slot.state {
            Some(SessionState::Receiving(session)) => accept(session, range, fragment, total)?,
            _ => {
                let mut session = ReceivingSession::new(total, now);
                let accepted = accept(&mut session, range, fragment, total)?;
                slot.state = Some(SessionState::Receiving(session));
                accepted
            }
        };

        debug!(
            transfer_id = %id,
            %range,
            next_expected = accepted.next_expected,
            "chunk accepted"
        );

        if accepted.complete {
            self.assemble_locked(id, slot).await?;
        }

        Ok(IngestReceipt {
            next_expected_byte: accepted.next_expected,
        })
    }

    /// Checks the chunk against the session it extends and writes its
    /// fragment blob. Returns the record and the size the session will have.
    async fn store_chunk(
        &self,
        session: Option<&ReceivingSession>,
        chunk: &Chunk,
        range: ByteRange,
        now: DateTime<Utc>,
    ) -> Result<(FragmentRecord, Option<u64>), TransferError> {
        let (existing_total, held_end) = session
            .map(|s| (s.total_size, s.intervals.max_end()))
            .unwrap_or((None, None));
        let total = reconcile_size(existing_total, chunk.declared_total_size)?;
        validate_range(range.start, range.end, total)?;
        if let (Some(total), Some(held_end)) = (total, held_end) {
            // A size declared late must still cover what was already received.
            validate_range(held_end, held_end, Some(total))?;
        }

        let path = self
            .store
            .write_fragment(&chunk.transfer_id, range, &chunk.payload)
            .await?;
        let fragment = FragmentRecord {
            path,
            checksum: chunk.checksum,
            received_at: now,
        };
        Ok((fragment, total))
    }
}

fn accept(
    session: &mut ReceivingSession,
    range: ByteRange,
    fragment: FragmentRecord,
    total: Option<u64>,
) -> Result<Accepted, TransferError> {
    session.total_size = total;
    session.record(range, fragment)?;
    Ok(Accepted {
        next_expected: session.intervals.next_expected(),
        complete: total.is_some_and(|t| session.intervals.is_complete(t)),
    })
}

/// Validates the range and that the payload length matches it.
fn check_shape(chunk: &Chunk) -> Result<ByteRange, TransferError> {
    validate_range(chunk.start, chunk.end, None)?;
    let range = ByteRange::new(chunk.start, chunk.end);
    if chunk.payload.len() as u64 != range.len() {
        return Err(TransferError::MalformedRange(format!(
            "range {range} needs {} bytes, payload has {}",
            range.len(),
            chunk.payload.len()
        )));
    }
    Ok(range)
}

fn verify_payload(payload: &[u8], declared: u8) -> Result<(), TransferError> {
    let computed = additive_checksum(payload);
    if computed != declared {
        return Err(TransferError::ChecksumMismatch { declared, computed });
    }
    Ok(())
}

/// Merges a declared size into the session's size. Once set, the size never
/// changes.
fn reconcile_size(existing: Option<u64>, declared: Option<u64>) -> Result<Option<u64>, TransferError> {
    match (existing, declared) {
        (Some(existing), Some(declared)) if existing != declared => {
            Err(TransferError::SizeConflict { existing, declared })
        }
        (Some(existing), _) => Ok(Some(existing)),
        (None, declared) => Ok(declared),
    }
}
