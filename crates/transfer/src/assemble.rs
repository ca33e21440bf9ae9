use std::io::{self, SeekFrom};
use std::path::Path;

use chrono::{DateTime, Utc};
use rangeload_protocol::{PartialManifest, additive_checksum};
use tokio::io::AsyncSeekExt;
use tracing::info;

use crate::registry::SessionSlot;
use crate::session::{
    CompletedSession, FragmentRecord, PersistedSession, ReceivingSession, SessionState, rfc3339,
};
use crate::store::{Committed, StagedBlob, io_err, open_at};
use crate::{TransferEngine, TransferError, validate_transfer_id};

impl TransferEngine {
    /// Assembles the artifact of a fully covered transfer.
    ///
    /// A transfer that is already complete is left as is.
    pub async fn assemble(&self, transfer_id: &str) -> Result<(), TransferError> {
        validate_transfer_id(transfer_id)?;
        let (handle, mut slot) = self.registry.lock_or_create(transfer_id).await;
        let result = match self.restore_locked(transfer_id, &mut slot).await {
            Ok(()) => self.assemble_locked(transfer_id, &mut slot).await,
            Err(e) => Err(e),
        };
        if slot.state.is_none() {
            self.registry.retire(transfer_id, &handle, &mut slot).await;
        }
        result
    }

    /// Assembly proper. The caller holds the slot lock.
    pub(crate) async fn assemble_locked(
        &self,
        id: &str,
        slot: &mut SessionSlot,
    ) -> Result<(), TransferError> {
        let session = match &slot.state {
            Some(SessionState::Complete(_)) => return Ok(()),
            Some(SessionState::Receiving(s)) => s,
            Some(SessionState::PersistedIncomplete(s)) => {
                return Err(TransferError::IncompleteTransfer {
                    covered: s.intervals.covered_bytes(),
                    total: Some(s.total_size),
                });
            }
            None => return Err(TransferError::NotFound(id.to_string())),
        };
        let total_size = match session.total_size {
            Some(total) if session.intervals.is_complete(total) => total,
            total => {
                return Err(TransferError::IncompleteTransfer {
                    covered: session.intervals.covered_bytes(),
                    total,
                });
            }
        };

        let committed = self
            .write_merged(session, &self.store.artifact_path(id))
            .await?;
        let fragments = session.fragment_paths();

        slot.state = Some(SessionState::Complete(CompletedSession {
            total_size,
            sha256: committed.sha256.clone(),
            last_activity: Utc::now(),
        }));
        for path in fragments {
            self.store.remove_blob(&path).await;
        }

        info!(
            transfer_id = %id,
            size = committed.size,
            sha256 = %committed.sha256,
            "artifact assembled"
        );
        Ok(())
    }

    /// Saves the held bytes of a receiving session as a partial artifact
    /// plus manifest, then drops its fragments. The caller holds the slot
    /// lock and has checked that the size is known.
    pub(crate) async fn persist_partial_locked(
        &self,
        id: &str,
        slot: &mut SessionSlot,
        now: DateTime<Utc>,
    ) -> Result<(), TransferError> {
        let Some(SessionState::Receiving(session)) = &slot.state else {
            return Ok(());
        };
        let Some(total_size) = session.total_size else {
            return Err(TransferError::IncompleteTransfer {
                covered: session.intervals.covered_bytes(),
                total: None,
            });
        };

        let partial = self.store.partial_path(id);
        let committed = self.write_merged(session, &partial).await?;

        let manifest = PartialManifest {
            transfer_id: id.to_string(),
            total_size,
            intervals: session.intervals.ranges().to_vec(),
            persisted_at: rfc3339(now),
        };
        if let Err(e) = self.store.write_manifest(&manifest).await {
            self.store.remove_blob(&partial).await;
            return Err(e);
        }

        let fragments = session.fragment_paths();
        let persisted = PersistedSession {
            total_size,
            intervals: session.intervals.clone(),
            last_activity: session.last_activity,
        };
        slot.state = Some(SessionState::PersistedIncomplete(persisted));
        for path in fragments {
            self.store.remove_blob(&path).await;
        }

        info!(
            transfer_id = %id,
            covered = committed.size,
            total = total_size,
            "incomplete transfer persisted"
        );
        Ok(())
    }

    /// Turns a persisted partial artifact back into fragments, using the
    /// manifest to place each run of bytes. The artifact is streamed, one
    /// interval at a time.
    pub(crate) async fn revive(
        &self,
        id: &str,
        persisted: &PersistedSession,
        now: DateTime<Utc>,
    ) -> Result<ReceivingSession, TransferError> {
        let manifest_path = self.store.manifest_path(id);
        let Some(manifest) = self.store.read_manifest(id).await? else {
            return Err(corrupt(&manifest_path, "manifest missing"));
        };
        if manifest.total_size != persisted.total_size
            || manifest.intervals != persisted.intervals.ranges()
        {
            return Err(corrupt(&manifest_path, "manifest does not match session"));
        }

        let partial = self.store.partial_path(id);
        let mut file = open_at(&partial, 0).await?;
        let held = file.metadata().await.map_err(io_err("stat", &partial))?.len();
        if held != persisted.intervals.covered_bytes() {
            return Err(corrupt(&partial, "partial artifact does not match manifest"));
        }

        let mut session = ReceivingSession::new(Some(manifest.total_size), now);
        let result: Result<(), TransferError> = async {
            for (index, range) in manifest.intervals.iter().enumerate() {
                file.seek(SeekFrom::Start(manifest.artifact_offset(index)))
                    .await
                    .map_err(io_err("seek", &partial))?;
                let (path, checksum) = self
                    .store
                    .copy_fragment(id, *range, &mut file, &partial)
                    .await?;
                session.record(
                    *range,
                    FragmentRecord {
                        path,
                        checksum,
                        received_at: now,
                    },
                )?;
            }
            Ok(())
        }
        .await;

        if let Err(e) = result {
            for path in session.fragment_paths() {
                self.store.remove_blob(&path).await;
            }
            return Err(e);
        }

        info!(
            transfer_id = %id,
            covered = session.intervals.covered_bytes(),
            "persisted transfer resumed"
        );
        Ok(session)
    }

    /// Removes a partial artifact and its manifest.
    pub(crate) async fn discard_partial(&self, id: &str) {
        self.store.remove_blob(&self.store.partial_path(id)).await;
        self.store.remove_blob(&self.store.manifest_path(id)).await;
    }

    /// Writes the session's fragments in start order into `target`, skipping
    /// bytes an earlier fragment already supplied. Gaps are collapsed.
    async fn write_merged(
        &self,
        session: &ReceivingSession,
        target: &Path,
    ) -> Result<Committed, TransferError> {
        let mut staged = self.store.stage(target).await?;
        match self.copy_fragments(session, &mut staged).await {
            Ok(()) => staged.commit().await,
            Err(e) => {
                staged.abort().await;
                Err(e)
            }
        }
    }

    async fn copy_fragments(
        &self,
        session: &ReceivingSession,
        staged: &mut StagedBlob,
    ) -> Result<(), TransferError> {
        // First byte not yet written.
        let mut cursor: Option<u64> = None;
        for (range, fragment) in &session.fragments {
            let skip = match cursor {
                Some(c) if c > range.end => continue,
                Some(c) if c > range.start => c - range.start,
                _ => 0,
            };

            let data = self.store.read_blob(&fragment.path).await?;
            if data.len() as u64 != range.len() || additive_checksum(&data) != fragment.checksum {
                return Err(corrupt(&fragment.path, "fragment does not match its record"));
            }
            staged.write(&data[skip as usize..]).await?;
            cursor = Some(range.end + 1);
        }
        Ok(())
    }
}

fn corrupt(path: &Path, what: &str) -> TransferError {
    io_err("verify", path)(io::Error::new(io::ErrorKind::InvalidData, what.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Chunk, EngineConfig};
    use rangeload_protocol::{ByteRange, TransferStatus};
    use sha2::{Digest, Sha256};
    use tempfile::TempDir;

    async fn engine(dir: &TempDir) -> TransferEngine {
        TransferEngine::open(EngineConfig::new(dir.path()))
            .await
            .unwrap()
    }

    fn data(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 256) as u8).collect()
    }

    fn chunk(id: &str, body: &[u8], start: u64, end: u64) -> Chunk {
        Chunk::sealed(id, start, end, body[start as usize..=end as usize].to_vec())
    }

    async fn persist(engine: &TransferEngine, id: &str) {
        let (_handle, mut slot) = engine.registry.lock(id).await.unwrap();
        engine
            .persist_partial_locked(id, &mut slot, Utc::now())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn assemble_unknown_is_not_found() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir).await;
        assert!(matches!(
            engine.assemble("missing").await,
            Err(TransferError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn assemble_refuses_gaps_and_unknown_size() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir).await;
        let body = data(100);

        engine.ingest_chunk(chunk("t1", &body, 0, 99)).await.unwrap();
        assert!(matches!(
            engine.assemble("t1").await,
            Err(TransferError::IncompleteTransfer {
                covered: 100,
                total: None
            })
        ));

        engine
            .ingest_chunk(chunk("t2", &body, 0, 49).with_total_size(100))
            .await
            .unwrap();
        assert!(matches!(
            engine.assemble("t2").await,
            Err(TransferError::IncompleteTransfer { covered: 50, .. })
        ));
        assert!(!dir.path().join("artifacts/t2").exists());
    }

    #[tokio::test]
    async fn overlapping_fragments_assemble_once_per_byte() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir).await;
        let body = data(300);

        engine
            .ingest_chunk(chunk("t1", &body, 100, 249).with_total_size(300))
            .await
            .unwrap();
        engine.ingest_chunk(chunk("t1", &body, 0, 149)).await.unwrap();
        engine.ingest_chunk(chunk("t1", &body, 120, 130)).await.unwrap();
        engine.ingest_chunk(chunk("t1", &body, 200, 299)).await.unwrap();

        let artifact = std::fs::read(dir.path().join("artifacts/t1")).unwrap();
        assert_eq!(artifact, body);

        let report = engine.get_status("t1").await;
        assert_eq!(report.status, TransferStatus::Complete);
        assert_eq!(report.artifact_sha256, hex::encode(Sha256::digest(&body)));

        // Already complete.
        engine.assemble("t1").await.unwrap();
    }

    #[tokio::test]
    async fn corrupted_fragment_fails_assembly_and_keeps_session() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir).await;
        let body = data(20);

        engine.ingest_chunk(chunk("t1", &body, 0, 9)).await.unwrap();
        let fragment = dir.path().join("fragments/t1_0_9.chunk");
        std::fs::write(&fragment, [0xAA; 10]).unwrap();

        let err = engine
            .ingest_chunk(chunk("t1", &body, 10, 19).with_total_size(20))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::StorageFailure { .. }));

        let report = engine.get_status("t1").await;
        assert_eq!(report.status, TransferStatus::Partial);
        assert_eq!(report.received_bytes, 20);
        assert!(!dir.path().join("artifacts/t1").exists());
        assert!(!dir.path().join("artifacts/t1.part").exists());
    }

    #[tokio::test]
    async fn partial_artifact_collapses_gaps() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir).await;
        let body = data(100);

        engine
            .ingest_chunk(chunk("t1", &body, 0, 19).with_total_size(100))
            .await
            .unwrap();
        engine.ingest_chunk(chunk("t1", &body, 10, 29)).await.unwrap();
        engine.ingest_chunk(chunk("t1", &body, 60, 79)).await.unwrap();
        persist(&engine, "t1").await;

        let partial = std::fs::read(dir.path().join("artifacts/t1.incomplete")).unwrap();
        assert_eq!(partial.len(), 50);
        assert_eq!(&partial[..30], &body[..30]);
        assert_eq!(&partial[30..], &body[60..80]);

        let manifest: PartialManifest = serde_json::from_slice(
            &std::fs::read(dir.path().join("artifacts/t1.incomplete.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(manifest.total_size, 100);
        assert_eq!(
            manifest.intervals,
            vec![ByteRange::new(0, 29), ByteRange::new(60, 79)]
        );

        let report = engine.get_status("t1").await;
        assert_eq!(report.status, TransferStatus::PersistedIncomplete);
        assert_eq!(report.received_bytes, 50);
        assert_eq!(
            std::fs::read_dir(dir.path().join("fragments")).unwrap().count(),
            0
        );
        assert!(matches!(
            engine.assemble("t1").await,
            Err(TransferError::IncompleteTransfer { covered: 50, .. })
        ));
    }

    #[tokio::test]
    async fn persisted_transfer_resumes_on_next_chunk() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir).await;
        let body = data(100);

        engine
            .ingest_chunk(chunk("t1", &body, 0, 29).with_total_size(100))
            .await
            .unwrap();
        engine.ingest_chunk(chunk("t1", &body, 60, 79)).await.unwrap();
        persist(&engine, "t1").await;

        let receipt = engine.ingest_chunk(chunk("t1", &body, 30, 59)).await.unwrap();
        assert_eq!(receipt.next_expected_byte, 80);
        let report = engine.get_status("t1").await;
        assert_eq!(report.status, TransferStatus::Partial);
        assert_eq!(report.received_bytes, 80);
        assert!(!dir.path().join("artifacts/t1.incomplete").exists());
        assert!(!dir.path().join("artifacts/t1.incomplete.json").exists());

        engine.ingest_chunk(chunk("t1", &body, 80, 99)).await.unwrap();
        let artifact = std::fs::read(dir.path().join("artifacts/t1")).unwrap();
        assert_eq!(artifact, body);
    }

    #[tokio::test]
    async fn resume_with_missing_manifest_fails_and_keeps_record() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir).await;
        let body = data(100);

        engine
            .ingest_chunk(chunk("t1", &body, 0, 29).with_total_size(100))
            .await
            .unwrap();
        persist(&engine, "t1").await;
        std::fs::remove_file(dir.path().join("artifacts/t1.incomplete.json")).unwrap();

        let err = engine
            .ingest_chunk(chunk("t1", &body, 30, 39))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::StorageFailure { .. }));
        assert_eq!(
            engine.get_status("t1").await.status,
            TransferStatus::PersistedIncomplete
        );
    }

    #[tokio::test]
    async fn failed_resume_write_keeps_partial_artifact() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir).await;
        let body = data(100);

        engine
            .ingest_chunk(chunk("t1", &body, 0, 29).with_total_size(100))
            .await
            .unwrap();
        engine.ingest_chunk(chunk("t1", &body, 60, 79)).await.unwrap();
        persist(&engine, "t1").await;

        // The new fragment cannot be renamed over a directory.
        let blocker = dir.path().join("fragments/t1_30_59.chunk");
        std::fs::create_dir(&blocker).unwrap();

        let err = engine
            .ingest_chunk(chunk("t1", &body, 30, 59))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::StorageFailure { .. }));

        let report = engine.get_status("t1").await;
        assert_eq!(report.status, TransferStatus::PersistedIncomplete);
        assert_eq!(report.received_bytes, 50);
        assert!(dir.path().join("artifacts/t1.incomplete").exists());
        assert!(dir.path().join("artifacts/t1.incomplete.json").exists());
        // Only the blocker is left; the revived fragments were dropped.
        assert_eq!(
            std::fs::read_dir(dir.path().join("fragments")).unwrap().count(),
            1
        );

        std::fs::remove_dir(&blocker).unwrap();
        let receipt = engine.ingest_chunk(chunk("t1", &body, 30, 59)).await.unwrap();
        assert_eq!(receipt.next_expected_byte, 80);
        engine.ingest_chunk(chunk("t1", &body, 80, 99)).await.unwrap();
        assert_eq!(std::fs::read(dir.path().join("artifacts/t1")).unwrap(), body);
    }

    #[tokio::test]
    async fn truncated_partial_artifact_fails_resume() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir).await;
        let body = data(100);

        engine
            .ingest_chunk(chunk("t1", &body, 0, 29).with_total_size(100))
            .await
            .unwrap();
        engine.ingest_chunk(chunk("t1", &body, 60, 79)).await.unwrap();
        persist(&engine, "t1").await;

        let partial = dir.path().join("artifacts/t1.incomplete");
        std::fs::write(&partial, &body[..40]).unwrap();

        let err = engine
            .ingest_chunk(chunk("t1", &body, 30, 59))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::StorageFailure { op: "verify", .. }));
        assert_eq!(
            engine.get_status("t1").await.status,
            TransferStatus::PersistedIncomplete
        );
        assert_eq!(
            std::fs::read_dir(dir.path().join("fragments")).unwrap().count(),
            0
        );
    }

    #[tokio::test]
    async fn resume_streams_each_interval_into_its_fragment() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir).await;
        let body = data(300);

        engine
            .ingest_chunk(chunk("t1", &body, 0, 9).with_total_size(300))
            .await
            .unwrap();
        engine.ingest_chunk(chunk("t1", &body, 100, 199)).await.unwrap();
        engine.ingest_chunk(chunk("t1", &body, 250, 259)).await.unwrap();
        persist(&engine, "t1").await;

        engine.ingest_chunk(chunk("t1", &body, 20, 29)).await.unwrap();
        let fragment = |name: &str| std::fs::read(dir.path().join("fragments").join(name)).unwrap();
        assert_eq!(fragment("t1_0_9.chunk"), &body[0..10]);
        assert_eq!(fragment("t1_100_199.chunk"), &body[100..200]);
        assert_eq!(fragment("t1_250_259.chunk"), &body[250..260]);
        assert_eq!(engine.get_status("t1").await.received_bytes, 130);
    }
}
