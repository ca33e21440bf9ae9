use std::io::ErrorKind;

use chrono::{DateTime, Utc};
use rangeload_protocol::StatusReport;

use crate::intervals::IntervalSet;
use crate::registry::{SessionRegistry, SessionSlot};
use crate::session::{CompletedSession, PersistedSession, ReceivingSession, SessionState};
use crate::store::{BlobStore, io_err};
use crate::{EngineConfig, TransferError, validate_range, validate_transfer_id};

/// Entry point for every transfer operation.
///
/// Share it behind an `Arc`; all methods take `&self`.
#[derive(Debug)]
pub struct TransferEngine {
    pub(crate) config: EngineConfig,
    pub(crate) store: BlobStore,
    pub(crate) registry: SessionRegistry,
}

impl TransferEngine {
    /// Opens the engine, creating the store directories if needed.
    ///
    /// Receiving sessions are held in memory only. Finished and persisted
    /// transfers are rebuilt from the store when first asked for, so they
    /// outlive both the process and their registry record.
    pub async fn open(config: EngineConfig) -> Result<Self, TransferError> {
        let store = BlobStore::open(&config.data_dir).await?;
        tracing::info!(
            data_dir = %config.data_dir.display(),
            staleness_secs = config.staleness_window.as_secs(),
            "transfer engine opened"
        );
        Ok(Self {
            config,
            store,
            registry: SessionRegistry::default(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Registers a new transfer under a server-generated id.
    ///
    /// The session starts `pending`; `declared_total_size` may be given now
    /// or by a later chunk.
    pub async fn create_transfer(
        &self,
        declared_total_size: Option<u64>,
    ) -> Result<String, TransferError> {
        if declared_total_size == Some(0) {
            return Err(TransferError::MalformedRange(
                "declared size must be at least 1 byte".into(),
            ));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let (_handle, mut slot) = self.registry.lock_or_create(&id).await;
        slot.state = Some(SessionState::Receiving(ReceivingSession::new(
            declared_total_size,
            Utc::now(),
        )));

        tracing::info!(transfer_id = %id, total_size = ?declared_total_size, "transfer created");
        Ok(id)
    }

    /// Current state of a transfer, or a `not_found` report.
    pub async fn get_status(&self, transfer_id: &str) -> StatusReport {
        if validate_transfer_id(transfer_id).is_err() {
            return StatusReport::not_found(transfer_id);
        }
        let (handle, mut slot) = self.registry.lock_or_create(transfer_id).await;
        if let Err(e) = self.restore_locked(transfer_id, &mut slot).await {
            tracing::warn!(transfer_id = %transfer_id, "could not restore transfer: {e}");
        }
        match &slot.state {
            Some(state) => state.report(transfer_id),
            None => {
                self.registry.retire(transfer_id, &handle, &mut slot).await;
                StatusReport::not_found(transfer_id)
            }
        }
    }

    /// Ids of every transfer the registry currently holds in memory.
    ///
    /// Transfers evicted by reclamation are not listed, though their
    /// artifacts stay on disk.
    pub async fn transfer_ids(&self) -> Vec<String> {
        self.registry.ids().await
    }

    /// Fills an empty slot from the store: a partial artifact manifest
    /// restores a persisted transfer, a finished artifact a complete one.
    /// The caller holds the slot lock.
    pub(crate) async fn restore_locked(
        &self,
        id: &str,
        slot: &mut SessionSlot,
    ) -> Result<(), TransferError> {
        if slot.state.is_some() {
            return Ok(());
        }
        slot.state = self.load_state(id).await?;
        if let Some(state) = &slot.state {
            tracing::debug!(transfer_id = %id, status = ?state.status(), "transfer restored from store");
        }
        Ok(())
    }

    async fn load_state(&self, id: &str) -> Result<Option<SessionState>, TransferError> {
        if let Some(manifest) = self.store.read_manifest(id).await? {
            let path = self.store.manifest_path(id);
            if manifest.transfer_id != id {
                return Err(io_err("verify", &path)(std::io::Error::new(
                    ErrorKind::InvalidData,
                    "manifest names another transfer",
                )));
            }
            let mut intervals = IntervalSet::new();
            for range in &manifest.intervals {
                validate_range(range.start, range.end, Some(manifest.total_size))?;
                intervals.insert(range.start, range.end)?;
            }
            let last_activity = DateTime::parse_from_rfc3339(&manifest.persisted_at)
                .map(|at| at.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now());
            return Ok(Some(SessionState::PersistedIncomplete(PersistedSession {
                total_size: manifest.total_size,
                intervals,
                last_activity,
            })));
        }

        let artifact = self.store.artifact_path(id);
        let meta = match tokio::fs::metadata(&artifact).await {
            Ok(meta) if meta.is_file() && meta.len() > 0 => meta,
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_err("stat", &artifact)(e)),
        };
        let hashed = self.store.hash_blob(&artifact).await?;
        let last_activity = meta
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        Ok(Some(SessionState::Complete(CompletedSession {
            total_size: hashed.size,
            sha256: hashed.sha256,
            last_activity,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validate_transfer_id;
    use rangeload_protocol::TransferStatus;
    use tempfile::TempDir;

    #[tokio::test]
    async fn unknown_transfer_is_not_found() {
        let dir = TempDir::new().unwrap();
        let engine = TransferEngine::open(EngineConfig::new(dir.path()))
            .await
            .unwrap();

        let report = engine.get_status("nope").await;
        assert_eq!(report.status, TransferStatus::NotFound);
        assert_eq!(report.received_bytes, 0);
        assert!(report.total_bytes.is_none());
    }

    #[tokio::test]
    async fn created_transfer_is_pending() {
        let dir = TempDir::new().unwrap();
        let engine = TransferEngine::open(EngineConfig::new(dir.path()))
            .await
            .unwrap();

        let id = engine.create_transfer(Some(1024)).await.unwrap();
        assert!(validate_transfer_id(&id).is_ok());

        let report = engine.get_status(&id).await;
        assert_eq!(report.status, TransferStatus::Pending);
        assert_eq!(report.total_bytes, Some(1024));
        assert!(report.last_updated.is_some());
        assert_eq!(engine.transfer_ids().await, vec![id]);
    }

    #[tokio::test]
    async fn status_is_rebuilt_from_the_store() {
        let dir = TempDir::new().unwrap();
        {
            let engine = TransferEngine::open(EngineConfig::new(dir.path()))
                .await
                .unwrap();
            let chunk = crate::Chunk::sealed("done", 0, 4, b"hello".to_vec()).with_total_size(5);
            engine.ingest_chunk(chunk).await.unwrap();
        }
        std::fs::write(
            dir.path().join("artifacts/half.incomplete.json"),
            r#"{"transferId":"half","totalSize":100,"intervals":[{"start":0,"end":9}],"persistedAt":"2026-01-01T00:00:00.000Z"}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("artifacts/half.incomplete"), [1u8; 10]).unwrap();

        // A fresh engine knows nothing in memory.
        let engine = TransferEngine::open(EngineConfig::new(dir.path()))
            .await
            .unwrap();
        assert!(engine.transfer_ids().await.is_empty());

        let done = engine.get_status("done").await;
        assert_eq!(done.status, TransferStatus::Complete);
        assert_eq!(done.total_bytes, Some(5));
        assert_eq!(
            done.artifact_sha256,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );

        let half = engine.get_status("half").await;
        assert_eq!(half.status, TransferStatus::PersistedIncomplete);
        assert_eq!(half.received_bytes, 10);
        assert_eq!(half.last_updated.as_deref(), Some("2026-01-01T00:00:00.000Z"));

        // Nothing on disk, nothing left behind in the registry.
        assert_eq!(engine.get_status("nope").await.status, TransferStatus::NotFound);
        let mut ids = engine.transfer_ids().await;
        ids.sort();
        assert_eq!(ids, vec!["done".to_string(), "half".to_string()]);
    }

    #[tokio::test]
    async fn create_rejects_zero_size() {
        let dir = TempDir::new().unwrap();
        let engine = TransferEngine::open(EngineConfig::new(dir.path()))
            .await
            .unwrap();
        assert!(matches!(
            engine.create_transfer(Some(0)).await,
            Err(TransferError::MalformedRange(_))
        ));
    }
}
