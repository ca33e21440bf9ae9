//! Filesystem blob store for fragments and artifacts.
//!
//! Layout under the data directory:
//!
//! ```text
//! fragments/<id>_<start>_<end>.chunk     one blob per accepted range
//! artifacts/<id>                         assembled file
//! artifacts/<id>.incomplete              partial artifact (gaps removed)
//! artifacts/<id>.incomplete.json         interval manifest for the above
//! ```
//!
//! Every blob is written under a `.part` name and renamed into place, so a
//! reader never sees a half-written fragment or artifact.

use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rangeload_protocol::{ByteRange, PartialManifest};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufWriter};

use crate::TransferError;

const FRAGMENTS_DIR: &str = "fragments";
const ARTIFACTS_DIR: &str = "artifacts";
const STAGING_SUFFIX: &str = ".part";
const COPY_BUF_LEN: usize = 64 * 1024;

/// Builds the error mapper for a failed storage operation on `path`.
pub(crate) fn io_err(
    op: &'static str,
    path: &Path,
) -> impl FnOnce(std::io::Error) -> TransferError + use<> {
    let path = path.to_path_buf();
    move |source| TransferError::StorageFailure { op, path, source }
}

#[derive(Debug)]
pub(crate) struct BlobStore {
    fragments_dir: PathBuf,
    artifacts_dir: PathBuf,
}

impl BlobStore {
    /// Opens (and creates if needed) the store rooted at `data_dir`.
    pub async fn open(data_dir: &Path) -> Result<Self, TransferError> {
        let fragments_dir = data_dir.join(FRAGMENTS_DIR);
        let artifacts_dir = data_dir.join(ARTIFACTS_DIR);
        for dir in [&fragments_dir, &artifacts_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(io_err("create dir", dir))?;
        }
        Ok(Self {
            fragments_dir,
            artifacts_dir,
        })
    }

    pub fn fragment_path(&self, id: &str, range: ByteRange) -> PathBuf {
        self.fragments_dir
            .join(format!("{id}_{}_{}.chunk", range.start, range.end))
    }

    pub fn artifact_path(&self, id: &str) -> PathBuf {
        self.artifacts_dir.join(id)
    }

    pub fn partial_path(&self, id: &str) -> PathBuf {
        self.artifacts_dir.join(format!("{id}.incomplete"))
    }

    pub fn manifest_path(&self, id: &str) -> PathBuf {
        self.artifacts_dir.join(format!("{id}.incomplete.json"))
    }

    /// Writes a fragment blob and returns its path. Nothing is visible under
    /// the final name unless the whole payload was written.
    pub async fn write_fragment(
        &self,
        id: &str,
        range: ByteRange,
        payload: &[u8],
    ) -> Result<PathBuf, TransferError> {
        let target = self.fragment_path(id, range);
        self.write_blob(&target, payload).await?;
        Ok(target)
    }

    /// Writes `data` to `target` through a staging file.
    pub async fn write_blob(&self, target: &Path, data: &[u8]) -> Result<(), TransferError> {
        let staging = staging_path(target);
        let result = async {
            let mut file = tokio::fs::File::create(&staging)
                .await
                .map_err(io_err("create", &staging))?;
            file.write_all(data)
                .await
                .map_err(io_err("write", &staging))?;
            file.sync_all().await.map_err(io_err("sync", &staging))?;
            tokio::fs::rename(&staging, target)
                .await
                .map_err(io_err("rename", target))
        }
        .await;

        if result.is_err() {
            let _ = tokio::fs::remove_file(&staging).await;
        }
        result
    }

    /// Copies the next `range.len()` bytes of `src` into a fragment blob.
    ///
    /// Returns the fragment path and the additive checksum of the copied
    /// bytes. `src_path` is only used for error reporting.
    pub async fn copy_fragment(
        &self,
        id: &str,
        range: ByteRange,
        src: &mut tokio::fs::File,
        src_path: &Path,
    ) -> Result<(PathBuf, u8), TransferError> {
        let target = self.fragment_path(id, range);
        let staging = staging_path(&target);
        let result = async {
            let mut out = tokio::fs::File::create(&staging)
                .await
                .map_err(io_err("create", &staging))?;
            let mut buf = vec![0u8; COPY_BUF_LEN];
            let mut remaining = range.len();
            let mut checksum = 0u8;
            while remaining > 0 {
                let block = &mut buf[..remaining.min(COPY_BUF_LEN as u64) as usize];
                src.read_exact(block)
                    .await
                    .map_err(io_err("read", src_path))?;
                checksum = block.iter().fold(checksum, |acc, b| acc.wrapping_add(*b));
                out.write_all(block)
                    .await
                    .map_err(io_err("write", &staging))?;
                remaining -= block.len() as u64;
            }
            out.sync_all().await.map_err(io_err("sync", &staging))?;
            tokio::fs::rename(&staging, &target)
                .await
                .map_err(io_err("rename", &target))?;
            Ok(checksum)
        }
        .await;

        match result {
            Ok(checksum) => Ok((target, checksum)),
            Err(e) => {
                let _ = tokio::fs::remove_file(&staging).await;
                Err(e)
            }
        }
    }

    /// Size and SHA-256 of an existing blob, read in blocks.
    pub async fn hash_blob(&self, path: &Path) -> Result<Committed, TransferError> {
        let mut file = tokio::fs::File::open(path)
            .await
            .map_err(io_err("open", path))?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; COPY_BUF_LEN];
        let mut size = 0u64;
        loop {
            let n = file.read(&mut buf).await.map_err(io_err("read", path))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            size += n as u64;
        }
        Ok(Committed {
            size,
            sha256: hex::encode(hasher.finalize()),
        })
    }

    /// Deletes staging files last modified before `cutoff`. These are left
    /// behind by writes that were dropped mid-way. Returns how many were
    /// removed.
    pub async fn remove_stale_staging(&self, cutoff: DateTime<Utc>) -> usize {
        let mut removed = 0;
        for dir in [&self.fragments_dir, &self.artifacts_dir] {
            let mut entries = match tokio::fs::read_dir(dir).await {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::warn!(dir = %dir.display(), "failed to list store: {e}");
                    continue;
                }
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                if !path.to_string_lossy().ends_with(STAGING_SUFFIX) {
                    continue;
                }
                let Ok(modified) = entry.metadata().await.and_then(|m| m.modified()) else {
                    continue;
                };
                if DateTime::<Utc>::from(modified) < cutoff {
                    self.remove_blob(&path).await;
                    tracing::debug!(path = %path.display(), "stale staging file removed");
                    removed += 1;
                }
            }
        }
        removed
    }

    /// Writes the manifest of a partial artifact next to it.
    pub async fn write_manifest(&self, manifest: &PartialManifest) -> Result<(), TransferError> {
        let path = self.manifest_path(&manifest.transfer_id);
        let json = serde_json::to_vec_pretty(manifest)
            .map_err(|e| io_err("encode", &path)(std::io::Error::other(e)))?;
        self.write_blob(&path, &json).await
    }

    /// Reads the manifest of a partial artifact, if there is one.
    pub async fn read_manifest(&self, id: &str) -> Result<Option<PartialManifest>, TransferError> {
        let path = self.manifest_path(id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_err("read", &path)(e)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| io_err("decode", &path)(std::io::Error::other(e)))
    }

    pub async fn read_blob(&self, path: &Path) -> Result<Vec<u8>, TransferError> {
        tokio::fs::read(path).await.map_err(io_err("read", path))
    }

    /// Removes a blob; a blob that is already gone is not an error.
    pub async fn remove_blob(&self, path: &Path) {
        match tokio::fs::remove_file(path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %path.display(), "failed to remove blob: {e}");
            }
        }
    }

    /// Opens a staged writer that becomes `target` on commit.
    pub async fn stage(&self, target: &Path) -> Result<StagedBlob, TransferError> {
        let staging = staging_path(target);
        let file = tokio::fs::File::create(&staging)
            .await
            .map_err(io_err("create", &staging))?;
        Ok(StagedBlob {
            writer: BufWriter::new(file),
            staging,
            target: target.to_path_buf(),
            written: 0,
            hasher: Sha256::new(),
        })
    }
}

/// Opens `path` for reading, positioned at `offset`.
pub(crate) async fn open_at(path: &Path, offset: u64) -> Result<tokio::fs::File, TransferError> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(io_err("open", path))?;
    file.seek(SeekFrom::Start(offset))
        .await
        .map_err(io_err("seek", path))?;
    Ok(file)
}

fn staging_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_owned();
    name.push(STAGING_SUFFIX);
    PathBuf::from(name)
}

/// Sequential writer for an artifact, hashing as it goes.
pub(crate) struct StagedBlob {
    writer: BufWriter<tokio::fs::File>,
    staging: PathBuf,
    target: PathBuf,
    written: u64,
    hasher: Sha256,
}

/// Size and hex SHA-256 of a committed blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Committed {
    pub size: u64,
    pub sha256: String,
}

impl StagedBlob {
    pub async fn write(&mut self, data: &[u8]) -> Result<(), TransferError> {
        self.writer
            .write_all(data)
            .await
            .map_err(io_err("write", &self.staging))?;
        self.hasher.update(data);
        self.written += data.len() as u64;
        Ok(())
    }

    /// Flushes, syncs and renames the blob into place.
    pub async fn commit(mut self) -> Result<Committed, TransferError> {
        let result = async {
            self.writer
                .flush()
                .await
                .map_err(io_err("flush", &self.staging))?;
            self.writer
                .get_ref()
                .sync_all()
                .await
                .map_err(io_err("sync", &self.staging))?;
            tokio::fs::rename(&self.staging, &self.target)
                .await
                .map_err(io_err("rename", &self.target))
        }
        .await;

        if let Err(e) = result {
            let _ = tokio::fs::remove_file(&self.staging).await;
            return Err(e);
        }

        Ok(Committed {
            size: self.written,
            sha256: hex::encode(self.hasher.finalize()),
        })
    }

    /// Discards the staging file.
    pub async fn abort(self) {
        drop(self.writer);
        let _ = tokio::fs::remove_file(&self.staging).await;
    }
}
