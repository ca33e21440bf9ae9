use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{DEFAULT_READ_BLOCK_SIZE, DEFAULT_STALENESS_WINDOW};

/// Engine settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root directory; fragments and artifacts live in subdirectories.
    pub data_dir: PathBuf,
    /// Inactivity after which a transfer becomes eligible for reclamation.
    pub staleness_window: Duration,
    /// Upper bound on the size of blocks yielded by range reads.
    pub read_block_size: usize,
}

impl EngineConfig {
    /// Settings rooted at `data_dir` with default window and block size.
    pub fn new(data_dir: &Path) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
            staleness_window: DEFAULT_STALENESS_WINDOW,
            read_block_size: DEFAULT_READ_BLOCK_SIZE,
        }
    }

    pub fn with_staleness_window(mut self, window: Duration) -> Self {
        self.staleness_window = window;
        self
    }

    /// Sets the read block size; 0 falls back to [`DEFAULT_READ_BLOCK_SIZE`].
    pub fn with_read_block_size(mut self, size: usize) -> Self {
        self.read_block_size = if size == 0 {
            DEFAULT_READ_BLOCK_SIZE
        } else {
            size
        };
        self
    }
}
