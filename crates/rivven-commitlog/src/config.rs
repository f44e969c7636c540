use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io;
use std::path::PathBuf;

/// Segment size used when none is configured (1 GiB)
pub const DEFAULT_SEGMENT_BYTES: u64 = 1024 * 1024 * 1024;

/// Sync mode for segment data and index writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// No sync; writes reach the OS page cache only
    None,
    /// fdatasync after every data and index write
    #[default]
    FsyncData,
    /// Full fsync after every data and index write
    Fsync,
}

impl SyncMode {
    /// Apply this mode to a file that was just written
    pub(crate) fn sync(self, file: &File) -> io::Result<()> {
        match self {
            SyncMode::None => Ok(()),
            SyncMode::FsyncData => file.sync_data(),
            SyncMode::Fsync => file.sync_all(),
        }
    }
}

/// Options for a single commit log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Root directory holding the segment files
    pub path: PathBuf,

    /// Maximum data file size in bytes before the log rotates.
    /// Zero means "unset" and is replaced by [`DEFAULT_SEGMENT_BYTES`].
    pub segment_bytes: u64,

    /// Durability of each append
    pub sync_mode: SyncMode,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            segment_bytes: DEFAULT_SEGMENT_BYTES,
            sync_mode: SyncMode::default(),
        }
    }
}

impl Options {
    /// Create options for a log rooted at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Set the segment size threshold
    pub fn with_segment_bytes(mut self, segment_bytes: u64) -> Self {
        self.segment_bytes = segment_bytes;
        self
    }

    /// Set the sync mode
    pub fn with_sync_mode(mut self, sync_mode: SyncMode) -> Self {
        self.sync_mode = sync_mode;
        self
    }

    /// Segment size with the default applied
    pub fn effective_segment_bytes(&self) -> u64 {
        if self.segment_bytes == 0 {
            DEFAULT_SEGMENT_BYTES
        } else {
            self.segment_bytes
        }
    }
}
