use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {op} failed for {path:?}: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The batch was already stamped with `offset` when the failure happened.
    #[error("Append of offset {offset} failed: {source}")]
    Append {
        offset: u64,
        #[source]
        source: Box<Error>,
    },

    #[error("Invalid record batch: {0}")]
    InvalidBatch(String),

    #[error("Invalid offset: {0}")]
    InvalidOffset(u64),

    #[error("Offset {offset} out of range [{oldest}, {newest})")]
    OffsetOutOfRange { offset: u64, oldest: u64, newest: u64 },

    #[error("Corrupt data in {path:?} at position {position}: {reason}")]
    Corrupt {
        path: PathBuf,
        position: u64,
        reason: String,
    },

    #[error("Commit log is not open")]
    NotOpen,

    #[error("Commit log is already open")]
    AlreadyOpen,

    #[error("Segment is closed")]
    Closed,
}

impl Error {
    pub(crate) fn io(op: &'static str, path: impl AsRef<Path>, source: io::Error) -> Self {
        Error::Io {
            op,
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub(crate) fn corrupt(path: impl AsRef<Path>, position: u64, reason: impl Into<String>) -> Self {
        Error::Corrupt {
            path: path.as_ref().to_path_buf(),
            position,
            reason: reason.into(),
        }
    }

    /// True for filesystem failures, including those wrapped by a failed append.
    pub fn is_io(&self) -> bool {
        match self {
            Error::Io { .. } => true,
            Error::Append { source, .. } => source.is_io(),
            _ => false,
        }
    }

    /// The offset stamped into the batch of a failed append.
    pub fn offset(&self) -> Option<u64> {
        match self {
            Error::Append { offset, .. } => Some(*offset),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
