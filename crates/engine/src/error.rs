use std::io;
use std::path::PathBuf;

use segment::SegmentError;
use thiserror::Error;
use wal::WalError;

/// Errors returned by store operations.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("cannot open store at {path}: {reason}")]
    OpenFailure { path: PathBuf, reason: String },

    /// Reading the key or value of an exhausted cursor.
    #[error("cursor is not positioned at an entry")]
    NotFound,

    #[error("rank {rank} is out of range for {len} entries")]
    OutOfRange { rank: u64, len: u64 },

    #[error("corrupt segment {segment}: {reason}")]
    CorruptSegment { segment: PathBuf, reason: String },

    #[error("configuration conflict: {0}")]
    ConfigConflict(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("wal error: {0}")]
    Wal(#[from] WalError),
}

impl From<SegmentError> for DbError {
    fn from(err: SegmentError) -> Self {
        match err {
            SegmentError::Io(e) => DbError::Io(e),
            SegmentError::Corrupt { path, reason } => DbError::CorruptSegment {
                segment: path,
                reason,
            },
            SegmentError::Unsorted => DbError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                "segment entries produced out of order",
            )),
        }
    }
}

pub type Result<T> = std::result::Result<T, DbError>;
