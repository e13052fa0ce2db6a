//! # Segment: immutable ordered tree files
//!
//! A segment is a write-once, read-many file holding a complete ordered
//! tree of key/value entries. Segments are produced by flushing the write
//! buffer or by merging older segments, and are never modified in place.
//!
//! ## File layout
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │ LEAF NODES (contiguous, in key order)         │
//! │                                               │
//! │ frame(leaf 0) | frame(leaf 1) | ...           │
//! ├───────────────────────────────────────────────┤  <- leaf_end
//! │ INTERNAL NODES (built bottom-up, root last)   │
//! │                                               │
//! │ child := fence | aggregate | count | handle   │
//! ├───────────────────────────────────────────────┤
//! │ FOOTER (always last FOOTER_BYTES bytes)       │
//! │                                               │
//! │ root | height | entry_count | leaf_end | kind │
//! │ flags | version | crc32 | magic "SEG1"        │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! Every internal child carries the number of entries below it, so any
//! rank can be located in `O(height)` node reads, and the reduced
//! aggregate of its subtree, so searches can prune whole subtrees.
//!
//! All integers are little-endian.

mod cache;
mod format;
pub mod hilbert;
mod node;
mod reader;
mod rect;
mod reduce;
mod writer;

use std::borrow::Cow;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub use cache::{CacheStats, CachedNode, NodeCache, NodeClass};
pub use format::{DecodeError, Footer, FOOTER_BYTES, FORMAT_VERSION, SEGMENT_MAGIC};
pub use node::{ChildRef, Entry, Node, NodeHandle};
pub use reader::{Segment, SegmentCursor};
pub use rect::Rect;
pub use reduce::{BoundingBox, MinKey, Reducer};
pub use writer::{SegmentSummary, SegmentWriter, WriterOptions};

/// Ordering discipline of the keys stored in a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum KeyKind {
    /// Arbitrary byte-string keys in lexicographic order.
    Scalar = 0,
    /// Rectangle keys ordered by the Hilbert index of their centre.
    Spatial = 1,
}

impl KeyKind {
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(KeyKind::Scalar),
            1 => Some(KeyKind::Spatial),
            _ => None,
        }
    }

    /// The byte string entries are sorted by.
    ///
    /// Scalar keys sort by themselves. A spatial key sorts by the big-endian
    /// Hilbert index of its centre followed by its own encoding, so equal
    /// centres still have a total order.
    pub fn order_key<'a>(&self, key: &'a [u8]) -> Cow<'a, [u8]> {
        match self {
            KeyKind::Scalar => Cow::Borrowed(key),
            KeyKind::Spatial => {
                let index = Rect::from_bytes(key)
                    .map(|r| {
                        let (cx, cy) = r.center();
                        hilbert::xy_to_index(cx, cy)
                    })
                    .unwrap_or(u64::MAX);
                let mut out = Vec::with_capacity(8 + key.len());
                out.extend_from_slice(&index.to_be_bytes());
                out.extend_from_slice(key);
                Cow::Owned(out)
            }
        }
    }

    /// Whether later writes of an equal key replace earlier ones.
    pub fn replaces_equal_keys(&self) -> bool {
        matches!(self, KeyKind::Scalar)
    }
}

/// Errors raised while writing or reading segment files.
#[derive(Debug, Error)]
pub enum SegmentError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("corrupt segment {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("entries added out of order")]
    Unsorted,
}

pub type Result<T> = std::result::Result<T, SegmentError>;
