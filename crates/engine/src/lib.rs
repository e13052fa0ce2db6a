//! Embedded, level-structured persistent ordered trees.
//!
//! Two stores share one engine:
//!
//! - [`KvDb`]: byte-string keys in lexicographic order, with point lookup,
//!   rank lookup, ordered cursors and predicate scans. A later write of the
//!   same key replaces the earlier one.
//! - [`HrDb`]: rectangle keys packed along a Hilbert curve, with
//!   intersection search. Equal rectangles coexist.
//!
//! Writes go to a write-ahead log and an in-memory buffer. A full buffer is
//! written out as an immutable segment on level 0; full levels are merged
//! into the next one. Reads consult the buffer, then segments newest to
//! oldest, through a shared LRU cache of decoded nodes.
//!
//! ```text
//! <dir>/MANIFEST                          live segments + log generation
//! <dir>/00000000000000000007-00000000.seg  segment seq 7 on level 0
//! <dir>/wal-00000000000000000003.log       log of the current buffer
//! ```

mod config;
mod cursor;
mod error;
mod hr;
mod kv;
mod levels;
mod manifest;
mod tree;

pub use config::Config;
pub use cursor::Cursor;
pub use error::{DbError, Result};
pub use hr::HrDb;
pub use kv::KvDb;
pub use segment::{BoundingBox, CacheStats, KeyKind, MinKey, Rect, Reducer};
