//! K-way merge over the buffer snapshot and every live segment.
//!
//! Sources are ordered newest first; index 0 is the buffer. A min-heap keyed
//! by `(order key, source index)` yields the globally smallest key, and for
//! equal keys the newest source wins. With de-duplication on, the older
//! copies are then skipped.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;

use segment::{Entry, KeyKind, SegmentCursor};

use crate::error::{DbError, Result};
use crate::levels::Version;

enum SourceKind {
    Snapshot { entries: Arc<Vec<Entry>>, pos: usize },
    Segment { cursor: SegmentCursor, collapse: bool },
}

/// One ordered input of a merge, buffered one entry ahead.
pub(crate) struct Source {
    kind: SourceKind,
    current: Option<Entry>,
}

impl Source {
    /// A sorted, duplicate-free snapshot starting at `pos`.
    pub(crate) fn snapshot(entries: Arc<Vec<Entry>>, pos: usize) -> Result<Self> {
        let mut source = Self {
            kind: SourceKind::Snapshot { entries, pos },
            current: None,
        };
        source.fill()?;
        Ok(source)
    }

    /// A segment cursor. With `collapse`, runs of equal keys are reduced
    /// to their last (newest) entry.
    pub(crate) fn segment(cursor: SegmentCursor, collapse: bool) -> Result<Self> {
        let mut source = Self {
            kind: SourceKind::Segment { cursor, collapse },
            current: None,
        };
        source.fill()?;
        Ok(source)
    }

    fn fill(&mut self) -> Result<()> {
        self.current = match &mut self.kind {
            SourceKind::Snapshot { entries, pos } => {
                let next = entries.get(*pos).cloned();
                *pos += 1;
                next
            }
            SourceKind::Segment { cursor, collapse } => match cursor.entry().cloned() {
                None => None,
                Some(mut entry) => {
                    cursor.advance()?;
                    while *collapse {
                        match cursor.entry() {
                            Some(next) if next.key == entry.key => {
                                entry = next.clone();
                                cursor.advance()?;
                            }
                            _ => break,
                        }
                    }
                    Some(entry)
                }
            },
        };
        Ok(())
    }

    fn take(&mut self) -> Result<Option<Entry>> {
        let entry = self.current.take();
        self.fill()?;
        Ok(entry)
    }
}

pub(crate) struct Merger {
    kind: KeyKind,
    dedup: bool,
    sources: Vec<Source>,
    heap: BinaryHeap<Reverse<(Vec<u8>, usize)>>,
}

impl Merger {
    pub(crate) fn new(kind: KeyKind, dedup: bool, sources: Vec<Source>) -> Self {
        let heap = sources
            .iter()
            .enumerate()
            .filter_map(|(idx, s)| {
                s.current
                    .as_ref()
                    .map(|e| Reverse((kind.order_key(&e.key).into_owned(), idx)))
            })
            .collect();
        Self {
            kind,
            dedup,
            sources,
            heap,
        }
    }

    pub(crate) fn next_entry(&mut self) -> Result<Option<Entry>> {
        let Some(Reverse((order, idx))) = self.heap.pop() else {
            return Ok(None);
        };
        let entry = self.pop_from(idx)?;
        if self.dedup {
            while self.heap.peek().is_some_and(|Reverse((next, _))| *next == order) {
                if let Some(Reverse((_, older))) = self.heap.pop() {
                    self.pop_from(older)?;
                }
            }
        }
        Ok(entry)
    }

    fn pop_from(&mut self, idx: usize) -> Result<Option<Entry>> {
        let source = &mut self.sources[idx];
        let entry = source.take()?;
        if let Some(next) = &source.current {
            let order = self.kind.order_key(&next.key).into_owned();
            self.heap.push(Reverse((order, idx)));
        }
        Ok(entry)
    }
}

/// In-order cursor over the merged, de-duplicated view of a key-value
/// store.
///
/// A cursor pins the segment set and a snapshot of the buffer from the
/// moment it was created: later writes are invisible to it, and segments it
/// reads are not deleted until it is dropped.
///
/// ```text
/// let mut cursor = db.begin()?;
/// while cursor.has_next() {
///     println!("{:?} = {:?}", cursor.key()?, cursor.value()?);
///     cursor.next()?;
/// }
/// ```
pub struct Cursor {
    version: Arc<Version>,
    snapshot: Arc<Vec<Entry>>,
    merger: Merger,
    current: Option<Entry>,
}

impl Cursor {
    pub(crate) fn new(version: Arc<Version>, snapshot: Arc<Vec<Entry>>) -> Self {
        Self {
            version,
            snapshot,
            merger: Merger::new(KeyKind::Scalar, true, Vec::new()),
            current: None,
        }
    }

    /// Positions the cursor at the smallest key.
    pub fn begin(&mut self) -> Result<()> {
        self.seek_key(&[])
    }

    /// Positions the cursor at the first key not less than `key`.
    pub fn seek_key(&mut self, key: &[u8]) -> Result<()> {
        let pos = self.snapshot.partition_point(|e| e.key.as_slice() < key);
        let mut sources = vec![Source::snapshot(Arc::clone(&self.snapshot), pos)?];
        for segment in self.version.newest_first() {
            let collapse = !segment.is_distinct();
            sources.push(Source::segment(segment.seek(key)?, collapse)?);
        }
        self.merger = Merger::new(KeyKind::Scalar, true, sources);
        self.current = self.merger.next_entry()?;
        Ok(())
    }

    /// Positions the cursor at the entry of 0-based `rank`, or exhausts it
    /// when there are not that many entries.
    ///
    /// A view made of one duplicate-free segment and an empty buffer is
    /// answered by a single descent on subtree counts; anything else is
    /// walked from the start.
    pub fn seek_index(&mut self, rank: u64) -> Result<()> {
        self.seek_index_counted(rank).map(drop)
    }

    /// Like [`seek_index`](Self::seek_index), also returning how many
    /// entries were stepped over: `rank` on a hit, the entry count when the
    /// cursor ran out.
    pub(crate) fn seek_index_counted(&mut self, rank: u64) -> Result<u64> {
        let direct = if self.snapshot.is_empty() {
            self.version.single().filter(|s| s.is_distinct()).cloned()
        } else {
            None
        };
        if let Some(segment) = direct {
            let passed = rank.min(segment.len());
            let source = Source::segment(segment.cursor_at(rank)?, false)?;
            self.merger = Merger::new(KeyKind::Scalar, true, vec![source]);
            self.current = self.merger.next_entry()?;
            return Ok(passed);
        }

        self.begin()?;
        let mut passed = 0;
        while passed < rank && self.current.is_some() {
            self.next()?;
            passed += 1;
        }
        Ok(passed)
    }

    /// True while the cursor is positioned at an entry.
    pub fn has_next(&self) -> bool {
        self.current.is_some()
    }

    /// Moves to the next key; a no-op once exhausted.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Result<()> {
        if self.current.is_some() {
            self.current = self.merger.next_entry()?;
        }
        Ok(())
    }

    pub fn key(&self) -> Result<&[u8]> {
        self.current
            .as_ref()
            .map(|e| e.key.as_slice())
            .ok_or(DbError::NotFound)
    }

    pub fn value(&self) -> Result<&[u8]> {
        self.current
            .as_ref()
            .map(|e| e.value.as_slice())
            .ok_or(DbError::NotFound)
    }

    /// Releases the cursor and everything it pins.
    pub fn close(self) {}
}
