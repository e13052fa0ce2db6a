use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::cache::{CachedNode, NodeCache, NodeClass};
use crate::format::{decode_frame, footer_pos, read_footer, read_frame_header, Footer, FRAME_HEADER_BYTES};
use crate::node::{Entry, Node, NodeHandle};
use crate::{KeyKind, Result, SegmentError};

static NEXT_UID: AtomicU64 = AtomicU64::new(1);

/// An open, immutable segment file.
///
/// Nodes are read on demand through the shared [`NodeCache`]; the file
/// handle is kept open for the lifetime of the segment. Once a segment has
/// been merged away it is [marked obsolete](Segment::mark_obsolete) and the
/// file is unlinked when the last handle drops, so in-flight readers keep
/// working until they finish.
pub struct Segment {
    uid: u64,
    path: PathBuf,
    file: Mutex<File>,
    footer: Footer,
    file_size: u64,
    cache: Arc<NodeCache>,
    obsolete: AtomicBool,
}

impl Segment {
    /// Opens a segment and validates its footer.
    ///
    /// # Errors
    ///
    /// [`SegmentError::Corrupt`] if the file is too small, the magic or
    /// checksum is wrong, or the root lies outside the file.
    pub fn open<P: AsRef<Path>>(path: P, cache: Arc<NodeCache>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path)?;
        let (footer, file_size) = read_footer(&mut file)?.map_err(|e| SegmentError::Corrupt {
            path: path.clone(),
            reason: e.0,
        })?;

        let body_end = footer_pos(file_size);
        let root_end = footer.root_offset + u64::from(footer.root_len);
        if footer.height > 0 && (root_end > body_end || footer.leaf_end > body_end) {
            return Err(SegmentError::Corrupt {
                path,
                reason: "root node lies outside the file".into(),
            });
        }

        Ok(Self {
            uid: NEXT_UID.fetch_add(1, Ordering::Relaxed),
            path,
            file: Mutex::new(file),
            footer,
            file_size,
            cache,
            obsolete: AtomicBool::new(false),
        })
    }

    /// Process-unique identifier, used to key the node cache.
    pub fn uid(&self) -> u64 {
        self.uid
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of entries, counting duplicates.
    pub fn len(&self) -> u64 {
        self.footer.entry_count
    }

    pub fn is_empty(&self) -> bool {
        self.footer.entry_count == 0
    }

    pub fn height(&self) -> u16 {
        self.footer.height
    }

    pub fn kind(&self) -> KeyKind {
        self.footer.kind
    }

    /// True when no key occurs twice.
    pub fn is_distinct(&self) -> bool {
        self.footer.is_distinct()
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Schedules the file for deletion once the last handle is dropped.
    pub fn mark_obsolete(&self) {
        self.obsolete.store(true, Ordering::SeqCst);
    }

    fn corrupt(&self, reason: impl Into<String>) -> SegmentError {
        SegmentError::Corrupt {
            path: self.path.clone(),
            reason: reason.into(),
        }
    }

    fn root(&self) -> NodeHandle {
        NodeHandle {
            offset: self.footer.root_offset,
            len: self.footer.root_len,
        }
    }

    fn read_frame(&self, offset: u64, len: Option<u32>) -> Result<Vec<u8>> {
        let limit = footer_pos(self.file_size);
        if offset + FRAME_HEADER_BYTES as u64 > limit {
            return Err(self.corrupt(format!("node offset {offset} past end of data")));
        }

        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        let len = match len {
            Some(len) => len as usize,
            None => {
                let mut header = [0u8; FRAME_HEADER_BYTES];
                file.read_exact(&mut header)?;
                let (_, stored, _) = read_frame_header(&header).map_err(|e| self.corrupt(e.0))?;
                file.seek(SeekFrom::Start(offset))?;
                FRAME_HEADER_BYTES + stored as usize
            }
        };
        if offset + len as u64 > limit {
            return Err(self.corrupt(format!("node at {offset} overruns data section")));
        }
        let mut frame = vec![0u8; len];
        file.read_exact(&mut frame)?;
        Ok(frame)
    }

    /// Loads a node, through the cache. `len` may be omitted when walking
    /// leaves sequentially; the frame header then supplies it.
    fn load(&self, offset: u64, len: Option<u32>, class: NodeClass) -> Result<Arc<CachedNode>> {
        if let Some(hit) = self.cache.get(class, self.uid, offset) {
            return Ok(hit);
        }

        let frame = self.read_frame(offset, len)?;
        let payload = decode_frame(&frame).map_err(|e| self.corrupt(format!("node at {offset}: {e}")))?;
        let node = Node::decode(&payload).map_err(|e| self.corrupt(format!("node at {offset}: {e}")))?;
        let matches = matches!(
            (&node, class),
            (Node::Leaf(_), NodeClass::Leaf) | (Node::Internal(_), NodeClass::Internal)
        );
        if !matches || node.is_empty() {
            return Err(self.corrupt(format!("unexpected node shape at {offset}")));
        }

        let cached = Arc::new(CachedNode {
            node,
            frame_len: frame.len() as u32,
        });
        self.cache.insert(class, self.uid, offset, Arc::clone(&cached));
        Ok(cached)
    }

    fn load_handle(&self, handle: NodeHandle, height: u16) -> Result<Arc<CachedNode>> {
        let class = if height > 1 {
            NodeClass::Internal
        } else {
            NodeClass::Leaf
        };
        self.load(handle.offset, Some(handle.len), class)
    }

    /// Counts the entries whose key sorts before `key`, or up to and
    /// including it when `inclusive`. Scalar segments only.
    fn rank_by(&self, key: &[u8], inclusive: bool) -> Result<u64> {
        if self.footer.height == 0 {
            return Ok(0);
        }
        let before = |probe: &[u8]| if inclusive { probe <= key } else { probe < key };

        let mut acc = 0u64;
        let mut handle = self.root();
        for height in (2..=self.footer.height).rev() {
            let node = self.load_handle(handle, height)?;
            let children = node.children();
            let i = children.partition_point(|c| before(c.fence.as_slice()));
            acc += children[..i].iter().map(|c| c.count).sum::<u64>();
            match children.get(i) {
                Some(child) => handle = child.handle,
                None => return Ok(acc),
            }
        }
        let leaf = self.load_handle(handle, 1)?;
        Ok(acc + leaf.entries().partition_point(|e| before(e.key.as_slice())) as u64)
    }

    /// Number of entries with a key strictly less than `key`.
    pub fn lower_bound(&self, key: &[u8]) -> Result<u64> {
        self.rank_by(key, false)
    }

    /// Number of entries with a key less than or equal to `key`.
    pub fn upper_bound(&self, key: &[u8]) -> Result<u64> {
        self.rank_by(key, true)
    }

    /// Finds the leaf holding `rank` by descending on subtree counts.
    fn locate(&self, rank: u64) -> Result<Option<(NodeHandle, usize)>> {
        if rank >= self.footer.entry_count {
            return Ok(None);
        }
        let mut rank = rank;
        let mut handle = self.root();
        for height in (2..=self.footer.height).rev() {
            let node = self.load_handle(handle, height)?;
            let mut next = None;
            for child in node.children() {
                if rank < child.count {
                    next = Some(child.handle);
                    break;
                }
                rank -= child.count;
            }
            handle = next.ok_or_else(|| self.corrupt("subtree counts do not cover entry count"))?;
        }
        Ok(Some((handle, rank as usize)))
    }

    /// The entry at position `rank` in stored order.
    pub fn entry_at(&self, rank: u64) -> Result<Option<Entry>> {
        let Some((handle, index)) = self.locate(rank)? else {
            return Ok(None);
        };
        let leaf = self.load_handle(handle, 1)?;
        match leaf.entries().get(index) {
            Some(entry) => Ok(Some(entry.clone())),
            None => Err(self.corrupt("leaf shorter than its subtree count")),
        }
    }

    /// Point lookup in a scalar segment. When a key occurs more than once
    /// the last occurrence wins.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let upper = self.upper_bound(key)?;
        if upper == 0 {
            return Ok(None);
        }
        Ok(self
            .entry_at(upper - 1)?
            .filter(|e| e.key == key)
            .map(|e| e.value))
    }

    /// Opens a cursor positioned at `rank`.
    pub fn cursor_at(self: &Arc<Self>, rank: u64) -> Result<SegmentCursor> {
        let mut cursor = SegmentCursor {
            segment: Arc::clone(self),
            leaf: None,
            leaf_offset: 0,
            index: 0,
            rank,
        };
        if let Some((handle, index)) = self.locate(rank)? {
            cursor.leaf = Some(self.load_handle(handle, 1)?);
            cursor.leaf_offset = handle.offset;
            cursor.index = index;
        }
        Ok(cursor)
    }

    /// Opens a cursor at the first entry whose key is not less than `key`.
    pub fn seek(self: &Arc<Self>, key: &[u8]) -> Result<SegmentCursor> {
        let rank = self.lower_bound(key)?;
        self.cursor_at(rank)
    }

    /// Depth-first walk that only enters subtrees whose aggregate satisfies
    /// `descend`, calling `on_entry` for every entry of each reached leaf.
    pub fn visit<D, F>(&self, mut descend: D, mut on_entry: F) -> Result<()>
    where
        D: FnMut(&[u8]) -> bool,
        F: FnMut(&Entry),
    {
        if self.footer.height == 0 {
            return Ok(());
        }
        self.visit_node(self.root(), self.footer.height, &mut descend, &mut on_entry)
    }

    fn visit_node(
        &self,
        handle: NodeHandle,
        height: u16,
        descend: &mut dyn FnMut(&[u8]) -> bool,
        on_entry: &mut dyn FnMut(&Entry),
    ) -> Result<()> {
        let node = self.load_handle(handle, height)?;
        if height == 1 {
            node.entries().iter().for_each(|e| on_entry(e));
            return Ok(());
        }
        for child in node.children() {
            if descend(&child.aggregate) {
                self.visit_node(child.handle, height - 1, descend, on_entry)?;
            }
        }
        Ok(())
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        self.cache.invalidate_segment(self.uid);
        if self.obsolete.load(Ordering::SeqCst) {
            match fs::remove_file(&self.path) {
                Ok(()) => debug!(path = %self.path.display(), "obsolete segment removed"),
                Err(e) => warn!(path = %self.path.display(), error = %e, "failed to remove obsolete segment"),
            }
        }
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("path", &self.path)
            .field("entries", &self.footer.entry_count)
            .field("height", &self.footer.height)
            .finish()
    }
}

/// Forward iterator over a segment's entries in stored order.
///
/// Walks the contiguous leaf run directly instead of re-descending from the
/// root for every leaf.
pub struct SegmentCursor {
    segment: Arc<Segment>,
    leaf: Option<Arc<CachedNode>>,
    leaf_offset: u64,
    index: usize,
    rank: u64,
}

impl SegmentCursor {
    /// The current entry, or `None` once exhausted.
    pub fn entry(&self) -> Option<&Entry> {
        self.leaf.as_ref().and_then(|leaf| leaf.entries().get(self.index))
    }

    /// Rank of the current entry within the segment.
    pub fn rank(&self) -> u64 {
        self.rank
    }

    pub fn segment(&self) -> &Arc<Segment> {
        &self.segment
    }

    pub fn advance(&mut self) -> Result<()> {
        let Some(leaf) = &self.leaf else {
            return Ok(());
        };
        self.rank += 1;
        self.index += 1;
        if self.index < leaf.entries().len() {
            return Ok(());
        }

        let next_offset = self.leaf_offset + u64::from(leaf.frame_len);
        if next_offset >= self.segment.footer.leaf_end {
            self.leaf = None;
            return Ok(());
        }
        self.leaf = Some(self.segment.load(next_offset, None, NodeClass::Leaf)?);
        self.leaf_offset = next_offset;
        self.index = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BoundingBox, MinKey, Rect, SegmentWriter, WriterOptions};
    use proptest::collection::btree_map;
    use proptest::prelude::*;
    use tempfile::{tempdir, TempDir};

    fn key(i: usize) -> Vec<u8> {
        format!("key_{i}").into_bytes()
    }

    fn build(
        dir: &TempDir,
        name: &str,
        entries: &[(Vec<u8>, Vec<u8>)],
        max: usize,
        cache: Arc<NodeCache>,
    ) -> anyhow::Result<Arc<Segment>> {
        let path = dir.path().join(name);
        let opts = WriterOptions {
            max_node_entries: max,
            ..WriterOptions::default()
        };
        let mut w = SegmentWriter::create(&path, opts, Arc::new(MinKey))?;
        for (k, v) in entries {
            w.add(k, v)?;
        }
        w.finish()?;
        Ok(Arc::new(Segment::open(&path, cache)?))
    }

    fn ten_keys() -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut entries: Vec<_> = (1..=10)
            .map(|i| (key(i), format!("value_{i}").into_bytes()))
            .collect();
        entries.sort();
        entries
    }

    // -------------------- Point lookups --------------------

    #[test]
    fn get_finds_every_key() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let seg = build(&dir, "a.seg", &ten_keys(), 3, Arc::new(NodeCache::new(4, 4)))?;
        assert_eq!(seg.len(), 10);
        assert_eq!(seg.height(), 3);
        for i in 1..=10 {
            assert_eq!(seg.get(&key(i))?, Some(format!("value_{i}").into_bytes()));
        }
        assert_eq!(seg.get(b"key_0")?, None);
        assert_eq!(seg.get(b"key_99")?, None);
        assert_eq!(seg.get(b"")?, None);
        Ok(())
    }

    #[test]
    fn duplicate_keys_resolve_to_last() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let entries = vec![
            (b"a".to_vec(), b"1".to_vec()),
            (b"b".to_vec(), b"old".to_vec()),
            (b"b".to_vec(), b"mid".to_vec()),
            (b"b".to_vec(), b"new".to_vec()),
            (b"c".to_vec(), b"3".to_vec()),
        ];
        let seg = build(&dir, "dup.seg", &entries, 2, Arc::new(NodeCache::new(0, 0)))?;
        assert!(!seg.is_distinct());
        assert_eq!(seg.get(b"b")?, Some(b"new".to_vec()));
        assert_eq!(seg.lower_bound(b"b")?, 1);
        assert_eq!(seg.upper_bound(b"b")?, 4);
        Ok(())
    }

    // -------------------- Ranks --------------------

    #[test]
    fn rank_descent_matches_sorted_order() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let entries = ten_keys();
        let seg = build(&dir, "r.seg", &entries, 3, Arc::new(NodeCache::new(4, 4)))?;
        for (rank, (k, v)) in entries.iter().enumerate() {
            let e = seg.entry_at(rank as u64)?.expect("rank in range");
            assert_eq!((&e.key, &e.value), (k, v));
            assert_eq!(seg.lower_bound(k)?, rank as u64);
        }
        assert_eq!(seg.entry_at(10)?, None);
        Ok(())
    }

    // -------------------- Cursors --------------------

    #[test]
    fn cursor_walks_leaves_in_order() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let entries = ten_keys();
        let seg = build(&dir, "c.seg", &entries, 3, Arc::new(NodeCache::new(0, 0)))?;

        let mut cursor = seg.cursor_at(0)?;
        let mut seen = Vec::new();
        while let Some(e) = cursor.entry() {
            seen.push((e.key.clone(), e.value.clone()));
            cursor.advance()?;
        }
        assert_eq!(seen, entries);
        assert_eq!(cursor.rank(), 10);

        let cursor = seg.seek(b"key_5")?;
        assert_eq!(cursor.entry().map(|e| e.key.clone()), Some(b"key_5".to_vec()));
        assert!(seg.seek(b"zzz")?.entry().is_none());
        Ok(())
    }

    // -------------------- Pruned visits --------------------

    #[test]
    fn visit_prunes_by_aggregate() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("s.seg");
        let opts = WriterOptions {
            kind: KeyKind::Spatial,
            max_node_entries: 2,
            ..WriterOptions::default()
        };
        let mut rects: Vec<Rect> = (0..32).map(|i| Rect::new(i * 10, i * 10, i * 10 + 1, i * 10 + 1)).collect();
        rects.sort_by(|a, b| {
            KeyKind::Spatial
                .order_key(&a.to_bytes())
                .cmp(&KeyKind::Spatial.order_key(&b.to_bytes()))
        });
        let mut w = SegmentWriter::create(&path, opts, Arc::new(BoundingBox))?;
        for r in &rects {
            w.add(&r.to_bytes(), b"")?;
        }
        w.finish()?;
        let seg = Segment::open(&path, Arc::new(NodeCache::new(0, 0)))?;

        let query = Rect::new(0, 0, 25, 25);
        let mut hits = Vec::new();
        let mut visited = 0;
        seg.visit(
            |agg| Rect::from_bytes(agg).is_some_and(|r| r.intersects(&query)),
            |e| {
                visited += 1;
                if let Some(r) = Rect::from_bytes(&e.key).filter(|r| r.intersects(&query)) {
                    hits.push(r);
                }
            },
        )?;
        hits.sort_by_key(|r| r.x0);
        assert_eq!(hits, vec![rects_at(0), rects_at(10), rects_at(20)]);
        assert!(visited < 32);
        Ok(())
    }

    fn rects_at(v: u32) -> Rect {
        Rect::new(v, v, v + 1, v + 1)
    }

    // -------------------- Caching and lifecycle --------------------

    #[test]
    fn cache_serves_repeated_reads() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let cache = Arc::new(NodeCache::new(8, 8));
        let seg = build(&dir, "cache.seg", &ten_keys(), 3, Arc::clone(&cache))?;
        seg.get(b"key_4")?;
        let misses = cache.stats().misses;
        seg.get(b"key_4")?;
        assert_eq!(cache.stats().misses, misses);
        assert!(cache.stats().hits > 0);

        drop(seg);
        let stats = cache.stats();
        assert_eq!((stats.internal_len, stats.leaf_len), (0, 0));
        Ok(())
    }

    #[test]
    fn obsolete_segment_is_unlinked_on_last_drop() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let seg = build(&dir, "old.seg", &ten_keys(), 4, Arc::new(NodeCache::new(0, 0)))?;
        let path = seg.path().to_path_buf();
        let reader = Arc::clone(&seg);
        seg.mark_obsolete();
        drop(seg);
        assert!(path.exists());
        assert_eq!(reader.get(b"key_1")?, Some(b"value_1".to_vec()));
        drop(reader);
        assert!(!path.exists());
        Ok(())
    }

    #[test]
    fn corrupt_node_is_reported() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let seg = build(&dir, "bad.seg", &ten_keys(), 3, Arc::new(NodeCache::new(0, 0)))?;
        let path = seg.path().to_path_buf();
        drop(seg);

        let mut bytes = fs::read(&path)?;
        bytes[12] ^= 0xFF;
        fs::write(&path, &bytes)?;
        let seg = Segment::open(&path, Arc::new(NodeCache::new(0, 0)))?;
        let err = seg.get(b"key_1").unwrap_err();
        assert!(matches!(err, SegmentError::Corrupt { .. }));

        fs::write(&path, b"not a segment")?;
        assert!(matches!(
            Segment::open(&path, Arc::new(NodeCache::new(0, 0))),
            Err(SegmentError::Corrupt { .. })
        ));
        Ok(())
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn lookups_agree_with_model(
            model in btree_map(proptest::collection::vec(any::<u8>(), 0..12), any::<u8>(), 0..200),
            max in 2usize..9,
        ) {
            let dir = tempdir().unwrap();
            let entries: Vec<(Vec<u8>, Vec<u8>)> =
                model.iter().map(|(k, v)| (k.clone(), vec![*v])).collect();
            let seg = build(&dir, "p.seg", &entries, max, Arc::new(NodeCache::new(2, 2))).unwrap();
            prop_assert_eq!(seg.len(), entries.len() as u64);
            for (rank, (k, v)) in entries.iter().enumerate() {
                prop_assert_eq!(seg.get(k).unwrap(), Some(v.clone()));
                prop_assert_eq!(seg.lower_bound(k).unwrap(), rank as u64);
            }
            let mut cursor = seg.cursor_at(0).unwrap();
            for (k, _) in &entries {
                prop_assert_eq!(cursor.entry().map(|e| &e.key), Some(k));
                cursor.advance().unwrap();
            }
            prop_assert!(cursor.entry().is_none());
        }
    }
}
