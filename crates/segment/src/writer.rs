use std::fs::{rename, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use crate::format::{
    encode_frame, write_footer, Footer, FOOTER_BYTES, FOOTER_COMPRESSED, FOOTER_DISTINCT,
    FOOTER_PREFIX_ENCODED,
};
use crate::node::{ChildRef, Entry, Node, NodeHandle};
use crate::{KeyKind, Reducer, Result, SegmentError};

/// Layout knobs for a new segment.
#[derive(Debug, Clone, Copy)]
pub struct WriterOptions {
    pub kind: KeyKind,
    /// Maximum entries per leaf and children per internal node.
    pub max_node_entries: usize,
    pub compression: bool,
    pub prefix_encoding: bool,
    /// Bytes reserved up front; the file is trimmed to its real size on
    /// finish.
    pub initial_size: u64,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            kind: KeyKind::Scalar,
            max_node_entries: 16,
            compression: true,
            prefix_encoding: true,
            initial_size: 0,
        }
    }
}

/// What [`SegmentWriter::finish`] produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentSummary {
    pub entry_count: u64,
    pub height: u16,
    pub file_size: u64,
    /// No two entries share a key.
    pub distinct: bool,
}

/// Streams sorted entries into a new segment file.
///
/// Leaves are written as soon as they fill up; only the child pointers of
/// the level above are kept in memory. [`finish`](SegmentWriter::finish)
/// then builds the internal levels bottom-up and appends the footer.
///
/// # Crash Safety
///
/// Everything is written to `<path>.tmp`, fsynced, and atomically renamed
/// over `path` on finish. An abandoned writer leaves only the temp file
/// behind, which is removed on the next open of the store.
pub struct SegmentWriter {
    path: PathBuf,
    tmp_path: PathBuf,
    file: BufWriter<File>,
    offset: u64,
    options: WriterOptions,
    reducer: Arc<dyn Reducer>,
    pending: Vec<Entry>,
    leaves: Vec<ChildRef>,
    last_order: Option<Vec<u8>>,
    entries: u64,
    distinct: bool,
}

impl SegmentWriter {
    pub fn create<P: AsRef<Path>>(
        path: P,
        options: WriterOptions,
        reducer: Arc<dyn Reducer>,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let tmp_path = tmp_path_for(&path);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        if options.initial_size > 0 {
            file.set_len(options.initial_size)?;
        }

        Ok(Self {
            path,
            tmp_path,
            file: BufWriter::new(file),
            offset: 0,
            options,
            reducer,
            pending: Vec::with_capacity(options.max_node_entries),
            leaves: Vec::new(),
            last_order: None,
            entries: 0,
            distinct: true,
        })
    }

    fn fanout(&self) -> usize {
        self.options.max_node_entries.max(2)
    }

    /// Appends one entry. Entries must arrive in non-decreasing order of
    /// [`KeyKind::order_key`]; equal keys are kept in arrival order.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let order = self.options.kind.order_key(key);
        if let Some(last) = &self.last_order {
            match order.as_ref().cmp(last.as_slice()) {
                std::cmp::Ordering::Less => return Err(SegmentError::Unsorted),
                std::cmp::Ordering::Equal => self.distinct = false,
                std::cmp::Ordering::Greater => {}
            }
        }
        self.last_order = Some(order.into_owned());

        self.pending.push(Entry {
            key: key.to_vec(),
            value: value.to_vec(),
        });
        self.entries += 1;
        if self.pending.len() >= self.fanout() {
            self.flush_leaf()?;
        }
        Ok(())
    }

    pub fn entry_count(&self) -> u64 {
        self.entries
    }

    fn flush_leaf(&mut self) -> Result<()> {
        let entries = std::mem::take(&mut self.pending);
        let keys: Vec<&[u8]> = entries.iter().map(|e| e.key.as_slice()).collect();
        let aggregate = self.reducer.reduce(&keys);
        let fence = match (self.options.kind, entries.last()) {
            (KeyKind::Scalar, Some(last)) => last.key.clone(),
            _ => Vec::new(),
        };
        let count = entries.len() as u64;
        let handle = self.write_node(&Node::Leaf(entries))?;
        self.leaves.push(ChildRef {
            fence,
            aggregate,
            count,
            handle,
        });
        Ok(())
    }

    fn write_node(&mut self, node: &Node) -> Result<NodeHandle> {
        let payload = node.encode(
            self.options.prefix_encoding,
            self.options.kind == KeyKind::Spatial,
        );
        let frame = encode_frame(&payload, self.options.compression);
        self.file.write_all(&frame)?;
        let handle = NodeHandle {
            offset: self.offset,
            len: frame.len() as u32,
        };
        self.offset += frame.len() as u64;
        Ok(handle)
    }

    /// Writes the internal levels and footer, then moves the file into
    /// place.
    pub fn finish(mut self) -> Result<SegmentSummary> {
        if !self.pending.is_empty() {
            self.flush_leaf()?;
        }
        let leaf_end = self.offset;
        let fanout = self.fanout();

        let mut level = std::mem::take(&mut self.leaves);
        let mut height: u16 = if level.is_empty() { 0 } else { 1 };
        while level.len() > 1 {
            let mut parents = Vec::with_capacity(level.len() / fanout + 1);
            for chunk in level.chunks(fanout) {
                let aggregates: Vec<&[u8]> =
                    chunk.iter().map(|c| c.aggregate.as_slice()).collect();
                let aggregate = self.reducer.reduce(&aggregates);
                let fence = chunk.last().map(|c| c.fence.clone()).unwrap_or_default();
                let count = chunk.iter().map(|c| c.count).sum();
                let handle = self.write_node(&Node::Internal(chunk.to_vec()))?;
                parents.push(ChildRef {
                    fence,
                    aggregate,
                    count,
                    handle,
                });
            }
            level = parents;
            height += 1;
        }
        let root = level
            .first()
            .map(|c| c.handle)
            .unwrap_or(NodeHandle { offset: 0, len: 0 });

        let mut flags = 0;
        if self.distinct {
            flags |= FOOTER_DISTINCT;
        }
        if self.options.compression {
            flags |= FOOTER_COMPRESSED;
        }
        if self.options.prefix_encoding {
            flags |= FOOTER_PREFIX_ENCODED;
        }
        let footer = Footer {
            root_offset: root.offset,
            root_len: root.len,
            height,
            entry_count: self.entries,
            leaf_end,
            kind: self.options.kind,
            flags,
        };
        write_footer(&mut self.file, &footer)?;
        let file_size = self.offset + FOOTER_BYTES;

        let file = self.file.into_inner().map_err(|e| e.into_error())?;
        // drop whatever the preallocation reserved beyond the footer
        file.set_len(file_size)?;
        file.sync_all()?;
        drop(file);
        rename(&self.tmp_path, &self.path)?;

        debug!(
            path = %self.path.display(),
            entries = self.entries,
            height,
            bytes = file_size,
            "segment written"
        );
        Ok(SegmentSummary {
            entry_count: self.entries,
            height,
            file_size,
            distinct: self.distinct,
        })
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{read_footer, SEGMENT_MAGIC};
    use crate::{BoundingBox, MinKey, Rect};
    use std::fs;
    use tempfile::tempdir;

    fn options(max: usize) -> WriterOptions {
        WriterOptions {
            max_node_entries: max,
            ..WriterOptions::default()
        }
    }

    #[test]
    fn writes_expected_shape() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("a.seg");
        let mut w = SegmentWriter::create(&path, options(3), Arc::new(MinKey))?;
        for i in 1..=10 {
            w.add(format!("key_{i:02}").as_bytes(), b"v")?;
        }
        let summary = w.finish()?;
        // 4 leaves -> 2 internal nodes -> root
        assert_eq!(
            summary,
            SegmentSummary {
                entry_count: 10,
                height: 3,
                file_size: fs::metadata(&path)?.len(),
                distinct: true,
            }
        );

        let bytes = fs::read(&path)?;
        let magic = u32::from_le_bytes(bytes[bytes.len() - 4..].try_into()?);
        assert_eq!(magic, SEGMENT_MAGIC);
        Ok(())
    }

    #[test]
    fn temp_file_is_renamed_and_preallocation_trimmed() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("b.seg");
        let opts = WriterOptions {
            initial_size: 1 << 20,
            ..options(4)
        };
        let mut w = SegmentWriter::create(&path, opts, Arc::new(MinKey))?;
        assert!(tmp_path_for(&path).exists());
        w.add(b"a", b"1")?;
        let summary = w.finish()?;

        assert!(!tmp_path_for(&path).exists());
        assert_eq!(fs::metadata(&path)?.len(), summary.file_size);
        assert!(summary.file_size < 1 << 20);

        let (footer, _) = read_footer(&mut fs::File::open(&path)?)?.map_err(anyhow::Error::msg)?;
        assert_eq!((footer.height, footer.entry_count), (1, 1));
        Ok(())
    }

    #[test]
    fn rejects_unsorted_and_tracks_duplicates() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let mut w = SegmentWriter::create(dir.path().join("c.seg"), options(4), Arc::new(MinKey))?;
        w.add(b"b", b"1")?;
        w.add(b"b", b"2")?;
        assert!(matches!(w.add(b"a", b"3"), Err(SegmentError::Unsorted)));
        let summary = w.finish()?;
        assert_eq!(summary.entry_count, 2);
        assert!(!summary.distinct);
        Ok(())
    }

    #[test]
    fn empty_segment_has_no_root() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let w = SegmentWriter::create(dir.path().join("d.seg"), options(4), Arc::new(MinKey))?;
        let summary = w.finish()?;
        assert_eq!((summary.entry_count, summary.height), (0, 0));
        assert_eq!(summary.file_size, FOOTER_BYTES);
        Ok(())
    }

    #[test]
    fn spatial_entries_must_follow_curve_order() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let opts = WriterOptions {
            kind: KeyKind::Spatial,
            ..options(4)
        };
        let mut w = SegmentWriter::create(dir.path().join("e.seg"), opts, Arc::new(BoundingBox))?;
        w.add(&Rect::point(1, 1).to_bytes(), b"")?;
        // (1,0) precedes (1,1) on the curve
        assert!(matches!(
            w.add(&Rect::point(1, 0).to_bytes(), b""),
            Err(SegmentError::Unsorted)
        ));
        w.add(&Rect::point(0, 1).to_bytes(), b"")?;
        assert_eq!(w.finish()?.entry_count, 2);
        Ok(())
    }
}
