use std::path::Path;

use segment::{CacheStats, KeyKind, Rect};

use crate::config::Config;
use crate::error::Result;
use crate::tree::Tree;

/// Spatial store: values keyed by axis-aligned rectangles.
///
/// Entries are packed along a Hilbert curve when written out, and every
/// internal node carries the bounding box of its subtree. Equal rectangles
/// are kept side by side, never replaced.
pub struct HrDb {
    tree: Tree,
}

impl HrDb {
    pub fn open<P: AsRef<Path>>(path: P, config: Config) -> Result<Self> {
        Ok(Self {
            tree: Tree::open(path.as_ref(), config, KeyKind::Spatial)?,
        })
    }

    pub fn add(&self, rect: Rect, value: &[u8]) -> Result<()> {
        self.tree.add(&rect.to_bytes(), value)
    }

    /// Values of every entry whose rectangle intersects `query`, borders
    /// included. Order is unspecified.
    pub fn search(&self, query: &Rect) -> Result<Vec<Vec<u8>>> {
        let hits = |key: &[u8]| Rect::from_bytes(key).is_some_and(|r| r.intersects(query));
        let (version, mut values) = self.tree.with_buffer(|buffer| {
            buffer
                .iter()
                .filter(|&(key, _)| hits(key))
                .map(|(_, v)| v.value.clone())
                .collect::<Vec<_>>()
        });

        for segment in version.newest_first() {
            segment.visit(hits, |entry| {
                if hits(&entry.key) {
                    values.push(entry.value.clone());
                }
            })?;
        }
        Ok(values)
    }

    pub fn flush(&self) -> Result<()> {
        self.tree.flush()
    }

    /// Repacks every segment into one.
    pub fn compact(&self) -> Result<()> {
        self.tree.compact()
    }

    pub fn close(self) -> Result<()> {
        self.tree.close()
    }

    /// Stored entries.
    pub fn len(&self) -> u64 {
        self.tree.approx_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn buffered(&self) -> usize {
        self.tree.buffered()
    }

    /// Approximate bytes of keys and values held in the buffer.
    pub fn buffered_bytes(&self) -> usize {
        self.tree.buffered_bytes()
    }

    pub fn segment_count(&self) -> usize {
        self.tree.segment_count()
    }

    pub fn level_shape(&self) -> Vec<usize> {
        self.tree.level_shape()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.tree.cache_stats()
    }

    pub fn path(&self) -> &Path {
        self.tree.path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn equal_rectangles_are_all_kept() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let db = HrDb::open(dir.path(), Config::default().max_buffer_size(3))?;
        let r = Rect::new(5, 5, 6, 6);
        for v in [b"a", b"b", b"c", b"d"] {
            db.add(r, v)?;
        }
        db.compact()?;
        db.add(r, b"e")?;

        let mut found = db.search(&Rect::point(5, 6))?;
        found.sort();
        assert_eq!(found, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec(), b"e".to_vec()]);
        assert_eq!(db.len(), 5);
        Ok(())
    }

    #[test]
    fn search_sees_buffer_and_segments() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let db = HrDb::open(dir.path(), Config::default().max_buffer_size(4))?;
        for i in 0..6u32 {
            db.add(Rect::new(i, i, i + 1, i + 1), &i.to_le_bytes())?;
        }
        assert_eq!(db.segment_count(), 1);
        assert_eq!(db.buffered(), 2);
        assert_eq!(db.buffered_bytes(), 2 * (Rect::ENCODED_LEN + 4));

        let mut found = db.search(&Rect::new(3, 3, 5, 5))?;
        found.sort();
        let expected: Vec<_> = (2..6u32).map(|i| i.to_le_bytes().to_vec()).collect();
        assert_eq!(found, expected);
        Ok(())
    }

    #[test]
    fn disjoint_query_finds_nothing() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let db = HrDb::open(dir.path(), Config::default().max_buffer_size(2))?;
        db.add(Rect::new(0, 0, 10, 10), b"low")?;
        db.add(Rect::new(100, 100, 110, 110), b"high")?;
        db.add(Rect::new(50, 50, 50, 50), b"mid")?;

        assert!(db.search(&Rect::new(20, 20, 40, 40))?.is_empty());
        assert_eq!(db.search(&Rect::new(10, 10, 50, 50))?.len(), 2);
        Ok(())
    }
}
