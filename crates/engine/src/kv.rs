use std::collections::BTreeMap;
use std::path::Path;

use segment::{CacheStats, KeyKind};

use crate::config::Config;
use crate::cursor::Cursor;
use crate::error::{DbError, Result};
use crate::tree::Tree;

/// Key-value store over byte-string keys in lexicographic order.
///
/// Adding an existing key replaces its value. Any number of threads may read
/// while one writes; `add`, `flush` and `compact` serialize on an internal
/// writer lock.
///
/// ```no_run
/// use engine::{Config, KvDb};
///
/// # fn main() -> engine::Result<()> {
/// let db = KvDb::open("/tmp/kv", Config::default())?;
/// db.add(b"apple", b"red")?;
/// assert_eq!(db.get(b"apple")?, Some(b"red".to_vec()));
/// db.close()
/// # }
/// ```
pub struct KvDb {
    tree: Tree,
}

impl KvDb {
    /// Opens or creates the store at `path`, replaying its write-ahead log.
    pub fn open<P: AsRef<Path>>(path: P, config: Config) -> Result<Self> {
        Ok(Self {
            tree: Tree::open(path.as_ref(), config, KeyKind::Scalar)?,
        })
    }

    pub fn add(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.tree.add(key, value)
    }

    /// Newest value of `key`, or `None` if it was never added.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.tree.get(key)
    }

    /// Key and value of 0-based `rank` in key order.
    ///
    /// # Errors
    ///
    /// [`DbError::OutOfRange`] when `rank` is not below the number of
    /// distinct keys.
    pub fn at(&self, rank: u64) -> Result<(Vec<u8>, Vec<u8>)> {
        let mut cursor = self.tree.cursor();
        let passed = cursor.seek_index_counted(rank)?;
        if !cursor.has_next() {
            return Err(DbError::OutOfRange { rank, len: passed });
        }
        Ok((cursor.key()?.to_vec(), cursor.value()?.to_vec()))
    }

    /// Values of every key satisfying `predicate`, in key order.
    pub fn traverse<P>(&self, mut predicate: P) -> Result<Vec<Vec<u8>>>
    where
        P: FnMut(&[u8]) -> bool,
    {
        let mut cursor = self.begin()?;
        let mut values = Vec::new();
        while cursor.has_next() {
            if predicate(cursor.key()?) {
                values.push(cursor.value()?.to_vec());
            }
            cursor.next()?;
        }
        Ok(values)
    }

    /// Like [`KvDb::traverse`], but skips every subtree whose aggregate key
    /// fails `predicate`.
    ///
    /// Only sound when the configured reducer guarantees that a failing
    /// aggregate implies a failing key for everything below it, so it
    /// refuses to run without an explicit [`Config::reduce`].
    pub fn traverse_reduced<P>(&self, mut predicate: P) -> Result<Vec<Vec<u8>>>
    where
        P: FnMut(&[u8]) -> bool,
    {
        if !self.tree.has_explicit_reducer() {
            return Err(DbError::ConfigConflict(
                "traverse_reduced needs an explicit reduce function".into(),
            ));
        }

        let (version, buffered) = self.tree.latest_snapshot();
        let mut found = BTreeMap::new();
        let mut segments = version.newest_first();
        segments.reverse();
        for segment in segments {
            let mut hits = Vec::new();
            segment.visit(
                |aggregate| predicate(aggregate),
                |entry| hits.push((entry.key.clone(), entry.value.clone())),
            )?;
            // leaf keys are tested once the walk releases `predicate`
            for (key, value) in hits {
                if predicate(&key) {
                    found.insert(key, value);
                }
            }
        }
        for entry in buffered.iter() {
            if predicate(&entry.key) {
                found.insert(entry.key.clone(), entry.value.clone());
            }
        }
        Ok(found.into_values().collect())
    }

    /// A cursor positioned at the smallest key.
    pub fn begin(&self) -> Result<Cursor> {
        let mut cursor = self.tree.cursor();
        cursor.begin()?;
        Ok(cursor)
    }

    /// A cursor positioned at the first key not less than `key`.
    pub fn seek_key(&self, key: &[u8]) -> Result<Cursor> {
        let mut cursor = self.tree.cursor();
        cursor.seek_key(key)?;
        Ok(cursor)
    }

    /// A cursor positioned at 0-based `rank`; exhausted if out of range.
    pub fn seek_index(&self, rank: u64) -> Result<Cursor> {
        let mut cursor = self.tree.cursor();
        cursor.seek_index(rank)?;
        Ok(cursor)
    }

    /// Writes the buffer out as a new segment.
    pub fn flush(&self) -> Result<()> {
        self.tree.flush()
    }

    /// Merges every segment into one, keeping the newest value of each key.
    pub fn compact(&self) -> Result<()> {
        self.tree.compact()
    }

    /// Flushes (or discards, per [`Config::flush_on_close`]) the buffer and
    /// releases the store.
    pub fn close(self) -> Result<()> {
        self.tree.close()
    }

    /// Stored entries, counting shadowed versions.
    pub fn len(&self) -> u64 {
        self.tree.approx_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Exact number of distinct keys; walks the merged view.
    pub fn distinct_len(&self) -> Result<u64> {
        let mut cursor = self.begin()?;
        let mut n = 0;
        while cursor.has_next() {
            n += 1;
            cursor.next()?;
        }
        Ok(n)
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

    /// Segments per level, level 0 first.
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
