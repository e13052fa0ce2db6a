//! # Write buffer
//!
//! The in-memory staging area of the strata engine.
//!
//! Every `add` lands here (after the write-ahead log) before the engine
//! flushes the buffer into an immutable level-0 segment. The buffer keeps
//! **every** version written for a key, in insertion order, because the
//! engine's flush preserves duplicates and resolves them at read time:
//!
//! - **Sorted by key**: versions are grouped under their key in a `BTreeMap`,
//!   so iteration yields byte-lexicographic key order, then insertion order.
//! - **Sequence-number gated**: a write whose sequence number is not newer
//!   than the latest version of its key is rejected (WAL replay safety).
//! - **Entry-count bounded**: the engine flushes once [`WriteBuffer::len`]
//!   reaches the configured maximum buffer size.
//!
//! ## Example
//! ```rust
//! use buffer::WriteBuffer;
//!
//! let mut b = WriteBuffer::new();
//! b.put(b"hello".to_vec(), b"world".to_vec(), 1);
//! b.put(b"hello".to_vec(), b"again".to_vec(), 2);
//! assert_eq!(b.get(b"hello").unwrap().1, b"again");
//! assert_eq!(b.len(), 2);
//! assert_eq!(b.latest().count(), 1);
//! ```

use std::collections::BTreeMap;

/// One buffered version of a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferedValue {
    /// Monotonically increasing sequence number assigned at write time.
    pub seq: u64,
    pub value: Vec<u8>,
}

/// A flattened buffer entry, as handed to the segment writer on flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferedEntry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// An ordered, multi-version, in-memory write buffer.
///
/// Keys map to the list of versions written for them, oldest first. The
/// buffer tracks both the number of versions (the flush trigger) and an
/// approximate byte size (reported as `buffered_bytes` by the stores).
#[derive(Debug, Default)]
pub struct WriteBuffer {
    map: BTreeMap<Vec<u8>, Vec<BufferedValue>>,
    len: usize,
    approx_size: usize,
}

impl WriteBuffer {
    /// Creates a new, empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a version of `key`.
    ///
    /// Returns `false` (and leaves the buffer untouched) when the latest
    /// buffered version of `key` already carries a sequence number greater
    /// than or equal to `seq`.
    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>, seq: u64) -> bool {
        if let Some(versions) = self.map.get_mut(&key) {
            if versions.last().is_some_and(|latest| latest.seq >= seq) {
                return false;
            }
            self.approx_size = self.approx_size.saturating_add(value.len());
            versions.push(BufferedValue { seq, value });
        } else {
            self.approx_size = self
                .approx_size
                .saturating_add(key.len())
                .saturating_add(value.len());
            self.map.insert(key, vec![BufferedValue { seq, value }]);
        }
        self.len += 1;
        true
    }

    /// Returns the most recent version of `key` as `(seq, value)`.
    pub fn get(&self, key: &[u8]) -> Option<(u64, &[u8])> {
        self.map
            .get(key)
            .and_then(|versions| versions.last())
            .map(|v| (v.seq, v.value.as_slice()))
    }

    /// Iterates over all versions in ascending key order; versions of the
    /// same key come out in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &BufferedValue)> {
        self.map
            .iter()
            .flat_map(|(k, versions)| versions.iter().map(move |v| (k.as_slice(), v)))
    }

    /// Iterates over the newest version of every distinct key, in key order.
    pub fn latest(&self) -> impl Iterator<Item = (&[u8], &BufferedValue)> {
        self.map
            .iter()
            .filter_map(|(k, versions)| versions.last().map(|v| (k.as_slice(), v)))
    }

    /// Number of buffered versions (the flush trigger).
    pub fn len(&self) -> usize {
        self.len
    }

    /// Approximate byte size of buffered keys and values.
    pub fn approx_size(&self) -> usize {
        self.approx_size
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Copies every version out in key order, then insertion order.
    ///
    /// The flush path uses this while the buffer stays readable; the buffer
    /// itself is cleared only once the new segment has been published.
    pub fn to_entries(&self) -> Vec<BufferedEntry> {
        self.iter()
            .map(|(key, v)| BufferedEntry {
                key: key.to_vec(),
                value: v.value.clone(),
            })
            .collect()
    }

    /// Removes all entries and resets the counters.
    pub fn clear(&mut self) {
        self.map.clear();
        self.len = 0;
        self.approx_size = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // -------------------- Basic put / get --------------------

    #[test]
    fn put_and_get_single_key() {
        let mut b = WriteBuffer::new();
        assert!(b.put(b"k1".to_vec(), b"v1".to_vec(), 1));
        assert_eq!(b.len(), 1);
        let (seq, val) = b.get(b"k1").unwrap();
        assert_eq!(seq, 1);
        assert_eq!(val, b"v1");
    }

    #[test]
    fn newer_version_shadows_older() {
        let mut b = WriteBuffer::new();
        b.put(b"k1".to_vec(), b"v1".to_vec(), 1);
        b.put(b"k1".to_vec(), b"v2".to_vec(), 2);
        assert_eq!(b.get(b"k1").unwrap().1, b"v2");
        assert_eq!(b.len(), 2);
        assert_eq!(b.latest().count(), 1);
    }

    #[test]
    fn stale_seq_is_rejected() {
        let mut b = WriteBuffer::new();
        b.put(b"k1".to_vec(), b"v2".to_vec(), 5);
        assert!(!b.put(b"k1".to_vec(), b"v-old".to_vec(), 3));
        assert!(!b.put(b"k1".to_vec(), b"v-same".to_vec(), 5));
        assert_eq!(b.get(b"k1").unwrap().1, b"v2");
        assert_eq!(b.len(), 1);
    }

    #[test]
    fn get_missing_key_returns_none() {
        let b = WriteBuffer::new();
        assert!(b.get(b"nonexistent").is_none());
    }

    #[test]
    fn versions_keep_insertion_order() {
        let mut b = WriteBuffer::new();
        for seq in 1..=3u64 {
            b.put(b"k".to_vec(), format!("v{seq}").into_bytes(), seq);
        }
        let values: Vec<_> = b.iter().map(|(_, v)| v.value.clone()).collect();
        assert_eq!(values, vec![b"v1".to_vec(), b"v2".to_vec(), b"v3".to_vec()]);
    }

    // -------------------- Iteration --------------------

    #[test]
    fn iter_yields_key_order_then_insertion_order() {
        let mut b = WriteBuffer::new();
        b.put(b"c".to_vec(), b"3".to_vec(), 1);
        b.put(b"a".to_vec(), b"1".to_vec(), 2);
        b.put(b"c".to_vec(), b"4".to_vec(), 3);
        b.put(b"b".to_vec(), b"2".to_vec(), 4);

        let seen: Vec<(&[u8], u64)> = b.iter().map(|(k, v)| (k, v.seq)).collect();
        assert_eq!(
            seen,
            vec![
                (b"a".as_slice(), 2),
                (b"b".as_slice(), 4),
                (b"c".as_slice(), 1),
                (b"c".as_slice(), 3)
            ]
        );
    }

    #[test]
    fn latest_yields_one_version_per_key() {
        let mut b = WriteBuffer::new();
        b.put(b"a".to_vec(), b"1".to_vec(), 1);
        b.put(b"a".to_vec(), b"2".to_vec(), 2);
        b.put(b"b".to_vec(), b"3".to_vec(), 3);

        let latest: Vec<_> = b.latest().map(|(k, v)| (k.to_vec(), v.value.clone())).collect();
        assert_eq!(
            latest,
            vec![
                (b"a".to_vec(), b"2".to_vec()),
                (b"b".to_vec(), b"3".to_vec())
            ]
        );
    }

    #[test]
    fn to_entries_flattens_all_versions() {
        let mut b = WriteBuffer::new();
        b.put(b"k".to_vec(), b"v1".to_vec(), 1);
        b.put(b"j".to_vec(), b"w".to_vec(), 2);
        b.put(b"k".to_vec(), b"v2".to_vec(), 3);

        let entries = b.to_entries();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].key, b"j");
        assert_eq!(entries[1].value, b"v1");
        assert_eq!(entries[2].value, b"v2");
        // the buffer is untouched
        assert_eq!(b.len(), 3);
    }

    // -------------------- Size tracking --------------------

    #[test]
    fn approx_size_counts_key_once() {
        let mut b = WriteBuffer::new();
        b.put(b"ab".to_vec(), b"ccc".to_vec(), 1); // 2 + 3
        assert_eq!(b.approx_size(), 5);
        b.put(b"ab".to_vec(), b"dd".to_vec(), 2); // + 2
        assert_eq!(b.approx_size(), 7);
    }

    #[test]
    fn stale_write_does_not_change_size() {
        let mut b = WriteBuffer::new();
        b.put(b"k".to_vec(), b"v".to_vec(), 5);
        let before = b.approx_size();
        b.put(b"k".to_vec(), b"vvvvv".to_vec(), 3);
        assert_eq!(b.approx_size(), before);
    }

    // -------------------- Edge cases --------------------

    #[test]
    fn empty_key_and_value() {
        let mut b = WriteBuffer::new();
        b.put(Vec::new(), Vec::new(), 1);
        let (_, v) = b.get(b"").unwrap();
        assert!(v.is_empty());
    }

    #[test]
    fn binary_key_and_value() {
        let mut b = WriteBuffer::new();
        let key = vec![0x00, 0xFF, 0x80, 0x01];
        let val = vec![0xDE, 0xAD, 0xBE, 0xEF];
        b.put(key.clone(), val.clone(), 1);
        assert_eq!(b.get(&key).unwrap().1, val.as_slice());
    }

    #[test]
    fn many_versions_of_one_key() {
        let mut b = WriteBuffer::new();
        for seq in 1..=10_000u64 {
            b.put(b"k".to_vec(), format!("v{seq}").into_bytes(), seq);
        }
        assert_eq!(b.len(), 10_000);
        assert_eq!(b.latest().count(), 1);
        assert_eq!(b.get(b"k").unwrap().0, 10_000);
    }

    // -------------------- Clear --------------------

    #[test]
    fn clear_resets_everything() {
        let mut b = WriteBuffer::new();
        b.put(b"a".to_vec(), b"1".to_vec(), 1);
        b.put(b"b".to_vec(), b"2".to_vec(), 2);
        b.clear();
        assert!(b.is_empty());
        assert_eq!(b.len(), 0);
        assert_eq!(b.approx_size(), 0);
        // Seq 1 is accepted again after a clear
        assert!(b.put(b"a".to_vec(), b"x".to_vec(), 1));
    }

    #[test]
    fn default_creates_empty() {
        let b = WriteBuffer::default();
        assert!(b.is_empty());
        assert_eq!(b.approx_size(), 0);
    }
}
