use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

use crate::node::{ChildRef, Entry, Node};

/// Which of the two cache pools a node belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeClass {
    Internal,
    Leaf,
}

/// A decoded node together with the size of the frame it was read from.
#[derive(Debug)]
pub struct CachedNode {
    pub node: Node,
    pub frame_len: u32,
}

impl CachedNode {
    /// Leaf entries; empty for an internal node.
    pub fn entries(&self) -> &[Entry] {
        match &self.node {
            Node::Leaf(entries) => entries,
            Node::Internal(_) => &[],
        }
    }

    /// Child pointers; empty for a leaf.
    pub fn children(&self) -> &[ChildRef] {
        match &self.node {
            Node::Internal(children) => children,
            Node::Leaf(_) => &[],
        }
    }
}

/// (segment uid, frame offset)
type NodeKey = (u64, u64);

type Pool = Mutex<LruCache<NodeKey, Arc<CachedNode>>>;

/// Hit/miss counters since the cache was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub internal_len: usize,
    pub leaf_len: usize,
}

/// Bounded LRU caches of decoded nodes shared by every segment of a store.
///
/// Internal and leaf nodes live in separate pools so a long scan cannot
/// evict the upper levels of the trees. A capacity of zero disables the
/// pool; reads then always go to disk.
pub struct NodeCache {
    internal: Option<Pool>,
    leaf: Option<Pool>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl NodeCache {
    pub fn new(internal_capacity: usize, leaf_capacity: usize) -> Self {
        let pool = |cap: usize| NonZeroUsize::new(cap).map(|cap| Mutex::new(LruCache::new(cap)));
        Self {
            internal: pool(internal_capacity),
            leaf: pool(leaf_capacity),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn pool(&self, class: NodeClass) -> Option<&Pool> {
        match class {
            NodeClass::Internal => self.internal.as_ref(),
            NodeClass::Leaf => self.leaf.as_ref(),
        }
    }

    pub fn get(&self, class: NodeClass, segment: u64, offset: u64) -> Option<Arc<CachedNode>> {
        let hit = self
            .pool(class)
            .and_then(|pool| pool.lock().get(&(segment, offset)).cloned());
        let counter = if hit.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        hit
    }

    pub fn insert(&self, class: NodeClass, segment: u64, offset: u64, node: Arc<CachedNode>) {
        if let Some(pool) = self.pool(class) {
            pool.lock().put((segment, offset), node);
        }
    }

    /// Drops every cached node of one segment.
    pub fn invalidate_segment(&self, segment: u64) {
        for pool in [&self.internal, &self.leaf].into_iter().flatten() {
            let mut pool = pool.lock();
            let stale: Vec<NodeKey> = pool
                .iter()
                .filter(|((seg, _), _)| *seg == segment)
                .map(|(key, _)| *key)
                .collect();
            for key in stale {
                pool.pop(&key);
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            internal_len: self.internal.as_ref().map_or(0, |p| p.lock().len()),
            leaf_len: self.leaf.as_ref().map_or(0, |p| p.lock().len()),
        }
    }
}
