use std::fmt;
use std::sync::Arc;

use segment::{KeyKind, Reducer, WriterOptions};

use crate::error::{DbError, Result};

/// Options for opening a store.
///
/// All fields are public; the chained setters exist for builder-style
/// construction:
///
/// ```rust
/// use engine::Config;
///
/// let config = Config::default()
///     .max_buffer_size(1024)
///     .max_node_entries(32)
///     .enable_compression(false);
/// assert_eq!(config.max_buffer_size, 1024);
/// ```
#[derive(Clone)]
pub struct Config {
    /// Create the directory when it does not exist.
    pub create_if_missing: bool,
    /// Wipe an existing directory on open.
    pub delete_if_exists: bool,
    /// Fail when the directory already exists.
    pub error_if_exists: bool,
    /// Buffered entries before an automatic flush.
    pub max_buffer_size: usize,
    /// Segments a level may hold before it is merged into the next.
    pub max_level_count: usize,
    /// Entries per leaf and children per internal node.
    pub max_node_entries: usize,
    /// Bytes preallocated for every new segment file.
    pub initial_segment_size: u64,
    /// Internal nodes kept decoded in memory; 0 disables the cache.
    pub internal_node_cache_size: usize,
    /// Leaf nodes kept decoded in memory; 0 disables the cache.
    pub leaf_node_cache_size: usize,
    pub enable_compression: bool,
    pub enable_prefix_encoding: bool,
    /// Summary function for the aggregate keys of a scalar store.
    pub reduce: Option<Arc<dyn Reducer>>,
    /// Log buffered writes so they survive a crash.
    pub wal_enabled: bool,
    /// fsync after every log append.
    pub wal_sync: bool,
    /// Flush the buffer on close; when false it is discarded.
    pub flush_on_close: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            delete_if_exists: false,
            error_if_exists: false,
            max_buffer_size: 1 << 16,
            max_level_count: 10,
            max_node_entries: 16,
            initial_segment_size: 1 << 23,
            internal_node_cache_size: 64,
            leaf_node_cache_size: 8,
            enable_compression: true,
            enable_prefix_encoding: true,
            reduce: None,
            wal_enabled: true,
            wal_sync: false,
            flush_on_close: true,
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("create_if_missing", &self.create_if_missing)
            .field("delete_if_exists", &self.delete_if_exists)
            .field("error_if_exists", &self.error_if_exists)
            .field("max_buffer_size", &self.max_buffer_size)
            .field("max_level_count", &self.max_level_count)
            .field("max_node_entries", &self.max_node_entries)
            .field("initial_segment_size", &self.initial_segment_size)
            .field("internal_node_cache_size", &self.internal_node_cache_size)
            .field("leaf_node_cache_size", &self.leaf_node_cache_size)
            .field("enable_compression", &self.enable_compression)
            .field("enable_prefix_encoding", &self.enable_prefix_encoding)
            .field("reduce", &self.reduce.as_ref().map(|_| "<custom>"))
            .field("wal_enabled", &self.wal_enabled)
            .field("wal_sync", &self.wal_sync)
            .field("flush_on_close", &self.flush_on_close)
            .finish()
    }
}

impl Config {
    pub fn create_if_missing(mut self, yes: bool) -> Self {
        self.create_if_missing = yes;
        self
    }

    pub fn delete_if_exists(mut self, yes: bool) -> Self {
        self.delete_if_exists = yes;
        self
    }

    pub fn error_if_exists(mut self, yes: bool) -> Self {
        self.error_if_exists = yes;
        self
    }

    pub fn max_buffer_size(mut self, entries: usize) -> Self {
        self.max_buffer_size = entries;
        self
    }

    pub fn max_level_count(mut self, segments: usize) -> Self {
        self.max_level_count = segments;
        self
    }

    pub fn max_node_entries(mut self, entries: usize) -> Self {
        self.max_node_entries = entries;
        self
    }

    /// Same as [`Config::max_node_entries`].
    pub fn max_node_children(self, children: usize) -> Self {
        self.max_node_entries(children)
    }

    pub fn initial_segment_size(mut self, bytes: u64) -> Self {
        self.initial_segment_size = bytes;
        self
    }

    /// Same as [`Config::initial_segment_size`].
    pub fn initial_pbt_size(self, bytes: u64) -> Self {
        self.initial_segment_size(bytes)
    }

    pub fn internal_node_cache_size(mut self, nodes: usize) -> Self {
        self.internal_node_cache_size = nodes;
        self
    }

    pub fn leaf_node_cache_size(mut self, nodes: usize) -> Self {
        self.leaf_node_cache_size = nodes;
        self
    }

    pub fn enable_compression(mut self, yes: bool) -> Self {
        self.enable_compression = yes;
        self
    }

    pub fn enable_prefix_encoding(mut self, yes: bool) -> Self {
        self.enable_prefix_encoding = yes;
        self
    }

    pub fn reduce<R: Reducer + 'static>(mut self, reducer: R) -> Self {
        self.reduce = Some(Arc::new(reducer));
        self
    }

    pub fn wal_enabled(mut self, yes: bool) -> Self {
        self.wal_enabled = yes;
        self
    }

    pub fn wal_sync(mut self, yes: bool) -> Self {
        self.wal_sync = yes;
        self
    }

    pub fn flush_on_close(mut self, yes: bool) -> Self {
        self.flush_on_close = yes;
        self
    }

    /// Rejects option combinations no store can honour.
    pub fn validate(&self, kind: KeyKind) -> Result<()> {
        if self.error_if_exists && self.delete_if_exists {
            return Err(conflict("error_if_exists and delete_if_exists are mutually exclusive"));
        }
        if self.max_node_entries < 2 || self.max_node_entries > usize::from(u16::MAX) {
            return Err(conflict(format!(
                "max_node_entries must be within 2..={}, got {}",
                u16::MAX,
                self.max_node_entries
            )));
        }
        if self.max_level_count < 2 {
            return Err(conflict(format!(
                "max_level_count must be at least 2, got {}",
                self.max_level_count
            )));
        }
        if self.max_buffer_size == 0 {
            return Err(conflict("max_buffer_size must be positive"));
        }
        if kind == KeyKind::Spatial && self.reduce.is_some() {
            return Err(conflict("a spatial store always reduces to bounding boxes"));
        }
        Ok(())
    }

    pub(crate) fn writer_options(&self, kind: KeyKind) -> WriterOptions {
        WriterOptions {
            kind,
            max_node_entries: self.max_node_entries,
            compression: self.enable_compression,
            prefix_encoding: self.enable_prefix_encoding,
            initial_size: self.initial_segment_size,
        }
    }
}

fn conflict(reason: impl Into<String>) -> DbError {
    DbError::ConfigConflict(reason.into())
}
