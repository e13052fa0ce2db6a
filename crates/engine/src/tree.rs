use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use buffer::WriteBuffer;
use parking_lot::{Mutex, RwLock};
use segment::{
    BoundingBox, CacheStats, Entry, KeyKind, MinKey, NodeCache, Reducer, Segment, SegmentWriter,
};
use tracing::{debug, info, warn};
use wal::{WalReader, WalRecord, WalWriter};

use crate::config::Config;
use crate::cursor::{Cursor, Merger, Source};
use crate::error::{DbError, Result};
use crate::levels::{cascade_depth, Slot, Version};
use crate::manifest::{parse_segment_file_name, parse_wal_file_name, segment_path, wal_path, Manifest};

/// State owned by the single writer.
struct WriterState {
    wal: Option<WalWriter>,
    wal_generation: u64,
    next_seq: u64,
    last_write_seq: u64,
    closed: bool,
}

/// The ordered persistent tree shared by both store flavours.
///
/// # Write Path
///
/// 1. Take the writer lock and assign the next write sequence number.
/// 2. Append the record to the write-ahead log.
/// 3. Insert it into the buffer.
/// 4. Once the buffer holds `max_buffer_size` entries, flush it into a new
///    level-0 segment and run the level policy.
///
/// # Read Path
///
/// Readers take the buffer lock, then clone the current [`Version`]. The
/// buffer is consulted first, then segments newest to oldest. Publishing a
/// new version swaps the `Arc` and clears the buffer under both locks, so a
/// reader never sees an entry twice or not at all.
///
/// # Recovery
///
/// On open the `MANIFEST` names the live segments and the live log
/// generation. Files it does not name are removed, and the log is replayed
/// into the buffer.
pub(crate) struct Tree {
    dir: PathBuf,
    kind: KeyKind,
    config: Config,
    reducer: Arc<dyn Reducer>,
    cache: Arc<NodeCache>,
    writer: Mutex<WriterState>,
    buffer: RwLock<WriteBuffer>,
    view: RwLock<Arc<Version>>,
}

impl Tree {
    pub(crate) fn open(path: &Path, config: Config, kind: KeyKind) -> Result<Self> {
        config.validate(kind)?;
        prepare_dir(path, &config)?;
        let dir = path.to_path_buf();

        let manifest = match Manifest::load(&dir)? {
            Some(manifest) if manifest.kind != kind => {
                return Err(DbError::OpenFailure {
                    path: dir,
                    reason: format!("directory holds a {:?} store", manifest.kind),
                });
            }
            Some(manifest) => manifest,
            None => {
                let manifest = Manifest::new(kind);
                manifest.store(&dir)?;
                manifest
            }
        };

        let cache = Arc::new(NodeCache::new(
            config.internal_node_cache_size,
            config.leaf_node_cache_size,
        ));
        let mut version = Version::default();
        for &(level, seq) in &manifest.segments {
            let path = segment_path(&dir, seq, level);
            let segment = Segment::open(&path, Arc::clone(&cache))?;
            if segment.kind() != kind {
                return Err(DbError::CorruptSegment {
                    segment: path,
                    reason: format!("holds {:?} keys", segment.kind()),
                });
            }
            version.push(
                level as usize,
                Slot {
                    seq,
                    segment: Arc::new(segment),
                },
            );
        }
        remove_garbage(&dir, &manifest)?;

        let mut buffer = WriteBuffer::new();
        let mut last_write_seq = 0u64;
        let mut valid_len = 0u64;
        let log = wal_path(&dir, manifest.wal_generation);
        if log.exists() {
            let mut stale = 0u64;
            let mut reader = WalReader::open(&log)?;
            let replayed = reader.replay(|record| match record {
                WalRecord::Add { seq, key, value } => {
                    last_write_seq = last_write_seq.max(seq);
                    if !buffer.put(key, value, seq) {
                        stale += 1;
                    }
                }
            })?;
            valid_len = reader.valid_len();
            if stale > 0 {
                warn!(records = stale, "skipped log records with stale sequence numbers");
            }
            if replayed > 0 {
                info!(records = replayed, "write-ahead log replayed");
            }
        }
        let wal = if config.wal_enabled {
            let (wal, dropped) = WalWriter::resume(&log, config.wal_sync, valid_len)?;
            if dropped > 0 {
                warn!(bytes = dropped, "cut torn tail off write-ahead log");
            }
            Some(wal)
        } else {
            None
        };

        let reducer = config
            .reduce
            .clone()
            .unwrap_or_else(|| default_reducer(kind));
        info!(
            path = %dir.display(),
            kind = ?kind,
            segments = version.segment_count(),
            buffered = buffer.len(),
            "store opened"
        );

        let overfull = buffer.len() >= config.max_buffer_size;
        let tree = Self {
            dir,
            kind,
            cache,
            reducer,
            writer: Mutex::new(WriterState {
                wal,
                wal_generation: manifest.wal_generation,
                next_seq: manifest.next_seq,
                last_write_seq,
                closed: false,
            }),
            buffer: RwLock::new(buffer),
            view: RwLock::new(Arc::new(version)),
            config,
        };
        if overfull {
            tree.flush()?;
        }
        Ok(tree)
    }

    pub(crate) fn has_explicit_reducer(&self) -> bool {
        self.config.reduce.is_some()
    }

    pub(crate) fn add(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut w = self.writer.lock();
        w.last_write_seq += 1;
        let seq = w.last_write_seq;
        if let Some(wal) = w.wal.as_mut() {
            wal.append(&WalRecord::Add {
                seq,
                key: key.to_vec(),
                value: value.to_vec(),
            })?;
        }

        let full = {
            let mut buffer = self.buffer.write();
            let accepted = buffer.put(key.to_vec(), value.to_vec(), seq);
            debug_assert!(accepted, "write sequence numbers only grow");
            buffer.len() >= self.config.max_buffer_size
        };
        if full {
            self.flush_locked(&mut w)?;
        }
        Ok(())
    }

    pub(crate) fn flush(&self) -> Result<()> {
        let mut w = self.writer.lock();
        self.flush_locked(&mut w)
    }

    /// Writes the buffer as a new level-0 segment, cascades merges if level
    /// 0 is full, and publishes the result.
    fn flush_locked(&self, w: &mut WriterState) -> Result<()> {
        let mut entries = self.buffer.read().to_entries();
        if entries.is_empty() {
            return Ok(());
        }
        if self.kind == KeyKind::Spatial {
            entries.sort_by_cached_key(|e| self.kind.order_key(&e.key).into_owned());
        }

        let seq = w.next_seq;
        w.next_seq += 1;
        let path = segment_path(&self.dir, seq, 0);
        let mut writer = SegmentWriter::create(
            &path,
            self.config.writer_options(self.kind),
            Arc::clone(&self.reducer),
        )?;
        for e in &entries {
            writer.add(&e.key, &e.value)?;
        }
        let summary = writer.finish()?;
        let segment = Arc::new(Segment::open(&path, Arc::clone(&self.cache))?);
        debug!(
            seq,
            entries = summary.entry_count,
            height = summary.height,
            "buffer flushed"
        );

        let mut version = Version::clone(&self.view.read());
        version.push(0, Slot { seq, segment });

        let mut retired = Vec::new();
        if let Some(last) = cascade_depth(&version.shape(), self.config.max_level_count) {
            let inputs = version.drain_through(last);
            debug!(levels = last + 1, segments = inputs.len(), "cascading merge");
            let slot = self.merge(w, &inputs, last + 1)?;
            version.push(last + 1, slot);
            retired = inputs;
        }

        self.publish(w, version, true, retired)
    }

    /// Merges `inputs` (newest first) into one new segment on `level`.
    fn merge(&self, w: &mut WriterState, inputs: &[Arc<Segment>], level: usize) -> Result<Slot> {
        let seq = w.next_seq;
        w.next_seq += 1;
        let dedup = self.kind.replaces_equal_keys();
        let sources = inputs
            .iter()
            .map(|s| Source::segment(s.cursor_at(0)?, dedup && !s.is_distinct()))
            .collect::<Result<Vec<_>>>()?;
        let mut merger = Merger::new(self.kind, dedup, sources);

        let path = segment_path(&self.dir, seq, level as u32);
        let mut writer = SegmentWriter::create(
            &path,
            self.config.writer_options(self.kind),
            Arc::clone(&self.reducer),
        )?;
        while let Some(e) = merger.next_entry()? {
            writer.add(&e.key, &e.value)?;
        }
        let summary = writer.finish()?;
        debug!(
            seq,
            level,
            inputs = inputs.len(),
            entries = summary.entry_count,
            "segments merged"
        );

        Ok(Slot {
            seq,
            segment: Arc::new(Segment::open(&path, Arc::clone(&self.cache))?),
        })
    }

    /// Makes `version` durable and visible. `drained` means the buffer's
    /// contents are now in `version`: the buffer is cleared and the log
    /// moves to a fresh generation.
    fn publish(
        &self,
        w: &mut WriterState,
        version: Version,
        drained: bool,
        retired: Vec<Arc<Segment>>,
    ) -> Result<()> {
        let old_generation = w.wal_generation;
        let generation = if drained {
            old_generation + 1
        } else {
            old_generation
        };
        let new_wal = if drained && self.config.wal_enabled {
            Some(WalWriter::create(
                wal_path(&self.dir, generation),
                self.config.wal_sync,
            )?)
        } else {
            None
        };

        Manifest {
            kind: self.kind,
            next_seq: w.next_seq,
            wal_generation: generation,
            segments: version.manifest_entries(),
        }
        .store(&self.dir)?;

        {
            let mut buffer = self.buffer.write();
            let mut view = self.view.write();
            *view = Arc::new(version);
            if drained {
                buffer.clear();
            }
        }

        for segment in &retired {
            segment.mark_obsolete();
        }
        if drained {
            w.wal_generation = generation;
            w.wal = new_wal;
            match fs::remove_file(wal_path(&self.dir, old_generation)) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!(generation = old_generation, error = %e, "failed to remove old log"),
            }
        }
        Ok(())
    }

    /// Flushes the buffer and merges every live segment into one.
    pub(crate) fn compact(&self) -> Result<()> {
        let mut w = self.writer.lock();
        self.flush_locked(&mut w)?;

        let mut version = Version::clone(&self.view.read());
        let already_compact = version
            .single()
            .is_some_and(|s| s.is_distinct() || !self.kind.replaces_equal_keys());
        let Some(target) = version.deepest_level() else {
            return Ok(());
        };
        if already_compact {
            return Ok(());
        }

        let started = Instant::now();
        let inputs = version.drain_all();
        let slot = self.merge(&mut w, &inputs, target)?;
        let entries = slot.segment.len();
        version.push(target, slot);
        let merged = inputs.len();
        self.publish(&mut w, version, false, inputs)?;
        info!(
            segments = merged,
            entries,
            level = target,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "compaction finished"
        );
        Ok(())
    }

    /// Flushes or discards the buffer and releases every segment. Later
    /// calls are no-ops.
    pub(crate) fn close(&self) -> Result<()> {
        let mut w = self.writer.lock();
        if w.closed {
            return Ok(());
        }
        w.closed = true;

        if self.config.flush_on_close {
            self.flush_locked(&mut w)?;
        } else {
            let discarded = {
                let mut buffer = self.buffer.write();
                let n = buffer.len();
                buffer.clear();
                n
            };
            if let Some(wal) = w.wal.as_mut() {
                wal.truncate()?;
            }
            if discarded > 0 {
                debug!(entries = discarded, "buffer discarded");
            }
        }
        w.wal = None;
        *self.view.write() = Arc::new(Version::default());
        info!(path = %self.dir.display(), "store closed");
        Ok(())
    }

    // -------------------- reads --------------------

    /// Buffer lookup, then the current version, taken consistently.
    pub(crate) fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let version = {
            let buffer = self.buffer.read();
            if let Some((_, value)) = buffer.get(key) {
                return Ok(Some(value.to_vec()));
            }
            Arc::clone(&self.view.read())
        };
        for segment in version.newest_first() {
            if let Some(value) = segment.get(key)? {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    /// The current version plus the newest buffered value of every key.
    pub(crate) fn latest_snapshot(&self) -> (Arc<Version>, Arc<Vec<Entry>>) {
        let buffer = self.buffer.read();
        let entries = buffer
            .latest()
            .map(|(key, v)| Entry {
                key: key.to_vec(),
                value: v.value.clone(),
            })
            .collect();
        (Arc::clone(&self.view.read()), Arc::new(entries))
    }

    /// The current version plus `scan` applied to the buffer, both taken
    /// under the same buffer lock.
    pub(crate) fn with_buffer<T>(&self, scan: impl FnOnce(&WriteBuffer) -> T) -> (Arc<Version>, T) {
        let buffer = self.buffer.read();
        let found = scan(&buffer);
        (Arc::clone(&self.view.read()), found)
    }

    pub(crate) fn cursor(&self) -> Cursor {
        let (version, snapshot) = self.latest_snapshot();
        Cursor::new(version, snapshot)
    }

    // -------------------- introspection --------------------

    pub(crate) fn approx_len(&self) -> u64 {
        let buffer = self.buffer.read();
        buffer.len() as u64 + self.view.read().entry_count()
    }

    pub(crate) fn buffered(&self) -> usize {
        self.buffer.read().len()
    }

    pub(crate) fn buffered_bytes(&self) -> usize {
        self.buffer.read().approx_size()
    }

    pub(crate) fn segment_count(&self) -> usize {
        self.view.read().segment_count()
    }

    pub(crate) fn level_shape(&self) -> Vec<usize> {
        self.view.read().shape()
    }

    pub(crate) fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub(crate) fn path(&self) -> &Path {
        &self.dir
    }
}

impl Drop for Tree {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(path = %self.dir.display(), error = %e, "close on drop failed");
        }
    }
}

fn default_reducer(kind: KeyKind) -> Arc<dyn Reducer> {
    match kind {
        KeyKind::Scalar => Arc::new(MinKey),
        KeyKind::Spatial => Arc::new(BoundingBox),
    }
}

/// Applies the create / delete / error-if-exists modes to `path`.
fn prepare_dir(path: &Path, config: &Config) -> Result<()> {
    let fail = |reason: String| DbError::OpenFailure {
        path: path.to_path_buf(),
        reason,
    };
    match fs::metadata(path) {
        Ok(meta) => {
            if !meta.is_dir() {
                return Err(fail("path exists and is not a directory".into()));
            }
            if config.error_if_exists {
                return Err(fail("store already exists".into()));
            }
            if config.delete_if_exists {
                fs::remove_dir_all(path).map_err(|e| fail(e.to_string()))?;
                fs::create_dir_all(path).map_err(|e| fail(e.to_string()))?;
            }
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {
            if !config.create_if_missing {
                return Err(fail("store does not exist".into()));
            }
            fs::create_dir_all(path).map_err(|e| fail(e.to_string()))?;
        }
        Err(e) => return Err(fail(e.to_string())),
    }
    Ok(())
}

/// Deletes temp files, unreferenced segments and stale logs left behind by
/// an interrupted flush or compaction.
fn remove_garbage(dir: &Path, manifest: &Manifest) -> Result<()> {
    let live: HashSet<(u64, u32)> = manifest
        .segments
        .iter()
        .map(|&(level, seq)| (seq, level))
        .collect();

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let stale = name.ends_with(".tmp")
            || parse_segment_file_name(name).is_some_and(|id| !live.contains(&id))
            || parse_wal_file_name(name).is_some_and(|g| g != manifest.wal_generation);
        if !stale {
            continue;
        }
        match fs::remove_file(entry.path()) {
            Ok(()) => warn!(file = name, "removed orphaned file"),
            Err(e) => warn!(file = name, error = %e, "failed to remove orphaned file"),
        }
    }
    Ok(())
}
