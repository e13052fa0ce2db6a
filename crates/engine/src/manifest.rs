//! The `MANIFEST` file: the authoritative list of live segments.
//!
//! ```text
//! magic(u32) | version(u16) | kind(u8) | next_seq(u64) | wal_generation(u64)
//! | count(u32) | (level(u32) | seq(u64)) * count | crc32(u32)
//! ```
//!
//! The manifest is replaced atomically (temp file, fsync, rename). Anything
//! in the directory it does not name is garbage from an interrupted flush or
//! compaction.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher as Crc32;
use segment::KeyKind;

use crate::error::{DbError, Result};

pub const MANIFEST_FILE: &str = "MANIFEST";
const MANIFEST_TMP: &str = "MANIFEST.tmp";
const MANIFEST_MAGIC: u32 = 0x5354_524D; // "STRM"
const MANIFEST_VERSION: u16 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub kind: KeyKind,
    /// Sequence number for the next segment file.
    pub next_seq: u64,
    /// Generation of the log that holds the current buffer.
    pub wal_generation: u64,
    /// Live segments as `(level, seq)`.
    pub segments: Vec<(u32, u64)>,
}

impl Manifest {
    pub fn new(kind: KeyKind) -> Self {
        Self {
            kind,
            next_seq: 1,
            wal_generation: 1,
            segments: Vec::new(),
        }
    }

    fn encode(&self) -> std::io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        buf.write_u32::<LittleEndian>(MANIFEST_MAGIC)?;
        buf.write_u16::<LittleEndian>(MANIFEST_VERSION)?;
        buf.write_u8(self.kind as u8)?;
        buf.write_u64::<LittleEndian>(self.next_seq)?;
        buf.write_u64::<LittleEndian>(self.wal_generation)?;
        buf.write_u32::<LittleEndian>(self.segments.len() as u32)?;
        for (level, seq) in &self.segments {
            buf.write_u32::<LittleEndian>(*level)?;
            buf.write_u64::<LittleEndian>(*seq)?;
        }
        let mut hasher = Crc32::new();
        hasher.update(&buf);
        buf.write_u32::<LittleEndian>(hasher.finalize())?;
        Ok(buf)
    }

    fn decode(bytes: &[u8]) -> std::result::Result<Self, String> {
        if bytes.len() < 4 {
            return Err("manifest too small".into());
        }
        let (body, crc) = bytes.split_at(bytes.len() - 4);
        let mut hasher = Crc32::new();
        hasher.update(body);
        if hasher.finalize() != u32::from_le_bytes([crc[0], crc[1], crc[2], crc[3]]) {
            return Err("manifest checksum mismatch".into());
        }

        let mut rd = body;
        let io = |e: std::io::Error| e.to_string();
        let magic = rd.read_u32::<LittleEndian>().map_err(io)?;
        if magic != MANIFEST_MAGIC {
            return Err(format!("invalid manifest magic: {magic:x}"));
        }
        let version = rd.read_u16::<LittleEndian>().map_err(io)?;
        if version != MANIFEST_VERSION {
            return Err(format!("unsupported manifest version {version}"));
        }
        let kind = rd.read_u8().map_err(io)?;
        let kind = KeyKind::from_u8(kind).ok_or_else(|| format!("unknown store kind {kind}"))?;
        let next_seq = rd.read_u64::<LittleEndian>().map_err(io)?;
        let wal_generation = rd.read_u64::<LittleEndian>().map_err(io)?;
        let count = rd.read_u32::<LittleEndian>().map_err(io)? as usize;
        if rd.len() != count * 12 {
            return Err("manifest segment list length mismatch".into());
        }
        let mut segments = Vec::with_capacity(count);
        for _ in 0..count {
            let level = rd.read_u32::<LittleEndian>().map_err(io)?;
            let seq = rd.read_u64::<LittleEndian>().map_err(io)?;
            segments.push((level, seq));
        }

        Ok(Self {
            kind,
            next_seq,
            wal_generation,
            segments,
        })
    }

    /// Reads the manifest of `dir`; `None` for a directory that has never
    /// held a store.
    pub fn load(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join(MANIFEST_FILE);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Self::decode(&bytes)
            .map(Some)
            .map_err(|reason| DbError::OpenFailure { path, reason })
    }

    /// Atomically replaces the manifest of `dir`.
    pub fn store(&self, dir: &Path) -> Result<()> {
        let tmp = dir.join(MANIFEST_TMP);
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(&self.encode()?)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, dir.join(MANIFEST_FILE))?;
        // make the rename itself durable
        File::open(dir)?.sync_all()?;
        Ok(())
    }
}

pub fn segment_file_name(seq: u64, level: u32) -> String {
    format!("{seq:020}-{level:08}.seg")
}

pub fn segment_path(dir: &Path, seq: u64, level: u32) -> PathBuf {
    dir.join(segment_file_name(seq, level))
}

/// Parses `<seq>-<level>.seg` into `(seq, level)`.
pub fn parse_segment_file_name(name: &str) -> Option<(u64, u32)> {
    let stem = name.strip_suffix(".seg")?;
    let (seq, level) = stem.split_once('-')?;
    Some((seq.parse().ok()?, level.parse().ok()?))
}

pub fn wal_file_name(generation: u64) -> String {
    format!("wal-{generation:020}.log")
}

pub fn wal_path(dir: &Path, generation: u64) -> PathBuf {
    dir.join(wal_file_name(generation))
}

pub fn parse_wal_file_name(name: &str) -> Option<u64> {
    name.strip_prefix("wal-")?.strip_suffix(".log")?.parse().ok()
}
