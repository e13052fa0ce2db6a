//! Segment binary format: node frames and the footer.
//!
//! Every node is stored as a frame:
//!
//! ```text
//! [flags: u8][stored_len: u32 LE][crc32: u32 LE][stored bytes]
//! ```
//!
//! `flags & FRAME_LZ4` marks an LZ4 block (uncompressed size prepended); the
//! checksum covers the stored bytes. The footer is always the **last
//! [`FOOTER_BYTES`] bytes** of a segment file:
//!
//! ```text
//! [root_offset: u64][root_len: u32][height: u16][entry_count: u64]
//! [leaf_end: u64][kind: u8][flags: u8][version: u16][crc32: u32][magic: u32]
//! ```

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher as Crc32;
use std::io::{Read, Result as IoResult, Seek, SeekFrom, Write};
use thiserror::Error;

use crate::KeyKind;

/// Magic number identifying segment files (ASCII "SEG1").
pub const SEGMENT_MAGIC: u32 = 0x5345_4731;

/// On-disk format version written into every footer.
pub const FORMAT_VERSION: u16 = 1;

/// Size of the footer in bytes.
pub const FOOTER_BYTES: u64 = 8 + 4 + 2 + 8 + 8 + 1 + 1 + 2 + 4 + 4;

/// Size of a node frame header: flags + stored length + checksum.
pub const FRAME_HEADER_BYTES: usize = 1 + 4 + 4;

pub const FRAME_LZ4: u8 = 0b0000_0001;

pub const FOOTER_DISTINCT: u8 = 0b0000_0001;
pub const FOOTER_COMPRESSED: u8 = 0b0000_0010;
pub const FOOTER_PREFIX_ENCODED: u8 = 0b0000_0100;

/// Malformed bytes found while decoding a frame, node or footer.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct DecodeError(pub String);

impl DecodeError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// Returns the byte offset where the footer starts.
///
/// Uses [`u64::saturating_sub`] so files smaller than the footer return 0
/// rather than underflowing.
pub fn footer_pos(filesize: u64) -> u64 {
    filesize.saturating_sub(FOOTER_BYTES)
}

/// Wraps a node payload into a checksummed, optionally compressed frame.
pub fn encode_frame(payload: &[u8], compress: bool) -> Vec<u8> {
    let (flags, stored) = if compress {
        (FRAME_LZ4, lz4_flex::compress_prepend_size(payload))
    } else {
        (0, payload.to_vec())
    };

    let mut hasher = Crc32::new();
    hasher.update(&stored);

    let mut frame = Vec::with_capacity(FRAME_HEADER_BYTES + stored.len());
    frame.push(flags);
    frame.extend_from_slice(&(stored.len() as u32).to_le_bytes());
    frame.extend_from_slice(&hasher.finalize().to_le_bytes());
    frame.extend_from_slice(&stored);
    frame
}

/// Parses a frame header, returning `(flags, stored_len, crc)`.
pub fn read_frame_header(mut header: &[u8]) -> Result<(u8, u32, u32), DecodeError> {
    if header.len() < FRAME_HEADER_BYTES {
        return Err(DecodeError::new("truncated frame header"));
    }
    let flags = header.read_u8().map_err(|e| DecodeError::new(e.to_string()))?;
    let stored_len = header
        .read_u32::<LittleEndian>()
        .map_err(|e| DecodeError::new(e.to_string()))?;
    let crc = header
        .read_u32::<LittleEndian>()
        .map_err(|e| DecodeError::new(e.to_string()))?;
    Ok((flags, stored_len, crc))
}

/// Verifies and unwraps a complete frame, returning the node payload.
pub fn decode_frame(frame: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let (flags, stored_len, crc) = read_frame_header(frame)?;
    let stored = &frame[FRAME_HEADER_BYTES..];
    if stored.len() != stored_len as usize {
        return Err(DecodeError::new(format!(
            "frame length mismatch: header says {stored_len}, found {}",
            stored.len()
        )));
    }

    let mut hasher = Crc32::new();
    hasher.update(stored);
    if hasher.finalize() != crc {
        return Err(DecodeError::new("node checksum mismatch"));
    }

    if flags & FRAME_LZ4 != 0 {
        lz4_flex::decompress_size_prepended(stored)
            .map_err(|e| DecodeError::new(format!("lz4 decompression failed: {e}")))
    } else {
        Ok(stored.to_vec())
    }
}

/// Trailing metadata of a segment file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Footer {
    pub root_offset: u64,
    pub root_len: u32,
    /// Number of node levels; 1 means the root is a leaf, 0 an empty segment.
    pub height: u16,
    pub entry_count: u64,
    /// End of the contiguous leaf run that starts at offset 0.
    pub leaf_end: u64,
    pub kind: KeyKind,
    pub flags: u8,
}

impl Footer {
    pub fn is_distinct(&self) -> bool {
        self.flags & FOOTER_DISTINCT != 0
    }

    fn body(&self) -> IoResult<Vec<u8>> {
        let mut buf = Vec::with_capacity(FOOTER_BYTES as usize);
        buf.write_u64::<LittleEndian>(self.root_offset)?;
        buf.write_u32::<LittleEndian>(self.root_len)?;
        buf.write_u16::<LittleEndian>(self.height)?;
        buf.write_u64::<LittleEndian>(self.entry_count)?;
        buf.write_u64::<LittleEndian>(self.leaf_end)?;
        buf.write_u8(self.kind as u8)?;
        buf.write_u8(self.flags)?;
        buf.write_u16::<LittleEndian>(FORMAT_VERSION)?;
        Ok(buf)
    }
}

/// Writes the segment footer to `w`.
pub fn write_footer<W: Write>(w: &mut W, footer: &Footer) -> IoResult<()> {
    let body = footer.body()?;
    let mut hasher = Crc32::new();
    hasher.update(&body);
    w.write_all(&body)?;
    w.write_u32::<LittleEndian>(hasher.finalize())?;
    w.write_u32::<LittleEndian>(SEGMENT_MAGIC)?;
    Ok(())
}

/// Reads and validates the footer from `r`.
///
/// The reader is seeked to the end to determine file size, then to the
/// footer position. Returns the footer and the file size.
pub fn read_footer<R: Read + Seek>(r: &mut R) -> IoResult<Result<(Footer, u64), DecodeError>> {
    let filesize = r.seek(SeekFrom::End(0))?;
    if filesize < FOOTER_BYTES {
        return Ok(Err(DecodeError::new("segment file too small")));
    }
    r.seek(SeekFrom::Start(footer_pos(filesize)))?;
    let mut raw = vec![0u8; FOOTER_BYTES as usize];
    r.read_exact(&mut raw)?;
    Ok(parse_footer(&raw).map(|f| (f, filesize)))
}

fn parse_footer(raw: &[u8]) -> Result<Footer, DecodeError> {
    let io = |e: std::io::Error| DecodeError::new(e.to_string());
    let body_len = FOOTER_BYTES as usize - 8;
    let mut rd = raw;
    let root_offset = rd.read_u64::<LittleEndian>().map_err(io)?;
    let root_len = rd.read_u32::<LittleEndian>().map_err(io)?;
    let height = rd.read_u16::<LittleEndian>().map_err(io)?;
    let entry_count = rd.read_u64::<LittleEndian>().map_err(io)?;
    let leaf_end = rd.read_u64::<LittleEndian>().map_err(io)?;
    let kind = rd.read_u8().map_err(io)?;
    let flags = rd.read_u8().map_err(io)?;
    let version = rd.read_u16::<LittleEndian>().map_err(io)?;
    let crc = rd.read_u32::<LittleEndian>().map_err(io)?;
    let magic = rd.read_u32::<LittleEndian>().map_err(io)?;

    if magic != SEGMENT_MAGIC {
        return Err(DecodeError::new(format!("invalid segment magic: {magic:x}")));
    }
    let mut hasher = Crc32::new();
    hasher.update(&raw[..body_len]);
    if hasher.finalize() != crc {
        return Err(DecodeError::new("footer checksum mismatch"));
    }
    if version != FORMAT_VERSION {
        return Err(DecodeError::new(format!("unsupported format version {version}")));
    }
    let kind = KeyKind::from_u8(kind)
        .ok_or_else(|| DecodeError::new(format!("unknown key kind {kind}")))?;

    Ok(Footer {
        root_offset,
        root_len,
        height,
        entry_count,
        leaf_end,
        kind,
        flags,
    })
}
