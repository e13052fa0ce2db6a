//! Write-ahead log for the buffered (not yet flushed) part of a store.
//!
//! Record framing: `record_len(u32) | crc32(u32) | body`, where
//! `record_len` counts the crc and the body, and the body is
//! `seq(u64) | op(u8) | key_len(u32) | key | value_len(u32) | value`.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher as Crc32;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::Path;

use thiserror::Error;

const OP_ADD: u8 = 0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalRecord {
    Add {
        seq: u64,
        key: Vec<u8>,
        value: Vec<u8>,
    },
}

#[derive(Debug, Error)]
pub enum WalError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("corrupt record")]
    Corrupt,
}

/// Simple WAL writer that appends records and optionally fsyncs.
pub struct WalWriter {
    file: File,
    sync: bool,
}

impl WalWriter {
    pub fn create<P: AsRef<Path>>(path: P, sync: bool) -> Result<Self, WalError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(path)?;
        Ok(Self { file, sync })
    }

    /// Reopens an existing log for appending after cutting it back to
    /// `valid_len` bytes, the end of its last complete record as reported by
    /// [`WalReader::valid_len`]. Returns the number of bytes dropped.
    pub fn resume<P: AsRef<Path>>(
        path: P,
        sync: bool,
        valid_len: u64,
    ) -> Result<(Self, u64), WalError> {
        let writer = Self::create(path, sync)?;
        let len = writer.file.metadata()?.len();
        if len <= valid_len {
            return Ok((writer, 0));
        }
        writer.file.set_len(valid_len)?;
        writer.file.sync_all()?;
        Ok((writer, len - valid_len))
    }

    /// Append a record. This writes the full record and (optionally) calls sync_all.
    pub fn append(&mut self, record: &WalRecord) -> Result<(), WalError> {
        let mut buf = Vec::new();
        match record {
            WalRecord::Add { seq, key, value } => {
                buf.write_u64::<LittleEndian>(*seq)?;
                buf.write_u8(OP_ADD)?;
                buf.write_u32::<LittleEndian>(key.len() as u32)?;
                buf.extend_from_slice(key);
                buf.write_u32::<LittleEndian>(value.len() as u32)?;
                buf.extend_from_slice(value);
            }
        }

        let mut hasher = Crc32::new();
        hasher.update(&buf);
        let crc = hasher.finalize();

        // one write per record keeps a torn append confined to the tail
        let mut frame = Vec::with_capacity(buf.len() + 8);
        frame.write_u32::<LittleEndian>(buf.len() as u32 + 4)?;
        frame.write_u32::<LittleEndian>(crc)?;
        frame.extend_from_slice(&buf);
        self.file.write_all(&frame)?;
        self.file.flush()?;

        if self.sync {
            self.file.sync_all()?;
        }
        Ok(())
    }

    /// Forces everything appended so far to stable storage.
    pub fn sync(&mut self) -> Result<(), WalError> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Drops every record written so far.
    pub fn truncate(&mut self) -> Result<(), WalError> {
        self.file.set_len(0)?;
        self.file.sync_all()?;
        Ok(())
    }
}

/// WAL reader that yields valid records in sequence. Stops on EOF.
pub struct WalReader<R: Read> {
    rdr: BufReader<R>,
    valid_len: u64,
}

impl WalReader<File> {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<WalReader<File>, WalError> {
        let f = File::open(path)?;
        Ok(WalReader {
            rdr: BufReader::new(f),
            valid_len: 0,
        })
    }
}

fn eof_as_none<T>(r: io::Result<T>) -> Result<Option<T>, WalError> {
    match r {
        Ok(v) => Ok(Some(v)),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(WalError::Io(e)),
    }
}

impl<R: Read> WalReader<R> {
    pub fn from_reader(reader: R) -> Self {
        WalReader {
            rdr: BufReader::new(reader),
            valid_len: 0,
        }
    }

    /// Bytes up to the end of the last complete record replayed so far.
    /// Anything past it is a torn tail.
    pub fn valid_len(&self) -> u64 {
        self.valid_len
    }

    /// Replays every complete record in order and returns how many were
    /// applied.
    ///
    /// A record cut short by end-of-file is a torn tail from a crash during
    /// append and ends the replay; a checksum mismatch is reported as
    /// [`WalError::Corrupt`].
    pub fn replay<F>(&mut self, mut apply: F) -> Result<u64, WalError>
    where
        F: FnMut(WalRecord),
    {
        let mut applied = 0u64;
        loop {
            let Some(record_len) = eof_as_none(self.rdr.read_u32::<LittleEndian>())? else {
                return Ok(applied);
            };
            if record_len < 4 {
                return Err(WalError::Corrupt);
            }
            let Some(crc) = eof_as_none(self.rdr.read_u32::<LittleEndian>())? else {
                return Ok(applied);
            };
            let mut body = vec![0u8; (record_len - 4) as usize];
            if eof_as_none(self.rdr.read_exact(&mut body))?.is_none() {
                return Ok(applied);
            }

            let mut hasher = Crc32::new();
            hasher.update(&body);
            if hasher.finalize() != crc {
                return Err(WalError::Corrupt);
            }

            apply(parse_body(&body)?);
            applied += 1;
            self.valid_len += 4 + u64::from(record_len);
        }
    }
}

fn parse_body(body: &[u8]) -> Result<WalRecord, WalError> {
    let mut br = body;
    let seq = br.read_u64::<LittleEndian>()?;
    let op = br.read_u8()?;
    if op != OP_ADD {
        return Err(WalError::Corrupt);
    }
    let key_len = br.read_u32::<LittleEndian>()? as usize;
    if key_len > br.len() {
        return Err(WalError::Corrupt);
    }
    let mut key = vec![0u8; key_len];
    br.read_exact(&mut key)?;
    let val_len = br.read_u32::<LittleEndian>()? as usize;
    if val_len != br.len() {
        return Err(WalError::Corrupt);
    }
    Ok(WalRecord::Add {
        seq,
        key,
        value: br.to_vec(),
    })
}
